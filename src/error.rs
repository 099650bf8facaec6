// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for congestion control operations.

use strum_macros::EnumIter;

/// An error on the congestion control configuration surface.
///
/// The control loop itself never surfaces errors to the transport; invalid
/// samples are skipped and missing history is replaced by conservative
/// defaults. Errors are only produced when building or reconfiguring a
/// controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// No error occurred.
    #[default]
    NoError,

    /// The controller encountered an internal inconsistency. The connection
    /// is still usable; the controller falls back to a sane default state.
    InternalError,

    /// The provided configuration is invalid.
    InvalidConfig(String),
}

impl Error {
    /// A stable numeric code for each error kind, for FFI and logging.
    pub fn to_code(&self) -> u64 {
        match self {
            Error::NoError => 0,
            Error::InternalError => 1,
            Error::InvalidConfig(_) => 2,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn error_code() {
        let mut codes = Vec::new();
        for e in Error::iter() {
            assert_eq!(format!("{}", e), format!("{:?}", e));
            codes.push(e.to_code());
        }

        // Codes are unique and stable.
        let mut dedup = codes.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(codes.len(), dedup.len());
    }
}
