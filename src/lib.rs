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

//! rtcp-bbr is a sender-side congestion control engine for reliable
//! byte-stream transports. It combines the BBRv1 model-based congestion
//! control algorithm with a token-bucket rate-limit detector that caps the
//! pacing rate once a policed link has been identified, improving throughput
//! stability over rate-limiting middleboxes common on cellular paths.
//!
//! The engine is driven by the transport: for every delivery notification
//! ("rate sample") the transport calls into the per-connection controller,
//! which updates its path model (bottleneck bandwidth filter, min-RTT filter,
//! pacing-gain cycle, long-term policed-bandwidth estimator, ACK-aggregation
//! compensator), runs the bucket/rate estimator, and produces a pacing rate
//! and congestion window.
//!
//! Deliberately outside this crate: segmentation, retransmission, RTT
//! measurement, loss accounting, ACK parsing, and the pacing scheduler that
//! times packet departures. The engine only consumes rate samples and
//! connection scalars, and emits control outputs.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub use crate::congestion_control::build_congestion_controller;
pub use crate::congestion_control::Bbr;
pub use crate::congestion_control::CaState;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionEvent;
pub use crate::congestion_control::ConnectionState;
pub use crate::congestion_control::ControllerInfo;
pub use crate::congestion_control::RateSample;
pub use crate::error::Error;

/// A specialized [`Result`] type for congestion control operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The default initial RTT used before any RTT sample is available.
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Default maximum segment size in bytes. MSS is treated as a stable scalar
/// for the lifetime of a connection.
pub const DEFAULT_MSS: u64 = 1460;

/// Per-connection configuration for the congestion control engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// The minimal congestion window in packets.
    pub(crate) min_congestion_window: u64,

    /// The initial congestion window in packets.
    pub(crate) initial_congestion_window: u64,

    /// The initial smoothed RTT, used to seed the pacing rate before any RTT
    /// sample has been observed.
    pub(crate) initial_rtt: Option<Duration>,

    /// Max datagram size in bytes.
    pub(crate) max_datagram_size: u64,

    /// Upper bound on the pacing rate handed to the transport, in bytes per
    /// second.
    pub(crate) max_pacing_rate: u64,

    /// Whether to run the token-bucket rate-limit detector alongside BBR.
    /// When disabled the controller behaves as plain BBR.
    pub(crate) enable_rate_limit_detection: bool,

    /// Process-wide tunables shared by all connections.
    pub(crate) tunables: Arc<Tunables>,
}

impl Config {
    pub fn new() -> Result<Self> {
        Ok(Config::default())
    }

    /// Set the minimal congestion window in packets.
    pub fn set_min_congestion_window(&mut self, packets: u64) {
        self.min_congestion_window = packets.max(1);
    }

    /// Set the initial congestion window in packets.
    pub fn set_initial_congestion_window(&mut self, packets: u64) {
        self.initial_congestion_window = packets.max(1);
    }

    /// Set the initial RTT estimate.
    pub fn set_initial_rtt(&mut self, rtt: Option<Duration>) {
        self.initial_rtt = rtt;
    }

    /// Set the maximum datagram size in bytes.
    pub fn set_max_datagram_size(&mut self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidConfig("zero datagram size".into()));
        }
        self.max_datagram_size = size;
        Ok(())
    }

    /// Set the upper bound on the pacing rate, in bytes per second.
    pub fn set_max_pacing_rate(&mut self, rate: u64) {
        self.max_pacing_rate = rate;
    }

    /// Enable or disable the token-bucket rate-limit detector.
    pub fn enable_rate_limit_detection(&mut self, v: bool) {
        self.enable_rate_limit_detection = v;
    }

    /// Use the given shared tunables instead of a fresh default set.
    pub fn set_tunables(&mut self, tunables: Arc<Tunables>) {
        self.tunables = tunables;
    }

    /// The shared tunables used by connections built from this config.
    pub fn tunables(&self) -> Arc<Tunables> {
        self.tunables.clone()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_congestion_window: 4,
            initial_congestion_window: 10,
            initial_rtt: Some(INITIAL_RTT),
            max_datagram_size: DEFAULT_MSS,
            max_pacing_rate: u64::MAX,
            enable_rate_limit_detection: true,
            tunables: Arc::new(Tunables::default()),
        }
    }
}

/// Process-wide tunables for the rate-limit detector and its cap/probe
/// controller.
///
/// Each field is a word-sized scalar that the operator may change at any
/// time; the control loop reads them with relaxed ordering and without locks,
/// so a change takes effect no later than the next rate sample.
#[derive(Debug)]
pub struct Tunables {
    /// Rounds between upward probes while the rate cap is active.
    probe_interval: AtomicU32,

    /// Probe gain parameter; the effective probe gain is
    /// `probe_per * 5 - 100` percent above the capped rate.
    probe_per: AtomicU32,

    /// Master enable for the cap & probe controller.
    optimize: AtomicBool,

    /// Reserved reason code for disclassification on strong loss.
    high_loss_disclassify: AtomicU32,

    /// Rounds to confirm that a probe found no new capacity.
    monitor_period: AtomicU32,

    /// Use the cumulatively acked byte sequence (divided by MSS) instead of
    /// the delivered counter as the detector's delivery metric.
    use_goodput: AtomicBool,

    /// Reset the detector when leaving RTO recovery.
    exclude_rto: AtomicBool,

    /// Reset the detector while the connection is receive-window limited.
    exclude_rwnd: AtomicBool,

    /// Reset the detector on application-limited samples.
    exclude_app_limited: AtomicBool,

    /// Emit per-sample diagnostic log lines.
    enable_log: AtomicBool,
}

macro_rules! tunable_u32 {
    ($get:ident, $set:ident) => {
        pub fn $get(&self) -> u32 {
            self.$get.load(Ordering::Relaxed)
        }

        pub fn $set(&self, v: u32) {
            self.$get.store(v, Ordering::Relaxed);
        }
    };
}

macro_rules! tunable_bool {
    ($get:ident, $set:ident) => {
        pub fn $get(&self) -> bool {
            self.$get.load(Ordering::Relaxed)
        }

        pub fn $set(&self, v: bool) {
            self.$get.store(v, Ordering::Relaxed);
        }
    };
}

impl Tunables {
    tunable_u32!(probe_interval, set_probe_interval);
    tunable_u32!(probe_per, set_probe_per);
    tunable_bool!(optimize, set_optimize);
    tunable_u32!(high_loss_disclassify, set_high_loss_disclassify);
    tunable_u32!(monitor_period, set_monitor_period);
    tunable_bool!(use_goodput, set_use_goodput);
    tunable_bool!(exclude_rto, set_exclude_rto);
    tunable_bool!(exclude_rwnd, set_exclude_rwnd);
    tunable_bool!(exclude_app_limited, set_exclude_app_limited);
    tunable_bool!(enable_log, set_enable_log);
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            probe_interval: AtomicU32::new(20),
            probe_per: AtomicU32::new(24),
            optimize: AtomicBool::new(true),
            high_loss_disclassify: AtomicU32::new(2),
            monitor_period: AtomicU32::new(3),
            use_goodput: AtomicBool::new(true),
            exclude_rto: AtomicBool::new(false),
            exclude_rwnd: AtomicBool::new(false),
            exclude_app_limited: AtomicBool::new(false),
            enable_log: AtomicBool::new(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_setters() -> Result<()> {
        let mut config = Config::new()?;
        assert_eq!(config.min_congestion_window, 4);
        assert_eq!(config.initial_congestion_window, 10);
        assert_eq!(config.max_datagram_size, DEFAULT_MSS);

        config.set_min_congestion_window(2);
        assert_eq!(config.min_congestion_window, 2);

        config.set_initial_congestion_window(0);
        assert_eq!(config.initial_congestion_window, 1);

        config.set_initial_rtt(None);
        assert_eq!(config.initial_rtt, None);

        assert!(config.set_max_datagram_size(0).is_err());
        config.set_max_datagram_size(1200)?;
        assert_eq!(config.max_datagram_size, 1200);

        config.set_max_pacing_rate(1_000_000);
        assert_eq!(config.max_pacing_rate, 1_000_000);

        config.enable_rate_limit_detection(false);
        assert_eq!(config.enable_rate_limit_detection, false);
        Ok(())
    }

    #[test]
    fn tunables_defaults() {
        let t = Tunables::default();
        assert_eq!(t.probe_interval(), 20);
        assert_eq!(t.probe_per(), 24);
        assert_eq!(t.optimize(), true);
        assert_eq!(t.high_loss_disclassify(), 2);
        assert_eq!(t.monitor_period(), 3);
        assert_eq!(t.use_goodput(), true);
        assert_eq!(t.exclude_rto(), false);
        assert_eq!(t.exclude_rwnd(), false);
        assert_eq!(t.exclude_app_limited(), false);
        assert_eq!(t.enable_log(), true);

        t.set_probe_interval(40);
        t.set_use_goodput(false);
        assert_eq!(t.probe_interval(), 40);
        assert_eq!(t.use_goodput(), false);
    }

    #[test]
    fn config_shared_tunables() -> Result<()> {
        let mut config = Config::new()?;
        let shared = Arc::new(Tunables::default());
        config.set_tunables(shared.clone());

        shared.set_monitor_period(5);
        assert_eq!(config.tunables().monitor_period(), 5);
        Ok(())
    }
}

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
