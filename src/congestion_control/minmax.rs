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

//! A windowed min/max estimator, based on an algorithm by Kathleen Nichols.
//! Refer to <https://groups.google.com/g/bbr-dev/c/3RTgkzi5ZD8>.
//!
//! The estimator tracks the extremum of a data stream over a bounded
//! horizon, measured here in packet-timed rounds, in constant space and
//! constant time per update. It keeps the best, 2nd best and 3rd best
//! samples, maintaining the invariant that the n'th best was measured no
//! earlier than the (n-1)'th best, with the three kept widely separated
//! across the window so the worst-case error stays bounded even when the
//! stream is monotonic over the whole window.
//!
//! A new overall extremum makes everything older worthless, so the filter
//! restarts fresh from it; the same property holds for the 2nd and 3rd
//! choices.

#[derive(Debug, Copy, Clone, Default)]
pub struct MinMaxSample {
    /// Round trip count at which the sample was taken.
    time: u64,

    /// Sample value.
    value: u64,
}

/// Windowed extremum filter over a bounded horizon of rounds.
#[derive(Debug)]
pub struct MinMax {
    /// Horizon, in rounds, beyond which a sample expires.
    window: u64,

    /// The best, second best, third best samples.
    samples: [MinMaxSample; 3],
}

impl MinMax {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            samples: [Default::default(); 3],
        }
    }

    /// Set window size.
    pub fn set_window(&mut self, window: u64) {
        self.window = window;
    }

    /// Reset all choices to the given sample.
    pub fn reset(&mut self, time: u64, value: u64) {
        self.samples.fill(MinMaxSample { time, value })
    }

    /// As time advances, re-balance the 1st, 2nd and 3rd choices.
    fn subwin_update(&mut self, sample: MinMaxSample) {
        let dt = sample.time.saturating_sub(self.samples[0].time);
        if dt > self.window {
            // The best sample fell out of the window entirely: promote the
            // 2nd choice and adopt the new sample as 3rd. The promoted
            // choice may itself be outside the window, so check once more.
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if sample.time.saturating_sub(self.samples[0].time) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
                self.samples[2] = sample;
            }
        } else if self.samples[1].time == self.samples[0].time && dt > self.window / 4_u64 {
            // A quarter of the window passed without a 2nd choice, so take
            // one from the 2nd quarter.
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2].time == self.samples[1].time && dt > self.window / 2_u64 {
            // Half the window passed without a 3rd choice, so take one from
            // the last half.
            self.samples[2] = sample;
        }
    }

    /// Incorporate a new measurement into the windowed maximum.
    pub fn update_max(&mut self, time: u64, value: u64) {
        if time < self.samples[2].time {
            // Time must be monotonically non-decreasing.
            return;
        }

        let sample = MinMaxSample { time, value };

        if self.samples[0].value == 0  // uninitialized
            || sample.value >= self.samples[0].value // found new max?
            || sample.time.saturating_sub(self.samples[2].time) > self.window
        // nothing left in window?
        {
            self.reset(time, value);
            return;
        }

        if sample.value >= self.samples[1].value {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if sample.value >= self.samples[2].value {
            self.samples[2] = sample;
        }

        self.subwin_update(sample);
    }

    /// Incorporate a new measurement into the windowed minimum.
    pub fn update_min(&mut self, time: u64, value: u64) {
        if time < self.samples[2].time {
            // Time must be monotonically non-decreasing.
            return;
        }

        let sample = MinMaxSample { time, value };

        if self.samples[0].value == 0  // uninitialized
            || sample.value <= self.samples[0].value // found new min?
            || sample.time.saturating_sub(self.samples[2].time) > self.window
        // nothing left in window?
        {
            self.reset(time, value);
            return;
        }

        if sample.value <= self.samples[1].value {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if sample.value <= self.samples[2].value {
            self.samples[2] = sample;
        }

        self.subwin_update(sample);
    }

    /// The current windowed extremum.
    pub fn get(&self) -> u64 {
        self.samples[0].value
    }
}

impl Default for MinMax {
    fn default() -> Self {
        // The bandwidth filter horizon is 10 packet-timed rounds.
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tracks_plateau_and_decay() {
        let mut filter = MinMax::default();

        // A bandwidth ramp keeps resetting the filter to the latest max.
        for round in 0..5u64 {
            filter.update_max(round, 1000 + round * 100);
            assert_eq!(filter.get(), 1000 + round * 100);
        }

        // Lower samples inside the window do not displace the max.
        filter.update_max(6, 900);
        filter.update_max(8, 800);
        assert_eq!(filter.get(), 1400);

        // Once the max ages out of the 10-round window, the best of the
        // remembered subwindow choices takes over.
        filter.update_max(15, 700);
        assert_eq!(filter.get(), 800);
        filter.update_max(26, 100);
        assert_eq!(filter.get(), 100);
    }

    #[test]
    fn max_ignores_time_reversal() {
        let mut filter = MinMax::default();

        filter.update_max(10, 500);
        filter.update_max(12, 400);
        // An older timestamp than the 3rd choice is discarded outright.
        filter.update_max(5, 5000);
        assert_eq!(filter.get(), 500);
    }

    #[test]
    fn min_tracks_window() {
        let mut filter = MinMax::new(10);

        filter.update_min(1, 300);
        assert_eq!(filter.get(), 300);

        // A new overall minimum restarts the filter.
        filter.update_min(2, 250);
        assert_eq!(filter.get(), 250);

        // Larger samples are retained only as later choices.
        filter.update_min(5, 280);
        filter.update_min(8, 260);
        assert_eq!(filter.get(), 250);

        // Expiry promotes the 2nd choice.
        filter.update_min(13, 290);
        assert_eq!(filter.get(), 260);
    }

    #[test]
    fn reset_and_window() {
        let mut filter = MinMax::new(4);
        filter.set_window(8);

        filter.update_max(1, 100);
        filter.reset(2, 70);
        assert_eq!(filter.get(), 70);
    }
}
