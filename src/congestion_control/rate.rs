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

//! Fixed-point rate and gain arithmetic.
//!
//! Bandwidth is carried in packets per microsecond, left-shifted by
//! [`BW_SCALE`] bits to avoid truncation: the rate unit is roughly
//! `1500 bytes / 1 usec / 2^24 ~= 715 bps`, which covers everything from a
//! few hundred bps up to multiple Tbps in a u64. Gains are fractions scaled
//! by [`BBR_SCALE`] bits. All conversions keep the operation order chosen so
//! that a u64 accumulator does not overflow for rates up to a few Tbit/s.

/// Scale factor (bits) for bandwidth values in packets per microsecond.
pub const BW_SCALE: u32 = 24;

/// One bandwidth unit, `1 << BW_SCALE`.
pub const BW_UNIT: u64 = 1 << BW_SCALE;

/// Scale factor (bits) for fractional gains.
pub const BBR_SCALE: u32 = 8;

/// One gain unit, `1 << BBR_SCALE`.
pub const BBR_UNIT: u64 = 1 << BBR_SCALE;

/// Scale factor (bits) for the detector's fractional thresholds.
pub const BASED_SCALE: u32 = 8;

/// One detector threshold unit, `1 << BASED_SCALE`.
pub const BASED_UNIT: u64 = 1 << BASED_SCALE;

pub const USEC_PER_SEC: u64 = 1_000_000;
pub const USEC_PER_MSEC: u64 = 1_000;

/// Pace at ~1% below the estimated bandwidth, on average, to reduce the
/// queue at the bottleneck while maintaining high utilization.
const PACING_MARGIN_PERCENT: u64 = 1;

/// Right shift applied to the pacing rate when budgeting a transmit burst.
const PACING_SHIFT: u32 = 10;

/// Ceiling on the bytes of a single aggregated transmit burst.
const GSO_MAX_SIZE: u64 = 65536;

/// Headroom reserved for protocol headers when sizing a burst.
const MAX_HEADER_LEN: u64 = 320;

/// Skip burst aggregation below this pacing rate (bits per second).
const MIN_TSO_RATE_BPS: u64 = 1_200_000;

/// Cap on the segments of a single aggregated transmit burst.
const MAX_TSO_SEGS: u64 = 0x7F;

/// Convert a scaled bandwidth to bytes per second, applying a gain and the
/// pacing margin.
pub fn rate_bytes_per_sec(rate: u64, mss: u64, gain: u64) -> u64 {
    let mut rate = rate;
    rate = rate.saturating_mul(mss);
    rate = rate.saturating_mul(gain);
    rate >>= BBR_SCALE;
    rate = rate.saturating_mul(USEC_PER_SEC / 100 * (100 - PACING_MARGIN_PERCENT));
    rate >> BW_SCALE
}

/// Convert a scaled bandwidth and gain factor to a pacing rate in bytes per
/// second, bounded by the configured ceiling.
pub fn bw_to_pacing_rate(bw: u64, mss: u64, gain: u64, max_pacing_rate: u64) -> u64 {
    rate_bytes_per_sec(bw, mss, gain).min(max_pacing_rate)
}

/// BDP in packets for the given scaled bandwidth, RTT and gain, rounded up
/// to avoid a negative feedback loop.
pub fn bdp(bw: u64, min_rtt_us: u64, gain: u64) -> u64 {
    let w = bw.saturating_mul(min_rtt_us);
    ((w.saturating_mul(gain) >> BBR_SCALE) + BW_UNIT - 1) / BW_UNIT
}

/// Minimum burst split: one segment at low rates, two otherwise.
pub fn min_tso_segs(pacing_rate: u64) -> u64 {
    if pacing_rate < MIN_TSO_RATE_BPS >> 3 {
        1
    } else {
        2
    }
}

/// Segments to aggregate per transmit burst, budgeted from the pacing rate.
pub fn tso_segs_goal(pacing_rate: u64, mss: u64) -> u64 {
    let bytes = (pacing_rate >> PACING_SHIFT).min(GSO_MAX_SIZE - 1 - MAX_HEADER_LEN);
    (bytes / mss.max(1)).max(min_tso_segs(pacing_rate)).min(MAX_TSO_SEGS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_conversion() {
        // 0.01 packets per microsecond at a 1500 byte MSS is 15 MB/s; with
        // the 1% pacing margin the target is 14.85 MB/s.
        let bw = BW_UNIT / 100;
        let rate = rate_bytes_per_sec(bw, 1500, BBR_UNIT);
        assert!(rate > 14_800_000 && rate <= 14_850_000);

        // A gain of 2x doubles the rate.
        let rate2 = rate_bytes_per_sec(bw, 1500, BBR_UNIT * 2);
        assert!(rate2 >= rate * 2 - 1 && rate2 <= rate * 2 + 1);

        // Zero bandwidth paces at zero.
        assert_eq!(rate_bytes_per_sec(0, 1500, BBR_UNIT), 0);
    }

    #[test]
    fn rate_no_overflow() {
        // 2 Tbit/s at MSS 1500: about 166 packets per microsecond.
        let bw = 166 * BW_UNIT;
        let rate = rate_bytes_per_sec(bw, 1500, BBR_UNIT * 2885 / 1000 + 1);
        assert!(rate > 500_000_000_000);
    }

    #[test]
    fn pacing_rate_bounded() {
        let bw = BW_UNIT / 100;
        let rate = bw_to_pacing_rate(bw, 1500, BBR_UNIT, 1_000_000);
        assert_eq!(rate, 1_000_000);
    }

    #[test]
    fn bdp_rounds_up() {
        // 0.01 packets/us over a 50ms RTT is a 500 packet BDP.
        let bw = BW_UNIT / 100;
        assert_eq!(bdp(bw, 50_000, BBR_UNIT), 500);

        // Gain scales the BDP.
        assert_eq!(bdp(bw, 50_000, BBR_UNIT * 2), 1000);

        // Sub-unit results round up to one packet.
        assert_eq!(bdp(1, 1, BBR_UNIT), 1);
    }

    #[test]
    fn tso_goal() {
        // Below 1.2 Mbit/s a burst is a single segment.
        assert_eq!(min_tso_segs(100_000), 1);
        assert_eq!(min_tso_segs(200_000), 2);

        // 10 MB/s paces bursts of (rate >> 10) / mss segments.
        assert_eq!(tso_segs_goal(10_000_000, 1500), 6);

        // The burst budget respects the aggregation ceiling.
        assert_eq!(tso_segs_goal(u64::MAX, 1500), 43);

        // Low rates still send a minimal burst.
        assert_eq!(tso_segs_goal(10_000, 1500), 1);
    }
}
