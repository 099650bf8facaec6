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

//! BBR congestion control with token-bucket rate capping.
//!
//! BBR computes the sending rate from the delivery rate estimated out of
//! ACKs. On each rate sample it updates an explicit model of the path:
//! the bottleneck bandwidth is the windowed max of recent delivery rate
//! samples over ten packet-timed rounds, and min_rtt is the windowed min of
//! RTT samples over ten seconds. The pacing rate is a cycling gain times the
//! modeled bandwidth, and the congestion window a gain times the BDP.
//!
//! See "BBR: Congestion-Based Congestion Control", ACM Queue Vol. 14 No. 5,
//! and <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-00>.
//!
//! A BBR flow starts in STARTUP and ramps its sending rate quickly; when it
//! estimates the pipe is full it DRAINs the queue it created, then spends
//! its life cycling through PROBE_BW gains, briefly dipping into PROBE_RTT
//! when the min_rtt estimate goes stale.
//!
//! On top of the BBR model this controller runs a token-bucket rate-limit
//! estimator (see the `ratelimit` module). Once the estimator classifies the
//! path as rate-limited, the pacing rate derived from the gain cycle is
//! capped at the estimated sustained rate, and the cap is probed upward
//! periodically to discover newly available headroom.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::Rng;

use super::minmax::MinMax;
use super::rate;
use super::rate::BBR_SCALE;
use super::rate::BBR_UNIT;
use super::rate::BW_SCALE;
use super::rate::BW_UNIT;
use super::rate::USEC_PER_SEC;
use super::ratelimit::CapState;
use super::ratelimit::ProbeAction;
use super::ratelimit::RateLimitEstimator;
use super::ratelimit::CLASSIFY_RATE_LIMITED;
use super::CaState;
use super::CongestionController;
use super::CongestionEvent;
use super::ConnectionState;
use super::ControllerInfo;
use super::RateSample;
use crate::Config;
use crate::Tunables;

/// Number of phases in a pacing gain cycle.
const CYCLE_LEN: usize = 8;

/// Window length of the bandwidth filter, in packet-timed rounds.
const BW_FILTER_LEN: u64 = (CYCLE_LEN + 2) as u64;

/// Window length of the min_rtt filter.
const MIN_RTT_FILTER_LEN: Duration = Duration::from_secs(10);

/// Minimum time spent at the minimal cwnd in PROBE_RTT.
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// The smallest pacing gain that doubles the sending rate each round,
/// `2/ln(2)`; used in STARTUP for both the pacing and cwnd gains.
const HIGH_GAIN: u64 = BBR_UNIT * 2885 / 1000 + 1;

/// The inverse of the STARTUP gain, calculated to drain the queue created
/// in STARTUP within a single round.
const DRAIN_GAIN: u64 = BBR_UNIT * 1000 / 2885;

/// The steady-state cwnd gain, tolerating delayed and stretched ACKs.
const CWND_GAIN: u64 = BBR_UNIT * 2;

/// The pacing gain cycle for PROBE_BW: probe above the estimate, drain the
/// excess, then cruise.
const PACING_GAIN_CYCLE: [u64; CYCLE_LEN] = [
    BBR_UNIT * 5 / 4,
    BBR_UNIT * 3 / 4,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
];

/// Number of phases eligible as a randomized PROBE_BW starting point (all
/// but the drain phase).
const CYCLE_RAND: usize = 7;

/// Minimal packets in flight: a sliding window protocol ACKing every other
/// packet needs at least 4.
const MIN_CWND_TARGET: u64 = 4;

/// If the bandwidth grew by this factor (1.25x), STARTUP may find more.
const FULL_BW_THRESH: u64 = BBR_UNIT * 5 / 4;

/// After 3 rounds without significant growth, estimate the pipe is full.
const FULL_BW_CNT: u32 = 3;

/// Minimum rounds in a long-term bandwidth sampling interval.
const LT_INTVL_MIN_RTTS: u32 = 4;

/// A sampling interval with lost/delivered >= 50/256 (~20%) is lossy enough
/// to suggest policing.
const LT_LOSS_THRESH: u64 = 50;

/// Two intervals within a 1/8 bandwidth ratio are consistent.
const LT_BW_RATIO: u64 = BBR_UNIT / 8;

/// Two intervals within 4 Kbit/sec of each other are consistent.
const LT_BW_DIFF: u64 = 4000 / 8;

/// Once policing is estimated, use the long-term rate for this many rounds.
const LT_BW_MAX_RTTS: u32 = 48;

/// Gain for adding the ACK aggregation excess to the target cwnd.
const EXTRA_ACKED_GAIN: u64 = BBR_UNIT;

/// Window length of the ACK aggregation filter, in rounds.
const EXTRA_ACKED_WIN_RTTS: u32 = 5;

/// Reset the ACK sampling epoch once this much has been acked in it.
const ACK_EPOCH_ACKED_RESET_THRESH: u64 = 1 << 20;

/// Time period bounding the cwnd increment from ACK aggregation.
const EXTRA_ACKED_MAX_US: u64 = 100 * 1000;

/// ssthresh sentinel used until loss recovery first engages.
const INFINITE_SSTHRESH: u64 = u64::MAX;

/// BBR operating modes.
///
/// ```text
///             |
///             V
///    +---> STARTUP  ----+
///    |        |         |
///    |        V         |
///    |      DRAIN   ----+
///    |        |         |
///    |        V         |
///    +---> PROBE_BW ----+
///    |      ^    |      |
///    |      |    |      |
///    |      +----+      |
///    |                  |
///    +---- PROBE_RTT <--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Ramp up the sending rate rapidly to fill the pipe.
    Startup,

    /// Drain any queue created during startup.
    Drain,

    /// Discover and share bandwidth, pacing around the estimated rate.
    ProbeBw,

    /// Cut inflight to a minimum to re-probe the propagation delay.
    ProbeRtt,
}

/// Plateau detector for leaving STARTUP.
#[derive(Debug, Default)]
struct FullPipeEstimator {
    /// Whether full bandwidth was reached in STARTUP.
    reached: bool,

    /// Recent bandwidth baseline, to estimate if the pipe is full.
    bw: u64,

    /// Rounds without large bandwidth gains.
    count: u32,
}

/// Long-term ("LT") policed-bandwidth sampling state.
///
/// Token-bucket traffic policers are common (see "An Internet-Wide Analysis
/// of Traffic Policing", SIGCOMM 2016). BBR detects policers by looking for
/// two consecutive sampling intervals with consistent throughput under high
/// loss, and then paces at the measured long-term rate to reduce
/// unnecessary losses.
#[derive(Debug)]
struct LtBwEstimator {
    /// Whether long-term samples are being taken now.
    is_sampling: bool,

    /// Round trips elapsed in the current interval.
    rtt_cnt: u32,

    /// Delivery time at the interval start.
    last_stamp: Instant,

    /// Delivered count at the interval start.
    last_delivered: u64,

    /// Lost count at the interval start.
    last_lost: u64,

    /// Long-term estimated delivery rate in pkts/uS << BW_SCALE.
    bw: u64,

    /// Whether to use the long-term rate as the bandwidth estimate.
    use_bw: bool,
}

impl LtBwEstimator {
    fn new(now: Instant) -> Self {
        Self {
            is_sampling: false,
            rtt_cnt: 0,
            last_stamp: now,
            last_delivered: 0,
            last_lost: 0,
            bw: 0,
            use_bw: false,
        }
    }
}

/// Windowed estimate of the degree of ACK aggregation, used to provision
/// extra in-flight data to keep sending during inter-ACK silences.
#[derive(Debug)]
struct AckAggregationEstimator {
    /// Start of the current ACK sampling epoch.
    epoch_start: Instant,

    /// Packets (S)ACKed in the sampling epoch.
    epoch_acked: u64,

    /// Maximum excess packets ACKed beyond the expected amount, tracked
    /// over a two-slot ping-pong window.
    extra_acked: [u64; 2],

    /// Age of the current window slot, in round trips.
    win_rtts: u32,

    /// Current slot index.
    win_idx: usize,
}

impl AckAggregationEstimator {
    fn new(now: Instant) -> Self {
        Self {
            epoch_start: now,
            epoch_acked: 0,
            extra_acked: [0, 0],
            win_rtts: 0,
            win_idx: 0,
        }
    }
}

/// BBR congestion control with token-bucket rate capping.
#[derive(Debug)]
pub struct Bbr {
    /// Configurable parameters.
    config: Config,

    /// Process-wide tunables for the detector and its cap.
    tunables: Arc<Tunables>,

    /// Current mode in the state machine.
    mode: Mode,

    /// Minimum RTT observed within the filter window. The unknown sentinel
    /// is `Duration::MAX`.
    min_rtt: Duration,

    /// When the current min_rtt sample was recorded.
    min_rtt_stamp: Instant,

    /// End time for PROBE_RTT, armed once inflight has dropped far enough.
    probe_rtt_done_stamp: Option<Instant>,

    /// Whether a full packet-timed round passed in PROBE_RTT at low
    /// inflight.
    probe_rtt_round_done: bool,

    /// Max recent delivery rate in pkts/uS << BW_SCALE.
    bw_filter: MinMax,

    /// Count of packet-timed rounds elapsed.
    rtt_cnt: u64,

    /// Delivered count marking the end of the current packet-timed round.
    next_rtt_delivered: u64,

    /// Whether this sample started a new packet-timed round.
    round_start: bool,

    /// The congestion-avoidance state seen on the previous ACK.
    prev_ca_state: CaState,

    /// Whether the first round of recovery conserves packets.
    packet_conservation: bool,

    /// Whether the connection is restarting after idle.
    idle_restart: bool,

    /// Long-term policed-bandwidth estimator.
    lt: LtBwEstimator,

    /// Current gain for the pacing rate, scaled by BBR_SCALE.
    pacing_gain: u64,

    /// Current gain for the congestion window, scaled by BBR_SCALE.
    cwnd_gain: u64,

    /// Congestion window checkpoint, restored after loss recovery or
    /// PROBE_RTT.
    prior_cwnd: u64,

    /// Plateau detector for leaving STARTUP.
    full_pipe: FullPipeEstimator,

    /// ACK aggregation compensator.
    ack_aggr: AckAggregationEstimator,

    /// Current index into the pacing gain cycle.
    cycle_idx: usize,

    /// Start time of the current PROBE_BW phase.
    cycle_stamp: Instant,

    /// Whether an RTT sample has been seen yet.
    has_seen_rtt: bool,

    /// Current pacing rate in bytes per second.
    pacing_rate: u64,

    /// Congestion window in packets.
    cwnd: u64,

    /// Slow start threshold handed to the transport on loss entry.
    ssthresh: u64,

    /// Token-bucket rate-limit estimator; absent when detection is
    /// disabled, in which case the controller behaves as plain BBR.
    detector: Option<RateLimitEstimator>,
}

impl Bbr {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        let tunables = config.tunables();
        let detector = if config.enable_rate_limit_detection {
            Some(RateLimitEstimator::new(
                now,
                &ConnectionState::default(),
                tunables.use_goodput(),
            ))
        } else {
            None
        };
        let initial_cwnd = config.initial_congestion_window;

        let mut bbr = Bbr {
            config,
            tunables,
            mode: Mode::Startup,
            min_rtt: Duration::MAX,
            min_rtt_stamp: now,
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            bw_filter: MinMax::new(BW_FILTER_LEN),
            rtt_cnt: 0,
            next_rtt_delivered: 0,
            round_start: false,
            prev_ca_state: CaState::Open,
            packet_conservation: false,
            idle_restart: false,
            lt: LtBwEstimator::new(now),
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            prior_cwnd: 0,
            full_pipe: FullPipeEstimator::default(),
            ack_aggr: AckAggregationEstimator::new(now),
            cycle_idx: 0,
            cycle_stamp: now,
            has_seen_rtt: false,
            pacing_rate: 0,
            cwnd: initial_cwnd,
            ssthresh: INFINITE_SSTHRESH,
            detector,
        };
        bbr.init_pacing_rate();
        bbr
    }

    /// The min_rtt estimate in microseconds, if one has been taken.
    fn min_rtt_us(&self) -> Option<u64> {
        if self.min_rtt == Duration::MAX {
            None
        } else {
            Some((self.min_rtt.as_micros() as u64).max(1))
        }
    }

    /// Whether STARTUP is estimated to have filled the pipe.
    fn full_bw_reached(&self) -> bool {
        self.full_pipe.reached
    }

    /// The windowed max recent bandwidth sample, in pkts/uS << BW_SCALE.
    fn max_bw(&self) -> u64 {
        self.bw_filter.get()
    }

    /// The estimated bandwidth of the path, in pkts/uS << BW_SCALE.
    fn bw(&self) -> u64 {
        if self.lt.use_bw {
            self.lt.bw
        } else {
            self.max_bw()
        }
    }

    /// Maximum excess packets ACKed in the past k-2k round trips.
    fn extra_acked(&self) -> u64 {
        self.ack_aggr.extra_acked[0].max(self.ack_aggr.extra_acked[1])
    }

    /// Seed the pacing rate from the initial cwnd and the configured initial
    /// RTT, before any RTT sample exists.
    fn init_pacing_rate(&mut self) {
        let rtt = self
            .config
            .initial_rtt
            .unwrap_or_else(|| Duration::from_millis(1));
        let rtt_us = (rtt.as_micros() as u64).max(1);
        let bw = self.cwnd * BW_UNIT / rtt_us;
        self.pacing_rate = rate::bw_to_pacing_rate(
            bw,
            self.config.max_datagram_size,
            HIGH_GAIN,
            self.config.max_pacing_rate,
        );
    }

    /// Re-seed the pacing rate from the first SRTT observed mid-flight.
    fn init_pacing_rate_from_rtt(&mut self, conn: &ConnectionState) {
        let rtt_us = if !conn.srtt.is_zero() {
            self.has_seen_rtt = true;
            (conn.srtt.as_micros() as u64).max(1)
        } else {
            1000
        };
        let bw = self.cwnd * BW_UNIT / rtt_us;
        self.pacing_rate =
            rate::bw_to_pacing_rate(bw, conn.mss, HIGH_GAIN, self.config.max_pacing_rate);
    }

    /// The pacing cap derived from the detector's best sustained-rate
    /// candidate at gain 1.0, inflated by the probe gain while probing.
    fn cap_pacing_rate(&self, conn: &ConnectionState, best_rate: u64, nominator: u64) -> u64 {
        let mut gain = BBR_UNIT;
        if nominator != 0 {
            gain = gain * u64::from(self.tunables.probe_per()) / 20;
        }
        rate::bw_to_pacing_rate(best_rate, conn.mss, gain, self.config.max_pacing_rate)
    }

    /// Pace using the current bandwidth estimate and a gain factor, with
    /// the policer-aware cap applied when the detector has locked in.
    fn set_pacing_rate(&mut self, conn: &ConnectionState, bw: u64, gain: u64) {
        let mut new_rate = rate::bw_to_pacing_rate(bw, conn.mss, gain, self.config.max_pacing_rate);

        let mut capped = false;
        if let Some(det) = &self.detector {
            if det.classify == CLASSIFY_RATE_LIMITED
                && det.upper_bound == CapState::Active
                && self.tunables.optimize()
            {
                let cap = self.cap_pacing_rate(conn, det.best_rate(), det.nominator);
                if new_rate > cap {
                    new_rate = cap;
                    capped = true;
                }
            }
        }

        if !self.has_seen_rtt && !conn.srtt.is_zero() {
            self.init_pacing_rate_from_rtt(conn);
        }
        if self.full_bw_reached() || new_rate > self.pacing_rate {
            self.pacing_rate = new_rate;
        }
        if capped {
            // The cap overrides the keep-the-highest rule above.
            self.pacing_rate = new_rate;
        }
    }

    /// BDP in packets at the given gain, from the estimated bandwidth and
    /// min_rtt.
    fn bdp(&self, bw: u64, gain: u64) -> u64 {
        if self.min_rtt == Duration::MAX {
            // No valid RTT samples yet; cap at the initial default.
            return self.config.initial_congestion_window;
        }
        rate::bdp(bw, self.min_rtt.as_micros() as u64, gain)
    }

    /// Budget enough extra cwnd to keep full-sized bursts in flight on both
    /// end hosts, round up to an even number to reduce delayed ACKs, and
    /// keep gain cycling effective for small BDPs.
    fn quantization_budget(&self, conn: &ConnectionState, mut cwnd: u64) -> u64 {
        cwnd += 3 * rate::tso_segs_goal(self.pacing_rate, conn.mss);
        cwnd = (cwnd + 1) & !1;
        if self.mode == Mode::ProbeBw && self.cycle_idx == 0 {
            cwnd += 2;
        }
        cwnd
    }

    /// Target inflight based on min RTT and the estimated bandwidth.
    fn inflight(&self, conn: &ConnectionState, bw: u64, gain: u64) -> u64 {
        self.quantization_budget(conn, self.bdp(bw, gain))
    }

    /// The cwnd increment compensating for aggregated ACKs.
    fn ack_aggregation_cwnd(&self) -> u64 {
        if !self.full_bw_reached() {
            return 0;
        }
        let max_aggr_cwnd = self.bw() * EXTRA_ACKED_MAX_US / BW_UNIT;
        let aggr_cwnd = (EXTRA_ACKED_GAIN * self.extra_acked()) >> BBR_SCALE;
        aggr_cwnd.min(max_aggr_cwnd)
    }

    /// Save the last-known good cwnd so it can be restored after loss
    /// recovery or PROBE_RTT.
    fn save_cwnd(&mut self) {
        self.prior_cwnd = if self.prev_ca_state < CaState::Recovery && self.mode != Mode::ProbeRtt {
            self.cwnd
        } else {
            self.cwnd.max(self.prior_cwnd)
        };
    }

    fn restore_cwnd(&mut self) {
        self.cwnd = self.cwnd.max(self.prior_cwnd);
    }

    /// Update the round counter. A round ends when the first packet sent
    /// after the previous round's end is ACKed.
    fn update_round(&mut self, conn: &ConnectionState, sample: &RateSample) {
        self.round_start = false;
        if sample.prior_delivered >= self.next_rtt_delivered {
            self.next_rtt_delivered = conn.delivered;
            self.rtt_cnt += 1;
            self.round_start = true;
            self.packet_conservation = false;
        }
    }

    /// Incorporate this sample into the bandwidth model.
    fn update_bw(&mut self, conn: &ConnectionState, sample: &RateSample) {
        self.update_round(conn, sample);
        self.lt_bw_sampling(conn, sample);

        // Delivered over interval gives a lower-bound bandwidth sample;
        // delivered is scaled first since the ratio is <<1 in pkts/uS.
        let interval_us = (sample.interval.as_micros() as u64).max(1);
        let bw = sample.delivered * BW_UNIT / interval_us;

        // App-limited samples reflect application behavior, not path
        // capacity, so they only count when they beat the current model.
        if !sample.is_app_limited || bw >= self.max_bw() {
            self.bw_filter.update_max(self.rtt_cnt, bw);
        }
    }

    /// Start a new long-term sampling interval.
    fn reset_lt_bw_sampling_interval(&mut self, conn: &ConnectionState) {
        self.lt.last_stamp = conn.delivered_time;
        self.lt.last_delivered = conn.delivered;
        self.lt.last_lost = conn.lost;
        self.lt.rtt_cnt = 0;
    }

    /// Completely reset long-term bandwidth sampling.
    fn reset_lt_bw_sampling(&mut self, conn: &ConnectionState) {
        self.lt.bw = 0;
        self.lt.use_bw = false;
        self.lt.is_sampling = false;
        self.reset_lt_bw_sampling_interval(conn);
    }

    /// A long-term sampling interval is done; estimate whether we're
    /// policed by comparing it with the previous one.
    fn lt_bw_interval_done(&mut self, conn: &ConnectionState, bw: u64) {
        if self.lt.bw != 0 {
            let diff = bw.abs_diff(self.lt.bw);
            if diff * BBR_UNIT <= LT_BW_RATIO * self.lt.bw
                || rate::rate_bytes_per_sec(diff, conn.mss, BBR_UNIT) <= LT_BW_DIFF
            {
                // Two consistent lossy intervals: estimate we're policed.
                self.lt.bw = (bw + self.lt.bw) >> 1;
                self.lt.use_bw = true;
                self.pacing_gain = BBR_UNIT;
                self.lt.rtt_cnt = 0;
                return;
            }
        }
        self.lt.bw = bw;
        self.reset_lt_bw_sampling_interval(conn);
    }

    /// Long-term bandwidth sampling: look for intervals of consistent
    /// throughput under high loss, bounded between losses.
    fn lt_bw_sampling(&mut self, conn: &ConnectionState, sample: &RateSample) {
        if self.lt.use_bw {
            if self.mode == Mode::ProbeBw && self.round_start {
                self.lt.rtt_cnt += 1;
                if self.lt.rtt_cnt >= LT_BW_MAX_RTTS {
                    self.reset_lt_bw_sampling(conn);
                    self.reset_probe_bw_mode(conn.delivered_time);
                }
            }
            return;
        }

        // Wait for the first loss before sampling, to let the policer
        // exhaust its tokens; earlier samples include bursts that
        // over-estimate the sustained rate.
        if !self.lt.is_sampling {
            if sample.losses == 0 {
                return;
            }
            self.reset_lt_bw_sampling_interval(conn);
            self.lt.is_sampling = true;
        }

        // App-limited intervals under-estimate; start over.
        if sample.is_app_limited {
            self.reset_lt_bw_sampling(conn);
            return;
        }

        if self.round_start {
            self.lt.rtt_cnt += 1;
        }
        if self.lt.rtt_cnt < LT_INTVL_MIN_RTTS {
            return;
        }
        if self.lt.rtt_cnt > 4 * LT_INTVL_MIN_RTTS {
            self.reset_lt_bw_sampling(conn);
            return;
        }

        // Close the interval on a loss, when the policer tokens are
        // plausibly exhausted.
        if sample.losses == 0 {
            return;
        }

        let lost = conn.lost.saturating_sub(self.lt.last_lost);
        let delivered = conn.delivered.saturating_sub(self.lt.last_delivered);
        if delivered == 0 || (lost << BBR_SCALE) < LT_LOSS_THRESH * delivered {
            return;
        }

        let t_ms = conn
            .delivered_time
            .saturating_duration_since(self.lt.last_stamp)
            .as_millis();
        if t_ms < 1 {
            return;
        }
        if t_ms >= u128::from(u32::MAX) / 1000 {
            // Interval too long to represent; start over.
            self.reset_lt_bw_sampling(conn);
            return;
        }
        let bw = delivered * BW_UNIT / (t_ms as u64 * 1000);
        self.lt_bw_interval_done(conn, bw);
    }

    /// Track the windowed max degree of ACK aggregation, as the excess data
    /// acked beyond what the current bandwidth predicts for the epoch.
    fn update_ack_aggregation(&mut self, conn: &ConnectionState, sample: &RateSample) {
        if sample.acked_sacked == 0 {
            return;
        }

        if self.round_start {
            self.ack_aggr.win_rtts = (self.ack_aggr.win_rtts + 1).min(0x1F);
            if self.ack_aggr.win_rtts >= EXTRA_ACKED_WIN_RTTS {
                self.ack_aggr.win_rtts = 0;
                self.ack_aggr.win_idx ^= 1;
                self.ack_aggr.extra_acked[self.ack_aggr.win_idx] = 0;
            }
        }

        let epoch_us = conn
            .delivered_time
            .saturating_duration_since(self.ack_aggr.epoch_start)
            .as_micros() as u64;
        let mut expected_acked = self.bw() * epoch_us / BW_UNIT;

        // Restart the epoch if the ACK rate dropped below the expected rate
        // or the epoch grew old enough to overflow the accounting.
        if self.ack_aggr.epoch_acked <= expected_acked
            || self.ack_aggr.epoch_acked + sample.acked_sacked >= ACK_EPOCH_ACKED_RESET_THRESH
        {
            self.ack_aggr.epoch_acked = 0;
            self.ack_aggr.epoch_start = conn.delivered_time;
            expected_acked = 0;
        }

        self.ack_aggr.epoch_acked =
            (self.ack_aggr.epoch_acked + sample.acked_sacked).min(0xFFFFF);
        let extra = (self.ack_aggr.epoch_acked - expected_acked).min(self.cwnd);
        if extra > self.ack_aggr.extra_acked[self.ack_aggr.win_idx] {
            self.ack_aggr.extra_acked[self.ack_aggr.win_idx] = extra;
        }
    }

    /// End the current PROBE_BW phase when it served its purpose.
    fn is_next_cycle_phase(&self, conn: &ConnectionState, sample: &RateSample) -> bool {
        let is_full_length = conn
            .delivered_time
            .saturating_duration_since(self.cycle_stamp)
            > self.min_rtt;

        // Pacing at 1.0 uses the pipe without growing the queue; wall clock
        // time alone ends the phase.
        if self.pacing_gain == BBR_UNIT {
            return is_full_length;
        }

        let inflight = sample.prior_in_flight;
        let bw = self.max_bw();

        // Probing (gain > 1) persists until inflight reaches the inflated
        // BDP target, unless losses say the path won't hold that much.
        if self.pacing_gain > BBR_UNIT {
            return is_full_length
                && (sample.losses > 0 || inflight >= self.inflight(conn, bw, self.pacing_gain));
        }

        // Draining (gain < 1) ends as soon as the excess queue is gone;
        // persisting would underutilize the pipe.
        is_full_length || inflight <= self.inflight(conn, bw, BBR_UNIT)
    }

    fn advance_cycle_phase(&mut self, now: Instant) {
        self.cycle_idx = (self.cycle_idx + 1) % CYCLE_LEN;
        self.cycle_stamp = now;
    }

    /// Gain cycling: converge to a fair share of the available bandwidth.
    fn update_cycle_phase(&mut self, conn: &ConnectionState, sample: &RateSample) {
        if self.mode == Mode::ProbeBw && self.is_next_cycle_phase(conn, sample) {
            self.advance_cycle_phase(conn.delivered_time);
        }
    }

    fn reset_startup_mode(&mut self) {
        self.mode = Mode::Startup;
    }

    /// Enter PROBE_BW with a randomized starting phase, picked from all but
    /// the drain phase to improve mixing across flows.
    fn reset_probe_bw_mode(&mut self, now: Instant) {
        self.mode = Mode::ProbeBw;
        self.cycle_idx = CYCLE_LEN - 1 - rand::thread_rng().gen_range(0..CYCLE_RAND);
        self.advance_cycle_phase(now);
    }

    fn reset_mode(&mut self, now: Instant) {
        if !self.full_bw_reached() {
            self.reset_startup_mode();
        } else {
            self.reset_probe_bw_mode(now);
        }
    }

    /// Estimate when the pipe is full: the bandwidth plateaued if it has
    /// not grown by 25% for three non-app-limited rounds. Three rounds lets
    /// receive window autotuning and delivery rate samples catch up first.
    fn check_full_bw_reached(&mut self, sample: &RateSample) {
        if self.full_bw_reached() || !self.round_start || sample.is_app_limited {
            return;
        }

        let bw_thresh = self.full_pipe.bw * FULL_BW_THRESH >> BBR_SCALE;
        if self.max_bw() >= bw_thresh {
            self.full_pipe.bw = self.max_bw();
            self.full_pipe.count = 0;
            return;
        }
        self.full_pipe.count += 1;
        self.full_pipe.reached = self.full_pipe.count >= FULL_BW_CNT;
    }

    /// If the pipe is probably full, drain the queue and enter steady
    /// state.
    fn check_drain(&mut self, conn: &ConnectionState, _sample: &RateSample) {
        if self.mode == Mode::Startup && self.full_bw_reached() {
            self.mode = Mode::Drain;
            self.ssthresh = self.inflight(conn, self.max_bw(), BBR_UNIT);
        }
        if self.mode == Mode::Drain
            && conn.packets_in_flight <= self.inflight(conn, self.max_bw(), BBR_UNIT)
        {
            // The queue we created is estimated drained.
            self.reset_probe_bw_mode(conn.delivered_time);
        }
    }

    fn check_probe_rtt_done(&mut self, conn: &ConnectionState, now: Instant) {
        let done_stamp = match self.probe_rtt_done_stamp {
            Some(stamp) => stamp,
            None => return,
        };
        if now <= done_stamp {
            return;
        }

        // Wait a while until the next PROBE_RTT.
        self.min_rtt_stamp = now;
        self.restore_cwnd();
        self.reset_mode(conn.delivered_time);
    }

    /// Track min_rtt and run the PROBE_RTT machinery.
    ///
    /// When the min_rtt estimate has not been matched or lowered for ten
    /// seconds, the flow dips to a minimal inflight for at least 200ms and
    /// one round, so that competing BBR flows cooperatively drain the
    /// bottleneck queue and measure the true propagation delay.
    fn update_min_rtt(&mut self, conn: &mut ConnectionState, sample: &RateSample, now: Instant) {
        let filter_expired =
            now.saturating_duration_since(self.min_rtt_stamp) > MIN_RTT_FILTER_LEN;

        if !sample.rtt.is_zero()
            && (sample.rtt <= self.min_rtt || (filter_expired && !sample.is_ack_delayed))
        {
            self.min_rtt = sample.rtt;
            self.min_rtt_stamp = now;
        }

        if filter_expired && !self.idle_restart && self.mode != Mode::ProbeRtt {
            self.mode = Mode::ProbeRtt;
            self.save_cwnd();
            self.probe_rtt_done_stamp = None;
        }

        if self.mode == Mode::ProbeRtt {
            // Low rate samples taken while inflight is held down would
            // poison the model; have the transport mark them.
            conn.app_limited = true;

            if self.probe_rtt_done_stamp.is_none()
                && conn.packets_in_flight <= MIN_CWND_TARGET
            {
                self.probe_rtt_done_stamp = Some(now + PROBE_RTT_DURATION);
                self.probe_rtt_round_done = false;
                self.next_rtt_delivered = conn.delivered;
                if let Some(det) = self.detector.as_mut() {
                    det.start_round(conn.delivered);
                }
            } else if self.probe_rtt_done_stamp.is_some() {
                if self.round_start {
                    self.probe_rtt_round_done = true;
                }
                if self.probe_rtt_round_done {
                    self.check_probe_rtt_done(conn, now);
                }
            }
        }

        // Restart-from-idle ends once a new data sample arrives.
        if sample.delivered > 0 {
            self.idle_restart = false;
        }
    }

    fn update_gains(&mut self) {
        match self.mode {
            Mode::Startup => {
                self.pacing_gain = HIGH_GAIN;
                self.cwnd_gain = HIGH_GAIN;
            }
            Mode::Drain => {
                self.pacing_gain = DRAIN_GAIN;
                self.cwnd_gain = HIGH_GAIN;
            }
            Mode::ProbeBw => {
                self.pacing_gain = if self.lt.use_bw {
                    BBR_UNIT
                } else {
                    PACING_GAIN_CYCLE[self.cycle_idx]
                };
                self.cwnd_gain = CWND_GAIN;
            }
            Mode::ProbeRtt => {
                self.pacing_gain = BBR_UNIT;
                self.cwnd_gain = BBR_UNIT;
            }
        }
    }

    fn update_model(&mut self, conn: &mut ConnectionState, sample: &RateSample, now: Instant) {
        self.update_bw(conn, sample);
        self.update_ack_aggregation(conn, sample);
        self.update_cycle_phase(conn, sample);
        self.check_full_bw_reached(sample);
        self.check_drain(conn, sample);
        self.update_min_rtt(conn, sample, now);
        self.update_gains();
    }

    /// On the first round of recovery send at most as much as was acked;
    /// on recovery exit restore the checkpointed cwnd. Returns the packet
    /// conservation decision and the adjusted cwnd.
    fn set_cwnd_to_recover_or_restore(
        &mut self,
        conn: &ConnectionState,
        sample: &RateSample,
        acked: u64,
    ) -> (bool, u64) {
        let prev_state = self.prev_ca_state;
        let state = conn.ca_state;
        let mut cwnd = self.cwnd;

        // An ACK for P packets should release at most 2*P packets: deduct
        // the losses here, then slow start toward the target in set_cwnd.
        if sample.losses > 0 {
            cwnd = cwnd.saturating_sub(sample.losses).max(1);
        }

        if state == CaState::Recovery && prev_state != CaState::Recovery {
            // Starting the first round of recovery: conserve packets, and
            // cut cwnd unused due to application behavior or send deferral.
            self.packet_conservation = true;
            self.next_rtt_delivered = conn.delivered;
            if let Some(det) = self.detector.as_mut() {
                det.start_round(conn.delivered);
            }
            cwnd = conn.packets_in_flight + acked;
        } else if prev_state >= CaState::Recovery && state < CaState::Recovery {
            // Exiting loss recovery: restore the checkpointed cwnd.
            cwnd = cwnd.max(self.prior_cwnd);
            self.packet_conservation = false;
        }
        self.prev_ca_state = state;

        if self.packet_conservation {
            return (true, cwnd.max(conn.packets_in_flight + acked));
        }
        (false, cwnd)
    }

    /// Slow-start the cwnd toward the target (or snap down to it), with
    /// recovery and PROBE_RTT modulation applied.
    fn set_cwnd(
        &mut self,
        conn: &ConnectionState,
        sample: &RateSample,
        acked: u64,
        bw: u64,
        gain: u64,
    ) {
        let mut cwnd = self.cwnd;

        if acked != 0 {
            let (conserved, adjusted) = self.set_cwnd_to_recover_or_restore(conn, sample, acked);
            cwnd = adjusted;

            if !conserved {
                let mut target_cwnd = self.bdp(bw, gain);
                // Allow for excess acked data visible in the ACK stream due
                // to aggregation of data or ACKs.
                target_cwnd += self.ack_aggregation_cwnd();
                target_cwnd = self.quantization_budget(conn, target_cwnd);

                if self.full_bw_reached() {
                    cwnd = (cwnd + acked).min(target_cwnd);
                } else if cwnd < target_cwnd
                    || conn.delivered < self.config.initial_congestion_window
                {
                    cwnd += acked;
                }
                cwnd = cwnd.max(self.config.min_congestion_window);
            }
        }

        self.cwnd = cwnd.min(conn.cwnd_clamp);
        if self.mode == Mode::ProbeRtt {
            // Drain the queue to refresh min_rtt.
            self.cwnd = self.cwnd.min(MIN_CWND_TARGET);
        }
    }

    /// Introspection snapshot. With the detector locked in, the fields are
    /// repurposed to carry the detection state.
    fn controller_info(&self) -> ControllerInfo {
        let mss = self.config.max_datagram_size;

        if let Some(det) = &self.detector {
            if det.classify == CLASSIFY_RATE_LIMITED {
                return ControllerInfo {
                    bw_lo: u64::from(det.classify),
                    bw_hi: det.detected_time.as_millis() as u64,
                    min_rtt: det.detected_bytes_acked,
                    pacing_gain: (det.best_bucket() * mss / 1024) >> BW_SCALE,
                    cwnd_gain: (det.best_rate() * mss * 1000) >> BW_SCALE,
                };
            }
            return ControllerInfo {
                bw_lo: u64::from(det.classify),
                ..Default::default()
            };
        }

        let bw = self.bw() * mss * USEC_PER_SEC >> BW_SCALE;
        ControllerInfo {
            bw_lo: bw & 0xFFFF_FFFF,
            bw_hi: bw >> 32,
            min_rtt: self.min_rtt_us().unwrap_or(u64::MAX),
            pacing_gain: self.pacing_gain,
            cwnd_gain: self.cwnd_gain,
        }
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &str {
        "BBR"
    }

    fn on_sample(&mut self, conn: &mut ConnectionState, sample: &RateSample, now: Instant) {
        if !sample.is_valid() {
            // Not a valid observation; leave all state untouched.
            return;
        }

        self.update_model(conn, sample, now);

        let use_goodput = self.tunables.use_goodput();
        let optimize = self.tunables.optimize();
        let probe_interval = u64::from(self.tunables.probe_interval());
        let monitor_period = u64::from(self.tunables.monitor_period());
        let min_rtt_us = self.min_rtt_us();

        let mut want_lt_reset = false;
        let mut probe_action = ProbeAction::None;
        if let Some(det) = self.detector.as_mut() {
            if !det.is_disabled() {
                want_lt_reset = det.estimate(now, min_rtt_us, conn, use_goodput);
            }
            det.track_loss(now, conn, use_goodput);

            // While capped, the LT estimator is redundant with the cap and
            // its gain-1.0 modulation would fight the probe schedule.
            if det.classify == CLASSIFY_RATE_LIMITED && optimize {
                want_lt_reset = true;
            }

            det.update_round(conn.delivered, sample.prior_delivered, true);
            probe_action = det.probe(conn.delivered, probe_interval, monitor_period, optimize);
        }
        if want_lt_reset {
            self.reset_lt_bw_sampling(conn);
        }
        if probe_action == ProbeAction::Start {
            // Force the high-gain phase so the probe actually sends above
            // the cap.
            self.advance_cycle_phase(conn.delivered_time);
            self.cycle_idx = 0;
            self.mode = Mode::ProbeBw;
        }

        let bw = self.bw();
        self.set_pacing_rate(conn, bw, self.pacing_gain);
        self.set_cwnd(conn, sample, sample.acked_sacked, bw, self.cwnd_gain);

        let exclude_rwnd = self.tunables.exclude_rwnd();
        let exclude_rto = self.tunables.exclude_rto();
        let exclude_app_limited = self.tunables.exclude_app_limited();
        let prev_ca_state = self.prev_ca_state;
        if let Some(det) = self.detector.as_mut() {
            det.store_snapshot(conn.bytes_acked);

            if exclude_rwnd && conn.rwnd_limited {
                det.reset(now, conn, use_goodput, 5, 6);
            }
            if exclude_rto && prev_ca_state == CaState::Loss && conn.ca_state != CaState::Loss {
                det.reset(now, conn, use_goodput, 7, 8);
            }
            if exclude_app_limited && sample.is_app_limited {
                det.reset(now, conn, use_goodput, 9, 10);
            }
        }

        if self.tunables.enable_log() {
            trace!(
                "bbr ack: mode={:?} cycle_idx={} bw={} pacing_rate={} cwnd={} delivered={} lost={} sample_delivered={} sample_losses={} lt_use_bw={} detector={:?}",
                self.mode,
                self.cycle_idx,
                bw,
                self.pacing_rate,
                self.cwnd,
                conn.delivered,
                conn.lost,
                sample.delivered,
                sample.losses,
                self.lt.use_bw,
                self.detector.as_ref().map(|d| {
                    (d.classify, d.best_bucket(), d.best_rate(), d.upper_bound, d.nominator)
                }),
            );
        }
    }

    fn on_event(&mut self, conn: &ConnectionState, event: CongestionEvent, now: Instant) {
        if event != CongestionEvent::TxStart || !conn.app_limited {
            return;
        }

        // Restarting from idle while app-limited: re-pace at the estimated
        // bandwidth to avoid pointless bursts, and restart the detection
        // epoch since delivery before the idle period tells the bucket
        // estimator nothing.
        self.idle_restart = true;
        self.ack_aggr.epoch_start = conn.delivered_time;
        self.ack_aggr.epoch_acked = 0;

        if self.mode == Mode::ProbeBw {
            self.set_pacing_rate(conn, self.bw(), BBR_UNIT);
        } else if self.mode == Mode::ProbeRtt {
            self.check_probe_rtt_done(conn, now);
        }

        let use_goodput = self.tunables.use_goodput();
        if let Some(det) = self.detector.as_mut() {
            det.on_tx_start(now, conn, use_goodput);
        }
    }

    fn on_ca_state_change(&mut self, conn: &ConnectionState, new_state: CaState, _now: Instant) {
        if new_state != CaState::Loss {
            return;
        }

        // Treat an RTO like the end of a round, reset the plateau detector,
        // and feed the loss into the long-term sampler.
        self.prev_ca_state = CaState::Loss;
        self.full_pipe.bw = 0;
        self.round_start = true;
        let synthetic = RateSample {
            losses: 1,
            ..RateSample::default()
        };
        self.lt_bw_sampling(conn, &synthetic);
    }

    fn ssthresh(&mut self, _conn: &ConnectionState) -> u64 {
        // Entering loss recovery: checkpoint the cwnd for restore on exit.
        self.save_cwnd();
        self.ssthresh
    }

    fn undo_cwnd(&mut self, conn: &ConnectionState) -> u64 {
        // The slow-down was spurious; forget the plateau and policer
        // evidence derived from it.
        self.full_pipe.bw = 0;
        self.full_pipe.count = 0;
        self.reset_lt_bw_sampling(conn);
        self.cwnd
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd.max(self.config.min_congestion_window)
    }

    fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    fn tso_segs_goal(&self, conn: &ConnectionState) -> u64 {
        rate::tso_segs_goal(self.pacing_rate, conn.mss)
    }

    fn sndbuf_expand(&self) -> u64 {
        // Provision 3x cwnd: BBR may slow-start even during recovery.
        3
    }

    fn info(&self) -> ControllerInfo {
        self.controller_info()
    }
}

impl Drop for Bbr {
    fn drop(&mut self) {
        if let Some(det) = &self.detector {
            debug!(
                "bbr released: classify={} B={} R={} detected_bytes_acked={} history={}",
                det.classify,
                det.best_bucket(),
                det.best_rate(),
                det.detected_bytes_acked,
                det.history(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion_control::ratelimit::CLASSIFY_NONE;

    const MSS: u64 = 1500;

    /// Drives a controller with synthetic rate samples over simulated time.
    struct Sim {
        bbr: Bbr,
        conn: ConnectionState,
        now: Instant,
    }

    impl Sim {
        fn new(detect: bool) -> Self {
            let mut config = Config::new().unwrap();
            config.set_max_datagram_size(MSS).unwrap();
            config.enable_rate_limit_detection(detect);
            let now = Instant::now();
            let conn = ConnectionState {
                mss: MSS,
                packets_in_flight: 100,
                delivered_time: now,
                ..Default::default()
            };
            Sim {
                bbr: Bbr::new(config),
                conn,
                now,
            }
        }

        fn step_ex(
            &mut self,
            interval: Duration,
            delivered: u64,
            losses: u64,
            rtt: Duration,
            app_limited: bool,
        ) {
            self.now += interval;
            let prior_delivered = self.conn.delivered;
            self.conn.delivered += delivered;
            self.conn.delivered_time = self.now;
            self.conn.lost += losses;
            self.conn.bytes_acked += delivered * MSS;
            self.conn.snd_una += delivered * MSS;

            let sample = RateSample {
                delivered,
                prior_delivered,
                losses,
                acked_sacked: delivered,
                is_app_limited: app_limited,
                interval,
                rtt,
                prior_in_flight: self.conn.packets_in_flight,
                ..Default::default()
            };
            self.bbr.on_sample(&mut self.conn, &sample, self.now);
        }

        /// One packet-timed round worth of delivery.
        fn step(&mut self, interval: Duration, delivered: u64, losses: u64, rtt: Duration) {
            self.step_ex(interval, delivered, losses, rtt, false);
        }
    }

    const ROUND: Duration = Duration::from_millis(50);
    const RTT: Duration = Duration::from_millis(50);

    // 500 packets per 50ms round is 10 pkt/ms, i.e. BW_UNIT/100 scaled.
    const IDEAL_BW: u64 = 500 * BW_UNIT / 50_000;

    #[test]
    fn ideal_link_reaches_probe_bw() {
        let mut sim = Sim::new(true);
        for _ in 0..50 {
            sim.step(ROUND, 500, 0, RTT);
        }

        assert_eq!(sim.bbr.mode, Mode::ProbeBw);
        assert!(sim.bbr.full_bw_reached());
        assert_eq!(sim.bbr.max_bw(), IDEAL_BW);
        assert_eq!(sim.bbr.min_rtt, RTT);
        assert!(sim.bbr.cycle_idx < CYCLE_LEN);

        // The pacing rate stays inside the gain cycle envelope around the
        // modeled bandwidth.
        let low = rate::bw_to_pacing_rate(IDEAL_BW, MSS, BBR_UNIT * 3 / 4, u64::MAX);
        let high = rate::bw_to_pacing_rate(IDEAL_BW, MSS, BBR_UNIT * 5 / 4, u64::MAX);
        assert!(sim.bbr.pacing_rate >= low && sim.bbr.pacing_rate <= high);

        // cwnd converged to the 2x BDP target region.
        assert!(sim.bbr.cwnd >= 1000 && sim.bbr.cwnd <= 2000);

        // Lossless flow never classifies.
        assert_eq!(sim.bbr.info().bw_lo, u64::from(CLASSIFY_NONE));
    }

    #[test]
    fn startup_exits_on_plateau_within_rounds() {
        let mut sim = Sim::new(true);
        let mut rounds_in_startup = 0;
        for _ in 0..20 {
            if sim.bbr.mode == Mode::Startup {
                rounds_in_startup += 1;
            }
            sim.step(ROUND, 500, 0, RTT);
        }
        assert!(sim.bbr.full_bw_reached());
        assert!(rounds_in_startup <= 6);
        assert_eq!(sim.bbr.mode, Mode::ProbeBw);
        // ssthresh was pinned at the estimated BDP when DRAIN began.
        assert!(sim.bbr.ssthresh < INFINITE_SSTHRESH);
    }

    #[test]
    fn null_samples_leave_state_unchanged() {
        let mut sim = Sim::new(true);
        for _ in 0..10 {
            sim.step(ROUND, 500, 0, RTT);
        }

        let before = format!("{:?}", sim.bbr);
        let null = RateSample {
            delivered: 0,
            prior_delivered: sim.conn.delivered,
            interval: Duration::ZERO,
            ..Default::default()
        };
        for _ in 0..5 {
            let mut conn = sim.conn.clone();
            sim.bbr.on_sample(&mut conn, &null, sim.now);
        }
        assert_eq!(format!("{:?}", sim.bbr), before);
    }

    #[test]
    fn app_limited_samples_do_not_lower_bw() {
        let mut sim = Sim::new(true);
        for _ in 0..20 {
            sim.step(ROUND, 500, 0, RTT);
        }
        let bw = sim.bbr.max_bw();

        for _ in 0..5 {
            sim.step_ex(ROUND, 50, 0, RTT, true);
        }
        assert_eq!(sim.bbr.max_bw(), bw);
    }

    #[test]
    fn restart_from_idle_paces_at_estimated_bw() {
        let mut sim = Sim::new(true);
        for _ in 0..20 {
            sim.step(ROUND, 500, 0, RTT);
        }
        assert_eq!(sim.bbr.mode, Mode::ProbeBw);

        sim.conn.app_limited = true;
        sim.bbr
            .on_event(&sim.conn, CongestionEvent::TxStart, sim.now);
        assert!(sim.bbr.idle_restart);
        let unity = rate::bw_to_pacing_rate(sim.bbr.bw(), MSS, BBR_UNIT, u64::MAX);
        assert_eq!(sim.bbr.pacing_rate, unity);

        // The next data sample ends the idle restart and resumes gain
        // cycling.
        sim.conn.app_limited = false;
        sim.step(ROUND, 500, 0, RTT);
        assert!(!sim.bbr.idle_restart);
        assert!(sim.bbr.pacing_rate >= rate::bw_to_pacing_rate(sim.bbr.bw(), MSS, BBR_UNIT * 3 / 4, u64::MAX));
    }

    #[test]
    fn other_events_are_ignored() {
        let mut sim = Sim::new(true);
        for _ in 0..5 {
            sim.step(ROUND, 500, 0, RTT);
        }
        let before = format!("{:?}", sim.bbr);
        sim.bbr
            .on_event(&sim.conn, CongestionEvent::CwndRestart, sim.now);
        sim.bbr
            .on_event(&sim.conn, CongestionEvent::CompleteCwr, sim.now);
        // TxStart without app-limiting is not an idle restart.
        sim.conn.app_limited = false;
        sim.bbr
            .on_event(&sim.conn, CongestionEvent::TxStart, sim.now);
        assert_eq!(format!("{:?}", sim.bbr), before);
    }

    #[test]
    fn lt_estimator_locks_policed_rate() {
        let mut sim = Sim::new(false);
        for _ in 0..20 {
            sim.step(ROUND, 500, 0, RTT);
        }
        assert_eq!(sim.bbr.mode, Mode::ProbeBw);
        assert!(!sim.bbr.lt.use_bw);

        // Policed regime: 5 packets delivered, 2 lost per round. Two
        // consecutive 4-round intervals at identical throughput commit the
        // long-term estimate.
        for _ in 0..10 {
            sim.step(ROUND, 5, 2, RTT);
        }
        assert!(sim.bbr.lt.use_bw);
        assert_eq!(sim.bbr.pacing_gain, BBR_UNIT);

        // 15 packets per 150ms interval.
        let expected = 15 * BW_UNIT / 150_000;
        assert_eq!(sim.bbr.bw(), expected);
    }

    #[test]
    fn lt_estimate_expires_after_48_rounds() {
        let mut sim = Sim::new(false);
        for _ in 0..20 {
            sim.step(ROUND, 500, 0, RTT);
        }
        for _ in 0..10 {
            sim.step(ROUND, 5, 2, RTT);
        }
        assert!(sim.bbr.lt.use_bw);

        // The estimate committed on the 8th lossy round, so two of the 48
        // allowed rounds have already elapsed.
        for _ in 0..45 {
            sim.step(ROUND, 5, 2, RTT);
        }
        assert!(sim.bbr.lt.use_bw);
        sim.step(ROUND, 5, 2, RTT);
        assert!(!sim.bbr.lt.use_bw);
        assert_eq!(sim.bbr.mode, Mode::ProbeBw);
    }

    #[test]
    fn probe_rtt_round_trip() {
        let mut sim = Sim::new(true);
        for _ in 0..10 {
            sim.step(ROUND, 500, 0, RTT);
        }
        let cwnd_before = sim.bbr.cwnd;
        assert!(cwnd_before > MIN_CWND_TARGET);

        // Hold the RTT above the estimate so the min_rtt filter expires.
        let stale_rtt = Duration::from_millis(60);
        for _ in 0..220 {
            sim.step(ROUND, 500, 0, stale_rtt);
            if sim.bbr.mode == Mode::ProbeRtt {
                break;
            }
        }
        assert_eq!(sim.bbr.mode, Mode::ProbeRtt);
        assert_eq!(sim.bbr.min_rtt, stale_rtt);

        // Inflight is clamped and both gains are unity while probing.
        assert!(sim.bbr.cwnd <= MIN_CWND_TARGET);
        assert_eq!(sim.bbr.pacing_gain, BBR_UNIT);
        assert_eq!(sim.bbr.cwnd_gain, BBR_UNIT);
        // Samples taken at the dipped inflight are marked app-limited.
        assert!(sim.conn.app_limited);

        // After 200ms and one round at low inflight, the flow returns to
        // PROBE_BW with its cwnd restored.
        sim.conn.packets_in_flight = 4;
        for _ in 0..10 {
            sim.step(ROUND, 4, 0, stale_rtt);
            if sim.bbr.mode != Mode::ProbeRtt {
                break;
            }
        }
        assert_eq!(sim.bbr.mode, Mode::ProbeBw);
        assert!(sim.bbr.cwnd >= 1000);
        assert!(sim.bbr.full_bw_reached());
    }

    #[test]
    fn recovery_conserves_packets_for_one_round() {
        let mut sim = Sim::new(true);
        for _ in 0..10 {
            sim.step(ROUND, 500, 0, RTT);
        }

        // The transport queries ssthresh when recovery starts, which
        // checkpoints the cwnd.
        let ssthresh = sim.bbr.ssthresh(&sim.conn);
        assert!(ssthresh < INFINITE_SSTHRESH);
        let saved_cwnd = sim.bbr.prior_cwnd;
        assert!(saved_cwnd >= 1000);

        sim.conn.ca_state = CaState::Recovery;
        sim.conn.packets_in_flight = 50;
        sim.step(ROUND, 10, 3, RTT);
        assert!(sim.bbr.packet_conservation);
        assert_eq!(sim.bbr.cwnd, 50 + 10);

        // Conservation lasts exactly one packet-timed round.
        sim.step(ROUND, 10, 0, RTT);
        assert!(!sim.bbr.packet_conservation);

        // Exiting recovery restores the checkpointed cwnd, capped by the
        // current BDP target (whose quantization budget moves a little with
        // the gain cycle).
        sim.conn.ca_state = CaState::Open;
        sim.step(ROUND, 10, 0, RTT);
        assert!(sim.bbr.cwnd + 64 >= saved_cwnd);
        assert!(sim.bbr.cwnd >= 1000);
        assert!(!sim.bbr.packet_conservation);
    }

    #[test]
    fn rto_resets_plateau_and_feeds_lt() {
        let mut sim = Sim::new(true);
        for _ in 0..10 {
            sim.step(ROUND, 500, 0, RTT);
        }
        assert!(sim.bbr.full_pipe.bw > 0);

        sim.conn.ca_state = CaState::Loss;
        sim.bbr
            .on_ca_state_change(&sim.conn, CaState::Loss, sim.now);
        assert_eq!(sim.bbr.prev_ca_state, CaState::Loss);
        assert_eq!(sim.bbr.full_pipe.bw, 0);
        assert!(sim.bbr.round_start);
        // The synthetic loss sample opened a long-term sampling interval.
        assert!(sim.bbr.lt.is_sampling);
    }

    #[test]
    fn undo_resets_plateau_and_lt() {
        let mut sim = Sim::new(true);
        for _ in 0..10 {
            sim.step(ROUND, 500, 0, RTT);
        }
        sim.conn.ca_state = CaState::Loss;
        sim.bbr
            .on_ca_state_change(&sim.conn, CaState::Loss, sim.now);
        assert!(sim.bbr.lt.is_sampling);

        let cwnd = sim.bbr.cwnd;
        assert_eq!(sim.bbr.undo_cwnd(&sim.conn), cwnd);
        assert_eq!(sim.bbr.full_pipe.bw, 0);
        assert_eq!(sim.bbr.full_pipe.count, 0);
        assert!(!sim.bbr.lt.is_sampling);
    }

    // Token-bucket link: 1000 packets delivered at 10 pkt/ms while the
    // bucket drains, then 2 pkt/ms goodput with steady loss.
    fn policed_sim() -> Sim {
        let mut sim = Sim::new(true);
        let tick = Duration::from_millis(10);
        let rtt = Duration::from_millis(10);
        for _ in 0..10 {
            sim.step(tick, 100, 0, rtt);
        }
        for _ in 0..600 {
            sim.step(tick, 20, 10, rtt);
            if sim.bbr.detector.as_ref().unwrap().classify == CLASSIFY_RATE_LIMITED {
                break;
            }
        }
        sim
    }

    #[test]
    fn token_bucket_is_detected_and_capped() {
        let mut sim = policed_sim();
        let tick = Duration::from_millis(10);
        let rtt = Duration::from_millis(10);

        {
            let det = sim.bbr.detector.as_ref().unwrap();
            assert_eq!(det.classify, CLASSIFY_RATE_LIMITED);
            assert_eq!(det.upper_bound, CapState::Active);
            assert!(det.best_index > 0);
            assert!(det.best_bucket() > 0);
            assert!(det.best_bucket() <= 1000 * BW_UNIT);
            assert!(det.best_rate() > 0);
        }

        // Introspection carries the detection snapshot.
        let info = sim.bbr.info();
        assert_eq!(info.bw_lo, u64::from(CLASSIFY_RATE_LIMITED));
        assert!(info.min_rtt > 0);
        assert!(info.pacing_gain > 0);
        assert!(info.cwnd_gain > 0);

        // While the cap is engaged and no probe is running, pacing never
        // exceeds the capped rate at gain 1.0.
        for _ in 0..30 {
            sim.step(tick, 20, 10, rtt);
            let det = sim.bbr.detector.as_ref().unwrap();
            if det.cap_engaged() && det.nominator == 0 {
                let cap = rate::bw_to_pacing_rate(det.best_rate(), MSS, BBR_UNIT, u64::MAX);
                assert!(sim.bbr.pacing_rate <= cap);
            }
        }

        // The classification silenced the long-term estimator.
        assert!(!sim.bbr.lt.use_bw);
    }

    #[test]
    fn capped_flow_probes_upward() {
        let mut sim = policed_sim();
        let tick = Duration::from_millis(10);
        let rtt = Duration::from_millis(10);

        // After probe_interval capped rounds, a probe starts: the probe
        // gain engages and the cycle is forced into its high-gain phase.
        let mut probed = false;
        for _ in 0..25 {
            sim.step(tick, 20, 10, rtt);
            let det = sim.bbr.detector.as_ref().unwrap();
            if det.nominator == 1 {
                probed = true;
                assert_eq!(sim.bbr.cycle_idx, 0);
                assert_eq!(sim.bbr.mode, Mode::ProbeBw);
                assert_eq!(det.upper_bound, CapState::Active);
                break;
            }
        }
        assert!(probed);

        // The estimate does not move, so after monitor_period rounds the
        // probe concludes and the cap re-engages.
        for _ in 0..5 {
            sim.step(tick, 20, 10, rtt);
        }
        let det = sim.bbr.detector.as_ref().unwrap();
        assert_eq!(det.nominator, 0);
        assert!(det.cap_engaged());
    }

    #[test]
    fn probe_with_headroom_suspends_cap() {
        let mut sim = policed_sim();
        let tick = Duration::from_millis(10);
        let rtt = Duration::from_millis(10);

        for _ in 0..25 {
            sim.step(tick, 20, 10, rtt);
            if sim.bbr.detector.as_ref().unwrap().nominator == 1 {
                break;
            }
        }
        assert_eq!(sim.bbr.detector.as_ref().unwrap().nominator, 1);

        // Simulate the probe discovering a higher sustained rate.
        {
            let det = sim.bbr.detector.as_mut().unwrap();
            let best = det.best_index;
            det.rate[best] += 1000;
        }
        sim.step(tick, 20, 10, rtt);
        let det = sim.bbr.detector.as_ref().unwrap();
        assert_eq!(det.upper_bound, CapState::Suspended);
        assert_eq!(det.nominator, 0);
        assert!(!det.cap_engaged());
    }

    #[test]
    fn app_limited_exclusion_resets_detection() {
        let mut sim = policed_sim();
        assert_eq!(
            sim.bbr.detector.as_ref().unwrap().classify,
            CLASSIFY_RATE_LIMITED
        );

        sim.bbr.tunables.set_exclude_app_limited(true);
        sim.step_ex(
            Duration::from_millis(10),
            20,
            10,
            Duration::from_millis(10),
            true,
        );

        // The reset remembered the rate-limited classification as reason
        // code 9, visible through introspection.
        assert_eq!(sim.bbr.info().bw_lo, 9);
        assert!(!sim.bbr.detector.as_ref().unwrap().cap_engaged());
    }

    #[test]
    fn plain_bbr_without_detector() {
        let mut sim = Sim::new(false);
        for _ in 0..30 {
            sim.step(ROUND, 500, 0, RTT);
        }
        assert!(sim.bbr.detector.is_none());
        assert_eq!(sim.bbr.mode, Mode::ProbeBw);

        // Introspection reports the raw model.
        let info = sim.bbr.info();
        let bw_bytes = (u64::from(info.bw_hi) << 32) | info.bw_lo;
        let expected = IDEAL_BW * MSS * USEC_PER_SEC >> BW_SCALE;
        assert_eq!(bw_bytes, expected);
        assert_eq!(info.min_rtt, 50_000);
    }
}
