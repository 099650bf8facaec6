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

//! Token-bucket rate-limit estimation.
//!
//! Token-bucket shapers admit a burst of B packets and then sustain a rate R;
//! from the sender's viewpoint a transfer over such a link shows a fast
//! lossless phase while the bucket drains, followed by sustained loss at a
//! consistent lower throughput. The estimator watches the delivery and loss
//! counters for the moment the bucket empties, then fits a grid of candidate
//! `(bucket, rate)` pairs against the observed delivery curve: a candidate
//! assigns fraction `p` of the pre-loss delivery to the bucket and explains
//! the rest with its sustained rate. Candidates whose predictions cannot be
//! told apart over the observed flow length are skipped; the first
//! distinguishable one wins.
//!
//! Once the winning pair has been stable for long enough and the post-empty
//! rate is abruptly below the pre-empty goodput, the link is classified as
//! rate-limited and the pacing cap may engage. The grid brackets the truth
//! from both sides: when the winner keeps landing on the largest-bucket
//! candidate the grid is shifted to synthesize an even larger one.

use std::time::Duration;
use std::time::Instant;

use super::rate::BASED_SCALE;
use super::rate::BASED_UNIT;
use super::rate::BW_UNIT;
use super::ConnectionState;

/// Number of candidate `(bucket, rate)` pairs in the grid.
pub(crate) const GRID_LEN: usize = 9;

/// Fraction of the pre-loss delivery each candidate assigns to the bucket,
/// scaled by `BW_UNIT`. The terminal zero entry acts as a sentinel that the
/// selection loop passes over.
const PERCENT: [u64; GRID_LEN] = [
    BW_UNIT,
    BW_UNIT * 7 / 8,
    BW_UNIT * 6 / 8,
    BW_UNIT * 5 / 8,
    BW_UNIT * 4 / 8,
    BW_UNIT * 3 / 8,
    BW_UNIT * 2 / 8,
    BW_UNIT / 8,
    0,
];

/// A sustained rate at or below this fraction (scaled by `BASED_UNIT`) of
/// the pre-empty goodput counts as an abrupt decrease.
const ABRUPT_DECREASE_THRESH: u64 = 150;

/// Sustained loss must last this many min-RTTs before the estimator arms.
const LOSS_SUSTAIN_RTTS: u32 = 7;

/// The winning candidate must stay unchanged this many min-RTTs before the
/// link is classified as rate-limited.
const CLASSIFY_STABLE_RTTS: u32 = 10;

/// Append a history snapshot every this many samples.
const STORE_INTERVAL: u32 = 400;

/// Bound on the in-memory history string.
const MAX_HISTORY_LEN: usize = 5000;

/// The link has not been classified yet.
pub(crate) const CLASSIFY_NONE: u8 = 0;

/// The link is rate-limited; the cap may engage.
pub(crate) const CLASSIFY_RATE_LIMITED: u8 = 1;

/// Classification was withdrawn; the estimator quiesces.
pub(crate) const CLASSIFY_DISABLED: u8 = 2;

/// State of the pacing-rate cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CapState {
    /// No cap has ever engaged.
    Off,

    /// The pacing rate is capped at the best sustained-rate estimate.
    Active,

    /// A probe found new headroom; the cap is suspended while the estimate
    /// settles.
    Suspended,
}

/// Action requested from the state machine after per-round probe accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeAction {
    None,

    /// Begin an upward probe: force the high-gain phase of the pacing cycle.
    Start,
}

/// Per-connection token-bucket estimator state.
#[derive(Debug)]
pub(crate) struct RateLimitEstimator {
    /// Candidate bucket sizes, in packets scaled by `BW_UNIT`, largest
    /// first.
    pub(crate) bucket: [u64; GRID_LEN],

    /// Candidate sustained rates, in packets per microsecond scaled by
    /// `BW_UNIT`.
    pub(crate) rate: [u64; GRID_LEN],

    /// Index of the current best candidate.
    pub(crate) best_index: usize,

    /// Classification code: 0 unclassified, 1 rate-limited, 2 withdrawn;
    /// codes 5..=10 remember a pre-reset classification for diagnostics.
    pub(crate) classify: u8,

    /// When the current winning candidate was first seen, for the stability
    /// timer.
    classify_time: Option<Instant>,

    /// Whether a sustained-loss event has been confirmed.
    high_loss: bool,

    /// When the loss counter first advanced in this epoch.
    loss_start_time: Option<Instant>,

    /// Delivery metric just before the bucket emptied, relative to the
    /// epoch start.
    before_loss_delivered: u64,

    /// Time of the last sample on which the loss counter had not advanced.
    before_loss_time: Option<Instant>,

    /// Loss counter just before the bucket emptied, relative to the epoch
    /// start.
    before_loss_lost: u64,

    /// Origin of this detection epoch.
    start_time: Instant,

    /// Goodput sampled just before the bucket emptied, scaled by `BW_UNIT`.
    bef_empty_goodput: u64,

    /// Non-zero while an upward probe is applying the probe gain.
    pub(crate) nominator: u64,

    /// Loss counter observed on the previous sample.
    last_ack_lost: u64,

    /// Time from epoch start to classification.
    pub(crate) detected_time: Duration,

    /// Connection bytes acked at classification time.
    pub(crate) detected_bytes_acked: u64,

    /// Set when classification was withdrawn; the estimator stops updating.
    disabled: bool,

    /// Best candidate remembered across probe rounds.
    mem_bucket: u64,
    mem_rate: u64,

    /// Cap state.
    pub(crate) upper_bound: CapState,

    /// Rounds spent capped since the last probe.
    round_count: u64,

    /// Rounds spent in the current probe or with the cap suspended.
    round_count_no: u64,

    /// Delivered count ending the estimator's current packet-timed round.
    next_round_delivered: u64,

    /// Whether this sample started a new estimator round.
    round_start: bool,

    /// Delivery metric at the epoch start.
    transfer_start_delivered: u64,

    /// Loss counter at the epoch start.
    transfer_start_lost: u64,

    /// One-shot: the long-term estimator is reset on first classification.
    reset_ltbw_done: bool,

    /// Periodic snapshots of the detection state, logged at teardown.
    history: String,

    /// Samples since the last history snapshot.
    samples_since_store: u32,
}

impl RateLimitEstimator {
    pub(crate) fn new(now: Instant, conn: &ConnectionState, use_goodput: bool) -> Self {
        Self {
            bucket: [0; GRID_LEN],
            rate: [0; GRID_LEN],
            best_index: 0,
            classify: CLASSIFY_NONE,
            classify_time: None,
            high_loss: false,
            loss_start_time: None,
            before_loss_delivered: 0,
            before_loss_time: None,
            before_loss_lost: 0,
            start_time: now,
            bef_empty_goodput: 0,
            nominator: 0,
            last_ack_lost: conn.lost,
            detected_time: Duration::ZERO,
            detected_bytes_acked: 0,
            disabled: false,
            mem_bucket: 0,
            mem_rate: 0,
            upper_bound: CapState::Off,
            round_count: 0,
            round_count_no: 0,
            next_round_delivered: 0,
            round_start: false,
            transfer_start_delivered: Self::delivery_metric(conn, use_goodput),
            transfer_start_lost: conn.lost,
            reset_ltbw_done: false,
            history: String::new(),
            samples_since_store: 0,
        }
    }

    /// The delivery counter used by the estimator: either the transport's
    /// delivered count or the cumulatively acked sequence in segments.
    fn delivery_metric(conn: &ConnectionState, use_goodput: bool) -> u64 {
        if use_goodput {
            conn.snd_una / conn.mss.max(1)
        } else {
            conn.delivered
        }
    }

    /// Delivery metric relative to the epoch start.
    fn cur_delivered(&self, conn: &ConnectionState, use_goodput: bool) -> u64 {
        Self::delivery_metric(conn, use_goodput).saturating_sub(self.transfer_start_delivered)
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub(crate) fn best_bucket(&self) -> u64 {
        self.bucket[self.best_index]
    }

    pub(crate) fn best_rate(&self) -> u64 {
        self.rate[self.best_index]
    }

    /// Whether the pacing rate must be capped at the best sustained-rate
    /// estimate.
    pub(crate) fn cap_engaged(&self) -> bool {
        self.classify == CLASSIFY_RATE_LIMITED && self.upper_bound == CapState::Active
    }

    /// Restart the detection epoch after an idle period: delivery before the
    /// restart tells us nothing about the bucket.
    pub(crate) fn on_tx_start(&mut self, now: Instant, conn: &ConnectionState, use_goodput: bool) {
        self.start_time = now;
        self.transfer_start_lost = conn.lost;
        self.transfer_start_delivered = Self::delivery_metric(conn, use_goodput);
    }

    /// Reset the estimator, remembering the prior classification as a reason
    /// code: `res1` replaces a rate-limited classification, `res2` a
    /// withdrawn one, and previously remembered codes carry through.
    pub(crate) fn reset(
        &mut self,
        now: Instant,
        conn: &ConnectionState,
        use_goodput: bool,
        res1: u8,
        res2: u8,
    ) {
        let flag = self.classify;
        let history = std::mem::take(&mut self.history);
        *self = Self::new(now, conn, use_goodput);
        self.history = history;
        self.classify = match flag {
            CLASSIFY_RATE_LIMITED => res1,
            CLASSIFY_DISABLED => res2,
            other => other,
        };
    }

    /// Track the loss counter between samples.
    ///
    /// Until the first loss of the epoch, every sample on which the counter
    /// did not advance refreshes the "bucket still non-empty" snapshot; the
    /// first advance pins the loss start time.
    pub(crate) fn track_loss(&mut self, now: Instant, conn: &ConnectionState, use_goodput: bool) {
        if self.last_ack_lost != conn.lost {
            if !self.high_loss && self.loss_start_time.is_none() {
                self.loss_start_time = Some(now);
            }
        } else if !self.high_loss && self.loss_start_time.is_none() {
            self.before_loss_delivered = self.cur_delivered(conn, use_goodput);
            self.before_loss_time = Some(now);
            self.before_loss_lost = conn.lost.saturating_sub(self.transfer_start_lost);
        }
        self.last_ack_lost = conn.lost;
    }

    /// Force the estimator's round to restart at the given delivered count.
    pub(crate) fn start_round(&mut self, conn_delivered: u64) {
        self.next_round_delivered = conn_delivered;
    }

    /// Advance the estimator's packet-timed round on a valid sample.
    pub(crate) fn update_round(&mut self, conn_delivered: u64, prior_delivered: u64, valid: bool) {
        self.round_start = false;
        if prior_delivered >= self.next_round_delivered && valid {
            self.next_round_delivered = conn_delivered;
            self.round_start = true;
        }
    }

    /// Run the per-sample estimation and classification pass.
    ///
    /// Returns true when the long-term bandwidth estimator must be reset
    /// (one-shot, on the first classification).
    pub(crate) fn estimate(
        &mut self,
        now: Instant,
        min_rtt_us: Option<u64>,
        conn: &ConnectionState,
        use_goodput: bool,
    ) -> bool {
        let mut reset_lt = false;

        let min_rtt_us = match min_rtt_us {
            Some(v) => v,
            None => return false,
        };

        let cur_delivered = self.cur_delivered(conn, use_goodput);
        let cur_lost = conn.lost.saturating_sub(self.transfer_start_lost);

        if !self.high_loss {
            let armed = match self.loss_start_time {
                Some(start) => {
                    now.saturating_duration_since(start).as_micros() as u64
                        > u64::from(LOSS_SUSTAIN_RTTS) * min_rtt_us
                }
                None => false,
            };
            if !armed {
                return false;
            }

            let d = cur_delivered.saturating_sub(self.before_loss_delivered);
            let l = cur_lost.saturating_sub(self.before_loss_lost);
            if d + l == 0 || l * 10 <= (d + l) * 2 {
                // Loss was transient; wait for the next loss run.
                self.loss_start_time = None;
                return false;
            }
            self.high_loss = true;

            let bef_elapsed_us = match self.before_loss_time {
                Some(t) => t.saturating_duration_since(self.start_time).as_micros() as u64,
                None => 0,
            };
            if bef_elapsed_us < 1000 {
                return false;
            }

            self.bef_empty_goodput = self.before_loss_delivered * BW_UNIT / bef_elapsed_us;
            self.seed_candidates(bef_elapsed_us);
        }

        let elapsed_us = now.saturating_duration_since(self.start_time).as_micros() as u64;
        if elapsed_us < 1000 {
            return false;
        }

        // Refine the sustained-rate estimates: any delivery beyond a
        // candidate's bucket must have come from its sustained rate.
        for i in 0..GRID_LEN {
            if cur_delivered * BW_UNIT > self.bucket[i] {
                let excess = cur_delivered * BW_UNIT - self.bucket[i];
                self.rate[i] = self.rate[i].max(excess / elapsed_us);
            }
        }

        let mut best = self.comp(elapsed_us);
        while best == 0 {
            self.extend_grid(cur_delivered, elapsed_us);
            best = self.comp(elapsed_us);
        }
        self.best_index = best;

        // The sustained rate must be well below the pre-empty goodput for a
        // token bucket to be a plausible explanation.
        let abrupt_decrease =
            self.rate[best] * BASED_UNIT <= ABRUPT_DECREASE_THRESH * self.bef_empty_goodput;

        if self.classify == CLASSIFY_RATE_LIMITED {
            if !abrupt_decrease {
                self.classify = CLASSIFY_DISABLED;
                self.disabled = true;
            }
        } else if self.high_loss && abrupt_decrease {
            if self.classify_time.is_none() {
                self.classify_time = Some(now);
            }
            if !self.reset_ltbw_done {
                reset_lt = true;
                self.reset_ltbw_done = true;
            }

            if self.rate[best] != self.mem_rate || self.bucket[best] != self.mem_bucket {
                self.classify_time = Some(now);
                self.mem_bucket = self.bucket[best];
                self.mem_rate = self.rate[best];
            } else if let Some(since) = self.classify_time {
                if now.saturating_duration_since(since).as_micros() as u64
                    > u64::from(CLASSIFY_STABLE_RTTS) * min_rtt_us
                {
                    self.classify = CLASSIFY_RATE_LIMITED;
                    self.upper_bound = CapState::Active;
                    self.detected_time = now.saturating_duration_since(self.start_time);
                    self.detected_bytes_acked = conn.bytes_acked;
                }
            }
        } else {
            self.classify_time = None;
        }

        reset_lt
    }

    /// Populate the candidate grid from the pre-empty snapshot.
    ///
    /// Candidate i assigns fraction `PERCENT[i]` of the pre-loss delivery to
    /// the bucket; the remainder is scaled down to a lower bound so that the
    /// grid brackets the truth from below as well.
    fn seed_candidates(&mut self, bef_elapsed_us: u64) {
        let lower_bound = self.before_loss_delivered * (BASED_UNIT - ABRUPT_DECREASE_THRESH);
        for i in 0..GRID_LEN {
            if PERCENT[i] == 0 {
                self.bucket[i] = 0;
            } else {
                let rest = ((BW_UNIT - PERCENT[i]) * lower_bound) >> BASED_SCALE;
                self.bucket[i] = self.before_loss_delivered * PERCENT[i] + rest;
            }
        }
        for i in 0..GRID_LEN {
            if self.before_loss_delivered * BW_UNIT > self.bucket[i] {
                let excess = self.before_loss_delivered * BW_UNIT - self.bucket[i];
                self.rate[i] = self.rate[i].max(excess / bef_elapsed_us);
            }
        }
    }

    /// The observed delivery outgrew every candidate: shift the grid towards
    /// larger buckets, dropping the smallest entry and synthesizing a new
    /// largest one with an empty rate estimate.
    fn extend_grid(&mut self, cur_delivered: u64, elapsed_us: u64) {
        let incr = self.bucket[0].saturating_sub(self.bucket[1]);
        for i in (1..GRID_LEN).rev() {
            self.bucket[i] = self.bucket[i - 1];
            self.rate[i] = self.rate[i - 1];
        }
        self.bucket[0] += incr;
        self.rate[0] = 0;

        if cur_delivered * BW_UNIT > self.bucket[0] {
            let excess = cur_delivered * BW_UNIT - self.bucket[0];
            self.rate[0] = self.rate[0].max(excess / elapsed_us);
        }
        if self.before_loss_delivered * BW_UNIT > self.bucket[0] {
            if let Some(t) = self.before_loss_time {
                let bef_elapsed_us = t.saturating_duration_since(self.start_time).as_micros() as u64;
                if bef_elapsed_us > 0 {
                    let excess = self.before_loss_delivered * BW_UNIT - self.bucket[0];
                    self.rate[0] = self.rate[0].max(excess / bef_elapsed_us);
                }
            }
        }
    }

    /// Select the best candidate: walk the grid while neighbours cannot be
    /// distinguished over the observed flow length, stop at the first
    /// distinguishable one.
    fn comp(&self, flow_len_us: u64) -> usize {
        let mut best = 0;
        for i in 1..GRID_LEN {
            let b_diff = self.bucket[i].abs_diff(self.bucket[best]);
            let r_diff = self.rate[i].abs_diff(self.rate[best]);
            if r_diff == 0 {
                best = i;
            } else if b_diff * u64::from(BASED_SCALE) * 2 / r_diff
                > flow_len_us * u64::from(BASED_SCALE)
            {
                best = i;
            } else {
                break;
            }
        }
        best
    }

    /// Per-round cap and probe accounting. Only meaningful while the link is
    /// classified as rate-limited and the optimizer is enabled.
    pub(crate) fn probe(
        &mut self,
        conn_delivered: u64,
        probe_interval: u64,
        monitor_period: u64,
        optimize: bool,
    ) -> ProbeAction {
        if self.classify != CLASSIFY_RATE_LIMITED || !optimize {
            return ProbeAction::None;
        }

        if self.upper_bound != CapState::Active || self.nominator != 0 {
            // A probe (or a suspended cap) is in progress: give the estimate
            // `monitor_period` rounds to move. If it does not, the probe
            // found no new capacity and the cap re-engages.
            if self.round_start {
                self.round_count_no += 1;
                if self.round_count_no >= monitor_period
                    && self.mem_bucket == self.best_bucket()
                    && self.mem_rate == self.best_rate()
                {
                    self.upper_bound = CapState::Active;
                    self.nominator = 0;
                    self.round_count_no = 0;
                }
            }
            if self.mem_bucket != self.best_bucket() || self.mem_rate != self.best_rate() {
                // New headroom was found: suspend the cap and let the
                // estimate settle.
                self.upper_bound = CapState::Suspended;
                self.nominator = 0;
                self.mem_bucket = self.best_bucket();
                self.mem_rate = self.best_rate();
                self.round_count_no = 0;
                self.next_round_delivered = conn_delivered;
            }
            ProbeAction::None
        } else if self.round_start {
            self.round_count += 1;
            if self.round_count >= probe_interval {
                self.upper_bound = CapState::Active;
                self.nominator = 1;
                self.mem_bucket = self.best_bucket();
                self.mem_rate = self.best_rate();
                self.round_count = 0;
                self.round_count_no = 0;
                return ProbeAction::Start;
            }
            ProbeAction::None
        } else {
            ProbeAction::None
        }
    }

    /// Append a periodic snapshot of the detection state to the history.
    pub(crate) fn store_snapshot(&mut self, bytes_acked: u64) {
        self.samples_since_store += 1;
        if self.samples_since_store < STORE_INTERVAL {
            return;
        }
        self.samples_since_store = 0;

        let entry = format!(
            "{};{};{};{}-",
            bytes_acked,
            self.classify,
            self.best_bucket(),
            self.best_rate()
        );
        if self.history.len() + entry.len() < MAX_HISTORY_LEN {
            self.history.push_str(&entry);
        }
    }

    /// The accumulated history snapshots, logged at teardown.
    pub(crate) fn history(&self) -> &str {
        &self.history
    }
}
