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

//! The interface between the transport and the congestion control engine.
//!
//! The transport invokes the engine through a fixed set of event callbacks:
//! one call per delivery rate sample, plus notifications for connection
//! events (restart from idle), congestion-avoidance state changes (entering
//! loss recovery or RTO), and queries for ssthresh, undo and introspection.
//! All callbacks for a given connection are serialized by the transport; no
//! callback blocks or suspends.

use std::fmt;
use std::time::Duration;
use std::time::Instant;

use crate::Config;
pub use bbr::Bbr;

/// The congestion-avoidance state maintained by the transport.
///
/// The ordering matters: states at `Recovery` and above have temporarily cut
/// the congestion window, which decides whether the current cwnd is worth
/// checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CaState {
    /// Normal operation, no outstanding suspicious events.
    Open,

    /// Reordering has been observed, but no loss declared yet.
    Disorder,

    /// The sender is reducing its rate in response to an ECN-style signal.
    Cwr,

    /// Fast recovery after packet loss was declared.
    Recovery,

    /// RTO-based loss recovery.
    Loss,
}

/// Connection events the transport notifies the engine about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionEvent {
    /// First transmit after an idle period.
    TxStart,

    /// The congestion window is being restarted by the transport.
    CwndRestart,

    /// A CWR episode has completed.
    CompleteCwr,

    /// Loss recovery has started.
    Loss,
}

/// A delivery rate sample, generated by the transport for each ACK that
/// advances delivery state.
///
/// Counters are expressed in packets; the transport guarantees they are
/// derived from monotone non-decreasing connection counters.
#[derive(Debug, Clone)]
pub struct RateSample {
    /// Packets marked delivered over the sampling interval.
    pub delivered: u64,

    /// The connection's delivered count at the transmit time of the packet
    /// most recently marked delivered.
    pub prior_delivered: u64,

    /// Packets newly marked lost while processing this ACK.
    pub losses: u64,

    /// Packets newly ACKed or SACKed by this ACK.
    pub acked_sacked: u64,

    /// Whether the sample was taken while the sender was limited by the
    /// application rather than the network.
    pub is_app_limited: bool,

    /// Whether the ACK closing this sample appears to have been delayed.
    pub is_ack_delayed: bool,

    /// The length of the sampling interval. A zero interval marks an invalid
    /// observation which the engine must skip.
    pub interval: Duration,

    /// The RTT measured by this sample. Zero means no RTT was measurable.
    pub rtt: Duration,

    /// Packets that were in flight before this ACK was processed.
    pub prior_in_flight: u64,
}

impl RateSample {
    /// Whether this sample carries a valid observation.
    pub fn is_valid(&self) -> bool {
        !self.interval.is_zero()
    }
}

impl Default for RateSample {
    fn default() -> Self {
        Self {
            delivered: 0,
            prior_delivered: 0,
            losses: 0,
            acked_sacked: 0,
            is_app_limited: false,
            is_ack_delayed: false,
            interval: Duration::ZERO,
            rtt: Duration::ZERO,
            prior_in_flight: 0,
        }
    }
}

/// Connection-wide scalars the engine reads on each callback.
///
/// `app_limited` is read-write: while holding inflight low in PROBE_RTT the
/// engine marks the connection app-limited so that the transport's delivery
/// rate estimator discards the artificially low samples.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Total packets marked delivered over the connection lifetime.
    pub delivered: u64,

    /// The wall clock time when `delivered` was last updated.
    pub delivered_time: Instant,

    /// Total packets marked lost over the connection lifetime.
    pub lost: u64,

    /// Total bytes cumulatively acknowledged.
    pub bytes_acked: u64,

    /// The lowest unacknowledged byte sequence number.
    pub snd_una: u64,

    /// Maximum segment size in bytes, stable for the connection lifetime.
    pub mss: u64,

    /// Smoothed RTT. Zero means no RTT sample has been taken yet.
    pub srtt: Duration,

    /// Packets currently in flight.
    pub packets_in_flight: u64,

    /// Hard upper bound on the congestion window, in packets.
    pub cwnd_clamp: u64,

    /// Whether the sender is currently application-limited.
    pub app_limited: bool,

    /// Whether the sender is currently limited by the peer's receive window.
    pub rwnd_limited: bool,

    /// The transport's current congestion-avoidance state.
    pub ca_state: CaState,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            delivered: 0,
            delivered_time: Instant::now(),
            lost: 0,
            bytes_acked: 0,
            snd_una: 0,
            mss: crate::DEFAULT_MSS,
            srtt: Duration::ZERO,
            packets_in_flight: 0,
            cwnd_clamp: u64::MAX,
            app_limited: false,
            rwnd_limited: false,
            ca_state: CaState::Open,
        }
    }
}

/// Read-only export of the engine's model and detection state.
///
/// When the rate-limit detector has locked onto a policer (`bw_lo == 1`) the
/// remaining fields are repurposed to carry the detection snapshot: `bw_hi`
/// holds the detection latency in milliseconds, `min_rtt` the bytes acked at
/// detection time, `pacing_gain` the best bucket estimate in KiB and
/// `cwnd_gain` the best sustained-rate estimate in bytes per second. In all
/// other detector states `bw_lo` carries the raw classification code and the
/// remaining fields are zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub bw_lo: u64,
    pub bw_hi: u64,
    pub min_rtt: u64,
    pub pacing_gain: u64,
    pub cwnd_gain: u64,
}

/// Congestion control callbacks invoked by the transport.
pub trait CongestionController {
    /// Name of the congestion control algorithm.
    fn name(&self) -> &str;

    /// Main control entry, invoked once per delivery rate sample after the
    /// transport has updated the connection counters.
    fn on_sample(&mut self, conn: &mut ConnectionState, sample: &RateSample, now: Instant);

    /// Connection event notification.
    fn on_event(&mut self, conn: &ConnectionState, event: CongestionEvent, now: Instant);

    /// Congestion-avoidance state change notification.
    fn on_ca_state_change(&mut self, conn: &ConnectionState, new_state: CaState, now: Instant);

    /// Slow start threshold, queried when the transport enters loss recovery.
    fn ssthresh(&mut self, conn: &ConnectionState) -> u64;

    /// Congestion window to apply when the transport undoes a spurious loss
    /// event.
    fn undo_cwnd(&mut self, conn: &ConnectionState) -> u64;

    /// Current congestion window in packets.
    fn congestion_window(&self) -> u64;

    /// Current pacing rate in bytes per second.
    fn pacing_rate(&self) -> u64;

    /// Segments the transport should aggregate per transmit burst.
    fn tso_segs_goal(&self, conn: &ConnectionState) -> u64;

    /// Multiplier for send buffer provisioning.
    fn sndbuf_expand(&self) -> u64 {
        2
    }

    /// Read-only snapshot of model and detection scalars.
    fn info(&self) -> ControllerInfo;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller.")
    }
}

/// Build a congestion controller from the given configuration.
pub fn build_congestion_controller(conf: &Config) -> Box<dyn CongestionController> {
    Box::new(Bbr::new(conf.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_controller() -> crate::Result<()> {
        let config = Config::new()?;

        let cc = build_congestion_controller(&config);
        assert_eq!(cc.name(), "BBR");
        assert_eq!(cc.congestion_window(), config.initial_congestion_window);
        assert!(cc.pacing_rate() > 0);
        assert_eq!(cc.sndbuf_expand(), 3);
        assert_eq!(format!("{:?}", cc), "congestion controller.");
        Ok(())
    }

    #[test]
    fn rate_sample_validity() {
        let mut rs = RateSample::default();
        assert_eq!(rs.is_valid(), false);

        rs.interval = Duration::from_millis(10);
        assert_eq!(rs.is_valid(), true);
    }

    #[test]
    fn ca_state_ordering() {
        assert!(CaState::Open < CaState::Recovery);
        assert!(CaState::Disorder < CaState::Recovery);
        assert!(CaState::Recovery < CaState::Loss);
    }
}

mod bbr;
mod minmax;
mod rate;
mod ratelimit;
