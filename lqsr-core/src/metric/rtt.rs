// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// RTT metric: periodic unicast probe, receiver echoes with its receive
// timestamp, sender EWMAs the round-trip ticks. Missing replies penalize
// the link multiplicatively. A separate hysteresis timer caps how often the
// advertised metric may change.

use super::{MetricConfig, MetricEngine, PathLink, ProbeState, MAXALPHA};
use crate::codec::{ProbeFields, ProbeTail};
use crate::protocol::MetricType;
use lqsr_util::MacAddr;

pub const INFINITE: u32 = 0xFFFF_FFFF;

pub struct RttEngine {
    pub config: MetricConfig,
}

impl MetricEngine for RttEngine {
    fn is_infinite(&self, link_metric: u32) -> bool {
        link_metric == INFINITE
    }

    fn link_to_path_component(&self, link_metric: u32) -> u64 {
        link_metric as u64
    }

    fn path_metric(&self, path: &[PathLink]) -> u64 {
        path.iter().map(|l| l.metric as u64).sum()
    }

    fn init_link_metric(&self, _is_self_originating: bool) -> u32 {
        0
    }

    fn penalize(&self, link_metric: u32) -> u32 {
        if link_metric == INFINITE || self.config.penalty_factor == 0 {
            return INFINITE;
        }
        link_metric.saturating_mul(self.config.penalty_factor).min(INFINITE - 1)
    }

    fn is_active(&self) -> bool {
        true
    }

    fn send_probes(&self, state: &mut ProbeState, self_addr: MacAddr, to: MacAddr, seq: u32, now_ticks: i64) -> Option<ProbeFields> {
        let ProbeState::Rtt(s) = state else { return None };
        if s.outstanding_seq.is_some() {
            return None;
        }
        s.outstanding_seq = Some(seq);
        s.sent_at_ticks = now_ticks;
        Some(ProbeFields { metric_type: MetricType::Rtt.as_u32(), probe_type: 0, seq, timestamp: now_ticks as u64, from: self_addr, to, in_if: 0, out_if: 0, tail: ProbeTail::None })
    }

    fn receive_probe(&self, _state: &mut ProbeState, self_addr: MacAddr, from: MacAddr, fields: &ProbeFields, now_ticks: i64) -> Option<ProbeFields> {
        Some(ProbeFields { metric_type: MetricType::Rtt.as_u32(), probe_type: 1, seq: fields.seq, timestamp: now_ticks as u64, from: self_addr, to: from, in_if: 0, out_if: 0, tail: ProbeTail::None })
    }

    fn receive_probe_reply(&self, state: &mut ProbeState, _self_addr: MacAddr, _from: MacAddr, fields: &ProbeFields, current_metric: u32, now_ticks: i64) -> Option<u32> {
        let ProbeState::Rtt(s) = state else { return None };
        let sample = s.receive_reply(fields.seq, now_ticks)?;
        if !s.hysteresis_permits(now_ticks) {
            return None;
        }
        s.arm_hysteresis(now_ticks, self.config.sweep_period_ticks);
        Some(ewma_update(current_metric, sample, self.config.alpha))
    }
}

/// EWMA a newly measured RTT sample (ticks) into the current metric.
pub fn ewma_update(old_metric: u32, sample_ticks: u32, alpha: u32) -> u32 {
    let alpha = alpha.min(MAXALPHA) as u64;
    (((alpha * sample_ticks as u64) + ((MAXALPHA as u64 - alpha) * old_metric as u64)) / MAXALPHA as u64) as u32
}

/// Per-neighbor RTT sampling state: tracks in-flight probes, lost-probe
/// count, and the hysteresis deadline that throttles metric updates.
pub struct RttProbeState {
    pub outstanding_seq: Option<u32>,
    pub sent_at_ticks: i64,
    pub lost_count: u32,
    pub next_hysteresis_ticks: i64,
}

impl RttProbeState {
    pub fn new() -> Self {
        Self { outstanding_seq: None, sent_at_ticks: 0, lost_count: 0, next_hysteresis_ticks: 0 }
    }

    /// Called from the timer tick: if the outstanding probe's sweep deadline
    /// has passed without a reply, count it lost and clear it.
    pub fn sweep(&mut self, now_ticks: i64, sweep_period_ticks: i64) -> bool {
        if self.outstanding_seq.is_some() && now_ticks >= self.sent_at_ticks + sweep_period_ticks {
            self.outstanding_seq = None;
            self.lost_count += 1;
            true
        } else {
            false
        }
    }

    /// Returns the RTT sample and clears in-flight state if `seq` matches
    /// the outstanding probe; ignores replies to stale sequence numbers.
    pub fn receive_reply(&mut self, seq: u32, now_ticks: i64) -> Option<u32> {
        if self.outstanding_seq == Some(seq) {
            self.outstanding_seq = None;
            Some((now_ticks - self.sent_at_ticks).max(0) as u32)
        } else {
            None
        }
    }

    /// Whether the hysteresis window permits advertising a newly computed
    /// metric right now.
    pub fn hysteresis_permits(&self, now_ticks: i64) -> bool {
        now_ticks >= self.next_hysteresis_ticks
    }

    pub fn arm_hysteresis(&mut self, now_ticks: i64, hysteresis_period_ticks: i64) {
        self.next_hysteresis_ticks = now_ticks + hysteresis_period_ticks;
    }
}

impl Default for RttProbeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_moves_toward_sample() {
        let m0 = 1000;
        let m1 = ewma_update(m0, 2000, 5);
        assert_eq!(m1, (5 * 2000 + 5 * 1000) / 10);
    }

    #[test]
    fn sweep_counts_loss_once() {
        let mut s = RttProbeState::new();
        s.outstanding_seq = Some(1);
        s.sent_at_ticks = 0;
        assert!(s.sweep(1000, 500));
        assert_eq!(s.lost_count, 1);
        assert!(!s.sweep(1500, 500));
    }

    #[test]
    fn stale_reply_is_ignored() {
        let mut s = RttProbeState::new();
        s.outstanding_seq = Some(5);
        s.sent_at_ticks = 0;
        assert_eq!(s.receive_reply(4, 100), None);
        assert_eq!(s.receive_reply(5, 100), Some(100));
        assert_eq!(s.outstanding_seq, None);
    }
}
