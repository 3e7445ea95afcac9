// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// ETX (Expected Transmission Count) metric: periodic broadcast probes let
// each neighbor compute forward and reverse delivery ratios; the resulting
// loss probability EWMAs into the link metric. Grounded on sys/etx.c's
// steady-state and penalty update branches.

use std::collections::VecDeque;

use super::{MetricEngine, PathLink, ProbeState, LOSS_SCALE, MAXALPHA};
use crate::codec::{EtxEntry, ProbeFields, ProbeTail};
use crate::protocol::MetricType;
use lqsr_util::MacAddr;

pub const MAX_ETX_ENTRIES: usize = 40;

pub struct EtxEngine {
    pub config: super::MetricConfig,
}

impl EtxEngine {
    fn is_infinite_loss(&self, loss_prob: u32) -> bool {
        loss_prob >= LOSS_SCALE - 1
    }
}

impl MetricEngine for EtxEngine {
    fn is_infinite(&self, link_metric: u32) -> bool {
        self.is_infinite_loss(link_metric)
    }

    /// Converts a loss probability (scaled by LOSS_SCALE) into an expected
    /// transmission count, also scaled by LOSS_SCALE, for path summation.
    fn link_to_path_component(&self, link_metric: u32) -> u64 {
        if self.is_infinite_loss(link_metric) {
            return u64::MAX;
        }
        let loss = link_metric.min(LOSS_SCALE - 1) as u64;
        (LOSS_SCALE as u64 * LOSS_SCALE as u64) / (LOSS_SCALE as u64 - loss)
    }

    fn path_metric(&self, path: &[PathLink]) -> u64 {
        path.iter().map(|l| self.link_to_path_component(l.metric)).fold(0u64, |acc, c| acc.saturating_add(c))
    }

    fn init_link_metric(&self, _is_self_originating: bool) -> u32 {
        0
    }

    /// A lost probe round degrades the success probability by the
    /// configured penalty factor rather than jumping straight to unusable,
    /// then feeds back through the same EWMA as a steady-state sample.
    fn penalize(&self, link_metric: u32) -> u32 {
        let loss_prob = link_metric.min(LOSS_SCALE - 1);
        let success_prob = ((LOSS_SCALE - loss_prob) / self.config.penalty_factor.max(1)).max(1);
        let new_loss = LOSS_SCALE - success_prob;
        ewma_update(link_metric, new_loss, self.config.alpha)
    }

    fn is_active(&self) -> bool {
        true
    }

    fn send_probes(&self, state: &mut ProbeState, self_addr: MacAddr, to: MacAddr, seq: u32, now_ticks: i64) -> Option<ProbeFields> {
        let ProbeState::Etx(history) = state else { return None };
        let expected = expected_num_probes(self.config.loss_interval_ticks, self.config.probe_period_ticks);
        let rcvd = history.count_in_window(seq.wrapping_sub(expected));
        Some(ProbeFields {
            metric_type: MetricType::Etx.as_u32(),
            probe_type: 0,
            seq,
            timestamp: now_ticks as u64,
            from: self_addr,
            to,
            in_if: 0,
            out_if: 0,
            tail: ProbeTail::Etx { entries: vec![EtxEntry { from: to, out_if: 0, in_if: 0, rcvd }] },
        })
    }

    fn receive_probe(&self, state: &mut ProbeState, self_addr: MacAddr, from: MacAddr, fields: &ProbeFields, now_ticks: i64) -> Option<ProbeFields> {
        let ProbeState::Etx(history) = state else { return None };
        history.record_received(fields.seq);
        let expected = expected_num_probes(self.config.loss_interval_ticks, self.config.probe_period_ticks);
        let rcvd = history.count_in_window(fields.seq.wrapping_sub(expected));
        Some(ProbeFields {
            metric_type: MetricType::Etx.as_u32(),
            probe_type: 1,
            seq: fields.seq,
            timestamp: now_ticks as u64,
            from: self_addr,
            to: from,
            in_if: 0,
            out_if: 0,
            tail: ProbeTail::Etx { entries: vec![EtxEntry { from, out_if: 0, in_if: 0, rcvd }] },
        })
    }

    fn receive_probe_reply(&self, state: &mut ProbeState, _self_addr: MacAddr, from: MacAddr, fields: &ProbeFields, current_metric: u32, _now_ticks: i64) -> Option<u32> {
        let ProbeState::Etx(history) = state else { return None };
        history.record_received(fields.seq);
        let ProbeTail::Etx { entries } = &fields.tail else { return None };
        let fwd_delivered = entries.iter().find(|e| e.from == from).map(|e| e.rcvd)?;
        let expected = expected_num_probes(self.config.loss_interval_ticks, self.config.probe_period_ticks);
        let rev_delivered = history.count_in_window(fields.seq.wrapping_sub(expected));
        let sample = steady_state_loss_prob(fwd_delivered, rev_delivered, expected);
        Some(ewma_update(current_metric, sample, self.config.alpha))
    }
}

/// EWMA a new loss-probability sample into the current one, clamped to
/// `LOSS_SCALE - 1` so a link is never reported as perfectly unusable from
/// rounding alone.
pub fn ewma_update(old_loss_prob: u32, new_sample: u32, alpha: u32) -> u32 {
    let alpha = alpha.min(MAXALPHA) as u64;
    let v = ((alpha * new_sample as u64) + ((MAXALPHA as u64 - alpha) * old_loss_prob as u64)) / MAXALPHA as u64;
    (v as u32).min(LOSS_SCALE - 1)
}

/// Steady-state sample: both delivery ratios are known precisely from
/// counting probes actually received over the window.
pub fn steady_state_loss_prob(fwd_delivered: u32, rev_delivered: u32, num_probes: u32) -> u32 {
    if num_probes == 0 {
        return LOSS_SCALE - 1;
    }
    let success = (LOSS_SCALE as u64 * fwd_delivered as u64 * rev_delivered as u64) / (num_probes as u64 * num_probes as u64);
    let success = success.min(LOSS_SCALE as u64) as u32;
    (LOSS_SCALE - success).min(LOSS_SCALE - 1)
}

/// Number of probes expected within one loss-measurement interval, per
/// sys/etx.c: probes arrive every `probePeriod + probePeriod/8` ticks
/// (the `/8` models scheduling jitter tolerance).
pub fn expected_num_probes(loss_interval_ticks: i64, probe_period_ticks: i64) -> u32 {
    if probe_period_ticks <= 0 {
        return 0;
    }
    let spacing = probe_period_ticks + probe_period_ticks / 8;
    (loss_interval_ticks / spacing.max(1)).max(1) as u32
}

/// Per-neighbor rolling count of probes received, used to compute the
/// steady-state forward/reverse delivery ratios.
pub struct EtxProbeHistory {
    received_seqs: VecDeque<u32>,
}

impl EtxProbeHistory {
    pub fn new() -> Self {
        Self { received_seqs: VecDeque::with_capacity(MAX_ETX_ENTRIES) }
    }

    pub fn record_received(&mut self, seq: u32) {
        if self.received_seqs.len() == MAX_ETX_ENTRIES {
            self.received_seqs.pop_front();
        }
        self.received_seqs.push_back(seq);
    }

    pub fn count_in_window(&self, window_start_seq: u32) -> u32 {
        self.received_seqs.iter().filter(|&&s| s.wrapping_sub(window_start_seq) < (u32::MAX / 2)).count() as u32
    }
}

impl Default for EtxProbeHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricConfig;
    use crate::protocol::MetricType;

    fn engine() -> EtxEngine {
        EtxEngine { config: MetricConfig::default_for(MetricType::Etx) }
    }

    #[test]
    fn path_component_of_zero_loss_is_one_unit() {
        let e = engine();
        assert_eq!(e.link_to_path_component(0), LOSS_SCALE as u64);
    }

    #[test]
    fn higher_loss_yields_higher_path_component() {
        let e = engine();
        assert!(e.link_to_path_component(2048) > e.link_to_path_component(0));
    }

    #[test]
    fn steady_state_zero_delivery_is_full_loss() {
        assert_eq!(steady_state_loss_prob(0, 10, 10), LOSS_SCALE - 1);
    }

    #[test]
    fn steady_state_perfect_delivery_is_zero_loss() {
        assert_eq!(steady_state_loss_prob(10, 10, 10), 0);
    }

    #[test]
    fn penalize_degrades_toward_full_loss_over_repeated_calls() {
        let e = engine();
        let mut m = 0u32;
        for _ in 0..20 {
            m = e.penalize(m);
        }
        assert!(m > 0);
    }
}
