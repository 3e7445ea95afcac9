// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Packet-pair metric: two probes are sent back-to-back; the receiver times
// the gap between their arrivals, which approximates the bottleneck link's
// transmit rate. The link metric is the minimum gap observed over a rolling
// window, per PktPairMinOverProbes.

use std::collections::VecDeque;

use super::{MetricEngine, PathLink, ProbeState};
use crate::codec::{ProbeFields, ProbeTail};
use crate::protocol::MetricType;
use lqsr_util::MacAddr;

pub const INFINITE: u32 = 0xFFFF_FFFF;
pub const MAX_PKTPAIR_HISTORY: usize = 30;

pub struct PktPairEngine {
    pub config: super::MetricConfig,
}

impl MetricEngine for PktPairEngine {
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
        INFINITE
    }

    fn penalize(&self, link_metric: u32) -> u32 {
        if link_metric == INFINITE {
            return INFINITE;
        }
        link_metric.saturating_mul(2).min(INFINITE - 1)
    }

    fn is_active(&self) -> bool {
        true
    }

    fn send_probes(&self, state: &mut ProbeState, self_addr: MacAddr, to: MacAddr, seq: u32, now_ticks: i64) -> Option<ProbeFields> {
        let ProbeState::PktPair(_) = state else { return None };
        Some(ProbeFields {
            metric_type: MetricType::PktPair.as_u32(),
            probe_type: 0,
            seq,
            timestamp: now_ticks as u64,
            from: self_addr,
            to,
            in_if: 0,
            out_if: 0,
            tail: ProbeTail::PktPair { out_delta: 0 },
        })
    }

    /// The gap between this probe's arrival and the prior one is the
    /// sample; it's reported back to the sender in the reply, since the
    /// sender (not the receiver) owns the rolling window for this link.
    fn receive_probe(&self, state: &mut ProbeState, self_addr: MacAddr, from: MacAddr, fields: &ProbeFields, now_ticks: i64) -> Option<ProbeFields> {
        let ProbeState::PktPair(w) = state else { return None };
        let gap = (now_ticks as u64).saturating_sub(fields.timestamp).min(u32::MAX as u64) as u32;
        w.record_gap(gap);
        Some(ProbeFields {
            metric_type: MetricType::PktPair.as_u32(),
            probe_type: 1,
            seq: fields.seq,
            timestamp: now_ticks as u64,
            from: self_addr,
            to: from,
            in_if: 0,
            out_if: 0,
            tail: ProbeTail::PktPair { out_delta: gap },
        })
    }

    fn receive_probe_reply(&self, state: &mut ProbeState, _self_addr: MacAddr, _from: MacAddr, fields: &ProbeFields, _current_metric: u32, _now_ticks: i64) -> Option<u32> {
        let ProbeState::PktPair(w) = state else { return None };
        if let ProbeTail::PktPair { out_delta } = fields.tail {
            w.record_gap(out_delta);
        }
        Some(w.current_metric())
    }
}

/// Rolling window of inter-arrival gaps (ticks) for one neighbor's probes.
/// The advertised metric is the minimum of the last
/// `max(PktPairMinOverProbes, window.len())` samples, so a single lucky
/// probe pair can't make a lossy link look good.
pub struct PktPairWindow {
    samples: VecDeque<u32>,
    min_over_probes: usize,
}

impl PktPairWindow {
    pub fn new(min_over_probes: u32) -> Self {
        Self { samples: VecDeque::with_capacity(MAX_PKTPAIR_HISTORY), min_over_probes: min_over_probes.max(1) as usize }
    }

    pub fn record_gap(&mut self, gap_ticks: u32) {
        if self.samples.len() == MAX_PKTPAIR_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(gap_ticks);
    }

    /// The current link metric: the minimum gap among the most recent
    /// `min_over_probes` samples, or `INFINITE` if too few samples exist yet.
    pub fn current_metric(&self) -> u32 {
        if self.samples.len() < self.min_over_probes {
            return INFINITE;
        }
        let take = self.min_over_probes.max(1);
        self.samples.iter().rev().take(take).copied().min().unwrap_or(INFINITE)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_is_infinite_until_min_probes_seen() {
        let mut w = PktPairWindow::new(4);
        w.record_gap(100);
        w.record_gap(50);
        assert_eq!(w.current_metric(), INFINITE);
        w.record_gap(200);
        w.record_gap(30);
        assert_eq!(w.current_metric(), 30);
    }

    #[test]
    fn window_evicts_oldest_sample() {
        let mut w = PktPairWindow::new(1);
        for i in 0..MAX_PKTPAIR_HISTORY {
            w.record_gap(1000 + i as u32);
        }
        assert_eq!(w.sample_count(), MAX_PKTPAIR_HISTORY);
        w.record_gap(5);
        assert_eq!(w.sample_count(), MAX_PKTPAIR_HISTORY);
        assert_eq!(w.current_metric(), 5);
    }
}
