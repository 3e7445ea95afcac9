// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// WCETT (Weighted Cumulative Expected Transmission Time): each link packs a
// loss probability, a bandwidth class, and a channel number into one u32.
// Per-link ETT is derived from loss probability and bandwidth via a
// fixed-point Backoff/Transmit iteration; the path metric combines ETTs
// non-additively to penalize paths that reuse the same channel repeatedly,
// which is why `path_metric` takes the whole path instead of folding a
// per-link component.

use super::etx::{expected_num_probes, steady_state_loss_prob};
use super::{MetricEngine, PathLink, ProbeState, LOSS_SCALE};
use crate::bandwidth;
use crate::codec::{EtxEntry, ProbeFields, ProbeTail};
use crate::protocol::MetricType;
use lqsr_util::MacAddr;

pub const LOSS_PROB_BITS: u32 = 12;
pub const BANDWIDTH_BITS: u32 = 12;
pub const CHANNEL_BITS: u32 = 8;

pub const LOSS_PROB_MASK: u32 = (1 << LOSS_PROB_BITS) - 1;
pub const BANDWIDTH_MASK: u32 = (1 << BANDWIDTH_BITS) - 1;
pub const CHANNEL_MASK: u32 = (1 << CHANNEL_BITS) - 1;

/// Backoff-window floor, in ticks, used by the fixed-point ETT iteration.
pub const CW_MIN_TICKS: u32 = 3200;

pub const INFINITE: u32 = 0xFFFF_FFFF;

/// Pack a loss probability, 12-bit encoded bandwidth, and channel number
/// into one wire metric: `LossProb:12 | Bandwidth:12 | Channel:8`.
pub fn pack(loss_prob: u32, encoded_bandwidth: u16, channel: u8) -> u32 {
    let loss_prob = loss_prob & LOSS_PROB_MASK;
    let bw = (encoded_bandwidth as u32) & BANDWIDTH_MASK;
    let ch = channel as u32 & CHANNEL_MASK;
    (loss_prob << (BANDWIDTH_BITS + CHANNEL_BITS)) | (bw << CHANNEL_BITS) | ch
}

pub fn unpack(metric: u32) -> (u32, u16, u8) {
    let channel = (metric & CHANNEL_MASK) as u8;
    let bw = ((metric >> CHANNEL_BITS) & BANDWIDTH_MASK) as u16;
    let loss_prob = (metric >> (CHANNEL_BITS + BANDWIDTH_BITS)) & LOSS_PROB_MASK;
    (loss_prob, bw, channel)
}

/// Fixed-point solution for the expected per-packet transmission time
/// (ticks), given a loss probability and the link's backoff window.
/// Converges in a fixed 6 iterations, the last of which drops the
/// quadratic term (coefficient 1), matching exe/mcl.c's WcettConvETT.
fn backoff_transmit_ticks(loss_prob: u32, cw_min: u32) -> u64 {
    let loss_prob = loss_prob.min(LOSS_SCALE - 1) as u64;
    let mut temp = cw_min as u64;
    for iter in 0..6 {
        let coeff = if iter == 5 { 1 } else { 2 };
        temp = (LOSS_SCALE as u64 * LOSS_SCALE as u64 + coeff * loss_prob * temp) / LOSS_SCALE as u64;
    }
    temp
}

/// Expected Transmission Time for one link: backoff/contention delay plus
/// the time to transmit one packet at the link's encoded bandwidth.
pub fn ett_ticks(loss_prob: u32, encoded_bandwidth: u16) -> u64 {
    let bps = bandwidth::decode(encoded_bandwidth).max(1);
    let backoff = backoff_transmit_ticks(loss_prob, CW_MIN_TICKS);
    let transmit_ticks = (lqsr_util::TICKS_PER_SECOND as u64 * 8) / bps;
    backoff + transmit_ticks
}

pub struct WcettEngine {
    pub config: super::MetricConfig,
}

impl MetricEngine for WcettEngine {
    fn is_infinite(&self, link_metric: u32) -> bool {
        link_metric == INFINITE
    }

    fn link_to_path_component(&self, link_metric: u32) -> u64 {
        if link_metric == INFINITE {
            return u64::MAX;
        }
        let (loss_prob, bw, _channel) = unpack(link_metric);
        ett_ticks(loss_prob, bw)
    }

    /// `(1 - beta) * sum(ETT_i) + beta * max_c sum_{channel c}(ETT_i)`, with
    /// beta expressed in tenths (config.beta / MAXALPHA) per SPEC_FULL.md §4.4.
    fn path_metric(&self, path: &[PathLink]) -> u64 {
        if path.iter().any(|l| l.metric == INFINITE) {
            return u64::MAX;
        }
        let total: u64 = path.iter().map(|l| self.link_to_path_component(l.metric)).sum();
        let mut per_channel: std::collections::HashMap<u8, u64> = std::collections::HashMap::new();
        for l in path {
            let (loss_prob, bw, _) = unpack(l.metric);
            *per_channel.entry(l.channel).or_insert(0) += ett_ticks(loss_prob, bw);
        }
        let max_channel_sum = per_channel.values().copied().max().unwrap_or(0);
        let beta = self.config.beta.min(super::MAXALPHA) as u64;
        let maxalpha = super::MAXALPHA as u64;
        ((maxalpha - beta) * total + beta * max_channel_sum) / maxalpha
    }

    fn init_link_metric(&self, _is_self_originating: bool) -> u32 {
        pack(0, bandwidth::encode(1_000_000), 0)
    }

    fn penalize(&self, link_metric: u32) -> u32 {
        if link_metric == INFINITE {
            return INFINITE;
        }
        let (loss_prob, bw, channel) = unpack(link_metric);
        let success_prob = ((LOSS_SCALE - loss_prob.min(LOSS_SCALE - 1)) / self.config.penalty_factor.max(1)).max(1);
        let new_loss = (LOSS_SCALE - success_prob).min(LOSS_SCALE - 1);
        pack(new_loss, bw, channel)
    }

    fn is_active(&self) -> bool {
        true
    }

    /// WCETT reuses ETX's loss-probability probe exchange; bandwidth and
    /// channel are learned from `LinkInfo`/interface configuration, not probing.
    fn send_probes(&self, state: &mut ProbeState, self_addr: MacAddr, to: MacAddr, seq: u32, now_ticks: i64) -> Option<ProbeFields> {
        let ProbeState::Etx(history) = state else { return None };
        let expected = expected_num_probes(self.config.loss_interval_ticks, self.config.probe_period_ticks);
        let rcvd = history.count_in_window(seq.wrapping_sub(expected));
        Some(ProbeFields {
            metric_type: MetricType::Wcett.as_u32(),
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
            metric_type: MetricType::Wcett.as_u32(),
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
        let (old_loss, bw, channel) = unpack(current_metric);
        let new_loss = super::etx::ewma_update(old_loss, sample, self.config.alpha);
        Some(pack(new_loss, bw, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricConfig;
    use crate::protocol::MetricType;

    #[test]
    fn pack_unpack_roundtrip() {
        let m = pack(100, 2000, 7);
        assert_eq!(unpack(m), (100, 2000, 7));
    }

    #[test]
    fn higher_loss_increases_ett() {
        let bw = bandwidth::encode(1_000_000);
        assert!(ett_ticks(2000, bw) > ett_ticks(0, bw));
    }

    #[test]
    fn path_metric_penalizes_repeated_channel_use() {
        let engine = WcettEngine { config: MetricConfig::default_for(MetricType::Wcett) };
        let bw = bandwidth::encode(1_000_000);
        let same_channel = vec![
            PathLink { metric: pack(0, bw, 1), channel: 1 },
            PathLink { metric: pack(0, bw, 1), channel: 1 },
        ];
        let diff_channel = vec![
            PathLink { metric: pack(0, bw, 1), channel: 1 },
            PathLink { metric: pack(0, bw, 2), channel: 2 },
        ];
        assert!(engine.path_metric(&same_channel) >= engine.path_metric(&diff_channel));
    }

    #[test]
    fn infinite_link_makes_path_infinite() {
        let engine = WcettEngine { config: MetricConfig::default_for(MetricType::Wcett) };
        let path = vec![PathLink { metric: INFINITE, channel: 0 }];
        assert_eq!(engine.path_metric(&path), u64::MAX);
    }
}
