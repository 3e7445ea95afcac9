// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Pluggable link-quality metric engines. Polymorphism over the metric is
// modeled as a tagged enum (the metric type, part of the MAC-key mix) with
// per-variant probe state, dispatched through one `MetricEngine` impl
// chosen at adapter configuration time — the "tagged variant + vtable"
// design the core's notes call for.

pub mod etx;
pub mod hop;
pub mod pktpair;
pub mod rtt;
pub mod wcett;

use lqsr_util::MacAddr;

use crate::codec::ProbeFields;
use crate::error::{LqsrError, Result};
use crate::protocol::MetricType;

/// Scale used by ETX/WCETT loss-probability fields: a value of `LOSS_SCALE`
/// represents 100% loss.
pub const LOSS_SCALE: u32 = 4096;
pub const MAXALPHA: u32 = 10;

/// Configuration parameters shared or specific to each metric, validated
/// against the bounds in SPEC_FULL.md §4.4 at construction time.
#[derive(Debug, Clone)]
pub struct MetricConfig {
    pub metric_type: MetricType,
    pub alpha: u32,
    pub beta: u32,
    pub probe_period_ticks: i64,
    pub loss_interval_ticks: i64,
    pub penalty_factor: u32,
    pub sweep_period_ticks: i64,
    pub pktpair_min_over_probes: u32,
}

impl MetricConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alpha > MAXALPHA {
            return Err(LqsrError::InvalidParameter(1));
        }
        if self.beta > MAXALPHA {
            return Err(LqsrError::InvalidParameter(2));
        }
        let min_probe = lqsr_util::millis(100);
        let max_probe = lqsr_util::seconds(429);
        if self.probe_period_ticks < min_probe || self.probe_period_ticks > max_probe {
            return Err(LqsrError::InvalidParameter(3));
        }
        let min_loss = lqsr_util::millis(100);
        let max_loss = lqsr_util::seconds(60);
        if self.loss_interval_ticks < min_loss || self.loss_interval_ticks > max_loss {
            return Err(LqsrError::InvalidParameter(4));
        }
        if self.penalty_factor < 1 || self.penalty_factor > 32 {
            return Err(LqsrError::InvalidParameter(5));
        }
        if self.sweep_period_ticks < min_probe || self.sweep_period_ticks > max_probe {
            return Err(LqsrError::InvalidParameter(6));
        }
        if self.pktpair_min_over_probes < 1 {
            return Err(LqsrError::InvalidParameter(7));
        }
        Ok(())
    }

    pub fn default_for(metric_type: MetricType) -> Self {
        Self {
            metric_type,
            alpha: 1,
            beta: 5,
            probe_period_ticks: lqsr_util::seconds(1),
            loss_interval_ticks: lqsr_util::seconds(30),
            penalty_factor: 3,
            sweep_period_ticks: lqsr_util::seconds(1),
            pktpair_min_over_probes: 4,
        }
    }
}

/// Capability set every metric engine implements, per SPEC_FULL.md §4.4.
/// `path_metric` takes the full path (not a fold over `link_to_path_component`)
/// because WCETT's combining rule is non-additive.
pub trait MetricEngine {
    fn is_infinite(&self, link_metric: u32) -> bool;
    fn link_to_path_component(&self, link_metric: u32) -> u64;
    fn path_metric(&self, path: &[PathLink]) -> u64;
    fn init_link_metric(&self, is_self_originating: bool) -> u32;
    fn penalize(&self, link_metric: u32) -> u32;

    /// Whether this metric needs active measurement at all. `Hop` answers
    /// `false`; the default bodies of `send_probes`/`receive_probe`/
    /// `receive_probe_reply` are never reached for it.
    fn is_active(&self) -> bool {
        false
    }

    /// Build the next outgoing probe toward `to`, advancing `state`.
    /// Returns `None` when this metric has nothing to send this round.
    fn send_probes(&self, state: &mut ProbeState, self_addr: MacAddr, to: MacAddr, seq: u32, now_ticks: i64) -> Option<ProbeFields> {
        let _ = (state, self_addr, to, seq, now_ticks);
        None
    }

    /// A `Probe` option arrived from `from`. Record whatever the metric
    /// needs and build the `ProbeReply` to send back, if any.
    fn receive_probe(&self, state: &mut ProbeState, self_addr: MacAddr, from: MacAddr, fields: &ProbeFields, now_ticks: i64) -> Option<ProbeFields> {
        let _ = (state, self_addr, from, fields, now_ticks);
        None
    }

    /// A `ProbeReply` arrived answering a probe we sent. `current_metric` is
    /// the link's last known metric (or this engine's `init_link_metric`
    /// value if there's no link yet), used as the EWMA base. Returns the
    /// freshly computed link metric, if the reply resolved anything.
    fn receive_probe_reply(&self, state: &mut ProbeState, self_addr: MacAddr, from: MacAddr, fields: &ProbeFields, current_metric: u32, now_ticks: i64) -> Option<u32> {
        let _ = (state, self_addr, from, fields, current_metric, now_ticks);
        None
    }
}

/// Per-neighbor state an active metric keeps between probe rounds. Metrics
/// that don't probe (`Hop`) never allocate one.
pub enum ProbeState {
    None,
    Rtt(rtt::RttProbeState),
    PktPair(pktpair::PktPairWindow),
    Etx(etx::EtxProbeHistory),
}

impl ProbeState {
    pub fn new_for(metric_type: MetricType, config: &MetricConfig) -> Self {
        match metric_type {
            MetricType::Hop => ProbeState::None,
            MetricType::Rtt => ProbeState::Rtt(rtt::RttProbeState::default()),
            MetricType::PktPair => ProbeState::PktPair(pktpair::PktPairWindow::new(config.pktpair_min_over_probes)),
            MetricType::Etx | MetricType::Wcett => ProbeState::Etx(etx::EtxProbeHistory::default()),
        }
    }
}

/// One link along a candidate path, as seen by `path_metric`.
#[derive(Debug, Clone, Copy)]
pub struct PathLink {
    pub metric: u32,
    pub channel: u8,
}

pub fn engine_for(config: &MetricConfig) -> Box<dyn MetricEngine + Send + Sync> {
    match config.metric_type {
        MetricType::Hop => Box::new(hop::HopEngine),
        MetricType::Rtt => Box::new(rtt::RttEngine { config: config.clone() }),
        MetricType::PktPair => Box::new(pktpair::PktPairEngine { config: config.clone() }),
        MetricType::Etx => Box::new(etx::EtxEngine { config: config.clone() }),
        MetricType::Wcett => Box::new(wcett::WcettEngine { config: config.clone() }),
    }
}
