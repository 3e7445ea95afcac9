// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// The forwarder: the protocol state machine that ties the link cache,
// request table, send/maintenance buffers, and piggyback coalescer
// together around one receive pipeline and one send path. Grounded on
// sys/srcrr.c's `SrcRrReceive`/`SrcRrSend` dispatch loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use lqsr_util::gate::AtomicIntervalGate;
use lqsr_util::MacAddr;

use crate::codec::{self, FrameKeys, LqsrOption, Packet, ProbeFields};
use crate::config::AdapterConfig;
use crate::error::{LqsrError, Result};
use crate::interfaces::{LinkLayer, RandomSource, VirtualAdapterHost};
use crate::linkcache::LinkCache;
use crate::maintbuf::{self, MaintKey, MaintenanceBuffer};
use crate::metric;
use crate::neighbor::NeighborCache;
use crate::piggyback::PiggybackQueue;
use crate::protocol::{HopEntry, MAX_SR_LEN};
use crate::reqtable::RequestTable;
use crate::sendbuf::SendBuffer;

/// Minimum gap enforced between successive flooded rebroadcasts (Route
/// Request forwarding, discovery origination); overflow past this rate
/// queues in `pending_broadcasts` and drains one per tick as the gate
/// reopens.
pub const MIN_BROADCAST_GAP_TICKS: i64 = lqsr_util::millis(30);
const MAX_PENDING_BROADCASTS: usize = 32;

/// Running counters exposed to the control plane; see SPEC_FULL.md §6.
#[derive(Default)]
pub struct ForwarderStats {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub mac_failures: AtomicU64,
    pub malformed_options: AtomicU64,
    pub route_requests_sent: AtomicU64,
    pub route_requests_suppressed: AtomicU64,
    pub route_replies_sent: AtomicU64,
    pub route_errors_received: AtomicU64,
    pub salvaged: AtomicU64,
    pub salvage_failed: AtomicU64,
}

/// Ties every core module together around one receive/send pipeline. Owns
/// no network resources itself; all I/O goes through `LinkLayer`/
/// `VirtualAdapterHost`.
pub struct Forwarder {
    config: AdapterConfig,
    link_cache: LinkCache,
    neighbor_cache: NeighborCache,
    req_table: Mutex<RequestTable>,
    send_buf: Mutex<SendBuffer>,
    maint_buf: Mutex<MaintenanceBuffer>,
    piggyback: Mutex<PiggybackQueue>,
    /// Per-neighbor active-probing state, keyed by the neighbor's virtual
    /// address. Only touched when `link_cache.is_active_metric()`.
    probe_states: Mutex<HashMap<MacAddr, metric::ProbeState>>,
    probe_seq: AtomicU32,
    next_probe_ticks: AtomicI64,
    broadcast_gate: AtomicIntervalGate<MIN_BROADCAST_GAP_TICKS>,
    pending_broadcasts: Mutex<VecDeque<Vec<u8>>>,
    link_layer: Arc<dyn LinkLayer>,
    host: Arc<dyn VirtualAdapterHost>,
    random: Arc<dyn RandomSource>,
    pub stats: ForwarderStats,
}

impl Forwarder {
    pub fn new(config: AdapterConfig, link_layer: Arc<dyn LinkLayer>, host: Arc<dyn VirtualAdapterHost>, random: Arc<dyn RandomSource>) -> Self {
        let metric_engine = metric::engine_for(&config.metric);
        let seed = random.next_u32();
        Self {
            link_cache: LinkCache::new(config.node_address, metric_engine, config.route_flap_damping),
            neighbor_cache: NeighborCache::new(),
            req_table: Mutex::new(RequestTable::new(seed)),
            send_buf: Mutex::new(SendBuffer::new()),
            maint_buf: Mutex::new(MaintenanceBuffer::new()),
            piggyback: Mutex::new(PiggybackQueue::new()),
            probe_states: Mutex::new(HashMap::new()),
            probe_seq: AtomicU32::new(0),
            next_probe_ticks: AtomicI64::new(0),
            broadcast_gate: AtomicIntervalGate::new(0),
            pending_broadcasts: Mutex::new(VecDeque::new()),
            config,
            link_layer,
            host,
            random,
        }
    }

    fn frame_keys(&self) -> FrameKeys {
        FrameKeys::new(&self.config.mac_key, self.config.aes_key, self.config.metric.metric_type, self.config.crypto_enabled)
    }

    fn fresh_iv(&self) -> [u8; 16] {
        if !self.config.crypto_enabled {
            return [0u8; 16];
        }
        let mut iv = [0u8; 16];
        self.random.fill_bytes(&mut iv);
        iv
    }

    /// Send a payload to `dest`, filling in a source route if one is cached
    /// or queuing behind a fresh Route Discovery otherwise.
    pub fn send(&self, dest: MacAddr, ether_type: u16, payload: Vec<u8>, now_ticks: i64) -> Result<()> {
        match self.link_cache.fill_source_route(dest) {
            Some(hops) if hops.len() <= MAX_SR_LEN => self.send_with_route(dest, self.config.node_address, ether_type, payload, hops, 0, now_ticks),
            _ => {
                if !self.send_buf.lock().insert(dest, ether_type, payload, now_ticks) {
                    return Err(LqsrError::QueueFull);
                }
                self.maybe_discover(dest, now_ticks);
                Ok(())
            }
        }
    }

    fn maybe_discover(&self, target: MacAddr, now_ticks: i64) {
        let mut rt = self.req_table.lock();
        if !rt.should_send(target, now_ticks) {
            self.stats.route_requests_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let identifier = rt.next_request_identifier(target);
        rt.record_sent(target, identifier, now_ticks);
        drop(rt);

        let mut pkt = Packet::new(0, Vec::new());
        pkt.options.push(LqsrOption::RouteRequest { identifier, target, hops: Vec::new() });
        if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
            self.broadcast(frame, now_ticks);
            self.stats.route_requests_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Flood `frame` to every active interface, subject to
    /// `MIN_BROADCAST_GAP_TICKS` between successive emissions. Queues behind
    /// `pending_broadcasts` (dropping the oldest entry if full) instead of
    /// sending immediately when the gate hasn't reopened yet.
    fn broadcast(&self, frame: Vec<u8>, now_ticks: i64) {
        if self.broadcast_gate.gate(now_ticks) {
            for if_index in self.link_layer.active_interfaces() {
                let _ = self.link_layer.send_frame(if_index, MacAddr::BROADCAST, &frame);
            }
        } else {
            let mut q = self.pending_broadcasts.lock();
            if q.len() >= MAX_PENDING_BROADCASTS {
                q.pop_front();
            }
            q.push_back(frame);
        }
    }

    /// Send at most one queued broadcast this tick, as the rate gate allows.
    fn flush_pending_broadcasts(&self, now_ticks: i64) {
        let mut q = self.pending_broadcasts.lock();
        if q.is_empty() || !self.broadcast_gate.gate(now_ticks) {
            return;
        }
        if let Some(frame) = q.pop_front() {
            drop(q);
            for if_index in self.link_layer.active_interfaces() {
                let _ = self.link_layer.send_frame(if_index, MacAddr::BROADCAST, &frame);
            }
        }
    }

    fn send_with_route(&self, dest: MacAddr, source: MacAddr, ether_type: u16, payload: Vec<u8>, hops: Vec<HopEntry>, salvage_count: u8, now_ticks: i64) -> Result<()> {
        let first_hop = hops.first().copied().ok_or(LqsrError::NoRouteToDestination)?;
        let mut pkt = Packet::new(ether_type, payload);
        let segments_left = hops.len().saturating_sub(1) as u8;
        pkt.options.push(LqsrOption::SourceRoute { static_route: false, salvage_count, segments_left, hops: hops.clone() });
        let key = MaintKey { next_hop: first_hop.addr, out_if: first_hop.out_if };
        let ack_id = self.maint_buf.lock().send(key, Vec::new(), salvage_count, dest, source, now_ticks);
        pkt.options.push(LqsrOption::AckReq { id: ack_id });
        let frame = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX)?;
        self.maint_buf.lock().set_frame(key, ack_id, frame.clone());
        self.link_layer.send_frame(first_hop.out_if, first_hop.addr, &frame)?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Entry point from the link layer: a frame arrived on `in_if` from
    /// `physical_src`. Decodes, authenticates, and dispatches every option
    /// in a fixed order: passive learning first (LinkInfo/Probe), then
    /// Route Error (topology corrections must land before we act on stale
    /// routes), then maintenance (Ack/AckReq), then Route Request/Reply,
    /// and finally the Source Route itself (forward or deliver locally).
    pub fn handle_received_frame(&self, frame: &[u8], in_if: u8, physical_src: MacAddr, now_ticks: i64) -> Result<()> {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        let keys = self.frame_keys();
        let packet = match codec::decode(frame, &keys) {
            Ok(p) => p,
            Err(LqsrError::MacFailure) => {
                self.stats.mac_failures.fetch_add(1, Ordering::Relaxed);
                return Err(LqsrError::MacFailure);
            }
            Err(e) => {
                self.stats.malformed_options.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        for opt in &packet.options {
            match opt {
                LqsrOption::LinkInfo { from, links } => {
                    self.neighbor_cache.learn(*from, in_if, physical_src, now_ticks);
                    for l in links {
                        self.link_cache.add_link(*from, l.addr, l.in_if, l.out_if, l.metric, 0, now_ticks);
                    }
                }
                LqsrOption::Probe(fields) if fields.to == self.config.node_address => {
                    self.handle_probe(fields, in_if, physical_src, now_ticks);
                }
                LqsrOption::ProbeReply(fields) if fields.to == self.config.node_address => {
                    self.handle_probe_reply(fields, in_if, now_ticks);
                }
                _ => {}
            }
        }

        for opt in &packet.options {
            if let LqsrOption::RouteError { error_src, error_dst: _, unreach_node, in_if: _, out_if: _, metric: _ } = opt {
                self.link_cache.update_from_route_error(*error_src, *unreach_node, now_ticks);
                self.stats.route_errors_received.fetch_add(1, Ordering::Relaxed);
            }
        }

        for opt in &packet.options {
            match opt {
                LqsrOption::Ack { id, from, to: _, in_if: _, out_if: _ } => {
                    let key = MaintKey { next_hop: *from, out_if: in_if };
                    self.maint_buf.lock().receive_ack(key, *id, now_ticks);
                }
                LqsrOption::AckReq { id } => {
                    let mut pb = self.piggyback.lock();
                    pb.send_option(physical_src, LqsrOption::Ack { id: *id, from: self.config.node_address, to: physical_src, in_if, out_if: in_if }, now_ticks);
                }
                _ => {}
            }
        }

        for opt in &packet.options {
            if let LqsrOption::RouteRequest { identifier, target, hops } = opt {
                self.handle_route_request(*identifier, *target, hops, in_if, physical_src, now_ticks);
            }
        }

        for opt in &packet.options {
            if let LqsrOption::RouteReply { hops } = opt {
                self.handle_route_reply(hops, now_ticks);
            }
        }

        if let Some((_, _, _, hops)) = packet.source_route() {
            self.handle_source_routed(&packet, hops, in_if, now_ticks);
        }

        Ok(())
    }

    fn handle_route_request(&self, identifier: u32, target: MacAddr, hops_so_far: &[HopEntry], in_if: u8, physical_src: MacAddr, now_ticks: i64) {
        let origin = hops_so_far.first().map(|h| h.addr).unwrap_or(physical_src);
        let mut rt = self.req_table.lock();
        if rt.is_duplicate(origin, target, identifier) {
            self.stats.route_requests_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        rt.mark_seen(origin, target, identifier);
        drop(rt);

        self.link_cache.use_source_route(origin, hops_so_far, now_ticks);

        if target == self.config.node_address {
            let mut reply_hops = hops_so_far.to_vec();
            reply_hops.push(HopEntry { addr: self.config.node_address, in_if, out_if: in_if, metric: 1 });
            let mut pkt = Packet::new(0, Vec::new());
            pkt.options.push(LqsrOption::RouteReply { hops: reply_hops.clone() });
            if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
                let _ = self.link_layer.send_frame(in_if, physical_src, &frame);
                self.stats.route_replies_sent.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if hops_so_far.len() as u8 >= MAX_SR_LEN as u8 {
            return;
        }
        let mut rebroadcast_hops = hops_so_far.to_vec();
        rebroadcast_hops.push(HopEntry { addr: self.config.node_address, in_if, out_if: in_if, metric: 1 });
        let mut pkt = Packet::new(0, Vec::new());
        pkt.options.push(LqsrOption::RouteRequest { identifier, target, hops: rebroadcast_hops });
        if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
            self.broadcast(frame, now_ticks);
        }
    }

    /// A `Probe` arrived addressed to us: feed the metric engine and send
    /// back whatever `ProbeReply` it builds, if any.
    fn handle_probe(&self, fields: &ProbeFields, in_if: u8, physical_src: MacAddr, now_ticks: i64) {
        let mut states = self.probe_states.lock();
        let state = states.entry(fields.from).or_insert_with(|| metric::ProbeState::new_for(self.config.metric.metric_type, &self.config.metric));
        let reply = self.link_cache.receive_probe(state, fields.from, fields, now_ticks);
        drop(states);
        let Some(reply) = reply else { return };
        let mut pkt = Packet::new(0, Vec::new());
        pkt.options.push(LqsrOption::ProbeReply(reply));
        if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
            let _ = self.link_layer.send_frame(in_if, physical_src, &frame);
        }
    }

    /// A `ProbeReply` arrived answering a probe we sent: feed the metric
    /// engine, which updates the link cache's outgoing metric to `from` if
    /// the reply resolved a fresh sample.
    fn handle_probe_reply(&self, fields: &ProbeFields, in_if: u8, now_ticks: i64) {
        let mut states = self.probe_states.lock();
        let state = states.entry(fields.from).or_insert_with(|| metric::ProbeState::new_for(self.config.metric.metric_type, &self.config.metric));
        self.link_cache.receive_probe_reply(state, fields.from, fields, in_if, now_ticks);
    }

    /// Emit one round of active-measurement probes to every known neighbor,
    /// driven from `tick` at `config.metric.probe_period_ticks`. A no-op for
    /// metrics that don't probe (`is_active_metric` false).
    fn send_probes(&self, now_ticks: i64) {
        let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
        for (key, entry) in self.neighbor_cache.iter_snapshot() {
            let mut states = self.probe_states.lock();
            let state = states.entry(key.virtual_addr).or_insert_with(|| metric::ProbeState::new_for(self.config.metric.metric_type, &self.config.metric));
            let built = self.link_cache.send_probes(state, key.virtual_addr, seq, now_ticks);
            drop(states);
            let Some(fields) = built else { continue };
            let mut pkt = Packet::new(0, Vec::new());
            pkt.options.push(LqsrOption::Probe(fields));
            if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
                let _ = self.link_layer.send_frame(key.local_iface, entry.physical_addr, &frame);
            }
        }
    }

    fn handle_route_reply(&self, hops: &[HopEntry], now_ticks: i64) {
        // Assumes this reply answers a request we originated, so the chain
        // starts at us; a full implementation would also pass through
        // replies addressed past us when acting as an intermediate forwarder.
        let Some(last) = hops.last() else { return };
        self.link_cache.use_source_route(self.config.node_address, hops, now_ticks);
        let dest = last.addr;
        self.req_table.lock().received_reply(dest);
        self.link_cache.note_route_change(dest, now_ticks);

        if let Some(fresh_hops) = self.link_cache.fill_source_route(dest) {
            for (ether_type, payload) in self.send_buf.lock().drain_ready(dest) {
                let _ = self.send_with_route(dest, self.config.node_address, ether_type, payload, fresh_hops.clone(), 0, now_ticks);
            }
        }
    }

    fn handle_source_routed(&self, packet: &Packet, hops: &[HopEntry], in_if: u8, now_ticks: i64) {
        let Some((_, salvage_count, segments_left, _)) = packet.source_route() else { return };
        if segments_left == 0 {
            self.host.deliver(packet.next_header, &packet.payload);
            return;
        }
        let next_index = hops.len().saturating_sub(segments_left as usize);
        let Some(next_hop) = hops.get(next_index) else { return };

        let mut fwd = packet.clone();
        if let Some(pos) = fwd.options.iter().position(|o| matches!(o, LqsrOption::SourceRoute { .. })) {
            fwd.options[pos] = LqsrOption::SourceRoute { static_route: false, salvage_count, segments_left: segments_left - 1, hops: hops.to_vec() };
        }
        fwd.options.retain(|o| !matches!(o, LqsrOption::AckReq { .. } | LqsrOption::Ack { .. }));

        let key = MaintKey { next_hop: next_hop.addr, out_if: next_hop.out_if };
        let last = hops.last().map(|h| h.addr).unwrap_or(next_hop.addr);
        let first = hops.first().map(|h| h.addr).unwrap_or(self.config.node_address);
        let ack_id = self.maint_buf.lock().send(key, Vec::new(), salvage_count, last, first, now_ticks);
        fwd.options.push(LqsrOption::AckReq { id: ack_id });

        if let Ok(frame) = codec::encode(&fwd, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
            self.maint_buf.lock().set_frame(key, ack_id, frame.clone());
            if self.link_layer.send_frame(next_hop.out_if, next_hop.addr, &frame).is_ok() {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        let _ = in_if;
    }

    /// Called from the periodic timer: sweeps the maintenance buffer for
    /// timeouts, attempting salvage for anything that exhausted retries,
    /// and expires anything that has waited too long for a route.
    pub fn tick(&self, now_ticks: i64) {
        if self.link_cache.is_active_metric() && now_ticks >= self.next_probe_ticks.load(Ordering::Relaxed) {
            self.next_probe_ticks.store(now_ticks + self.config.metric.probe_period_ticks, Ordering::Relaxed);
            self.send_probes(now_ticks);
        }

        self.flush_pending_broadcasts(now_ticks);

        let swept = self.maint_buf.lock().sweep(now_ticks);

        for (key, frame) in swept.retransmit {
            let _ = self.link_layer.send_frame(key.out_if, key.next_hop, &frame);
        }

        for (key, pending) in swept.salvage {
            self.link_cache.penalize_link(self.config.node_address, key.next_hop, now_ticks);
            if !maintbuf::can_salvage(pending.salvage_count) {
                self.stats.salvage_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.link_cache.fill_source_route(pending.final_dest) {
                Some(hops) if !hops.is_empty() => {
                    self.stats.salvaged.fetch_add(1, Ordering::Relaxed);
                    let _ = self.send_with_route(pending.final_dest, pending.orig_source, 0, Vec::new(), hops, pending.salvage_count + 1, now_ticks);
                }
                _ => {
                    self.stats.salvage_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for dest in self.send_buf.lock().expire(now_ticks) {
            self.maybe_discover(dest, now_ticks);
        }

        for (next_hop, options) in self.piggyback.lock().flush_due(now_ticks) {
            let mut pkt = Packet::new(0, Vec::new());
            pkt.options = options;
            if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
                let _ = self.link_layer.send_frame(0, next_hop, &frame);
            }
        }
    }

    /// Disseminate this node's outgoing links to every active interface, the
    /// periodic LinkInfo beacon driven by the adapter's own timer.
    pub fn broadcast_link_info(&self) {
        let links = self.link_cache.create_link_info();
        if links.is_empty() {
            return;
        }
        let mut pkt = Packet::new(0, Vec::new());
        pkt.options.push(LqsrOption::LinkInfo { from: self.config.node_address, links });
        if let Ok(frame) = codec::encode(&pkt, &self.frame_keys(), self.fresh_iv(), usize::MAX) {
            for if_index in self.link_layer.active_interfaces() {
                let _ = self.link_layer.send_frame(if_index, MacAddr::BROADCAST, &frame);
            }
        }
    }

    pub fn self_address(&self) -> MacAddr {
        self.config.node_address
    }

    pub fn link_info_period_ticks(&self) -> i64 {
        self.config.link_info_period_ticks
    }

    pub fn link_cache(&self) -> &LinkCache {
        &self.link_cache
    }

    pub fn neighbor_cache(&self) -> &NeighborCache {
        &self.neighbor_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::test_support::{FixedRandom, NullHost, RecordingLinkLayer};
    use crate::protocol::MetricType;

    fn addr(b: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, b])
    }

    fn forwarder(self_addr: MacAddr) -> (Arc<RecordingLinkLayer>, Forwarder) {
        let ll = Arc::new(RecordingLinkLayer::new(self_addr));
        let host = Arc::new(NullHost::default());
        let random = Arc::new(FixedRandom(0x1234_5678));
        let config = AdapterConfig::new(self_addr, MetricType::Hop, [0; 16], [0; 16], false);
        let fw = Forwarder::new(config, ll.clone(), host, random);
        (ll, fw)
    }

    #[test]
    fn send_without_route_queues_and_triggers_discovery() {
        let (ll, fw) = forwarder(addr(1));
        fw.send(addr(9), 0x0800, vec![1, 2, 3], 0).unwrap();
        assert_eq!(fw.send_buf.lock().queued_for(addr(9)), 1);
        assert_eq!(ll.sent.lock().len(), 1); // the broadcast Route Request
    }

    #[test]
    fn route_request_for_self_produces_route_reply() {
        let (ll, fw) = forwarder(addr(1));
        let mut pkt = Packet::new(0, Vec::new());
        pkt.options.push(LqsrOption::RouteRequest { identifier: 1, target: addr(1), hops: Vec::new() });
        let frame = codec::encode(&pkt, &fw.frame_keys(), [0; 16], usize::MAX).unwrap();
        fw.handle_received_frame(&frame, 0, addr(2), 0).unwrap();
        assert_eq!(ll.sent.lock().len(), 1);
    }

    #[test]
    fn duplicate_route_request_is_suppressed() {
        let (_, fw) = forwarder(addr(1));
        let mut pkt = Packet::new(0, Vec::new());
        pkt.options.push(LqsrOption::RouteRequest { identifier: 7, target: addr(5), hops: vec![HopEntry { addr: addr(2), in_if: 0, out_if: 0, metric: 1 }] });
        let frame = codec::encode(&pkt, &fw.frame_keys(), [0; 16], usize::MAX).unwrap();
        fw.handle_received_frame(&frame, 0, addr(2), 0).unwrap();
        fw.handle_received_frame(&frame, 0, addr(2), 1).unwrap();
        assert_eq!(fw.stats.route_requests_suppressed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn same_source_and_id_for_different_targets_do_not_collide_in_rebroadcast() {
        // Two Route Requests from the same origin/id but different targets
        // must both rebroadcast, not suppress the second as a duplicate.
        let (_, fw) = forwarder(addr(1));
        for target in [addr(8), addr(9)] {
            let mut pkt = Packet::new(0, Vec::new());
            pkt.options.push(LqsrOption::RouteRequest { identifier: 7, target, hops: vec![HopEntry { addr: addr(2), in_if: 0, out_if: 0, metric: 1 }] });
            let frame = codec::encode(&pkt, &fw.frame_keys(), [0; 16], usize::MAX).unwrap();
            fw.handle_received_frame(&frame, 0, addr(2), 0).unwrap();
        }
        assert_eq!(fw.stats.route_requests_suppressed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rebroadcast_is_rate_limited_then_drains_on_tick() {
        let (ll, fw) = forwarder(addr(1));
        let mut pkt1 = Packet::new(0, Vec::new());
        pkt1.options.push(LqsrOption::RouteRequest { identifier: 1, target: addr(9), hops: vec![HopEntry { addr: addr(2), in_if: 0, out_if: 0, metric: 1 }] });
        let frame1 = codec::encode(&pkt1, &fw.frame_keys(), [0; 16], usize::MAX).unwrap();
        fw.handle_received_frame(&frame1, 0, addr(2), 0).unwrap();
        assert_eq!(ll.sent.lock().len(), 1, "first rebroadcast goes out immediately");

        let mut pkt2 = Packet::new(0, Vec::new());
        pkt2.options.push(LqsrOption::RouteRequest { identifier: 2, target: addr(9), hops: vec![HopEntry { addr: addr(3), in_if: 0, out_if: 0, metric: 1 }] });
        let frame2 = codec::encode(&pkt2, &fw.frame_keys(), [0; 16], usize::MAX).unwrap();
        fw.handle_received_frame(&frame2, 0, addr(3), 0).unwrap();
        assert_eq!(ll.sent.lock().len(), 1, "second rebroadcast within the gap queues instead of sending");
        assert_eq!(fw.pending_broadcasts.lock().len(), 1);

        fw.tick(MIN_BROADCAST_GAP_TICKS);
        assert_eq!(ll.sent.lock().len(), 2, "queued rebroadcast drains once the gate reopens");
        assert!(fw.pending_broadcasts.lock().is_empty());
    }

    #[test]
    fn rtt_probe_round_trip_installs_a_link_metric() {
        let a = addr(1);
        let b = addr(2);
        let ll_a = Arc::new(RecordingLinkLayer::new(a));
        let ll_b = Arc::new(RecordingLinkLayer::new(b));
        let fw_a = Forwarder::new(AdapterConfig::new(a, MetricType::Rtt, [0; 16], [0; 16], false), ll_a.clone(), Arc::new(NullHost::default()), Arc::new(FixedRandom(1)));
        let fw_b = Forwarder::new(AdapterConfig::new(b, MetricType::Rtt, [0; 16], [0; 16], false), ll_b.clone(), Arc::new(NullHost::default()), Arc::new(FixedRandom(2)));

        fw_a.neighbor_cache().learn(b, 0, b, 0);
        assert_eq!(fw_a.link_cache().link_metric(a, b), None);

        fw_a.tick(0);
        let (_, _, probe_frame) = ll_a.sent.lock().pop_front().expect("RTT probe sent to the neighbor");
        fw_b.handle_received_frame(&probe_frame, 0, a, 0).unwrap();

        let (_, _, reply_frame) = ll_b.sent.lock().pop_front().expect("RTT probe reply sent back");
        fw_a.handle_received_frame(&reply_frame, 0, b, 0).unwrap();

        assert_eq!(fw_a.link_cache().link_metric(a, b), Some(0), "zero-elapsed-tick round trip EWMAs to a zero sample");
    }
}
