// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// The link cache: a graph of observed links, kept current by route
// replies, route errors, passive link-info advertisements, and metric
// probes, and searched with Dijkstra to fill in source routes. Grounded on
// sys/linkcache.h's `LinkCache`/`CacheEntry`/`Link` intrusive lists, which
// this reimplements as a `slab`-backed arena addressed by small integer
// handles instead of raw cyclic pointers.

pub mod dijkstra;

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use slab::Slab;

use lqsr_util::MacAddr;

use crate::codec::ProbeFields;
use crate::metric::{MetricEngine, PathLink, ProbeState};
use crate::protocol::HopEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u32);

const CHANGE_LOG_CAPACITY: usize = 1024;
/// Number of route changes to a given destination within
/// `FLAP_WINDOW_TICKS` that trigger damping.
const FLAP_THRESHOLD: u32 = 4;
const FLAP_WINDOW_TICKS: i64 = lqsr_util::seconds(10);
const FLAP_HOLDDOWN_TICKS: i64 = lqsr_util::seconds(30);

#[derive(Debug, Clone, Copy)]
struct CacheNode {
    addr: MacAddr,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    from: NodeId,
    to: NodeId,
    in_if: u8,
    out_if: u8,
    metric: u32,
    channel: u8,
    last_update_ticks: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChangeReason {
    Added,
    MetricChanged,
    Penalized,
    Deleted,
    InterfaceDown,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkChangeEntry {
    pub from: MacAddr,
    pub to: MacAddr,
    pub reason: LinkChangeReason,
    pub ticks: i64,
}

#[derive(Debug, Clone, Copy)]
struct RouteChangeEntry {
    target: MacAddr,
    ticks: i64,
}

struct FlapState {
    changes: VecDeque<i64>,
    dampened_until_ticks: i64,
}

impl FlapState {
    fn new() -> Self {
        Self { changes: VecDeque::new(), dampened_until_ticks: 0 }
    }

    fn record_change(&mut self, now_ticks: i64) -> bool {
        self.changes.push_back(now_ticks);
        while let Some(&front) = self.changes.front() {
            if now_ticks - front > FLAP_WINDOW_TICKS {
                self.changes.pop_front();
            } else {
                break;
            }
        }
        if self.changes.len() as u32 >= FLAP_THRESHOLD {
            self.dampened_until_ticks = now_ticks + FLAP_HOLDDOWN_TICKS;
            self.changes.clear();
            true
        } else {
            false
        }
    }

    fn is_dampened(&self, now_ticks: i64) -> bool {
        now_ticks < self.dampened_until_ticks
    }
}

/// The link cache: a directed multigraph of `(from, to) -> metric` plus the
/// bookkeeping needed to advertise it and keep routes stable under flap.
pub struct LinkCache {
    self_addr: MacAddr,
    metric_engine: Box<dyn MetricEngine + Send + Sync>,
    /// Relative-delta threshold (scaled the same as the metric itself)
    /// below which a recent metric change is insignificant and skipped;
    /// `0` disables damping entirely. Driven by `route_flap_damping`.
    damping_threshold: u32,
    nodes: RwLock<Slab<CacheNode>>,
    node_index: RwLock<HashMap<MacAddr, NodeId>>,
    links: RwLock<Slab<Link>>,
    adj_out: RwLock<HashMap<NodeId, Vec<LinkId>>>,
    adj_in: RwLock<HashMap<NodeId, Vec<LinkId>>>,
    link_use_count: RwLock<HashMap<LinkId, u64>>,
    flap_state: RwLock<HashMap<MacAddr, FlapState>>,
    link_change_log: RwLock<VecDeque<LinkChangeEntry>>,
    route_change_log: RwLock<VecDeque<RouteChangeEntry>>,
}

impl LinkCache {
    pub fn new(self_addr: MacAddr, metric_engine: Box<dyn MetricEngine + Send + Sync>, damping_threshold: u32) -> Self {
        let mut nodes = Slab::new();
        let self_node = NodeId(nodes.insert(CacheNode { addr: self_addr }) as u32);
        let mut node_index = HashMap::new();
        node_index.insert(self_addr, self_node);
        Self {
            self_addr,
            metric_engine,
            damping_threshold,
            nodes: RwLock::new(nodes),
            node_index: RwLock::new(node_index),
            links: RwLock::new(Slab::new()),
            adj_out: RwLock::new(HashMap::new()),
            adj_in: RwLock::new(HashMap::new()),
            link_use_count: RwLock::new(HashMap::new()),
            flap_state: RwLock::new(HashMap::new()),
            link_change_log: RwLock::new(VecDeque::with_capacity(CHANGE_LOG_CAPACITY)),
            route_change_log: RwLock::new(VecDeque::with_capacity(CHANGE_LOG_CAPACITY)),
        }
    }

    fn log_link_change(&self, from: MacAddr, to: MacAddr, reason: LinkChangeReason, now_ticks: i64) {
        let mut log = self.link_change_log.write();
        if log.len() == CHANGE_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(LinkChangeEntry { from, to, reason, ticks: now_ticks });
    }

    fn get_or_create_node(&self, addr: MacAddr) -> NodeId {
        if let Some(id) = self.node_index.read().get(&addr) {
            return *id;
        }
        let mut nodes = self.nodes.write();
        let mut node_index = self.node_index.write();
        // Another writer may have inserted it between the read lock drop and here.
        if let Some(id) = node_index.get(&addr) {
            return *id;
        }
        let id = NodeId(nodes.insert(CacheNode { addr }) as u32);
        node_index.insert(addr, id);
        id
    }

    fn node_addr(&self, id: NodeId) -> Option<MacAddr> {
        self.nodes.read().get(id.0 as usize).map(|n| n.addr)
    }

    /// Insert or refresh a directed link, as observed from a route reply,
    /// source route, or link-info advertisement. Returns the link's handle.
    pub fn add_link(&self, from: MacAddr, to: MacAddr, in_if: u8, out_if: u8, metric: u32, channel: u8, now_ticks: i64) -> LinkId {
        let from_id = self.get_or_create_node(from);
        let to_id = self.get_or_create_node(to);

        let existing = {
            let adj = self.adj_out.read();
            adj.get(&from_id).and_then(|links| {
                let links_arena = self.links.read();
                links.iter().copied().find(|lid| links_arena.get(lid.0 as usize).map(|l| l.to == to_id).unwrap_or(false))
            })
        };

        if let Some(lid) = existing {
            let mut links = self.links.write();
            let link = &mut links[lid.0 as usize];
            let delta = metric.abs_diff(link.metric);
            let recent = now_ticks.saturating_sub(link.last_update_ticks) < FLAP_WINDOW_TICKS;
            if self.damping_threshold > 0 && delta < self.damping_threshold && recent {
                return lid;
            }
            let changed = link.metric != metric;
            link.metric = metric;
            link.channel = channel;
            link.in_if = in_if;
            link.out_if = out_if;
            link.last_update_ticks = now_ticks;
            drop(links);
            if changed {
                self.log_link_change(from, to, LinkChangeReason::MetricChanged, now_ticks);
            }
            return lid;
        }

        let lid = LinkId(self.links.write().insert(Link { from: from_id, to: to_id, in_if, out_if, metric, channel, last_update_ticks: now_ticks }) as u32);
        self.adj_out.write().entry(from_id).or_default().push(lid);
        self.adj_in.write().entry(to_id).or_default().push(lid);
        self.log_link_change(from, to, LinkChangeReason::Added, now_ticks);
        lid
    }

    /// Apply the metric engine's penalty function to a link, e.g. after a
    /// maintenance timeout, and record the reason.
    pub fn penalize_link(&self, from: MacAddr, to: MacAddr, now_ticks: i64) -> Option<u32> {
        let from_id = *self.node_index.read().get(&from)?;
        let to_id = *self.node_index.read().get(&to)?;
        let lid = {
            let adj = self.adj_out.read();
            let links = self.links.read();
            adj.get(&from_id)?.iter().copied().find(|lid| links.get(lid.0 as usize).map(|l| l.to == to_id).unwrap_or(false))?
        };
        let new_metric = {
            let mut links = self.links.write();
            let link = &mut links[lid.0 as usize];
            link.metric = self.metric_engine.penalize(link.metric);
            link.last_update_ticks = now_ticks;
            link.metric
        };
        self.log_link_change(from, to, LinkChangeReason::Penalized, now_ticks);
        Some(new_metric)
    }

    /// Remove every link incident to a local interface, e.g. when it goes
    /// down; used by the adapter's interface-down handling.
    pub fn delete_interface(&self, if_index: u8, now_ticks: i64) {
        let doomed: Vec<LinkId> = {
            let links = self.links.read();
            links.iter().filter(|(_, l)| l.out_if == if_index || l.in_if == if_index).map(|(i, _)| LinkId(i as u32)).collect()
        };
        for lid in doomed {
            self.remove_link(lid, now_ticks);
        }
    }

    fn remove_link(&self, lid: LinkId, now_ticks: i64) {
        let removed = {
            let mut links = self.links.write();
            if !links.contains(lid.0 as usize) {
                return;
            }
            links.remove(lid.0 as usize)
        };
        if let Some(list) = self.adj_out.write().get_mut(&removed.from) {
            list.retain(|l| *l != lid);
        }
        if let Some(list) = self.adj_in.write().get_mut(&removed.to) {
            list.retain(|l| *l != lid);
        }
        if let (Some(from), Some(to)) = (self.node_addr(removed.from), self.node_addr(removed.to)) {
            self.log_link_change(from, to, LinkChangeReason::Deleted, now_ticks);
        }
    }

    /// Number of links incident to the local node, used to size periodic
    /// LinkInfo advertisements.
    pub fn my_degree(&self) -> usize {
        let self_id = self.node_index.read()[&self.self_addr];
        self.adj_out.read().get(&self_id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn count_link_use(&self, lid: LinkId) -> u64 {
        *self.link_use_count.read().get(&lid).unwrap_or(&0)
    }

    fn bump_link_use(&self, lid: LinkId) {
        *self.link_use_count.write().entry(lid).or_insert(0) += 1;
    }

    /// Build the LinkInfo advertisement payload for this node: every
    /// outgoing link's destination, interfaces, and metric.
    pub fn create_link_info(&self) -> Vec<HopEntry> {
        let self_id = self.node_index.read()[&self.self_addr];
        let adj = self.adj_out.read();
        let links = self.links.read();
        adj.get(&self_id)
            .map(|lids| {
                lids.iter()
                    .filter_map(|lid| links.get(lid.0 as usize))
                    .filter_map(|l| self.node_addr(l.to).map(|addr| HopEntry { addr, in_if: l.in_if, out_if: l.out_if, metric: l.metric }))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run Dijkstra from the local node and return the source route to
    /// `dest`, or `None` if unreachable. This is `LinkCacheFillSR`.
    pub fn fill_source_route(&self, dest: MacAddr) -> Option<Vec<HopEntry>> {
        let self_id = *self.node_index.read().get(&self.self_addr)?;
        let dest_id = *self.node_index.read().get(&dest)?;
        if self_id == dest_id {
            return Some(Vec::new());
        }

        let adj_out = self.adj_out.read();
        let links = self.links.read();
        let metric_engine = &self.metric_engine;
        let prev = dijkstra::shortest_paths(self_id, |node| {
            adj_out
                .get(&node)
                .map(|lids| {
                    lids.iter()
                        .filter_map(|lid| links.get(lid.0 as usize).map(|l| (*lid, l)))
                        .filter(|(_, l)| !metric_engine.is_infinite(l.metric))
                        .map(|(lid, l)| dijkstra::Edge { to: l.to, link: lid, weight: metric_engine.link_to_path_component(l.metric) })
                        .collect()
                })
                .unwrap_or_default()
        });

        if !prev.contains_key(&dest_id) {
            return None;
        }

        let mut chain = Vec::new();
        let mut cur = dest_id;
        while let Some(&(pred, lid, _)) = prev.get(&cur) {
            chain.push((pred, lid, cur));
            cur = pred;
            if cur == self_id {
                break;
            }
        }
        chain.reverse();

        let mut hops = Vec::with_capacity(chain.len());
        for (_, lid, to) in &chain {
            let link = links.get(lid.0 as usize)?;
            let addr = self.node_addr(*to)?;
            hops.push(HopEntry { addr, in_if: link.in_if, out_if: link.out_if, metric: link.metric });
            self.bump_link_use(*lid);
        }
        Some(hops)
    }

    /// Record that a route to `target` has changed (e.g. a new source route
    /// was selected), for route-flap damping. Returns `true` if the change
    /// pushed the destination into a damped holddown period.
    pub fn note_route_change(&self, target: MacAddr, now_ticks: i64) -> bool {
        {
            let mut log = self.route_change_log.write();
            if log.len() == CHANGE_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(RouteChangeEntry { target, ticks: now_ticks });
        }
        let mut flap = self.flap_state.write();
        flap.entry(target).or_insert_with(FlapState::new).record_change(now_ticks)
    }

    pub fn is_route_dampened(&self, target: MacAddr, now_ticks: i64) -> bool {
        self.flap_state.read().get(&target).map(|f| f.is_dampened(now_ticks)).unwrap_or(false)
    }

    /// Incorporate a discovered path (e.g. from a Route Reply's accumulated
    /// hop list) into the cache as a chain of directed links.
    pub fn use_source_route(&self, origin: MacAddr, hops: &[HopEntry], now_ticks: i64) {
        let mut prev_addr = origin;
        for hop in hops {
            self.add_link(prev_addr, hop.addr, hop.in_if, hop.out_if, hop.metric, 0, now_ticks);
            prev_addr = hop.addr;
        }
    }

    /// Apply a Route Error: the link from `error_src` to `unreach_node` is
    /// broken and should be removed so future searches avoid it.
    pub fn update_from_route_error(&self, error_src: MacAddr, unreach_node: MacAddr, now_ticks: i64) {
        if let (Some(&from_id), Some(&to_id)) = (self.node_index.read().get(&error_src), self.node_index.read().get(&unreach_node)) {
            let lid = {
                let adj = self.adj_out.read();
                let links = self.links.read();
                adj.get(&from_id).and_then(|lids| lids.iter().copied().find(|lid| links.get(lid.0 as usize).map(|l| l.to == to_id).unwrap_or(false)))
            };
            if let Some(lid) = lid {
                self.remove_link(lid, now_ticks);
            }
        }
    }

    pub fn path_metric(&self, path: &[PathLink]) -> u64 {
        self.metric_engine.path_metric(path)
    }

    pub fn link_change_log_snapshot(&self) -> Vec<LinkChangeEntry> {
        self.link_change_log.read().iter().copied().collect()
    }

    /// Current metric of the direct link `from -> to`, if one is cached.
    pub fn link_metric(&self, from: MacAddr, to: MacAddr) -> Option<u32> {
        let from_id = *self.node_index.read().get(&from)?;
        let to_id = *self.node_index.read().get(&to)?;
        let adj = self.adj_out.read();
        let links = self.links.read();
        adj.get(&from_id)?.iter().copied().find_map(|lid| links.get(lid.0 as usize).filter(|l| l.to == to_id).map(|l| l.metric))
    }

    /// Whether the configured metric performs active measurement at all.
    pub fn is_active_metric(&self) -> bool {
        self.metric_engine.is_active()
    }

    pub fn send_probes(&self, state: &mut ProbeState, to: MacAddr, seq: u32, now_ticks: i64) -> Option<ProbeFields> {
        self.metric_engine.send_probes(state, self.self_addr, to, seq, now_ticks)
    }

    pub fn receive_probe(&self, state: &mut ProbeState, from: MacAddr, fields: &ProbeFields, now_ticks: i64) -> Option<ProbeFields> {
        self.metric_engine.receive_probe(state, self.self_addr, from, fields, now_ticks)
    }

    /// Folds a `ProbeReply` into `state` and, if it resolved a fresh metric,
    /// installs it on the `self -> from` link via `add_link` (subject to the
    /// same damping check as any other metric update).
    pub fn receive_probe_reply(&self, state: &mut ProbeState, from: MacAddr, fields: &ProbeFields, in_if: u8, now_ticks: i64) -> Option<u32> {
        let current = self.link_metric(self.self_addr, from).unwrap_or_else(|| self.metric_engine.init_link_metric(false));
        let metric = self.metric_engine.receive_probe_reply(state, self.self_addr, from, fields, current, now_ticks)?;
        self.add_link(self.self_addr, from, in_if, in_if, metric, 0, now_ticks);
        Some(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::hop::HopEngine;

    fn addr(b: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, b])
    }

    fn cache(self_addr: MacAddr) -> LinkCache {
        LinkCache::new(self_addr, Box::new(HopEngine), 0)
    }

    #[test]
    fn insignificant_recent_metric_change_is_damped() {
        let lc = LinkCache::new(addr(1), Box::new(HopEngine), 5);
        lc.add_link(addr(1), addr(2), 0, 0, 100, 0, 0);
        lc.add_link(addr(1), addr(2), 0, 0, 102, 0, 1);
        assert_eq!(lc.link_metric(addr(1), addr(2)), Some(100), "a 2-unit change under the threshold is skipped");
        assert_eq!(lc.link_change_log_snapshot().iter().filter(|e| e.reason == LinkChangeReason::MetricChanged).count(), 0);
    }

    #[test]
    fn significant_metric_change_still_applies_under_damping() {
        let lc = LinkCache::new(addr(1), Box::new(HopEngine), 5);
        lc.add_link(addr(1), addr(2), 0, 0, 100, 0, 0);
        lc.add_link(addr(1), addr(2), 0, 0, 200, 0, 1);
        assert_eq!(lc.link_metric(addr(1), addr(2)), Some(200));
    }

    #[test]
    fn zero_threshold_disables_damping() {
        let lc = cache(addr(1));
        lc.add_link(addr(1), addr(2), 0, 0, 100, 0, 0);
        lc.add_link(addr(1), addr(2), 0, 0, 101, 0, 1);
        assert_eq!(lc.link_metric(addr(1), addr(2)), Some(101));
    }

    #[test]
    fn direct_link_is_found() {
        let lc = cache(addr(1));
        lc.add_link(addr(1), addr(2), 0, 0, 1, 0, 0);
        let hops = lc.fill_source_route(addr(2)).unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].addr, addr(2));
    }

    #[test]
    fn picks_lower_hop_count_path() {
        let lc = cache(addr(1));
        lc.add_link(addr(1), addr(2), 0, 0, 1, 0, 0);
        lc.add_link(addr(2), addr(3), 0, 0, 1, 0, 0);
        lc.add_link(addr(1), addr(3), 0, 0, 1, 0, 0);
        let hops = lc.fill_source_route(addr(3)).unwrap();
        assert_eq!(hops.len(), 1);
    }

    #[test]
    fn unreachable_destination_returns_none() {
        let lc = cache(addr(1));
        lc.add_link(addr(1), addr(2), 0, 0, 1, 0, 0);
        assert!(lc.fill_source_route(addr(99)).is_none());
    }

    #[test]
    fn route_error_removes_link() {
        let lc = cache(addr(1));
        lc.add_link(addr(1), addr(2), 0, 0, 1, 0, 0);
        assert!(lc.fill_source_route(addr(2)).is_some());
        lc.update_from_route_error(addr(1), addr(2), 1);
        assert!(lc.fill_source_route(addr(2)).is_none());
    }

    #[test]
    fn frequent_route_changes_trigger_damping() {
        let lc = cache(addr(1));
        let mut dampened = false;
        for t in 0..(FLAP_THRESHOLD as i64 + 1) {
            dampened = lc.note_route_change(addr(9), t * 100);
        }
        assert!(dampened);
        assert!(lc.is_route_dampened(addr(9), (FLAP_THRESHOLD as i64) * 100 + 1));
    }

    #[test]
    fn delete_interface_removes_links_on_that_interface() {
        let lc = cache(addr(1));
        lc.add_link(addr(1), addr(2), 0, 5, 1, 0, 0);
        lc.delete_interface(5, 10);
        assert!(lc.fill_source_route(addr(2)).is_none());
    }
}
