// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Route Request bookkeeping: per-target exponential backoff governing when
// we are allowed to (re)broadcast a request, and a per-source ring of
// recently seen (target, identifier) pairs so a flooded request is not
// rebroadcast or re-answered more than once. Grounded on sys/reqtable.h's
// `ReqTableEntry`/`SeenRequest` pair, whose `DuplicateSuppress` key and
// `NextID` counter are both per-target, not global.

use std::collections::HashMap;

use lqsr_util::MacAddr;

/// Ring size for the per-source duplicate-suppression window.
pub const SEEN_RING_CAPACITY: usize = 64;

pub const FIRST_BACKOFF_TICKS: i64 = lqsr_util::millis(500);
pub const MAX_BACKOFF_TICKS: i64 = lqsr_util::seconds(10);

struct TargetState {
    backoff_count: u32,
    next_allowed_ticks: i64,
    last_identifier: u32,
    resolved: bool,
    next_identifier: u32,
}

impl TargetState {
    fn new(seed: u32) -> Self {
        Self { backoff_count: 0, next_allowed_ticks: 0, last_identifier: 0, resolved: false, next_identifier: seed }
    }

    fn backoff_ticks(count: u32) -> i64 {
        if count == 0 {
            return 0;
        }
        let shift = (count - 1).min(62);
        (FIRST_BACKOFF_TICKS.saturating_mul(1i64 << shift)).min(MAX_BACKOFF_TICKS)
    }
}

/// Fixed-capacity ring of `(target, identifier)` pairs seen from a given
/// originator, used to drop duplicate flooded Route Requests.
struct SeenRing {
    entries: Vec<(MacAddr, u32)>,
    next_slot: usize,
}

impl SeenRing {
    fn new() -> Self {
        Self { entries: Vec::with_capacity(SEEN_RING_CAPACITY), next_slot: 0 }
    }

    fn contains(&self, target: MacAddr, identifier: u32) -> bool {
        self.entries.contains(&(target, identifier))
    }

    fn insert(&mut self, target: MacAddr, identifier: u32) {
        if self.entries.len() < SEEN_RING_CAPACITY {
            self.entries.push((target, identifier));
        } else {
            self.entries[self.next_slot] = (target, identifier);
            self.next_slot = (self.next_slot + 1) % SEEN_RING_CAPACITY;
        }
    }
}

/// Tracks in-flight Route Request state per destination and per originating
/// source, so the forwarder can decide whether to send/rebroadcast a
/// request and whether an incoming one is a duplicate.
pub struct RequestTable {
    targets: HashMap<MacAddr, TargetState>,
    seen_by_source: HashMap<MacAddr, SeenRing>,
    identifier_seed: u32,
}

impl RequestTable {
    pub fn new(random_seed: u32) -> Self {
        Self { targets: HashMap::new(), seen_by_source: HashMap::new(), identifier_seed: random_seed }
    }

    /// Allocates the next Route Request identifier for a search we are
    /// originating toward `target`. Each target has its own counter, so
    /// requests for different destinations never collide in the
    /// duplicate-suppression ring even when issued from the same source.
    pub fn next_request_identifier(&mut self, target: MacAddr) -> u32 {
        let seed = self.identifier_seed;
        let state = self.targets.entry(target).or_insert_with(|| TargetState::new(seed));
        let id = state.next_identifier;
        state.next_identifier = state.next_identifier.wrapping_add(1);
        id
    }

    /// Whether we are currently permitted to (re)send a Route Request for
    /// `target`, given the backoff schedule.
    pub fn should_send(&self, target: MacAddr, now_ticks: i64) -> bool {
        self.targets.get(&target).map(|s| now_ticks >= s.next_allowed_ticks).unwrap_or(true)
    }

    /// Record that we just sent (or rebroadcast) a request for `target`,
    /// advancing its backoff.
    pub fn record_sent(&mut self, target: MacAddr, identifier: u32, now_ticks: i64) {
        let seed = self.identifier_seed;
        let state = self.targets.entry(target).or_insert_with(|| TargetState::new(seed));
        state.backoff_count += 1;
        state.last_identifier = identifier;
        state.resolved = false;
        state.next_allowed_ticks = now_ticks + TargetState::backoff_ticks(state.backoff_count);
    }

    /// Record that a Route Reply resolved the outstanding search for
    /// `target`, resetting its backoff for the next time a search is needed.
    pub fn received_reply(&mut self, target: MacAddr) {
        if let Some(state) = self.targets.get_mut(&target) {
            state.backoff_count = 0;
            state.next_allowed_ticks = 0;
            state.resolved = true;
        }
    }

    /// Whether `(target, identifier)` from `source` has already been seen,
    /// i.e. whether an incoming Route Request is a duplicate that must not
    /// be rebroadcast or re-answered.
    pub fn is_duplicate(&self, source: MacAddr, target: MacAddr, identifier: u32) -> bool {
        self.seen_by_source.get(&source).map(|r| r.contains(target, identifier)).unwrap_or(false)
    }

    /// Mark `(target, identifier)` from `source` as seen.
    pub fn mark_seen(&mut self, source: MacAddr, target: MacAddr, identifier: u32) {
        self.seen_by_source.entry(source).or_insert_with(SeenRing::new).insert(target, identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, b])
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        assert_eq!(TargetState::backoff_ticks(1), FIRST_BACKOFF_TICKS);
        assert_eq!(TargetState::backoff_ticks(2), FIRST_BACKOFF_TICKS * 2);
        assert_eq!(TargetState::backoff_ticks(100), MAX_BACKOFF_TICKS);
    }

    #[test]
    fn should_send_respects_backoff_window() {
        let mut rt = RequestTable::new(1);
        let t = addr(1);
        assert!(rt.should_send(t, 0));
        rt.record_sent(t, 1, 0);
        assert!(!rt.should_send(t, 10));
        assert!(rt.should_send(t, FIRST_BACKOFF_TICKS + 1));
    }

    #[test]
    fn reply_resets_backoff() {
        let mut rt = RequestTable::new(1);
        let t = addr(2);
        rt.record_sent(t, 1, 0);
        rt.record_sent(t, 2, FIRST_BACKOFF_TICKS);
        rt.received_reply(t);
        assert!(rt.should_send(t, FIRST_BACKOFF_TICKS + 1));
    }

    #[test]
    fn duplicate_requests_are_suppressed() {
        let mut rt = RequestTable::new(1);
        let s = addr(5);
        let t = addr(9);
        assert!(!rt.is_duplicate(s, t, 42));
        rt.mark_seen(s, t, 42);
        assert!(rt.is_duplicate(s, t, 42));
        assert!(!rt.is_duplicate(s, t, 43));
    }

    #[test]
    fn same_source_and_id_for_different_targets_do_not_collide() {
        let mut rt = RequestTable::new(1);
        let s = addr(5);
        rt.mark_seen(s, addr(8), 42);
        assert!(rt.is_duplicate(s, addr(8), 42));
        assert!(!rt.is_duplicate(s, addr(9), 42), "a different target with the same id is not a duplicate");
    }

    #[test]
    fn each_target_gets_its_own_identifier_sequence() {
        let mut rt = RequestTable::new(100);
        let a = rt.next_request_identifier(addr(1));
        let b = rt.next_request_identifier(addr(1));
        let c = rt.next_request_identifier(addr(2));
        assert_eq!(a, 100);
        assert_eq!(b, 101);
        assert_eq!(c, 100, "a different target starts its own sequence from the seed");
    }

    #[test]
    fn seen_ring_evicts_oldest_after_capacity() {
        let mut rt = RequestTable::new(1);
        let s = addr(7);
        let t = addr(9);
        for i in 0..SEEN_RING_CAPACITY as u32 {
            rt.mark_seen(s, t, i);
        }
        assert!(rt.is_duplicate(s, t, 0));
        rt.mark_seen(s, t, 9999);
        assert!(!rt.is_duplicate(s, t, 0));
        assert!(rt.is_duplicate(s, t, 9999));
    }
}
