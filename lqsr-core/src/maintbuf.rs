// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Hop-by-hop maintenance buffer: tracks packets sent to each next hop that
// requested (or triggered) an acknowledgment, retransmits on timeout, and
// hands packets off for salvage once retries are exhausted. Grounded on
// sys/maintbuf.h's `MaintBufEntry` list, reworked as a per-next-hop map of
// small per-packet queues instead of one global linked list.

use std::collections::{HashMap, VecDeque};

use lqsr_util::MacAddr;

pub const REXMIT_TIMEOUT_TICKS: i64 = lqsr_util::millis(500);
pub const MAX_REXMIT: u32 = 2;
pub const MAX_SALVAGE_COUNT: u8 = 15;
pub const IDLE_EVICTION_TICKS: i64 = lqsr_util::seconds(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    AwaitingAck,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub ack_id: u16,
    pub frame: Vec<u8>,
    pub salvage_count: u8,
    pub sent_at_ticks: i64,
    pub retries: u32,
    pub final_dest: MacAddr,
    pub orig_source: MacAddr,
}

struct NextHopQueue {
    state: LinkState,
    pending: VecDeque<PendingPacket>,
    next_id: u16,
    last_acked: u16,
    last_activity_ticks: i64,
}

impl NextHopQueue {
    fn new(now_ticks: i64) -> Self {
        Self { state: LinkState::Idle, pending: VecDeque::new(), next_id: 1, last_acked: 0, last_activity_ticks: now_ticks }
    }

    /// Wraparound-aware test for whether `ack_num` is a currently
    /// outstanding, not-yet-acked identifier: `0 < (ack - lastAcked) <
    /// (nextId - lastAcked)` computed modulo 2^16.
    fn ack_is_valid(&self, ack_num: u16) -> bool {
        let delta = ack_num.wrapping_sub(self.last_acked);
        let span = self.next_id.wrapping_sub(self.last_acked);
        delta != 0 && delta < span
    }
}

/// Destinations for which we track ACK state, keyed by (next hop address,
/// outgoing interface) so two interfaces to the same neighbor don't share
/// sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaintKey {
    pub next_hop: MacAddr,
    pub out_if: u8,
}

pub struct MaintenanceBuffer {
    queues: HashMap<MaintKey, NextHopQueue>,
}

/// Result of one `sweep`: frames to blindly retransmit as-is, and pending
/// packets that exhausted retries and need salvage (a new route) instead.
#[derive(Default)]
pub struct SweepResult {
    pub retransmit: Vec<(MaintKey, Vec<u8>)>,
    pub salvage: Vec<(MaintKey, PendingPacket)>,
}

impl MaintenanceBuffer {
    pub fn new() -> Self {
        Self { queues: HashMap::new() }
    }

    /// Allocate the next ACK identifier for a packet about to be sent
    /// hop-by-hop to `key`, registering it as outstanding.
    pub fn send(&mut self, key: MaintKey, frame: Vec<u8>, salvage_count: u8, final_dest: MacAddr, orig_source: MacAddr, now_ticks: i64) -> u16 {
        let q = self.queues.entry(key).or_insert_with(|| NextHopQueue::new(now_ticks));
        let id = q.next_id;
        q.next_id = q.next_id.wrapping_add(1);
        q.pending.push_back(PendingPacket { ack_id: id, frame, salvage_count, sent_at_ticks: now_ticks, retries: 0, final_dest, orig_source });
        q.state = LinkState::AwaitingAck;
        q.last_activity_ticks = now_ticks;
        id
    }

    /// Fill in the encoded frame for an already-registered pending packet,
    /// once it's known (the frame's AckReq option embeds the identifier
    /// `send` allocated, so it can only be encoded after that call).
    pub fn set_frame(&mut self, key: MaintKey, ack_id: u16, frame: Vec<u8>) {
        if let Some(q) = self.queues.get_mut(&key) {
            if let Some(p) = q.pending.iter_mut().find(|p| p.ack_id == ack_id) {
                p.frame = frame;
            }
        }
    }

    /// Process an incoming ACK: cumulatively releases every pending packet
    /// whose id falls in `(last_acked, ack_id]` modulo 2^16, not just the one
    /// whose id exactly matches, since one ACK covers everything sent before
    /// it. Ignores stale or forged acknowledgments outside the outstanding
    /// window.
    pub fn receive_ack(&mut self, key: MaintKey, ack_id: u16, now_ticks: i64) -> bool {
        let Some(q) = self.queues.get_mut(&key) else { return false };
        if !q.ack_is_valid(ack_id) {
            return false;
        }
        let old_acked = q.last_acked;
        let before = q.pending.len();
        q.pending.retain(|p| {
            let delta = p.ack_id.wrapping_sub(old_acked);
            let span = ack_id.wrapping_sub(old_acked);
            !(delta != 0 && delta <= span)
        });
        if q.pending.len() < before {
            q.last_acked = ack_id;
            q.last_activity_ticks = now_ticks;
            if q.pending.is_empty() {
                q.state = LinkState::Idle;
            }
            true
        } else {
            false
        }
    }

    /// Advance one tick: retransmit packets past their timeout, or hand them
    /// to the caller for salvage once `MAX_REXMIT` has been exceeded. The
    /// caller is responsible for rewriting the source route and resending;
    /// entries only leave the queue once salvage succeeds or the salvage
    /// budget is exhausted.
    pub fn sweep(&mut self, now_ticks: i64) -> SweepResult {
        let mut result = SweepResult::default();
        self.queues.retain(|_, q| {
            if q.pending.is_empty() && now_ticks - q.last_activity_ticks > IDLE_EVICTION_TICKS {
                return false;
            }
            true
        });
        for (key, q) in self.queues.iter_mut() {
            let mut still_pending = VecDeque::new();
            while let Some(mut p) = q.pending.pop_front() {
                if now_ticks < p.sent_at_ticks + REXMIT_TIMEOUT_TICKS {
                    still_pending.push_back(p);
                    continue;
                }
                if p.retries < MAX_REXMIT {
                    p.retries += 1;
                    p.sent_at_ticks = now_ticks;
                    result.retransmit.push((*key, p.frame.clone()));
                    still_pending.push_back(p);
                } else {
                    q.state = LinkState::Failed;
                    result.salvage.push((*key, p));
                }
            }
            q.pending = still_pending;
        }
        result
    }

    pub fn state(&self, key: MaintKey) -> LinkState {
        self.queues.get(&key).map(|q| q.state).unwrap_or(LinkState::Idle)
    }

    pub fn pending_count(&self, key: MaintKey) -> usize {
        self.queues.get(&key).map(|q| q.pending.len()).unwrap_or(0)
    }
}

impl Default for MaintenanceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a packet that just exhausted its retransmissions may still be
/// salvaged onto an alternate route, per the `MAX_SALVAGE_COUNT` budget.
pub fn can_salvage(salvage_count: u8) -> bool {
    salvage_count < MAX_SALVAGE_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MaintKey {
        MaintKey { next_hop: MacAddr::new([1; 6]), out_if: 0 }
    }

    fn dest() -> MacAddr {
        MacAddr::new([2; 6])
    }

    fn source() -> MacAddr {
        MacAddr::new([3; 6])
    }

    #[test]
    fn valid_ack_removes_pending_packet() {
        let mut mb = MaintenanceBuffer::new();
        let id = mb.send(key(), vec![1, 2, 3], 0, dest(), source(), 0);
        assert_eq!(mb.pending_count(key()), 1);
        assert!(mb.receive_ack(key(), id, 10));
        assert_eq!(mb.pending_count(key()), 0);
        assert_eq!(mb.state(key()), LinkState::Idle);
    }

    #[test]
    fn ack_cumulatively_releases_lower_pending_ids() {
        let mut mb = MaintenanceBuffer::new();
        mb.send(key(), vec![1], 0, dest(), source(), 0);
        mb.send(key(), vec![2], 0, dest(), source(), 0);
        let id3 = mb.send(key(), vec![3], 0, dest(), source(), 0);
        assert_eq!(mb.pending_count(key()), 3);
        assert!(mb.receive_ack(key(), id3, 10));
        assert_eq!(mb.pending_count(key()), 0, "acking the third packet releases the first two as well");
    }

    #[test]
    fn ack_wraparound_releases_packets_sent_before_the_wrap() {
        let mut mb = MaintenanceBuffer::new();
        // Drive next_id to just below the wrap so the pending ids are
        // 0xFFFE, 0xFFFF, 0x0000.
        mb.queues.entry(key()).or_insert_with(|| NextHopQueue::new(0)).next_id = 0xFFFE;
        mb.send(key(), vec![1], 0, dest(), source(), 0);
        mb.send(key(), vec![2], 0, dest(), source(), 0);
        let last = mb.send(key(), vec![3], 0, dest(), source(), 0);
        assert_eq!(last, 0x0000);
        assert_eq!(mb.pending_count(key()), 3);
        assert!(mb.receive_ack(key(), 0x0000, 10));
        assert_eq!(mb.pending_count(key()), 0, "ack at 0x0000 must release 0xFFFE, 0xFFFF, and 0x0000 together");
    }

    #[test]
    fn stale_ack_is_rejected() {
        let mut mb = MaintenanceBuffer::new();
        let id = mb.send(key(), vec![1], 0, dest(), source(), 0);
        mb.receive_ack(key(), id, 10);
        // Replaying the same (now stale) ack should not panic or re-match.
        assert!(!mb.receive_ack(key(), id, 20));
    }

    #[test]
    fn sweep_retransmits_then_salvages() {
        let mut mb = MaintenanceBuffer::new();
        mb.send(key(), vec![9], 0, dest(), source(), 0);
        let r = mb.sweep(REXMIT_TIMEOUT_TICKS + 1);
        assert!(r.salvage.is_empty());
        assert_eq!(r.retransmit.len(), 1);
        assert_eq!(mb.pending_count(key()), 1);

        let r = mb.sweep(2 * REXMIT_TIMEOUT_TICKS + 2);
        assert!(r.salvage.is_empty());
        assert_eq!(r.retransmit.len(), 1);

        let r = mb.sweep(3 * REXMIT_TIMEOUT_TICKS + 3);
        assert_eq!(r.salvage.len(), 1);
        assert_eq!(mb.state(key()), LinkState::Failed);
    }

    #[test]
    fn idle_entry_is_evicted_after_timeout() {
        let mut mb = MaintenanceBuffer::new();
        let id = mb.send(key(), vec![1], 0, dest(), source(), 0);
        mb.receive_ack(key(), id, 1);
        mb.sweep(IDLE_EVICTION_TICKS + 2);
        assert_eq!(mb.state(key()), LinkState::Idle);
        assert_eq!(mb.pending_count(key()), 0);
    }

    #[test]
    fn salvage_budget_is_enforced() {
        assert!(can_salvage(0));
        assert!(can_salvage(MAX_SALVAGE_COUNT - 1));
        assert!(!can_salvage(MAX_SALVAGE_COUNT));
    }
}
