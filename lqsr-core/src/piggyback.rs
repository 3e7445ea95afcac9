// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Option coalescer: batches small options (ACKs, Route Replies/Errors, Info
// Replies) addressed to the same next hop into one outgoing frame instead
// of sending each as its own packet. Grounded on sys/sendq.h's pending-option
// list and the per-option coalescing windows it encodes.

use std::collections::HashMap;

use lqsr_util::MacAddr;

use crate::codec::LqsrOption;

/// How long an option may sit waiting for company before it must go out on
/// its own. Route Replies/Errors carry zero tolerance: they are time
/// sensitive and never delayed for coalescing.
pub const ACK_COALESCE_WINDOW_TICKS: i64 = lqsr_util::millis(80);
pub const INFO_COALESCE_WINDOW_TICKS: i64 = lqsr_util::millis(500);
pub const NO_COALESCE_WINDOW_TICKS: i64 = 0;

pub fn coalesce_window_for(option: &LqsrOption) -> i64 {
    match option {
        LqsrOption::Ack { .. } | LqsrOption::AckReq { .. } => ACK_COALESCE_WINDOW_TICKS,
        LqsrOption::Info { .. } | LqsrOption::InfoReq { .. } => INFO_COALESCE_WINDOW_TICKS,
        _ => NO_COALESCE_WINDOW_TICKS,
    }
}

struct PendingBatch {
    options: Vec<LqsrOption>,
    deadline_ticks: i64,
}

/// Per-next-hop queue of options waiting to be coalesced into the next
/// outgoing frame.
pub struct PiggybackQueue {
    batches: HashMap<MacAddr, PendingBatch>,
}

impl PiggybackQueue {
    pub fn new() -> Self {
        Self { batches: HashMap::new() }
    }

    /// Queue `option` for `next_hop`. Returns `true` if the caller should
    /// flush and send immediately (the option's own window is zero, or it
    /// just filled an already-due batch), `false` if it was merely queued.
    pub fn send_option(&mut self, next_hop: MacAddr, option: LqsrOption, now_ticks: i64) -> bool {
        let window = coalesce_window_for(&option);
        if window == 0 {
            self.batches.remove(&next_hop);
            return true;
        }
        let batch = self.batches.entry(next_hop).or_insert_with(|| PendingBatch { options: Vec::new(), deadline_ticks: now_ticks + window });
        batch.options.push(option);
        false
    }

    /// Pull every batch whose deadline has passed, for the caller to encode
    /// into one frame per next hop and send.
    pub fn flush_due(&mut self, now_ticks: i64) -> Vec<(MacAddr, Vec<LqsrOption>)> {
        let due: Vec<MacAddr> = self.batches.iter().filter(|(_, b)| now_ticks >= b.deadline_ticks).map(|(k, _)| *k).collect();
        due.into_iter().filter_map(|k| self.batches.remove(&k).map(|b| (k, b.options))).collect()
    }

    /// Immediately take and clear any pending batch for `next_hop`, e.g.
    /// when a zero-window option forces a flush alongside whatever had
    /// already been queued for the same neighbor.
    pub fn take(&mut self, next_hop: MacAddr) -> Vec<LqsrOption> {
        self.batches.remove(&next_hop).map(|b| b.options).unwrap_or_default()
    }

    pub fn pending_count(&self, next_hop: MacAddr) -> usize {
        self.batches.get(&next_hop).map(|b| b.options.len()).unwrap_or(0)
    }
}

impl Default for PiggybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, b])
    }

    fn ack(id: u16) -> LqsrOption {
        LqsrOption::Ack { id, from: addr(1), to: addr(2), in_if: 0, out_if: 0 }
    }

    fn route_reply() -> LqsrOption {
        LqsrOption::RouteReply { hops: vec![] }
    }

    #[test]
    fn zero_window_options_flush_immediately() {
        let mut q = PiggybackQueue::new();
        assert!(q.send_option(addr(1), route_reply(), 0));
        assert_eq!(q.pending_count(addr(1)), 0);
    }

    #[test]
    fn acks_coalesce_until_deadline() {
        let mut q = PiggybackQueue::new();
        assert!(!q.send_option(addr(1), ack(1), 0));
        assert!(!q.send_option(addr(1), ack(2), 10));
        assert_eq!(q.pending_count(addr(1)), 2);
        assert!(q.flush_due(10).is_empty());
        let flushed = q.flush_due(ACK_COALESCE_WINDOW_TICKS + 1);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.len(), 2);
    }

    #[test]
    fn take_clears_pending_batch() {
        let mut q = PiggybackQueue::new();
        q.send_option(addr(3), ack(5), 0);
        let taken = q.take(addr(3));
        assert_eq!(taken.len(), 1);
        assert_eq!(q.pending_count(addr(3)), 0);
    }
}
