// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Send buffer: holds packets queued behind an in-progress Route Discovery,
// FIFO-by-arrival per destination, until a source route becomes available
// or the packet times out. Grounded on sys/sendbuf.h's `SendBufEntry` list.

use std::collections::{HashMap, VecDeque};

use lqsr_util::MacAddr;

pub const SENDBUF_TIMEOUT_TICKS: i64 = lqsr_util::seconds(5);
/// Cap on total queued packets across all destinations, enforced as a
/// simple admission check so one stalled destination can't exhaust memory.
pub const SENDBUF_MAX_QUEUED: usize = 256;

struct QueuedPacket {
    ether_type: u16,
    payload: Vec<u8>,
    queued_at_ticks: i64,
}

pub struct SendBuffer {
    by_dest: HashMap<MacAddr, VecDeque<QueuedPacket>>,
    total: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self { by_dest: HashMap::new(), total: 0 }
    }

    /// Queue a payload behind a route discovery for `dest`. Returns `false`
    /// (and drops the payload) if the buffer is already at capacity,
    /// matching `Resources`/`QueueFull` semantics at the caller.
    pub fn insert(&mut self, dest: MacAddr, ether_type: u16, payload: Vec<u8>, now_ticks: i64) -> bool {
        if self.total >= SENDBUF_MAX_QUEUED {
            return false;
        }
        self.by_dest.entry(dest).or_default().push_back(QueuedPacket { ether_type, payload, queued_at_ticks: now_ticks });
        self.total += 1;
        true
    }

    /// Called once a route to `dest` is resolved: drains every packet
    /// queued for it in FIFO order, for the caller to source-route and send.
    pub fn drain_ready(&mut self, dest: MacAddr) -> Vec<(u16, Vec<u8>)> {
        let Some(q) = self.by_dest.remove(&dest) else { return Vec::new() };
        self.total -= q.len();
        q.into_iter().map(|p| (p.ether_type, p.payload)).collect()
    }

    /// Drop every packet that has waited longer than `SENDBUF_TIMEOUT_TICKS`,
    /// returning the destinations that had packets timed out (so the caller
    /// can decide whether to retrigger a Route Request).
    pub fn expire(&mut self, now_ticks: i64) -> Vec<MacAddr> {
        let mut touched = Vec::new();
        self.by_dest.retain(|dest, q| {
            let before = q.len();
            q.retain(|p| now_ticks - p.queued_at_ticks <= SENDBUF_TIMEOUT_TICKS);
            if q.len() != before {
                touched.push(*dest);
            }
            !q.is_empty()
        });
        self.total = self.by_dest.values().map(|q| q.len()).sum();
        touched
    }

    pub fn queued_for(&self, dest: MacAddr) -> usize {
        self.by_dest.get(&dest).map(|q| q.len()).unwrap_or(0)
    }

    pub fn has_pending(&self, dest: MacAddr) -> bool {
        self.queued_for(dest) > 0
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}
