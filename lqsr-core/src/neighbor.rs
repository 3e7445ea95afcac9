// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Neighbor cache: (virtual peer, local physical index) -> physical peer
// address, learned passively from any frame that reveals an immediate
// neighbor. One cache-wide lock per the concurrency model in §5.

use std::collections::HashMap;

use parking_lot::RwLock;

use lqsr_util::MacAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighborKey {
    pub virtual_addr: MacAddr,
    pub local_iface: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub physical_addr: MacAddr,
    pub last_update_ticks: i64,
}

#[derive(Default)]
pub struct NeighborCache {
    entries: RwLock<HashMap<NeighborKey, NeighborEntry>>,
}

impl NeighborCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn(&self, virtual_addr: MacAddr, local_iface: u8, physical_addr: MacAddr, now_ticks: i64) {
        self.entries.write().insert(NeighborKey { virtual_addr, local_iface }, NeighborEntry { physical_addr, last_update_ticks: now_ticks });
    }

    pub fn lookup(&self, virtual_addr: MacAddr, local_iface: u8) -> Option<NeighborEntry> {
        self.entries.read().get(&NeighborKey { virtual_addr, local_iface }).copied()
    }

    pub fn flush(&self, virtual_addr: MacAddr, local_iface: u8) {
        self.entries.write().remove(&NeighborKey { virtual_addr, local_iface });
    }

    pub fn flush_all(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter_snapshot(&self) -> Vec<(NeighborKey, NeighborEntry)> {
        self.entries.read().iter().map(|(k, v)| (*k, *v)).collect()
    }
}
