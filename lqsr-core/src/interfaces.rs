// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// External Interfaces: the boundary the core calls out through to send
// frames, deliver decrypted payloads to the host stack, and get randomness.
// Modeled on the `SystemInterface`/`InnerProtocolInterface` split used
// elsewhere in this tree — synchronous trait methods the embedder
// implements, not an async-trait boundary, since the core's own locking
// model assumes callbacks don't block on I/O.

use lqsr_util::MacAddr;

use crate::error::Result;

/// The physical link layer: raw frame transmission per local interface.
pub trait LinkLayer: Send + Sync {
    /// Transmit a fully encoded LQSR frame (the bytes returned by
    /// `codec::encode`, already prefixed with an Ethernet header by the
    /// caller) out local interface `out_if` toward `next_hop`.
    fn send_frame(&self, out_if: u8, next_hop: MacAddr, frame: &[u8]) -> Result<()>;

    /// Maximum payload size the interface can carry, used when deciding how
    /// many options can be piggybacked onto one frame.
    fn mtu(&self, if_index: u8) -> usize;

    /// Local interfaces currently up and eligible for LQSR traffic.
    fn active_interfaces(&self) -> Vec<u8>;

    /// This node's own address on a given local interface.
    fn local_address(&self, if_index: u8) -> Option<MacAddr>;
}

/// The virtual adapter surface presented to the rest of the host stack:
/// where decrypted, de-source-routed payloads are delivered, and where the
/// host learns about topology changes worth acting on.
pub trait VirtualAdapterHost: Send + Sync {
    /// A payload addressed to this node arrived and was authenticated,
    /// decrypted, and stripped of LQSR framing; `ether_type` is the
    /// original next-header value.
    fn deliver(&self, ether_type: u16, payload: &[u8]);

    /// The link cache's view of this node's connectivity changed in a way
    /// the host may want to react to (e.g. reachability of a peer flipped).
    fn on_route_changed(&self, destination: MacAddr, reachable: bool);
}

/// Source of randomness for nonces, IVs, and Route Request identifiers.
/// Kept as a narrow trait so tests can supply a deterministic source.
pub trait RandomSource: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);

    fn next_u32(&self) -> u32 {
        let mut b = [0u8; 4];
        self.fill_bytes(&mut b);
        u32::from_le_bytes(b)
    }
}
