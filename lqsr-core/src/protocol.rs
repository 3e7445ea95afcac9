// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Wire-format constants for the LQSR frame. Grounded on
// Etx/src/mcl/inc/lqsr.h (struct layouts) with the accessor-method idiom
// from zerotier-network-hypervisor/src/vl1/protocol.rs (packed header
// structs + small helper methods).

/// Demultiplex constant placed immediately after the Ethernet header.
/// Frames lacking this value are not LQSR's concern.
pub const CODE: u32 = 0xC0DE_8AF7;

/// EtherType under which LQSR frames are carried.
pub const ETHERTYPE_LQSR: u16 = 0x886F;

pub const MAC_LEN: usize = 16;
pub const IV_LEN: usize = 16;

/// Maximum hops representable in a source route.
pub const MAX_SR_LEN: usize = 8;

/// Minimum Ethernet frame payload the core assumes a physical interface can
/// carry; below this, LinkInfo/Route-Reply piggyback budget checks fail.
pub const PROTOCOL_MIN_FRAME_SIZE: usize = 512;

/// Maximum ETX probe history entries serialized into one PROBE option.
pub const MAX_ETX_ENTRIES: usize = 40;

/// Current protocol version; part of the MAC-key mix.
pub const PROTOCOL_VERSION: u32 = 1;

/// LQSR option type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionType {
    Pad1 = 0,
    PadN = 1,
    RouteRequest = 2,
    RouteReply = 3,
    RouteError = 4,
    AckReq = 5,
    Ack = 6,
    SourceRoute = 7,
    InfoReq = 8,
    Info = 9,
    Probe = 10,
    ProbeReply = 11,
    LinkInfo = 12,
}

impl OptionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Pad1,
            1 => Self::PadN,
            2 => Self::RouteRequest,
            3 => Self::RouteReply,
            4 => Self::RouteError,
            5 => Self::AckReq,
            6 => Self::Ack,
            7 => Self::SourceRoute,
            8 => Self::InfoReq,
            9 => Self::Info,
            10 => Self::Probe,
            11 => Self::ProbeReply,
            12 => Self::LinkInfo,
            _ => return None,
        })
    }
}

/// Metric-type tag: both a configuration choice and a component of the
/// MAC-key mix, so peers running different metrics cannot authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MetricType {
    Hop = 0,
    Rtt = 1,
    PktPair = 2,
    Etx = 3,
    Wcett = 4,
}

impl MetricType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Hop,
            1 => Self::Rtt,
            2 => Self::PktPair,
            3 => Self::Etx,
            4 => Self::Wcett,
            _ => return None,
        })
    }
}

/// Fixed-size frame header: MAC, IV, and the option-chain length. Appears
/// immediately after the `CODE` demultiplex word.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LqsrHeader {
    pub mac: [u8; MAC_LEN],
    pub iv: [u8; IV_LEN],
    pub header_length: u16,
}

impl LqsrHeader {
    pub const SIZE: usize = MAC_LEN + IV_LEN + 2;
}

/// A single hop in a source route, route request, route reply, or link-info
/// option: the neighbor address plus the physical interfaces the link uses
/// and its current metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopEntry {
    pub addr: lqsr_util::MacAddr,
    pub in_if: u8,
    pub out_if: u8,
    pub metric: u32,
}

impl HopEntry {
    pub const WIRE_LEN: usize = 6 + 1 + 1 + 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_wire_layout() {
        assert_eq!(std::mem::size_of::<LqsrHeader>(), LqsrHeader::SIZE);
    }

    #[test]
    fn option_type_roundtrips() {
        for v in 0u8..=12 {
            assert!(OptionType::from_u8(v).is_some());
        }
        assert!(OptionType::from_u8(13).is_none());
    }
}
