// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Frame codec and option parser. Grounded on Etx/src/mcl/sys/sr.h (the
// SRPacket/InternalOption family) for the in-memory shape and
// Etx/src/mcl/sys/crypto.c for the MAC/encrypt/pad framing.

use lqsr_crypto::{cbc, keymix, mac};
use lqsr_util::MacAddr;

use crate::error::{LqsrError, Result};
use crate::protocol::*;

#[derive(Debug, Clone, PartialEq)]
pub struct EtxEntry {
    pub from: MacAddr,
    pub out_if: u8,
    pub in_if: u8,
    pub rcvd: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeTail {
    None,
    PktPair { out_delta: u32 },
    Etx { entries: Vec<EtxEntry> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeFields {
    pub metric_type: u32,
    pub probe_type: u32,
    pub seq: u32,
    pub timestamp: u64,
    pub from: MacAddr,
    pub to: MacAddr,
    pub in_if: u8,
    pub out_if: u8,
    pub tail: ProbeTail,
}

/// One decoded LQSR option. Unknown option types are represented as `Unknown`
/// and re-encoded verbatim (skip-by-length semantics for forwarders that
/// don't understand them).
#[derive(Debug, Clone, PartialEq)]
pub enum LqsrOption {
    Pad1,
    PadN(u16),
    RouteRequest { identifier: u32, target: MacAddr, hops: Vec<HopEntry> },
    RouteReply { hops: Vec<HopEntry> },
    RouteError { error_src: MacAddr, error_dst: MacAddr, unreach_node: MacAddr, in_if: u8, out_if: u8, metric: u32 },
    AckReq { id: u16 },
    Ack { id: u16, from: MacAddr, to: MacAddr, in_if: u8, out_if: u8 },
    SourceRoute { static_route: bool, salvage_count: u8, segments_left: u8, hops: Vec<HopEntry> },
    InfoReq { identifier: u32, source_address: MacAddr },
    Info { identifier: u32, version: u32, info: Vec<u8> },
    Probe(ProbeFields),
    ProbeReply(ProbeFields),
    LinkInfo { from: MacAddr, links: Vec<HopEntry> },
    Unknown { option_type: u8, data: Vec<u8> },
}

impl LqsrOption {
    fn option_type(&self) -> u8 {
        match self {
            Self::Pad1 => OptionType::Pad1 as u8,
            Self::PadN(_) => OptionType::PadN as u8,
            Self::RouteRequest { .. } => OptionType::RouteRequest as u8,
            Self::RouteReply { .. } => OptionType::RouteReply as u8,
            Self::RouteError { .. } => OptionType::RouteError as u8,
            Self::AckReq { .. } => OptionType::AckReq as u8,
            Self::Ack { .. } => OptionType::Ack as u8,
            Self::SourceRoute { .. } => OptionType::SourceRoute as u8,
            Self::InfoReq { .. } => OptionType::InfoReq as u8,
            Self::Info { .. } => OptionType::Info as u8,
            Self::Probe(_) => OptionType::Probe as u8,
            Self::ProbeReply(_) => OptionType::ProbeReply as u8,
            Self::LinkInfo { .. } => OptionType::LinkInfo as u8,
            Self::Unknown { option_type, .. } => *option_type,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Pad1 => {}
            Self::PadN(n) => out.resize(out.len() + *n as usize, 0),
            Self::RouteRequest { identifier, target, hops } => {
                out.extend_from_slice(&identifier.to_le_bytes());
                out.extend_from_slice(target.as_bytes());
                encode_hops(out, hops);
            }
            Self::RouteReply { hops } => {
                out.extend_from_slice(&0u16.to_le_bytes());
                encode_hops(out, hops);
            }
            Self::RouteError { error_src, error_dst, unreach_node, in_if, out_if, metric } => {
                out.extend_from_slice(error_src.as_bytes());
                out.extend_from_slice(error_dst.as_bytes());
                out.extend_from_slice(unreach_node.as_bytes());
                out.push(*in_if);
                out.push(*out_if);
                out.extend_from_slice(&metric.to_le_bytes());
            }
            Self::AckReq { id } => out.extend_from_slice(&id.to_le_bytes()),
            Self::Ack { id, from, to, in_if, out_if } => {
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(from.as_bytes());
                out.extend_from_slice(to.as_bytes());
                out.push(*in_if);
                out.push(*out_if);
            }
            Self::SourceRoute { static_route, salvage_count, segments_left, hops } => {
                let bitfield: u16 = ((*static_route as u16) << 10) | (((*salvage_count as u16) & 0xF) << 6) | ((*segments_left as u16) & 0x3F);
                out.extend_from_slice(&bitfield.to_le_bytes());
                encode_hops(out, hops);
            }
            Self::InfoReq { identifier, source_address } => {
                out.extend_from_slice(&identifier.to_le_bytes());
                out.extend_from_slice(source_address.as_bytes());
            }
            Self::Info { identifier, version, info } => {
                out.extend_from_slice(&identifier.to_le_bytes());
                out.extend_from_slice(&version.to_le_bytes());
                out.extend_from_slice(info);
            }
            Self::Probe(p) | Self::ProbeReply(p) => encode_probe(out, p),
            Self::LinkInfo { from, links } => {
                out.extend_from_slice(from.as_bytes());
                encode_hops(out, links);
            }
            Self::Unknown { data, .. } => out.extend_from_slice(data),
        }
    }

    fn decode_payload(option_type: u8, data: &[u8]) -> Result<Self> {
        let ot = OptionType::from_u8(option_type);
        match ot {
            Some(OptionType::Pad1) => Ok(Self::Pad1),
            Some(OptionType::PadN) => Ok(Self::PadN(data.len() as u16)),
            Some(OptionType::RouteRequest) => {
                if data.len() < 10 {
                    return Err(LqsrError::MalformedOption);
                }
                let identifier = u32::from_le_bytes(data[0..4].try_into().unwrap());
                let target = read_mac(&data[4..10])?;
                let hops = decode_hops(&data[10..])?;
                Ok(Self::RouteRequest { identifier, target, hops })
            }
            Some(OptionType::RouteReply) => {
                if data.len() < 2 {
                    return Err(LqsrError::MalformedOption);
                }
                let hops = decode_hops(&data[2..])?;
                Ok(Self::RouteReply { hops })
            }
            Some(OptionType::RouteError) => {
                if data.len() < 20 {
                    return Err(LqsrError::MalformedOption);
                }
                let error_src = read_mac(&data[0..6])?;
                let error_dst = read_mac(&data[6..12])?;
                let unreach_node = read_mac(&data[12..18])?;
                let in_if = data[18];
                let out_if = data[19];
                let metric = u32::from_le_bytes(data.get(20..24).ok_or(LqsrError::MalformedOption)?.try_into().unwrap());
                Ok(Self::RouteError { error_src, error_dst, unreach_node, in_if, out_if, metric })
            }
            Some(OptionType::AckReq) => {
                if data.len() < 2 {
                    return Err(LqsrError::MalformedOption);
                }
                Ok(Self::AckReq { id: u16::from_le_bytes(data[0..2].try_into().unwrap()) })
            }
            Some(OptionType::Ack) => {
                if data.len() < 16 {
                    return Err(LqsrError::MalformedOption);
                }
                let id = u16::from_le_bytes(data[0..2].try_into().unwrap());
                let from = read_mac(&data[2..8])?;
                let to = read_mac(&data[8..14])?;
                let in_if = data[14];
                let out_if = data[15];
                Ok(Self::Ack { id, from, to, in_if, out_if })
            }
            Some(OptionType::SourceRoute) => {
                if data.len() < 2 {
                    return Err(LqsrError::MalformedOption);
                }
                let bitfield = u16::from_le_bytes(data[0..2].try_into().unwrap());
                let static_route = (bitfield >> 10) & 1 != 0;
                let salvage_count = ((bitfield >> 6) & 0xF) as u8;
                let segments_left = (bitfield & 0x3F) as u8;
                let hops = decode_hops(&data[2..])?;
                Ok(Self::SourceRoute { static_route, salvage_count, segments_left, hops })
            }
            Some(OptionType::InfoReq) => {
                if data.len() < 10 {
                    return Err(LqsrError::MalformedOption);
                }
                let identifier = u32::from_le_bytes(data[0..4].try_into().unwrap());
                let source_address = read_mac(&data[4..10])?;
                Ok(Self::InfoReq { identifier, source_address })
            }
            Some(OptionType::Info) => {
                if data.len() < 8 {
                    return Err(LqsrError::MalformedOption);
                }
                let identifier = u32::from_le_bytes(data[0..4].try_into().unwrap());
                let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
                Ok(Self::Info { identifier, version, info: data[8..].to_vec() })
            }
            Some(OptionType::Probe) => Ok(Self::Probe(decode_probe(data)?)),
            Some(OptionType::ProbeReply) => Ok(Self::ProbeReply(decode_probe(data)?)),
            Some(OptionType::LinkInfo) => {
                if data.len() < 6 {
                    return Err(LqsrError::MalformedOption);
                }
                let from = read_mac(&data[0..6])?;
                let links = decode_hops(&data[6..])?;
                Ok(Self::LinkInfo { from, links })
            }
            None => Ok(Self::Unknown { option_type, data: data.to_vec() }),
        }
    }
}

fn read_mac(b: &[u8]) -> Result<MacAddr> {
    let arr: [u8; 6] = b.try_into().map_err(|_| LqsrError::MalformedOption)?;
    Ok(MacAddr::new(arr))
}

fn encode_hops(out: &mut Vec<u8>, hops: &[HopEntry]) {
    for h in hops {
        out.extend_from_slice(h.addr.as_bytes());
        out.push(h.in_if);
        out.push(h.out_if);
        out.extend_from_slice(&h.metric.to_le_bytes());
    }
}

fn decode_hops(data: &[u8]) -> Result<Vec<HopEntry>> {
    if data.len() % HopEntry::WIRE_LEN != 0 {
        return Err(LqsrError::MalformedOption);
    }
    let mut hops = Vec::with_capacity(data.len() / HopEntry::WIRE_LEN);
    for chunk in data.chunks_exact(HopEntry::WIRE_LEN) {
        let addr = read_mac(&chunk[0..6])?;
        let in_if = chunk[6];
        let out_if = chunk[7];
        let metric = u32::from_le_bytes(chunk[8..12].try_into().unwrap());
        hops.push(HopEntry { addr, in_if, out_if, metric });
    }
    Ok(hops)
}

fn encode_probe(out: &mut Vec<u8>, p: &ProbeFields) {
    out.extend_from_slice(&p.metric_type.to_le_bytes());
    out.extend_from_slice(&p.probe_type.to_le_bytes());
    out.extend_from_slice(&p.seq.to_le_bytes());
    out.extend_from_slice(&p.timestamp.to_le_bytes());
    out.extend_from_slice(p.from.as_bytes());
    out.extend_from_slice(p.to.as_bytes());
    out.push(p.in_if);
    out.push(p.out_if);
    match &p.tail {
        ProbeTail::None => {}
        ProbeTail::PktPair { out_delta } => out.extend_from_slice(&out_delta.to_le_bytes()),
        ProbeTail::Etx { entries } => {
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for e in entries {
                out.extend_from_slice(e.from.as_bytes());
                out.push(e.out_if);
                out.push(e.in_if);
                out.extend_from_slice(&e.rcvd.to_le_bytes());
            }
        }
    }
}

const PROBE_FIXED_LEN: usize = 4 + 4 + 4 + 8 + 6 + 6 + 1 + 1;

fn decode_probe(data: &[u8]) -> Result<ProbeFields> {
    if data.len() < PROBE_FIXED_LEN {
        return Err(LqsrError::MalformedOption);
    }
    let metric_type = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let probe_type = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let seq = u32::from_le_bytes(data[8..12].try_into().unwrap());
    let timestamp = u64::from_le_bytes(data[12..20].try_into().unwrap());
    let from = read_mac(&data[20..26])?;
    let to = read_mac(&data[26..32])?;
    let in_if = data[32];
    let out_if = data[33];
    let rest = &data[PROBE_FIXED_LEN..];
    let tail = match MetricType::from_u32(metric_type) {
        Some(MetricType::PktPair) => {
            if rest.len() < 4 {
                return Err(LqsrError::MalformedOption);
            }
            ProbeTail::PktPair { out_delta: u32::from_le_bytes(rest[0..4].try_into().unwrap()) }
        }
        Some(MetricType::Etx) | Some(MetricType::Wcett) => {
            if rest.len() < 4 {
                return Err(LqsrError::MalformedOption);
            }
            let n = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
            if n > MAX_ETX_ENTRIES {
                return Err(LqsrError::MalformedOption);
            }
            const ENTRY_LEN: usize = 6 + 1 + 1 + 4;
            let body = &rest[4..];
            if body.len() < n * ENTRY_LEN {
                return Err(LqsrError::MalformedOption);
            }
            let mut entries = Vec::with_capacity(n);
            for chunk in body[..n * ENTRY_LEN].chunks_exact(ENTRY_LEN) {
                entries.push(EtxEntry { from: read_mac(&chunk[0..6])?, out_if: chunk[6], in_if: chunk[7], rcvd: u32::from_le_bytes(chunk[8..12].try_into().unwrap()) });
            }
            ProbeTail::Etx { entries }
        }
        _ => ProbeTail::None,
    };
    Ok(ProbeFields { metric_type, probe_type, seq, timestamp, from, to, in_if, out_if, tail })
}

/// A fully decoded LQSR frame: its option chain plus the (decrypted)
/// trailer/payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub options: Vec<LqsrOption>,
    pub next_header: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(next_header: u16, payload: Vec<u8>) -> Self {
        Self { options: Vec::new(), next_header, payload }
    }

    pub fn source_route(&self) -> Option<(bool, u8, u8, &[HopEntry])> {
        self.options.iter().find_map(|o| match o {
            LqsrOption::SourceRoute { static_route, salvage_count, segments_left, hops } => Some((*static_route, *salvage_count, *segments_left, hops.as_slice())),
            _ => None,
        })
    }
}

/// Keys used to MAC and encrypt a frame, already mixed with protocol version
/// and active metric type per the MAC-key-binding rule in §4.1.
pub struct FrameKeys {
    pub mac_key: [u8; mac::MAC_KEY_LEN],
    pub aes_key: [u8; cbc::AES_KEY_LEN],
    pub crypto_enabled: bool,
}

impl FrameKeys {
    pub fn new(raw_mac_key: &[u8; mac::MAC_KEY_LEN], aes_key: [u8; cbc::AES_KEY_LEN], metric_type: MetricType, crypto_enabled: bool) -> Self {
        Self { mac_key: keymix::mix_mac_key(raw_mac_key, PROTOCOL_VERSION, metric_type.as_u32()), aes_key, crypto_enabled }
    }
}

/// Encode a packet's option chain plus encrypted trailer+payload. `iv`
/// should be fresh random bytes from the Random Source when crypto is
/// enabled; pass all-zero when it is not (the wire all-zero IV is itself the
/// "crypto disabled" signal on decode).
///
/// Returns the bytes following `CODE` (i.e. header + options + ciphertext),
/// matching the §4.1 wire layout. The caller prepends its own Ethernet
/// header and the `CODE` word.
pub fn encode(packet: &Packet, keys: &FrameKeys, iv: [u8; IV_LEN], max_len: usize) -> Result<Vec<u8>> {
    let mut option_bytes = Vec::new();
    for opt in &packet.options {
        let mut payload = Vec::new();
        opt.encode_payload(&mut payload);
        if payload.len() > u16::MAX as usize {
            return Err(LqsrError::BufferTooSmall);
        }
        option_bytes.push(opt.option_type());
        option_bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        option_bytes.extend_from_slice(&payload);
    }
    if option_bytes.len() > u16::MAX as usize {
        return Err(LqsrError::BufferTooSmall);
    }

    let mut trailer_and_payload = Vec::with_capacity(2 + packet.payload.len());
    trailer_and_payload.extend_from_slice(&packet.next_header.to_le_bytes());
    trailer_and_payload.extend_from_slice(&packet.payload);

    let ciphertext = if keys.crypto_enabled {
        cbc::encrypt(&keys.aes_key, &iv, &trailer_and_payload)
    } else {
        cbc::pad(&trailer_and_payload)
    };

    let header_length = option_bytes.len() as u16;
    let total_len = LqsrHeader::SIZE + option_bytes.len() + ciphertext.len();
    if total_len > max_len {
        return Err(LqsrError::BufferTooSmall);
    }

    let mut authenticated = Vec::with_capacity(total_len - MAC_LEN);
    authenticated.extend_from_slice(&iv);
    authenticated.extend_from_slice(&header_length.to_le_bytes());
    authenticated.extend_from_slice(&option_bytes);
    authenticated.extend_from_slice(&ciphertext);

    let computed_mac = mac::compute(&keys.mac_key, &authenticated);

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&computed_mac);
    out.extend_from_slice(&authenticated);
    Ok(out)
}

/// Decode the bytes following `CODE` into a `Packet`. Verifies the MAC
/// before touching the option chain, per contract.
pub fn decode(frame: &[u8], keys: &FrameKeys) -> Result<Packet> {
    if frame.len() < LqsrHeader::SIZE {
        return Err(LqsrError::PayloadTooSmall);
    }
    let received_mac: [u8; MAC_LEN] = frame[0..MAC_LEN].try_into().unwrap();
    let authenticated = &frame[MAC_LEN..];
    if !mac::verify(&keys.mac_key, authenticated, &received_mac) {
        return Err(LqsrError::MacFailure);
    }

    let iv: [u8; IV_LEN] = frame[MAC_LEN..MAC_LEN + IV_LEN].try_into().unwrap();
    let header_length = u16::from_le_bytes(frame[MAC_LEN + IV_LEN..MAC_LEN + IV_LEN + 2].try_into().unwrap()) as usize;
    let options_start = LqsrHeader::SIZE;
    let options_end = options_start.checked_add(header_length).ok_or(LqsrError::MalformedOption)?;
    if options_end > frame.len() {
        return Err(LqsrError::MalformedOption);
    }

    let mut options = Vec::new();
    let mut cursor = options_start;
    while cursor < options_end {
        if cursor + 3 > options_end {
            return Err(LqsrError::MalformedOption);
        }
        let option_type = frame[cursor];
        let len = u16::from_le_bytes(frame[cursor + 1..cursor + 3].try_into().unwrap()) as usize;
        let data_start = cursor + 3;
        let data_end = data_start.checked_add(len).ok_or(LqsrError::MalformedOption)?;
        if data_end > options_end {
            return Err(LqsrError::MalformedOption);
        }
        options.push(LqsrOption::decode_payload(option_type, &frame[data_start..data_end])?);
        cursor = data_end;
    }

    let ciphertext = &frame[options_end..];
    let iv_is_zero = iv == [0u8; IV_LEN];
    let plaintext = if keys.crypto_enabled && !iv_is_zero {
        cbc::decrypt(&keys.aes_key, &iv, ciphertext).map_err(|_| LqsrError::PayloadTooSmall)?
    } else {
        cbc::unpad(ciphertext).map(|s| s.to_vec()).map_err(|_| LqsrError::PayloadTooSmall)?
    };
    if plaintext.len() < 2 {
        return Err(LqsrError::PayloadTooSmall);
    }
    let next_header = u16::from_le_bytes(plaintext[0..2].try_into().unwrap());
    let payload = plaintext[2..].to_vec();

    Ok(Packet { options, next_header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> FrameKeys {
        FrameKeys::new(&[0x00u8; 16], [0x10u8; 16], MetricType::Hop, true)
    }

    #[test]
    fn roundtrip_empty_options() {
        let k = keys();
        let pkt = Packet::new(0x0800, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        let encoded = encode(&pkt, &k, [0x20u8; 16], 1500).unwrap();
        let decoded = decode(&encoded, &k).unwrap();
        assert_eq!(decoded.next_header, pkt.next_header);
        assert_eq!(decoded.payload, pkt.payload);
        assert!(decoded.options.is_empty());
    }

    #[test]
    fn crypto_scenario_5_one_block_of_padding() {
        // §8 scenario 5: payload 0xAA BB CC DD, EtherType 0x0800 — the
        // encoded trailer+payload is exactly one 16-byte block.
        let mac_key = {
            let mut k = [0u8; 16];
            for i in 0..16 {
                k[i] = i as u8;
            }
            k
        };
        let aes_key = {
            let mut k = [0u8; 16];
            for i in 0..16 {
                k[i] = (0x10 + i) as u8;
            }
            k
        };
        let iv = {
            let mut k = [0u8; 16];
            for i in 0..16 {
                k[i] = (0x20 + i) as u8;
            }
            k
        };
        let k = FrameKeys::new(&mac_key, aes_key, MetricType::Hop, true);
        let pkt = Packet::new(0x0800, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        let encoded = encode(&pkt, &k, iv, 1500).unwrap();
        let trailer_and_payload_len = encoded.len() - LqsrHeader::SIZE;
        assert_eq!(trailer_and_payload_len, 16);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let k = keys();
        let pkt = Packet::new(0x0800, vec![1, 2, 3]);
        let mut encoded = encode(&pkt, &k, [0x11u8; 16], 1500).unwrap();
        encoded[0] ^= 0x01;
        assert_eq!(decode(&encoded, &k), Err(LqsrError::MacFailure));
    }

    #[test]
    fn roundtrip_source_route_option() {
        let k = keys();
        let mut pkt = Packet::new(0x0800, vec![9, 9]);
        pkt.options.push(LqsrOption::SourceRoute {
            static_route: false,
            salvage_count: 0,
            segments_left: 2,
            hops: vec![
                HopEntry { addr: MacAddr::new([0, 1, 2, 3, 4, 5]), in_if: 0, out_if: 1, metric: 1 },
                HopEntry { addr: MacAddr::new([6, 7, 8, 9, 10, 11]), in_if: 1, out_if: 2, metric: 1 },
                HopEntry { addr: MacAddr::new([12, 13, 14, 15, 16, 17]), in_if: 2, out_if: 0, metric: 1 },
            ],
        });
        let encoded = encode(&pkt, &k, [0x33u8; 16], 1500).unwrap();
        let decoded = decode(&encoded, &k).unwrap();
        assert_eq!(decoded.options, pkt.options);
    }

    #[test]
    fn encode_rejects_oversize_frame() {
        let k = keys();
        let pkt = Packet::new(0x0800, vec![0u8; 2000]);
        assert_eq!(encode(&pkt, &k, [0u8; 16], 64), Err(LqsrError::BufferTooSmall));
    }
}
