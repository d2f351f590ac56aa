/*!
Conversion between raw Ethernet frames and packet headers.

`decode` reads Ethernet, 802.1Q, IPv4, ARP, TCP and UDP headers into
header fields and keeps the whole frame as payload. `encode` writes the
header fields of a packet back into its frame, recomputing checksums.
Bytes the codec does not understand are passed through unchanged.
*/

use byteorder::{ByteOrder, NetworkEndian};
use crate::flowtable::{ETH_TYPE_ARP, ETH_TYPE_IPV4, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::header::{Field, MacAddr, Packet, Port, PortNo, SwitchId, Value};

use std::net::Ipv4Addr;

pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_PROBE: u16 = 0x88cc;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ARP_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Network {
    Ipv4 { offset: usize, header_len: usize },
    Arp { offset: usize },
    Other,
}

/// Where the headers of a frame start
#[derive(Debug, Clone, Copy)]
struct Layout {
    tagged: bool,
    eth_type: u16,
    network: Network,
    /// Offset and protocol of the transport header, if its ports are readable
    transport: Option<(usize, u8)>,
}

fn layout(frame: &[u8]) -> Option<Layout> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let mut eth_type = NetworkEndian::read_u16(&frame[12..14]);
    let mut offset = ETH_HEADER_LEN;
    let tagged = eth_type == ETH_TYPE_VLAN;
    if tagged {
        if frame.len() < ETH_HEADER_LEN + VLAN_TAG_LEN {
            return Some(Layout {
                tagged,
                eth_type,
                network: Network::Other,
                transport: None,
            });
        }
        eth_type = NetworkEndian::read_u16(&frame[16..18]);
        offset += VLAN_TAG_LEN;
    }

    let mut transport = None;
    let network = match eth_type {
        ETH_TYPE_IPV4 if frame.len() >= offset + 20 && frame[offset] >> 4 == 4 => {
            let header_len = usize::from(frame[offset] & 0x0f) * 4;
            if header_len < 20 || frame.len() < offset + header_len {
                Network::Other
            }
            else {
                let fragment = NetworkEndian::read_u16(&frame[offset + 6..offset + 8]) & 0x1fff;
                let proto = frame[offset + 9];
                let start = offset + header_len;
                if fragment == 0
                    && (proto == IP_PROTO_TCP || proto == IP_PROTO_UDP)
                    && frame.len() >= start + 4
                {
                    transport = Some((start, proto));
                }
                Network::Ipv4 { offset, header_len }
            }
        }
        ETH_TYPE_ARP if frame.len() >= offset + ARP_LEN => {
            let arp = &frame[offset..];
            // Ethernet hardware and IPv4 protocol addresses only
            if NetworkEndian::read_u16(&arp[0..2]) == 1
                && NetworkEndian::read_u16(&arp[2..4]) == ETH_TYPE_IPV4
                && arp[4] == 6
                && arp[5] == 4
            {
                Network::Arp { offset }
            }
            else {
                Network::Other
            }
        }
        _ => Network::Other,
    };

    Some(Layout {
        tagged,
        eth_type,
        network,
        transport,
    })
}

fn mac_at(frame: &[u8], offset: usize) -> MacAddr {
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&frame[offset..offset + 6]);
    MacAddr(octets)
}

fn ip_at(frame: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    )
}

/// Decodes a frame received on `(switch, inport)`.
/// A truncated or unknown header ends decoding; the fields read so far are kept.
pub fn decode(switch: SwitchId, inport: PortNo, raw: &[u8]) -> Packet {
    let pkt = Packet::with_payload(raw.to_vec())
        .modify(Field::Switch, Value::Int(switch))
        .modify(Field::Inport, Value::Port(Port::Physical(inport)));

    let layout = match layout(raw) {
        Some(layout) => layout,
        None => {
            trace!("Frame of {} bytes is too short for Ethernet", raw.len());
            return pkt;
        }
    };

    let mut pkt = pkt
        .modify(Field::DstMac, Value::Mac(mac_at(raw, 0)))
        .modify(Field::SrcMac, Value::Mac(mac_at(raw, 6)));
    if layout.tagged {
        if raw.len() < ETH_HEADER_LEN + VLAN_TAG_LEN {
            return pkt;
        }
        let tci = NetworkEndian::read_u16(&raw[14..16]);
        pkt = pkt
            .modify(Field::VlanId, Value::Int(u64::from(tci & 0x0fff)))
            .modify(Field::VlanPcp, Value::Int(u64::from(tci >> 13)));
    }
    pkt = pkt.modify(Field::EthType, Value::Int(u64::from(layout.eth_type)));

    match layout.network {
        Network::Ipv4 { offset, .. } => {
            pkt = pkt
                .modify(Field::Tos, Value::Int(u64::from(raw[offset + 1] & 0xfc)))
                .modify(Field::Protocol, Value::Int(u64::from(raw[offset + 9])))
                .modify(Field::SrcIp, Value::Ip(ip_at(raw, offset + 12)))
                .modify(Field::DstIp, Value::Ip(ip_at(raw, offset + 16)));
        }
        Network::Arp { offset } => {
            let opcode = NetworkEndian::read_u16(&raw[offset + 6..offset + 8]);
            pkt = pkt
                .modify(Field::Protocol, Value::Int(u64::from(opcode & 0xff)))
                .modify(Field::SrcIp, Value::Ip(ip_at(raw, offset + 14)))
                .modify(Field::DstIp, Value::Ip(ip_at(raw, offset + 24)));
        }
        Network::Other => {}
    }

    if let Some((offset, _)) = layout.transport {
        pkt = pkt
            .modify(
                Field::SrcPort,
                Value::Int(u64::from(NetworkEndian::read_u16(&raw[offset..offset + 2]))),
            )
            .modify(
                Field::DstPort,
                Value::Int(u64::from(NetworkEndian::read_u16(&raw[offset + 2..offset + 4]))),
            );
    }
    pkt
}

fn int(pkt: &Packet, field: Field) -> Option<u64> {
    pkt.get(&field).and_then(Value::as_int)
}

fn write_ip(frame: &mut [u8], offset: usize, ip: Ipv4Addr) {
    frame[offset..offset + 4].copy_from_slice(&ip.octets());
}

/// Encodes the header fields of `pkt` into a frame ready to be sent.
/// A packet without a frame gets a bare Ethernet header.
pub fn encode(pkt: &Packet) -> Vec<u8> {
    let mut frame = pkt.payload().to_vec();
    if frame.len() < ETH_HEADER_LEN {
        frame = vec![0; ETH_HEADER_LEN];
    }

    if let Some(mac) = pkt.get(&Field::DstMac).and_then(Value::as_mac) {
        frame[0..6].copy_from_slice(&mac.0);
    }
    if let Some(mac) = pkt.get(&Field::SrcMac).and_then(Value::as_mac) {
        frame[6..12].copy_from_slice(&mac.0);
    }

    let tagged = NetworkEndian::read_u16(&frame[12..14]) == ETH_TYPE_VLAN
        && frame.len() >= ETH_HEADER_LEN + VLAN_TAG_LEN;
    match (tagged, int(pkt, Field::VlanId)) {
        (true, Some(vid)) => {
            let pcp = int(pkt, Field::VlanPcp).unwrap_or(0);
            let tci = ((pcp as u16 & 0x7) << 13) | (vid as u16 & 0x0fff);
            NetworkEndian::write_u16(&mut frame[14..16], tci);
        }
        (true, None) => {
            frame.drain(12..16);
        }
        (false, Some(vid)) => {
            let pcp = int(pkt, Field::VlanPcp).unwrap_or(0);
            let tci = ((pcp as u16 & 0x7) << 13) | (vid as u16 & 0x0fff);
            let mut tag = [0u8; VLAN_TAG_LEN];
            NetworkEndian::write_u16(&mut tag[0..2], ETH_TYPE_VLAN);
            NetworkEndian::write_u16(&mut tag[2..4], tci);
            frame.splice(12..12, tag.iter().cloned());
        }
        (false, None) => {}
    }

    let layout = match layout(&frame) {
        Some(layout) => layout,
        None => return frame,
    };
    if let Some(eth_type) = int(pkt, Field::EthType) {
        let at = if layout.tagged { 16 } else { 12 };
        if frame.len() >= at + 2 {
            NetworkEndian::write_u16(&mut frame[at..at + 2], eth_type as u16);
        }
        // a changed ethertype invalidates the layout
        if eth_type as u16 != layout.eth_type {
            return frame;
        }
    }

    match layout.network {
        Network::Ipv4 { offset, header_len } => {
            if let Some(tos) = int(pkt, Field::Tos) {
                frame[offset + 1] = (tos as u8 & 0xfc) | (frame[offset + 1] & 0x03);
            }
            if let Some(ip) = pkt.get(&Field::SrcIp).and_then(Value::as_ip) {
                write_ip(&mut frame, offset + 12, ip);
            }
            if let Some(ip) = pkt.get(&Field::DstIp).and_then(Value::as_ip) {
                write_ip(&mut frame, offset + 16, ip);
            }
            NetworkEndian::write_u16(&mut frame[offset + 10..offset + 12], 0);
            let sum = checksum(&frame[offset..offset + header_len], 0);
            NetworkEndian::write_u16(&mut frame[offset + 10..offset + 12], sum);

            if let Some((start, proto)) = layout.transport {
                if let Some(port) = int(pkt, Field::SrcPort) {
                    NetworkEndian::write_u16(&mut frame[start..start + 2], port as u16);
                }
                if let Some(port) = int(pkt, Field::DstPort) {
                    NetworkEndian::write_u16(&mut frame[start + 2..start + 4], port as u16);
                }
                let total = usize::from(NetworkEndian::read_u16(&frame[offset + 2..offset + 4]));
                transport_checksum(&mut frame, offset, start, offset + total, proto);
            }
        }
        Network::Arp { offset } => {
            if let Some(ip) = pkt.get(&Field::SrcIp).and_then(Value::as_ip) {
                write_ip(&mut frame, offset + 14, ip);
            }
            if let Some(ip) = pkt.get(&Field::DstIp).and_then(Value::as_ip) {
                write_ip(&mut frame, offset + 24, ip);
            }
            if let Some(op) = int(pkt, Field::Protocol) {
                NetworkEndian::write_u16(&mut frame[offset + 6..offset + 8], op as u16);
            }
        }
        Network::Other => {}
    }
    frame
}

/// Recomputes the TCP or UDP checksum of the segment `frame[start..end]`.
/// Truncated segments and UDP datagrams without checksum are left alone.
fn transport_checksum(frame: &mut [u8], ip: usize, start: usize, end: usize, proto: u8) {
    let at = match proto {
        IP_PROTO_TCP => start + 16,
        IP_PROTO_UDP => start + 6,
        _ => return,
    };
    if end > frame.len() || at + 2 > end {
        return;
    }
    if proto == IP_PROTO_UDP && NetworkEndian::read_u16(&frame[at..at + 2]) == 0 {
        return;
    }

    let len = end - start;
    let mut pseudo = [0u8; 12];
    pseudo[0..8].copy_from_slice(&frame[ip + 12..ip + 20]);
    pseudo[9] = proto;
    NetworkEndian::write_u16(&mut pseudo[10..12], len as u16);

    NetworkEndian::write_u16(&mut frame[at..at + 2], 0);
    let mut sum = checksum(&frame[start..end], sum_words(&pseudo));
    if proto == IP_PROTO_UDP && sum == 0 {
        sum = 0xffff;
    }
    NetworkEndian::write_u16(&mut frame[at..at + 2], sum);
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            NetworkEndian::read_u16(chunk)
        }
        else {
            u16::from(chunk[0]) << 8
        };
        sum += u32::from(word);
    }
    sum
}

/// The internet checksum of `data`, continuing from a partial sum
pub fn checksum(data: &[u8], initial: u32) -> u16 {
    let mut sum = initial + sum_words(data);
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_frame() -> Vec<u8> {
        let mut frame = vec![
            0x00, 0x00, 0x00, 0x00, 0x00, 0x02, // dst
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // src
            0x08, 0x00, // ipv4
            0x45, 0x10, 0x00, 0x2c, 0x00, 0x01, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, // ..., csum
            10, 0, 0, 1, // src ip
            10, 0, 0, 2, // dst ip
            0x04, 0xd2, 0x00, 0x50, // 1234 -> 80
            0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // seq, ack
            0x50, 0x02, 0x72, 0x10, 0x00, 0x00, 0x00, 0x00, // flags, window, csum, urg
            b'p', b'i', b'n', b'g',
        ];
        let sum = checksum(&frame[14..34], 0);
        NetworkEndian::write_u16(&mut frame[24..26], sum);
        let end = frame.len();
        transport_checksum(&mut frame, 14, 34, end, IP_PROTO_TCP);
        frame
    }

    fn transport_sum_ok(frame: &[u8], ip: usize, start: usize) -> bool {
        let len = frame.len() - start;
        let mut pseudo = [0u8; 12];
        pseudo[0..8].copy_from_slice(&frame[ip + 12..ip + 20]);
        pseudo[9] = frame[ip + 9];
        NetworkEndian::write_u16(&mut pseudo[10..12], len as u16);
        checksum(&frame[start..], sum_words(&pseudo)) == 0
    }

    #[test]
    fn decode_tcp() {
        let pkt = decode(3, 2, &tcp_frame());
        assert_eq!(Some(&Value::Int(3)), pkt.get(&Field::Switch));
        assert_eq!(Some(&Value::Port(Port::Physical(2))), pkt.get(&Field::Inport));
        assert_eq!(Some(&Value::Mac(MacAddr::from_u64(1))), pkt.get(&Field::SrcMac));
        assert_eq!(Some(&Value::Mac(MacAddr::from_u64(2))), pkt.get(&Field::DstMac));
        assert_eq!(Some(&Value::Int(0x0800)), pkt.get(&Field::EthType));
        assert_eq!(Some(&Value::Int(0x10)), pkt.get(&Field::Tos));
        assert_eq!(Some(&Value::Int(6)), pkt.get(&Field::Protocol));
        assert_eq!(Some(&Value::Ip(Ipv4Addr::new(10, 0, 0, 1))), pkt.get(&Field::SrcIp));
        assert_eq!(Some(&Value::Ip(Ipv4Addr::new(10, 0, 0, 2))), pkt.get(&Field::DstIp));
        assert_eq!(Some(&Value::Int(1234)), pkt.get(&Field::SrcPort));
        assert_eq!(Some(&Value::Int(80)), pkt.get(&Field::DstPort));
        assert_eq!(None, pkt.get(&Field::VlanId));
        assert_eq!(&tcp_frame()[..], pkt.payload());
    }

    #[test]
    fn decode_arp() {
        let frame = vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06,
            0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01, // request
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 10, 0, 0, 1, // sender
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 10, 0, 0, 2, // target
        ];
        let pkt = decode(1, 1, &frame);
        assert_eq!(Some(&Value::Mac(MacAddr::BROADCAST)), pkt.get(&Field::DstMac));
        assert_eq!(Some(&Value::Int(0x0806)), pkt.get(&Field::EthType));
        assert_eq!(Some(&Value::Int(1)), pkt.get(&Field::Protocol));
        assert_eq!(Some(&Value::Ip(Ipv4Addr::new(10, 0, 0, 1))), pkt.get(&Field::SrcIp));
        assert_eq!(Some(&Value::Ip(Ipv4Addr::new(10, 0, 0, 2))), pkt.get(&Field::DstIp));
        assert_eq!(None, pkt.get(&Field::SrcPort));
    }

    #[test]
    fn decode_vlan() {
        let mut frame = tcp_frame();
        frame.splice(12..12, vec![0x81, 0x00, 0xa0, 0x2a]);
        let pkt = decode(1, 1, &frame);
        assert_eq!(Some(&Value::Int(42)), pkt.get(&Field::VlanId));
        assert_eq!(Some(&Value::Int(5)), pkt.get(&Field::VlanPcp));
        assert_eq!(Some(&Value::Int(0x0800)), pkt.get(&Field::EthType));
        assert_eq!(Some(&Value::Int(80)), pkt.get(&Field::DstPort));
    }

    #[test]
    fn truncated_frames_keep_what_was_read() {
        let frame = tcp_frame();
        let pkt = decode(1, 4, &frame[..20]);
        assert!(pkt.get(&Field::SrcMac).is_some());
        assert_eq!(Some(&Value::Int(0x0800)), pkt.get(&Field::EthType));
        assert_eq!(None, pkt.get(&Field::SrcIp));

        let pkt = decode(1, 4, &frame[..36]);
        assert!(pkt.get(&Field::DstIp).is_some());
        assert_eq!(None, pkt.get(&Field::SrcPort));

        let pkt = decode(1, 4, &frame[..5]);
        assert_eq!(2, pkt.fields().count());
        assert_eq!(5, pkt.payload().len());
    }

    #[test]
    fn unknown_ethertype() {
        let mut frame = tcp_frame();
        frame[12] = 0x86;
        frame[13] = 0xdd;
        let pkt = decode(1, 1, &frame);
        assert_eq!(Some(&Value::Int(0x86dd)), pkt.get(&Field::EthType));
        assert_eq!(None, pkt.get(&Field::SrcIp));
        assert_eq!(frame, encode(&pkt));
    }

    #[test]
    fn encode_rewrites_fields_and_checksums() {
        let pkt = decode(1, 1, &tcp_frame())
            .modify(Field::DstIp, Value::Ip(Ipv4Addr::new(10, 0, 0, 9)))
            .modify(Field::DstPort, Value::Int(8080))
            .modify(Field::DstMac, Value::Mac(MacAddr::from_u64(9)));
        let frame = encode(&pkt);
        assert_eq!(tcp_frame().len(), frame.len());
        assert_eq!(0, checksum(&frame[14..34], 0));
        assert!(transport_sum_ok(&frame, 14, 34));

        let again = decode(1, 1, &frame);
        assert_eq!(Some(&Value::Ip(Ipv4Addr::new(10, 0, 0, 9))), again.get(&Field::DstIp));
        assert_eq!(Some(&Value::Int(8080)), again.get(&Field::DstPort));
        assert_eq!(Some(&Value::Mac(MacAddr::from_u64(9))), again.get(&Field::DstMac));
        assert_eq!(&frame[54..], b"ping");
    }

    #[test]
    fn unchanged_packets_encode_to_their_frame() {
        let frame = tcp_frame();
        assert_eq!(frame, encode(&decode(1, 1, &frame)));
    }

    #[test]
    fn vlan_tags_are_pushed_and_stripped() {
        let plain = decode(1, 1, &tcp_frame());
        let tagged = encode(&plain.modify(Field::VlanId, Value::Int(7)));
        assert_eq!(tcp_frame().len() + 4, tagged.len());
        assert_eq!(&[0x81, 0x00, 0x00, 0x07, 0x08, 0x00], &tagged[12..18]);

        let stripped = encode(&decode(1, 1, &tagged).pop(&Field::VlanId));
        assert_eq!(tcp_frame(), stripped);
    }

    #[test]
    fn synthesized_packets_get_an_ethernet_header() {
        let pkt = Packet::from_fields(vec![
            (Field::SrcMac, Value::Mac(MacAddr::from_u64(1))),
            (Field::DstMac, Value::Mac(MacAddr::BROADCAST)),
            (Field::EthType, Value::Int(u64::from(ETH_TYPE_PROBE))),
        ]);
        let frame = encode(&pkt);
        assert_eq!(
            vec![0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 1, 0x88, 0xcc],
            frame
        );
    }
}
