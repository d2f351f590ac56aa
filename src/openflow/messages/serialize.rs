/*!
All serialization and construction routines for the OpenFlow message primitives

Use the trait `OfpPacket` for serialization implementations of messages
that are sent. Other primitives that are part of a message should
implement a serialize funtion that operates on a given byte stream.
*/

use crate::flowtable::{FlowAction, FlowMatch, FlowMod, FlowModCommand};
use crate::header::{Port, PortNo};
use crate::openflow::messages::*;

use byteorder::{NetworkEndian, WriteBytesExt};
use std::convert::From;
use std::io;
use std::io::Write;
use std::mem::size_of;

impl OfpHeader {
    /// Constructs an `OfpHeader`
    pub fn new(typ: OfpType, xid: u32) -> OfpHeader {
        OfpHeader {
            version: OFP_VERSION,
            typ: typ as u8,
            length: OfpHeader::header_length() as u16,
            xid: xid,
        }
    }

    /// Returns the fixed header length of 8 (in byte)
    pub fn header_length() -> usize {
        size_of::<OfpHeader>()
    }

    /// Returns the body length in byte
    pub fn body_length(&self) -> usize {
        (self.length as usize).saturating_sub(OfpHeader::header_length())
    }

    /// Serializes this header on the given stream
    pub fn serialize<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_all(&[self.version, self.typ])?;
        stream.write_u16::<NetworkEndian>(self.length)?;
        stream.write_u32::<NetworkEndian>(self.xid)
    }
}

/// The OpenFlow 1.0 number of a port. Physical ports beyond `OFPP_MAX` have none.
pub fn port_number(port: Port) -> u16 {
    match port {
        Port::Physical(n) if n < PortNo::from(OFPP_MAX) => n as u16,
        Port::Physical(n) => {
            warn!("Port {} cannot be addressed with OpenFlow 1.0", n);
            OFPP_NONE
        }
        Port::Flood => OFPP_FLOOD,
        Port::Controller => OFPP_CONTROLLER,
    }
}

impl OfpMatch {
    /// Constructs a match that matches every packet.
    pub fn new() -> OfpMatch {
        OfpMatch {
            wildcards: OFPFW_ALL,
            in_port: 0,
            dl_src: [0; 6],
            dl_dst: [0; 6],
            dl_vlan: 0,
            dl_vlan_pcp: 0,
            pad1: [0],
            dl_type: 0,
            nw_tos: 0,
            nw_proto: 0,
            pad2: [0; 2],
            nw_src: 0,
            nw_dst: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }

    fn exact(&mut self, wildcard: OfpFlowWildcards) {
        self.wildcards &= !(wildcard as u32);
    }

    /// Sets the number of wildcarded low bits of an address field
    fn prefix(&mut self, shift: u32, len: u8) {
        let ignored = 32 - u32::from(len.min(32));
        self.wildcards = (self.wildcards & !(0x3f << shift)) | (ignored << shift);
    }

    fn serialize<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_u32::<NetworkEndian>(self.wildcards)?;
        stream.write_u16::<NetworkEndian>(self.in_port)?;
        stream.write_all(&self.dl_src)?;
        stream.write_all(&self.dl_dst)?;
        stream.write_u16::<NetworkEndian>(self.dl_vlan)?;
        stream.write_u8(self.dl_vlan_pcp)?;
        stream.write_all(&self.pad1)?;
        stream.write_u16::<NetworkEndian>(self.dl_type)?;
        stream.write_u8(self.nw_tos)?;
        stream.write_u8(self.nw_proto)?;
        stream.write_all(&self.pad2)?;
        stream.write_u32::<NetworkEndian>(self.nw_src)?;
        stream.write_u32::<NetworkEndian>(self.nw_dst)?;
        stream.write_u16::<NetworkEndian>(self.tp_src)?;
        stream.write_u16::<NetworkEndian>(self.tp_dst)
    }
}

impl Default for OfpMatch {
    fn default() -> Self {
        OfpMatch::new()
    }
}

impl<'a> From<&'a FlowMatch> for OfpMatch {
    fn from(m: &'a FlowMatch) -> Self {
        let mut mat = OfpMatch::new();
        if let Some(port) = m.in_port {
            mat.exact(OfpFlowWildcards::InPort);
            mat.in_port = port_number(Port::Physical(port));
        }
        if let Some(mac) = m.dl_src {
            mat.exact(OfpFlowWildcards::DlSrc);
            mat.dl_src = mac.octets();
        }
        if let Some(mac) = m.dl_dst {
            mat.exact(OfpFlowWildcards::DlDst);
            mat.dl_dst = mac.octets();
        }
        if let Some(vlan) = m.dl_vlan {
            mat.exact(OfpFlowWildcards::DlVlan);
            mat.dl_vlan = vlan;
        }
        if let Some(pcp) = m.dl_vlan_pcp {
            mat.exact(OfpFlowWildcards::DlVlanPcp);
            mat.dl_vlan_pcp = pcp;
        }
        if let Some(typ) = m.dl_type {
            mat.exact(OfpFlowWildcards::DlType);
            mat.dl_type = typ;
        }
        if let Some(tos) = m.nw_tos {
            mat.exact(OfpFlowWildcards::NwTos);
            mat.nw_tos = tos;
        }
        if let Some(proto) = m.nw_proto {
            mat.exact(OfpFlowWildcards::NwProto);
            mat.nw_proto = proto;
        }
        if let Some((ip, len)) = m.nw_src {
            mat.prefix(OFPFW_NW_SRC_SHIFT, len);
            mat.nw_src = u32::from(ip);
        }
        if let Some((ip, len)) = m.nw_dst {
            mat.prefix(OFPFW_NW_DST_SHIFT, len);
            mat.nw_dst = u32::from(ip);
        }
        if let Some(port) = m.tp_src {
            mat.exact(OfpFlowWildcards::TpSrc);
            mat.tp_src = port;
        }
        if let Some(port) = m.tp_dst {
            mat.exact(OfpFlowWildcards::TpDst);
            mat.tp_dst = port;
        }
        mat
    }
}

impl OfpAction {
    /// Constructs an output action. The controller gets whole frames.
    pub fn output(port: u16) -> OfpAction {
        let max_len = if port == OFPP_CONTROLLER { 0xffff } else { 0 };
        OfpAction::Output {
            port: port,
            max_len: max_len,
        }
    }

    fn typ(&self) -> OfpActionType {
        match *self {
            OfpAction::Output { .. } => OfpActionType::Output,
            OfpAction::SetVlanVid(_) => OfpActionType::SetVlanVid,
            OfpAction::SetVlanPcp(_) => OfpActionType::SetVlanPcp,
            OfpAction::StripVlan => OfpActionType::StripVlan,
            OfpAction::SetDlSrc(_) => OfpActionType::SetDlSrc,
            OfpAction::SetDlDst(_) => OfpActionType::SetDlDst,
            OfpAction::SetNwSrc(_) => OfpActionType::SetNwSrc,
            OfpAction::SetNwDst(_) => OfpActionType::SetNwDst,
            OfpAction::SetNwTos(_) => OfpActionType::SetNwTos,
            OfpAction::SetTpSrc(_) => OfpActionType::SetTpSrc,
            OfpAction::SetTpDst(_) => OfpActionType::SetTpDst,
        }
    }

    /// Length on the wire in byte
    fn length(&self) -> u16 {
        match *self {
            OfpAction::SetDlSrc(_) | OfpAction::SetDlDst(_) => 16,
            _ => 8,
        }
    }

    fn serialize<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_u16::<NetworkEndian>(self.typ() as u16)?;
        stream.write_u16::<NetworkEndian>(self.length())?;
        match *self {
            OfpAction::Output { port, max_len } => {
                stream.write_u16::<NetworkEndian>(port)?;
                stream.write_u16::<NetworkEndian>(max_len)
            }
            OfpAction::SetVlanVid(vid) => {
                stream.write_u16::<NetworkEndian>(vid)?;
                stream.write_all(&[0; 2])
            }
            OfpAction::SetVlanPcp(pcp) => stream.write_all(&[pcp, 0, 0, 0]),
            OfpAction::StripVlan => stream.write_all(&[0; 4]),
            OfpAction::SetDlSrc(mac) | OfpAction::SetDlDst(mac) => {
                stream.write_all(&mac)?;
                stream.write_all(&[0; 6])
            }
            OfpAction::SetNwSrc(ip) | OfpAction::SetNwDst(ip) => stream.write_u32::<NetworkEndian>(ip),
            OfpAction::SetNwTos(tos) => stream.write_all(&[tos, 0, 0, 0]),
            OfpAction::SetTpSrc(port) | OfpAction::SetTpDst(port) => {
                stream.write_u16::<NetworkEndian>(port)?;
                stream.write_all(&[0; 2])
            }
        }
    }
}

impl<'a> From<&'a FlowAction> for OfpAction {
    fn from(action: &'a FlowAction) -> Self {
        match *action {
            FlowAction::Output(port) => OfpAction::output(port_number(port)),
            FlowAction::OutputInPort => OfpAction::output(OFPP_IN_PORT),
            FlowAction::SetVlanId(vid) => OfpAction::SetVlanVid(vid),
            FlowAction::SetVlanPcp(pcp) => OfpAction::SetVlanPcp(pcp),
            FlowAction::StripVlan => OfpAction::StripVlan,
            FlowAction::SetDlSrc(mac) => OfpAction::SetDlSrc(mac.octets()),
            FlowAction::SetDlDst(mac) => OfpAction::SetDlDst(mac.octets()),
            FlowAction::SetNwSrc(ip) => OfpAction::SetNwSrc(u32::from(ip)),
            FlowAction::SetNwDst(ip) => OfpAction::SetNwDst(u32::from(ip)),
            FlowAction::SetNwTos(tos) => OfpAction::SetNwTos(tos),
            FlowAction::SetTpSrc(port) => OfpAction::SetTpSrc(port),
            FlowAction::SetTpDst(port) => OfpAction::SetTpDst(port),
        }
    }
}

impl OfpFlowMod {
    /// Constructs a permanent `OfpFlowMod` with the given fields.
    pub fn new(
        command: OfpFlowModCommand,
        priority: u16,
        match_field: OfpMatch,
        actions: Vec<OfpAction>,
    ) -> OfpFlowMod {
        OfpFlowMod {
            match_field: match_field,
            cookie: 0,
            command: command as u16,
            idle_timeout: OFP_FLOW_PERMANENT,
            hard_timeout: OFP_FLOW_PERMANENT,
            priority: priority,
            buffer_id: OFP_NO_BUFFER,
            out_port: OFPP_NONE,
            flags: 0,
            actions: actions,
        }
    }
}

impl<'a> From<&'a FlowMod> for OfpFlowMod {
    fn from(flow_mod: &'a FlowMod) -> Self {
        let entry = &flow_mod.entry;
        let command = match flow_mod.command {
            FlowModCommand::Add => OfpFlowModCommand::Add,
            FlowModCommand::Delete => OfpFlowModCommand::Delete,
            FlowModCommand::DeleteStrict => OfpFlowModCommand::DeleteStrict,
        };
        let actions = match flow_mod.command {
            FlowModCommand::Add => entry.actions.iter().map(OfpAction::from).collect(),
            _ => vec![],
        };
        OfpFlowMod::new(command, entry.priority, OfpMatch::from(&entry.matching), actions)
    }
}

impl OfpPacketOut {
    /// Constructs an `OfpPacketOut` sending the unbuffered frame `data` out of `port`.
    pub fn new(in_port: u16, port: u16, data: Vec<u8>) -> OfpPacketOut {
        OfpPacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: in_port,
            actions: vec![OfpAction::output(port)],
            data: data,
        }
    }
}

impl OfpSwitchConfig {
    /// Constructs a configuration without special fragment handling
    pub fn new(miss_send_len: u16) -> OfpSwitchConfig {
        OfpSwitchConfig {
            flags: 0,
            miss_send_len: miss_send_len,
        }
    }
}

/// An OpenFlow packet. Must be implemented for all OpenFlow messsages that are sent.
pub trait OfpPacket {
    /// Constructs an OfpHeader with the given body length and transaction ID
    fn header(&self, body_length: usize, xid: u32) -> OfpHeader {
        OfpHeader {
            version: OFP_VERSION,
            typ: Self::typ() as u8,
            length: (OfpHeader::header_length() + body_length) as u16,
            xid: xid,
        }
    }

    /// Returns the packet's type
    fn typ() -> OfpType;

    /// Serializes this packet with network byte order.
    /// The xid is used as its header's transaction id.
    fn serialize<S: Write>(&self, stream: &mut S, xid: u32) -> io::Result<()> {
        let mut body = vec![];
        self.serialize_body(&mut body)?;
        if OfpHeader::header_length() + body.len() > 0xffff {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "OpenFlow message exceeds 64 KiB",
            ));
        }
        let header = self.header(body.len(), xid);
        debug!("Outgoing message: {:?}", header);
        header.serialize(stream)?;
        stream.write_all(&body)
    }

    /// Serializes this packet's body.
    /// Implementers have to output network byte order on the given stream.
    fn serialize_body<S: Write>(&self, stream: &mut S) -> io::Result<()>;
}

impl OfpEchoReply {
    /// Constructs a new `OfpEchoReply` with `arbitrary` content.
    /// This should be the same as in the `OfpEchoRequest` that issued this reply.
    pub fn new(arbitrary: Vec<u8>) -> OfpEchoReply {
        OfpEchoReply {
            arbitrary: arbitrary,
        }
    }
}
impl OfpPacket for OfpEchoReply {
    fn typ() -> OfpType {
        OfpType::EchoReply
    }

    fn serialize_body<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_all(&self.arbitrary)
    }
}

impl OfpPacket for OfpErrorMsg {
    fn typ() -> OfpType {
        OfpType::Error
    }

    fn serialize_body<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_u16::<NetworkEndian>(self.typ)?;
        stream.write_u16::<NetworkEndian>(self.code)?;
        stream.write_all(&self.data)
    }
}

impl OfpPacket for OfpSwitchConfig {
    fn typ() -> OfpType {
        OfpType::SetConfig
    }

    fn serialize_body<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_u16::<NetworkEndian>(self.flags)?;
        stream.write_u16::<NetworkEndian>(self.miss_send_len)
    }
}

impl OfpPacket for OfpFlowMod {
    fn typ() -> OfpType {
        OfpType::FlowMod
    }

    fn serialize_body<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        self.match_field.serialize(stream)?;
        stream.write_u64::<NetworkEndian>(self.cookie)?;
        stream.write_u16::<NetworkEndian>(self.command)?;
        stream.write_u16::<NetworkEndian>(self.idle_timeout)?;
        stream.write_u16::<NetworkEndian>(self.hard_timeout)?;
        stream.write_u16::<NetworkEndian>(self.priority)?;
        stream.write_u32::<NetworkEndian>(self.buffer_id)?;
        stream.write_u16::<NetworkEndian>(self.out_port)?;
        stream.write_u16::<NetworkEndian>(self.flags)?;
        for action in &self.actions {
            action.serialize(stream)?;
        }
        Ok(())
    }
}

impl OfpPacket for OfpPacketOut {
    fn typ() -> OfpType {
        OfpType::PacketOut
    }

    fn serialize_body<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        let actions_len: u16 = self.actions.iter().map(OfpAction::length).sum();
        stream.write_u32::<NetworkEndian>(self.buffer_id)?;
        stream.write_u16::<NetworkEndian>(self.in_port)?;
        stream.write_u16::<NetworkEndian>(actions_len)?;
        for action in &self.actions {
            action.serialize(stream)?;
        }
        stream.write_all(&self.data)
    }
}
