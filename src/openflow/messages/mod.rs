/*!
The OpenFlow 1.0 message primitives a policy controller needs

This is based on the openflow.h from OpenFlow Switch Specification 1.0.0.
The type names are changed to align with the Rust conventions.
*/

pub mod deserialize;
pub mod serialize;

use std::fmt;

impl OfpErrorMsg {
    fn first_64_bytes(header: &[u8], body: &[u8]) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(header);
        let target_length = 64 - header.len();
        let shrunk_body = if body.len() < target_length {
            body
        }
        else {
            &body[0..target_length]
        };
        buf.extend_from_slice(shrunk_body);
        buf
    }

    /// Constructs a Hello Failed error
    pub fn new_hello_failed() -> OfpErrorMsg {
        OfpErrorMsg {
            typ: OfpErrorType::HelloFailed as u16,
            code: OfpHelloFailedCode::Incompatible as u16,
            data: vec![],
        }
    }

    /// Constructs a Bad Request error
    pub fn new_bad_request(code: OfpBadRequestCode, header: &[u8], body: &[u8]) -> OfpErrorMsg {
        OfpErrorMsg {
            typ: OfpErrorType::BadRequest as u16,
            code: code as u16,
            data: Self::first_64_bytes(header, body),
        }
    }

    /// Checks if this `OfpErrorMsg` describes a flow mod rejected for lack of table space
    pub fn check_table_full(&self) -> bool {
        self.typ == OfpErrorType::FlowModFailed as u16
            && self.code == OfpFlowModFailedCode::AllTablesFull as u16
    }

    /// Checks if this `OfpErrorMsg` rejects an action naming an unknown port
    pub fn check_bad_port(&self) -> bool {
        self.typ == OfpErrorType::BadAction as u16 && self.code == OfpBadActionCode::BadOutPort as u16
    }
}

impl fmt::Display for OfpErrorMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let typ = match self.typ {
            0 => OfpErrorType::HelloFailed,
            1 => OfpErrorType::BadRequest,
            2 => OfpErrorType::BadAction,
            3 => OfpErrorType::FlowModFailed,
            4 => OfpErrorType::PortModFailed,
            5 => OfpErrorType::QueueOpFailed,
            _ => return write!(f, "OpenFlow Error: type({}), code({})", self.typ, self.code),
        };
        write!(f, "OpenFlow Error: {:?}, code({})", typ, self.code)
    }
}

/* Some getters */

impl OfpHeader {
    /// Gets the packet's OpenFlow version
    pub fn version(&self) -> u8 {
        self.version
    }
    /// Gets this packet's `OfpType`'s numerical respresentation.
    pub fn typ(&self) -> u8 {
        self.typ
    }
    /// Gets the packet's transaction id
    pub fn xid(&self) -> u32 {
        self.xid
    }
}
impl OfpSwitchFeatures {
    /// Gets the datapath unique ID
    pub fn datapath_id(&self) -> u64 {
        self.datapath_id
    }
    /// Gets the bitmap of supported `OfpActionType`s
    pub fn actions(&self) -> u32 {
        self.actions
    }
    pub fn ports(&self) -> &[OfpPhyPort] {
        &self.ports
    }
}
impl OfpPhyPort {
    pub fn port_no(&self) -> u16 {
        self.port_no
    }
    /// A port that is a physical port, administratively up and with a link
    pub fn is_live(&self) -> bool {
        self.port_no < OFPP_MAX
            && self.config & OfpPortConfig::PortDown as u32 == 0
            && self.state & OfpPortState::LinkDown as u32 == 0
    }
}
impl OfpPortStatus {
    pub fn reason(&self) -> u8 {
        self.reason
    }
    pub fn desc(&self) -> &OfpPhyPort {
        &self.desc
    }
}
impl OfpPacketIn {
    pub fn in_port(&self) -> u16 {
        self.in_port
    }
    pub fn reason(&self) -> u8 {
        self.reason
    }
    /// Gets the received frame
    pub fn data(self) -> Vec<u8> {
        self.data
    }
}
impl OfpEchoRequest {
    /// Gets the message's content
    pub fn arbitrary(self) -> Vec<u8> {
        self.arbitrary
    }
}

/// An OpenFlow Echo Request
#[derive(Debug)]
pub struct OfpEchoRequest {
    arbitrary: Vec<u8>,
}

/// An OpenFlow Echo Reply
#[derive(Debug)]
pub struct OfpEchoReply {
    arbitrary: Vec<u8>,
}

/* Copyright (c) 2008 The Board of Trustees of The Leland Stanford Junior University
 *
 * We are making the OpenFlow specification and associated documentation
 * (Software) available for public use and benefit with the expectation
 * that others will use, modify and enhance the Software and contribute
 * those enhancements back to the community. However, since we would
 * like to make the Software available for broadest use, with as few
 * restrictions as possible permission is hereby granted, free of
 * charge, to any person obtaining a copy of this Software to deal in
 * the Software under the copyrights without restriction, including
 * without limitation the rights to use, copy, modify, merge, publish,
 * distribute, sublicense, and/or sell copies of the Software, and to
 * permit persons to whom the Software is furnished to do so, subject to
 * the following conditions:
 *
 * The above copyright notice and this permission notice shall be
 * included in all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
 * EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
 * MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
 * NONINFRINGEMENT.  IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
 * BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
 * ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
 * CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 *
 * The name and trademarks of copyright holder(s) may NOT be used in
 * advertising or publicity pertaining to the Software or any
 * derivatives without specific, written prior permission.
 */

/// Version number:
/// Non-experimental versions released: 0x01
///
/// The most significant bit in the version field is reserved and must be set to zero.
pub const OFP_VERSION: u8 = 0x01;

/// The default port the controller listens on.
pub const OFP_TCP_PORT: u16 = 6633;

/* Port numbering. Physical ports are numbered starting from 1. */
/// Maximum number of physical switch ports.
pub const OFPP_MAX: u16 = 0xff00;
/// Send the packet out the input port. This virtual port must be explicitly used
/// in order to send back out of the input port.
pub const OFPP_IN_PORT: u16 = 0xfff8;
/// All physical ports except input port and those disabled by STP.
pub const OFPP_FLOOD: u16 = 0xfffb;
/// All physical ports except input port.
pub const OFPP_ALL: u16 = 0xfffc;
/// Send to controller.
pub const OFPP_CONTROLLER: u16 = 0xfffd;
/// Not associated with a physical port.
pub const OFPP_NONE: u16 = 0xffff;

/// A message's type, the most fundamental to
/// distinguish information between messages
pub enum OfpType {
    /* Immutable messages. */
    /// Symmetric message
    Hello = 0,
    /// Symmetric message
    Error = 1,
    /// Symmetric message
    EchoRequest = 2,
    /// Symmetric message
    EchoReply = 3,

    /* Switch configuration messages. */
    /// Controller/switch message
    FeaturesRequest = 5,
    /// Controller/switch message
    FeaturesReply = 6,
    /// Controller/switch message
    SetConfig = 9,

    /* Asynchronous messages. */
    /// Async message
    PacketIn = 10,
    /// Async message
    PortStatus = 12,

    /* Controller command messages. */
    /// Controller/switch message
    PacketOut = 13,
    /// Controller/switch message
    FlowMod = 14,

    /* Barrier messages. */
    /// Controller/switch message
    BarrierRequest = 18,
    /// Controller/switch message
    BarrierReply = 19,
}

/// Header on all OpenFlow packets.
#[derive(Debug, PartialEq)]
pub struct OfpHeader {
    /// OFP_VERSION.
    version: u8,
    /// This packet's OfpType.
    typ: u8,
    /// This packet's length including this OfpHeader.
    length: u16,
    /// Transaction id associated with this packet.
    /// Replies use the same id as was in the request
    /// to facilitate pairing.
    xid: u32,
}

/// Flags to indicate behavior of the physical port.
pub enum OfpPortConfig {
    /// Port is administratively down.
    PortDown = 1 << 0,
}

/// Current state of the physical port.
pub enum OfpPortState {
    /// No physical link present.
    LinkDown = 1 << 0,
}

/// Description of a physical port
#[derive(Debug, Clone, PartialEq)]
pub struct OfpPhyPort {
    port_no: u16,
    hw_addr: [u8; 6],
    /// Null-terminated
    name: [u8; 16],

    /// Bitmap of OfpPortConfig flags.
    config: u32,
    /// Bitmap of OfpPortState flags.
    state: u32,

    /* Bitmaps of OFPPF_* that describe features. All bits zeroed if
     * unsupported or unavailable. */
    /// Current features.
    curr: u32,
    /// Features being advertised by the port.
    advertised: u32,
    /// Features supported by the port.
    supported: u32,
    /// Features advertised by peer.
    peer: u32,
}

/// Switch features.
#[derive(Debug, PartialEq)]
pub struct OfpSwitchFeatures {
    /// Datapath unique ID. The lower 48-bits are for
    /// a MAC address, while the upper 16-bits are
    /// implementer-defined.
    datapath_id: u64,
    /// Max packets buffered at once.
    n_buffers: u32,
    /// Number of tables supported by datapath.
    n_tables: u8,
    /// Align to 64-bits.
    pad: [u8; 3],

    /* Features. */
    /// Bitmap of support OfpCapabilities.
    capabilities: u32,
    /// Bitmap of supported OfpActionType's.
    actions: u32,

    /* Port info.*/
    /// Port definitions. The number of ports is inferred from the
    /// length field in the header.
    ports: Vec<OfpPhyPort>,
}

/// Switch configuration.
#[derive(Debug)]
pub struct OfpSwitchConfig {
    /// OFPC_* flags.
    flags: u16,
    /// Max bytes of new flow that datapath should send to the controller.
    miss_send_len: u16,
}

/// What changed about the physical port
#[derive(Debug, PartialEq)]
pub enum OfpPortReason {
    /// The port was added.
    Add = 0,
    /// The port was removed.
    Delete = 1,
    /// Some attribute of the port has changed.
    Modify = 2,
}

/// A physical port has changed in the datapath
#[derive(Debug, PartialEq)]
pub struct OfpPortStatus {
    /// One of OfpPortReason.
    reason: u8,
    /// Align to 64-bits.
    pad: [u8; 7],
    desc: OfpPhyPort,
}

/// Why is this packet being sent to the controller?
#[derive(Debug, PartialEq)]
pub enum OfpPacketInReason {
    /// No matching flow.
    NoMatch = 0,
    /// Action explicitly output to controller.
    Action = 1,
}

/// Packet received on port (datapath -> controller).
#[derive(Debug, PartialEq)]
pub struct OfpPacketIn {
    /// ID assigned by datapath.
    buffer_id: u32,
    /// Full length of frame.
    total_len: u16,
    /// Port on which frame was received.
    in_port: u16,
    /// Reason packet is being sent (one of OfpPacketInReason)
    reason: u8,
    pad: u8,
    /// Ethernet frame
    data: Vec<u8>,
}

/* ## ---------------- ## */
/* ## OpenFlow Match. ## */
/* ## ---------------- ## */

/// Flow wildcards.
pub enum OfpFlowWildcards {
    /// Switch input port.
    InPort = 1 << 0,
    /// VLAN id.
    DlVlan = 1 << 1,
    /// Ethernet source address.
    DlSrc = 1 << 2,
    /// Ethernet destination address.
    DlDst = 1 << 3,
    /// Ethernet frame type.
    DlType = 1 << 4,
    /// IP protocol.
    NwProto = 1 << 5,
    /// TCP/UDP source port.
    TpSrc = 1 << 6,
    /// TCP/UDP destination port.
    TpDst = 1 << 7,
    /// VLAN priority.
    DlVlanPcp = 1 << 20,
    /// IP ToS (DSCP field, 6 bits).
    NwTos = 1 << 21,
}

/// IP source address wildcard bit count (lowest bit of the 6 bit field).
/// 0 is exact match, 1 ignores the LSB, 2 ignores the 2 least-significant bits, ...,
/// 32 and higher wildcard the entire field.
pub const OFPFW_NW_SRC_SHIFT: u32 = 8;
/// IP destination address wildcard bit count. Same format as source.
pub const OFPFW_NW_DST_SHIFT: u32 = 14;
/// Wildcard all fields.
pub const OFPFW_ALL: u32 = (1 << 22) - 1;

/// Fields to match against flows
#[derive(Debug, Clone, PartialEq)]
pub struct OfpMatch {
    /// Wildcard fields.
    wildcards: u32,
    /// Input switch port.
    in_port: u16,
    /// Ethernet source address.
    dl_src: [u8; 6],
    /// Ethernet destination address.
    dl_dst: [u8; 6],
    /// Input VLAN id.
    dl_vlan: u16,
    /// Input VLAN priority.
    dl_vlan_pcp: u8,
    /// Align to 64-bits
    pad1: [u8; 1],
    /// Ethernet frame type.
    dl_type: u16,
    /// IP ToS (actually DSCP field, 6 bits).
    nw_tos: u8,
    /// IP protocol or lower 8 bits of ARP opcode.
    nw_proto: u8,
    /// Align to 64-bits
    pad2: [u8; 2],
    /// IP source address.
    nw_src: u32,
    /// IP destination address.
    nw_dst: u32,
    /// TCP/UDP source port.
    tp_src: u16,
    /// TCP/UDP destination port.
    tp_dst: u16,
}

/* ## ----------------- ## */
/* ## OpenFlow Actions. ## */
/* ## ----------------- ## */

/// The type of an OpenFlow Action
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OfpActionType {
    /// Output to switch port.
    Output = 0,
    /// Set the 802.1q VLAN id.
    SetVlanVid = 1,
    /// Set the 802.1q priority.
    SetVlanPcp = 2,
    /// Strip the 802.1q header.
    StripVlan = 3,
    /// Ethernet source address.
    SetDlSrc = 4,
    /// Ethernet destination address.
    SetDlDst = 5,
    /// IP source address.
    SetNwSrc = 6,
    /// IP destination address.
    SetNwDst = 7,
    /// IP ToS (DSCP field, 6 bits).
    SetNwTos = 8,
    /// TCP/UDP source port.
    SetTpSrc = 9,
    /// TCP/UDP destination port.
    SetTpDst = 10,
}

/// An action, all 8 or 16 bytes long on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum OfpAction {
    /// Output to `port`. `max_len` bytes are sent when the port is the controller.
    Output { port: u16, max_len: u16 },
    SetVlanVid(u16),
    SetVlanPcp(u8),
    StripVlan,
    SetDlSrc([u8; 6]),
    SetDlDst([u8; 6]),
    SetNwSrc(u32),
    SetNwDst(u32),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
}

/* ## --------------------------- ## */
/* ## OpenFlow Flow Modification. ## */
/* ## --------------------------- ## */

/// The command that is embedded in a flow mod message
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OfpFlowModCommand {
    /// New flow.
    Add = 0,
    /// Modify all matching flows.
    Modify = 1,
    /// Modify entry strictly matching wildcards and priority.
    ModifyStrict = 2,
    /// Delete all matching flows.
    Delete = 3,
    /// Delete entry strictly matching wildcards and priority.
    DeleteStrict = 4,
}

/// Value used in `idle_timeout` and `hard_timeout` to indicate that the entry is permanent.
pub const OFP_FLOW_PERMANENT: u16 = 0;

/// By default, choose a priority in the middle.
pub const OFP_DEFAULT_PRIORITY: u16 = 0x8000;

/// A reserved buffer ID to express that no buffer is assigned
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;

/// Flow setup and teardown (controller -> datapath).
#[derive(Debug)]
pub struct OfpFlowMod {
    /// Fields to match
    match_field: OfpMatch,

    /* Flow actions. */
    /// Opaque controller-issued identifier.
    cookie: u64,
    /// One of OfpFlowModCommand.
    command: u16,
    /// Idle time before discarding (seconds).
    idle_timeout: u16,
    /// Max time before discarding (seconds).
    hard_timeout: u16,
    /// Priority level of flow entry.
    priority: u16,
    /// Buffered packet to apply to (or -1).
    /// Not meaningful for OfpFlowModCommand::Delete*.
    buffer_id: u32,
    /// For OfpFlowModCommand::Delete* commands, require
    /// matching entries to include this as an
    /// output port.  A value of OFPP_NONE
    /// indicates no restriction.
    out_port: u16,
    /// One of OFPFF_*.
    flags: u16,
    /// The action length is inferred from the length field in the header.
    actions: Vec<OfpAction>,
}

/// Send packet (controller -> datapath).
#[derive(Debug)]
pub struct OfpPacketOut {
    /// ID assigned by datapath (-1 if none).
    buffer_id: u32,
    /// Packet's input port (OFPP_NONE if none).
    in_port: u16,
    /// Actions.
    actions: Vec<OfpAction>,
    /// Packet data. Only meaningful if buffer_id == -1.
    data: Vec<u8>,
}

/// Values for 'type' in `OfpErrorMsg`. These values are immutable: they will
/// not change in future versions of the protocol (although new values may be added).
#[derive(Debug)]
pub enum OfpErrorType {
    /// Hello protocol failed.
    HelloFailed = 0,
    /// Request was not understood.
    BadRequest = 1,
    /// Error in action description.
    BadAction = 2,
    /// Problem modifying flow entry.
    FlowModFailed = 3,
    /// Port mod request failed.
    PortModFailed = 4,
    /// Queue operation failed.
    QueueOpFailed = 5,
}

/// `OfpErrorMsg` 'code' values for `OfpErrorType::HelloFailed`.
///
/// 'data' contains an ASCII text string that may give failure details.
pub enum OfpHelloFailedCode {
    /// No compatible version.
    Incompatible = 0,
}

/// `OfpErrorMsg` 'code' values for `OfpErrorType::BadRequest`.
///
/// 'data' contains at least the first 64 bytes of the failed request.
#[derive(Debug)]
pub enum OfpBadRequestCode {
    /// ofp_header.version not supported.
    BadVersion = 0,
    /// ofp_header.type not supported.
    BadType = 1,
    /// Wrong request length for type.
    BadLen = 6,
}

/// `OfpErrorMsg` 'code' values for `OfpErrorType::BadAction`.
///
/// 'data' contains at least the first 64 bytes of the failed request.
pub enum OfpBadActionCode {
    /// Problem validating output action.
    BadOutPort = 4,
}

/// `OfpErrorMsg` 'code' values for `OfpErrorType::FlowModFailed`.
///
/// 'data' contains at least the first 64 bytes of the failed request.
#[derive(Debug)]
pub enum OfpFlowModFailedCode {
    /// Flow not added because of full tables.
    AllTablesFull = 0,
}

/// Error message (datapath -> controller).
#[derive(Debug)]
pub struct OfpErrorMsg {
    typ: u16,
    code: u16,
    /// Variable-length data. Interpreted based on the type and code. No padding.
    data: Vec<u8>,
}
