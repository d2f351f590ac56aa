/*!
All deserialization routines for the OpenFlow message primitives

The header uses a special deserialization because its size is known.
Use the trait `Deserialize` for any other deserialization implementation.
*/

use crate::openflow::error::{Error, Result};
use crate::openflow::messages::*;

use byteorder::{ByteOrder, NetworkEndian};
use std::mem::size_of;

/// Length of an `ofp_phy_port` on the wire
const PHY_PORT_LENGTH: usize = 48;
/// Length of the fixed part of `ofp_switch_features`
const FEATURES_LENGTH: usize = 24;
/// Length of the fixed part of `ofp_packet_in`
const PACKET_IN_LENGTH: usize = 10;

impl OfpHeader {
    /// Deserializes an OpenFlow header
    pub fn deserialize(bytes: &[u8; 8]) -> OfpHeader {
        OfpHeader {
            version: bytes[0],
            typ: bytes[1],
            length: NetworkEndian::read_u16(&bytes[2..4]),
            xid: NetworkEndian::read_u32(&bytes[4..]),
        }
    }
}

/// To be implemented by all OpenFlow message parts that are received.
pub trait Deserialize {
    /// The type to deserialize
    type R;

    /// Deserialize the bytes buffer
    /// Fails on providing a too small or too large buffer
    fn deserialize(bytes: Vec<u8>) -> Result<Self::R> {
        if Self::min_length() > bytes.len() || Self::max_length() < bytes.len() {
            return Err(Error::BadRequest(OfpBadRequestCode::BadLen, bytes));
        }
        Self::deserialize_len_ok(bytes)
    }

    /// Deserializes the byte buffer (network byte order)
    /// Implementers can rely on the bytes buffer's size to be greater or equal Self::min_length()
    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R>;

    /// The minimum length of the message part in bytes
    /// If Self::R contains dynamically sized fields,
    /// you probably have to override this implementation.
    fn min_length() -> usize {
        size_of::<Self::R>()
    }

    /// The maximum length of the message part in bytes
    /// May not return a value greater than 0xFFF7
    /// If Self::R is fixed size, you probably have to
    /// override this implementation.
    fn max_length() -> usize {
        0xffff - OfpHeader::header_length()
    }
}

impl Deserialize for OfpEchoRequest {
    type R = OfpEchoRequest;

    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R> {
        Ok(OfpEchoRequest { arbitrary: bytes })
    }

    fn min_length() -> usize {
        0
    }
}

impl Deserialize for OfpPhyPort {
    type R = OfpPhyPort;

    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R> {
        let mut hw_addr = [0; 6];
        hw_addr.copy_from_slice(&bytes[2..8]);
        let mut name = [0; 16];
        name.copy_from_slice(&bytes[8..24]);
        Ok(OfpPhyPort {
            port_no: NetworkEndian::read_u16(&bytes[0..2]),
            hw_addr: hw_addr,
            name: name,
            config: NetworkEndian::read_u32(&bytes[24..28]),
            state: NetworkEndian::read_u32(&bytes[28..32]),
            curr: NetworkEndian::read_u32(&bytes[32..36]),
            advertised: NetworkEndian::read_u32(&bytes[36..40]),
            supported: NetworkEndian::read_u32(&bytes[40..44]),
            peer: NetworkEndian::read_u32(&bytes[44..48]),
        })
    }

    fn min_length() -> usize {
        PHY_PORT_LENGTH
    }

    fn max_length() -> usize {
        PHY_PORT_LENGTH
    }
}

impl Deserialize for OfpSwitchFeatures {
    type R = OfpSwitchFeatures;

    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R> {
        let ports_len = bytes.len() - FEATURES_LENGTH;
        if ports_len % PHY_PORT_LENGTH != 0 {
            return Err(Error::BadRequest(OfpBadRequestCode::BadLen, bytes));
        }
        let ports = bytes[FEATURES_LENGTH..]
            .chunks(PHY_PORT_LENGTH)
            .map(|chunk| OfpPhyPort::deserialize(chunk.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        Ok(OfpSwitchFeatures {
            datapath_id: NetworkEndian::read_u64(&bytes[0..8]),
            n_buffers: NetworkEndian::read_u32(&bytes[8..12]),
            n_tables: bytes[12],
            pad: [bytes[13], bytes[14], bytes[15]],
            capabilities: NetworkEndian::read_u32(&bytes[16..20]),
            actions: NetworkEndian::read_u32(&bytes[20..24]),
            ports: ports,
        })
    }

    fn min_length() -> usize {
        FEATURES_LENGTH
    }
}

impl Deserialize for OfpPortStatus {
    type R = OfpPortStatus;

    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R> {
        let mut pad = [0; 7];
        pad.copy_from_slice(&bytes[1..8]);
        Ok(OfpPortStatus {
            reason: bytes[0],
            pad: pad,
            desc: OfpPhyPort::deserialize(bytes[8..].to_vec())?,
        })
    }

    fn min_length() -> usize {
        8 + PHY_PORT_LENGTH
    }

    fn max_length() -> usize {
        8 + PHY_PORT_LENGTH
    }
}

impl Deserialize for OfpPacketIn {
    type R = OfpPacketIn;

    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R> {
        Ok(OfpPacketIn {
            buffer_id: NetworkEndian::read_u32(&bytes[0..4]),
            total_len: NetworkEndian::read_u16(&bytes[4..6]),
            in_port: NetworkEndian::read_u16(&bytes[6..8]),
            reason: bytes[8],
            pad: bytes[9],
            data: bytes[PACKET_IN_LENGTH..].to_vec(),
        })
    }

    fn min_length() -> usize {
        PACKET_IN_LENGTH
    }
}

impl Deserialize for OfpErrorMsg {
    type R = OfpErrorMsg;

    fn deserialize_len_ok(bytes: Vec<u8>) -> Result<Self::R> {
        let typ = NetworkEndian::read_u16(&bytes[0..2]);
        let code = NetworkEndian::read_u16(&bytes[2..4]);
        Ok(OfpErrorMsg {
            typ: typ,
            code: code,
            data: bytes[4..].to_vec(),
        })
    }

    fn min_length() -> usize {
        4
    }
}
