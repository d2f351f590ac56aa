/*!
Header fields, their values and the immutable `Packet`.

Every field holds a stack of values. Reading a field yields the top of its
stack; `modify` replaces the top, `push` and `pop` grow and shrink the stack.
Virtualization layers rely on the stacks to nest their tags.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

/// Datapath id of a switch
pub type SwitchId = u64;
/// Physical port number on a switch
pub type PortNo = u32;

/// A port as seen by the policy language.
/// Besides the physical ports there are the reserved flood and controller ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Port {
    Physical(PortNo),
    Flood,
    Controller,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Port::Physical(p) => write!(f, "{}", p),
            Port::Flood => write!(f, "flood"),
            Port::Controller => write!(f, "controller"),
        }
    }
}

/// A 48 bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Takes the lower 48 bits of `n`
    pub fn from_u64(n: u64) -> MacAddr {
        let mut bytes = [0; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (n >> (8 * (5 - i))) as u8;
        }
        MacAddr(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<MacAddr, Self::Err> {
        let mut bytes = [0; 6];
        let mut parts = s.split(':');
        for b in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("'{}' is too short", s))?;
            *b = u8::from_str_radix(part, 16).map_err(|e| format!("'{}': {}", s, e))?;
        }
        if parts.next().is_some() {
            return Err(format!("'{}' is too long", s));
        }
        Ok(MacAddr(bytes))
    }
}

/// The closed set of header fields plus free-form virtual tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Switch,
    Inport,
    Outport,
    SrcMac,
    DstMac,
    EthType,
    VlanId,
    VlanPcp,
    SrcIp,
    DstIp,
    Protocol,
    Tos,
    SrcPort,
    DstPort,
    VSwitch,
    VInport,
    VOutport,
    VTag,
    Tag(String),
}

impl Field {
    /// Fields that only exist inside the controller and have no wire encoding
    pub fn is_virtual(&self) -> bool {
        match *self {
            Field::VSwitch | Field::VInport | Field::VOutport | Field::VTag | Field::Tag(_) => true,
            _ => false,
        }
    }

    /// The location fields of a packet
    pub fn is_location(&self) -> bool {
        match *self {
            Field::Switch | Field::Inport | Field::Outport => true,
            _ => false,
        }
    }

    pub fn is_ip(&self) -> bool {
        *self == Field::SrcIp || *self == Field::DstIp
    }

    pub fn name(&self) -> &str {
        match *self {
            Field::Switch => "switch",
            Field::Inport => "inport",
            Field::Outport => "outport",
            Field::SrcMac => "srcmac",
            Field::DstMac => "dstmac",
            Field::EthType => "ethtype",
            Field::VlanId => "vlan_id",
            Field::VlanPcp => "vlan_pcp",
            Field::SrcIp => "srcip",
            Field::DstIp => "dstip",
            Field::Protocol => "protocol",
            Field::Tos => "tos",
            Field::SrcPort => "srcport",
            Field::DstPort => "dstport",
            Field::VSwitch => "vswitch",
            Field::VInport => "vinport",
            Field::VOutport => "voutport",
            Field::VTag => "vtag",
            Field::Tag(ref t) => t,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = String;

    /// Unknown names become user tags
    fn from_str(s: &str) -> Result<Field, Self::Err> {
        let field = match s {
            "switch" => Field::Switch,
            "inport" => Field::Inport,
            "outport" => Field::Outport,
            "srcmac" => Field::SrcMac,
            "dstmac" => Field::DstMac,
            "ethtype" => Field::EthType,
            "vlan_id" => Field::VlanId,
            "vlan_pcp" => Field::VlanPcp,
            "srcip" => Field::SrcIp,
            "dstip" => Field::DstIp,
            "protocol" => Field::Protocol,
            "tos" => Field::Tos,
            "srcport" => Field::SrcPort,
            "dstport" => Field::DstPort,
            "vswitch" => Field::VSwitch,
            "vinport" => Field::VInport,
            "voutport" => Field::VOutport,
            "vtag" => Field::VTag,
            "" => return Err("empty field name".to_owned()),
            tag => Field::Tag(tag.to_owned()),
        };
        Ok(field)
    }
}

/// A header value. Integral fields share `Int`, virtual fields may hold any variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Int(u64),
    Port(Port),
    Mac(MacAddr),
    Ip(Ipv4Addr),
    Atom(String),
}

impl Value {
    pub fn as_int(&self) -> Option<u64> {
        match *self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_port(&self) -> Option<Port> {
        match *self {
            Value::Port(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_mac(&self) -> Option<MacAddr> {
        match *self {
            Value::Mac(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<Ipv4Addr> {
        match *self {
            Value::Ip(ip) => Some(ip),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Port(ref p) => write!(f, "{}", p),
            Value::Mac(ref m) => write!(f, "{}", m),
            Value::Ip(ref ip) => write!(f, "{}", ip),
            Value::Atom(ref a) => write!(f, "{:?}", a),
        }
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i)
    }
}
impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(u64::from(i))
    }
}
impl From<u8> for Value {
    fn from(i: u8) -> Self {
        Value::Int(u64::from(i))
    }
}
impl From<Port> for Value {
    fn from(p: Port) -> Self {
        Value::Port(p)
    }
}
impl From<MacAddr> for Value {
    fn from(m: MacAddr) -> Self {
        Value::Mac(m)
    }
}
impl From<Ipv4Addr> for Value {
    fn from(ip: Ipv4Addr) -> Self {
        Value::Ip(ip)
    }
}
impl<'a> From<&'a str> for Value {
    fn from(a: &'a str) -> Self {
        Value::Atom(a.to_owned())
    }
}

/// A value stack slot. `None` is a hole left by copying an absent field.
type Stack = Vec<Option<Value>>;

/// An immutable packet: a header of field stacks plus the raw frame it came from.
/// Rewrites return a new packet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Packet {
    header: BTreeMap<Field, Stack>,
    payload: Arc<[u8]>,
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

impl Packet {
    /// An empty packet without payload
    pub fn new() -> Packet {
        Packet::with_payload(vec![])
    }

    pub fn with_payload(raw: Vec<u8>) -> Packet {
        Packet {
            header: BTreeMap::new(),
            payload: Arc::from(raw),
        }
    }

    /// Builds a packet from (field, value) pairs, each pushed once
    pub fn from_fields<I, V>(fields: I) -> Packet
    where
        I: IntoIterator<Item = (Field, V)>,
        V: Into<Value>,
    {
        fields
            .into_iter()
            .fold(Packet::new(), |pkt, (f, v)| pkt.modify(f, v.into()))
    }

    /// The raw frame bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The top value of a field
    pub fn get(&self, field: &Field) -> Option<&Value> {
        self.get_at(field, 0)
    }

    /// The value `depth` entries below the top of a field's stack
    pub fn get_at(&self, field: &Field, depth: usize) -> Option<&Value> {
        let stack = self.header.get(field)?;
        if depth >= stack.len() {
            return None;
        }
        stack[stack.len() - 1 - depth].as_ref()
    }

    /// The fields that currently have a value
    pub fn fields<'a>(&'a self) -> impl Iterator<Item = (&'a Field, &'a Value)> + 'a {
        self.header
            .iter()
            .filter_map(|(f, s)| s.last().and_then(|v| v.as_ref()).map(|v| (f, v)))
    }

    pub fn depth(&self, field: &Field) -> usize {
        self.header.get(field).map_or(0, |s| s.len())
    }

    fn rewrite<F: FnOnce(&mut Stack)>(&self, field: Field, f: F) -> Packet {
        let mut header = self.header.clone();
        {
            let stack = header.entry(field.clone()).or_insert_with(Vec::new);
            f(stack);
            // holes at the bottom are indistinguishable from an empty stack
            let holes = stack.iter().take_while(|v| v.is_none()).count();
            stack.drain(..holes);
        }
        if header.get(&field).map_or(false, |s| s.is_empty()) {
            header.remove(&field);
        }
        Packet {
            header,
            payload: Arc::clone(&self.payload),
        }
    }

    /// Replaces the top of `field`'s stack
    pub fn modify(&self, field: Field, value: Value) -> Packet {
        self.rewrite(field, |stack| match stack.last_mut() {
            Some(top) => *top = Some(value),
            None => stack.push(Some(value)),
        })
    }

    pub fn push(&self, field: Field, value: Value) -> Packet {
        self.rewrite(field, |stack| stack.push(Some(value)))
    }

    pub fn pop(&self, field: &Field) -> Packet {
        self.rewrite(field.clone(), |stack| {
            stack.pop();
        })
    }

    /// Sets the top of `dst` to the top of `src`
    pub fn copy(&self, dst: Field, src: &Field) -> Packet {
        let value = self.get(src).cloned();
        self.rewrite(dst, |stack| match stack.last_mut() {
            Some(top) => *top = value,
            None => {
                if value.is_some() {
                    stack.push(value)
                }
            }
        })
    }

    /// Drops all virtual fields
    pub fn without_virtual(&self) -> Packet {
        Packet {
            header: self
                .header
                .iter()
                .filter(|&(f, _)| !f.is_virtual())
                .map(|(f, s)| (f.clone(), s.clone()))
                .collect(),
            payload: Arc::clone(&self.payload),
        }
    }

    /// Keeps only the top value of every field
    pub fn flatten(&self) -> Packet {
        let mut pkt = Packet {
            header: BTreeMap::new(),
            payload: Arc::clone(&self.payload),
        };
        for (f, v) in self.fields() {
            pkt.header.insert(f.clone(), vec![Some(v.clone())]);
        }
        pkt
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (field, stack) in &self.header {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}=", field)?;
            if stack.len() == 1 {
                match stack[0] {
                    Some(ref v) => write!(f, "{}", v)?,
                    None => write!(f, "_")?,
                }
            }
            else {
                let vals: Vec<String> = stack
                    .iter()
                    .map(|v| v.as_ref().map_or("_".to_owned(), |v| v.to_string()))
                    .collect();
                write!(f, "[{}]", vals.join(","))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        let mac = MacAddr::from_str("00:00:00:00:00:01").unwrap();
        assert_eq!(MacAddr::from_u64(1), mac);
        assert_eq!("00:00:00:00:00:01", mac.to_string());
        assert!(MacAddr::from_str("00:00:00:00:01").is_err());
        assert!(MacAddr::from_str("00:00:00:00:00:01:02").is_err());
    }

    #[test]
    fn field_names() {
        assert_eq!(Field::VlanId, Field::from_str("vlan_id").unwrap());
        assert_eq!(Field::Tag("at".to_owned()), Field::from_str("at").unwrap());
        assert!(Field::Tag("at".to_owned()).is_virtual());
        assert!(!Field::SrcIp.is_virtual());
    }

    #[test]
    fn rewrites_are_persistent() {
        let pkt = Packet::from_fields(vec![(Field::Switch, 1u64)]);
        let moved = pkt.modify(Field::Switch, Value::Int(2));
        assert_eq!(Some(&Value::Int(1)), pkt.get(&Field::Switch));
        assert_eq!(Some(&Value::Int(2)), moved.get(&Field::Switch));
    }

    #[test]
    fn nested_stacks() {
        let pkt = Packet::new()
            .push(Field::VSwitch, Value::Int(1))
            .push(Field::Tag("at".to_owned()), "x".into());
        let peek = pkt.get(&Field::Tag("at".to_owned())).cloned();
        assert_eq!(Some(Value::from("x")), peek);

        let pkt = pkt
            .push(Field::VSwitch, Value::Int(2))
            .pop(&Field::Tag("at".to_owned()));
        assert_eq!(Some(&Value::Int(2)), pkt.get(&Field::VSwitch));
        assert_eq!(Some(&Value::Int(1)), pkt.get_at(&Field::VSwitch, 1));

        let pkt = pkt.pop(&Field::VSwitch).pop(&Field::VSwitch);
        assert_eq!(None, pkt.get(&Field::VSwitch));
        assert_eq!(Packet::new(), pkt);
    }

    #[test]
    fn copy_of_absent_field() {
        let pkt = Packet::new().modify(Field::VInport, Value::Int(3));
        let copied = pkt.copy(Field::VInport, &Field::Inport);
        assert_eq!(None, copied.get(&Field::VInport));
        assert_eq!(Packet::new(), copied);

        let deep = Packet::new()
            .push(Field::VInport, Value::Int(1))
            .push(Field::VInport, Value::Int(2))
            .copy(Field::VInport, &Field::Inport);
        assert_eq!(None, deep.get(&Field::VInport));
        assert_eq!(Some(&Value::Int(1)), deep.get_at(&Field::VInport, 1));
        assert_eq!(1, deep.pop(&Field::VInport).depth(&Field::VInport));
    }

    #[test]
    fn virtual_projection() {
        let pkt = Packet::from_fields(vec![(Field::Inport, Port::Physical(1))])
            .push(Field::VTag, "ingress".into());
        let phys = pkt.without_virtual();
        assert_eq!(None, phys.get(&Field::VTag));
        assert_eq!(Some(&Value::Port(Port::Physical(1))), phys.get(&Field::Inport));
    }
}
