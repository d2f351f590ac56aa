/*!
Turns classifiers into per-switch OpenFlow 1.0 flow tables.

Rules that can never match a packet arriving at the switch are left out.
Rules a switch cannot execute become software rules that send the packet
to the controller, which then evaluates the policy itself. Entries get
priorities N, N-1, ..., 1 in classifier order.
*/

use crate::classifier::{Action, ActionList, Classifier};
use crate::header::{Field, MacAddr, Packet, Port, PortNo, SwitchId, Value};
use crate::pattern::{Matcher, Pattern};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Highest physical port number an OpenFlow 1.0 switch can address
const MAX_PHYSICAL_PORT: PortNo = 0xff00;

/// What to do with rules needing set-field actions a switch lacks.
/// Rules only the controller can evaluate are always punted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFields {
    ControllerFallback,
    Drop,
}

impl Default for UnsupportedFields {
    fn default() -> Self {
        UnsupportedFields::ControllerFallback
    }
}

impl FromStr for UnsupportedFields {
    type Err = String;

    fn from_str(s: &str) -> Result<UnsupportedFields, Self::Err> {
        match s {
            "controller_fallback" => Ok(UnsupportedFields::ControllerFallback),
            "drop" => Ok(UnsupportedFields::Drop),
            _ => Err(format!("unknown unsupported field policy {}", s)),
        }
    }
}

/// An OpenFlow 1.0 action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowAction {
    Output(Port),
    /// Output through the port the packet came in on
    OutputInPort,
    SetVlanId(u16),
    SetVlanPcp(u8),
    StripVlan,
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
}

impl FlowAction {
    /// The `ofp_action_type` code
    pub fn typ(&self) -> u16 {
        match *self {
            FlowAction::Output(_) | FlowAction::OutputInPort => 0,
            FlowAction::SetVlanId(_) => 1,
            FlowAction::SetVlanPcp(_) => 2,
            FlowAction::StripVlan => 3,
            FlowAction::SetDlSrc(_) => 4,
            FlowAction::SetDlDst(_) => 5,
            FlowAction::SetNwSrc(_) => 6,
            FlowAction::SetNwDst(_) => 7,
            FlowAction::SetNwTos(_) => 8,
            FlowAction::SetTpSrc(_) => 9,
            FlowAction::SetTpDst(_) => 10,
        }
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FlowAction::Output(p) => write!(f, "output:{}", p),
            FlowAction::OutputInPort => write!(f, "output:in_port"),
            FlowAction::SetVlanId(v) => write!(f, "mod_vlan_vid:{}", v),
            FlowAction::SetVlanPcp(v) => write!(f, "mod_vlan_pcp:{}", v),
            FlowAction::StripVlan => write!(f, "strip_vlan"),
            FlowAction::SetDlSrc(m) => write!(f, "mod_dl_src:{}", m),
            FlowAction::SetDlDst(m) => write!(f, "mod_dl_dst:{}", m),
            FlowAction::SetNwSrc(ip) => write!(f, "mod_nw_src:{}", ip),
            FlowAction::SetNwDst(ip) => write!(f, "mod_nw_dst:{}", ip),
            FlowAction::SetNwTos(v) => write!(f, "mod_nw_tos:{}", v),
            FlowAction::SetTpSrc(v) => write!(f, "mod_tp_src:{}", v),
            FlowAction::SetTpDst(v) => write!(f, "mod_tp_dst:{}", v),
        }
    }
}

/// The action types a switch supports, as announced in its features reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSupport(u32);

impl ActionSupport {
    pub fn all() -> ActionSupport {
        ActionSupport(0x7ff)
    }

    pub fn from_bits(bits: u32) -> ActionSupport {
        // output is mandatory
        ActionSupport(bits | 1)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn supports(&self, action: &FlowAction) -> bool {
        self.0 & (1 << action.typ()) != 0
    }
}

impl Default for ActionSupport {
    fn default() -> Self {
        ActionSupport::all()
    }
}

/// An OpenFlow 1.0 match. `None` fields are wildcarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowMatch {
    pub in_port: Option<PortNo>,
    pub dl_src: Option<MacAddr>,
    pub dl_dst: Option<MacAddr>,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: Option<u8>,
    pub dl_type: Option<u16>,
    pub nw_tos: Option<u8>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<(Ipv4Addr, u8)>,
    pub nw_dst: Option<(Ipv4Addr, u8)>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

fn in_prefix(ip: Ipv4Addr, prefix: (Ipv4Addr, u8)) -> bool {
    let (net, len) = prefix;
    if len == 0 {
        return true;
    }
    let mask = !0u32 << (32 - u32::from(len.min(32)));
    u32::from(ip) & mask == u32::from(net) & mask
}

impl FlowMatch {
    /// Matches like a switch would on the packet's header
    pub fn matches(&self, pkt: &Packet) -> bool {
        fn int(pkt: &Packet, f: Field) -> Option<u64> {
            pkt.get(&f).and_then(Value::as_int)
        }
        fn eq<T: PartialEq>(want: Option<T>, got: Option<T>) -> bool {
            want.map_or(true, |w| got == Some(w))
        }
        fn ip(pkt: &Packet, f: Field, want: Option<(Ipv4Addr, u8)>) -> bool {
            want.map_or(true, |p| pkt.get(&f).and_then(Value::as_ip).map_or(false, |a| in_prefix(a, p)))
        }
        eq(
            self.in_port.map(Port::Physical),
            pkt.get(&Field::Inport).and_then(Value::as_port),
        ) && eq(self.dl_src, pkt.get(&Field::SrcMac).and_then(Value::as_mac))
            && eq(self.dl_dst, pkt.get(&Field::DstMac).and_then(Value::as_mac))
            && eq(self.dl_vlan.map(u64::from), int(pkt, Field::VlanId))
            && eq(self.dl_vlan_pcp.map(u64::from), int(pkt, Field::VlanPcp))
            && eq(self.dl_type.map(u64::from), int(pkt, Field::EthType))
            && eq(self.nw_tos.map(u64::from), int(pkt, Field::Tos))
            && eq(self.nw_proto.map(u64::from), int(pkt, Field::Protocol))
            && ip(pkt, Field::SrcIp, self.nw_src)
            && ip(pkt, Field::DstIp, self.nw_dst)
            && eq(self.tp_src.map(u64::from), int(pkt, Field::SrcPort))
            && eq(self.tp_dst.map(u64::from), int(pkt, Field::DstPort))
    }

    /// The action restoring `field` to the value this match pins it to
    fn restore(&self, field: &Field) -> Option<FlowAction> {
        let host = |p: Option<(Ipv4Addr, u8)>| p.and_then(|(ip, len)| if len == 32 { Some(ip) } else { None });
        match *field {
            Field::SrcMac => self.dl_src.map(FlowAction::SetDlSrc),
            Field::DstMac => self.dl_dst.map(FlowAction::SetDlDst),
            Field::VlanId => self.dl_vlan.map(FlowAction::SetVlanId),
            Field::VlanPcp => self.dl_vlan_pcp.map(FlowAction::SetVlanPcp),
            Field::SrcIp => host(self.nw_src).map(FlowAction::SetNwSrc),
            Field::DstIp => host(self.nw_dst).map(FlowAction::SetNwDst),
            Field::Tos => self.nw_tos.map(FlowAction::SetNwTos),
            Field::SrcPort => self.tp_src.map(FlowAction::SetTpSrc),
            Field::DstPort => self.tp_dst.map(FlowAction::SetTpDst),
            _ => None,
        }
    }

    /// Adds the ethertype and protocol values OpenFlow 1.0 requires before
    /// it looks at network and transport fields. Empty if the constraints
    /// contradict each other.
    fn with_prerequisites(self, level: Layer) -> Vec<FlowMatch> {
        let ethtypes: &[u16] = match level {
            Layer::Link => return vec![self],
            Layer::Network => &[ETH_TYPE_IPV4, ETH_TYPE_ARP],
            Layer::Ipv4 | Layer::Transport => &[ETH_TYPE_IPV4],
        };
        let dl_type = self.dl_type;
        let with_type: Vec<FlowMatch> = match dl_type {
            Some(t) if ethtypes.contains(&t) => vec![self],
            Some(_) => vec![],
            None => ethtypes
                .iter()
                .map(|t| FlowMatch {
                    dl_type: Some(*t),
                    ..self.clone()
                })
                .collect(),
        };
        if level != Layer::Transport {
            return with_type;
        }
        let protos = [IP_PROTO_TCP, IP_PROTO_UDP];
        with_type
            .into_iter()
            .flat_map(|m| match m.nw_proto {
                Some(p) if protos.contains(&p) => vec![m],
                Some(_) => vec![],
                None => protos
                    .iter()
                    .map(|p| FlowMatch {
                        nw_proto: Some(*p),
                        ..m.clone()
                    })
                    .collect(),
            })
            .collect()
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts = vec![];
        if let Some(p) = self.in_port {
            parts.push(format!("in_port={}", p));
        }
        if let Some(m) = self.dl_src {
            parts.push(format!("dl_src={}", m));
        }
        if let Some(m) = self.dl_dst {
            parts.push(format!("dl_dst={}", m));
        }
        if let Some(v) = self.dl_vlan {
            parts.push(format!("dl_vlan={}", v));
        }
        if let Some(v) = self.dl_vlan_pcp {
            parts.push(format!("dl_vlan_pcp={}", v));
        }
        if let Some(t) = self.dl_type {
            parts.push(format!("dl_type=0x{:04x}", t));
        }
        if let Some(v) = self.nw_tos {
            parts.push(format!("nw_tos={}", v));
        }
        if let Some(v) = self.nw_proto {
            parts.push(format!("nw_proto={}", v));
        }
        if let Some((ip, len)) = self.nw_src {
            parts.push(format!("nw_src={}/{}", ip, len));
        }
        if let Some((ip, len)) = self.nw_dst {
            parts.push(format!("nw_dst={}/{}", ip, len));
        }
        if let Some(v) = self.tp_src {
            parts.push(format!("tp_src={}", v));
        }
        if let Some(v) = self.tp_dst {
            parts.push(format!("tp_dst={}", v));
        }
        if parts.is_empty() {
            write!(f, "*")
        }
        else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// A flow table entry. Empty actions drop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowEntry {
    pub priority: u16,
    pub matching: FlowMatch,
    pub actions: Vec<FlowAction>,
    /// Punts to the controller on behalf of a rule the switch cannot execute
    pub software: bool,
}

impl fmt::Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let acts: Vec<String> = self.actions.iter().map(|a| a.to_string()).collect();
        write!(
            f,
            "priority={} {} actions={}{}",
            self.priority,
            self.matching,
            if acts.is_empty() { "drop".to_owned() } else { acts.join(",") },
            if self.software { " (software)" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    /// Removes all entries covered by the match
    Delete,
    DeleteStrict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub entry: FlowEntry,
}

impl FlowMod {
    /// Removes every entry of a table
    pub fn clear() -> FlowMod {
        FlowMod {
            command: FlowModCommand::Delete,
            entry: FlowEntry {
                priority: 0,
                matching: FlowMatch::default(),
                actions: vec![],
                software: false,
            },
        }
    }
}

/// The flow table of one switch, in priority order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTable {
    entries: Vec<FlowEntry>,
}

impl FlowTable {
    /// A table sending everything to the controller
    pub fn punt_all() -> FlowTable {
        FlowTable::from_entries(vec![(FlowMatch::default(), vec![FlowAction::Output(Port::Controller)], true)])
    }

    fn from_entries(entries: Vec<(FlowMatch, Vec<FlowAction>, bool)>) -> FlowTable {
        if entries.len() > usize::from(u16::max_value()) {
            warn!(
                "{} flow entries exceed the priority range, low priority entries collapse",
                entries.len()
            );
        }
        let n = entries.len();
        let entries = entries
            .into_iter()
            .enumerate()
            .map(|(i, (matching, actions, software))| FlowEntry {
                priority: (n - i).min(usize::from(u16::max_value())) as u16,
                matching,
                actions,
                software,
            })
            .collect();
        FlowTable { entries }
    }

    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry a switch would apply to `pkt`
    pub fn lookup(&self, pkt: &Packet) -> Option<&FlowEntry> {
        self.entries.iter().find(|e| e.matching.matches(pkt))
    }

    /// The flow mods turning `self` into `next`: additions and changes first,
    /// then strict deletions of entries `next` does not have.
    pub fn diff(&self, next: &FlowTable) -> Vec<FlowMod> {
        fn key(e: &FlowEntry) -> (u16, FlowMatch) {
            (e.priority, e.matching.clone())
        }
        let old: BTreeMap<_, &FlowEntry> = self.entries.iter().map(|e| (key(e), e)).collect();
        let new: BTreeSet<_> = next.entries.iter().map(key).collect();

        let mut mods: Vec<FlowMod> = next
            .entries
            .iter()
            .filter(|e| old.get(&key(e)).map_or(true, |o| o.actions != e.actions))
            .map(|e| FlowMod {
                command: FlowModCommand::Add,
                entry: e.clone(),
            })
            .collect();
        mods.extend(
            self.entries
                .iter()
                .filter(|e| !new.contains(&key(e)))
                .map(|e| FlowMod {
                    command: FlowModCommand::DeleteStrict,
                    entry: e.clone(),
                }),
        );
        mods
    }
}

impl fmt::Display for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "{}", e)?;
        }
        Ok(())
    }
}

/// Which header layers a match reaches into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Layer {
    Link,
    /// IPv4 or ARP
    Network,
    Ipv4,
    Transport,
}

/// Why a rule cannot run on the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    /// The switch lacks an action
    Unsupported,
    /// OpenFlow 1.0 cannot express the rule, the controller has to
    Software,
}

/// A pattern projected onto OpenFlow 1.0 match fields
struct Projection {
    matching: FlowMatch,
    layer: Layer,
    /// Whether `matching` matches exactly the packets of the pattern
    exact: bool,
}

/// The exact value a matcher requires, `Err` if no wire packet matches.
/// `Ok(None)` for a presence check.
fn required<T, F>(m: &Matcher, convert: F, widened: &mut bool) -> Result<Option<T>, ()>
where
    F: Fn(&Value) -> Option<T>,
{
    match *m {
        Matcher::Exact(ref v) => convert(v).map(Some).ok_or(()),
        Matcher::Except(ref except) => {
            if !except.is_empty() {
                *widened = true;
            }
            Ok(None)
        }
        Matcher::Prefix(..) => Err(()),
    }
}

fn small<T: std::convert::TryFrom<u64>>(v: &Value) -> Option<T> {
    v.as_int().and_then(|i| T::try_from(i).ok())
}

fn physical_port(v: &Value) -> Option<PortNo> {
    match v.as_port() {
        Some(Port::Physical(n)) if n <= MAX_PHYSICAL_PORT => Some(n),
        _ => None,
    }
}

fn ip_prefix(m: &Matcher, widened: &mut bool) -> Result<Option<(Ipv4Addr, u8)>, ()> {
    match *m {
        Matcher::Prefix(ref net, ref except) => {
            if !except.is_empty() {
                *widened = true;
            }
            Ok(Some((net.network(), net.prefix())))
        }
        _ => required(m, |v| v.as_ip().map(|ip| (ip, 32)), widened),
    }
}

/// Projects a pattern onto the packets arriving at `switch`.
/// `None` if no such packet can match.
fn project(pattern: &Pattern, switch: SwitchId) -> Option<Projection> {
    if pattern.is_none() {
        return None;
    }
    let mut m = FlowMatch::default();
    let mut layer = Layer::Link;
    let mut widened = false;
    for (slot, matcher) in pattern.iter() {
        // arriving packets carry single values and no virtual header
        if slot.depth > 0 || slot.field.is_virtual() {
            return None;
        }
        let w = &mut widened;
        match slot.field {
            Field::Switch => {
                if !matcher.accepts(&Value::Int(switch)) {
                    return None;
                }
            }
            Field::Outport => return None,
            Field::Inport => m.in_port = required(matcher, physical_port, w).ok()?,
            Field::SrcMac => m.dl_src = required(matcher, Value::as_mac, w).ok()?,
            Field::DstMac => m.dl_dst = required(matcher, Value::as_mac, w).ok()?,
            Field::EthType => m.dl_type = required(matcher, small::<u16>, w).ok()?,
            Field::VlanId => {
                m.dl_vlan = required(matcher, small::<u16>, w).ok()?;
                // no wildcard for "any tag"
                widened |= m.dl_vlan.is_none();
            }
            Field::VlanPcp => {
                m.dl_vlan_pcp = required(matcher, small::<u8>, w).ok()?;
                widened |= m.dl_vlan_pcp.is_none();
            }
            Field::SrcIp => {
                m.nw_src = ip_prefix(matcher, w).ok()?;
                layer = layer.max(Layer::Network);
            }
            Field::DstIp => {
                m.nw_dst = ip_prefix(matcher, w).ok()?;
                layer = layer.max(Layer::Network);
            }
            Field::Protocol => {
                m.nw_proto = required(matcher, small::<u8>, w).ok()?;
                layer = layer.max(Layer::Network);
            }
            Field::Tos => {
                m.nw_tos = required(matcher, small::<u8>, w).ok()?;
                layer = layer.max(Layer::Ipv4);
            }
            Field::SrcPort => {
                m.tp_src = required(matcher, small::<u16>, w).ok()?;
                layer = Layer::Transport;
            }
            Field::DstPort => {
                m.tp_dst = required(matcher, small::<u16>, w).ok()?;
                layer = Layer::Transport;
            }
            Field::VSwitch | Field::VInport | Field::VOutport | Field::VTag | Field::Tag(_) => {
                return None
            }
        }
    }
    Some(Projection {
        matching: m,
        layer,
        exact: !widened,
    })
}

fn set_field(field: &Field, value: &Value) -> Result<FlowAction, Fallback> {
    let action = match *field {
        Field::SrcMac => value.as_mac().map(FlowAction::SetDlSrc),
        Field::DstMac => value.as_mac().map(FlowAction::SetDlDst),
        Field::VlanId => small::<u16>(value)
            .filter(|v| *v <= 0xfff)
            .map(FlowAction::SetVlanId),
        Field::VlanPcp => small::<u8>(value).filter(|v| *v <= 7).map(FlowAction::SetVlanPcp),
        Field::SrcIp => value.as_ip().map(FlowAction::SetNwSrc),
        Field::DstIp => value.as_ip().map(FlowAction::SetNwDst),
        Field::Tos => small::<u8>(value).map(FlowAction::SetNwTos),
        Field::SrcPort => small::<u16>(value).map(FlowAction::SetTpSrc),
        Field::DstPort => small::<u16>(value).map(FlowAction::SetTpDst),
        _ => None,
    };
    action.ok_or(Fallback::Unsupported)
}

/// The net effect of an action list: field assignments and the output port
fn net_effect(list: &[Action]) -> Result<(BTreeMap<Field, Value>, Option<Port>), Fallback> {
    let mut sets = BTreeMap::new();
    let mut out = None;
    for action in list {
        match *action {
            Action::Forward(p) => out = Some(p),
            Action::Modify(Field::Outport, ref v) => out = Some(v.as_port().ok_or(Fallback::Software)?),
            // the controller evaluates virtual headers and locations
            Action::Modify(ref f, _) if f.is_virtual() || f.is_location() => return Err(Fallback::Software),
            Action::Modify(ref f, ref v) => {
                sets.insert(f.clone(), v.clone());
            }
            Action::Push(..) | Action::Pop(_) | Action::Copy { .. } | Action::Recurse => {
                return Err(Fallback::Software)
            }
        }
    }
    Ok((sets, out))
}

/// Switch actions producing one output per action list. Fields changed
/// for an earlier output are restored from the match before the next one.
fn hardware_actions(lists: &[ActionList], m: &FlowMatch, support: ActionSupport) -> Result<Vec<FlowAction>, Fallback> {
    let mut actions = vec![];
    let mut modified: BTreeSet<Field> = BTreeSet::new();
    for list in lists {
        let (sets, out) = net_effect(list)?;
        let out = match out {
            Some(p) => p,
            // a packet without an output port goes nowhere
            None => continue,
        };
        for field in modified.iter().filter(|f| !sets.contains_key(*f)) {
            actions.push(m.restore(field).ok_or(Fallback::Software)?);
        }
        for (field, value) in &sets {
            actions.push(set_field(field, value)?);
        }
        modified.extend(sets.into_iter().map(|(f, _)| f));
        actions.push(match out {
            Port::Physical(n) if n > MAX_PHYSICAL_PORT => return Err(Fallback::Software),
            Port::Physical(n) if m.in_port == Some(n) => FlowAction::OutputInPort,
            p => FlowAction::Output(p),
        });
    }
    if let Some(a) = actions.iter().find(|a| !support.supports(a)) {
        debug!("Switch does not support {}", a);
        return Err(Fallback::Unsupported);
    }
    Ok(actions)
}

/// Emits the flow table of `switch` for a classifier
pub fn emit(classifier: &Classifier, switch: SwitchId, support: ActionSupport, unsupported: UnsupportedFields) -> FlowTable {
    let mut entries = vec![];
    let mut seen = BTreeSet::new();
    let mut push = |entries: &mut Vec<(FlowMatch, Vec<FlowAction>, bool)>, m: FlowMatch, actions: Vec<FlowAction>, software: bool| {
        // an entry with the same match as an earlier one never fires
        if seen.insert(m.clone()) {
            entries.push((m, actions, software));
        }
    };
    for rule in classifier.rules() {
        let projection = match project(&rule.pattern, switch) {
            Some(p) => p,
            None => continue,
        };
        for m in projection.matching.with_prerequisites(projection.layer) {
            let hw = if projection.exact {
                hardware_actions(&rule.actions, &m, support)
            }
            else {
                Err(Fallback::Software)
            };
            match hw {
                Ok(actions) => {
                    // a switch only sends out the ingress port when told so explicitly
                    let hairpins: BTreeSet<PortNo> = if m.in_port.is_none() {
                        actions
                            .iter()
                            .filter_map(|a| match *a {
                                FlowAction::Output(Port::Physical(n)) => Some(n),
                                _ => None,
                            })
                            .collect()
                    }
                    else {
                        BTreeSet::new()
                    };
                    for n in hairpins {
                        let bent: Vec<FlowAction> = actions
                            .iter()
                            .map(|a| match *a {
                                FlowAction::Output(Port::Physical(p)) if p == n => FlowAction::OutputInPort,
                                a => a,
                            })
                            .collect();
                        let pinned = FlowMatch {
                            in_port: Some(n),
                            ..m.clone()
                        };
                        push(&mut entries, pinned, bent, false);
                    }
                    push(&mut entries, m, actions, false);
                }
                Err(Fallback::Unsupported) if unsupported == UnsupportedFields::Drop => {
                    debug!("Dropping packets of unsupported rule {} on switch {}", rule, switch);
                    push(&mut entries, m, vec![], false);
                }
                Err(_) => {
                    debug!("Rule {} runs on the controller for switch {}", rule, switch);
                    push(&mut entries, m, vec![FlowAction::Output(Port::Controller)], true);
                }
            }
        }
    }
    FlowTable::from_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::policy::Policy;

    fn table(policy: &Policy, switch: SwitchId) -> FlowTable {
        emit(
            &compile(policy).unwrap(),
            switch,
            ActionSupport::all(),
            UnsupportedFields::ControllerFallback,
        )
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn hub_table() {
        let t = table(&Policy::flood(), 1);
        assert_eq!(1, t.len());
        assert_eq!(1, t.entries()[0].priority);
        assert_eq!(FlowMatch::default(), t.entries()[0].matching);
        assert_eq!(vec![FlowAction::Output(Port::Flood)], t.entries()[0].actions);
    }

    #[test]
    fn priorities_descend() {
        let p = Policy::matches(Field::DstMac, MacAddr::from_u64(1)) >> Policy::fwd(1)
            | Policy::matches(Field::DstMac, MacAddr::from_u64(2)) >> Policy::fwd(2)
            | Policy::matches(Field::Inport, Port::Physical(3)) >> Policy::fwd(4);
        let t = table(&p, 1);
        let prios: Vec<u16> = t.entries().iter().map(|e| e.priority).collect();
        assert_eq!(t.len() as u16, prios[0]);
        assert!(prios.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(1, *prios.last().unwrap());
    }

    #[test]
    fn ip_prerequisites() {
        let t = table(&(Policy::matches(Field::SrcIp, ip("10.0.0.1")) >> Policy::fwd(2)), 1);
        let types: Vec<Option<u16>> = t.entries().iter().map(|e| e.matching.dl_type).collect();
        // both hairpin variants come first
        assert_eq!(
            vec![Some(ETH_TYPE_IPV4), Some(ETH_TYPE_IPV4), Some(ETH_TYPE_ARP), Some(ETH_TYPE_ARP), None],
            types
        );
        assert!(t.entries()[..4]
            .iter()
            .all(|e| e.matching.nw_src == Some((ip("10.0.0.1"), 32))));

        let t = table(&(Policy::matches(Field::DstPort, 80u16) >> Policy::fwd(2)), 1);
        let protos: BTreeSet<Option<u8>> = t.entries().iter().map(|e| e.matching.nw_proto).collect();
        assert!(protos.contains(&Some(IP_PROTO_TCP)) && protos.contains(&Some(IP_PROTO_UDP)));

        // ARP has no transport ports
        let arp_web = Pattern::any().with(Field::EthType, ETH_TYPE_ARP).with(Field::DstPort, 80u16);
        let t = table(&(Policy::filter(arp_web) >> Policy::fwd(2)), 1);
        assert_eq!(1, t.len());
    }

    #[test]
    fn rules_are_specialized_per_switch() {
        let p = Policy::matches(Field::Switch, 1u64) >> Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(2)
            | Policy::matches(Field::Switch, 2u64) >> Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(3);
        let t = table(&p, 2);
        assert_eq!(2, t.len());
        assert_eq!(Some(1), t.entries()[0].matching.in_port);
        assert_eq!(vec![FlowAction::Output(Port::Physical(3))], t.entries()[0].actions);
    }

    #[test]
    fn hairpin_uses_in_port() {
        let t = table(&(Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(1)), 1);
        assert_eq!(vec![FlowAction::OutputInPort], t.entries()[0].actions);

        let t = table(&Policy::fwd(3), 1);
        assert_eq!(2, t.len());
        assert_eq!(Some(3), t.entries()[0].matching.in_port);
        assert_eq!(vec![FlowAction::OutputInPort], t.entries()[0].actions);
        assert_eq!(vec![FlowAction::Output(Port::Physical(3))], t.entries()[1].actions);
    }

    #[test]
    fn unsupported_actions_fall_back() {
        let p = Policy::push(Field::VTag, 7u64) >> Policy::fwd(2);
        let t = table(&p, 1);
        assert_eq!(1, t.len());
        assert!(t.entries()[0].software);
        assert_eq!(vec![FlowAction::Output(Port::Controller)], t.entries()[0].actions);

        let rewrite = Policy::modify(Field::SrcMac, MacAddr::from_u64(9)) >> Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(2);
        let no_dl_src = ActionSupport::from_bits(ActionSupport::all().bits() & !(1 << 4));
        let t = emit(&compile(&rewrite).unwrap(), 1, no_dl_src, UnsupportedFields::ControllerFallback);
        assert!(t.entries()[0].software);
        let dropped = emit(&compile(&rewrite).unwrap(), 1, no_dl_src, UnsupportedFields::Drop);
        assert!(dropped.entries()[0].actions.is_empty());
        assert!(!dropped.entries()[0].software);
        let t = table(&rewrite, 1);
        assert_eq!(
            vec![FlowAction::SetDlSrc(MacAddr::from_u64(9)), FlowAction::Output(Port::Physical(2))],
            t.entries()[0].actions
        );
    }

    #[test]
    fn dropping_unsupported_actions_still_punts_software_rules() {
        let tagged = Policy::push(Field::VTag, 7u64) >> Policy::fwd(2);
        let recursive = Policy::fwd(2) >> Policy::Recurse;
        let virtual_port = Policy::modify(Field::VOutport, Port::Physical(1)) >> Policy::fwd(2);
        for p in &[tagged, recursive, virtual_port] {
            let t = emit(&compile(p).unwrap(), 1, ActionSupport::all(), UnsupportedFields::Drop);
            assert!(t.entries().iter().any(|e| e.software), "{}", p);
            assert!(t
                .entries()
                .iter()
                .filter(|e| e.software)
                .all(|e| e.actions == vec![FlowAction::Output(Port::Controller)]));
        }
    }

    #[test]
    fn parallel_outputs_restore_fields() {
        let x = MacAddr::from_u64(1);
        let y = MacAddr::from_u64(2);
        let branches = Policy::modify(Field::DstMac, y) >> Policy::fwd(1) | Policy::fwd(2);
        let pinned = Policy::matches(Field::Inport, Port::Physical(5))
            >> Policy::matches(Field::DstMac, x)
            >> branches.clone();
        let t = table(&pinned, 1);
        assert_eq!(
            vec![
                FlowAction::SetDlDst(y),
                FlowAction::Output(Port::Physical(1)),
                FlowAction::SetDlDst(x),
                FlowAction::Output(Port::Physical(2)),
            ],
            t.entries()[0].actions
        );
        assert!(!t.entries()[0].software);

        let loose = Policy::matches(Field::Inport, Port::Physical(5)) >> branches;
        assert!(table(&loose, 1).entries()[0].software);
    }

    #[test]
    fn negated_matches_become_drops() {
        let t = table(&(Policy::xfwd(1) >> Policy::matches(Field::DstMac, MacAddr::from_u64(3))), 1);
        let e = &t.entries()[0];
        assert_eq!(Some(1), e.matching.in_port);
        assert!(e.actions.is_empty());
        assert!(t.entries().iter().all(|e| !e.software));
    }

    #[test]
    fn virtual_matches_never_reach_switches() {
        let p = Policy::matches(Field::VTag, 3u64) >> Policy::fwd(1) | Policy::fwd(2);
        let t = table(&p, 1);
        assert!(t.entries().iter().all(|e| e.actions.iter().all(|a| *a != FlowAction::Output(Port::Physical(1)))));
    }

    #[test]
    fn lookup_like_a_switch() {
        let t = table(&(Policy::matches(Field::SrcIp, ip("10.0.0.1")) >> Policy::controller()), 1);
        let pkt = Packet::from_fields(vec![
            (Field::Inport, Value::Port(Port::Physical(1))),
            (Field::EthType, Value::Int(u64::from(ETH_TYPE_IPV4))),
            (Field::SrcIp, Value::Ip(ip("10.0.0.1"))),
        ]);
        let e = t.lookup(&pkt).unwrap();
        assert_eq!(vec![FlowAction::Output(Port::Controller)], e.actions);
        assert!(!e.software);
        assert!(t.lookup(&pkt.modify(Field::SrcIp, Value::Ip(ip("10.0.0.2")))).unwrap().actions.is_empty());
    }

    #[test]
    fn diff_adds_before_deleting() {
        let old = table(&(Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(2)), 1);
        let new = table(
            &(Policy::matches(Field::Inport, Port::Physical(3)) >> Policy::fwd(4)
                | Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(2)),
            1,
        );
        let mods = old.diff(&new);
        let commands: Vec<FlowModCommand> = mods.iter().map(|m| m.command).collect();
        let first_delete = commands
            .iter()
            .position(|c| *c == FlowModCommand::DeleteStrict)
            .unwrap_or_else(|| commands.len());
        assert!(commands[first_delete..].iter().all(|c| *c == FlowModCommand::DeleteStrict));
        assert!(commands[..first_delete].iter().all(|c| *c == FlowModCommand::Add));

        assert!(new.diff(&new).is_empty());
        assert_eq!(new.len(), FlowTable::default().diff(&new).len());
        assert!(new
            .diff(&FlowTable::default())
            .iter()
            .all(|m| m.command == FlowModCommand::DeleteStrict));
    }
}
