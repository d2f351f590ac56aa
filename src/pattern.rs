/*!
Header patterns: partial maps from field stack slots to matchers.

A field absent from a pattern is a wildcard. A field present in a pattern
requires the packet to carry a value there that the matcher accepts.
*/

use crate::header::{Field, Packet, Value};

use ipnetwork::Ipv4Network;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

/// Accepts a set of values of a single field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// Exactly this value
    Exact(Value),
    /// An IPv4 address inside the network, except the listed addresses
    Prefix(Ipv4Network, BTreeSet<Ipv4Addr>),
    /// Any value except the listed ones. An empty set only requires presence.
    Except(BTreeSet<Value>),
}

fn net_contains(outer: &Ipv4Network, inner: &Ipv4Network) -> bool {
    outer.prefix() <= inner.prefix() && outer.contains(inner.network())
}

impl Matcher {
    /// A prefix matcher, normalized to its network address.
    /// A host prefix becomes an exact matcher.
    pub fn prefix(net: Ipv4Network) -> Matcher {
        Matcher::prefix_except(net, BTreeSet::new()).unwrap_or_else(|| Matcher::Except(BTreeSet::new()))
    }

    fn prefix_except(net: Ipv4Network, except: BTreeSet<Ipv4Addr>) -> Option<Matcher> {
        let prefix = net.prefix();
        let addr = net.network();
        if prefix == 32 {
            if except.contains(&addr) {
                return None;
            }
            return Some(Matcher::Exact(Value::Ip(addr)));
        }
        let net = Ipv4Network::new(addr, prefix).ok()?;
        let except = except.into_iter().filter(|ip| net.contains(*ip)).collect();
        Some(Matcher::Prefix(net, except))
    }

    /// Accepts every present value
    pub fn present() -> Matcher {
        Matcher::Except(BTreeSet::new())
    }

    /// Accepts every present value but `value`
    pub fn not(value: Value) -> Matcher {
        let mut set = BTreeSet::new();
        set.insert(value);
        Matcher::Except(set)
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match *self {
            Matcher::Exact(ref v) => v == value,
            Matcher::Prefix(ref net, ref except) => match *value {
                Value::Ip(ip) => net.contains(ip) && !except.contains(&ip),
                _ => false,
            },
            Matcher::Except(ref except) => !except.contains(value),
        }
    }

    /// Whether this matcher excludes values that a switch cannot express
    pub fn has_exclusions(&self) -> bool {
        match *self {
            Matcher::Exact(_) => false,
            Matcher::Prefix(_, ref except) => !except.is_empty(),
            Matcher::Except(ref except) => !except.is_empty(),
        }
    }

    /// The matcher without exclusions and the excluded values
    fn split_exclusions(&self) -> (Matcher, Vec<Value>) {
        match *self {
            Matcher::Exact(_) => (self.clone(), vec![]),
            Matcher::Prefix(ref net, ref except) => (
                Matcher::Prefix(*net, BTreeSet::new()),
                except.iter().map(|ip| Value::Ip(*ip)).collect(),
            ),
            Matcher::Except(ref except) => (Matcher::present(), except.iter().cloned().collect()),
        }
    }

    /// The values accepted by both matchers, `None` if there are none
    pub fn intersect(&self, other: &Matcher) -> Option<Matcher> {
        match (self, other) {
            (&Matcher::Exact(ref v), m) | (m, &Matcher::Exact(ref v)) => {
                if m.accepts(v) {
                    Some(Matcher::Exact(v.clone()))
                }
                else {
                    None
                }
            }
            (&Matcher::Prefix(ref n1, ref e1), &Matcher::Prefix(ref n2, ref e2)) => {
                let narrower = if net_contains(n1, n2) {
                    n2
                }
                else if net_contains(n2, n1) {
                    n1
                }
                else {
                    return None;
                };
                Matcher::prefix_except(*narrower, e1.union(e2).cloned().collect())
            }
            (&Matcher::Prefix(ref net, ref e1), &Matcher::Except(ref e2))
            | (&Matcher::Except(ref e2), &Matcher::Prefix(ref net, ref e1)) => {
                let mut except = e1.clone();
                except.extend(e2.iter().filter_map(|v| v.as_ip()));
                Matcher::prefix_except(*net, except)
            }
            (&Matcher::Except(ref e1), &Matcher::Except(ref e2)) => {
                Some(Matcher::Except(e1.union(e2).cloned().collect()))
            }
        }
    }

    /// Whether every value accepted by `other` is accepted by this matcher.
    /// Conservative: may answer `false` for covering matchers.
    pub fn covers(&self, other: &Matcher) -> bool {
        match (self, other) {
            (m, &Matcher::Exact(ref v)) => m.accepts(v),
            (&Matcher::Exact(_), _) => false,
            (&Matcher::Prefix(ref n1, ref e1), &Matcher::Prefix(ref n2, ref e2)) => {
                net_contains(n1, n2) && e1.iter().all(|ip| !n2.contains(*ip) || e2.contains(ip))
            }
            (&Matcher::Prefix(..), &Matcher::Except(_)) => false,
            (&Matcher::Except(ref e1), &Matcher::Prefix(ref n2, ref e2)) => e1.iter().all(|v| match *v {
                Value::Ip(ip) => !n2.contains(ip) || e2.contains(&ip),
                _ => true,
            }),
            (&Matcher::Except(ref e1), &Matcher::Except(ref e2)) => e1.is_subset(e2),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Matcher::Exact(ref v) => write!(f, "={}", v),
            Matcher::Prefix(ref net, ref except) => {
                write!(f, "={}/{}", net.network(), net.prefix())?;
                for ip in except {
                    write!(f, "!{}", ip)?;
                }
                Ok(())
            }
            Matcher::Except(ref except) => {
                if except.is_empty() {
                    return write!(f, "=*");
                }
                let vals: Vec<String> = except.iter().map(|v| v.to_string()).collect();
                write!(f, "!={}", vals.join("|"))
            }
        }
    }
}

/// Addresses a value inside a field's stack, `depth` 0 being the top
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    pub field: Field,
    pub depth: usize,
}

impl Slot {
    pub fn top(field: Field) -> Slot {
        Slot { field, depth: 0 }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.depth == 0 {
            write!(f, "{}", self.field)
        }
        else {
            write!(f, "{}[{}]", self.field, self.depth)
        }
    }
}

/// A conjunction of matchers. `Pattern::any()` matches everything,
/// `Pattern::none()` nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    slots: BTreeMap<Slot, Matcher>,
    never: bool,
}

impl Default for Pattern {
    fn default() -> Self {
        Pattern::any()
    }
}

impl Pattern {
    pub fn any() -> Pattern {
        Pattern {
            slots: BTreeMap::new(),
            never: false,
        }
    }

    pub fn none() -> Pattern {
        Pattern {
            slots: BTreeMap::new(),
            never: true,
        }
    }

    pub fn is_any(&self) -> bool {
        !self.never && self.slots.is_empty()
    }

    pub fn is_none(&self) -> bool {
        self.never
    }

    /// Adds a matcher, intersecting it with any matcher already on the slot
    pub fn constrain(mut self, slot: Slot, matcher: Matcher) -> Pattern {
        if self.never {
            return self;
        }
        let merged = match self.slots.get(&slot) {
            Some(old) => old.intersect(&matcher),
            None => Some(matcher),
        };
        match merged {
            Some(m) => {
                self.slots.insert(slot, m);
                self
            }
            None => Pattern::none(),
        }
    }

    /// Requires `field` to equal `value`
    pub fn with<V: Into<Value>>(self, field: Field, value: V) -> Pattern {
        self.constrain(Slot::top(field), Matcher::Exact(value.into()))
    }

    /// Requires an IP field to lie inside `net`
    pub fn with_prefix(self, field: Field, net: Ipv4Network) -> Pattern {
        self.constrain(Slot::top(field), Matcher::prefix(net))
    }

    /// Requires `field` to be present and differ from `value`
    pub fn without<V: Into<Value>>(self, field: Field, value: V) -> Pattern {
        self.constrain(Slot::top(field), Matcher::not(value.into()))
    }

    /// Requires `field` to be present
    pub fn present(self, field: Field) -> Pattern {
        self.constrain(Slot::top(field), Matcher::present())
    }

    pub fn get(&self, field: &Field) -> Option<&Matcher> {
        self.slots.get(&Slot::top(field.clone()))
    }

    pub fn get_slot(&self, slot: &Slot) -> Option<&Matcher> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Slot, &Matcher)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Drops the constraint on `slot`
    pub fn unconstrain(mut self, slot: &Slot) -> Pattern {
        self.slots.remove(slot);
        self
    }

    /// Rewrites the slots through `f`; colliding slots are intersected
    pub fn map_slots<F>(&self, mut f: F) -> Pattern
    where
        F: FnMut(&Slot) -> Slot,
    {
        if self.never {
            return Pattern::none();
        }
        self.slots
            .iter()
            .fold(Pattern::any(), |p, (slot, m)| p.constrain(f(slot), m.clone()))
    }

    pub fn matches(&self, pkt: &Packet) -> bool {
        !self.never
            && self.slots.iter().all(|(slot, m)| {
                pkt.get_at(&slot.field, slot.depth)
                    .map_or(false, |v| m.accepts(v))
            })
    }

    /// The pattern matching exactly the packets matched by both
    pub fn intersect(&self, other: &Pattern) -> Pattern {
        if self.never || other.never {
            return Pattern::none();
        }
        other
            .slots
            .iter()
            .fold(self.clone(), |p, (slot, m)| p.constrain(slot.clone(), m.clone()))
    }

    /// Syntactic subsumption: every packet matched by `other` is matched by `self`
    pub fn covers(&self, other: &Pattern) -> bool {
        if other.never {
            return true;
        }
        if self.never {
            return false;
        }
        self.slots.iter().all(|(slot, m)| match other.slots.get(slot) {
            Some(om) => m.covers(om),
            None => false,
        })
    }

    pub fn has_exclusions(&self) -> bool {
        self.slots.values().any(|m| m.has_exclusions())
    }

    /// Splits the pattern into one without exclusions and the excluded (slot, value) pairs.
    /// A packet matches the pattern iff it matches the first part and carries none of the pairs.
    pub fn split_exclusions(&self) -> (Pattern, Vec<(Slot, Value)>) {
        if self.never {
            return (self.clone(), vec![]);
        }
        let mut positive = Pattern::any();
        let mut excluded = vec![];
        for (slot, m) in &self.slots {
            let (base, values) = m.split_exclusions();
            positive.slots.insert(slot.clone(), base);
            excluded.extend(values.into_iter().map(|v| (slot.clone(), v)));
        }
        (positive, excluded)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.never {
            return write!(f, "none");
        }
        if self.slots.is_empty() {
            return write!(f, "any");
        }
        let parts: Vec<String> = self
            .slots
            .iter()
            .map(|(s, m)| format!("{}{}", s, m))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
