/*!
The policy language: an AST of filters, modifications and combinators,
smart constructors that normalize while building, and the reference
evaluator.

```
use polyflow::header::{Field, Port};
use polyflow::pattern::Pattern;
use polyflow::policy::Policy;

let web = Policy::filter(Pattern::any().with(Field::DstPort, 80u16));
let policy = web >> Policy::fwd(2) | Policy::xfwd(1);
assert!(!policy.is_filter());
```
*/

use crate::classifier::Action;
use crate::header::{Field, Packet, Port, Value};
use crate::pattern::Pattern;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, Shr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};

/// Default bound on nested `recurse` evaluations
pub const DEFAULT_RECURSION_LIMIT: usize = 16;

/// A policy maps a packet to a multiset of packets
#[derive(Clone, PartialEq)]
pub enum Policy {
    Filter(Pattern),
    Mod(Action),
    Par(Vec<Policy>),
    Seq(Vec<Policy>),
    Neg(Box<Policy>),
    IfThenElse(Box<Policy>, Box<Policy>, Box<Policy>),
    Dynamic(DynamicPolicy),
    /// Re-enters the top level policy with the current packet
    Recurse,
}

impl Policy {
    /// Passes every packet
    pub fn identity() -> Policy {
        Policy::Filter(Pattern::any())
    }

    /// Passes no packet
    pub fn drop() -> Policy {
        Policy::Filter(Pattern::none())
    }

    pub fn filter(pattern: Pattern) -> Policy {
        Policy::Filter(pattern)
    }

    /// Passes packets whose `field` equals `value`
    pub fn matches<V: Into<Value>>(field: Field, value: V) -> Policy {
        Policy::Filter(Pattern::any().with(field, value))
    }

    pub fn modify<V: Into<Value>>(field: Field, value: V) -> Policy {
        Policy::Mod(Action::Modify(field, value.into()))
    }

    pub fn push<V: Into<Value>>(field: Field, value: V) -> Policy {
        Policy::Mod(Action::Push(field, value.into()))
    }

    pub fn pop(field: Field) -> Policy {
        Policy::Mod(Action::Pop(field))
    }

    pub fn copy(dst: Field, src: Field) -> Policy {
        Policy::Mod(Action::Copy { dst, src })
    }

    pub fn forward(port: Port) -> Policy {
        Policy::Mod(Action::Forward(port))
    }

    pub fn fwd(port: u32) -> Policy {
        Policy::forward(Port::Physical(port))
    }

    pub fn flood() -> Policy {
        Policy::forward(Port::Flood)
    }

    pub fn controller() -> Policy {
        Policy::forward(Port::Controller)
    }

    /// Forwards out of `port` unless the packet came in there
    pub fn xfwd(port: u32) -> Policy {
        let came_in = Policy::matches(Field::Inport, Port::Physical(port));
        Policy::seq(vec![Policy::negate(came_in), Policy::fwd(port)])
    }

    /// Parallel composition. Nested `Par`s are flattened and drops removed.
    pub fn par(policies: Vec<Policy>) -> Policy {
        let mut flat = Vec::with_capacity(policies.len());
        for p in policies {
            match p {
                Policy::Par(inner) => flat.extend(inner),
                ref p if p.is_drop() => {}
                p => flat.push(p),
            }
        }
        match flat.len() {
            0 => Policy::drop(),
            1 => flat.remove(0),
            _ => Policy::Par(flat),
        }
    }

    /// Sequential composition. Nested `Seq`s are flattened, identities elided
    /// and any drop makes the whole sequence a drop.
    pub fn seq(policies: Vec<Policy>) -> Policy {
        let mut flat = Vec::with_capacity(policies.len());
        for p in policies {
            match p {
                Policy::Seq(inner) => {
                    if inner.iter().any(Policy::is_drop) {
                        return Policy::drop();
                    }
                    flat.extend(inner)
                }
                ref p if p.is_drop() => return Policy::drop(),
                ref p if p.is_identity() => {}
                p => flat.push(p),
            }
        }
        match flat.len() {
            0 => Policy::identity(),
            1 => flat.remove(0),
            _ => Policy::Seq(flat),
        }
    }

    /// Complement of a filter
    pub fn negate(filter: Policy) -> Policy {
        match filter {
            Policy::Neg(inner) => *inner,
            ref f if f.is_drop() => Policy::identity(),
            ref f if f.is_identity() => Policy::drop(),
            f => Policy::Neg(Box::new(f)),
        }
    }

    /// `(pred >> then) | (!pred >> otherwise)`
    pub fn if_(pred: Policy, then: Policy, otherwise: Policy) -> Policy {
        if pred.is_identity() {
            return then;
        }
        if pred.is_drop() {
            return otherwise;
        }
        Policy::IfThenElse(Box::new(pred), Box::new(then), Box::new(otherwise))
    }

    /// Filter difference: packets passing `self` but not `other`
    pub fn difference(self, other: Policy) -> Policy {
        Policy::seq(vec![self, Policy::negate(other)])
    }

    pub fn is_drop(&self) -> bool {
        match *self {
            Policy::Filter(ref p) => p.is_none(),
            _ => false,
        }
    }

    pub fn is_identity(&self) -> bool {
        match *self {
            Policy::Filter(ref p) => p.is_any(),
            _ => false,
        }
    }

    /// Whether the policy only ever passes or drops packets unchanged
    pub fn is_filter(&self) -> bool {
        match *self {
            Policy::Filter(_) | Policy::Neg(_) => true,
            Policy::Mod(_) | Policy::Recurse => false,
            Policy::Par(ref ps) | Policy::Seq(ref ps) => ps.iter().all(Policy::is_filter),
            Policy::IfThenElse(ref pred, ref t, ref e) => {
                pred.is_filter() && t.is_filter() && e.is_filter()
            }
            Policy::Dynamic(ref d) => d.current().is_filter(),
        }
    }

    /// Renames fields throughout the policy. Dynamic sub-policies are renamed lazily.
    pub fn relabel(&self, map: &BTreeMap<Field, Field>) -> Policy {
        match *self {
            Policy::Filter(ref p) => Policy::Filter(p.map_slots(|s| match map.get(&s.field) {
                Some(f) => crate::pattern::Slot {
                    field: f.clone(),
                    depth: s.depth,
                },
                None => s.clone(),
            })),
            Policy::Mod(ref a) => Policy::Mod(a.relabel(map)),
            Policy::Par(ref ps) => Policy::Par(ps.iter().map(|p| p.relabel(map)).collect()),
            Policy::Seq(ref ps) => Policy::Seq(ps.iter().map(|p| p.relabel(map)).collect()),
            Policy::Neg(ref p) => Policy::Neg(Box::new(p.relabel(map))),
            Policy::IfThenElse(ref pred, ref t, ref e) => Policy::IfThenElse(
                Box::new(pred.relabel(map)),
                Box::new(t.relabel(map)),
                Box::new(e.relabel(map)),
            ),
            Policy::Dynamic(ref d) => {
                let map = map.clone();
                Policy::Dynamic(d.derive(move |p| p.relabel(&map)))
            }
            Policy::Recurse => Policy::Recurse,
        }
    }

    /// Replaces every dynamic sub-policy by its current value
    pub fn freeze(&self) -> Policy {
        match *self {
            Policy::Filter(_) | Policy::Mod(_) | Policy::Recurse => self.clone(),
            Policy::Par(ref ps) => Policy::Par(ps.iter().map(Policy::freeze).collect()),
            Policy::Seq(ref ps) => Policy::Seq(ps.iter().map(Policy::freeze).collect()),
            Policy::Neg(ref p) => Policy::Neg(Box::new(p.freeze())),
            Policy::IfThenElse(ref pred, ref t, ref e) => Policy::IfThenElse(
                Box::new(pred.freeze()),
                Box::new(t.freeze()),
                Box::new(e.freeze()),
            ),
            Policy::Dynamic(ref d) => d.current().freeze(),
        }
    }

    /// All dynamic policies reachable from this one, including nested ones
    pub fn dynamics(&self) -> Vec<DynamicPolicy> {
        let mut found = vec![];
        self.collect_dynamics(&mut found);
        found
    }

    fn collect_dynamics(&self, found: &mut Vec<DynamicPolicy>) {
        match *self {
            Policy::Filter(_) | Policy::Mod(_) | Policy::Recurse => {}
            Policy::Par(ref ps) | Policy::Seq(ref ps) => {
                for p in ps {
                    p.collect_dynamics(found);
                }
            }
            Policy::Neg(ref p) => p.collect_dynamics(found),
            Policy::IfThenElse(ref pred, ref t, ref e) => {
                pred.collect_dynamics(found);
                t.collect_dynamics(found);
                e.collect_dynamics(found);
            }
            Policy::Dynamic(ref d) => {
                if !found.iter().any(|f| f.id() == d.id()) {
                    found.push(d.clone());
                    d.current().collect_dynamics(found);
                }
            }
        }
    }

    /// Evaluates the policy on a packet, with itself as the `recurse` target
    pub fn eval(&self, pkt: &Packet) -> Vec<Packet> {
        Evaluator::new(self).eval(pkt)
    }
}

impl Shr for Policy {
    type Output = Policy;

    fn shr(self, rhs: Policy) -> Policy {
        Policy::seq(vec![self, rhs])
    }
}

impl BitOr for Policy {
    type Output = Policy;

    fn bitor(self, rhs: Policy) -> Policy {
        Policy::par(vec![self, rhs])
    }
}

fn write_list(f: &mut fmt::Formatter, ps: &[Policy], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, p) in ps.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", sep)?;
        }
        write!(f, "{}", p)?;
    }
    write!(f, ")")
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Policy::Filter(ref p) if p.is_any() => write!(f, "identity"),
            Policy::Filter(ref p) if p.is_none() => write!(f, "drop"),
            Policy::Filter(ref p) => write!(f, "match{}", p),
            Policy::Mod(ref a) => write!(f, "{}", a),
            Policy::Par(ref ps) => write_list(f, ps, "|"),
            Policy::Seq(ref ps) => write_list(f, ps, ">>"),
            Policy::Neg(ref p) => write!(f, "~{}", p),
            Policy::IfThenElse(ref pred, ref t, ref e) => write!(f, "if_({}, {}, {})", pred, t, e),
            Policy::Dynamic(ref d) => write!(f, "dynamic#{}({})", d.id(), d.current()),
            Policy::Recurse => write!(f, "recurse"),
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

type Derivation = Arc<dyn Fn(&Policy) -> Policy + Send + Sync>;

enum Source {
    Cell(RwLock<Arc<Policy>>),
    Derived(DynamicPolicy, Derivation),
}

struct DynamicInner {
    source: Source,
    version: AtomicUsize,
    watchers: Mutex<Vec<SyncSender<()>>>,
}

/// A policy whose value can be swapped at runtime.
///
/// Readers get an immutable snapshot. Swapping notifies every watcher channel;
/// a full channel already carries a pending notification.
#[derive(Clone)]
pub struct DynamicPolicy {
    inner: Arc<DynamicInner>,
}

impl DynamicPolicy {
    pub fn new(initial: Policy) -> DynamicPolicy {
        DynamicPolicy {
            inner: Arc::new(DynamicInner {
                source: Source::Cell(RwLock::new(Arc::new(initial))),
                version: AtomicUsize::new(0),
                watchers: Mutex::new(vec![]),
            }),
        }
    }

    /// A dynamic policy that always equals `f` applied to this one
    pub fn derive<F>(&self, f: F) -> DynamicPolicy
    where
        F: Fn(&Policy) -> Policy + Send + Sync + 'static,
    {
        DynamicPolicy {
            inner: Arc::new(DynamicInner {
                source: Source::Derived(self.clone(), Arc::new(f)),
                version: AtomicUsize::new(0),
                watchers: Mutex::new(vec![]),
            }),
        }
    }

    /// Identifies the underlying cell
    pub fn id(&self) -> usize {
        &*self.inner as *const DynamicInner as usize
    }

    pub fn current(&self) -> Arc<Policy> {
        match self.inner.source {
            Source::Cell(ref cell) => match cell.read() {
                Ok(p) => Arc::clone(&p),
                Err(poisoned) => Arc::clone(&poisoned.into_inner()),
            },
            Source::Derived(ref base, ref f) => Arc::new(f(&*base.current())),
        }
    }

    /// The number of swaps so far
    pub fn version(&self) -> usize {
        match self.inner.source {
            Source::Cell(_) => self.inner.version.load(Ordering::SeqCst),
            Source::Derived(ref base, _) => base.version(),
        }
    }

    /// Swaps in a new policy and notifies the watchers
    pub fn set(&self, policy: Policy) {
        match self.inner.source {
            Source::Cell(ref cell) => {
                let mut current = match cell.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *current = Arc::new(policy);
            }
            Source::Derived(..) => {
                error!("Ignoring assignment to derived dynamic policy #{}", self.id());
                return;
            }
        }
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Dynamic policy #{} changed to version {}", self.id(), version);
        self.notify();
    }

    fn notify(&self) {
        let mut watchers = match self.inner.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watchers.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Registers a channel that receives a message after each swap
    pub fn watch(&self, tx: SyncSender<()>) {
        match self.inner.source {
            Source::Derived(ref base, _) => base.watch(tx),
            Source::Cell(_) => match self.inner.watchers.lock() {
                Ok(mut guard) => guard.push(tx),
                Err(poisoned) => poisoned.into_inner().push(tx),
            },
        }
    }
}

impl PartialEq for DynamicPolicy {
    fn eq(&self, other: &DynamicPolicy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DynamicPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DynamicPolicy#{}", self.id())
    }
}

/// Evaluates policies on single packets.
/// `recurse` restarts at the root policy until the recursion limit is hit.
pub struct Evaluator<'a> {
    root: &'a Policy,
    limit: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(root: &'a Policy) -> Evaluator<'a> {
        Evaluator {
            root,
            limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Evaluator<'a> {
        self.limit = limit;
        self
    }

    pub fn eval(&self, pkt: &Packet) -> Vec<Packet> {
        self.eval_at(self.root, pkt, 0)
    }

    fn eval_at(&self, policy: &Policy, pkt: &Packet, depth: usize) -> Vec<Packet> {
        match *policy {
            Policy::Filter(ref p) => {
                if p.matches(pkt) {
                    vec![pkt.clone()]
                }
                else {
                    vec![]
                }
            }
            Policy::Mod(ref a) => vec![a.apply(pkt)],
            Policy::Par(ref ps) => ps.iter().flat_map(|p| self.eval_at(p, pkt, depth)).collect(),
            Policy::Seq(ref ps) => ps.iter().fold(vec![pkt.clone()], |pkts, p| {
                pkts.iter().flat_map(|q| self.eval_at(p, q, depth)).collect()
            }),
            Policy::Neg(ref f) => {
                if self.eval_at(f, pkt, depth).is_empty() {
                    vec![pkt.clone()]
                }
                else {
                    vec![]
                }
            }
            Policy::IfThenElse(ref pred, ref t, ref e) => {
                let passed = self.eval_at(pred, pkt, depth);
                if passed.is_empty() {
                    self.eval_at(e, pkt, depth)
                }
                else {
                    passed.iter().flat_map(|q| self.eval_at(t, q, depth)).collect()
                }
            }
            Policy::Dynamic(ref d) => self.eval_at(&d.current(), pkt, depth),
            Policy::Recurse => {
                if depth >= self.limit {
                    warn!("Dropping packet after {} nested recursions: {}", depth, pkt);
                    return vec![];
                }
                self.eval_at(self.root, pkt, depth + 1)
            }
        }
    }
}
