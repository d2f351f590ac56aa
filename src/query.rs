/*!
Queries: policies whose packets end up in a bucket on the controller.

A query is used like any other policy, usually after a filter:

```
use polyflow::header::Field;
use polyflow::policy::Policy;
use polyflow::query::PacketsQuery;

let first_seen = PacketsQuery::new(Some(1), vec![Field::SrcMac, Field::Switch]);
let policy = Policy::flood() | first_seen.policy();
assert!(!policy.is_filter());
```

Every packet a query receives is tagged with the query's bucket and sent to
the controller. Register the query's `handler` with the runtime, it picks
the packets of its own bucket out of the controller-bound traffic.
*/

use crate::header::{Field, Packet, Value};
use crate::pattern::Pattern;
use crate::policy::{DynamicPolicy, Policy};

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

/// The virtual field carrying the bucket id of a query packet
pub const BUCKET_TAG: &str = "bucket";

static NEXT_BUCKET: AtomicU64 = AtomicU64::new(1);

/// The values of the grouping fields a packet has
pub type Group = Vec<(Field, Value)>;

type Callback<T> = Box<dyn FnMut(&T) + Send>;

fn bucket_field() -> Field {
    Field::Tag(BUCKET_TAG.to_owned())
}

/// Sends packets to the controller marked with bucket `id`
fn bucket(id: u64) -> Policy {
    Policy::modify(bucket_field(), id) >> Policy::controller()
}

/// The packet without its bucket mark if it belongs to bucket `id`
fn unpack(id: u64, pkt: &Packet) -> Option<Packet> {
    let field = bucket_field();
    match pkt.get(&field).and_then(Value::as_int) {
        Some(b) if b == id => Some(pkt.pop(&field)),
        _ => None,
    }
}

fn group(pkt: &Packet, group_by: &[Field]) -> Group {
    group_by
        .iter()
        .filter_map(|f| pkt.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Seen {
    /// Packets per group
    counts: BTreeMap<Group, usize>,
    /// Groups past the limit, no longer sent to the controller
    exhausted: Vec<Pattern>,
}

/// Calls back with every packet it receives, optionally only with the
/// first `limit` packets of each group. Packets are in the same group when
/// they agree on all `group_by` fields; without `group_by` fields the
/// group is the whole header.
#[derive(Clone)]
pub struct PacketsQuery {
    id: u64,
    limit: Option<usize>,
    group_by: Vec<Field>,
    root: DynamicPolicy,
    seen: Arc<Mutex<Seen>>,
    callbacks: Arc<Mutex<Vec<Callback<Packet>>>>,
}

impl PacketsQuery {
    pub fn new(limit: Option<usize>, group_by: Vec<Field>) -> PacketsQuery {
        let id = NEXT_BUCKET.fetch_add(1, Ordering::Relaxed);
        let initial = if limit == Some(0) { Policy::drop() } else { bucket(id) };
        PacketsQuery {
            id,
            limit,
            group_by,
            root: DynamicPolicy::new(initial),
            seen: Arc::new(Mutex::new(Seen {
                counts: BTreeMap::new(),
                exhausted: vec![],
            })),
            callbacks: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn policy(&self) -> Policy {
        Policy::Dynamic(self.root.clone())
    }

    pub fn register_callback<F>(&self, callback: F)
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        lock(&self.callbacks).push(Box::new(callback));
    }

    /// A packet handler for the runtime
    pub fn handler(&self) -> impl FnMut(&Packet) + Send + 'static {
        let query = self.clone();
        move |pkt| {
            query.receive(pkt);
        }
    }

    /// Takes a controller-bound packet. Returns whether it was delivered
    /// to the callbacks.
    pub fn receive(&self, pkt: &Packet) -> bool {
        let pkt = match unpack(self.id, pkt) {
            Some(p) => p,
            None => return false,
        };
        if let Some(limit) = self.limit {
            let key = if self.group_by.is_empty() {
                pkt.fields()
                    .filter(|(f, _)| !f.is_location())
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect()
            }
            else {
                group(&pkt, &self.group_by)
            };
            let mut seen = lock(&self.seen);
            let count = {
                let count = seen.counts.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if count > limit {
                trace!("Bucket {} is full for {:?}", self.id, key);
                return false;
            }
            if count == limit && !self.group_by.is_empty() && key.len() == self.group_by.len() {
                let pattern = key.into_iter().fold(Pattern::any(), |p, (f, v)| p.with(f, v));
                seen.exhausted.push(pattern);
                let full = Policy::par(seen.exhausted.iter().cloned().map(Policy::filter).collect());
                debug!("Bucket {} stops receiving {} groups", self.id, seen.exhausted.len());
                self.root.set(Policy::negate(full) >> bucket(self.id));
            }
        }
        for callback in lock(&self.callbacks).iter_mut() {
            callback(&pkt);
        }
        true
    }
}

/// What a counting query adds up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Packets,
    /// Frame lengths
    Bytes,
}

/// The totals of a counting query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    pub total: u64,
    /// Per group, empty without grouping fields
    pub groups: BTreeMap<Group, u64>,
}

/// Counts packets or bytes, in total and per group
#[derive(Clone)]
pub struct CountQuery {
    id: u64,
    measure: Measure,
    group_by: Vec<Field>,
    counts: Arc<Mutex<Counts>>,
    callbacks: Arc<Mutex<Vec<Callback<Counts>>>>,
}

/// Counts the packets reaching the query
pub fn count_packets(group_by: Vec<Field>) -> CountQuery {
    CountQuery::new(Measure::Packets, group_by)
}

/// Counts the frame bytes reaching the query
pub fn count_bytes(group_by: Vec<Field>) -> CountQuery {
    CountQuery::new(Measure::Bytes, group_by)
}

impl CountQuery {
    pub fn new(measure: Measure, group_by: Vec<Field>) -> CountQuery {
        CountQuery {
            id: NEXT_BUCKET.fetch_add(1, Ordering::Relaxed),
            measure,
            group_by,
            counts: Arc::new(Mutex::new(Counts::default())),
            callbacks: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn policy(&self) -> Policy {
        bucket(self.id)
    }

    pub fn counts(&self) -> Counts {
        lock(&self.counts).clone()
    }

    pub fn register_callback<F>(&self, callback: F)
    where
        F: FnMut(&Counts) + Send + 'static,
    {
        lock(&self.callbacks).push(Box::new(callback));
    }

    /// A packet handler for the runtime
    pub fn handler(&self) -> impl FnMut(&Packet) + Send + 'static {
        let query = self.clone();
        move |pkt| {
            query.receive(pkt);
        }
    }

    /// Adds a controller-bound packet of this query to the counts
    pub fn receive(&self, pkt: &Packet) -> bool {
        let pkt = match unpack(self.id, pkt) {
            Some(p) => p,
            None => return false,
        };
        let amount = match self.measure {
            Measure::Packets => 1,
            Measure::Bytes => pkt.payload().len() as u64,
        };
        let mut counts = lock(&self.counts);
        counts.total += amount;
        if !self.group_by.is_empty() {
            *counts.groups.entry(group(&pkt, &self.group_by)).or_insert(0) += amount;
        }
        true
    }

    /// Calls the callbacks with the current counts
    pub fn report(&self) {
        let counts = self.counts();
        for callback in lock(&self.callbacks).iter_mut() {
            callback(&counts);
        }
    }

    /// Reports every `interval` from a thread that ends once every handle
    /// to the query is gone
    pub fn report_every(&self, interval: Duration) -> io::Result<thread::JoinHandle<()>> {
        let counts: Weak<Mutex<Counts>> = Arc::downgrade(&self.counts);
        let callbacks = Arc::downgrade(&self.callbacks);
        let (id, measure, group_by) = (self.id, self.measure, self.group_by.clone());
        thread::Builder::new().name(format!("count {}", id)).spawn(move || loop {
            thread::sleep(interval);
            let query = match (counts.upgrade(), callbacks.upgrade()) {
                (Some(counts), Some(callbacks)) => CountQuery {
                    id,
                    measure,
                    group_by: group_by.clone(),
                    counts,
                    callbacks,
                },
                _ => break,
            };
            query.report();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::flowtable::{emit, ActionSupport, FlowAction, UnsupportedFields};
    use crate::header::{MacAddr, Port, SwitchId};

    use std::sync::mpsc::channel;

    fn packet(switch: SwitchId, src: u64, dst: u64, len: usize) -> Packet {
        Packet::with_payload(vec![0; len])
            .modify(Field::Switch, Value::Int(switch))
            .modify(Field::Inport, Value::Port(Port::Physical(1)))
            .modify(Field::SrcMac, Value::Mac(MacAddr::from_u64(src)))
            .modify(Field::DstMac, Value::Mac(MacAddr::from_u64(dst)))
    }

    /// Runs a packet through a policy and hands the controller's share to `receive`
    fn run<F: FnMut(&Packet) -> bool>(policy: &Policy, pkt: &Packet, mut receive: F) -> usize {
        policy
            .eval(pkt)
            .iter()
            .filter(|p| p.get(&Field::Outport) == Some(&Value::Port(Port::Controller)))
            .filter(|p| receive(p))
            .count()
    }

    #[test]
    fn limit_per_group() {
        let query = PacketsQuery::new(Some(2), vec![Field::SrcMac]);
        let (tx, rx) = channel();
        query.register_callback(move |pkt| tx.send(pkt.clone()).unwrap());

        let mut delivered = 0;
        for _ in 0..5 {
            delivered += run(&query.policy(), &packet(1, 1, 9, 60), |p| query.receive(p));
        }
        assert_eq!(2, delivered);
        delivered = 0;
        for _ in 0..3 {
            delivered += run(&query.policy(), &packet(2, 2, 9, 60), |p| query.receive(p));
        }
        assert_eq!(2, delivered);

        let got: Vec<Packet> = rx.try_iter().collect();
        assert_eq!(4, got.len());
        // callbacks see the packet without its bucket
        assert!(got.iter().all(|p| p.get(&bucket_field()).is_none()));
    }

    #[test]
    fn full_groups_leave_the_policy() {
        let query = PacketsQuery::new(Some(1), vec![Field::SrcMac, Field::Switch]);
        assert_eq!(1, run(&query.policy(), &packet(1, 1, 9, 60), |p| query.receive(p)));
        // the switch stops punting the group, other groups still reach the bucket
        assert!(query.policy().eval(&packet(1, 1, 9, 60)).is_empty());
        assert_eq!(1, query.policy().eval(&packet(2, 1, 9, 60)).len());
        assert_eq!(1, run(&query.policy(), &packet(1, 2, 9, 60), |p| query.receive(p)));
    }

    #[test]
    fn unlimited_queries_deliver_everything() {
        let query = PacketsQuery::new(None, vec![]);
        let pkt = packet(1, 1, 2, 60);
        for _ in 0..10 {
            assert_eq!(1, run(&query.policy(), &pkt, |p| query.receive(p)));
        }
        assert!(PacketsQuery::new(Some(0), vec![]).policy().eval(&pkt).is_empty());
    }

    #[test]
    fn buckets_only_take_their_own_packets() {
        let a = PacketsQuery::new(None, vec![]);
        let b = PacketsQuery::new(None, vec![]);
        let policy = Policy::matches(Field::Switch, 1u64) >> a.policy() | b.policy() | Policy::controller();
        let pkt = packet(2, 1, 2, 60);
        assert_eq!(0, run(&policy, &pkt, |p| a.receive(p)));
        assert_eq!(1, run(&policy, &pkt, |p| b.receive(p)));
    }

    #[test]
    fn counting() {
        let packets = count_packets(vec![Field::Switch]);
        let bytes = count_bytes(vec![]);
        let policy = packets.policy() | bytes.policy();
        for (switch, len) in &[(1, 60), (1, 100), (2, 1500)] {
            let mut handlers = (packets.handler(), bytes.handler());
            for out in policy.eval(&packet(*switch, 1, 2, *len)) {
                (handlers.0)(&out);
                (handlers.1)(&out);
            }
        }
        let counts = packets.counts();
        assert_eq!(3, counts.total);
        assert_eq!(Some(&2), counts.groups.get(&vec![(Field::Switch, Value::Int(1))]));
        assert_eq!(Some(&1), counts.groups.get(&vec![(Field::Switch, Value::Int(2))]));
        assert_eq!(1660, bytes.counts().total);
        assert!(bytes.counts().groups.is_empty());

        let (tx, rx) = channel();
        bytes.register_callback(move |c| tx.send(c.total).unwrap());
        bytes.report();
        assert_eq!(Ok(1660), rx.try_recv());
    }

    #[test]
    fn periodic_reports() {
        let query = count_packets(vec![]);
        let (tx, rx) = channel();
        query.register_callback(move |c| {
            let _ = tx.send(c.total);
        });
        query.receive(&packet(1, 1, 2, 60).modify(bucket_field(), Value::Int(query.id)));
        let reporter = query.report_every(Duration::from_millis(10)).unwrap();
        assert_eq!(Ok(1), rx.recv_timeout(Duration::from_secs(5)));
        drop(query);
        reporter.join().unwrap();
    }

    #[test]
    fn queries_run_on_the_controller() {
        let query = PacketsQuery::new(None, vec![]);
        let policy = Policy::fwd(2) | query.policy();
        let table = emit(&compile(&policy).unwrap(), 1, ActionSupport::all(), UnsupportedFields::Drop);
        assert!(table
            .entries()
            .iter()
            .all(|e| e.software && e.actions == vec![FlowAction::Output(Port::Controller)]));
    }
}
