/*!
The physical network: switches with their ports and the links between them.

`Topology` is a plain value. `Network` owns the current topology as a
snapshot, is mutated by a single writer through `TopologyEvent`s and
broadcasts every new topology to its subscribers.
*/

use crate::header::{PortNo, SwitchId};
use crate::snapshot::Snapshot;

use petgraph::algo::astar;
use petgraph::graphmap::UnGraphMap;

use std::collections::{BTreeMap, BTreeSet};
use std::error;
use std::fmt;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

/// Capacity of each subscriber queue
const SUBSCRIBER_QUEUE: usize = 64;

/// A switch port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub switch: SwitchId,
    pub port: PortNo,
}

impl Location {
    pub fn new(switch: SwitchId, port: PortNo) -> Location {
        Location { switch, port }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.switch, self.port)
    }
}

/// An undirected link. `a` is the smaller endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Link {
    pub a: Location,
    pub b: Location,
}

impl Link {
    pub fn new(x: Location, y: Location) -> Link {
        if x <= y {
            Link { a: x, b: y }
        }
        else {
            Link { a: y, b: x }
        }
    }

    /// The port this link uses on `switch`
    pub fn port_at(&self, switch: SwitchId) -> Option<PortNo> {
        if self.a.switch == switch {
            Some(self.a.port)
        }
        else if self.b.switch == switch {
            Some(self.b.port)
        }
        else {
            None
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    UnknownSwitch(SwitchId),
    UnknownPort(Location),
    /// The port already carries another link
    PortInUse(Location),
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TopologyError::UnknownSwitch(s) => write!(f, "Switch {} is not part of the topology", s),
            TopologyError::UnknownPort(l) => write!(f, "Port {} is not part of the topology", l),
            TopologyError::PortInUse(l) => write!(f, "Port {} is already linked", l),
        }
    }
}

impl error::Error for TopologyError {
    fn description(&self) -> &str {
        "Inconsistent topology update"
    }
}

/// A single mutation of the topology as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    SwitchJoin(SwitchId, Vec<PortNo>),
    SwitchPart(SwitchId),
    PortUp(Location),
    PortDown(Location),
    LinkUp(Location, Location),
    LinkDown(Location, Location),
}

/// Switch membership changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEvent {
    Join(SwitchId),
    Part(SwitchId),
}

/// An undirected graph of switches with port sets and port-tagged links
#[derive(Debug, Clone, Default)]
pub struct Topology {
    graph: UnGraphMap<SwitchId, Link>,
    ports: BTreeMap<SwitchId, BTreeSet<PortNo>>,
    peers: BTreeMap<Location, Location>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds a switch or replaces the port set of a known one.
    /// Links on ports that disappeared are removed.
    pub fn add_switch<I: IntoIterator<Item = PortNo>>(&mut self, switch: SwitchId, ports: I) {
        let ports: BTreeSet<PortNo> = ports.into_iter().collect();
        let gone: Vec<Location> = self
            .ports
            .get(&switch)
            .map(|old| {
                old.difference(&ports)
                    .map(|p| Location::new(switch, *p))
                    .collect()
            })
            .unwrap_or_default();
        for loc in gone {
            self.unlink(loc);
        }
        self.graph.add_node(switch);
        self.ports.insert(switch, ports);
    }

    pub fn remove_switch(&mut self, switch: SwitchId) -> Result<(), TopologyError> {
        let ports = self
            .ports
            .remove(&switch)
            .ok_or(TopologyError::UnknownSwitch(switch))?;
        for p in ports {
            self.unlink(Location::new(switch, p));
        }
        self.graph.remove_node(switch);
        Ok(())
    }

    pub fn add_port(&mut self, loc: Location) -> Result<(), TopologyError> {
        self.ports
            .get_mut(&loc.switch)
            .ok_or(TopologyError::UnknownSwitch(loc.switch))?
            .insert(loc.port);
        Ok(())
    }

    pub fn remove_port(&mut self, loc: Location) -> Result<(), TopologyError> {
        let removed = self
            .ports
            .get_mut(&loc.switch)
            .ok_or(TopologyError::UnknownSwitch(loc.switch))?
            .remove(&loc.port);
        if !removed {
            return Err(TopologyError::UnknownPort(loc));
        }
        self.unlink(loc);
        Ok(())
    }

    fn check_port(&self, loc: Location) -> Result<(), TopologyError> {
        match self.ports.get(&loc.switch) {
            None => Err(TopologyError::UnknownSwitch(loc.switch)),
            Some(ports) if !ports.contains(&loc.port) => Err(TopologyError::UnknownPort(loc)),
            Some(_) => Ok(()),
        }
    }

    /// Links two ports. A link between the same pair of ports is accepted
    /// again; a second link between the same two switches replaces the first.
    pub fn add_link(&mut self, x: Location, y: Location) -> Result<(), TopologyError> {
        self.check_port(x)?;
        self.check_port(y)?;
        let link = Link::new(x, y);
        for &(here, there) in &[(x, y), (y, x)] {
            if let Some(peer) = self.peers.get(&here) {
                if *peer != there {
                    return Err(TopologyError::PortInUse(here));
                }
            }
        }
        if let Some(old) = self.graph.edge_weight(x.switch, y.switch).cloned() {
            if old == link {
                return Ok(());
            }
            warn!("Replacing link {} by parallel link {}", old, link);
            self.peers.remove(&old.a);
            self.peers.remove(&old.b);
        }
        self.peers.insert(x, y);
        self.peers.insert(y, x);
        self.graph.add_edge(x.switch, y.switch, link);
        Ok(())
    }

    /// Removes the link on `loc`, if any
    fn unlink(&mut self, loc: Location) -> Option<Link> {
        let peer = self.peers.remove(&loc)?;
        self.peers.remove(&peer);
        self.graph.remove_edge(loc.switch, peer.switch)
    }

    pub fn remove_link(&mut self, x: Location, y: Location) -> Result<(), TopologyError> {
        match self.peers.get(&x) {
            Some(peer) if *peer == y => {
                self.unlink(x);
                Ok(())
            }
            _ => Err(TopologyError::UnknownPort(x)),
        }
    }

    /// Applies an event, returning whether the topology changed
    pub fn apply(&mut self, event: &TopologyEvent) -> Result<bool, TopologyError> {
        match *event {
            TopologyEvent::SwitchJoin(s, ref ports) => {
                let ports: BTreeSet<PortNo> = ports.iter().cloned().collect();
                if self.ports.get(&s) == Some(&ports) {
                    return Ok(false);
                }
                self.add_switch(s, ports);
            }
            TopologyEvent::SwitchPart(s) => self.remove_switch(s)?,
            TopologyEvent::PortUp(loc) => {
                if self.ports(loc.switch).map_or(false, |p| p.contains(&loc.port)) {
                    return Ok(false);
                }
                self.add_port(loc)?
            }
            TopologyEvent::PortDown(loc) => self.remove_port(loc)?,
            TopologyEvent::LinkUp(x, y) => {
                if self.peer(x) == Some(y) {
                    return Ok(false);
                }
                self.add_link(x, y)?
            }
            TopologyEvent::LinkDown(x, y) => self.remove_link(x, y)?,
        }
        Ok(true)
    }

    pub fn contains(&self, switch: SwitchId) -> bool {
        self.ports.contains_key(&switch)
    }

    pub fn switches<'a>(&'a self) -> impl Iterator<Item = SwitchId> + 'a {
        self.ports.keys().cloned()
    }

    pub fn ports(&self, switch: SwitchId) -> Option<&BTreeSet<PortNo>> {
        self.ports.get(&switch)
    }

    /// All links, sorted
    pub fn links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self.graph.all_edges().map(|(_, _, l)| *l).collect();
        links.sort();
        links
    }

    /// The port at the other end of the link on `loc`
    pub fn peer(&self, loc: Location) -> Option<Location> {
        self.peers.get(&loc).cloned()
    }

    /// Ports without a link, where hosts attach
    pub fn edge_ports(&self) -> Vec<Location> {
        self.ports
            .iter()
            .flat_map(|(s, ports)| ports.iter().map(move |p| Location::new(*s, *p)))
            .filter(|loc| !self.peers.contains_key(loc))
            .collect()
    }

    /// Switches on a shortest path from `from` to `to`, both included
    pub fn shortest_path(&self, from: SwitchId, to: SwitchId) -> Option<Vec<SwitchId>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        astar(&self.graph, from, |n| n == to, |_| 1u32, |_| 0u32).map(|(_, path)| path)
    }

    /// The port on `switch` that starts a shortest path toward `to`
    pub fn next_hop(&self, switch: SwitchId, to: SwitchId) -> Option<PortNo> {
        let path = self.shortest_path(switch, to)?;
        let next = *path.get(1)?;
        self.graph.edge_weight(switch, next)?.port_at(switch)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (s, ports) in &self.ports {
            let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            writeln!(f, "switch {}: ports {}", s, ports.join(","))?;
        }
        for l in self.links() {
            writeln!(f, "link {}", l)?;
        }
        Ok(())
    }
}

/// The live topology with its event streams. Only the backend mutates it.
pub struct Network {
    current: Snapshot<Topology>,
    topology_subscribers: Mutex<Vec<SyncSender<Arc<Topology>>>>,
    switch_subscribers: Mutex<Vec<SyncSender<SwitchEvent>>>,
}

impl Default for Network {
    fn default() -> Self {
        Network::new(Topology::new())
    }
}

fn broadcast<T: Clone>(subscribers: &Mutex<Vec<SyncSender<T>>>, msg: &T) {
    let mut subscribers = match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    subscribers.retain(|tx| match tx.try_send(msg.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("A topology subscriber lags behind, skipping an event");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}

fn subscribe<T>(subscribers: &Mutex<Vec<SyncSender<T>>>) -> Receiver<T> {
    let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE);
    match subscribers.lock() {
        Ok(mut guard) => guard.push(tx),
        Err(poisoned) => poisoned.into_inner().push(tx),
    }
    rx
}

impl Network {
    pub fn new(initial: Topology) -> Network {
        Network {
            current: Snapshot::new(initial),
            topology_subscribers: Mutex::new(vec![]),
            switch_subscribers: Mutex::new(vec![]),
        }
    }

    /// The current topology snapshot
    pub fn current(&self) -> Arc<Topology> {
        self.current.load()
    }

    /// Receives every new topology after it has been published
    pub fn topology_changes(&self) -> Receiver<Arc<Topology>> {
        subscribe(&self.topology_subscribers)
    }

    pub fn switch_events(&self) -> Receiver<SwitchEvent> {
        subscribe(&self.switch_subscribers)
    }

    /// Applies an event and publishes the result. Inconsistent events are
    /// logged and leave the topology unchanged.
    /// Returns the new topology if anything changed.
    pub fn apply(&self, event: &TopologyEvent) -> Option<Arc<Topology>> {
        let mut next = (*self.current()).clone();
        match next.apply(event) {
            Ok(true) => {}
            Ok(false) => {
                trace!("Topology unchanged by {:?}", event);
                return None;
            }
            Err(e) => {
                warn!("Ignoring {:?}: {}", event, e);
                return None;
            }
        }
        debug!("Topology changed by {:?}", event);
        let next = Arc::new(next);
        self.current.store_arc(Arc::clone(&next));
        match *event {
            TopologyEvent::SwitchJoin(s, _) => broadcast(&self.switch_subscribers, &SwitchEvent::Join(s)),
            TopologyEvent::SwitchPart(s) => broadcast(&self.switch_subscribers, &SwitchEvent::Part(s)),
            _ => {}
        }
        broadcast(&self.topology_subscribers, &next);
        Some(next)
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Network({:?})", self.current())
    }
}

/// Allocates ports in order: hosts first, then links in the given order
fn build(switches: &[SwitchId], hosts: &BTreeMap<SwitchId, u32>, links: &[(SwitchId, SwitchId)]) -> Topology {
    let mut next: BTreeMap<SwitchId, PortNo> = switches
        .iter()
        .map(|s| (*s, hosts.get(s).cloned().unwrap_or(0) + 1))
        .collect();
    let mut placed = vec![];
    for &(x, y) in links {
        let px = next[&x];
        *next.entry(x).or_insert(1) += 1;
        let py = next[&y];
        *next.entry(y).or_insert(1) += 1;
        placed.push((Location::new(x, px), Location::new(y, py)));
    }
    let mut topo = Topology::new();
    for s in switches {
        topo.add_switch(*s, 1..next[s]);
    }
    for (x, y) in placed {
        if let Err(e) = topo.add_link(x, y) {
            warn!("Skipping link {} <-> {}: {}", x, y, e);
        }
    }
    topo
}

/// A single switch with ports 1 to `ports`
pub fn single(ports: u32) -> Topology {
    let mut hosts = BTreeMap::new();
    hosts.insert(1, ports);
    build(&[1], &hosts, &[])
}

/// Switches 1 to `n` in a line, each with `hosts` host ports numbered from 1
pub fn linear(n: u64, hosts: u32) -> Topology {
    let switches: Vec<SwitchId> = (1..=n).collect();
    let links: Vec<_> = (1..n).map(|s| (s, s + 1)).collect();
    build(&switches, &switches.iter().map(|s| (*s, hosts)).collect(), &links)
}

/// Like `linear`, with the last switch linked back to the first
pub fn ring(n: u64, hosts: u32) -> Topology {
    let switches: Vec<SwitchId> = (1..=n).collect();
    let mut links: Vec<_> = (1..n).map(|s| (s, s + 1)).collect();
    if n > 2 {
        links.push((n, 1));
    }
    build(&switches, &switches.iter().map(|s| (*s, hosts)).collect(), &links)
}

/// A complete tree of switches numbered breadth first from the root 1.
/// Leaves carry `fanout` host ports.
pub fn tree(depth: u32, fanout: u64) -> Topology {
    let mut switches = vec![1];
    let mut links = vec![];
    let mut level = vec![1];
    for _ in 1..depth {
        let mut children = vec![];
        for parent in level {
            for _ in 0..fanout {
                let child = switches.len() as u64 + 1;
                switches.push(child);
                links.push((parent, child));
                children.push(child);
            }
        }
        level = children;
    }
    let hosts = level.iter().map(|s| (*s, fanout as u32)).collect();
    build(&switches, &hosts, &links)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(s: SwitchId, p: PortNo) -> Location {
        Location::new(s, p)
    }

    #[test]
    fn linear_builder() {
        let t = linear(4, 1);
        assert_eq!(vec![1, 2, 3, 4], t.switches().collect::<Vec<_>>());
        assert_eq!(
            vec![
                Link::new(loc(1, 2), loc(2, 2)),
                Link::new(loc(2, 3), loc(3, 2)),
                Link::new(loc(3, 3), loc(4, 2)),
            ],
            t.links()
        );
        assert_eq!(vec![loc(1, 1), loc(2, 1), loc(3, 1), loc(4, 1)], t.edge_ports());
    }

    #[test]
    fn tree_and_ring_builders() {
        let t = tree(2, 2);
        assert_eq!(3, t.switches().count());
        assert_eq!(2, t.links().len());
        assert_eq!(4, t.edge_ports().len());

        let r = ring(4, 1);
        assert_eq!(4, r.links().len());
        assert_eq!(Some(loc(1, 3)), r.peer(loc(4, 3)));

        assert_eq!(3, single(3).edge_ports().len());
    }

    #[test]
    fn shortest_paths() {
        let t = linear(4, 1);
        assert_eq!(Some(vec![1, 2, 3, 4]), t.shortest_path(1, 4));
        assert_eq!(Some(vec![3]), t.shortest_path(3, 3));
        assert_eq!(Some(2), t.next_hop(1, 4));
        assert_eq!(Some(2), t.next_hop(3, 1));
        assert_eq!(None, t.next_hop(3, 3));

        let r = ring(6, 1);
        assert_eq!(Some(vec![1, 6, 5]), r.shortest_path(1, 5));
    }

    #[test]
    fn inconsistent_links_are_rejected() {
        let mut t = linear(3, 1);
        assert_eq!(Err(TopologyError::UnknownSwitch(9)), t.add_link(loc(9, 1), loc(1, 1)));
        assert_eq!(Err(TopologyError::UnknownPort(loc(1, 7))), t.add_link(loc(1, 7), loc(3, 1)));
        assert_eq!(Err(TopologyError::PortInUse(loc(1, 2))), t.add_link(loc(1, 2), loc(3, 1)));
        assert_eq!(2, t.links().len());
    }

    #[test]
    fn removing_ports_and_switches_drops_links() {
        let mut t = linear(3, 1);
        t.remove_port(loc(2, 3)).unwrap();
        assert_eq!(1, t.links().len());
        assert_eq!(None, t.peer(loc(3, 2)));
        assert_eq!(None, t.shortest_path(1, 3));

        t.remove_switch(1).unwrap();
        assert!(t.links().is_empty());
        assert!(!t.contains(1));
    }

    #[test]
    fn network_broadcasts_changes() {
        let net = Network::new(linear(3, 1));
        let topo_rx = net.topology_changes();
        let switch_rx = net.switch_events();

        let before = net.current();
        let after = net
            .apply(&TopologyEvent::LinkDown(loc(2, 3), loc(3, 2)))
            .unwrap();
        assert_eq!(2, before.links().len());
        assert_eq!(1, after.links().len());
        assert_eq!(1, topo_rx.try_recv().unwrap().links().len());

        assert!(net.apply(&TopologyEvent::SwitchJoin(4, vec![1, 2])).is_some());
        assert_eq!(SwitchEvent::Join(4), switch_rx.try_recv().unwrap());
        assert!(net.apply(&TopologyEvent::SwitchJoin(4, vec![1, 2])).is_none());

        // inconsistent events are ignored
        assert!(net
            .apply(&TopologyEvent::LinkUp(loc(4, 1), loc(7, 1)))
            .is_none());
        assert!(net.current().contains(4));
        assert_eq!(1, topo_rx.try_iter().count());
    }
}
