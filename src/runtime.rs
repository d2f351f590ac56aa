/*!
The control loop keeping switches in sync with a policy.

A `Runtime` owns the live topology, the flow tables installed on every
switch and the compile worker. Backends feed it `Event`s through the
channel returned by `Runtime::sender` and receive flow mods and packet
outs through the `Backend` trait.

Every topology or policy change starts a new generation. Compile results
are tagged with the generation they were started for and are installed
only if no newer change arrived in the meantime.
*/

use crate::classifier::Classifier;
use crate::codec;
use crate::compile::{compile_with, CancelToken, CompileError};
use crate::flowtable::{emit, ActionSupport, FlowAction, FlowMod, FlowTable, UnsupportedFields};
use crate::header::{Field, Packet, Port, PortNo, SwitchId, Value};
use crate::policy::{Evaluator, Policy, DEFAULT_RECURSION_LIMIT};
use crate::snapshot::Snapshot;
use crate::topology::{Network, Topology, TopologyEvent};

use log::Level;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::mpsc::{channel, sync_channel, Receiver, RecvTimeoutError, SendError, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const EVENT_QUEUE: usize = 1024;

/// The switch side of the runtime
pub trait Backend: Send + Sync {
    /// Applies flow mods to a switch, in order
    fn install(&self, switch: SwitchId, mods: &[FlowMod]) -> io::Result<()>;

    /// Sends a frame out of `port`. `inport` is the port the frame counts as
    /// received on, which `Port::Flood` excludes.
    fn packet_out(&self, switch: SwitchId, inport: Option<PortNo>, port: Port, raw: &[u8]) -> io::Result<()>;
}

/// When policies are compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStrategy {
    /// Every change is compiled and installed right away
    Eager,
    /// Policy changes punt everything to the controller until the topology changes
    LazyOnTopologyChange,
    /// Changes punt everything to the controller until the next packet in
    LazyOnFirstPkt,
}

impl Default for CompileStrategy {
    fn default() -> Self {
        CompileStrategy::Eager
    }
}

impl FromStr for CompileStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<CompileStrategy, Self::Err> {
        match s {
            "eager" => Ok(CompileStrategy::Eager),
            "lazy_on_topology_change" => Ok(CompileStrategy::LazyOnTopologyChange),
            "lazy_on_first_pkt" => Ok(CompileStrategy::LazyOnFirstPkt),
            _ => Err(format!("unknown compile strategy {}", s)),
        }
    }
}

impl fmt::Display for CompileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            CompileStrategy::Eager => "eager",
            CompileStrategy::LazyOnTopologyChange => "lazy_on_topology_change",
            CompileStrategy::LazyOnFirstPkt => "lazy_on_first_pkt",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Log every compile at info level
    pub verbose: bool,
    pub strategy: CompileStrategy,
    pub unsupported: UnsupportedFields,
    pub recursion_limit: usize,
    /// Compile on a worker thread instead of the control loop
    pub background: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            verbose: false,
            strategy: CompileStrategy::default(),
            unsupported: UnsupportedFields::default(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            background: true,
        }
    }
}

/// A finished compilation, installed only if it is still current
pub struct Compiled {
    generation: u64,
    topology: Arc<Topology>,
    classifier: Arc<Classifier>,
    tables: BTreeMap<SwitchId, FlowTable>,
}

impl fmt::Debug for Compiled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Compiled(generation {}, {} rules, {} switches)",
            self.generation,
            self.classifier.len(),
            self.tables.len()
        )
    }
}

/// Input of the control loop
#[derive(Debug)]
pub enum Event {
    Topology(TopologyEvent),
    /// The actions a switch supports
    Capabilities(SwitchId, ActionSupport),
    PacketIn(SwitchId, PortNo, Vec<u8>),
    /// A dynamic policy was swapped
    PolicyChanged,
    Compiled(Compiled),
    Shutdown,
}

/// What is installed on the switches
#[derive(Debug, Clone, Default)]
pub struct Installed {
    pub generation: u64,
    /// The classifier behind the tables, `None` before the first compile
    pub classifier: Option<Arc<Classifier>>,
    pub tables: BTreeMap<SwitchId, FlowTable>,
}

struct Job {
    generation: u64,
    policy: Policy,
    topology: Arc<Topology>,
    switches: Vec<(SwitchId, ActionSupport)>,
    unsupported: UnsupportedFields,
    token: CancelToken,
}

impl Job {
    fn run(self) -> Option<Compiled> {
        let classifier = match compile_with(&self.policy, &self.token) {
            Ok(c) => c,
            Err(CompileError::Cancelled) => {
                debug!("Compile of generation {} cancelled", self.generation);
                return None;
            }
            Err(e) => {
                error!("Compile of generation {} failed: {}", self.generation, e);
                return None;
            }
        };
        let mut tables = BTreeMap::new();
        for (switch, support) in self.switches {
            if self.token.is_cancelled() {
                debug!("Compile of generation {} cancelled", self.generation);
                return None;
            }
            tables.insert(switch, emit(&classifier, switch, support, self.unsupported));
        }
        Some(Compiled {
            generation: self.generation,
            topology: self.topology,
            classifier: Arc::new(classifier),
            tables,
        })
    }
}

/// Compiles on its own thread, skipping requests superseded while it was busy
struct Worker {
    jobs: Sender<Job>,
}

impl Worker {
    fn spawn(events: SyncSender<Event>) -> io::Result<Worker> {
        let (jobs, rx) = channel::<Job>();
        thread::Builder::new()
            .name("compile".to_owned())
            .spawn(move || {
                while let Ok(mut job) = rx.recv() {
                    while let Ok(newer) = rx.try_recv() {
                        trace!("Compile of generation {} superseded by {}", job.generation, newer.generation);
                        job = newer;
                    }
                    if let Some(compiled) = job.run() {
                        if events.send(Event::Compiled(compiled)).is_err() {
                            break;
                        }
                    }
                }
                debug!("Compile worker stopped");
            })?;
        Ok(Worker { jobs })
    }
}

/// Turns dynamic policy notifications into events
fn spawn_policy_watch(events: SyncSender<Event>) -> io::Result<SyncSender<()>> {
    let (tx, rx) = sync_channel(1);
    thread::Builder::new()
        .name("policy-watch".to_owned())
        .spawn(move || {
            for () in rx.iter() {
                if events.send(Event::PolicyChanged).is_err() {
                    break;
                }
            }
        })?;
    Ok(tx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Policy,
    Topology,
}

type PacketHandler = Box<dyn FnMut(&Packet) + Send>;
type TopologyHook = Box<dyn FnMut(&Topology) + Send>;

/// Owns all controller state. Drive it with `run` or `step`.
pub struct Runtime<B: Backend> {
    config: RuntimeConfig,
    backend: Arc<B>,
    policy: Policy,
    network: Network,
    events: Receiver<Event>,
    sender: SyncSender<Event>,
    policy_watch: Option<SyncSender<()>>,
    watched: BTreeSet<usize>,
    worker: Option<Worker>,
    generation: u64,
    in_flight: CancelToken,
    /// Punting everything until the next compile
    deferred: bool,
    connected: BTreeSet<SwitchId>,
    /// Switches that failed an install and wait for a rejoin
    disconnected: BTreeSet<SwitchId>,
    support: BTreeMap<SwitchId, ActionSupport>,
    classifier: Option<Arc<Classifier>>,
    tables: BTreeMap<SwitchId, FlowTable>,
    installed: Arc<Snapshot<Installed>>,
    handlers: Vec<PacketHandler>,
    topology_hooks: Vec<TopologyHook>,
    stopped: bool,
}

impl<B: Backend> Runtime<B> {
    pub fn new(policy: Policy, backend: Arc<B>, config: RuntimeConfig) -> Runtime<B> {
        let (sender, events) = sync_channel(EVENT_QUEUE);
        let worker = if config.background {
            match Worker::spawn(sender.clone()) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!("Compiling in the control loop, cannot start a worker: {}", e);
                    None
                }
            }
        }
        else {
            None
        };
        let policy_watch = match spawn_policy_watch(sender.clone()) {
            Ok(tx) => Some(tx),
            Err(e) => {
                warn!("Dynamic policy changes go unnoticed: {}", e);
                None
            }
        };

        let mut runtime = Runtime {
            config,
            backend,
            policy,
            network: Network::default(),
            events,
            sender,
            policy_watch,
            watched: BTreeSet::new(),
            worker,
            generation: 0,
            in_flight: CancelToken::new(),
            deferred: false,
            connected: BTreeSet::new(),
            disconnected: BTreeSet::new(),
            support: BTreeMap::new(),
            classifier: None,
            tables: BTreeMap::new(),
            installed: Arc::new(Snapshot::default()),
            handlers: vec![],
            topology_hooks: vec![],
            stopped: false,
        };
        runtime.watch_dynamics();
        runtime
    }

    /// The channel backends send their events to
    pub fn sender(&self) -> SyncSender<Event> {
        self.sender.clone()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The currently installed state
    pub fn installed(&self) -> Arc<Installed> {
        self.installed.load()
    }

    /// A handle to follow the installed state from other threads
    pub fn observe(&self) -> Arc<Snapshot<Installed>> {
        Arc::clone(&self.installed)
    }

    /// Registers a handler for packets the policy sends to the controller
    pub fn on_packet<F>(&mut self, handler: F)
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Registers a hook run on every topology change, before recompiling
    pub fn on_topology<F>(&mut self, hook: F)
    where
        F: FnMut(&Topology) + Send + 'static,
    {
        self.topology_hooks.push(Box::new(hook));
    }

    /// Processes events until a `Shutdown` arrives
    pub fn run(&mut self) {
        info!("Runtime running with {} compilation", self.config.strategy);
        while !self.stopped {
            match self.events.recv() {
                Ok(event) => self.handle(event),
                Err(_) => break,
            }
        }
    }

    /// Processes at most one event. Returns whether there was one.
    pub fn step(&mut self, timeout: Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.handle(event);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn handle(&mut self, event: Event) {
        trace!("Handling {:?}", event);
        match event {
            Event::Topology(e) => self.on_topology_event(e),
            Event::Capabilities(switch, support) => self.on_capabilities(switch, support),
            Event::PacketIn(switch, inport, raw) => self.on_packet_in(switch, inport, &raw),
            Event::PolicyChanged => {
                self.watch_dynamics();
                self.changed(Change::Policy);
            }
            Event::Compiled(compiled) => self.on_compiled(compiled),
            Event::Shutdown => {
                info!("Runtime shutting down");
                self.in_flight.cancel();
                self.stopped = true;
            }
        }
    }

    fn watch_dynamics(&mut self) {
        let tx = match self.policy_watch {
            Some(ref tx) => tx,
            None => return,
        };
        for d in self.policy.dynamics() {
            if self.watched.insert(d.id()) {
                d.watch(tx.clone());
            }
        }
    }

    fn compile_level(&self) -> Level {
        if self.config.verbose {
            Level::Info
        }
        else {
            Level::Debug
        }
    }

    fn on_topology_event(&mut self, event: TopologyEvent) {
        let joined = match event {
            TopologyEvent::SwitchJoin(switch, _) => Some(switch),
            TopologyEvent::SwitchPart(switch) => {
                info!("Switch {} left", switch);
                self.connected.remove(&switch);
                self.disconnected.remove(&switch);
                self.support.remove(&switch);
                self.tables.remove(&switch);
                None
            }
            TopologyEvent::PortUp(loc) | TopologyEvent::PortDown(loc) => {
                if self.disconnected.contains(&loc.switch) {
                    debug!("Dropping {:?} of disconnected switch", event);
                    return;
                }
                None
            }
            TopologyEvent::LinkUp(x, y) | TopologyEvent::LinkDown(x, y) => {
                if self.disconnected.contains(&x.switch) || self.disconnected.contains(&y.switch) {
                    debug!("Dropping {:?} of disconnected switch", event);
                    return;
                }
                None
            }
        };

        let topology = self.network.apply(&event);
        if let Some(switch) = joined {
            self.join(switch);
        }
        if let Some(ref topology) = topology {
            let topology: &Topology = topology;
            for hook in &mut self.topology_hooks {
                hook(topology);
            }
        }
        if topology.is_some() || joined.is_some() {
            self.changed(Change::Topology);
        }
        else {
            self.publish();
        }
    }

    /// Starts a switch from an empty table
    fn join(&mut self, switch: SwitchId) {
        info!("Switch {} joined", switch);
        self.disconnected.remove(&switch);
        self.connected.insert(switch);
        if self.install(switch, &[FlowMod::clear()]) {
            self.tables.insert(switch, FlowTable::default());
        }
    }

    fn on_capabilities(&mut self, switch: SwitchId, support: ActionSupport) {
        if self.disconnected.contains(&switch) {
            debug!("Dropping capabilities of disconnected switch {}", switch);
            return;
        }
        if self.support.insert(switch, support) != Some(support) {
            debug!("Switch {} supports actions {:#x}", switch, support.bits());
            self.changed(Change::Topology);
        }
    }

    fn changed(&mut self, change: Change) {
        let compile_now = match self.config.strategy {
            CompileStrategy::Eager => true,
            CompileStrategy::LazyOnTopologyChange => change == Change::Topology,
            CompileStrategy::LazyOnFirstPkt => false,
        };
        if compile_now {
            self.request_compile();
        }
        else {
            self.defer();
        }
    }

    /// Starts a new generation; anything compiled for an older one is stale
    fn supersede(&mut self) -> CancelToken {
        self.in_flight.cancel();
        self.generation += 1;
        self.in_flight = CancelToken::new();
        self.in_flight.clone()
    }

    fn defer(&mut self) {
        self.supersede();
        self.deferred = true;
        debug!("Generation {} punts all packets to the controller", self.generation);
        let punt = FlowTable::punt_all();
        let switches: Vec<SwitchId> = self.connected.iter().cloned().collect();
        for switch in switches {
            self.install_table(switch, punt.clone());
        }
        self.classifier = Some(Arc::new(Classifier::punt_all()));
        self.publish();
    }

    fn request_compile(&mut self) {
        self.deferred = false;
        let token = self.supersede();
        let job = Job {
            generation: self.generation,
            policy: self.policy.freeze(),
            topology: self.network.current(),
            switches: self
                .connected
                .iter()
                .map(|s| (*s, self.support.get(s).cloned().unwrap_or_else(ActionSupport::all)))
                .collect(),
            unsupported: self.config.unsupported,
            token,
        };
        log!(
            self.compile_level(),
            "Compiling generation {} for {} switches",
            job.generation,
            job.switches.len()
        );

        let job = match self.worker {
            Some(ref worker) => match worker.jobs.send(job) {
                Ok(()) => return,
                Err(SendError(job)) => {
                    error!("Compile worker is gone, compiling in the control loop");
                    job
                }
            },
            None => job,
        };
        self.worker = None;
        if let Some(compiled) = job.run() {
            self.on_compiled(compiled);
        }
    }

    fn on_compiled(&mut self, compiled: Compiled) {
        if compiled.generation != self.generation || !Arc::ptr_eq(&compiled.topology, &self.network.current()) {
            debug!(
                "Discarding compile of generation {}, current is {}",
                compiled.generation, self.generation
            );
            return;
        }
        log!(
            self.compile_level(),
            "Installing generation {} with {} rules",
            compiled.generation,
            compiled.classifier.len()
        );
        if self.config.verbose {
            info!("Classifier of generation {}:\n{}", compiled.generation, compiled.classifier);
        }
        for (switch, table) in compiled.tables {
            if self.connected.contains(&switch) {
                self.install_table(switch, table);
            }
        }
        self.classifier = Some(compiled.classifier);
        self.publish();
    }

    /// Brings a switch from its installed table to `next`
    fn install_table(&mut self, switch: SwitchId, next: FlowTable) {
        let mods = match self.tables.get(&switch) {
            Some(current) => current.diff(&next),
            None => FlowTable::default().diff(&next),
        };
        if mods.is_empty() {
            return;
        }
        trace!("Switch {} gets {} flow mods", switch, mods.len());
        if self.install(switch, &mods) {
            self.tables.insert(switch, next);
        }
    }

    /// Sends flow mods, retrying once. A switch failing twice is disconnected.
    fn install(&mut self, switch: SwitchId, mods: &[FlowMod]) -> bool {
        for attempt in 1..3 {
            match self.backend.install(switch, mods) {
                Ok(()) => return true,
                Err(e) => warn!("Installing on switch {} failed (attempt {}): {}", switch, attempt, e),
            }
        }
        error!("Switch {} is disconnected until it joins again", switch);
        self.connected.remove(&switch);
        self.tables.remove(&switch);
        self.disconnected.insert(switch);
        false
    }

    fn publish(&self) {
        self.installed.store(Installed {
            generation: self.generation,
            classifier: self.classifier.clone(),
            tables: self.tables.clone(),
        });
    }

    fn on_packet_in(&mut self, switch: SwitchId, inport: PortNo, raw: &[u8]) {
        if !self.connected.contains(&switch) {
            debug!("Dropping packet in from disconnected switch {}", switch);
            return;
        }
        let pkt = codec::decode(switch, inport, raw);

        // the switch already forwarded the packet, it only needs the controller's share
        let forwarded = match self.tables.get(&switch).and_then(|t| t.lookup(&pkt)) {
            Some(entry) => !entry.software && entry.actions.contains(&FlowAction::Output(Port::Controller)),
            None => false,
        };
        if self.deferred && self.config.strategy == CompileStrategy::LazyOnFirstPkt {
            self.request_compile();
        }

        let policy = self.policy.freeze();
        let outputs = Evaluator::new(&policy)
            .with_recursion_limit(self.config.recursion_limit)
            .eval(&pkt);
        trace!("Packet in {} yields {} packets", pkt, outputs.len());
        for out in outputs {
            match out.get(&Field::Outport).and_then(Value::as_port) {
                Some(Port::Controller) => {
                    for handler in &mut self.handlers {
                        handler(&out);
                    }
                }
                Some(port) => {
                    if !forwarded {
                        self.packet_out(switch, &out, port);
                    }
                }
                None => trace!("Dropping {} without output port", out),
            }
        }
    }

    fn packet_out(&self, switch: SwitchId, pkt: &Packet, port: Port) {
        let target = pkt.get(&Field::Switch).and_then(Value::as_int).unwrap_or(switch);
        if !self.connected.contains(&target) {
            debug!("Cannot send {} out of disconnected switch {}", pkt, target);
            return;
        }
        let inport = match pkt.get(&Field::Inport).and_then(Value::as_port) {
            Some(Port::Physical(n)) => Some(n),
            _ => None,
        };
        let raw = codec::encode(pkt);
        if let Err(e) = self.backend.packet_out(target, inport, port, &raw) {
            warn!("Packet out on switch {} port {} failed: {}", target, port, e);
        }
    }
}
