/*!
Implements the OpenFlow 1.0 switch side of the runtime.

Each connected switch is served by its own `OfController` thread. The
thread announces the switch and its ports to the runtime, turns port
status messages into topology events, discovers links by sending probe
frames out of every port and reports the packets the switch sends up.
`OfBackend` routes flow mods and packet outs from the runtime to the
thread owning the switch's connection.
*/

pub mod error;
pub mod messages;

use crate::codec::ETH_TYPE_PROBE;
use crate::conf::*;
use crate::flowtable::{ActionSupport, FlowAction, FlowEntry, FlowMatch, FlowMod, FlowModCommand};
use crate::header::{Port, PortNo, SwitchId};
use crate::runtime::{Backend, Event};
use crate::topology::{Location, TopologyEvent};

use crate::openflow::error::{Error, Result};
use crate::openflow::messages::deserialize::Deserialize;
use crate::openflow::messages::serialize::{port_number, OfpPacket};
use crate::openflow::messages::*;

use byteorder::{ByteOrder, NetworkEndian};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "tls")]
use tls_api::TlsAcceptor;
use tls_api::TlsStream;

/// How long a read waits before pending commands are looked at
const POLL_MILLIS: u64 = 50;
/// How long the runtime waits for an install to be written
const REPLY_SECS: u64 = 5;
const PROBE_SECS: u64 = 5;
/// Links whose probes stay away this many rounds are down
const PROBE_ROUNDS: u32 = 3;
/// Above any compiled entry
const PROBE_PRIORITY: u16 = 0xffff;
/// The nearest-bridge group address, never forwarded by bridges
const PROBE_DST: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e];
/// Destination, source, ethertype, datapath id, port, padded to the minimal frame
const PROBE_LENGTH: usize = 60;

fn gen_xid() -> u32 {
    let xid = rand::random();
    trace!("Using xid {} for the outgoing message", xid);
    xid
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}
impl Stream {
    fn from(_connection: &OfConnection, stream: TcpStream) -> tls_api::Result<Stream> {
        #[cfg(feature = "tls")]
        {
            if let Some(acc) = _connection.tls_acceptor()? {
                return match acc.accept(stream) {
                    Ok(s) => Ok(Stream::Tls(s)),
                    Err(tls_api::HandshakeError::Failure(e)) => Err(e),
                    Err(tls_api::HandshakeError::Interrupted(_)) => {
                        Err(tls_api::Error::new_other("TLS stream was interrupted"))
                    }
                };
            }
        }
        Ok(Stream::Tcp(stream))
    }
}
impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            Stream::Tls(ref mut s) => s.read(buf),
        }
    }
}
impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            Stream::Tls(ref mut s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            Stream::Tls(ref mut s) => s.flush(),
        }
    }
}

/// A discovery probe leaving `switch` through `port`
fn probe_frame(switch: SwitchId, port: u16) -> Vec<u8> {
    let mut frame = vec![0; PROBE_LENGTH];
    frame[0..6].copy_from_slice(&PROBE_DST);
    let mut id = [0; 8];
    NetworkEndian::write_u64(&mut id, switch);
    frame[6..12].copy_from_slice(&id[2..8]);
    NetworkEndian::write_u16(&mut frame[12..14], ETH_TYPE_PROBE);
    frame[14..22].copy_from_slice(&id);
    NetworkEndian::write_u16(&mut frame[22..24], port);
    frame
}

/// The port a probe was sent from
fn parse_probe(frame: &[u8]) -> Option<Location> {
    if frame.len() < 24 || NetworkEndian::read_u16(&frame[12..14]) != ETH_TYPE_PROBE {
        return None;
    }
    let switch = NetworkEndian::read_u64(&frame[14..22]);
    let port = NetworkEndian::read_u16(&frame[22..24]);
    Some(Location::new(switch, PortNo::from(port)))
}

/// Keeps probes flowing to the controller whatever the compiled tables say
fn probe_flow() -> FlowMod {
    FlowMod {
        command: FlowModCommand::Add,
        entry: FlowEntry {
            priority: PROBE_PRIORITY,
            matching: FlowMatch {
                dl_type: Some(ETH_TYPE_PROBE),
                ..FlowMatch::default()
            },
            actions: vec![FlowAction::Output(Port::Controller)],
            software: false,
        },
    }
}

fn is_clear(flow_mod: &FlowMod) -> bool {
    flow_mod.command == FlowModCommand::Delete && flow_mod.entry.matching == FlowMatch::default()
}

#[derive(Debug)]
enum Command {
    Install(Vec<FlowMod>, SyncSender<io::Result<()>>),
    PacketOut { in_port: u16, port: u16, data: Vec<u8> },
}

/// The connection of a switch, tagged to tell reconnects apart
#[derive(Debug)]
struct Handle {
    id: usize,
    commands: Sender<Command>,
}

/// Routes runtime requests to the connected switches
#[derive(Debug, Default)]
pub struct OfBackend {
    switches: Mutex<BTreeMap<SwitchId, Handle>>,
    connections: AtomicUsize,
}

impl OfBackend {
    pub fn new() -> OfBackend {
        OfBackend::default()
    }

    /// Accepts switch connections on `listener` until the process ends.
    /// Every switch gets its own thread.
    pub fn listen(
        backend: Arc<OfBackend>,
        listener: TcpListener,
        connection: OfConnection,
        events: SyncSender<Event>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("listener".to_owned())
            .spawn(move || loop {
                if let Err(e) = OfController::accept(&backend, &listener, &connection, &events) {
                    error!("retry connection on error: {}", e);
                }
            })
    }

    /// Switches with a live connection
    pub fn switches(&self) -> Vec<SwitchId> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<BTreeMap<SwitchId, Handle>> {
        match self.switches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, switch: SwitchId, commands: Sender<Command>) -> usize {
        let id = self.connections.fetch_add(1, Ordering::SeqCst);
        if self.lock().insert(switch, Handle { id, commands }).is_some() {
            info!("Switch {} reconnected", switch);
        }
        id
    }

    /// Forgets the connection. False if the switch has reconnected meanwhile.
    fn deregister(&self, switch: SwitchId, id: usize) -> bool {
        let mut switches = self.lock();
        match switches.get(&switch) {
            Some(handle) if handle.id == id => {
                switches.remove(&switch);
                true
            }
            _ => false,
        }
    }

    fn command(&self, switch: SwitchId, command: Command) -> io::Result<()> {
        let switches = self.lock();
        let handle = switches.get(&switch).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("switch {} is not connected", switch))
        })?;
        handle.commands.send(command).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("connection of switch {} is closing", switch))
        })
    }
}

impl Backend for OfBackend {
    fn install(&self, switch: SwitchId, mods: &[FlowMod]) -> io::Result<()> {
        let (reply, result) = sync_channel(1);
        self.command(switch, Command::Install(mods.to_vec(), reply))?;
        match result.recv_timeout(Duration::from_secs(REPLY_SECS)) {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("switch {} did not take {} flow mods", switch, mods.len()),
            )),
        }
    }

    fn packet_out(&self, switch: SwitchId, inport: Option<PortNo>, port: Port, raw: &[u8]) -> io::Result<()> {
        let in_port = inport.map_or(OFPP_NONE, |p| port_number(Port::Physical(p)));
        // a switch drops frames sent out of their input port unless asked explicitly
        let port = match (port, inport) {
            (Port::Physical(p), Some(i)) if p == i => OFPP_IN_PORT,
            _ => port_number(port),
        };
        self.command(
            switch,
            Command::PacketOut {
                in_port,
                port,
                data: raw.to_vec(),
            },
        )
    }
}

/// The state of one switch connection
pub struct OfController {
    backend: Arc<OfBackend>,
    events: SyncSender<Event>,
    stream: Stream,
    peer: SocketAddr,
    inbox: Vec<u8>,
    hello_received: bool,
    /// Datapath id and connection tag, once the features reply arrived
    datapath: Option<(SwitchId, usize)>,
    ports: BTreeSet<u16>,
    commands: Receiver<Command>,
    sender: Sender<Command>,
    /// Peers heard from on each local port
    links: BTreeMap<u16, (Location, Instant)>,
    probed: Option<Instant>,
}

impl OfController {
    fn notify(&self, event: Event) -> io::Result<()> {
        self.events
            .send(event)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "the runtime has stopped"))
    }

    fn topology(&self, event: TopologyEvent) -> io::Result<()> {
        self.notify(Event::Topology(event))
    }

    fn handle_ofp_message(&mut self, header: &OfpHeader, buf: Vec<u8>) -> Result<()> {
        debug!("Incoming message: {:?}", header);

        let t = header.typ();
        if t == OfpType::Hello as u8 {
            // simple version discovery
            if header.version() < OFP_VERSION {
                return Err(Error::HelloFailed);
            }
            self.hello_received = true;
            let req = OfpHeader::new(OfpType::FeaturesRequest, gen_xid());
            req.serialize(&mut self.stream)?;
            // whole frames for packet ins
            OfpSwitchConfig::new(0xffff).serialize(&mut self.stream, gen_xid())?;
        }
        else if !self.hello_received || header.version() != OFP_VERSION {
            return Err(Error::BadRequest(OfpBadRequestCode::BadVersion, buf));
        }
        else if t == OfpType::EchoRequest as u8 {
            // The EchoReply takes the same body byte stream as the EchoRequest
            let req = OfpEchoRequest::deserialize(buf)?;
            let rep = OfpEchoReply::new(req.arbitrary());
            rep.serialize(&mut self.stream, header.xid())?;
        }
        else if t == OfpType::EchoReply as u8 || t == OfpType::BarrierReply as u8 {
            trace!("Switch acknowledged xid {}", header.xid());
        }
        else if t == OfpType::FeaturesReply as u8 {
            let features = OfpSwitchFeatures::deserialize(buf)?;
            self.on_features(&features)?;
        }
        else if t == OfpType::PortStatus as u8 {
            let status = OfpPortStatus::deserialize(buf)?;
            self.on_port_status(&status)?;
        }
        else if t == OfpType::PacketIn as u8 {
            let packet_in = OfpPacketIn::deserialize(buf)?;
            self.on_packet_in(packet_in)?;
        }
        else if t == OfpType::Error as u8 {
            let error = OfpErrorMsg::deserialize(buf)?;
            if error.check_table_full() {
                error!("The flow table of switch {:?} is full. {}", self.switch(), error);
            }
            else if error.check_bad_port() {
                warn!("Switch {:?} does not have a port it was told to use. {}", self.switch(), error);
            }
            else {
                error!("Unexpected {}", error);
                debug!("Full error message: {:?}", error);
            }
        }
        else {
            debug!(
                "Cannot interpret message of type {}. Full message body: {:?}",
                header.typ(),
                buf
            );
            return Err(Error::BadRequest(OfpBadRequestCode::BadType, buf));
        }
        Ok(())
    }

    fn switch(&self) -> Option<SwitchId> {
        self.datapath.map(|(switch, _)| switch)
    }

    fn on_features(&mut self, features: &OfpSwitchFeatures) -> io::Result<()> {
        let switch = features.datapath_id();
        info!("The switch at {} identified itself with datapath id {}", self.peer, switch);
        if self.switch().is_some() {
            debug!("Ignoring repeated features reply of switch {}", switch);
            return Ok(());
        }
        self.ports = features
            .ports()
            .iter()
            .filter(|p| p.is_live())
            .map(OfpPhyPort::port_no)
            .collect();
        let id = self.backend.register(switch, self.sender.clone());
        self.datapath = Some((switch, id));

        self.install(&[probe_flow()])?;
        let ports = self.ports.iter().map(|p| PortNo::from(*p)).collect();
        self.topology(TopologyEvent::SwitchJoin(switch, ports))?;
        self.notify(Event::Capabilities(switch, ActionSupport::from_bits(features.actions())))
    }

    fn on_port_status(&mut self, status: &OfpPortStatus) -> io::Result<()> {
        let switch = match self.switch() {
            Some(s) => s,
            None => return Ok(()),
        };
        let desc = status.desc();
        let port = desc.port_no();
        if port >= OFPP_MAX {
            return Ok(());
        }
        let location = Location::new(switch, PortNo::from(port));
        if status.reason() != OfpPortReason::Delete as u8 && desc.is_live() {
            self.ports.insert(port);
            self.topology(TopologyEvent::PortUp(location))
        }
        else {
            self.ports.remove(&port);
            self.links.remove(&port);
            self.topology(TopologyEvent::PortDown(location))
        }
    }

    fn on_packet_in(&mut self, packet_in: OfpPacketIn) -> io::Result<()> {
        let switch = match self.switch() {
            Some(s) => s,
            None => {
                debug!("Dropping packet in before the features reply");
                return Ok(());
            }
        };
        let in_port = packet_in.in_port();
        let data = packet_in.data();
        if let Some(from) = parse_probe(&data) {
            let here = Location::new(switch, PortNo::from(in_port));
            trace!("Probe from {:?} arrived at {:?}", from, here);
            self.links.insert(in_port, (from, Instant::now()));
            return self.topology(TopologyEvent::LinkUp(from, here));
        }
        match self.events.try_send(Event::PacketIn(switch, PortNo::from(in_port), data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Runtime is busy, dropping a packet from switch {}", switch);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "the runtime has stopped"))
            }
        }
    }

    /// Writes flow mods followed by a barrier
    fn install(&mut self, mods: &[FlowMod]) -> io::Result<()> {
        for flow_mod in mods {
            trace!("Outgoing flow mod: {:?}", flow_mod);
            OfpFlowMod::from(flow_mod).serialize(&mut self.stream, gen_xid())?;
            if is_clear(flow_mod) {
                OfpFlowMod::from(&probe_flow()).serialize(&mut self.stream, gen_xid())?;
            }
        }
        OfpHeader::new(OfpType::BarrierRequest, gen_xid()).serialize(&mut self.stream)?;
        self.stream.flush()
    }

    /// Executes what the runtime asked for since the last round
    fn handle_commands(&mut self) -> io::Result<()> {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Install(mods, reply)) => {
                    let res = self.install(&mods);
                    let answer = match res {
                        Ok(()) => Ok(()),
                        Err(ref e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    if reply.send(answer).is_err() {
                        debug!("Nobody waits for the install on switch {:?} anymore", self.switch());
                    }
                    res?;
                }
                Ok(Command::PacketOut { in_port, port, data }) => {
                    OfpPacketOut::new(in_port, port, data).serialize(&mut self.stream, gen_xid())?;
                }
                Err(TryRecvError::Empty) => return Ok(()),
                // the sender lives in self
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Sends probes out of every port and expires links that went silent
    fn handle_probes(&mut self) -> io::Result<()> {
        let switch = match self.switch() {
            Some(s) => s,
            None => return Ok(()),
        };
        let period = Duration::from_secs(PROBE_SECS);
        if self.probed.map_or(false, |at| at.elapsed() < period) {
            return Ok(());
        }
        self.probed = Some(Instant::now());

        let ports: Vec<u16> = self.ports.iter().cloned().collect();
        for port in ports {
            OfpPacketOut::new(OFPP_NONE, port, probe_frame(switch, port)).serialize(&mut self.stream, gen_xid())?;
        }

        let silent: Vec<u16> = self
            .links
            .iter()
            .filter(|&(_, &(_, seen))| seen.elapsed() > period * PROBE_ROUNDS)
            .map(|(port, _)| *port)
            .collect();
        for port in silent {
            if let Some((from, _)) = self.links.remove(&port) {
                info!("Link from {:?} to switch {} port {} went silent", from, switch, port);
                self.topology(TopologyEvent::LinkDown(from, Location::new(switch, PortNo::from(port))))?;
            }
        }
        Ok(())
    }

    /// Reads what arrived within the poll interval
    fn receive(&mut self) -> io::Result<()> {
        let mut buf = [0; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            )),
            Ok(n) => {
                self.inbox.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Splits the next complete message off the inbox
    fn next_message(&mut self) -> Option<([u8; 8], Vec<u8>)> {
        if self.inbox.len() < OfpHeader::header_length() {
            return None;
        }
        let mut hbuf = [0; 8];
        hbuf.copy_from_slice(&self.inbox[..8]);
        let header = OfpHeader::deserialize(&hbuf);
        let end = OfpHeader::header_length() + header.body_length();
        if self.inbox.len() < end {
            return None;
        }
        let body = self.inbox[8..end].to_vec();
        self.inbox.drain(..end);
        Some((hbuf, body))
    }

    fn handle_of_errors(&mut self, error: Error, header: &OfpHeader, header_buf: &[u8]) -> io::Result<()> {
        let err_msg = match error {
            Error::Io(e) => return Err(e),
            Error::HelloFailed => {
                let msg = format!(
                    "The connected switch supports only OpenFlow protocol version {:x}",
                    header.version()
                );
                let err = OfpErrorMsg::new_hello_failed();
                err.serialize(&mut self.stream, header.xid())?;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, msg));
            }
            Error::BadRequest(code, buf) => OfpErrorMsg::new_bad_request(code, header_buf, &buf),
        };
        debug!("Outgoing error message: {:?}", err_msg);
        err_msg.serialize(&mut self.stream, header.xid())
    }

    fn run(&mut self) -> io::Result<()> {
        // Send a Hello
        // Rely on the simple version: If one Hello is empty,
        // the smaller OfpHeader::version is agreed upon
        let hello = OfpHeader::new(OfpType::Hello, gen_xid());
        hello.serialize(&mut self.stream)?;

        loop {
            self.handle_commands()?;
            self.receive()?;
            while let Some((hbuf, body)) = self.next_message() {
                let header = OfpHeader::deserialize(&hbuf);
                if let Err(e) = self.handle_ofp_message(&header, body) {
                    self.handle_of_errors(e, &header, &hbuf)?;
                }
            }
            self.handle_probes()?;
        }
    }

    /// Ends the connection and tells the runtime the switch is gone
    fn part(&mut self) {
        if let Some((switch, id)) = self.datapath.take() {
            if self.backend.deregister(switch, id) {
                info!("Switch {} disconnected", switch);
                if self.topology(TopologyEvent::SwitchPart(switch)).is_err() {
                    debug!("No runtime to tell that switch {} left", switch);
                }
            }
        }
    }

    /// Accepts one TCP connection and hands it to a new thread
    /// that serves the switch until the connection breaks.
    pub fn accept(
        backend: &Arc<OfBackend>,
        listener: &TcpListener,
        connection: &OfConnection,
        events: &SyncSender<Event>,
    ) -> io::Result<()> {
        let (tcp, peer) = listener.accept()?;
        info!("connection from {}", peer);
        let socket = tcp.try_clone()?;
        let backend = Arc::clone(backend);
        let connection = connection.clone();
        let events = events.clone();

        thread::Builder::new().name(format!("switch {}", peer)).spawn(move || {
            let stream = match Stream::from(&connection, tcp) {
                Ok(s) => s,
                Err(e) => {
                    error!("Cannot set up the connection from {}: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(POLL_MILLIS))) {
                error!("Cannot poll the connection from {}: {}", peer, e);
                return;
            }
            let (sender, commands) = channel();
            let mut ctrl = OfController {
                backend: backend,
                events: events,
                stream: stream,
                peer: peer,
                inbox: vec![],
                hello_received: false,
                datapath: None,
                ports: BTreeSet::new(),
                commands: commands,
                sender: sender,
                links: BTreeMap::new(),
                probed: None,
            };
            if let Err(e) = ctrl.run() {
                info!("Connection from {} ended: {}", peer, e);
            }
            ctrl.part();
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyEvent::*;
    use std::sync::mpsc::Receiver;

    const DPID: SwitchId = 0x0000_0a0b_0c0d_0e0f;
    const WAIT: Duration = Duration::from_secs(5);

    fn read_message(stream: &mut TcpStream) -> (OfpHeader, Vec<u8>) {
        let mut hbuf = [0; 8];
        stream.read_exact(&mut hbuf).unwrap();
        let header = OfpHeader::deserialize(&hbuf);
        let mut body = vec![0; header.body_length()];
        stream.read_exact(&mut body).unwrap();
        (header, body)
    }

    /// Reads up to the next message of type `typ`
    fn read_until(stream: &mut TcpStream, typ: OfpType) -> (OfpHeader, Vec<u8>) {
        let typ = typ as u8;
        loop {
            let (header, body) = read_message(stream);
            if header.typ() == typ {
                return (header, body);
            }
        }
    }

    fn send(stream: &mut TcpStream, typ: OfpType, body: &[u8]) {
        let mut msg = vec![OFP_VERSION, typ as u8, 0, 0, 0, 0, 0, 1];
        NetworkEndian::write_u16(&mut msg[2..4], (8 + body.len()) as u16);
        msg.extend_from_slice(body);
        stream.write_all(&msg).unwrap();
    }

    fn features(ports: &[u16]) -> Vec<u8> {
        let mut body = vec![0; 24];
        NetworkEndian::write_u64(&mut body[0..8], DPID);
        NetworkEndian::write_u32(&mut body[20..24], 0x1);
        for port in ports {
            let mut phy = vec![0; 48];
            NetworkEndian::write_u16(&mut phy[0..2], *port);
            body.extend(phy);
        }
        body
    }

    fn packet_in(in_port: u16, frame: &[u8]) -> Vec<u8> {
        let mut body = vec![0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0];
        NetworkEndian::write_u16(&mut body[4..6], frame.len() as u16);
        NetworkEndian::write_u16(&mut body[6..8], in_port);
        body.extend_from_slice(frame);
        body
    }

    fn next_event(events: &Receiver<Event>) -> Event {
        events.recv_timeout(WAIT).unwrap()
    }

    /// A switch that finished the handshake
    fn connect(backend: &Arc<OfBackend>, events: SyncSender<Event>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut switch = TcpStream::connect(addr).unwrap();
        OfController::accept(backend, &listener, &OfConnection::default(), &events).unwrap();
        switch.set_read_timeout(Some(WAIT)).unwrap();

        let (hello, _) = read_message(&mut switch);
        assert_eq!(OfpType::Hello as u8, hello.typ());
        send(&mut switch, OfpType::Hello, &[]);
        read_until(&mut switch, OfpType::FeaturesRequest);
        send(&mut switch, OfpType::FeaturesReply, &features(&[1, 2]));
        switch
    }

    #[test]
    fn probes_round_trip() {
        let frame = probe_frame(DPID, 7);
        assert_eq!(PROBE_LENGTH, frame.len());
        assert_eq!(Some(Location::new(DPID, 7)), parse_probe(&frame));
        assert_eq!(None, parse_probe(&frame[..20]));
        let mut other = frame.clone();
        other[13] = 0;
        assert_eq!(None, parse_probe(&other));
    }

    #[test]
    fn unknown_switches_are_not_connected() {
        let backend = OfBackend::new();
        let err = backend.install(1, &[FlowMod::clear()]).unwrap_err();
        assert_eq!(io::ErrorKind::NotConnected, err.kind());
        let err = backend.packet_out(1, None, Port::Flood, &[]).unwrap_err();
        assert_eq!(io::ErrorKind::NotConnected, err.kind());
    }

    #[test]
    fn switch_lifecycle() {
        let backend = Arc::new(OfBackend::new());
        let (tx, events) = sync_channel(16);
        let mut switch = connect(&backend, tx);

        match next_event(&events) {
            Event::Topology(SwitchJoin(s, ports)) => {
                assert_eq!(DPID, s);
                assert_eq!(vec![1, 2], ports);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&events) {
            Event::Capabilities(s, support) => {
                assert_eq!(DPID, s);
                assert_eq!(ActionSupport::from_bits(1), support);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(vec![DPID], backend.switches());

        // the probe entry comes first, then probes out of both ports
        let (_, flow_mod) = read_until(&mut switch, OfpType::FlowMod);
        assert_eq!(vec![0x88, 0xcc], flow_mod[22..24].to_vec());
        let (_, out) = read_until(&mut switch, OfpType::PacketOut);
        assert_eq!(Some(Location::new(DPID, 1)), parse_probe(&out[16..]));

        // clearing the table keeps discovery alive
        backend.install(DPID, &[FlowMod::clear()]).unwrap();
        let (_, delete) = read_until(&mut switch, OfpType::FlowMod);
        assert_eq!(vec![0, OfpFlowModCommand::Delete as u8], delete[48..50].to_vec());
        let (_, add) = read_until(&mut switch, OfpType::FlowMod);
        assert_eq!(vec![0xff, 0xff], add[54..56].to_vec());
        read_until(&mut switch, OfpType::BarrierRequest);

        let frame = vec![0xff; 6].into_iter().chain(vec![0; 8]).collect::<Vec<u8>>();
        send(&mut switch, OfpType::PacketIn, &packet_in(2, &frame));
        match next_event(&events) {
            Event::PacketIn(s, port, data) => {
                assert_eq!((DPID, 2), (s, port));
                assert_eq!(frame, data);
            }
            other => panic!("unexpected {:?}", other),
        }

        send(&mut switch, OfpType::PacketIn, &packet_in(1, &probe_frame(9, 4)));
        match next_event(&events) {
            Event::Topology(LinkUp(from, to)) => {
                assert_eq!(Location::new(9, 4), from);
                assert_eq!(Location::new(DPID, 1), to);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut status = vec![OfpPortReason::Delete as u8, 0, 0, 0, 0, 0, 0, 0];
        let mut phy = vec![0; 48];
        phy[1] = 2;
        status.extend(phy);
        send(&mut switch, OfpType::PortStatus, &status);
        match next_event(&events) {
            Event::Topology(PortDown(loc)) => assert_eq!(Location::new(DPID, 2), loc),
            other => panic!("unexpected {:?}", other),
        }

        backend.packet_out(DPID, Some(1), Port::Physical(1), &[1, 2, 3]).unwrap();
        let (_, out) = read_until(&mut switch, OfpType::PacketOut);
        // sent back out of the input port
        assert_eq!(vec![0, 1], out[4..6].to_vec());
        assert_eq!(vec![0xff, 0xf8], out[12..14].to_vec());
        assert_eq!(vec![1, 2, 3], out[16..].to_vec());

        drop(switch);
        match next_event(&events) {
            Event::Topology(SwitchPart(s)) => assert_eq!(DPID, s),
            other => panic!("unexpected {:?}", other),
        }
        assert!(backend.switches().is_empty());
    }

    #[test]
    fn echo_requests_are_answered() {
        let backend = Arc::new(OfBackend::new());
        let (tx, _events) = sync_channel(16);
        let mut switch = connect(&backend, tx);
        send(&mut switch, OfpType::EchoRequest, &[4, 2]);
        let (header, body) = read_until(&mut switch, OfpType::EchoReply);
        assert_eq!(1, header.xid());
        assert_eq!(vec![4, 2], body);
    }

    #[test]
    fn messages_before_hello_are_rejected() {
        let backend = Arc::new(OfBackend::new());
        let (tx, _events) = sync_channel(16);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut switch = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        OfController::accept(&backend, &listener, &OfConnection::default(), &tx).unwrap();
        switch.set_read_timeout(Some(WAIT)).unwrap();

        read_message(&mut switch);
        send(&mut switch, OfpType::EchoRequest, &[]);
        let (_, body) = read_until(&mut switch, OfpType::Error);
        assert_eq!(vec![0, 1, 0, 0], body[0..4].to_vec());
    }
}
