/*!
Ready-made policies the controller binary can run.

`hub` floods everything. `MacLearner` forwards on learned
(switch, MAC) locations and floods otherwise, learning from the packets
its policy sends to the controller. `VirtualHub` runs the hub on one
virtual switch spanning all edge ports of the physical network.
*/

use crate::header::{Field, MacAddr, Packet, Port, PortNo, SwitchId, Value};
use crate::pattern::Pattern;
use crate::policy::{DynamicPolicy, Policy};
use crate::topology::Topology;
use crate::virt::{virtualize, VirtualDef};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Virtual switch id of the virtual hub
pub const VHUB_SWITCH: SwitchId = 1;
/// Tag marking packets inside the virtual hub
pub const VHUB_TAG: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum App {
    Hub,
    Learner,
    VirtualHub,
}

impl FromStr for App {
    type Err = String;

    fn from_str(s: &str) -> Result<App, Self::Err> {
        match s {
            "hub" => Ok(App::Hub),
            "learner" => Ok(App::Learner),
            "vhub" => Ok(App::VirtualHub),
            _ => Err(format!("unknown application {}", s)),
        }
    }
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            App::Hub => "hub",
            App::Learner => "learner",
            App::VirtualHub => "vhub",
        };
        write!(f, "{}", name)
    }
}

pub fn hub() -> Policy {
    Policy::flood()
}

type Locations = BTreeMap<(SwitchId, MacAddr), PortNo>;

#[derive(Clone)]
pub struct MacLearner {
    root: DynamicPolicy,
    learned: Arc<Mutex<Locations>>,
}

impl Default for MacLearner {
    fn default() -> Self {
        MacLearner::new()
    }
}

impl MacLearner {
    pub fn new() -> MacLearner {
        let learned = Locations::new();
        MacLearner {
            root: DynamicPolicy::new(MacLearner::build(&learned)),
            learned: Arc::new(Mutex::new(learned)),
        }
    }

    pub fn policy(&self) -> Policy {
        Policy::Dynamic(self.root.clone())
    }

    /// The port `mac` was last seen on at `switch`
    pub fn location(&self, switch: SwitchId, mac: MacAddr) -> Option<PortNo> {
        match self.learned.lock() {
            Ok(learned) => learned.get(&(switch, mac)).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&(switch, mac)).cloned(),
        }
    }

    /// Learns the source location of a packet. Returns whether the policy changed.
    pub fn learn(&self, pkt: &Packet) -> bool {
        let switch = pkt.get(&Field::Switch).and_then(Value::as_int);
        let mac = pkt.get(&Field::SrcMac).and_then(Value::as_mac);
        let port = match pkt.get(&Field::Inport).and_then(Value::as_port) {
            Some(Port::Physical(n)) => Some(n),
            _ => None,
        };
        let (switch, mac, port) = match (switch, mac, port) {
            (Some(s), Some(m), Some(p)) => (s, m, p),
            _ => {
                trace!("Not learning from {}", pkt);
                return false;
            }
        };
        // group addresses never send
        if mac.0[0] & 1 != 0 {
            return false;
        }

        let mut learned = match self.learned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if learned.insert((switch, mac), port) == Some(port) {
            return false;
        }
        info!("Learned {} on switch {} port {}", mac, switch, port);
        self.root.set(MacLearner::build(&learned));
        true
    }

    /// A packet handler learning from controller-bound packets
    pub fn handler(&self) -> impl FnMut(&Packet) + Send + 'static {
        let learner = self.clone();
        move |pkt| {
            learner.learn(pkt);
        }
    }

    /// A topology hook: learned ports may be stale after any change
    pub fn topology_hook(&self) -> impl FnMut(&Topology) + Send + 'static {
        let learner = self.clone();
        move |_| learner.reset()
    }

    /// Forgets every learned location, going back to flooding
    pub fn reset(&self) {
        let mut learned = match self.learned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !learned.is_empty() {
            info!("Forgetting {} learned locations", learned.len());
        }
        learned.clear();
        self.root.set(MacLearner::build(&learned));
    }

    fn build(learned: &Locations) -> Policy {
        let destination = |switch: SwitchId, mac: MacAddr| {
            Policy::filter(Pattern::any().with(Field::Switch, switch).with(Field::DstMac, mac))
        };
        // (switch, mac) keys are unique, so the branches are disjoint
        let known_destinations = Policy::par(learned.keys().map(|&(switch, mac)| destination(switch, mac)).collect());
        let forward = Policy::par(
            learned
                .iter()
                .map(|(&(switch, mac), &port)| destination(switch, mac) >> Policy::fwd(port))
                .collect(),
        ) | (Policy::negate(known_destinations) >> Policy::flood());
        let known = Policy::par(
            learned
                .iter()
                .map(|(&(switch, mac), &port)| {
                    Policy::filter(
                        Pattern::any()
                            .with(Field::Switch, switch)
                            .with(Field::SrcMac, mac)
                            .with(Field::Inport, Port::Physical(port)),
                    )
                })
                .collect(),
        );
        // unknown sources, and hosts that moved, are shown to the controller
        forward | (Policy::negate(known) >> Policy::controller())
    }
}

/// A hub on one virtual switch, rebuilt for every topology
#[derive(Clone)]
pub struct VirtualHub {
    root: DynamicPolicy,
}

impl Default for VirtualHub {
    fn default() -> Self {
        VirtualHub::new()
    }
}

impl VirtualHub {
    pub fn new() -> VirtualHub {
        VirtualHub {
            root: DynamicPolicy::new(Policy::drop()),
        }
    }

    pub fn policy(&self) -> Policy {
        Policy::Dynamic(self.root.clone())
    }

    pub fn update(&self, physical: &Topology) {
        let vdef = VirtualDef::one_big_switch(physical, VHUB_SWITCH, VHUB_TAG);
        debug!("Virtual hub spans {}", vdef.map());
        self.root.set(virtualize(&hub(), &vdef, physical));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::flowtable::{emit, ActionSupport, FlowAction, UnsupportedFields};
    use crate::topology::linear;

    use std::collections::BTreeSet;

    fn packet(switch: SwitchId, inport: PortNo, src: u64, dst: u64) -> Packet {
        Packet::from_fields(vec![
            (Field::Switch, Value::Int(switch)),
            (Field::Inport, Value::Port(Port::Physical(inport))),
            (Field::SrcMac, Value::Mac(MacAddr::from_u64(src))),
            (Field::DstMac, Value::Mac(MacAddr::from_u64(dst))),
        ])
    }

    fn forwarded(outputs: &[Packet]) -> Vec<Port> {
        outputs
            .iter()
            .filter_map(|p| p.get(&Field::Outport).and_then(Value::as_port))
            .filter(|p| *p != Port::Controller)
            .collect()
    }

    #[test]
    fn apps_parse() {
        assert_eq!(Ok(App::VirtualHub), "vhub".parse());
        assert_eq!("learner", App::Learner.to_string());
        assert!("router".parse::<App>().is_err());
    }

    #[test]
    fn unlearned_learner_floods_and_asks() {
        let learner = MacLearner::new();
        let outputs = learner.policy().eval(&packet(1, 1, 1, 2));
        let ports: BTreeSet<Port> = outputs
            .iter()
            .filter_map(|p| p.get(&Field::Outport).and_then(Value::as_port))
            .collect();
        assert_eq!(vec![Port::Flood, Port::Controller], ports.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn learner_steady_state() {
        let learner = MacLearner::new();
        let mac = MacAddr::from_u64(1);
        assert!(learner.learn(&packet(1, 1, 1, 2)));
        assert!(!learner.learn(&packet(1, 1, 1, 3)));
        assert_eq!(Some(1), learner.location(1, mac));

        let table = emit(
            &compile(&learner.policy()).unwrap(),
            1,
            ActionSupport::all(),
            UnsupportedFields::ControllerFallback,
        );
        assert!(table
            .entries()
            .iter()
            .any(|e| e.matching.dl_dst == Some(mac) && e.actions.contains(&FlowAction::Output(Port::Physical(1)))));

        let outputs = learner.policy().eval(&packet(1, 2, 2, 1));
        assert_eq!(vec![Port::Physical(1)], forwarded(&outputs));
        // the source is unknown, the controller gets a copy
        assert_eq!(2, outputs.len());

        assert!(learner.learn(&packet(1, 2, 2, 1)));
        let outputs = learner.policy().eval(&packet(1, 2, 2, 1));
        assert_eq!(1, outputs.len());
        assert_eq!(vec![Port::Physical(1)], forwarded(&outputs));

        // other switches have not seen the host
        assert_eq!(vec![Port::Flood], forwarded(&learner.policy().eval(&packet(2, 2, 2, 1))));
    }

    #[test]
    fn hosts_that_move_are_relearned() {
        let learner = MacLearner::new();
        learner.learn(&packet(1, 1, 1, 2));
        let moved = packet(1, 3, 1, 2);
        assert!(learner
            .policy()
            .eval(&moved)
            .iter()
            .any(|p| p.get(&Field::Outport) == Some(&Value::Port(Port::Controller))));
        assert!(learner.learn(&moved));
        assert_eq!(Some(3), learner.location(1, MacAddr::from_u64(1)));
    }

    #[test]
    fn group_sources_are_ignored() {
        let learner = MacLearner::new();
        let pkt = packet(1, 1, 0, 2).modify(Field::SrcMac, Value::Mac(MacAddr::BROADCAST));
        assert!(!learner.learn(&pkt));
        assert!(!learner.learn(&Packet::new()));
    }

    #[test]
    fn reset_learner_floods_again() {
        let learner = MacLearner::new();
        learner.learn(&packet(1, 1, 1, 2));
        learner.learn(&packet(1, 2, 2, 1));
        assert_eq!(vec![Port::Physical(1)], forwarded(&learner.policy().eval(&packet(1, 2, 2, 1))));

        learner.reset();
        assert_eq!(None, learner.location(1, MacAddr::from_u64(1)));
        let outputs = learner.policy().eval(&packet(1, 2, 2, 1));
        assert_eq!(vec![Port::Flood], forwarded(&outputs));
        assert!(outputs
            .iter()
            .any(|p| p.get(&Field::Outport) == Some(&Value::Port(Port::Controller))));
        assert!(learner.learn(&packet(1, 3, 1, 2)));
        assert_eq!(Some(3), learner.location(1, MacAddr::from_u64(1)));

        let mut hook = learner.topology_hook();
        hook(&linear(2, 1));
        assert_eq!(None, learner.location(1, MacAddr::from_u64(1)));
    }

    #[test]
    fn many_learned_hosts() {
        let learner = MacLearner::new();
        for host in 1..20 {
            learner.learn(&packet(1, (host % 4) as PortNo + 1, host, 0));
        }
        let classifier = compile(&learner.policy()).unwrap();
        for host in 1..20 {
            let pkt = packet(1, (host % 4) as PortNo + 1, host, host);
            let outputs = learner.policy().eval(&pkt);
            assert_eq!(vec![Port::Physical((host % 4) as PortNo + 1)], forwarded(&outputs));
            assert_eq!(outputs, classifier.apply(&pkt));
        }
        let stranger = packet(1, 1, 1, 99);
        assert_eq!(vec![Port::Flood], forwarded(&classifier.apply(&stranger)));
    }

    #[test]
    fn handler_learns() {
        let learner = MacLearner::new();
        let mut handler = learner.handler();
        handler(&packet(4, 2, 9, 1));
        assert_eq!(Some(2), learner.location(4, MacAddr::from_u64(9)));
    }

    #[test]
    fn virtual_hub_follows_the_topology() {
        let vhub = VirtualHub::new();
        let pkt = packet(1, 1, 1, 2);
        assert!(vhub.policy().eval(&pkt).is_empty());

        vhub.update(&linear(4, 1));
        let exits: BTreeSet<(u64, Port)> = vhub
            .policy()
            .eval(&pkt)
            .iter()
            .map(|p| {
                (
                    p.get(&Field::Switch).and_then(Value::as_int).unwrap(),
                    p.get(&Field::Outport).and_then(Value::as_port).unwrap(),
                )
            })
            .collect();
        let want: BTreeSet<(u64, Port)> = (2..5).map(|s| (s, Port::Physical(1))).collect();
        assert_eq!(want, exits);
    }

    #[test]
    fn virtual_hub_reaches_the_controller_when_dropping_unsupported_actions() {
        let vhub = VirtualHub::new();
        vhub.update(&linear(4, 1));
        let classifier = compile(&vhub.policy()).unwrap();
        let table = emit(&classifier, 1, ActionSupport::all(), UnsupportedFields::Drop);
        assert!(table
            .entries()
            .iter()
            .any(|e| e.matching.in_port == Some(1) && e.actions == vec![FlowAction::Output(Port::Controller)]));
    }
}
