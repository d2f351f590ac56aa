/*!
Network virtualization: running a tenant policy written against a virtual
topology on the physical one.

A `VirtualDef` maps virtual ports to physical ports. Packets entering at a
mapped physical port get a virtual header (`vtag`, `vswitch`, `vinport`),
the relabeled tenant policy picks a `voutport`, and the fabric carries the
packet hop by hop to the physical port behind it. Each hop after the first
re-enters the top level policy through `recurse`. Egress pops the virtual
header again.
*/

use crate::header::{Field, Port, PortNo, SwitchId, Value};
use crate::pattern::Pattern;
use crate::policy::Policy;
use crate::topology::{Location, Topology};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A mapping from virtual ports to the physical ports realizing them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualMap {
    ports: BTreeMap<Location, Location>,
}

impl VirtualMap {
    pub fn new() -> VirtualMap {
        VirtualMap::default()
    }

    pub fn insert(&mut self, virt: Location, phys: Location) {
        if let Some(old) = self.ports.insert(virt, phys) {
            debug!("Virtual port {} moved from {} to {}", virt, old, phys);
        }
    }

    pub fn physical(&self, virt: Location) -> Option<Location> {
        self.ports.get(&virt).cloned()
    }

    /// The virtual port realized by a physical port
    pub fn virtual_at(&self, phys: Location) -> Option<Location> {
        self.ports.iter().find(|&(_, p)| *p == phys).map(|(v, _)| *v)
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (Location, Location)> + 'a {
        self.ports.iter().map(|(v, p)| (*v, *p))
    }

    pub fn vswitches(&self) -> BTreeSet<SwitchId> {
        self.ports.keys().map(|v| v.switch).collect()
    }

    pub fn vports(&self, vswitch: SwitchId) -> Vec<PortNo> {
        self.ports
            .keys()
            .filter(|v| v.switch == vswitch)
            .map(|v| v.port)
            .collect()
    }

    /// Chains this map with the map of the layer below it.
    /// Virtual ports without a port below are dropped.
    pub fn compose(&self, lower: &VirtualMap) -> VirtualMap {
        let mut ports = BTreeMap::new();
        for (v, mid) in self.iter() {
            match lower.physical(mid) {
                Some(p) => {
                    ports.insert(v, p);
                }
                None => warn!("Virtual port {} maps to unknown port {}", v, mid),
            }
        }
        VirtualMap { ports }
    }
}

impl fmt::Display for VirtualMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (v, p) in self.iter() {
            writeln!(f, "v{} -> {}", v, p)?;
        }
        Ok(())
    }
}

/// A virtual network layer, identified on packets by its `vtag` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDef {
    tag: u64,
    map: VirtualMap,
}

fn tenant_fields() -> BTreeMap<Field, Field> {
    let mut map = BTreeMap::new();
    map.insert(Field::Switch, Field::VSwitch);
    map.insert(Field::Inport, Field::VInport);
    map.insert(Field::Outport, Field::VOutport);
    map
}

fn port(p: PortNo) -> Value {
    Value::Port(Port::Physical(p))
}

impl VirtualDef {
    pub fn new(tag: u64, map: VirtualMap) -> VirtualDef {
        VirtualDef { tag, map }
    }

    /// All edge ports of `physical` as ports 1 to n of the single switch `vswitch`,
    /// in location order
    pub fn one_big_switch(physical: &Topology, vswitch: SwitchId, tag: u64) -> VirtualDef {
        let mut map = VirtualMap::new();
        for (i, loc) in physical.edge_ports().into_iter().enumerate() {
            map.insert(Location::new(vswitch, i as PortNo + 1), loc);
        }
        VirtualDef::new(tag, map)
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn map(&self) -> &VirtualMap {
        &self.map
    }

    /// This layer put on top of `lower`, as a single layer on `lower`'s physical network
    pub fn nest(&self, lower: &VirtualDef) -> VirtualDef {
        VirtualDef::new(self.tag, self.map.compose(&lower.map))
    }

    fn tagged(&self) -> Policy {
        Policy::matches(Field::VTag, self.tag)
    }

    /// Tags packets entering at a mapped physical port with their virtual location
    pub fn ingress(&self) -> Policy {
        Policy::par(
            self.map
                .iter()
                .map(|(v, p)| {
                    Policy::seq(vec![
                        Policy::filter(
                            Pattern::any()
                                .with(Field::Switch, p.switch)
                                .with(Field::Inport, Port::Physical(p.port)),
                        ),
                        Policy::push(Field::VTag, self.tag),
                        Policy::push(Field::VSwitch, v.switch),
                        Policy::push(Field::VInport, Port::Physical(v.port)),
                    ])
                })
                .collect(),
        )
    }

    /// Rewrites a `voutport` of `flood` into every other port of the virtual switch
    pub fn flood_expansion(&self) -> Policy {
        let per_switch = self
            .map
            .vswitches()
            .into_iter()
            .map(|vs| {
                let copies = self
                    .map
                    .vports(vs)
                    .into_iter()
                    .map(|vp| {
                        Policy::seq(vec![
                            Policy::negate(Policy::matches(Field::VInport, Port::Physical(vp))),
                            Policy::modify(Field::VOutport, port(vp)),
                        ])
                    })
                    .collect();
                Policy::seq(vec![Policy::matches(Field::VSwitch, vs), Policy::par(copies)])
            })
            .collect();
        Policy::if_(
            Policy::matches(Field::VOutport, Port::Flood),
            Policy::par(per_switch),
            Policy::identity(),
        )
    }

    /// Moves tagged packets toward the physical port behind their `voutport`
    pub fn fabric(&self, physical: &Topology) -> Policy {
        let mut routes = vec![];
        for (v, dst) in self.map.iter() {
            let selected = Policy::filter(
                Pattern::any()
                    .with(Field::VSwitch, v.switch)
                    .with(Field::VOutport, Port::Physical(v.port)),
            );
            routes.push(Policy::seq(vec![selected, self.route_to(physical, dst)]));
        }
        routes.push(Policy::matches(Field::VOutport, Port::Controller) >> Policy::controller());
        Policy::par(routes)
    }

    fn route_to(&self, physical: &Topology, dst: Location) -> Policy {
        let mut hops = vec![];
        for s in physical.switches() {
            let here = Policy::matches(Field::Switch, s);
            if s == dst.switch {
                hops.push(here >> Policy::fwd(dst.port));
                continue;
            }
            let next = physical
                .next_hop(s, dst.switch)
                .and_then(|p| physical.peer(Location::new(s, p)).map(|peer| (p, peer)));
            match next {
                Some((out, peer)) => hops.push(Policy::seq(vec![
                    here,
                    Policy::fwd(out),
                    Policy::modify(Field::Switch, peer.switch),
                    Policy::modify(Field::Inport, Port::Physical(peer.port)),
                    Policy::Recurse,
                ])),
                None => trace!("No path from switch {} to {}", s, dst),
            }
        }
        Policy::par(hops)
    }

    /// Removes the virtual header of this layer
    pub fn egress(&self) -> Policy {
        Policy::if_(
            self.tagged(),
            Policy::seq(vec![
                Policy::pop(Field::VTag),
                Policy::pop(Field::VSwitch),
                Policy::pop(Field::VInport),
                Policy::pop(Field::VOutport),
            ]),
            Policy::identity(),
        )
    }

    /// The topology the tenant sees: the virtual switches with their ports,
    /// linked where their physical ports are linked.
    pub fn transform(&self, physical: &Topology) -> Topology {
        let mut virt = Topology::new();
        for vs in self.map.vswitches() {
            virt.add_switch(vs, self.map.vports(vs));
        }
        for (v, p) in self.map.iter() {
            let peer = physical.peer(p).and_then(|q| self.map.virtual_at(q));
            if let Some(w) = peer {
                if v < w {
                    if let Err(e) = virt.add_link(v, w) {
                        warn!("Omitting virtual link {} <-> {}: {}", v, w, e);
                    }
                }
            }
        }
        virt
    }
}

/// Runs `tenant`, written against `vdef.transform(physical)`, on `physical`.
/// Tagged packets coming back through `recurse` skip ingress and tenant.
pub fn virtualize(tenant: &Policy, vdef: &VirtualDef, physical: &Topology) -> Policy {
    let fabric = vdef.fabric(physical);
    let egress = vdef.egress();
    let fresh = Policy::seq(vec![
        vdef.ingress(),
        tenant.relabel(&tenant_fields()),
        vdef.flood_expansion(),
        fabric.clone(),
        egress.clone(),
    ]);
    Policy::if_(vdef.tagged(), Policy::seq(vec![fabric, egress]), fresh)
}

/// The topology seen through a stack of layers, outermost first
pub fn compose(layers: &[VirtualDef], physical: &Topology) -> Topology {
    layers
        .iter()
        .rev()
        .fold(physical.clone(), |topo, layer| layer.transform(&topo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MacAddr, Packet};
    use crate::policy::Evaluator;
    use crate::topology::{linear, ring};

    fn arriving(s: SwitchId, p: PortNo) -> Packet {
        Packet::from_fields(vec![
            (Field::Switch, Value::Int(s)),
            (Field::Inport, port(p)),
            (Field::SrcMac, Value::Mac(MacAddr::from_u64(1))),
            (Field::DstMac, Value::Mac(MacAddr::BROADCAST)),
        ])
    }

    fn out_locations(pkts: &[Packet]) -> Vec<Location> {
        let mut locs: Vec<Location> = pkts
            .iter()
            .map(|p| {
                let s = p.get(&Field::Switch).and_then(Value::as_int).unwrap();
                match p.get(&Field::Outport).and_then(Value::as_port) {
                    Some(Port::Physical(n)) => Location::new(s, n),
                    other => panic!("unexpected outport {:?}", other),
                }
            })
            .collect();
        locs.sort();
        locs
    }

    /// Evaluates `tenant` on the virtual switch view of `pkt` and maps the
    /// results back to physical ports
    fn eval_in_virtual(tenant: &Policy, vdef: &VirtualDef, pkt: &Packet) -> Vec<Location> {
        let s = pkt.get(&Field::Switch).and_then(Value::as_int).unwrap();
        let p = match pkt.get(&Field::Inport).and_then(Value::as_port) {
            Some(Port::Physical(p)) => p,
            _ => unreachable!(),
        };
        let v = match vdef.map().virtual_at(Location::new(s, p)) {
            Some(v) => v,
            None => return vec![],
        };
        let vpkt = pkt
            .modify(Field::Switch, Value::Int(v.switch))
            .modify(Field::Inport, port(v.port));
        let mut locs = vec![];
        for out in tenant.eval(&vpkt) {
            let vports = match out.get(&Field::Outport).and_then(Value::as_port) {
                Some(Port::Physical(n)) => vec![n],
                Some(Port::Flood) => vdef
                    .map()
                    .vports(v.switch)
                    .into_iter()
                    .filter(|n| *n != v.port)
                    .collect(),
                _ => vec![],
            };
            locs.extend(
                vports
                    .into_iter()
                    .filter_map(|n| vdef.map().physical(Location::new(v.switch, n))),
            );
        }
        locs.sort();
        locs
    }

    #[test]
    fn linear_four_as_one_switch() {
        let topo = linear(4, 1);
        let vdef = VirtualDef::one_big_switch(&topo, 1, 100);
        for i in 1..5 {
            assert_eq!(Some(Location::new(i, 1)), vdef.map().physical(Location::new(1, i as PortNo)));
        }

        let policy = virtualize(&Policy::flood(), &vdef, &topo);
        let out = policy.eval(&arriving(1, 1));
        assert_eq!(
            vec![Location::new(2, 1), Location::new(3, 1), Location::new(4, 1)],
            out_locations(&out)
        );
        for pkt in &out {
            assert_eq!(*pkt, pkt.without_virtual());
            assert_eq!(Some(&Value::Mac(MacAddr::from_u64(1))), pkt.get(&Field::SrcMac));
        }

        // packets on internal ports are not part of the virtual network
        assert!(policy.eval(&arriving(2, 2)).is_empty());
    }

    #[test]
    fn hops_are_bounded_by_the_recursion_limit() {
        let topo = linear(4, 1);
        let vdef = VirtualDef::one_big_switch(&topo, 1, 100);
        let policy = virtualize(&Policy::fwd(4), &vdef, &topo);
        assert_eq!(1, Evaluator::new(&policy).eval(&arriving(1, 1)).len());
        assert!(Evaluator::new(&policy)
            .with_recursion_limit(2)
            .eval(&arriving(1, 1))
            .is_empty());
    }

    #[test]
    fn virtualization_is_sound() {
        let topo = ring(5, 2);
        let vdef = VirtualDef::one_big_switch(&topo, 1, 7);
        let tenants = vec![
            Policy::flood(),
            Policy::fwd(3),
            Policy::matches(Field::Inport, Port::Physical(1)) >> Policy::fwd(2)
                | Policy::matches(Field::Inport, Port::Physical(2)) >> Policy::fwd(1),
            Policy::xfwd(5) | Policy::fwd(9),
            Policy::if_(
                Policy::matches(Field::Switch, 1u64),
                Policy::fwd(10),
                Policy::drop(),
            ),
        ];
        for tenant in &tenants {
            let policy = virtualize(tenant, &vdef, &topo);
            for loc in topo.edge_ports() {
                let pkt = arriving(loc.switch, loc.port);
                assert_eq!(
                    eval_in_virtual(tenant, &vdef, &pkt),
                    out_locations(&policy.eval(&pkt)),
                    "tenant {} at {}",
                    tenant,
                    loc
                );
            }
        }
    }

    #[test]
    fn one_big_switch_topology() {
        let topo = linear(4, 2);
        let vdef = VirtualDef::one_big_switch(&topo, 1, 1);
        let virt = vdef.transform(&topo);
        assert_eq!(vec![1], virt.switches().collect::<Vec<_>>());
        assert_eq!(8, virt.ports(1).unwrap().len());
        assert!(virt.links().is_empty());
    }

    #[test]
    fn virtual_links_follow_physical_links() {
        let topo = linear(2, 1);
        let mut map = VirtualMap::new();
        map.insert(Location::new(10, 1), Location::new(1, 1));
        map.insert(Location::new(10, 2), Location::new(1, 2));
        map.insert(Location::new(20, 1), Location::new(2, 2));
        let virt = VirtualDef::new(1, map).transform(&topo);
        assert_eq!(Some(Location::new(20, 1)), virt.peer(Location::new(10, 2)));
    }

    #[test]
    fn nested_layers() {
        let topo = linear(4, 1);
        let lower = VirtualDef::one_big_switch(&topo, 1, 1);
        let upper = VirtualDef::one_big_switch(&lower.transform(&topo), 5, 2);
        let nested = upper.nest(&lower);
        assert_eq!(Some(Location::new(3, 1)), nested.map().physical(Location::new(5, 3)));

        let seen = compose(&[upper.clone(), lower.clone()], &topo);
        assert_eq!(vec![5], seen.switches().collect::<Vec<_>>());
        assert_eq!(4, seen.ports(5).unwrap().len());

        let policy = virtualize(&Policy::fwd(2), &nested, &topo);
        assert_eq!(vec![Location::new(2, 1)], out_locations(&policy.eval(&arriving(4, 1))));
    }
}
