/*!
Compiles policies into classifiers by structural recursion.

Compilation is pure CPU work. A `CancelToken` lets the runtime abandon a
compile that was superseded; it is checked between sub-policy compilations.
*/

use crate::classifier::{Action, Classifier, Rule};
use crate::pattern::{Matcher, Pattern};
use crate::policy::Policy;

use std::error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, PartialEq)]
pub enum CompileError {
    Cancelled,
    /// A negated sub-policy modifies packets
    NotAFilter(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CompileError::Cancelled => write!(f, "The compilation was cancelled"),
            CompileError::NotAFilter(ref p) => {
                write!(f, "Only filters can be negated, but got {}", p)
            }
        }
    }
}

impl error::Error for CompileError {
    fn description(&self) -> &str {
        "Policy compilation error"
    }
}

/// Shared flag to abandon an in-flight compilation
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CompileError> {
        if self.is_cancelled() {
            Err(CompileError::Cancelled)
        }
        else {
            Ok(())
        }
    }
}

/// Compiles a policy to an equivalent classifier
pub fn compile(policy: &Policy) -> Result<Classifier, CompileError> {
    compile_with(policy, &CancelToken::new())
}

/// Like `compile`, giving up with `CompileError::Cancelled` once `token` is cancelled
pub fn compile_with(policy: &Policy, token: &CancelToken) -> Result<Classifier, CompileError> {
    token.check()?;
    match *policy {
        Policy::Filter(ref p) => Ok(compile_filter(p)),
        Policy::Mod(ref a) => Ok(Classifier::single(vec![a.clone()])),
        Policy::Recurse => Ok(Classifier::single(vec![Action::Recurse])),
        Policy::Par(ref ps) => {
            let mut acc = Classifier::drop_all();
            for p in ps {
                let c = compile_with(p, token)?;
                token.check()?;
                acc = acc.union(&c);
            }
            Ok(acc)
        }
        Policy::Seq(ref ps) => {
            let mut acc = Classifier::single(vec![]);
            for p in ps {
                let c = compile_with(p, token)?;
                token.check()?;
                acc = acc.sequence(&c);
            }
            Ok(acc)
        }
        Policy::Neg(ref f) => compile_with(f, token)?
            .negate()
            .ok_or_else(|| CompileError::NotAFilter(f.to_string())),
        Policy::IfThenElse(ref pred, ref t, ref e) => {
            let pred_c = compile_with(pred, token)?;
            let neg_c = pred_c
                .negate()
                .ok_or_else(|| CompileError::NotAFilter(pred.to_string()))?;
            let then_c = pred_c.sequence(&compile_with(t, token)?);
            token.check()?;
            let else_c = neg_c.sequence(&compile_with(e, token)?);
            token.check()?;
            Ok(then_c.union(&else_c))
        }
        Policy::Dynamic(ref d) => compile_with(&d.current(), token),
    }
}

/// Filters with excluded values become explicit drop rules ahead of the
/// positive pattern, so no rule of a compiled classifier carries exclusions.
fn compile_filter(pattern: &Pattern) -> Classifier {
    if pattern.is_none() {
        return Classifier::drop_all();
    }
    let (positive, excluded) = pattern.split_exclusions();
    let mut rules: Vec<Rule> = excluded
        .into_iter()
        .map(|(slot, value)| Rule::drop(positive.clone().constrain(slot, Matcher::Exact(value))))
        .filter(|r| !r.pattern.is_none())
        .collect();
    rules.push(Rule::keep(positive));
    Classifier::new(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Action;
    use crate::header::{Field, MacAddr, Packet, Port, Value};
    use crate::pattern::Slot;
    use crate::policy::{DynamicPolicy, Evaluator};

    use ipnetwork::Ipv4Network;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use std::net::Ipv4Addr;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn at(port: u32) -> Packet {
        Packet::from_fields(vec![(Field::Switch, Value::Int(1)), (Field::Inport, Value::Port(Port::Physical(port)))])
    }

    fn sorted(mut pkts: Vec<Packet>) -> Vec<Packet> {
        pkts.sort();
        pkts
    }

    #[test]
    fn hub() {
        let c = compile(&Policy::flood()).unwrap();
        assert_eq!(1, c.len());
        assert!(c.rules()[0].pattern.is_any());
        assert_eq!(vec![vec![Action::Forward(Port::Flood)]], c.rules()[0].actions);
    }

    #[test]
    fn filter_classifier() {
        let c = compile(&Policy::matches(Field::Inport, Port::Physical(1))).unwrap();
        assert_eq!(2, c.len());
        assert_eq!(vec![Vec::<Action>::new()], c.rules()[0].actions);
        assert!(c.rules()[1].is_drop());
        assert!(compile(&Policy::drop()).unwrap().rules()[0].is_drop());
    }

    #[test]
    fn parallel_disambiguation() {
        let p1 = Policy::matches(Field::SrcIp, ip(1)) >> Policy::fwd(2);
        let p2 = Policy::matches(Field::DstIp, ip(2)) >> Policy::fwd(3);
        let c = compile(&(p1 | p2)).unwrap();

        let outports = |pkt: &Packet| {
            let mut ports: Vec<Value> = c
                .apply(pkt)
                .iter()
                .filter_map(|p| p.get(&Field::Outport).cloned())
                .collect();
            ports.sort();
            ports
        };
        let both = at(1)
            .modify(Field::SrcIp, ip(1).into())
            .modify(Field::DstIp, ip(2).into());
        let src_only = at(1).modify(Field::SrcIp, ip(1).into()).modify(Field::DstIp, ip(9).into());
        let dst_only = at(1).modify(Field::DstIp, ip(2).into());
        let neither = at(1).modify(Field::SrcIp, ip(7).into());

        let p = |n| Value::Port(Port::Physical(n));
        assert_eq!(vec![p(2), p(3)], outports(&both));
        assert_eq!(vec![p(2)], outports(&src_only));
        assert_eq!(vec![p(3)], outports(&dst_only));
        assert!(outports(&neither).is_empty());
    }

    #[test]
    fn negated_values_become_drop_rules() {
        let c = compile(&Policy::xfwd(1)).unwrap();
        assert!(c.rules().iter().all(|r| !r.pattern.has_exclusions()));
        assert!(c.apply(&at(1)).is_empty());
        assert_eq!(1, c.apply(&at(2)).len());
        // a packet without inport is not excluded
        assert_eq!(1, c.apply(&Packet::new()).len());
    }

    #[test]
    fn negating_a_modification_fails() {
        let p = Policy::Neg(Box::new(Policy::fwd(1)));
        match compile(&p) {
            Err(CompileError::NotAFilter(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cancelled_compile() {
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(Err(CompileError::Cancelled), compile_with(&Policy::flood(), &token));
    }

    #[test]
    fn dynamic_compiles_current_value() {
        let d = DynamicPolicy::new(Policy::fwd(1));
        let root = Policy::Dynamic(d.clone());
        d.set(Policy::fwd(4));
        let out = compile(&root).unwrap().apply(&at(1));
        assert_eq!(Some(&Value::Port(Port::Physical(4))), out[0].get(&Field::Outport));
    }

    #[test]
    fn unsupported_action_keeps_semantics() {
        let p = Policy::push(Field::VTag, 7u64) >> Policy::fwd(2);
        let c = compile(&p).unwrap();
        let out = c.apply(&at(1));
        assert_eq!(1, out.len());
        assert_eq!(Some(&Value::Int(7)), out[0].get(&Field::VTag));
        assert_eq!(Some(&Value::Port(Port::Physical(2))), out[0].get(&Field::Outport));
    }

    /// Random policies over a small header space, so that matches and
    /// modifications collide often.
    struct Gen {
        rng: StdRng,
    }

    impl Gen {
        fn value(&mut self, field: &Field) -> Value {
            let n = self.rng.gen_range(1, 4);
            match *field {
                Field::Inport | Field::Outport => Value::Port(Port::Physical(n)),
                Field::DstMac => Value::Mac(MacAddr::from_u64(u64::from(n))),
                Field::SrcIp | Field::DstIp => Value::Ip(ip(n as u8)),
                _ => Value::Int(u64::from(n)),
            }
        }

        fn field(&mut self) -> Field {
            let fields = [
                Field::Inport,
                Field::Outport,
                Field::DstMac,
                Field::SrcIp,
                Field::VTag,
                Field::VSwitch,
            ];
            fields[self.rng.gen_range(0, fields.len())].clone()
        }

        fn pattern(&mut self) -> Pattern {
            let mut p = Pattern::any();
            for _ in 0..self.rng.gen_range(0, 3) {
                let field = self.field();
                p = match self.rng.gen_range(0, 6) {
                    0 => p.without(field.clone(), self.value(&field)),
                    1 if field == Field::SrcIp => {
                        let len = self.rng.gen_range(29, 32);
                        p.with_prefix(field, Ipv4Network::new(ip(0), len).unwrap())
                    }
                    2 if field.is_virtual() => p.constrain(
                        Slot { field: field.clone(), depth: 1 },
                        Matcher::Exact(self.value(&field)),
                    ),
                    _ => p.with(field.clone(), self.value(&field)),
                };
            }
            p
        }

        fn action(&mut self) -> Action {
            let field = self.field();
            match self.rng.gen_range(0, 5) {
                0 => Action::Forward(Port::Physical(self.rng.gen_range(1, 4))),
                1 if field.is_virtual() => Action::Push(field.clone(), self.value(&field)),
                2 if field.is_virtual() => Action::Pop(field),
                3 => {
                    let src = self.field();
                    if src.is_virtual() == field.is_virtual() {
                        Action::Copy { dst: field, src }
                    }
                    else {
                        Action::Modify(field.clone(), self.value(&field))
                    }
                }
                _ => Action::Modify(field.clone(), self.value(&field)),
            }
        }

        fn filter(&mut self, depth: usize) -> Policy {
            if depth == 0 {
                return Policy::filter(self.pattern());
            }
            match self.rng.gen_range(0, 4) {
                0 => Policy::negate(self.filter(depth - 1)),
                1 => Policy::par(vec![self.filter(depth - 1), self.filter(depth - 1)]),
                2 => Policy::seq(vec![self.filter(depth - 1), self.filter(depth - 1)]),
                _ => Policy::filter(self.pattern()),
            }
        }

        fn policy(&mut self, depth: usize) -> Policy {
            if depth == 0 {
                return match self.rng.gen_range(0, 3) {
                    0 => self.filter(1),
                    _ => Policy::Mod(self.action()),
                };
            }
            match self.rng.gen_range(0, 6) {
                0 => Policy::par(vec![self.policy(depth - 1), self.policy(depth - 1)]),
                1 | 2 => Policy::seq(vec![self.policy(depth - 1), self.policy(depth - 1)]),
                3 => Policy::if_(self.filter(1), self.policy(depth - 1), self.policy(depth - 1)),
                4 => Policy::negate(self.filter(depth)),
                _ => self.policy(depth - 1),
            }
        }

        fn packet(&mut self) -> Packet {
            let mut pkt = Packet::new();
            for _ in 0..self.rng.gen_range(0, 6) {
                let field = self.field();
                let value = self.value(&field);
                pkt = if field.is_virtual() && self.rng.gen() {
                    pkt.push(field, value)
                }
                else {
                    pkt.modify(field, value)
                };
            }
            pkt
        }
    }

    #[test]
    fn compiled_classifier_agrees_with_evaluator() {
        let mut gen = Gen {
            rng: StdRng::seed_from_u64(0x5eed),
        };
        let mut checked = 0;
        for _ in 0..1000 {
            let policy = gen.policy(3);
            let classifier = compile(&policy).unwrap();
            for _ in 0..10 {
                let pkt = gen.packet();
                let expected = sorted(Evaluator::new(&policy).eval(&pkt));
                let actual = sorted(classifier.apply(&pkt));
                assert_eq!(
                    expected, actual,
                    "policy {} on packet {{{}}}\n{}",
                    policy, pkt, classifier
                );
                assert_eq!(actual, sorted(classifier.apply(&pkt)));
                checked += 1;
            }
        }
        assert_eq!(10_000, checked);
    }

    #[test]
    fn algebraic_laws_hold_on_classifiers() {
        let mut gen = Gen {
            rng: StdRng::seed_from_u64(7),
        };
        for _ in 0..200 {
            let p = gen.policy(2);
            let q = gen.policy(2);
            let r = gen.policy(2);
            let laws = vec![
                (
                    Policy::Seq(vec![p.clone(), Policy::Seq(vec![q.clone(), r.clone()])]),
                    Policy::Seq(vec![Policy::Seq(vec![p.clone(), q.clone()]), r.clone()]),
                ),
                (
                    Policy::Par(vec![p.clone(), Policy::Par(vec![q.clone(), r.clone()])]),
                    Policy::Par(vec![Policy::Par(vec![p.clone(), q.clone()]), r.clone()]),
                ),
                (
                    Policy::Seq(vec![Policy::Par(vec![p.clone(), q.clone()]), r.clone()]),
                    Policy::Par(vec![
                        Policy::Seq(vec![p.clone(), r.clone()]),
                        Policy::Seq(vec![q.clone(), r.clone()]),
                    ]),
                ),
                (Policy::Seq(vec![Policy::identity(), p.clone()]), p.clone()),
                (Policy::Par(vec![Policy::drop(), p.clone()]), p.clone()),
                (Policy::Seq(vec![Policy::drop(), p.clone()]), Policy::drop()),
            ];
            let lhs_rhs: Vec<_> = laws
                .iter()
                .map(|(l, r)| (compile(l).unwrap(), compile(r).unwrap()))
                .collect();
            for _ in 0..5 {
                let pkt = gen.packet();
                for (l, r) in &lhs_rhs {
                    assert_eq!(sorted(l.apply(&pkt)), sorted(r.apply(&pkt)));
                }
            }
        }
    }
}
