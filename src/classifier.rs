/*!
Classifiers: priority ordered lists of (pattern, action lists) rules.

The first rule whose pattern matches a packet fires. Each of its action
lists produces one output packet, so a rule without action lists drops.
Every classifier built here ends in a rule with the `any` pattern.
*/

use crate::header::{Field, Packet, Port, Value};
use crate::pattern::{Pattern, Slot};

use std::collections::BTreeMap;
use std::fmt;

/// A single packet rewrite
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Sets `outport`
    Forward(Port),
    Modify(Field, Value),
    Push(Field, Value),
    Pop(Field),
    Copy { dst: Field, src: Field },
    /// Hands the packet back to the top level policy. Ends an action list.
    Recurse,
}

/// An ordered sequence of actions producing one packet
pub type ActionList = Vec<Action>;

impl Action {
    pub fn apply(&self, pkt: &Packet) -> Packet {
        match *self {
            Action::Forward(port) => pkt.modify(Field::Outport, Value::Port(port)),
            Action::Modify(ref f, ref v) => pkt.modify(f.clone(), v.clone()),
            Action::Push(ref f, ref v) => pkt.push(f.clone(), v.clone()),
            Action::Pop(ref f) => pkt.pop(f),
            Action::Copy { ref dst, ref src } => pkt.copy(dst.clone(), src),
            Action::Recurse => pkt.modify(Field::Outport, Value::Port(Port::Controller)),
        }
    }

    /// The fields this action writes
    pub fn writes(&self) -> Option<&Field> {
        match *self {
            Action::Forward(_) | Action::Recurse => Some(&Field::Outport),
            Action::Modify(ref f, _) | Action::Push(ref f, _) | Action::Pop(ref f) => Some(f),
            Action::Copy { ref dst, .. } => Some(dst),
        }
    }

    /// Renames the fields the action reads and writes
    pub fn relabel(&self, map: &BTreeMap<Field, Field>) -> Action {
        let r = |f: &Field| map.get(f).cloned().unwrap_or_else(|| f.clone());
        match *self {
            Action::Forward(port) => match map.get(&Field::Outport) {
                Some(f) => Action::Modify(f.clone(), Value::Port(port)),
                None => Action::Forward(port),
            },
            Action::Modify(ref f, ref v) => Action::Modify(r(f), v.clone()),
            Action::Push(ref f, ref v) => Action::Push(r(f), v.clone()),
            Action::Pop(ref f) => Action::Pop(r(f)),
            Action::Copy { ref dst, ref src } => Action::Copy {
                dst: r(dst),
                src: r(src),
            },
            Action::Recurse => Action::Recurse,
        }
    }

    /// The pattern a packet must match before this action
    /// so that it matches `p` afterwards.
    pub fn pullback(&self, p: &Pattern) -> Pattern {
        if p.is_none() {
            return Pattern::none();
        }
        match *self {
            Action::Forward(port) => set_pullback(p, &Field::Outport, &Value::Port(port)),
            Action::Modify(ref f, ref v) => set_pullback(p, f, v),
            Action::Push(ref f, ref v) => {
                let p = set_pullback(p, f, v);
                if p.is_none() {
                    return p;
                }
                p.map_slots(|slot| {
                    if slot.field == *f {
                        Slot {
                            field: f.clone(),
                            depth: slot.depth - 1,
                        }
                    }
                    else {
                        slot.clone()
                    }
                })
            }
            Action::Pop(ref f) => p.map_slots(|slot| {
                if slot.field == *f {
                    Slot {
                        field: f.clone(),
                        depth: slot.depth + 1,
                    }
                }
                else {
                    slot.clone()
                }
            }),
            Action::Copy { ref dst, ref src } => {
                if dst == src {
                    return p.clone();
                }
                let top = Slot::top(dst.clone());
                match p.get_slot(&top).cloned() {
                    Some(m) => p.clone().unconstrain(&top).constrain(Slot::top(src.clone()), m),
                    None => p.clone(),
                }
            }
            Action::Recurse => Pattern::any(),
        }
    }
}

/// Pullback through an assignment of `v` to the top of `f`
fn set_pullback(p: &Pattern, f: &Field, v: &Value) -> Pattern {
    let top = Slot::top(f.clone());
    match p.get_slot(&top) {
        Some(m) if m.accepts(v) => p.clone().unconstrain(&top),
        Some(_) => Pattern::none(),
        None => p.clone(),
    }
}

/// Applies an action list left to right
pub fn apply_list(actions: &[Action], pkt: &Packet) -> Packet {
    actions.iter().fold(pkt.clone(), |p, a| a.apply(&p))
}

/// Pulls a pattern back through an action list
pub fn pullback_list(actions: &[Action], p: &Pattern) -> Pattern {
    actions.iter().rev().fold(p.clone(), |p, a| a.pullback(&p))
}

/// Whether the list hands its packet to the controller
pub fn recurses(actions: &[Action]) -> bool {
    actions.iter().any(|a| *a == Action::Recurse)
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Action::Forward(ref p) => write!(f, "fwd({})", p),
            Action::Modify(ref k, ref v) => write!(f, "modify({}={})", k, v),
            Action::Push(ref k, ref v) => write!(f, "push({}={})", k, v),
            Action::Pop(ref k) => write!(f, "pop({})", k),
            Action::Copy { ref dst, ref src } => write!(f, "copy({}={})", dst, src),
            Action::Recurse => write!(f, "recurse"),
        }
    }
}

/// A classifier rule. Each action list yields one packet; none drops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub pattern: Pattern,
    pub actions: Vec<ActionList>,
}

impl Rule {
    pub fn new(pattern: Pattern, actions: Vec<ActionList>) -> Rule {
        Rule { pattern, actions }
    }

    /// Passes matching packets unchanged
    pub fn keep(pattern: Pattern) -> Rule {
        Rule::new(pattern, vec![vec![]])
    }

    pub fn drop(pattern: Pattern) -> Rule {
        Rule::new(pattern, vec![])
    }

    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }

    /// A rule that only filters: every action list is empty
    pub fn is_filter(&self) -> bool {
        self.actions.iter().all(|a| a.is_empty())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lists: Vec<String> = self
            .actions
            .iter()
            .map(|l| {
                let acts: Vec<String> = l.iter().map(|a| a.to_string()).collect();
                format!("[{}]", acts.join(" >> "))
            })
            .collect();
        if lists.is_empty() {
            write!(f, "{} -> drop", self.pattern)
        }
        else {
            write!(f, "{} -> {}", self.pattern, lists.join(" | "))
        }
    }
}

/// An ordered rule list with first-match semantics
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    /// Builds a classifier from rules, appending a catch-all drop if the
    /// last rule does not match everything.
    pub fn new(mut rules: Vec<Rule>) -> Classifier {
        if rules.last().map_or(true, |r| !r.pattern.is_any()) {
            rules.push(Rule::drop(Pattern::any()));
        }
        Classifier { rules }
    }

    /// Drops every packet
    pub fn drop_all() -> Classifier {
        Classifier::new(vec![])
    }

    /// Applies the same action list to every packet
    pub fn single(actions: ActionList) -> Classifier {
        Classifier::new(vec![Rule::new(Pattern::any(), vec![actions])])
    }

    /// Sends every packet to the controller
    pub fn punt_all() -> Classifier {
        Classifier::single(vec![Action::Forward(Port::Controller)])
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_filter(&self) -> bool {
        self.rules.iter().all(Rule::is_filter)
    }

    /// The first rule matching `pkt`
    pub fn lookup(&self, pkt: &Packet) -> Option<&Rule> {
        self.rules.iter().find(|r| r.pattern.matches(pkt))
    }

    /// Runs the classifier on a packet. An action list containing `recurse`
    /// yields its packet addressed to the controller.
    pub fn apply(&self, pkt: &Packet) -> Vec<Packet> {
        match self.lookup(pkt) {
            Some(rule) => rule.actions.iter().map(|l| apply_list(l, pkt)).collect(),
            None => vec![],
        }
    }

    /// Parallel composition
    pub fn union(&self, other: &Classifier) -> Classifier {
        let mut rules = Vec::with_capacity(self.rules.len() * other.rules.len());
        for r1 in &self.rules {
            for r2 in &other.rules {
                let pattern = r1.pattern.intersect(&r2.pattern);
                if pattern.is_none() {
                    continue;
                }
                let mut actions = r1.actions.clone();
                actions.extend(r2.actions.iter().cloned());
                rules.push(Rule::new(pattern, actions));
            }
        }
        rules.extend(self.rules.iter().cloned());
        rules.extend(other.rules.iter().cloned());
        Classifier::optimized(rules)
    }

    /// `other` pulled back through a single action list, prefixed by it
    fn after(&self, prefix: &[Action]) -> Classifier {
        if let Some(pos) = prefix.iter().position(|a| *a == Action::Recurse) {
            // the rest of the pipeline runs on the controller
            return Classifier::single(prefix[..=pos].to_vec());
        }
        let rules = self
            .rules
            .iter()
            .filter_map(|r| {
                let pattern = pullback_list(prefix, &r.pattern);
                if pattern.is_none() {
                    return None;
                }
                let actions = r
                    .actions
                    .iter()
                    .map(|l| {
                        let mut list = prefix.to_vec();
                        list.extend(l.iter().cloned());
                        list
                    })
                    .collect();
                Some(Rule::new(pattern, actions))
            })
            .collect();
        Classifier::new(rules)
    }

    /// Sequential composition: `other` runs on the output of `self`
    pub fn sequence(&self, other: &Classifier) -> Classifier {
        let mut rules = vec![];
        for r1 in &self.rules {
            if r1.is_drop() {
                rules.push(r1.clone());
                continue;
            }
            let mut block: Option<Classifier> = None;
            for list in &r1.actions {
                let pulled = other.after(list);
                block = Some(match block {
                    Some(b) => b.union(&pulled),
                    None => pulled,
                });
            }
            if let Some(block) = block {
                for r in block.rules {
                    let pattern = r.pattern.intersect(&r1.pattern);
                    if !pattern.is_none() {
                        rules.push(Rule::new(pattern, r.actions));
                    }
                }
            }
        }
        Classifier::optimized(rules)
    }

    /// The complement of a filter classifier, `None` if any rule modifies packets
    pub fn negate(&self) -> Option<Classifier> {
        if !self.is_filter() {
            return None;
        }
        let rules = self
            .rules
            .iter()
            .map(|r| {
                if r.is_drop() {
                    Rule::keep(r.pattern.clone())
                }
                else {
                    Rule::drop(r.pattern.clone())
                }
            })
            .collect();
        Some(Classifier::new(rules))
    }

    /// Removes rules shadowed by an earlier rule
    fn optimized(rules: Vec<Rule>) -> Classifier {
        let mut kept: Vec<Rule> = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.pattern.is_none() {
                continue;
            }
            if kept.iter().any(|k| k.pattern.covers(&rule.pattern)) {
                continue;
            }
            kept.push(rule);
        }
        Classifier::new(kept)
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, r) in self.rules.iter().enumerate() {
            writeln!(f, "{:3}: {}", i, r)?;
        }
        Ok(())
    }
}
