//! Transition resolution.
//!
//! Implements one macrostep as a sequence of microsteps:
//!
//! 1. select one enabled transition per active atomic state (deepest source
//!    wins, first passing candidate in document order)
//! 2. drop transitions whose exit sets conflict with an earlier selection
//! 3. exit (reverse document order), run transition actions, enter
//!    (document order)
//! 4. take eventless transitions until none is enabled, then process the
//!    next raised event, until both are exhausted
//!
//! Everything here is pure: the caller gets a new configuration, context and
//! the ordered list of actions to execute.

use crate::action::Collector;
use crate::definition::MachineDefinition;
use crate::error::CoreError;
use crate::event::Event;
use crate::guard::GuardEvaluator;
use crate::machine::Implementations;
use crate::node::{HistoryDepth, NodeId, NodeKind, TransitionDef};
use crate::state::State;
use crate::value::StateValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, error, warn};

/// Upper bound on microsteps per macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 128;

pub(crate) struct Resolver<'a> {
    def: &'a MachineDefinition,
    imps: &'a Implementations,
    max_microsteps: usize,
    config: BTreeSet<NodeId>,
    history: BTreeMap<NodeId, Vec<NodeId>>,
    collector: Collector<'a>,
    internal: VecDeque<Event>,
    microsteps: usize,
    done: bool,
    done_data: Option<Value>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        def: &'a MachineDefinition,
        imps: &'a Implementations,
        max_microsteps: usize,
        configuration: &[NodeId],
        history: BTreeMap<NodeId, Vec<NodeId>>,
        context: Value,
    ) -> Self {
        Self {
            def,
            imps,
            max_microsteps,
            config: configuration.iter().copied().collect(),
            history,
            collector: Collector::new(def, imps, context),
            internal: VecDeque::new(),
            microsteps: 0,
            done: false,
            done_data: None,
        }
    }

    /// Enters the default configuration and settles it.
    pub fn enter_initial(&mut self, event: &Event) -> Result<(), CoreError> {
        let root = self.def.root();
        let mut to_enter = BTreeSet::new();
        self.add_descendants_to_enter(root, &mut to_enter);
        self.count_microstep(event)?;
        self.enter(to_enter, event);
        self.settle(event)
    }

    /// Processes an external event. Returns false if nothing was enabled.
    pub fn external(&mut self, event: &Event) -> Result<bool, CoreError> {
        let enabled = self.select(event, false);
        if enabled.is_empty() {
            debug!(event = %event.name, "no enabled transition");
            return Ok(false);
        }
        self.microstep(&enabled, event)?;
        self.settle(event)?;
        Ok(true)
    }

    /// Builds the snapshot from the settled configuration.
    pub fn finish(self, event: Event, previous: Option<&State>) -> State {
        let configuration: Vec<NodeId> = self.config.iter().copied().collect();
        let value = self.value_of(self.def.root());
        let context = self.collector.context;
        let actions = self.collector.actions;
        let changed = match previous {
            Some(prev) => prev.value != value || prev.context != context || !actions.is_empty(),
            None => false,
        };
        State {
            value,
            context,
            actions,
            event,
            changed,
            done: self.done,
            done_data: self.done_data,
            configuration,
            history: self.history,
        }
    }

    /// Drains eventless transitions and raised events.
    fn settle(&mut self, event: &Event) -> Result<(), CoreError> {
        let mut current = event.clone();
        while !self.done {
            let eventless = self.select(&current, true);
            if !eventless.is_empty() {
                self.microstep(&eventless, &current)?;
                continue;
            }
            let Some(next) = self.internal.pop_front() else {
                break;
            };
            current = next;
            let enabled = self.select(&current, false);
            if !enabled.is_empty() {
                self.microstep(&enabled, &current)?;
            }
        }
        Ok(())
    }

    fn count_microstep(&mut self, event: &Event) -> Result<(), CoreError> {
        self.microsteps += 1;
        if self.microsteps > self.max_microsteps {
            error!(limit = self.max_microsteps, event = %event.name, "microstep limit exceeded");
            return Err(CoreError::MicrostepLimitExceeded {
                limit: self.max_microsteps,
                event: event.name.clone(),
            });
        }
        Ok(())
    }

    fn microstep(&mut self, enabled: &[&'a TransitionDef], trigger: &Event) -> Result<(), CoreError> {
        self.count_microstep(trigger)?;
        debug!(
            event = %trigger.name,
            transitions = enabled.len(),
            microstep = self.microsteps,
            "microstep"
        );

        let exit_set = self.exit_set(enabled);
        self.record_history(&exit_set);
        for node in &exit_set {
            self.collector.collect(&self.def.node(*node).exit, trigger);
            self.config.remove(node);
        }

        for t in enabled {
            self.collector.collect(&t.actions, trigger);
        }

        let mut to_enter = BTreeSet::new();
        for t in enabled {
            let targets = self.effective_targets(t);
            if targets.is_empty() {
                continue;
            }
            let domain = self.domain(t, &targets);
            for target in t.targets_or_source(!t.internal) {
                self.add_descendants_to_enter(target, &mut to_enter);
            }
            for target in &targets {
                self.add_ancestors_to_enter(*target, domain, &mut to_enter);
            }
        }
        self.enter(to_enter, trigger);
        Ok(())
    }

    /// Enabled transitions for `event`, or the eventless ones (whose guards
    /// still see `event`).
    fn select(&self, event: &Event, eventless: bool) -> Vec<&'a TransitionDef> {
        let guards = GuardEvaluator::new(&self.imps.guards);
        let ctx = &self.collector.context;

        let mut enabled: Vec<&'a TransitionDef> = Vec::new();
        let def = self.def;
        for atomic in self.config.iter().copied().filter(|n| def.node(*n).is_atomic()) {
            let chain = std::iter::once(atomic).chain(def.ancestors(atomic));
            'chain: for state in chain {
                for t in &def.node(state).transitions {
                    let matches = if eventless {
                        t.is_eventless()
                    } else {
                        !t.is_eventless() && event.matches_descriptor(&t.event)
                    };
                    if matches && guards.check_opt(t.guard.as_ref(), ctx, event) {
                        if !enabled.iter().any(|e| std::ptr::eq(*e, t)) {
                            enabled.push(t);
                        }
                        break 'chain;
                    }
                }
            }
        }
        self.remove_conflicts(enabled)
    }

    fn remove_conflicts(&self, enabled: Vec<&'a TransitionDef>) -> Vec<&'a TransitionDef> {
        let mut filtered: Vec<&'a TransitionDef> = Vec::new();
        for t1 in enabled {
            let exit1 = self.exit_set(&[t1]);
            let mut preempted = false;
            let mut replaced = Vec::new();
            for (index, t2) in filtered.iter().enumerate() {
                let exit2 = self.exit_set(&[*t2]);
                if exit1.iter().any(|n| exit2.contains(n)) {
                    if self.def.is_descendant(t1.source, t2.source) {
                        replaced.push(index);
                    } else {
                        preempted = true;
                        break;
                    }
                }
            }
            if !preempted {
                for index in replaced.into_iter().rev() {
                    filtered.remove(index);
                }
                filtered.push(t1);
            }
        }
        filtered
    }

    /// Active nodes exited by `transitions`, deepest (last in document order) first.
    fn exit_set(&self, transitions: &[&TransitionDef]) -> Vec<NodeId> {
        let mut exit = BTreeSet::new();
        for t in transitions {
            let targets = self.effective_targets(t);
            if targets.is_empty() {
                continue;
            }
            let domain = self.domain(t, &targets);
            for node in &self.config {
                if self.def.is_descendant(*node, domain) {
                    exit.insert(*node);
                }
            }
        }
        exit.into_iter().rev().collect()
    }

    fn record_history(&mut self, exit_set: &[NodeId]) {
        for node in exit_set {
            for child in &self.def.node(*node).children {
                let NodeKind::History { depth, .. } = self.def.node(*child).kind else {
                    continue;
                };
                let recorded: Vec<NodeId> = match depth {
                    HistoryDepth::Deep => self
                        .config
                        .iter()
                        .copied()
                        .filter(|n| {
                            self.def.node(*n).is_atomic() && self.def.is_descendant(*n, *node)
                        })
                        .collect(),
                    HistoryDepth::Shallow => self
                        .config
                        .iter()
                        .copied()
                        .filter(|n| self.def.node(*n).parent == Some(*node))
                        .collect(),
                };
                self.history.insert(*child, recorded);
            }
        }
    }

    /// Targets with history nodes replaced by what they would restore. A
    /// targetless external transition targets its own source.
    fn effective_targets(&self, t: &TransitionDef) -> Vec<NodeId> {
        let mut out = Vec::new();
        for target in t.targets_or_source(!t.internal) {
            self.expand_history(target, &mut out);
        }
        out
    }

    fn expand_history(&self, node: NodeId, out: &mut Vec<NodeId>) {
        match &self.def.node(node).kind {
            NodeKind::History { default, .. } => {
                let restore = match self.history.get(&node) {
                    Some(recorded) => recorded.clone(),
                    None => self.history_default(node, default),
                };
                for n in restore {
                    self.expand_history(n, out);
                }
            }
            _ => {
                if !out.contains(&node) {
                    out.push(node);
                }
            }
        }
    }

    /// Default of a history node without a recorded configuration: its
    /// declared target, else its parent's default entry.
    fn history_default(&self, history: NodeId, default: &[NodeId]) -> Vec<NodeId> {
        if !default.is_empty() {
            return default.to_vec();
        }
        let Some(parent) = self.def.node(history).parent else {
            return Vec::new();
        };
        match &self.def.node(parent).kind {
            NodeKind::Compound { initial } => vec![*initial],
            _ => self.regions(parent).collect(),
        }
    }

    /// Transition domain: the source for an internal transition whose targets
    /// all lie inside a compound source, else the LCCA of source and targets.
    fn domain(&self, t: &TransitionDef, targets: &[NodeId]) -> NodeId {
        if t.internal
            && self.def.node(t.source).is_compound()
            && targets.iter().all(|n| self.def.is_descendant(*n, t.source))
        {
            return t.source;
        }
        let mut states = Vec::with_capacity(targets.len() + 1);
        states.push(t.source);
        states.extend_from_slice(targets);
        self.lcca(&states)
    }

    fn lcca(&self, states: &[NodeId]) -> NodeId {
        let root = self.def.root();
        let (head, tail) = match states.split_first() {
            Some(split) => split,
            None => return root,
        };
        self.def
            .ancestors(*head)
            .filter(|a| *a == root || self.def.node(*a).is_compound())
            .find(|a| tail.iter().all(|s| self.def.is_descendant(*s, *a)))
            .unwrap_or(root)
    }

    fn regions(&self, parallel: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.def
            .node(parallel)
            .children
            .iter()
            .copied()
            .filter(|c| !self.def.node(*c).is_history())
    }

    fn add_descendants_to_enter(&self, node: NodeId, to_enter: &mut BTreeSet<NodeId>) {
        match &self.def.node(node).kind {
            NodeKind::History { default, .. } => {
                let parent = self.def.node(node).parent.unwrap_or(node);
                let restore = match self.history.get(&node) {
                    Some(recorded) => recorded.clone(),
                    None => self.history_default(node, default),
                };
                for n in &restore {
                    self.add_descendants_to_enter(*n, to_enter);
                }
                for n in &restore {
                    self.add_ancestors_to_enter(*n, parent, to_enter);
                }
            }
            NodeKind::Compound { initial } => {
                to_enter.insert(node);
                self.add_descendants_to_enter(*initial, to_enter);
            }
            NodeKind::Parallel => {
                to_enter.insert(node);
                for region in self.regions(node) {
                    if !to_enter.iter().any(|s| self.def.is_descendant(*s, region)) {
                        self.add_descendants_to_enter(region, to_enter);
                    }
                }
            }
            NodeKind::Atomic | NodeKind::Final { .. } => {
                to_enter.insert(node);
            }
        }
    }

    /// Adds the proper ancestors of `node` below `domain`, completing any
    /// parallel regions that are not otherwise entered.
    fn add_ancestors_to_enter(&self, node: NodeId, domain: NodeId, to_enter: &mut BTreeSet<NodeId>) {
        let ancestors: Vec<NodeId> = self.def.ancestors(node).take_while(|a| *a != domain).collect();
        for ancestor in ancestors {
            to_enter.insert(ancestor);
            if self.def.node(ancestor).is_parallel() {
                for region in self.regions(ancestor).collect::<Vec<_>>() {
                    if !to_enter.iter().any(|s| self.def.is_descendant(*s, region)) {
                        self.add_descendants_to_enter(region, to_enter);
                    }
                }
            }
        }
    }

    fn enter(&mut self, to_enter: BTreeSet<NodeId>, trigger: &Event) {
        let def = self.def;
        for node_id in to_enter {
            self.config.insert(node_id);
            let node = def.node(node_id);
            self.collector.collect(&node.entry, trigger);

            let NodeKind::Final { data } = &node.kind else {
                continue;
            };
            let done_data = match data {
                Some(mapping) => match mapping.evaluate(&self.collector.context, trigger, &self.imps.exprs) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        warn!(state = %node.id, %reason, "done data evaluation failed");
                        None
                    }
                },
                None => None,
            };

            let Some(parent) = node.parent else {
                continue;
            };
            if parent == def.root() {
                self.done = true;
                self.done_data = done_data;
                continue;
            }
            self.collector.raised.push(Event::done_state(
                &def.node(parent).id,
                done_data.unwrap_or(Value::Null),
            ));
            if let Some(grandparent) = def.node(parent).parent {
                if def.node(grandparent).is_parallel()
                    && self.regions(grandparent).all(|r| self.is_in_final_state(r))
                {
                    self.collector
                        .raised
                        .push(Event::done_state(&def.node(grandparent).id, Value::Null));
                }
            }
        }
        self.internal.extend(self.collector.raised.drain(..));
    }

    fn is_in_final_state(&self, node: NodeId) -> bool {
        match &self.def.node(node).kind {
            NodeKind::Compound { .. } => self.def.node(node).children.iter().any(|c| {
                self.def.node(*c).is_final() && self.config.contains(c)
            }),
            NodeKind::Parallel => self.regions(node).all(|r| self.is_in_final_state(r)),
            _ => false,
        }
    }

    fn value_of(&self, node: NodeId) -> StateValue {
        let def = self.def;
        match &def.node(node).kind {
            NodeKind::Compound { .. } => {
                let active = def
                    .node(node)
                    .children
                    .iter()
                    .copied()
                    .find(|c| self.config.contains(c));
                match active {
                    Some(child) if def.node(child).is_atomic() => {
                        StateValue::Leaf(def.node(child).key.clone())
                    }
                    Some(child) => StateValue::Branch(BTreeMap::from([(
                        def.node(child).key.clone(),
                        self.value_of(child),
                    )])),
                    None => StateValue::Branch(BTreeMap::new()),
                }
            }
            NodeKind::Parallel => StateValue::Branch(
                self.regions(node)
                    .map(|r| (def.node(r).key.clone(), self.value_of(r)))
                    .collect(),
            ),
            _ => StateValue::Branch(BTreeMap::new()),
        }
    }
}

/// Rebuilds a configuration from a state value. Compound nodes addressed
/// only down to themselves are completed with their default descendants.
pub(crate) fn configuration_of(
    def: &MachineDefinition,
    value: &StateValue,
) -> Result<Vec<NodeId>, CoreError> {
    let mut config = BTreeSet::new();
    config.insert(def.root());
    walk_value(def, def.root(), Some(value), &mut config)?;
    Ok(config.into_iter().collect())
}

fn walk_value(
    def: &MachineDefinition,
    node: NodeId,
    value: Option<&StateValue>,
    config: &mut BTreeSet<NodeId>,
) -> Result<(), CoreError> {
    let invalid = |reason: String| CoreError::InvalidStateValue { reason };
    match &def.node(node).kind {
        NodeKind::Compound { initial } => {
            let (child, rest) = match value {
                None => (*initial, None),
                Some(StateValue::Leaf(key)) => (
                    def.child(node, key)
                        .ok_or_else(|| invalid(format!("'{}' is not a child of '{}'", key, def.node(node).id)))?,
                    None,
                ),
                Some(StateValue::Branch(children)) if children.len() == 1 => {
                    let (key, sub) = children.iter().next().ok_or_else(|| invalid("empty branch".into()))?;
                    (
                        def.child(node, key).ok_or_else(|| {
                            invalid(format!("'{}' is not a child of '{}'", key, def.node(node).id))
                        })?,
                        Some(sub),
                    )
                }
                Some(StateValue::Branch(children)) if children.is_empty() => (*initial, None),
                Some(_) => {
                    return Err(invalid(format!(
                        "compound state '{}' must have exactly one active child",
                        def.node(node).id
                    )))
                }
            };
            if def.node(child).is_history() {
                return Err(invalid("a history state cannot be active".into()));
            }
            config.insert(child);
            walk_value(def, child, rest, config)
        }
        NodeKind::Parallel => {
            let children = match value {
                None => None,
                Some(StateValue::Branch(children)) => Some(children),
                Some(StateValue::Leaf(key)) => {
                    return Err(invalid(format!(
                        "parallel state '{}' needs a value per region, got '{}'",
                        def.node(node).id,
                        key
                    )))
                }
            };
            if let Some(children) = children {
                for key in children.keys() {
                    match def.child(node, key) {
                        Some(c) if !def.node(c).is_history() => {}
                        _ => return Err(invalid(format!("'{}' is not a region of '{}'", key, def.node(node).id))),
                    }
                }
            }
            let regions: Vec<NodeId> = def
                .node(node)
                .children
                .iter()
                .copied()
                .filter(|c| !def.node(*c).is_history())
                .collect();
            for region in regions {
                config.insert(region);
                let sub = children.and_then(|c| c.get(&def.node(region).key));
                walk_value(def, region, sub, config)?;
            }
            Ok(())
        }
        _ => match value {
            None => Ok(()),
            Some(StateValue::Branch(children)) if children.is_empty() => Ok(()),
            Some(_) => Err(invalid(format!(
                "'{}' is atomic and has no children",
                def.node(node).id
            ))),
        },
    }
}
