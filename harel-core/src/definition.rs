//! Machine definition types.
//!
//! Machine definitions use a JSON DSL:
//!
//! ```json
//! {
//!   "id": "light",
//!   "initial": "green",
//!   "context": {"cycles": 0},
//!   "states": {
//!     "green":  {"on": {"TIMER": "yellow"}},
//!     "yellow": {"after": {"1000": "red"}},
//!     "red": {
//!       "on": {"TIMER": {"target": "green", "actions": [
//!         {"type": "assign", "assignment": {"cycles": {"expr": "inc"}}}
//!       ]}}
//!     }
//!   }
//! }
//! ```
//!
//! A definition is compiled once into an arena of [`StateNode`]s and never
//! mutated afterwards.

use crate::action::{ActionDef, Delay, EventExpr, Mapping};
use crate::error::CoreError;
use crate::event::{Event, DONE_INVOKE_PREFIX, DONE_STATE_PREFIX, ERROR_INVOKE_PREFIX};
use crate::guard::Guard;
use crate::node::{HistoryDepth, InvokeDef, NodeId, NodeKind, StateNode, TransitionDef};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Id used for a machine whose root declares none.
pub const DEFAULT_MACHINE_ID: &str = "machine";

/// Declared node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Atomic,
    Compound,
    Parallel,
    Final,
    History,
}

/// Top-level machine config: the root state plus the initial context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,

    #[serde(flatten)]
    pub root: StateConfig,
}

/// Raw state node config as written by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Child states in document order.
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<(String, StateConfig)>,

    /// Event descriptor -> candidates, in document order.
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<(String, OneOrMany<TransitionConfig>)>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub always: OneOrMany<TransitionConfig>,

    /// Delay (milliseconds or named delay) -> candidates.
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<(String, OneOrMany<TransitionConfig>)>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub entry: OneOrMany<ActionDef>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub exit: OneOrMany<ActionDef>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub invoke: OneOrMany<InvokeConfig>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub on_done: OneOrMany<TransitionConfig>,

    /// Done data of a final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Mapping>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryDepth>,

    /// Default target of a history state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl StateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(kind: StateType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn initial(mut self, key: impl Into<String>) -> Self {
        self.initial = Some(key.into());
        self
    }

    pub fn state(mut self, key: impl Into<String>, config: StateConfig) -> Self {
        self.states.push((key.into(), config));
        self
    }

    pub fn on(mut self, event: impl Into<String>, transition: TransitionConfig) -> Self {
        let event = event.into();
        match self.on.iter_mut().find(|(e, _)| *e == event) {
            Some((_, list)) => list.0.push(transition),
            None => self.on.push((event, OneOrMany(vec![transition]))),
        }
        self
    }

    pub fn always(mut self, transition: TransitionConfig) -> Self {
        self.always.0.push(transition);
        self
    }

    pub fn after(mut self, millis: u64, transition: TransitionConfig) -> Self {
        self.after.push((millis.to_string(), OneOrMany(vec![transition])));
        self
    }

    pub fn entry(mut self, action: impl Into<ActionDef>) -> Self {
        self.entry.0.push(action.into());
        self
    }

    pub fn exit(mut self, action: impl Into<ActionDef>) -> Self {
        self.exit.0.push(action.into());
        self
    }

    pub fn invoke(mut self, invoke: InvokeConfig) -> Self {
        self.invoke.0.push(invoke);
        self
    }

    pub fn on_done(mut self, transition: TransitionConfig) -> Self {
        self.on_done.0.push(transition);
        self
    }
}

/// A transition candidate as written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitionConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDef>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
}

impl TransitionConfig {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: vec![target.into()],
            ..Self::default()
        }
    }

    /// A transition with no target.
    pub fn targetless() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn action(mut self, action: impl Into<ActionDef>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

impl<'de> Deserialize<'de> for TransitionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Full {
            #[serde(default)]
            target: Option<OneOrMany<String>>,
            #[serde(default, alias = "cond")]
            guard: Option<String>,
            #[serde(default)]
            actions: OneOrMany<ActionDef>,
            #[serde(default)]
            internal: bool,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Target(String),
            Full(Full),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Target(target) => TransitionConfig::to(target),
            Repr::Full(full) => TransitionConfig {
                target: full.target.map(|t| t.0).unwrap_or_default(),
                guard: full.guard,
                actions: full.actions.0,
                internal: full.internal,
            },
        })
    }
}

/// An invocation as written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub src: String,
    #[serde(default, alias = "autoForward", skip_serializing_if = "std::ops::Not::not")]
    pub forward: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Mapping>,
    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub on_done: OneOrMany<TransitionConfig>,
    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub on_error: OneOrMany<TransitionConfig>,
}

impl InvokeConfig {
    pub fn new(id: impl Into<String>, src: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            src: src.into(),
            ..Self::default()
        }
    }

    pub fn forward(mut self) -> Self {
        self.forward = true;
        self
    }

    pub fn on_done(mut self, transition: TransitionConfig) -> Self {
        self.on_done.0.push(transition);
        self
    }

    pub fn on_error(mut self, transition: TransitionConfig) -> Self {
        self.on_error.0.push(transition);
        self
    }
}

/// A single item or a list of items.
#[derive(Debug, Clone, PartialEq)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<T> OneOrMany<T> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Serialize> Serialize for OneOrMany<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Many(Vec<T>),
            One(T),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Many(items) => OneOrMany(items),
            Repr::One(item) => OneOrMany(vec![item]),
        })
    }
}

/// JSON objects as `Vec<(key, value)>`, keeping document order.
mod ordered_map {
    use super::*;

    pub fn serialize<S, T>(entries: &Vec<(String, T)>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Vec<(String, T)>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, T)> = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

/// Validated, compiled machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    /// Machine id (root node id).
    pub id: String,

    /// Initial context for new interpreters.
    pub context: Value,

    nodes: Vec<StateNode>,

    by_id: HashMap<String, NodeId>,

    invokes: HashMap<String, InvokeDef>,

    /// Original config for storage and display.
    pub config: MachineConfig,

    /// crc32c of the canonical JSON config.
    pub checksum: String,
}

impl MachineDefinition {
    /// Parses and validates a machine definition from JSON text.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: MachineConfig = serde_json::from_str(json)?;
        Self::from_config(config)
    }

    /// Parses and validates a machine definition from a JSON value.
    pub fn from_value(json: &Value) -> Result<Self, CoreError> {
        let config: MachineConfig = serde_json::from_value(json.clone())?;
        Self::from_config(config)
    }

    /// Compiles a machine definition from its config.
    pub fn from_config(config: MachineConfig) -> Result<Self, CoreError> {
        if config.root.states.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "machine has no states".to_string(),
            });
        }

        let id = config
            .root
            .id
            .clone()
            .unwrap_or_else(|| DEFAULT_MACHINE_ID.to_string());

        let mut compiler = Compiler {
            machine_id: id.clone(),
            nodes: Vec::new(),
            configs: Vec::new(),
            by_id: HashMap::new(),
            invokes: HashMap::new(),
            order: 0,
        };
        compiler.index(&config.root, String::new(), Vec::new(), None)?;
        compiler.resolve_kinds()?;
        compiler.resolve_transitions()?;

        let json_bytes = serde_json::to_vec(&config)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        let Compiler {
            nodes,
            by_id,
            invokes,
            ..
        } = compiler;

        Ok(Self {
            id,
            context: config.context.clone(),
            nodes,
            by_id,
            invokes,
            config,
            checksum,
        })
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[StateNode] {
        &self.nodes
    }

    /// Looks up a node by its id (`"toggle.active"` or an explicit id).
    pub fn get(&self, id: &str) -> Option<NodeId> {
        self.by_id.get(id.trim_start_matches('#')).copied()
    }

    /// Looks up an invocation by id.
    pub fn invoke(&self, id: &str) -> Option<&InvokeDef> {
        self.invokes.get(id)
    }

    /// Child of `parent` with the given key.
    pub fn child(&self, parent: NodeId, key: &str) -> Option<NodeId> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).key == key)
    }

    /// Ancestors of `id` from its parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.node(id).parent, move |p| self.node(*p).parent)
    }

    /// Returns true if `id` is a strict descendant of `ancestor`.
    pub fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// Every event descriptor with a transition somewhere in the machine.
    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.transitions.iter())
            .map(|t| t.event.as_str())
            .filter(|e| !e.is_empty())
            .collect();
        events.sort_unstable();
        events.dedup();
        events
    }

    /// Returns the config as JSON.
    pub fn to_json(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(&self.config)?)
    }
}

struct Compiler<'a> {
    machine_id: String,
    nodes: Vec<StateNode>,
    configs: Vec<&'a StateConfig>,
    by_id: HashMap<String, NodeId>,
    invokes: HashMap<String, InvokeDef>,
    order: usize,
}

impl<'a> Compiler<'a> {
    /// First pass: assign ids in document order and build the skeleton.
    fn index(
        &mut self,
        config: &'a StateConfig,
        key: String,
        path: Vec<String>,
        parent: Option<NodeId>,
    ) -> Result<NodeId, CoreError> {
        let node_id = NodeId(self.nodes.len());
        let id = match (&config.id, parent) {
            (Some(explicit), _) => explicit.clone(),
            (None, None) => self.machine_id.clone(),
            (None, Some(_)) => format!("{}.{}", self.machine_id, path.join(".")),
        };
        if self.by_id.insert(id.clone(), node_id).is_some() {
            return Err(CoreError::DuplicateId { id });
        }

        self.nodes.push(StateNode {
            id,
            key,
            path: path.clone(),
            parent,
            children: Vec::new(),
            kind: NodeKind::Atomic,
            transitions: Vec::new(),
            entry: config.entry.0.clone(),
            exit: config.exit.0.clone(),
            invoke: Vec::new(),
            depth: path.len(),
        });
        self.configs.push(config);

        for (child_key, child) in &config.states {
            let mut child_path = path.clone();
            child_path.push(child_key.clone());
            let child_id = self.index(child, child_key.clone(), child_path, Some(node_id))?;
            self.nodes[node_id.0].children.push(child_id);
        }
        Ok(node_id)
    }

    fn invalid(&self, node: NodeId, reason: impl fmt::Display) -> CoreError {
        CoreError::InvalidDefinition {
            reason: format!("state '{}': {}", self.nodes[node.0].id, reason),
        }
    }

    /// Second pass: node kinds and initial children.
    fn resolve_kinds(&mut self) -> Result<(), CoreError> {
        for index in 0..self.nodes.len() {
            let node_id = NodeId(index);
            let config = self.configs[index];
            let has_children = !self.nodes[index].children.is_empty();
            let declared = match (config.kind, config.history) {
                (Some(kind), _) => kind,
                (None, Some(_)) => StateType::History,
                (None, None) if has_children => StateType::Compound,
                (None, None) => StateType::Atomic,
            };

            let kind = match declared {
                StateType::Atomic if has_children => {
                    return Err(self.invalid(node_id, "atomic state cannot have children"))
                }
                StateType::Atomic => NodeKind::Atomic,
                StateType::Final if has_children => {
                    return Err(self.invalid(node_id, "final state cannot have children"))
                }
                StateType::Final => NodeKind::Final {
                    data: config.data.clone(),
                },
                StateType::History if has_children => {
                    return Err(self.invalid(node_id, "history state cannot have children"))
                }
                StateType::History => {
                    if self.nodes[index].parent.is_none() {
                        return Err(self.invalid(node_id, "root cannot be a history state"));
                    }
                    NodeKind::History {
                        depth: config.history.unwrap_or(HistoryDepth::Shallow),
                        default: Vec::new(),
                    }
                }
                StateType::Parallel if !has_children => {
                    return Err(self.invalid(node_id, "parallel state has no regions"))
                }
                StateType::Parallel => NodeKind::Parallel,
                StateType::Compound if !has_children => {
                    return Err(self.invalid(node_id, "compound state has no children"))
                }
                StateType::Compound => {
                    let initial = match &config.initial {
                        Some(key) => self.nodes[index]
                            .children
                            .iter()
                            .copied()
                            .find(|c| self.nodes[c.0].key == *key)
                            .ok_or_else(|| {
                                self.invalid(node_id, format!("initial state '{}' is not a child", key))
                            })?,
                        None => self.nodes[index].children[0],
                    };
                    if self.configs[initial.0].kind == Some(StateType::History)
                        || self.configs[initial.0].history.is_some()
                    {
                        return Err(self.invalid(node_id, "initial state cannot be a history state"));
                    }
                    NodeKind::Compound { initial }
                }
            };
            self.nodes[index].kind = kind;
        }
        Ok(())
    }

    /// Third pass: targets, guards and the desugared `after`/`invoke`/`onDone`.
    fn resolve_transitions(&mut self) -> Result<(), CoreError> {
        for index in 0..self.nodes.len() {
            let node_id = NodeId(index);
            let config = self.configs[index];
            let node_name = self.nodes[index].id.clone();
            let mut transitions = Vec::new();

            for (event, candidates) in &config.on {
                if event.is_empty() {
                    return Err(self.invalid(node_id, "empty event name; use 'always'"));
                }
                for candidate in &candidates.0 {
                    transitions.push(self.transition(node_id, event, candidate)?);
                }
            }

            for (delay_key, candidates) in &config.after {
                let event = format!("harel.after({})#{}", delay_key, node_name);
                self.nodes[index].entry.push(ActionDef::Send {
                    event: EventExpr::Static(Event::new(event.clone())),
                    delay: Some(Delay::from_key(delay_key)),
                    to: None,
                    id: Some(event.clone()),
                });
                self.nodes[index].exit.push(ActionDef::Cancel(event.clone()));
                for candidate in &candidates.0 {
                    transitions.push(self.transition(node_id, &event, candidate)?);
                }
            }

            for candidate in &config.always.0 {
                transitions.push(self.transition(node_id, "", candidate)?);
            }

            let done_event = format!("{}{}", DONE_STATE_PREFIX, node_name);
            for candidate in &config.on_done.0 {
                transitions.push(self.transition(node_id, &done_event, candidate)?);
            }

            for (position, invoke) in config.invoke.0.iter().enumerate() {
                let invoke_id = invoke
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}:invocation[{}]", node_name, position));
                if self.invokes.contains_key(&invoke_id) {
                    return Err(self.invalid(node_id, format!("duplicate invocation id '{}'", invoke_id)));
                }
                let def = InvokeDef {
                    id: invoke_id.clone(),
                    src: invoke.src.clone(),
                    forward: invoke.forward,
                    data: invoke.data.clone(),
                    owner: node_id,
                };
                self.invokes.insert(invoke_id.clone(), def.clone());
                self.nodes[index].invoke.push(def);
                self.nodes[index].entry.push(ActionDef::Start(invoke_id.clone()));
                self.nodes[index].exit.push(ActionDef::Stop(invoke_id.clone()));

                let done = format!("{}{}", DONE_INVOKE_PREFIX, invoke_id);
                for candidate in &invoke.on_done.0 {
                    transitions.push(self.transition(node_id, &done, candidate)?);
                }
                let error = format!("{}{}", ERROR_INVOKE_PREFIX, invoke_id);
                for candidate in &invoke.on_error.0 {
                    transitions.push(self.transition(node_id, &error, candidate)?);
                }
            }

            if let NodeKind::History { .. } = self.nodes[index].kind {
                let default = match &config.target {
                    Some(target) => vec![self.resolve_target(node_id, target)?],
                    None => Vec::new(),
                };
                self.nodes[index].kind = NodeKind::History {
                    depth: config.history.unwrap_or(HistoryDepth::Shallow),
                    default,
                };
            }

            self.nodes[index].transitions = transitions;
        }
        Ok(())
    }

    fn transition(
        &mut self,
        source: NodeId,
        event: &str,
        config: &TransitionConfig,
    ) -> Result<TransitionDef, CoreError> {
        let targets = config
            .target
            .iter()
            .map(|t| self.resolve_target(source, t))
            .collect::<Result<Vec<_>, _>>()?;
        let guard = config.guard.as_deref().map(Guard::parse).transpose()?;
        let order = self.order;
        self.order += 1;

        Ok(TransitionDef {
            event: event.to_string(),
            source,
            targets,
            guard,
            actions: config.actions.clone(),
            internal: config.internal,
            order,
        })
    }

    /// `#id` is absolute, `.a.b` descends from the source, anything else
    /// descends from the source's parent (a sibling path).
    fn resolve_target(&self, source: NodeId, target: &str) -> Result<NodeId, CoreError> {
        let unknown = || CoreError::UnknownTarget {
            source_id: self.nodes[source.0].id.clone(),
            target: target.to_string(),
        };

        if let Some(id) = target.strip_prefix('#') {
            return self.by_id.get(id).copied().ok_or_else(unknown);
        }

        let (mut current, rest) = match target.strip_prefix('.') {
            Some(rest) => (source, rest),
            None => (self.nodes[source.0].parent.unwrap_or(source), target),
        };
        for key in rest.split('.') {
            current = self.nodes[current.0]
                .children
                .iter()
                .copied()
                .find(|c| self.nodes[c.0].key == key)
                .ok_or_else(unknown)?;
        }
        Ok(current)
    }
}
