//! Immutable state snapshots.

use crate::action::ActionObject;
use crate::event::Event;
use crate::node::NodeId;
use crate::value::StateValue;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of one resolution.
///
/// A snapshot is never mutated; each transition produces a fresh one that
/// supersedes its predecessor.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub value: StateValue,
    pub context: Value,
    /// Actions to execute, in exit/transition/entry order.
    pub actions: Vec<ActionObject>,
    /// Event that produced this snapshot.
    pub event: Event,
    pub changed: bool,
    /// A top-level final state was reached.
    pub done: bool,
    pub done_data: Option<Value>,
    /// Every active node (leaves and their ancestors), sorted.
    pub configuration: Vec<NodeId>,
    /// Recorded history, keyed by history node.
    pub history: BTreeMap<NodeId, Vec<NodeId>>,
}

impl State {
    /// Returns true if the dotted path is active (`"playing.fast"`).
    pub fn matches(&self, path: &str) -> bool {
        self.value.matches(path)
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.configuration.binary_search(&node).is_ok()
    }

    pub fn action_types(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.action_type.as_str()).collect()
    }

    /// Serializable projection: `{value, context}`.
    pub fn persist(&self) -> PersistedState {
        PersistedState {
            value: self.value.clone(),
            context: self.context.clone(),
        }
    }

    /// Snapshot for an event that selected no transition.
    pub(crate) fn unchanged(&self, event: Event) -> State {
        State {
            actions: Vec::new(),
            event,
            changed: false,
            ..self.clone()
        }
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("State", 7)?;
        st.serialize_field("value", &self.value)?;
        st.serialize_field("context", &self.context)?;
        st.serialize_field("actions", &self.actions)?;
        st.serialize_field("event", &self.event)?;
        st.serialize_field("changed", &self.changed)?;
        st.serialize_field("done", &self.done)?;
        if let Some(data) = &self.done_data {
            st.serialize_field("doneData", data)?;
        } else {
            st.skip_field("doneData")?;
        }
        st.end()
    }
}

/// The persistable part of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub value: StateValue,
    #[serde(default)]
    pub context: Value,
}
