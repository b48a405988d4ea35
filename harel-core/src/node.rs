//! Compiled state node tree.
//!
//! Nodes live in an arena owned by the machine definition and are indexed by
//! [`NodeId`]. Ids are assigned in document order (pre-order DFS), so a
//! parent always has a smaller id than its descendants and sorting by id
//! gives the entry order.

use crate::action::{ActionDef, Mapping};
use crate::guard::Guard;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node in the definition's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDepth {
    Shallow,
    Deep,
}

/// Kind-specific data of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Atomic,
    Compound { initial: NodeId },
    Parallel,
    Final { data: Option<Mapping> },
    History {
        depth: HistoryDepth,
        /// Targets used when no history has been recorded yet.
        default: Vec<NodeId>,
    },
}

/// A transition candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionDef {
    /// Event descriptor; empty for eventless transitions.
    pub event: String,
    pub source: NodeId,
    /// Empty for targetless transitions.
    pub targets: Vec<NodeId>,
    pub guard: Option<Guard>,
    pub actions: Vec<ActionDef>,
    pub internal: bool,
    /// Position among all transitions in document order.
    pub order: usize,
}

impl TransitionDef {
    pub fn is_eventless(&self) -> bool {
        self.event.is_empty()
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }

    /// Declared targets; a targetless transition yields its own source when
    /// `self_target` is set.
    pub(crate) fn targets_or_source(&self, self_target: bool) -> Vec<NodeId> {
        if self.targets.is_empty() && self_target {
            vec![self.source]
        } else {
            self.targets.clone()
        }
    }
}

/// An invocation declared on a state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvokeDef {
    pub id: String,
    /// Key in the runtime's service catalog.
    pub src: String,
    /// Relay every external event of the parent to this service.
    pub forward: bool,
    #[serde(skip)]
    pub data: Option<Mapping>,
    #[serde(skip)]
    pub owner: NodeId,
}

/// A compiled state node.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: String,
    /// Key under the parent (`"active"`).
    pub key: String,
    /// Keys from the root, root excluded.
    pub path: Vec<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    pub transitions: Vec<TransitionDef>,
    pub entry: Vec<ActionDef>,
    pub exit: Vec<ActionDef>,
    pub invoke: Vec<InvokeDef>,
    pub depth: usize,
}

impl StateNode {
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, NodeKind::Atomic | NodeKind::Final { .. })
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, NodeKind::Compound { .. })
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, NodeKind::Parallel)
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, NodeKind::Final { .. })
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, NodeKind::History { .. })
    }

    /// Dot-joined path used in `StateValue` matching (`"a.b"`).
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}
