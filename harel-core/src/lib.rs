//! # harel-core
//!
//! Statechart engine for harel.
//!
//! This crate provides:
//! - Machine definition parsing, validation and compilation into a state node tree
//! - Pure transition resolution (microsteps, eventless transitions, raised events)
//! - Action collection and built-in action descriptors
//! - Guard expression evaluation
//! - Immutable state snapshots

pub mod action;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod machine;
pub mod node;
pub mod resolver;
pub mod state;
pub mod value;

pub use action::{ActionDef, ActionKind, ActionObject, Mapping, SendTarget, ValueExpr};
pub use definition::{MachineConfig, MachineDefinition, StateConfig, TransitionConfig};
pub use error::CoreError;
pub use event::Event;
pub use guard::{Guard, GuardEvaluator, GuardExpr};
pub use machine::{Implementations, Machine};
pub use node::{InvokeDef, NodeId, NodeKind, StateNode, TransitionDef};
pub use resolver::DEFAULT_MAX_MICROSTEPS;
pub use state::{PersistedState, State};
pub use value::StateValue;
