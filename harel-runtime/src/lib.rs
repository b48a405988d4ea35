//! # harel-runtime
//!
//! Interpreter for harel statecharts.
//!
//! This crate provides:
//! - The run loop: external mailbox, macrosteps, action execution
//! - Invoked services (nested machines, async tasks, callbacks) with
//!   generation-tagged cancellation
//! - Delayed sends over a pluggable clock (tokio or simulated)
//! - State, done and diagnostic subscriptions
//! - YAML/env configuration

pub mod clock;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod mailbox;
pub mod service;
pub mod subscription;

pub use clock::{Clock, SimulatedClock, TimerHandle, TokioClock};
pub use config::{ClockKind, Config, ConfigError, InterpreterConfig, LoggingConfig};
pub use error::{Diagnostic, RuntimeError};
pub use interpreter::{Interpreter, LogSink, Status};
pub use mailbox::{Envelope, Mailbox, Origin};
pub use service::{
    CallbackFactory, CallbackHandle, CallbackSender, Service, ServiceRegistry, ServiceSource,
    Services, TaskFactory, TaskFuture,
};
pub use subscription::{Listener, Listeners, Subscription};
