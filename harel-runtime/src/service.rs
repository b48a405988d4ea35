//! Invoked services.
//!
//! A [`Services`] catalog maps `invoke.src` names to a [`ServiceSource`]. When
//! a state declaring an invocation is entered the interpreter starts a live
//! [`Service`] and records it in its [`ServiceRegistry`] under the invocation
//! id, tagged with a fresh generation. Everything a service sends back is
//! stamped with that generation; once the service is stopped the registry no
//! longer knows the generation and late deliveries are dropped at dequeue.

use crate::interpreter::Interpreter;
use crate::mailbox::{Envelope, Origin};
use dashmap::DashMap;
use harel_core::{Event, Machine};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Settles with `Ok(done data)` or `Err(error data)`.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send + 'static>>;

/// Creates the future of a task service from `(context, event)`.
pub type TaskFactory = Arc<dyn Fn(&Value, &Event) -> TaskFuture + Send + Sync>;

/// Sets up a callback service. An `Err` is reported as `error.invoke.<id>`.
pub type CallbackFactory =
    Arc<dyn Fn(CallbackSender, &Value, &Event) -> Result<CallbackHandle, Value> + Send + Sync>;

/// Enqueue function of an interpreter's mailbox.
pub(crate) type Deliver = Arc<dyn Fn(Envelope) + Send + Sync>;

/// How to run an invocation.
#[derive(Clone)]
pub enum ServiceSource {
    /// A nested interpreter for another machine.
    Machine(Machine),
    /// A one-shot async task.
    Task(TaskFactory),
    /// A subscription that pushes events through a [`CallbackSender`].
    Callback(CallbackFactory),
}

impl ServiceSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceSource::Machine(_) => "machine",
            ServiceSource::Task(_) => "task",
            ServiceSource::Callback(_) => "callback",
        }
    }
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSource::Machine(m) => write!(f, "Machine({})", m.id()),
            ServiceSource::Task(_) => f.write_str("Task(..)"),
            ServiceSource::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Service catalog keyed by `invoke.src`.
#[derive(Debug, Clone, Default)]
pub struct Services {
    sources: HashMap<String, ServiceSource>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine(mut self, name: impl Into<String>, machine: Machine) -> Self {
        self.sources
            .insert(name.into(), ServiceSource::Machine(machine));
        self
    }

    pub fn task<F, Fut>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value, &Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let task: TaskFactory =
            Arc::new(move |ctx: &Value, event: &Event| -> TaskFuture { Box::pin(factory(ctx, event)) });
        self.sources.insert(name.into(), ServiceSource::Task(task));
        self
    }

    pub fn callback(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(CallbackSender, &Value, &Event) -> Result<CallbackHandle, Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.sources
            .insert(name.into(), ServiceSource::Callback(Arc::new(factory)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSource> {
        self.sources.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Gate through which a callback service reaches its parent.
///
/// Once disposal has been requested nothing passes the gate. An event that
/// slips past the check concurrently with disposal still carries the old
/// generation and is discarded before the parent processes it.
#[derive(Clone)]
pub struct CallbackSender {
    id: String,
    generation: u64,
    disposed: Arc<AtomicBool>,
    deliver: Deliver,
}

impl CallbackSender {
    pub(crate) fn new(id: String, generation: u64, deliver: Deliver) -> Self {
        Self {
            id,
            generation,
            disposed: Arc::new(AtomicBool::new(false)),
            deliver,
        }
    }

    /// Invocation id this sender belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enqueues `event` on the parent. Returns false once disposed.
    pub fn send(&self, event: impl Into<Event>) -> bool {
        self.deliver_event(event.into())
    }

    /// Reports a failure as `error.invoke.<id>`.
    pub fn fail(&self, data: Value) -> bool {
        self.deliver_event(Event::error_invoke(&self.id, data))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn deliver_event(&self, event: Event) -> bool {
        if self.is_disposed() {
            trace!(service = %self.id, event = %event.name, "dropped event from disposed callback");
            return false;
        }
        (self.deliver)(Envelope {
            event,
            origin: Origin::Service {
                id: self.id.clone(),
                generation: self.generation,
            },
        });
        true
    }
}

impl fmt::Debug for CallbackSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSender")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// What a callback factory hands back: an optional disposer and an optional
/// receiver for events sent to the service.
#[derive(Default)]
pub struct CallbackHandle {
    dispose: Option<Box<dyn FnOnce() + Send>>,
    receive: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
}

impl CallbackHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_dispose(mut self, dispose: impl FnOnce() + Send + 'static) -> Self {
        self.dispose = Some(Box::new(dispose));
        self
    }

    pub fn on_receive(mut self, receive: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.receive = Some(Arc::new(receive));
        self
    }
}

#[derive(Clone)]
enum ServiceKind {
    Machine(Interpreter),
    Task(AbortHandle),
    Callback {
        disposed: Arc<AtomicBool>,
        dispose: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
        receive: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
    },
}

/// A live invocation.
#[derive(Clone)]
pub struct Service {
    id: String,
    src: String,
    generation: u64,
    forward: bool,
    kind: ServiceKind,
}

impl Service {
    pub(crate) fn machine(
        id: &str,
        src: &str,
        generation: u64,
        forward: bool,
        child: Interpreter,
    ) -> Self {
        Self::with_kind(id, src, generation, forward, ServiceKind::Machine(child))
    }

    pub(crate) fn task(id: &str, src: &str, generation: u64, forward: bool, abort: AbortHandle) -> Self {
        Self::with_kind(id, src, generation, forward, ServiceKind::Task(abort))
    }

    pub(crate) fn callback(
        id: &str,
        src: &str,
        generation: u64,
        forward: bool,
        sender: &CallbackSender,
        handle: CallbackHandle,
    ) -> Self {
        Self::with_kind(
            id,
            src,
            generation,
            forward,
            ServiceKind::Callback {
                disposed: Arc::clone(&sender.disposed),
                dispose: Arc::new(Mutex::new(handle.dispose)),
                receive: handle.receive,
            },
        )
    }

    fn with_kind(id: &str, src: &str, generation: u64, forward: bool, kind: ServiceKind) -> Self {
        Self {
            id: id.to_string(),
            src: src.to_string(),
            generation,
            forward,
            kind,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn forwards(&self) -> bool {
        self.forward
    }

    /// The nested interpreter, for machine services.
    pub fn child(&self) -> Option<&Interpreter> {
        match &self.kind {
            ServiceKind::Machine(child) => Some(child),
            _ => None,
        }
    }

    /// Sends `event` to the service. Tasks accept no events.
    pub fn deliver(&self, event: &Event) {
        match &self.kind {
            ServiceKind::Machine(child) => child.send(event.clone()),
            ServiceKind::Callback {
                disposed, receive, ..
            } => {
                if let Some(receive) = receive {
                    if !disposed.load(Ordering::Acquire) {
                        receive(event);
                    }
                }
            }
            ServiceKind::Task(_) => {
                debug!(service = %self.id, event = %event.name, "task services do not receive events");
            }
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn stop(&self) {
        match &self.kind {
            ServiceKind::Machine(child) => {
                child.stop();
            }
            ServiceKind::Task(abort) => abort.abort(),
            ServiceKind::Callback {
                disposed, dispose, ..
            } => {
                // Close the gate before running the disposer.
                disposed.store(true, Ordering::Release);
                let dispose = dispose.lock().take();
                if let Some(dispose) = dispose {
                    dispose();
                }
            }
        }
        debug!(service = %self.id, src = %self.src, generation = self.generation, "service stopped");
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ServiceKind::Machine(_) => "machine",
            ServiceKind::Task(_) => "task",
            ServiceKind::Callback { .. } => "callback",
        };
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("src", &self.src)
            .field("kind", &kind)
            .field("generation", &self.generation)
            .field("forward", &self.forward)
            .finish()
    }
}

/// Live services keyed by invocation id.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Service>,
    generation: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers `service`, returning the one it displaced.
    pub fn insert(&self, service: Service) -> Option<Service> {
        self.services.insert(service.id.clone(), service)
    }

    pub fn remove(&self, id: &str) -> Option<Service> {
        self.services.remove(id).map(|(_, service)| service)
    }

    /// Removes `id` only if it is still the given generation.
    pub fn remove_generation(&self, id: &str, generation: u64) -> Option<Service> {
        self.services
            .remove_if(id, |_, service| service.generation == generation)
            .map(|(_, service)| service)
    }

    pub fn get(&self, id: &str) -> Option<Service> {
        self.services.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_live(&self, id: &str, generation: u64) -> bool {
        self.services
            .get(id)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false)
    }

    /// Services that relay their parent's events.
    pub fn forwarding(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|entry| entry.forward)
            .map(|entry| entry.value().clone())
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Removes and returns every service.
    pub fn take_all(&self) -> Vec<Service> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }
}
