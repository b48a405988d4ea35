//! Runs a machine over time.
//!
//! An [`Interpreter`] owns one evolving [`State`]. Events go through the
//! [`Mailbox`]; whoever claims the mailbox runs macrosteps until it is empty,
//! so concurrent senders are serialized and a macrostep is never interleaved
//! with another. Per macrostep the pure resolver computes the next snapshot
//! (draining raised and eventless transitions), then the interpreter executes
//! its actions, reconciles invoked services and publishes the snapshot once.

use crate::clock::{Clock, TimerHandle, TokioClock};
use crate::config::Config;
use crate::error::{Diagnostic, RuntimeError};
use crate::mailbox::{Envelope, Mailbox, Origin};
use crate::service::{CallbackSender, Deliver, Service, ServiceRegistry, ServiceSource, Services};
use crate::subscription::{Listeners, Subscription};
use dashmap::DashMap;
use harel_core::action::{SendAction, SendTarget, PARENT_TARGET};
use harel_core::event::{DONE_INVOKE_PREFIX, ERROR_INVOKE_PREFIX};
use harel_core::{
    ActionKind, ActionObject, CoreError, Event, InvokeDef, Machine, PersistedState, State,
    ValueExpr,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of an interpreter. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    Running,
    Stopped,
}

/// Receives the output of `log` actions: `(label, value)`.
pub type LogSink = Arc<dyn Fn(Option<&str>, &Value) + Send + Sync>;

fn tracing_sink() -> LogSink {
    Arc::new(|label, value| match label {
        Some(label) => info!(label, %value, "log"),
        None => info!(%value, "log"),
    })
}

#[derive(Clone)]
struct Settings {
    machine: Machine,
    config: Config,
    services: Arc<Services>,
    clock: Arc<dyn Clock>,
    logger: LogSink,
}

/// Address of the interpreter that invoked this one.
struct ParentLink {
    id: String,
    generation: u64,
    deliver: Deliver,
}

impl ParentLink {
    fn send(&self, event: Event) {
        (self.deliver)(Envelope {
            event,
            origin: Origin::Service {
                id: self.id.clone(),
                generation: self.generation,
            },
        });
    }
}

/// A scheduled delayed send.
struct PendingSend {
    generation: u64,
    handle: TimerHandle,
    to: SendTarget,
}

struct Shared {
    id: String,
    settings: RwLock<Settings>,
    parent: Option<ParentLink>,
    status: Mutex<Status>,
    state: Mutex<Option<State>>,
    resume: Mutex<Option<PersistedState>>,
    start_error: Mutex<Option<CoreError>>,
    mailbox: Mailbox,
    registry: ServiceRegistry,
    timers: DashMap<String, PendingSend>,
    timer_generation: AtomicU64,
    listeners: Arc<Listeners<State>>,
    done_listeners: Arc<Listeners<Event>>,
    diagnostics: Arc<Listeners<Diagnostic>>,
}

/// Handle to a running statechart. Clones share the same interpreter.
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
}

impl Interpreter {
    pub fn new(machine: Machine) -> Self {
        let id = format!("{}:{}", machine.id(), uuid::Uuid::new_v4());
        Self::build(machine, id, None, Listeners::new())
    }

    fn build(
        machine: Machine,
        id: String,
        parent: Option<ParentLink>,
        diagnostics: Arc<Listeners<Diagnostic>>,
    ) -> Self {
        let settings = Settings {
            machine,
            config: Config::default(),
            services: Arc::new(Services::default()),
            clock: Arc::new(TokioClock::new()),
            logger: tracing_sink(),
        };
        Self {
            shared: Arc::new(Shared {
                id,
                settings: RwLock::new(settings),
                parent,
                status: Mutex::new(Status::NotStarted),
                state: Mutex::new(None),
                resume: Mutex::new(None),
                start_error: Mutex::new(None),
                mailbox: Mailbox::new(),
                registry: ServiceRegistry::new(),
                timers: DashMap::new(),
                timer_generation: AtomicU64::new(0),
                listeners: Listeners::new(),
                done_listeners: Listeners::new(),
                diagnostics,
            }),
        }
    }

    fn configure(self, f: impl FnOnce(&mut Settings)) -> Self {
        f(&mut self.shared.settings.write());
        self
    }

    /// Applies runtime configuration; the microstep bound overrides the
    /// machine's own.
    pub fn with_config(self, config: Config) -> Self {
        self.configure(|s| {
            s.machine = s
                .machine
                .clone()
                .with_max_microsteps(config.interpreter.max_microsteps);
            s.config = config;
        })
    }

    pub fn with_services(self, services: Services) -> Self {
        self.configure(|s| s.services = Arc::new(services))
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.configure(|s| s.clock = clock)
    }

    pub fn with_logger(self, logger: impl Fn(Option<&str>, &Value) + Send + Sync + 'static) -> Self {
        self.configure(|s| s.logger = Arc::new(logger))
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn status(&self) -> Status {
        *self.shared.status.lock()
    }

    /// Latest published snapshot.
    pub fn state(&self) -> Option<State> {
        self.shared.state.lock().clone()
    }

    pub fn machine(&self) -> Machine {
        self.shared.settings.read().machine.clone()
    }

    /// Ids of the live invocations.
    pub fn services(&self) -> Vec<String> {
        self.shared.registry.ids()
    }

    /// Live service for an invocation id.
    pub fn service(&self, id: &str) -> Option<Service> {
        self.shared.registry.get(id)
    }

    fn settings(&self) -> Settings {
        self.shared.settings.read().clone()
    }

    /// Registers a listener for every published snapshot. A running
    /// interpreter calls it once right away with the current snapshot.
    pub fn subscribe(&self, listener: impl Fn(&State) + Send + Sync + 'static) -> Subscription {
        let listener = Arc::new(listener);
        let registered = Arc::clone(&listener);
        let subscription = self.shared.listeners.subscribe(move |state| registered(state));
        if self.status() == Status::Running {
            if let Some(state) = self.state() {
                listener(&state);
            }
        }
        subscription
    }

    /// Registers a listener for reaching a top-level final state. It receives
    /// `done.state.<machine id>` carrying the done data.
    ///
    /// Returns the subscription rather than `self` so the listener can be removed.
    pub fn on_done(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.shared.done_listeners.subscribe(listener)
    }

    /// Registers a listener for non-fatal problems. Diagnostic listeners
    /// survive `stop()`.
    pub fn on_diagnostic(
        &self,
        listener: impl Fn(&Diagnostic) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.diagnostics.subscribe(listener)
    }

    /// Enters the initial configuration and processes everything queued.
    ///
    /// Configuration errors (such as an unbounded eventless chain) are
    /// returned; starting twice is only reported as a diagnostic.
    pub fn start(&self) -> Result<&Self, RuntimeError> {
        {
            let mut status = self.shared.status.lock();
            if *status != Status::NotStarted {
                drop(status);
                self.diagnose(Diagnostic::AlreadyStarted);
                return Ok(self);
            }
            // Queued before the lock is released, so no sender can see
            // `Running` while the boot marker is still missing.
            self.shared.mailbox.push_front(Envelope {
                event: Event::init(),
                origin: Origin::Start,
            });
            *status = Status::Running;
        }
        self.drain();

        match self.shared.start_error.lock().take() {
            Some(err) => Err(err.into()),
            None => Ok(self),
        }
    }

    /// Starts from a persisted `{value, context}` instead of the initial
    /// state. Invocations of the active states start fresh.
    pub fn start_from(&self, persisted: PersistedState) -> Result<&Self, RuntimeError> {
        *self.shared.resume.lock() = Some(persisted);
        self.start()
    }

    /// Stops the interpreter: cancels timers, stops every live service, drops
    /// queued events and releases state and done listeners. Idempotent.
    pub fn stop(&self) -> &Self {
        {
            let mut status = self.shared.status.lock();
            if *status == Status::Stopped {
                return self;
            }
            *status = Status::Stopped;
        }

        let send_ids: Vec<String> = self.shared.timers.iter().map(|e| e.key().clone()).collect();
        for send_id in send_ids {
            self.cancel_send(&send_id);
        }
        for service in self.shared.registry.take_all() {
            service.stop();
        }
        let dropped = self.shared.mailbox.clear();
        self.shared.listeners.clear();
        self.shared.done_listeners.clear();

        info!(interpreter = %self.shared.id, dropped, "interpreter stopped");
        self
    }

    /// Queues `event` and runs macrosteps unless another caller already is.
    ///
    /// Sending to a stopped interpreter is a no-op reported as a diagnostic.
    pub fn send(&self, event: impl Into<Event>) {
        let event = event.into();
        match self.status() {
            Status::Running => self.enqueue(Envelope::external(event)),
            Status::NotStarted => {
                if self.shared.settings.read().config.interpreter.defer_events {
                    debug!(interpreter = %self.shared.id, event = %event.name, "deferring event until start");
                    self.shared.mailbox.push(Envelope::external(event));
                } else {
                    self.diagnose(Diagnostic::NotStarted { event: event.name });
                }
            }
            Status::Stopped => self.diagnose(Diagnostic::SendAfterStop { event: event.name }),
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        if self.status() != Status::Running {
            debug!(interpreter = %self.shared.id, event = %envelope.event.name, "interpreter not running; event dropped");
            return;
        }
        self.shared.mailbox.push(envelope);
        self.drain();
    }

    /// Mailbox address handed to services, timers and children.
    fn inbox(&self) -> Deliver {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |envelope| {
            if let Some(shared) = shared.upgrade() {
                Interpreter { shared }.enqueue(envelope);
            }
        })
    }

    fn drain(&self) {
        self.shared.mailbox.drain(|envelope| self.handle(envelope));
    }

    fn handle(&self, envelope: Envelope) {
        if self.status() != Status::Running {
            return;
        }
        if envelope.origin == Origin::Start {
            self.boot();
            return;
        }
        match self.admit(&envelope) {
            Some(SendTarget::Myself) => self.macrostep(envelope.event, &envelope.origin),
            Some(target) => self.route(&target, envelope.event),
            None => {
                debug!(
                    interpreter = %self.shared.id,
                    event = %envelope.event.name,
                    origin = ?envelope.origin,
                    "discarding event from a canceled source"
                );
            }
        }
    }

    /// Decides whether a dequeued envelope is still wanted, and where it goes.
    fn admit(&self, envelope: &Envelope) -> Option<SendTarget> {
        match &envelope.origin {
            Origin::Start | Origin::External => Some(SendTarget::Myself),
            Origin::Service { id, generation } => {
                let registry = &self.shared.registry;
                if !registry.is_live(id, *generation) {
                    return None;
                }
                // A completed service is no longer live.
                let name = &envelope.event.name;
                if name.strip_prefix(DONE_INVOKE_PREFIX) == Some(id.as_str())
                    || name.strip_prefix(ERROR_INVOKE_PREFIX) == Some(id.as_str())
                {
                    registry.remove_generation(id, *generation);
                }
                Some(SendTarget::Myself)
            }
            Origin::Timer {
                send_id,
                generation,
            } => self
                .shared
                .timers
                .remove_if(send_id, |_, pending| pending.generation == *generation)
                .map(|(_, pending)| pending.to),
        }
    }

    fn boot(&self) {
        let settings = self.settings();
        let resume = self.shared.resume.lock().take();
        let initial = match &resume {
            Some(persisted) => settings.machine.resolve_state(persisted),
            None => settings.machine.initial_state(),
        };
        match initial {
            Ok(state) => {
                info!(
                    interpreter = %self.shared.id,
                    value = %state.value,
                    resumed = resume.is_some(),
                    "interpreter started"
                );
                self.commit(state, &settings);
            }
            Err(err) => {
                self.fail(&err);
                *self.shared.start_error.lock() = Some(err);
            }
        }
    }

    fn macrostep(&self, event: Event, origin: &Origin) {
        let settings = self.settings();
        let current = match self.state() {
            Some(state) => state,
            None => return,
        };

        // Forwarded children see the event before the parent resolves it.
        for service in self.shared.registry.forwarding() {
            let echo = matches!(origin, Origin::Service { id, .. } if id == service.id());
            if !echo {
                service.deliver(&event);
            }
        }

        match settings.machine.transition(&current, event) {
            Ok(next) => {
                debug!(
                    interpreter = %self.shared.id,
                    event = %next.event.name,
                    value = %next.value,
                    changed = next.changed,
                    "macrostep"
                );
                self.commit(next, &settings);
            }
            Err(err) => self.fail(&err),
        }
    }

    /// A configuration error is fatal for this interpreter.
    fn fail(&self, err: &CoreError) {
        error!(interpreter = %self.shared.id, code = err.error_code(), error = %err, "configuration error");
        self.diagnose(Diagnostic::ConfigurationError {
            reason: err.to_string(),
        });
        self.stop();
    }

    fn commit(&self, state: State, settings: &Settings) {
        *self.shared.state.lock() = Some(state.clone());
        self.execute(&state, settings);
        if self.status() != Status::Running {
            return;
        }
        self.shared.listeners.notify(&state);
        if state.done {
            self.complete(&state, settings);
        }
    }

    /// Runs the snapshot's actions in order. Invocations start last, after
    /// every stop, and only if their owner is still active.
    fn execute(&self, state: &State, settings: &Settings) {
        for action in &state.actions {
            if self.status() != Status::Running {
                return;
            }
            match &action.kind {
                ActionKind::Start { .. } => {}
                ActionKind::Exec(exec) => exec(&state.context, &action.event),
                ActionKind::Send(send) => self.dispatch(send, settings),
                ActionKind::Log { expr, label } => {
                    self.log(expr.as_ref(), label.as_deref(), state, action, settings)
                }
                ActionKind::Cancel { send_id } => self.cancel_send(send_id),
                ActionKind::Stop { id } => {
                    if let Some(service) = self.shared.registry.remove(id) {
                        service.stop();
                    }
                }
                ActionKind::Unresolved { reason } => {
                    self.diagnose(Diagnostic::UnresolvedAction {
                        action_type: action.action_type.clone(),
                        reason: reason.clone(),
                    })
                }
            }
        }

        for (i, action) in state.actions.iter().enumerate() {
            let (invoke, data) = match &action.kind {
                ActionKind::Start { invoke, data } => (invoke, data),
                _ => continue,
            };
            if self.status() != Status::Running {
                return;
            }
            let stopped_later = state.actions[i + 1..]
                .iter()
                .any(|a| matches!(&a.kind, ActionKind::Stop { id } if *id == invoke.id));
            if stopped_later || !state.is_active(invoke.owner) {
                debug!(service = %invoke.id, "invocation exited in the same macrostep; not started");
                continue;
            }
            self.start_service(invoke, data.clone(), state, action, settings);
        }
    }

    fn log(
        &self,
        expr: Option<&ValueExpr>,
        label: Option<&str>,
        state: &State,
        action: &ActionObject,
        settings: &Settings,
    ) {
        let value = match expr {
            Some(expr) => match settings.machine.eval_expr(expr, &state.context, &action.event) {
                Ok(value) => value,
                Err(reason) => {
                    warn!(interpreter = %self.shared.id, label, %reason, "log expression failed");
                    return;
                }
            },
            None => json!({ "context": state.context, "event": action.event }),
        };
        (settings.logger)(label, &value);
    }

    fn dispatch(&self, send: &SendAction, settings: &Settings) {
        match send.delay {
            Some(delay) if !delay.is_zero() => {
                let send_id = send
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("send-{}", uuid::Uuid::new_v4()));
                let generation = self.shared.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let deliver = self.inbox();
                let event = send.event.clone();
                let origin = Origin::Timer {
                    send_id: send_id.clone(),
                    generation,
                };
                let handle = settings.clock.schedule(
                    delay,
                    Box::new(move || deliver(Envelope { event, origin })),
                );
                if handle.is_cancelled() {
                    // The clock could not arm the timer.
                    if let Some((_, previous)) = self.shared.timers.remove(&send_id) {
                        previous.handle.cancel();
                    }
                    self.diagnose(Diagnostic::TimerUnavailable { send_id });
                    return;
                }
                let previous = self.shared.timers.insert(
                    send_id.clone(),
                    PendingSend {
                        generation,
                        handle,
                        to: send.to.clone(),
                    },
                );
                if let Some(previous) = previous {
                    previous.handle.cancel();
                }
                debug!(
                    interpreter = %self.shared.id,
                    send_id = %send_id,
                    event = %send.event.name,
                    delay_ms = delay.as_millis() as u64,
                    "scheduled send"
                );
            }
            _ => self.route(&send.to, send.event.clone()),
        }
    }

    /// Delivers to a queue right away. Sends to self land at the back of the
    /// external queue, so they run in a later macrostep.
    fn route(&self, to: &SendTarget, event: Event) {
        match to {
            SendTarget::Myself => self.shared.mailbox.push(Envelope::external(event)),
            SendTarget::Parent => match &self.shared.parent {
                Some(parent) => parent.send(event),
                None => self.diagnose(Diagnostic::UnknownTarget {
                    target: PARENT_TARGET.to_string(),
                    event: event.name,
                }),
            },
            SendTarget::Child(id) => match self.shared.registry.get(id) {
                Some(service) => service.deliver(&event),
                None => self.diagnose(Diagnostic::UnknownTarget {
                    target: id.clone(),
                    event: event.name,
                }),
            },
        }
    }

    fn cancel_send(&self, send_id: &str) {
        if let Some((_, pending)) = self.shared.timers.remove(send_id) {
            pending.handle.cancel();
            debug!(interpreter = %self.shared.id, send_id, "canceled send");
        }
    }

    fn start_service(
        &self,
        invoke: &InvokeDef,
        data: Option<Value>,
        state: &State,
        action: &ActionObject,
        settings: &Settings,
    ) {
        let source = match settings.services.get(&invoke.src) {
            Some(source) => source.clone(),
            None => {
                self.diagnose(Diagnostic::UnknownService {
                    id: invoke.id.clone(),
                    src: invoke.src.clone(),
                });
                return;
            }
        };
        let registry = &self.shared.registry;
        let generation = registry.next_generation();
        // Invocation data stands in for the context handed to factories.
        let input = data.clone().unwrap_or_else(|| state.context.clone());

        let service = match source {
            ServiceSource::Machine(machine) => {
                let child = self.spawn_child(invoke, generation, child_machine(&machine, data), settings);
                self.register(Service::machine(
                    &invoke.id,
                    &invoke.src,
                    generation,
                    invoke.forward,
                    child.clone(),
                ));
                if let Err(err) = child.start() {
                    registry.remove_generation(&invoke.id, generation);
                    self.invoke_failed(invoke, err.to_string());
                }
                return;
            }
            ServiceSource::Task(factory) => {
                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime,
                    Err(err) => return self.invoke_failed(invoke, err.to_string()),
                };
                let future = factory(&input, &action.event);
                let deliver = self.inbox();
                let id = invoke.id.clone();
                let task = runtime.spawn(future);
                let abort = task.abort_handle();
                runtime.spawn(async move {
                    let event = match task.await {
                        Ok(Ok(data)) => Event::done_invoke(&id, data),
                        Ok(Err(data)) => Event::error_invoke(&id, data),
                        Err(e) if e.is_panic() => {
                            warn!(service = %id, "task service panicked");
                            Event::error_invoke(&id, json!({ "reason": "panicked" }))
                        }
                        Err(_) => return,
                    };
                    deliver(Envelope {
                        event,
                        origin: Origin::Service { id, generation },
                    });
                });
                Service::task(&invoke.id, &invoke.src, generation, invoke.forward, abort)
            }
            ServiceSource::Callback(factory) => {
                let sender = CallbackSender::new(invoke.id.clone(), generation, self.inbox());
                match factory(sender.clone(), &input, &action.event) {
                    Ok(handle) => Service::callback(
                        &invoke.id,
                        &invoke.src,
                        generation,
                        invoke.forward,
                        &sender,
                        handle,
                    ),
                    Err(data) => {
                        warn!(service = %invoke.id, error = %data, "callback service failed to start");
                        self.shared
                            .mailbox
                            .push(Envelope::external(Event::error_invoke(&invoke.id, data)));
                        return;
                    }
                }
            }
        };
        self.register(service);
    }

    fn register(&self, service: Service) {
        debug!(
            interpreter = %self.shared.id,
            service = %service.id(),
            src = %service.src(),
            generation = service.generation(),
            "service started"
        );
        if let Some(previous) = self.shared.registry.insert(service) {
            previous.stop();
        }
    }

    fn invoke_failed(&self, invoke: &InvokeDef, reason: String) {
        warn!(service = %invoke.id, %reason, "service failed to start");
        self.shared.mailbox.push(Envelope::external(Event::error_invoke(
            &invoke.id,
            json!({ "reason": reason }),
        )));
    }

    fn spawn_child(
        &self,
        invoke: &InvokeDef,
        generation: u64,
        machine: Machine,
        settings: &Settings,
    ) -> Interpreter {
        let parent = ParentLink {
            id: invoke.id.clone(),
            generation,
            deliver: self.inbox(),
        };
        let child = Interpreter::build(
            machine,
            invoke.id.clone(),
            Some(parent),
            Arc::clone(&self.shared.diagnostics),
        );
        let services = Arc::clone(&settings.services);
        let clock = Arc::clone(&settings.clock);
        let logger = Arc::clone(&settings.logger);
        child.with_config(settings.config.clone()).configure(|s| {
            s.services = services;
            s.clock = clock;
            s.logger = logger;
        })
    }

    /// Handles reaching a top-level final state.
    fn complete(&self, state: &State, settings: &Settings) {
        let data = state.done_data.clone().unwrap_or(Value::Null);
        info!(interpreter = %self.shared.id, value = %state.value, "machine done");
        self.shared
            .done_listeners
            .notify(&Event::done_state(settings.machine.id(), data.clone()));
        if let Some(parent) = &self.shared.parent {
            parent.send(Event::done_invoke(&parent.id, data));
        }
        self.stop();
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::ConfigurationError { .. } => {}
            _ => warn!(interpreter = %self.shared.id, code = diagnostic.code(), "{}", diagnostic),
        }
        self.shared.diagnostics.notify(&diagnostic);
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .field("services", &self.shared.registry.len())
            .finish()
    }
}

/// The child machine with invocation data merged over its context.
fn child_machine(machine: &Machine, data: Option<Value>) -> Machine {
    match data {
        Some(Value::Object(fields)) => {
            let context = match machine.context().clone() {
                Value::Object(mut context) => {
                    context.extend(fields);
                    Value::Object(context)
                }
                _ => Value::Object(fields),
            };
            machine.clone().with_context(context)
        }
        Some(other) => machine.clone().with_context(other),
        None => machine.clone(),
    }
}
