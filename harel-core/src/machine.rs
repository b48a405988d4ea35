//! Machines: a compiled definition plus caller-supplied implementations.
//!
//! A [`Machine`] is cheap to clone and immutable; every operation takes a
//! snapshot and returns a new one without side effects.

use crate::action::{ActionDef, ActionFn, Collector, DelayFn, ExprFn, ValueExpr};
use crate::definition::MachineDefinition;
use crate::error::CoreError;
use crate::event::Event;
use crate::guard::GuardFn;
use crate::node::NodeId;
use crate::resolver::{configuration_of, Resolver, DEFAULT_MAX_MICROSTEPS};
use crate::state::{PersistedState, State};
use crate::value::StateValue;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Name → implementation maps for actions, guards, expressions and delays.
#[derive(Clone, Default)]
pub struct Implementations {
    pub actions: HashMap<String, ActionFn>,
    pub guards: HashMap<String, GuardFn>,
    pub exprs: HashMap<String, ExprFn>,
    pub delays: HashMap<String, DelayFn>,
}

impl Implementations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &Event) + Send + Sync + 'static,
    ) -> Self {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn guard(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &Event) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    pub fn expr(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &Event) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.exprs.insert(name.into(), Arc::new(f));
        self
    }

    pub fn delay(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &Event) -> Result<Duration, String> + Send + Sync + 'static,
    ) -> Self {
        self.delays.insert(name.into(), Arc::new(f));
        self
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementations")
            .field("actions", &sorted_keys(&self.actions))
            .field("guards", &sorted_keys(&self.guards))
            .field("exprs", &sorted_keys(&self.exprs))
            .field("delays", &sorted_keys(&self.delays))
            .finish()
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
}

/// A statechart ready to resolve transitions.
#[derive(Clone, Debug)]
pub struct Machine {
    definition: Arc<MachineDefinition>,
    implementations: Arc<Implementations>,
    context: Value,
    max_microsteps: usize,
}

impl Machine {
    pub fn new(definition: MachineDefinition) -> Self {
        Self::from_shared(Arc::new(definition))
    }

    /// Wraps a definition that is already shared with other machines.
    pub fn from_shared(definition: Arc<MachineDefinition>) -> Self {
        let context = definition.context.clone();
        Self {
            definition,
            implementations: Arc::new(Implementations::default()),
            context,
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(Self::new(MachineDefinition::from_json(json)?))
    }

    pub fn with_implementations(mut self, implementations: Implementations) -> Self {
        self.implementations = Arc::new(implementations);
        self
    }

    /// Replaces the initial context.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_microsteps(mut self, limit: usize) -> Self {
        self.max_microsteps = limit.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &MachineDefinition {
        &self.definition
    }

    pub fn shared_definition(&self) -> Arc<MachineDefinition> {
        Arc::clone(&self.definition)
    }

    pub fn implementations(&self) -> &Implementations {
        &self.implementations
    }

    pub fn context(&self) -> &Value {
        &self.context
    }

    pub fn max_microsteps(&self) -> usize {
        self.max_microsteps
    }

    fn resolver(
        &self,
        configuration: &[NodeId],
        history: BTreeMap<NodeId, Vec<NodeId>>,
        context: Value,
    ) -> Resolver<'_> {
        Resolver::new(
            &self.definition,
            &self.implementations,
            self.max_microsteps,
            configuration,
            history,
            context,
        )
    }

    /// Snapshot of the default configuration, with the entry actions of every
    /// initially active state.
    pub fn initial_state(&self) -> Result<State, CoreError> {
        let event = Event::init();
        let mut resolver = self.resolver(&[], BTreeMap::new(), self.context.clone());
        resolver.enter_initial(&event)?;
        let state = resolver.finish(event, None);
        debug!(machine = %self.id(), value = %state.value, "initial state");
        Ok(state)
    }

    /// Resolves `event` against `state`.
    ///
    /// When no transition is enabled the result carries the same value and
    /// context, no actions and `changed == false`.
    pub fn transition(&self, state: &State, event: impl Into<Event>) -> Result<State, CoreError> {
        let event = event.into();
        if state.done {
            return Ok(state.unchanged(event));
        }
        let mut resolver = self.resolver(
            &state.configuration,
            state.history.clone(),
            state.context.clone(),
        );
        if !resolver.external(&event)? {
            return Ok(state.unchanged(event));
        }
        let next = resolver.finish(event, Some(state));
        debug!(
            machine = %self.id(),
            event = %next.event.name,
            value = %next.value,
            actions = next.actions.len(),
            "transition"
        );
        Ok(next)
    }

    /// Resolves `event` from a bare state value, using the machine context.
    pub fn transition_value(
        &self,
        value: &StateValue,
        event: impl Into<Event>,
    ) -> Result<State, CoreError> {
        let state = self.resolve_state(&PersistedState {
            value: value.clone(),
            context: self.context.clone(),
        })?;
        let state = State {
            actions: Vec::new(),
            ..state
        };
        self.transition(&state, event)
    }

    /// Rebuilds a snapshot from its persisted projection.
    ///
    /// The resulting actions restart the invocations and re-arm the delayed
    /// transitions of every active state; no other entry action runs again.
    pub fn resolve_state(&self, persisted: &PersistedState) -> Result<State, CoreError> {
        let configuration = configuration_of(&self.definition, &persisted.value)?;
        let event = Event::init();
        let mut collector = Collector::new(
            &self.definition,
            &self.implementations,
            persisted.context.clone(),
        );
        for node in &configuration {
            let restart: Vec<ActionDef> = self
                .definition
                .node(*node)
                .entry
                .iter()
                .filter(|def| match def {
                    ActionDef::Start(_) => true,
                    ActionDef::Send { id: Some(id), .. } => id.starts_with("harel.after("),
                    _ => false,
                })
                .cloned()
                .collect();
            collector.collect(&restart, &event);
        }

        let resolver = self.resolver(&configuration, BTreeMap::new(), persisted.context.clone());
        let mut state = resolver.finish(event, None);
        state.actions = collector.actions;
        Ok(state)
    }

    /// Evaluates a value expression with this machine's implementations.
    pub fn eval_expr(&self, expr: &ValueExpr, ctx: &Value, event: &Event) -> Result<Value, String> {
        expr.eval(ctx, event, &self.implementations.exprs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, SendTarget};
    use crate::definition::{MachineConfig, StateConfig, TransitionConfig};
    use proptest::prelude::*;
    use serde_json::json;

    fn machine(raw: Value) -> Machine {
        Machine::new(MachineDefinition::from_value(&raw).unwrap())
    }

    fn counter() -> Machine {
        machine(json!({
            "id": "counter",
            "initial": "counting",
            "context": {"count": 0},
            "states": {
                "counting": {
                    "entry": "enterCounting",
                    "exit": "exitCounting",
                    "on": {
                        "INC": {
                            "target": "counting",
                            "actions": ["increment", {"type": "assign", "assignment": {"count": {"expr": "inc"}}}]
                        },
                        "DO_NOTHING": {"internal": true, "actions": "logNothing"}
                    }
                }
            }
        }))
        .with_implementations(Implementations::new().expr("inc", |ctx, _| {
            Ok(json!(ctx["count"].as_i64().unwrap_or(0) + 1))
        }))
    }

    #[test]
    fn test_initial_state_runs_entry_actions() {
        let m = counter();
        let s = m.initial_state().unwrap();
        assert_eq!(s.value, StateValue::from("counting"));
        assert_eq!(s.action_types(), vec!["enterCounting"]);
        assert!(s.event.is_init());
        assert!(!s.done);
    }

    #[test]
    fn test_external_self_transition_exits_and_reenters() {
        let m = counter();
        let s0 = m.initial_state().unwrap();
        let s1 = m.transition(&s0, "INC").unwrap();
        assert_eq!(s1.action_types(), vec!["exitCounting", "increment", "enterCounting"]);
        assert_eq!(s1.context, json!({"count": 1}));
        assert!(s1.changed);
    }

    #[test]
    fn test_internal_targetless_transition_skips_exit_and_entry() {
        let m = counter();
        let s0 = m.initial_state().unwrap();
        let s1 = m.transition(&s0, "DO_NOTHING").unwrap();
        assert_eq!(s1.action_types(), vec!["logNothing"]);
        assert_eq!(s1.value, s0.value);
    }

    #[test]
    fn test_unmatched_event_is_no_op() {
        let m = counter();
        let s0 = m.initial_state().unwrap();
        let s1 = m.transition(&s0, "UNKNOWN").unwrap();
        assert!(s1.actions.is_empty());
        assert!(!s1.changed);
        assert_eq!(s1.value, s0.value);
        assert_eq!(s1.context, s0.context);
    }

    #[test]
    fn test_unresolved_names_do_not_abort() {
        let m = counter();
        let s1 = m.transition(&m.initial_state().unwrap(), "INC").unwrap();
        assert!(s1.actions.iter().all(|a| a.is_unresolved()));
    }

    #[test]
    fn test_nested_exit_transition_entry_order() {
        // Exit set [B, A], own actions [X], entry set [C, D].
        let m = machine(json!({
            "initial": "A",
            "states": {
                "A": {
                    "exit": "A.exit",
                    "states": {"B": {"exit": "B.exit", "on": {"GO": {"target": "#machine.C.D", "actions": "X"}}}}
                },
                "C": {"entry": "C.entry", "states": {"D": {"entry": "D.entry"}}}
            }
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "GO").unwrap();
        assert_eq!(
            s1.action_types(),
            vec!["B.exit", "A.exit", "X", "C.entry", "D.entry"]
        );
        assert!(s1.matches("C.D"));
    }

    fn toggle(action: Value) -> Machine {
        machine(json!({
            "initial": "inactive",
            "states": {
                "inactive": {"on": {"TOGGLE": {"target": "active", "actions": [action]}}},
                "active": {"on": {"TOGGLE": "inactive"}}
            }
        }))
    }

    #[test]
    fn test_raise_is_processed_within_the_same_step() {
        let m = toggle(json!({"type": "raise", "event": "TOGGLE"}));
        let s1 = m.transition(&m.initial_state().unwrap(), "TOGGLE").unwrap();
        assert_eq!(s1.value, StateValue::from("inactive"));
        assert!(s1.actions.is_empty());
    }

    #[test]
    fn test_send_is_deferred() {
        let m = toggle(json!({"type": "send", "event": "TOGGLE"}));
        let s1 = m.transition(&m.initial_state().unwrap(), "TOGGLE").unwrap();
        assert_eq!(s1.value, StateValue::from("active"));
        assert_eq!(s1.action_types(), vec!["harel.send"]);
        match &s1.actions[0].kind {
            ActionKind::Send(send) => {
                assert_eq!(send.event, Event::new("TOGGLE"));
                assert_eq!(send.to, SendTarget::Myself);
                assert!(send.delay.is_none());
            }
            other => panic!("expected send, got {:?}", other),
        }
    }

    #[test]
    fn test_assigns_apply_in_order() {
        let m = machine(json!({
            "context": {"n": 1},
            "states": {
                "a": {"on": {"GO": {"actions": [
                    {"type": "assign", "assignment": {"n": {"expr": "double"}}},
                    {"type": "assign", "assignment": {"n": {"expr": "double"}, "prev": {"path": "ctx.n"}}}
                ], "internal": true}}}
            }
        }))
        .with_implementations(Implementations::new().expr("double", |ctx, _| {
            Ok(json!(ctx["n"].as_i64().unwrap_or(0) * 2))
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "GO").unwrap();
        assert_eq!(s1.context, json!({"n": 4, "prev": 2}));
        assert!(s1.actions.is_empty());
    }

    #[test]
    fn test_guards_pick_first_passing_candidate() {
        let m = machine(json!({
            "context": {"n": 5},
            "states": {
                "idle": {"on": {"CHECK": [
                    {"target": "big", "guard": "ctx.n > 10"},
                    {"target": "medium", "guard": "isMedium"},
                    {"target": "small"}
                ]}},
                "big": {}, "medium": {}, "small": {}
            }
        }))
        .with_implementations(Implementations::new().guard("isMedium", |ctx, _| {
            Ok(ctx["n"].as_i64().unwrap_or(0) >= 5)
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "CHECK").unwrap();
        assert!(s1.matches("medium"));

        let failing = m.clone().with_implementations(
            Implementations::new().guard("isMedium", |_, _| Err("broken".to_string())),
        );
        let s1 = failing.transition(&failing.initial_state().unwrap(), "CHECK").unwrap();
        assert!(s1.matches("small"));
    }

    #[test]
    fn test_deeper_source_wins() {
        let m = machine(json!({
            "initial": "outer",
            "states": {
                "outer": {
                    "on": {"GO": "elsewhere"},
                    "states": {"inner": {"on": {"GO": "sibling"}}, "sibling": {}}
                },
                "elsewhere": {}
            }
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "GO").unwrap();
        assert!(s1.matches("outer.sibling"));
    }

    #[test]
    fn test_eventless_transitions_chain() {
        let m = machine(json!({
            "context": {"ready": true},
            "states": {
                "a": {"on": {"GO": "b"}},
                "b": {"always": {"target": "c", "guard": "ctx.ready"}},
                "c": {"always": [{"target": "d", "actions": "reachedD"}]},
                "d": {}
            }
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "GO").unwrap();
        assert!(s1.matches("d"));
        assert_eq!(s1.action_types(), vec!["reachedD"]);
    }

    #[test]
    fn test_unbounded_eventless_chain_is_a_configuration_error() {
        let m = machine(json!({
            "states": {
                "ping": {"always": "pong"},
                "pong": {"always": "ping"}
            }
        }))
        .with_max_microsteps(16);
        let err = m.initial_state().unwrap_err();
        assert!(matches!(err, CoreError::MicrostepLimitExceeded { limit: 16, .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_parallel_regions_and_done_state() {
        let m = machine(json!({
            "initial": "work",
            "states": {
                "work": {
                    "type": "parallel",
                    "onDone": {"target": "finished", "actions": "allDone"},
                    "states": {
                        "upload": {
                            "initial": "pending",
                            "states": {"pending": {"on": {"UP_OK": "ok"}}, "ok": {"type": "final"}}
                        },
                        "scan": {
                            "initial": "pending",
                            "states": {"pending": {"on": {"SCAN_OK": "ok"}}, "ok": {"type": "final"}}
                        }
                    }
                },
                "finished": {"type": "final", "data": {"value": {"status": "complete"}}}
            }
        }));
        let s0 = m.initial_state().unwrap();
        assert_eq!(
            serde_json::to_value(&s0.value).unwrap(),
            json!({"work": {"scan": "pending", "upload": "pending"}})
        );

        let s1 = m.transition(&s0, "UP_OK").unwrap();
        assert!(s1.matches("work.upload.ok"));
        assert!(s1.matches("work.scan.pending"));
        assert!(!s1.done);

        // A region-local event leaves the other region untouched.
        let s2 = m.transition(&s1, "SCAN_OK").unwrap();
        assert!(s2.matches("finished"));
        assert_eq!(s2.action_types(), vec!["allDone"]);
        assert!(s2.done);
        assert_eq!(s2.done_data, Some(json!({"status": "complete"})));

        let s3 = m.transition(&s2, "UP_OK").unwrap();
        assert!(!s3.changed);
    }

    #[test]
    fn test_compound_done_event_carries_data() {
        let m = machine(json!({
            "initial": "job",
            "states": {
                "job": {
                    "onDone": {"target": "report", "actions": "record"},
                    "states": {"run": {"on": {"END": "end"}}, "end": {"type": "final", "data": {"code": {"value": 7}}}}
                },
                "report": {}
            }
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "END").unwrap();
        assert!(s1.matches("report"));
        let record = &s1.actions[0];
        assert_eq!(record.event, Event::done_state("machine.job", json!({"code": 7})));
    }

    #[test]
    fn test_history_restores_previous_child() {
        let m = machine(json!({
            "initial": "player",
            "states": {
                "player": {
                    "initial": "one",
                    "on": {"POWER": "off"},
                    "states": {
                        "one": {"on": {"NEXT": "two"}},
                        "two": {},
                        "hist": {"type": "history"}
                    }
                },
                "off": {"on": {"POWER": "player.hist"}}
            }
        }));
        let s = m.initial_state().unwrap();
        let s = m.transition(&s, "NEXT").unwrap();
        let s = m.transition(&s, "POWER").unwrap();
        assert!(s.matches("off"));
        let s = m.transition(&s, "POWER").unwrap();
        assert!(s.matches("player.two"));
    }

    #[test]
    fn test_deep_history_restores_nested_leaf() {
        let m = machine(json!({
            "initial": "p",
            "states": {
                "p": {
                    "initial": "a",
                    "on": {"LEAVE": "out"},
                    "states": {
                        "a": {
                            "initial": "a1",
                            "states": {"a1": {"on": {"STEP": "a2"}}, "a2": {}}
                        },
                        "b": {},
                        "hist": {"type": "history", "history": "deep"}
                    }
                },
                "out": {"on": {"BACK": "p.hist"}}
            }
        }));
        let s = m.initial_state().unwrap();
        let s = m.transition(&s, "STEP").unwrap();
        assert!(s.matches("p.a.a2"));
        let s = m.transition(&s, "LEAVE").unwrap();
        assert!(s.matches("out"));
        let s = m.transition(&s, "BACK").unwrap();
        assert!(s.matches("p.a.a2"));
    }

    #[test]
    fn test_untouched_parallel_region_is_not_exited_or_entered() {
        let m = machine(json!({
            "initial": "par",
            "states": {
                "par": {
                    "type": "parallel",
                    "states": {
                        "left": {
                            "initial": "x",
                            "states": {
                                "x": {"exit": "exitX", "on": {"GO": "y"}},
                                "y": {"entry": "enterY"}
                            }
                        },
                        "right": {
                            "initial": "r",
                            "states": {"r": {"entry": "enterR", "exit": "exitR"}}
                        }
                    }
                }
            }
        }));
        let s0 = m.initial_state().unwrap();
        let s1 = m.transition(&s0, "GO").unwrap();
        assert!(s1.matches("par.left.y"));
        assert!(s1.matches("par.right.r"));
        assert_eq!(s1.action_types(), vec!["exitX", "enterY"]);
    }

    #[test]
    fn test_history_default_without_record() {
        let m = machine(json!({
            "initial": "off",
            "states": {
                "player": {
                    "initial": "one",
                    "states": {"one": {}, "two": {}, "hist": {"type": "history", "target": "two"}}
                },
                "off": {"on": {"POWER": "player.hist"}}
            }
        }));
        let s = m.transition(&m.initial_state().unwrap(), "POWER").unwrap();
        assert!(s.matches("player.two"));
    }

    #[test]
    fn test_after_schedules_and_cancels() {
        let m = machine(json!({
            "initial": "waiting",
            "states": {
                "waiting": {"after": {"1000": "timedOut"}, "on": {"ANSWER": "answered"}},
                "timedOut": {},
                "answered": {}
            }
        }));
        let s0 = m.initial_state().unwrap();
        assert_eq!(s0.action_types(), vec!["harel.send"]);
        let ActionKind::Send(send) = &s0.actions[0].kind else {
            panic!("expected a send");
        };
        assert_eq!(send.delay, Some(Duration::from_millis(1000)));

        let s1 = m.transition(&s0, "ANSWER").unwrap();
        assert_eq!(s1.action_types(), vec!["harel.cancel"]);

        let fired = m.transition(&s0, send.event.clone()).unwrap();
        assert!(fired.matches("timedOut"));
    }

    #[test]
    fn test_invoke_start_and_stop_actions() {
        let m = machine(json!({
            "initial": "loading",
            "states": {
                "loading": {
                    "invoke": {"id": "fetch", "src": "fetchUser", "data": {"user": {"path": "ctx.user"}}},
                    "on": {"CANCEL": "idle"}
                },
                "idle": {}
            }
        }))
        .with_context(json!({"user": 42}));
        let s0 = m.initial_state().unwrap();
        match &s0.actions[0].kind {
            ActionKind::Start { invoke, data } => {
                assert_eq!(invoke.src, "fetchUser");
                assert_eq!(data, &Some(json!({"user": 42})));
            }
            other => panic!("expected start, got {:?}", other),
        }
        let s1 = m.transition(&s0, "CANCEL").unwrap();
        assert_eq!(s1.action_types(), vec!["harel.stop"]);
    }

    #[test]
    fn test_failed_expression_raises_error_execution() {
        let m = machine(json!({
            "states": {
                "a": {"on": {
                    "GO": {"actions": {"type": "assign", "assignment": {"x": {"expr": "missing"}}}},
                    "error.execution": "failed"
                }},
                "failed": {}
            }
        }));
        let s1 = m.transition(&m.initial_state().unwrap(), "GO").unwrap();
        assert!(s1.matches("failed"));
        assert!(s1.actions[0].is_unresolved());
    }

    #[test]
    fn test_transition_value_and_resolve_state() {
        let m = machine(json!({
            "initial": "a",
            "context": {"k": 1},
            "states": {
                "a": {"on": {"GO": "b"}},
                "b": {"initial": "b1", "invoke": {"id": "svc", "src": "svc"}, "states": {"b1": {}, "b2": {}}}
            }
        }));
        let s = m.transition_value(&StateValue::from("a"), "GO").unwrap();
        assert!(s.matches("b.b1"));

        let restored = m
            .resolve_state(&PersistedState {
                value: StateValue::from("b.b2"),
                context: json!({"k": 9}),
            })
            .unwrap();
        assert!(restored.matches("b.b2"));
        assert_eq!(restored.context, json!({"k": 9}));
        assert_eq!(restored.action_types(), vec!["harel.start"]);

        let err = m
            .resolve_state(&PersistedState {
                value: StateValue::from("nope"),
                context: json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateValue { .. }));
    }

    #[test]
    fn test_persist_projection() {
        let m = counter();
        let s = m.transition(&m.initial_state().unwrap(), "INC").unwrap();
        assert_eq!(
            serde_json::to_value(s.persist()).unwrap(),
            json!({"value": "counting", "context": {"count": 1}})
        );
    }

    #[test]
    fn test_inline_actions_from_code() {
        let config = MachineConfig {
            context: json!({}),
            root: StateConfig::new().state(
                "idle",
                StateConfig::new().on(
                    "PING",
                    TransitionConfig::targetless()
                        .internal()
                        .action(ActionDef::inline("pong", |_, _| {})),
                ),
            ),
        };
        let m = Machine::new(MachineDefinition::from_config(config).unwrap());
        let s = m.transition(&m.initial_state().unwrap(), "PING").unwrap();
        assert_eq!(s.action_types(), vec!["pong"]);
        assert!(matches!(s.actions[0].kind, ActionKind::Exec(_)));
    }

    proptest! {
        #[test]
        fn prop_transition_is_pure(events in proptest::collection::vec(
            prop_oneof![Just("INC"), Just("DO_NOTHING"), Just("OTHER")], 0..12
        )) {
            let m = counter();
            let before = m.definition().checksum.clone();
            let mut state = m.initial_state().unwrap();
            for ev in events {
                let a = m.transition(&state, ev).unwrap();
                let b = m.transition(&state, ev).unwrap();
                prop_assert_eq!(&a, &b);
                state = a;
            }
            prop_assert_eq!(m.definition().checksum.clone(), before);
        }

        #[test]
        fn prop_count_tracks_increments(n in 0usize..20) {
            let m = counter();
            let mut state = m.initial_state().unwrap();
            for _ in 0..n {
                state = m.transition(&state, "INC").unwrap();
            }
            prop_assert_eq!(state.context, json!({"count": n}));
        }
    }
}
