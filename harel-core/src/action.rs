//! Action descriptors and resolved action objects.
//!
//! Definitions carry [`ActionDef`]s: a name looked up in the caller's
//! implementations, or a built-in descriptor (`send`, `raise`, `log`,
//! `assign`, `sendParent`, `cancel`, `start`, `stop`). Resolution expands
//! them into [`ActionObject`]s in exit/transition/entry order.

use crate::definition::MachineDefinition;
use crate::event::{Event, ERROR_EXECUTION};
use crate::guard;
use crate::machine::Implementations;
use crate::node::InvokeDef;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const SEND: &str = "harel.send";
pub const RAISE: &str = "harel.raise";
pub const LOG: &str = "harel.log";
pub const ASSIGN: &str = "harel.assign";
pub const CANCEL: &str = "harel.cancel";
pub const START: &str = "harel.start";
pub const STOP: &str = "harel.stop";

/// `to` value addressing the parent of an invoked machine.
pub const PARENT_TARGET: &str = "#_parent";

/// Caller-supplied side effect.
pub type ActionFn = Arc<dyn Fn(&Value, &Event) + Send + Sync>;
/// Caller-supplied value expression.
pub type ExprFn = Arc<dyn Fn(&Value, &Event) -> Result<Value, String> + Send + Sync>;
/// Caller-supplied delay expression.
pub type DelayFn = Arc<dyn Fn(&Value, &Event) -> Result<Duration, String> + Send + Sync>;

/// A value computed from `(context, event)`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueExpr {
    /// Literal value.
    Value(Value),
    /// `ctx.a.b` or `event.a` lookup.
    Path(String),
    /// Named expression from the caller's implementations.
    Expr(String),
    /// Inline closure.
    #[serde(skip_deserializing, serialize_with = "serialize_inline")]
    Func(ExprFn),
}

fn serialize_inline<S: Serializer>(_: &ExprFn, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("<inline>")
}

impl ValueExpr {
    pub fn literal(value: Value) -> Self {
        ValueExpr::Value(value)
    }

    pub fn path(path: impl Into<String>) -> Self {
        ValueExpr::Path(path.into())
    }

    pub fn func(f: impl Fn(&Value, &Event) -> Result<Value, String> + Send + Sync + 'static) -> Self {
        ValueExpr::Func(Arc::new(f))
    }

    pub fn eval(
        &self,
        ctx: &Value,
        event: &Event,
        exprs: &HashMap<String, ExprFn>,
    ) -> Result<Value, String> {
        match self {
            ValueExpr::Value(v) => Ok(v.clone()),
            ValueExpr::Path(path) => guard::lookup(ctx, event, path)
                .ok_or_else(|| format!("path '{}' must start with 'ctx' or 'event'", path)),
            ValueExpr::Expr(name) => match exprs.get(name) {
                Some(f) => f(ctx, event),
                None => Err(format!("unknown expression '{}'", name)),
            },
            ValueExpr::Func(f) => f(ctx, event),
        }
    }
}

impl fmt::Debug for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpr::Value(v) => write!(f, "Value({})", v),
            ValueExpr::Path(p) => write!(f, "Path({})", p),
            ValueExpr::Expr(e) => write!(f, "Expr({})", e),
            ValueExpr::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl PartialEq for ValueExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueExpr::Value(a), ValueExpr::Value(b)) => a == b,
            (ValueExpr::Path(a), ValueExpr::Path(b)) => a == b,
            (ValueExpr::Expr(a), ValueExpr::Expr(b)) => a == b,
            (ValueExpr::Func(a), ValueExpr::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Context updater of an `assign`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mapping {
    /// Full replacement of the context.
    Whole(ValueExpr),
    /// Per-field updates, all evaluated against the pre-assign context.
    Fields(BTreeMap<String, ValueExpr>),
}

impl Mapping {
    pub fn apply(
        &self,
        ctx: &Value,
        event: &Event,
        exprs: &HashMap<String, ExprFn>,
    ) -> Result<Value, String> {
        match self {
            Mapping::Whole(expr) => expr.eval(ctx, event, exprs),
            Mapping::Fields(fields) => {
                let mut next = match ctx {
                    Value::Object(map) => map.clone(),
                    Value::Null => Map::new(),
                    other => return Err(format!("cannot assign fields on non-object context {}", other)),
                };
                for (key, expr) in fields {
                    next.insert(key.clone(), expr.eval(ctx, event, exprs)?);
                }
                Ok(Value::Object(next))
            }
        }
    }

    /// Computes a standalone value (done data, invocation data). Field
    /// mappings produce a fresh object instead of updating `ctx`.
    pub fn evaluate(
        &self,
        ctx: &Value,
        event: &Event,
        exprs: &HashMap<String, ExprFn>,
    ) -> Result<Value, String> {
        match self {
            Mapping::Whole(expr) => expr.eval(ctx, event, exprs),
            Mapping::Fields(fields) => fields
                .iter()
                .map(|(key, expr)| Ok((key.clone(), expr.eval(ctx, event, exprs)?)))
                .collect::<Result<Map<String, Value>, String>>()
                .map(Value::Object),
        }
    }
}

/// Event argument of `send`, `raise` and `sendParent`.
#[derive(Clone)]
pub enum EventExpr {
    Static(Event),
    /// Named expression producing `{type, ...}` or a bare name.
    Expr(String),
    Func(ExprFn),
}

impl EventExpr {
    pub fn eval(
        &self,
        ctx: &Value,
        event: &Event,
        exprs: &HashMap<String, ExprFn>,
    ) -> Result<Event, String> {
        let produced = match self {
            EventExpr::Static(ev) => return Ok(ev.clone()),
            EventExpr::Expr(name) => match exprs.get(name) {
                Some(f) => f(ctx, event)?,
                None => return Err(format!("unknown expression '{}'", name)),
            },
            EventExpr::Func(f) => f(ctx, event)?,
        };
        serde_json::from_value(produced).map_err(|e| format!("expression did not produce an event: {}", e))
    }
}

impl From<&str> for EventExpr {
    fn from(name: &str) -> Self {
        EventExpr::Static(Event::new(name))
    }
}

impl From<Event> for EventExpr {
    fn from(event: Event) -> Self {
        EventExpr::Static(event)
    }
}

impl fmt::Debug for EventExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventExpr::Static(ev) => write!(f, "Static({})", ev.name),
            EventExpr::Expr(name) => write!(f, "Expr({})", name),
            EventExpr::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl PartialEq for EventExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EventExpr::Static(a), EventExpr::Static(b)) => a == b,
            (EventExpr::Expr(a), EventExpr::Expr(b)) => a == b,
            (EventExpr::Func(a), EventExpr::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for EventExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventExpr::Static(ev) => ev.serialize(serializer),
            EventExpr::Expr(name) => json!({ "expr": name }).serialize(serializer),
            EventExpr::Func(_) => json!({ "expr": "<inline>" }).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EventExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        if let Some(Value::String(name)) = raw.get("expr") {
            if raw.get("type").is_none() {
                return Ok(EventExpr::Expr(name.clone()));
            }
        }
        Event::deserialize(raw)
            .map(EventExpr::Static)
            .map_err(de::Error::custom)
    }
}

/// Delay of a `send`: milliseconds or a named delay expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delay {
    Millis(u64),
    Named(String),
}

impl Delay {
    /// Parses an `after` key: digits are milliseconds, anything else a name.
    pub fn from_key(key: &str) -> Self {
        key.parse::<u64>()
            .map(Delay::Millis)
            .unwrap_or_else(|_| Delay::Named(key.to_string()))
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Millis(ms) => write!(f, "{}", ms),
            Delay::Named(name) => f.write_str(name),
        }
    }
}

/// An action as declared in a definition.
#[derive(Clone)]
pub enum ActionDef {
    /// Looked up in the caller's action implementations.
    Named(String),
    /// Code-only action with its own implementation.
    Inline { name: String, exec: ActionFn },
    Send {
        event: EventExpr,
        delay: Option<Delay>,
        to: Option<String>,
        id: Option<String>,
    },
    Raise(EventExpr),
    Log {
        expr: Option<ValueExpr>,
        label: Option<String>,
    },
    Assign(Mapping),
    SendParent(EventExpr),
    Cancel(String),
    /// Start the invocation with this id.
    Start(String),
    /// Stop the invocation with this id.
    Stop(String),
}

impl ActionDef {
    pub fn named(name: impl Into<String>) -> Self {
        ActionDef::Named(name.into())
    }

    pub fn inline(
        name: impl Into<String>,
        exec: impl Fn(&Value, &Event) + Send + Sync + 'static,
    ) -> Self {
        ActionDef::Inline {
            name: name.into(),
            exec: Arc::new(exec),
        }
    }

    pub fn send(event: impl Into<EventExpr>) -> Self {
        ActionDef::Send {
            event: event.into(),
            delay: None,
            to: None,
            id: None,
        }
    }

    pub fn send_to(event: impl Into<EventExpr>, to: impl Into<String>) -> Self {
        ActionDef::Send {
            event: event.into(),
            delay: None,
            to: Some(to.into()),
            id: None,
        }
    }

    pub fn send_after(event: impl Into<EventExpr>, millis: u64, id: impl Into<String>) -> Self {
        ActionDef::Send {
            event: event.into(),
            delay: Some(Delay::Millis(millis)),
            to: None,
            id: Some(id.into()),
        }
    }

    pub fn raise(event: impl Into<EventExpr>) -> Self {
        ActionDef::Raise(event.into())
    }

    pub fn send_parent(event: impl Into<EventExpr>) -> Self {
        ActionDef::SendParent(event.into())
    }

    pub fn assign(mapping: Mapping) -> Self {
        ActionDef::Assign(mapping)
    }

    /// `assign` computing the whole new context with a closure.
    pub fn assign_with(
        f: impl Fn(&Value, &Event) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        ActionDef::Assign(Mapping::Whole(ValueExpr::func(f)))
    }

    pub fn log(expr: ValueExpr, label: Option<&str>) -> Self {
        ActionDef::Log {
            expr: Some(expr),
            label: label.map(str::to_string),
        }
    }

    /// Type string the resolved object will carry.
    pub fn action_type(&self) -> &str {
        match self {
            ActionDef::Named(name) | ActionDef::Inline { name, .. } => name,
            ActionDef::Send { .. } | ActionDef::SendParent(_) => SEND,
            ActionDef::Raise(_) => RAISE,
            ActionDef::Log { .. } => LOG,
            ActionDef::Assign(_) => ASSIGN,
            ActionDef::Cancel(_) => CANCEL,
            ActionDef::Start(_) => START,
            ActionDef::Stop(_) => STOP,
        }
    }
}

impl PartialEq for ActionDef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ActionDef::Named(a), ActionDef::Named(b)) => a == b,
            (
                ActionDef::Inline { name: n1, exec: e1 },
                ActionDef::Inline { name: n2, exec: e2 },
            ) => n1 == n2 && Arc::ptr_eq(e1, e2),
            (
                ActionDef::Send { event: e1, delay: d1, to: t1, id: i1 },
                ActionDef::Send { event: e2, delay: d2, to: t2, id: i2 },
            ) => e1 == e2 && d1 == d2 && t1 == t2 && i1 == i2,
            (ActionDef::Raise(a), ActionDef::Raise(b)) => a == b,
            (ActionDef::SendParent(a), ActionDef::SendParent(b)) => a == b,
            (
                ActionDef::Log { expr: e1, label: l1 },
                ActionDef::Log { expr: e2, label: l2 },
            ) => e1 == e2 && l1 == l2,
            (ActionDef::Assign(a), ActionDef::Assign(b)) => a == b,
            (ActionDef::Cancel(a), ActionDef::Cancel(b)) => a == b,
            (ActionDef::Start(a), ActionDef::Start(b)) => a == b,
            (ActionDef::Stop(a), ActionDef::Stop(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for ActionDef {
    fn from(name: &str) -> Self {
        ActionDef::Named(name.to_string())
    }
}

impl fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionDef::Named(name) => write!(f, "Named({})", name),
            ActionDef::Inline { name, .. } => write!(f, "Inline({})", name),
            ActionDef::Send { event, delay, to, id } => f
                .debug_struct("Send")
                .field("event", event)
                .field("delay", delay)
                .field("to", to)
                .field("id", id)
                .finish(),
            ActionDef::Raise(ev) => write!(f, "Raise({:?})", ev),
            ActionDef::Log { expr, label } => write!(f, "Log({:?}, {:?})", expr, label),
            ActionDef::Assign(m) => write!(f, "Assign({:?})", m),
            ActionDef::SendParent(ev) => write!(f, "SendParent({:?})", ev),
            ActionDef::Cancel(id) => write!(f, "Cancel({})", id),
            ActionDef::Start(id) => write!(f, "Start({})", id),
            ActionDef::Stop(id) => write!(f, "Stop({})", id),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    event: EventExpr,
    #[serde(default)]
    delay: Option<Delay>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct EventBody {
    event: EventExpr,
}

#[derive(Deserialize)]
struct LogBody {
    #[serde(default)]
    expr: Option<ValueExpr>,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
struct AssignBody {
    assignment: Mapping,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    send_id: String,
}

#[derive(Deserialize)]
struct IdBody {
    id: String,
}

impl<'de> Deserialize<'de> for ActionDef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        fn body<'de, T: Deserialize<'de>, E: de::Error>(raw: Value, kind: &str) -> Result<T, E> {
            T::deserialize(raw).map_err(|e| E::custom(format!("invalid '{}' action: {}", kind, e)))
        }

        let raw = Value::deserialize(deserializer)?;
        let kind = match &raw {
            Value::String(name) => return Ok(ActionDef::Named(name.clone())),
            Value::Object(map) => match map.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                _ => return Err(de::Error::missing_field("type")),
            },
            _ => return Err(de::Error::custom("action must be a name or an object")),
        };

        let short = kind.strip_prefix("harel.").unwrap_or(&kind);
        Ok(match short {
            "send" => {
                let b = body::<SendBody, D::Error>(raw, short)?;
                ActionDef::Send {
                    event: b.event,
                    delay: b.delay,
                    to: b.to,
                    id: b.id,
                }
            }
            "sendParent" => ActionDef::SendParent(body::<EventBody, D::Error>(raw, short)?.event),
            "raise" => ActionDef::Raise(body::<EventBody, D::Error>(raw, short)?.event),
            "log" => {
                let b = body::<LogBody, D::Error>(raw, short)?;
                ActionDef::Log {
                    expr: b.expr,
                    label: b.label,
                }
            }
            "assign" => ActionDef::Assign(body::<AssignBody, D::Error>(raw, short)?.assignment),
            "cancel" => ActionDef::Cancel(body::<CancelBody, D::Error>(raw, short)?.send_id),
            "start" => ActionDef::Start(body::<IdBody, D::Error>(raw, short)?.id),
            "stop" => ActionDef::Stop(body::<IdBody, D::Error>(raw, short)?.id),
            _ => ActionDef::Named(kind.clone()),
        })
    }
}

impl Serialize for ActionDef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ActionDef::Named(name) | ActionDef::Inline { name, .. } => serializer.serialize_str(name),
            other => {
                let mut map = serializer.serialize_map(None)?;
                match other {
                    ActionDef::Send { event, delay, to, id } => {
                        map.serialize_entry("type", "send")?;
                        map.serialize_entry("event", event)?;
                        if let Some(delay) = delay {
                            map.serialize_entry("delay", delay)?;
                        }
                        if let Some(to) = to {
                            map.serialize_entry("to", to)?;
                        }
                        if let Some(id) = id {
                            map.serialize_entry("id", id)?;
                        }
                    }
                    ActionDef::SendParent(event) => {
                        map.serialize_entry("type", "sendParent")?;
                        map.serialize_entry("event", event)?;
                    }
                    ActionDef::Raise(event) => {
                        map.serialize_entry("type", "raise")?;
                        map.serialize_entry("event", event)?;
                    }
                    ActionDef::Log { expr, label } => {
                        map.serialize_entry("type", "log")?;
                        if let Some(expr) = expr {
                            map.serialize_entry("expr", expr)?;
                        }
                        if let Some(label) = label {
                            map.serialize_entry("label", label)?;
                        }
                    }
                    ActionDef::Assign(mapping) => {
                        map.serialize_entry("type", "assign")?;
                        map.serialize_entry("assignment", mapping)?;
                    }
                    ActionDef::Cancel(id) => {
                        map.serialize_entry("type", "cancel")?;
                        map.serialize_entry("sendId", id)?;
                    }
                    ActionDef::Start(id) => {
                        map.serialize_entry("type", "start")?;
                        map.serialize_entry("id", id)?;
                    }
                    ActionDef::Stop(id) => {
                        map.serialize_entry("type", "stop")?;
                        map.serialize_entry("id", id)?;
                    }
                    ActionDef::Named(_) | ActionDef::Inline { .. } => {}
                }
                map.end()
            }
        }
    }
}

/// Destination of a `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum SendTarget {
    /// The sending interpreter's own external queue.
    Myself,
    /// The interpreter that invoked this one.
    Parent,
    /// A live invocation of the sending interpreter.
    Child(String),
}

impl SendTarget {
    fn parse(to: Option<&str>) -> Self {
        match to {
            None => SendTarget::Myself,
            Some(PARENT_TARGET) => SendTarget::Parent,
            Some(id) => SendTarget::Child(id.trim_start_matches('#').to_string()),
        }
    }
}

/// A fully evaluated `send`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendAction {
    pub event: Event,
    pub to: SendTarget,
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_millis")]
    pub delay: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

mod opt_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }
}

/// What the interpreter has to do for a resolved action.
#[derive(Clone)]
pub enum ActionKind {
    /// Run a caller-supplied implementation.
    Exec(ActionFn),
    Send(SendAction),
    /// Evaluate `expr` against the snapshot and hand it to the log sink.
    Log {
        expr: Option<ValueExpr>,
        label: Option<String>,
    },
    Cancel { send_id: String },
    Start { invoke: InvokeDef, data: Option<Value> },
    Stop { id: String },
    /// A reference that could not be resolved. Reported, never executed.
    Unresolved { reason: String },
}

impl fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Exec(_) => f.write_str("Exec(..)"),
            ActionKind::Send(send) => write!(f, "Send({:?})", send),
            ActionKind::Log { expr, label } => write!(f, "Log({:?}, {:?})", expr, label),
            ActionKind::Cancel { send_id } => write!(f, "Cancel({})", send_id),
            ActionKind::Start { invoke, data } => write!(f, "Start({}, {:?})", invoke.id, data),
            ActionKind::Stop { id } => write!(f, "Stop({})", id),
            ActionKind::Unresolved { reason } => write!(f, "Unresolved({})", reason),
        }
    }
}

impl PartialEq for ActionKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Implementations are identified by the action type.
            (ActionKind::Exec(_), ActionKind::Exec(_)) => true,
            (ActionKind::Send(a), ActionKind::Send(b)) => a == b,
            (
                ActionKind::Log { expr: e1, label: l1 },
                ActionKind::Log { expr: e2, label: l2 },
            ) => e1 == e2 && l1 == l2,
            (ActionKind::Cancel { send_id: a }, ActionKind::Cancel { send_id: b }) => a == b,
            (
                ActionKind::Start { invoke: i1, data: d1 },
                ActionKind::Start { invoke: i2, data: d2 },
            ) => i1 == i2 && d1 == d2,
            (ActionKind::Stop { id: a }, ActionKind::Stop { id: b }) => a == b,
            (ActionKind::Unresolved { reason: a }, ActionKind::Unresolved { reason: b }) => a == b,
            _ => false,
        }
    }
}

/// A resolved action, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionObject {
    pub action_type: String,
    pub kind: ActionKind,
    /// Event that triggered the microstep this action belongs to.
    pub event: Event,
}

impl ActionObject {
    pub fn is_unresolved(&self) -> bool {
        matches!(self.kind, ActionKind::Unresolved { .. })
    }
}

impl Serialize for ActionObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.action_type)?;
        match &self.kind {
            ActionKind::Exec(_) => {}
            ActionKind::Send(send) => {
                map.serialize_entry("event", &send.event)?;
                map.serialize_entry("to", &send.to)?;
                if let Some(delay) = send.delay {
                    map.serialize_entry("delay", &(delay.as_millis() as u64))?;
                }
                if let Some(id) = &send.id {
                    map.serialize_entry("id", id)?;
                }
            }
            ActionKind::Log { label, .. } => {
                if let Some(label) = label {
                    map.serialize_entry("label", label)?;
                }
            }
            ActionKind::Cancel { send_id } => map.serialize_entry("sendId", send_id)?,
            ActionKind::Start { invoke, data } => {
                map.serialize_entry("id", &invoke.id)?;
                map.serialize_entry("src", &invoke.src)?;
                if let Some(data) = data {
                    map.serialize_entry("data", data)?;
                }
            }
            ActionKind::Stop { id } => map.serialize_entry("id", id)?,
            ActionKind::Unresolved { reason } => map.serialize_entry("unresolved", reason)?,
        }
        map.end()
    }
}

/// Expands action descriptors against an evolving context.
///
/// `assign` updates `context` in place of the previous value, `raise` queues
/// onto `raised`; every other descriptor lands in `actions`.
pub(crate) struct Collector<'a> {
    pub definition: &'a MachineDefinition,
    pub imps: &'a Implementations,
    pub context: Value,
    pub raised: Vec<Event>,
    pub actions: Vec<ActionObject>,
}

impl<'a> Collector<'a> {
    pub fn new(definition: &'a MachineDefinition, imps: &'a Implementations, context: Value) -> Self {
        Self {
            definition,
            imps,
            context,
            raised: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn collect(&mut self, defs: &[ActionDef], trigger: &Event) {
        for def in defs {
            self.expand(def, trigger);
        }
    }

    fn expand(&mut self, def: &ActionDef, trigger: &Event) {
        let imps = self.imps;
        let exprs = &imps.exprs;
        let kind = match def {
            ActionDef::Named(name) => match imps.actions.get(name) {
                Some(exec) => ActionKind::Exec(exec.clone()),
                None => ActionKind::Unresolved {
                    reason: format!("no implementation for action '{}'", name),
                },
            },
            ActionDef::Inline { exec, .. } => ActionKind::Exec(exec.clone()),
            ActionDef::Assign(mapping) => {
                match mapping.apply(&self.context, trigger, exprs) {
                    Ok(next) => self.context = next,
                    Err(reason) => self.fail(def, reason, trigger),
                }
                return;
            }
            ActionDef::Raise(event) => {
                match event.eval(&self.context, trigger, exprs) {
                    Ok(ev) => self.raised.push(ev),
                    Err(reason) => self.fail(def, reason, trigger),
                }
                return;
            }
            ActionDef::Send { event, delay, to, id } => {
                match self.eval_send(event, delay.as_ref(), to.as_deref(), id.as_deref(), trigger) {
                    Ok(send) => ActionKind::Send(send),
                    Err(reason) => return self.fail(def, reason, trigger),
                }
            }
            ActionDef::SendParent(event) => {
                match self.eval_send(event, None, Some(PARENT_TARGET), None, trigger) {
                    Ok(send) => ActionKind::Send(send),
                    Err(reason) => return self.fail(def, reason, trigger),
                }
            }
            ActionDef::Log { expr, label } => ActionKind::Log {
                expr: expr.clone(),
                label: label.clone(),
            },
            ActionDef::Cancel(id) => ActionKind::Cancel { send_id: id.clone() },
            ActionDef::Start(id) => match self.definition.invoke(id) {
                Some(invoke) => {
                    let data = match &invoke.data {
                        Some(mapping) => match mapping.evaluate(&self.context, trigger, exprs) {
                            Ok(data) => Some(data),
                            Err(reason) => return self.fail(def, reason, trigger),
                        },
                        None => None,
                    };
                    ActionKind::Start {
                        invoke: invoke.clone(),
                        data,
                    }
                }
                None => ActionKind::Unresolved {
                    reason: format!("unknown invocation '{}'", id),
                },
            },
            ActionDef::Stop(id) => ActionKind::Stop { id: id.clone() },
        };

        self.actions.push(ActionObject {
            action_type: def.action_type().to_string(),
            kind,
            event: trigger.clone(),
        });
    }

    fn eval_send(
        &self,
        event: &EventExpr,
        delay: Option<&Delay>,
        to: Option<&str>,
        id: Option<&str>,
        trigger: &Event,
    ) -> Result<SendAction, String> {
        let event = event.eval(&self.context, trigger, &self.imps.exprs)?;
        let delay = match delay {
            None => None,
            Some(Delay::Millis(ms)) => Some(Duration::from_millis(*ms)),
            Some(Delay::Named(name)) => match self.imps.delays.get(name) {
                Some(f) => Some(f(&self.context, trigger)?),
                None => return Err(format!("unknown delay '{}'", name)),
            },
        };
        Ok(SendAction {
            event,
            to: SendTarget::parse(to),
            delay,
            id: id.map(str::to_string),
        })
    }

    /// Records a failed built-in as unresolved and raises `error.execution`.
    fn fail(&mut self, def: &ActionDef, reason: String, trigger: &Event) {
        warn!(action = def.action_type(), event = %trigger.name, %reason, "action expression failed");
        self.raised.push(Event::with_data(
            ERROR_EXECUTION,
            json!({ "action": def.action_type(), "reason": reason }),
        ));
        self.actions.push(ActionObject {
            action_type: def.action_type().to_string(),
            kind: ActionKind::Unresolved { reason },
            event: trigger.clone(),
        });
    }
}
