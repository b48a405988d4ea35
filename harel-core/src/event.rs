//! Events.
//!
//! An event is a name plus an arbitrary JSON payload. Externally it has the
//! shape `{"type": name, ...payload}`; a bare string is sugar for an event
//! with no payload.

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Name of the event that produces the initial snapshot.
pub const INIT: &str = "harel.init";
/// Descriptor used for eventless (`always`) transitions.
pub const EVENTLESS: &str = "";
/// Descriptor matching any named event.
pub const WILDCARD: &str = "*";
/// Raised internally when a built-in action expression fails.
pub const ERROR_EXECUTION: &str = "error.execution";

pub const DONE_INVOKE_PREFIX: &str = "done.invoke.";
pub const ERROR_INVOKE_PREFIX: &str = "error.invoke.";
pub const DONE_STATE_PREFIX: &str = "done.state.";

/// An event delivered to a machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn init() -> Self {
        Self::new(INIT)
    }

    /// Completion event of the invocation `id`.
    pub fn done_invoke(id: &str, data: Value) -> Self {
        Self::with_data(format!("{}{}", DONE_INVOKE_PREFIX, id), data)
    }

    /// Failure event of the invocation `id`.
    pub fn error_invoke(id: &str, data: Value) -> Self {
        Self::with_data(format!("{}{}", ERROR_INVOKE_PREFIX, id), data)
    }

    /// Completion event of the compound or parallel state `id`.
    pub fn done_state(id: &str, data: Value) -> Self {
        Self::with_data(format!("{}{}", DONE_STATE_PREFIX, id), data)
    }

    pub fn is_init(&self) -> bool {
        self.name == INIT
    }

    /// Returns true if the name sits in one of the synthesized namespaces.
    pub fn is_reserved(name: &str) -> bool {
        name.starts_with(DONE_INVOKE_PREFIX)
            || name.starts_with(ERROR_INVOKE_PREFIX)
            || name.starts_with(DONE_STATE_PREFIX)
            || name == INIT
    }

    /// Returns whether a transition descriptor matches this event.
    ///
    /// `*` matches every named event, `foo.*` matches `foo` and any event in
    /// the `foo.` namespace.
    pub fn matches_descriptor(&self, descriptor: &str) -> bool {
        if descriptor == WILDCARD {
            return !self.name.is_empty();
        }
        if let Some(prefix) = descriptor.strip_suffix(".*") {
            return self.name == prefix
                || (self.name.starts_with(prefix)
                    && self.name[prefix.len()..].starts_with('.'));
        }
        descriptor == self.name
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::new(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.name)?;
        match &self.data {
            Value::Null => {}
            Value::Object(fields) => {
                for (k, v) in fields {
                    if k != "type" {
                        map.serialize_entry(k, v)?;
                    }
                }
            }
            other => map.serialize_entry("data", other)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EventVisitor;

        impl<'de> Visitor<'de> for EventVisitor {
            type Value = Event;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an event name or an object with a 'type' field")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Event, E> {
                Ok(Event::new(v))
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Event, M::Error> {
                let mut name = None;
                let mut rest = Map::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    if key == "type" {
                        match value {
                            Value::String(s) => name = Some(s),
                            _ => return Err(de::Error::custom("event 'type' must be a string")),
                        }
                    } else {
                        rest.insert(key, value);
                    }
                }
                let name = name.ok_or_else(|| de::Error::missing_field("type"))?;
                let data = if rest.is_empty() {
                    Value::Null
                } else if rest.len() == 1 && rest.get("data").is_some_and(|d| !d.is_object()) {
                    rest.remove("data").unwrap_or(Value::Null)
                } else {
                    Value::Object(rest)
                };
                Ok(Event { name, data })
            }
        }

        deserializer.deserialize_any(EventVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_name_sugar() {
        let ev: Event = serde_json::from_value(json!("TOGGLE")).unwrap();
        assert_eq!(ev, Event::new("TOGGLE"));
        assert_eq!(Event::from("TOGGLE"), ev);
    }

    #[test]
    fn test_payload_is_flattened() {
        let ev: Event = serde_json::from_value(json!({"type": "INC", "by": 2})).unwrap();
        assert_eq!(ev.name, "INC");
        assert_eq!(ev.data, json!({"by": 2}));
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "INC", "by": 2})
        );
    }

    #[test]
    fn test_scalar_payload_uses_data_key() {
        let ev = Event::done_invoke("fetch", json!(42));
        assert_eq!(ev.name, "done.invoke.fetch");
        let wire = serde_json::to_value(&ev).unwrap();
        assert_eq!(wire, json!({"type": "done.invoke.fetch", "data": 42}));
        let back: Event = serde_json::from_value(wire).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_missing_type_is_rejected() {
        assert!(serde_json::from_value::<Event>(json!({"by": 2})).is_err());
        assert!(serde_json::from_value::<Event>(json!({"type": 3})).is_err());
    }

    #[test]
    fn test_descriptor_matching() {
        let ev = Event::new("error.invoke.fetch");
        assert!(ev.matches_descriptor("error.invoke.fetch"));
        assert!(ev.matches_descriptor("*"));
        assert!(ev.matches_descriptor("error.*"));
        assert!(ev.matches_descriptor("error.invoke.*"));
        assert!(!ev.matches_descriptor("err.*"));
        assert!(!ev.matches_descriptor("error.invoke"));
        assert!(!Event::new(EVENTLESS).matches_descriptor("*"));
    }

    #[test]
    fn test_reserved_namespaces() {
        assert!(Event::is_reserved("done.state.machine.a"));
        assert!(Event::is_reserved("harel.init"));
        assert!(!Event::is_reserved("done"));
    }
}
