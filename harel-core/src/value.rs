//! State values: the address of the active leaves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Active-leaf address of a machine.
///
/// A simple hierarchy is a chain of single-entry branches ending in a leaf
/// (`{"a": {"b": "c"}}` for `a.b.c`). A parallel node maps to a branch with
/// one entry per region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Leaf(String),
    Branch(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Returns true if the dotted path `parent` is active in this value.
    ///
    /// `"a"` matches both `"a"` and `{"a": "b"}`.
    pub fn matches(&self, parent: &str) -> bool {
        let segments: Vec<&str> = parent.split('.').filter(|s| !s.is_empty()).collect();
        self.matches_segments(&segments)
    }

    fn matches_segments(&self, segments: &[&str]) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return true;
        };
        match self {
            StateValue::Leaf(leaf) => rest.is_empty() && leaf == head,
            StateValue::Branch(children) => children
                .get(*head)
                .map(|child| child.matches_segments(rest))
                .unwrap_or(false),
        }
    }

    /// Number of active leaves addressed by this value.
    pub fn leaf_count(&self) -> usize {
        match self {
            StateValue::Leaf(_) => 1,
            StateValue::Branch(children) => children.values().map(StateValue::leaf_count).sum(),
        }
    }

    /// Every dotted leaf path, sorted.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        let join = |key: &str| {
            if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", prefix, key)
            }
        };
        match self {
            StateValue::Leaf(leaf) => out.push(join(leaf)),
            StateValue::Branch(children) => {
                for (key, child) in children {
                    child.collect_paths(&join(key), out);
                }
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(path: &str) -> Self {
        let mut segments: Vec<&str> = path.split('.').collect();
        let leaf = segments.pop().unwrap_or_default();
        segments
            .into_iter()
            .rev()
            .fold(StateValue::Leaf(leaf.to_string()), |inner, key| {
                StateValue::Branch(BTreeMap::from([(key.to_string(), inner)]))
            })
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Leaf(leaf) => f.write_str(leaf),
            StateValue::Branch(_) => f.write_str(&self.leaf_paths().join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_path_parsing() {
        let value = StateValue::from("a.b.c");
        assert_eq!(serde_json::to_value(&value).unwrap(), json!({"a": {"b": "c"}}));
        assert_eq!(StateValue::from("idle"), StateValue::Leaf("idle".into()));
    }

    #[test]
    fn test_matches() {
        let value: StateValue =
            serde_json::from_value(json!({"player": {"track": "playing", "volume": "muted"}}))
                .unwrap();
        assert!(value.matches("player"));
        assert!(value.matches("player.track"));
        assert!(value.matches("player.track.playing"));
        assert!(value.matches("player.volume.muted"));
        assert!(!value.matches("player.track.paused"));
        assert!(!value.matches("player.track.playing.deeper"));
        assert!(!value.matches("stopped"));
        assert_eq!(value.leaf_count(), 2);
    }

    #[test]
    fn test_display_lists_leaf_paths() {
        let value: StateValue = serde_json::from_value(json!({"p": {"a": "x", "b": "y"}})).unwrap();
        assert_eq!(value.to_string(), "p.a.x, p.b.y");
        assert_eq!(StateValue::from("idle").to_string(), "idle");
    }
}
