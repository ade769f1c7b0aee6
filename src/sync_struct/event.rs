//! Modification events and the logic that applies them.
//!
//! The same [`apply_at`] routine mutates the master's backing value and every
//! subscriber's replica, so both sides agree on what an event means.

use super::StoreError;
use crate::codec::Value;

/// One structural change to a replicated value.
#[derive(Debug, Clone, PartialEq)]
pub enum ModEvent {
    /// Full current value, sent once when a subscriber attaches.
    Init { value: Value },
    Append { path: Vec<Value>, value: Value },
    Insert { path: Vec<Value>, index: i64, value: Value },
    Pop { path: Vec<Value>, index: i64 },
    SetItem { path: Vec<Value>, key: Value, value: Value },
    DelItem { path: Vec<Value>, key: Value },
}

impl ModEvent {
    /// Wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            ModEvent::Init { .. } => "init",
            ModEvent::Append { .. } => "append",
            ModEvent::Insert { .. } => "insert",
            ModEvent::Pop { .. } => "pop",
            ModEvent::SetItem { .. } => "setitem",
            ModEvent::DelItem { .. } => "delitem",
        }
    }

    /// Keys from the store root to the container this event targets.
    pub fn path(&self) -> &[Value] {
        match self {
            ModEvent::Init { .. } => &[],
            ModEvent::Append { path, .. }
            | ModEvent::Insert { path, .. }
            | ModEvent::Pop { path, .. }
            | ModEvent::SetItem { path, .. }
            | ModEvent::DelItem { path, .. } => path,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut fields: Vec<(&str, Value)> = vec![("action", Value::from(self.action()))];
        if !matches!(self, ModEvent::Init { .. }) {
            fields.push(("path", Value::List(self.path().to_vec())));
        }
        match self {
            ModEvent::Init { value } => fields.push(("struct", value.clone())),
            ModEvent::Append { value, .. } => fields.push(("x", value.clone())),
            ModEvent::Insert { index, value, .. } => {
                fields.push(("i", Value::Int(*index)));
                fields.push(("x", value.clone()));
            }
            ModEvent::Pop { index, .. } => fields.push(("i", Value::Int(*index))),
            ModEvent::SetItem { key, value, .. } => {
                fields.push(("key", key.clone()));
                fields.push(("value", value.clone()));
            }
            ModEvent::DelItem { key, .. } => fields.push(("key", key.clone())),
        }
        Value::map(fields)
    }

    pub fn from_value(value: &Value) -> Result<Self, StoreError> {
        let field = |name: &str| {
            value
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::InvalidEvent(format!("missing field '{}'", name)))
        };
        let index = |name: &str| {
            field(name)?
                .as_int()
                .ok_or_else(|| StoreError::InvalidEvent(format!("field '{}' is not an int", name)))
        };
        let action = field("action")?;
        let action = action
            .as_str()
            .ok_or_else(|| StoreError::InvalidEvent("action is not a string".into()))?;
        if action == "init" {
            return Ok(ModEvent::Init {
                value: field("struct")?,
            });
        }
        let path = match field("path")? {
            Value::List(keys) | Value::Tuple(keys) => keys,
            other => {
                return Err(StoreError::InvalidEvent(format!(
                    "path is a {}, expected a list",
                    other.type_name()
                )))
            }
        };
        match action {
            "append" => Ok(ModEvent::Append {
                path,
                value: field("x")?,
            }),
            "insert" => Ok(ModEvent::Insert {
                path,
                index: index("i")?,
                value: field("x")?,
            }),
            "pop" => Ok(ModEvent::Pop {
                path,
                index: index("i")?,
            }),
            "setitem" => Ok(ModEvent::SetItem {
                path,
                key: field("key")?,
                value: field("value")?,
            }),
            "delitem" => Ok(ModEvent::DelItem {
                path,
                key: field("key")?,
            }),
            other => Err(StoreError::InvalidEvent(format!("unknown action '{}'", other))),
        }
    }
}

/// Apply an event to a replica, resolving its path from the replica root.
pub fn apply_event(target: &mut Value, event: &ModEvent) -> Result<(), StoreError> {
    if let ModEvent::Init { value } = event {
        *target = value.clone();
        return Ok(());
    }
    let node = resolve_mut(target, event.path())?;
    apply_at(node, event).map(|_| ())
}

/// Follow `path` through nested lists, tuples and maps.
pub(crate) fn resolve<'a>(root: &'a Value, path: &[Value]) -> Result<&'a Value, StoreError> {
    path.iter().try_fold(root, |node, key| match node {
        Value::List(items) | Value::Tuple(items) => {
            let index = key_as_index(key)?;
            let slot = normalize_index(index, items.len())?;
            Ok(&items[slot])
        }
        Value::Map(map) => map.get(key).ok_or_else(|| StoreError::KeyNotFound(key.to_string())),
        other => Err(StoreError::WrongContainer {
            op: "index",
            kind: other.type_name(),
        }),
    })
}

pub(crate) fn resolve_mut<'a>(
    root: &'a mut Value,
    path: &[Value],
) -> Result<&'a mut Value, StoreError> {
    path.iter().try_fold(root, |node, key| match node {
        Value::List(items) | Value::Tuple(items) => {
            let index = key_as_index(key)?;
            let slot = normalize_index(index, items.len())?;
            Ok(&mut items[slot])
        }
        Value::Map(map) => map
            .get_mut(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string())),
        other => Err(StoreError::WrongContainer {
            op: "index",
            kind: other.type_name(),
        }),
    })
}

/// Apply the operation of a non-init event to an already resolved node.
///
/// Returns the removed element for `pop`/`delitem`, `Null` otherwise. The node is
/// left untouched when an error is returned.
pub(crate) fn apply_at(node: &mut Value, event: &ModEvent) -> Result<Value, StoreError> {
    match event {
        ModEvent::Init { .. } => Err(StoreError::InvalidEvent(
            "init cannot be applied to a node".into(),
        )),
        ModEvent::Append { value, .. } => {
            list_mut(node, "append")?.push(value.clone());
            Ok(Value::Null)
        }
        ModEvent::Insert { index, value, .. } => {
            let items = list_mut(node, "insert")?;
            let slot = clamp_insert_index(*index, items.len());
            items.insert(slot, value.clone());
            Ok(Value::Null)
        }
        ModEvent::Pop { index, .. } => {
            let items = list_mut(node, "pop")?;
            let slot = normalize_index(*index, items.len())?;
            Ok(items.remove(slot))
        }
        ModEvent::SetItem { key, value, .. } => match node {
            Value::Map(map) => {
                map.insert(key.clone(), value.clone());
                Ok(Value::Null)
            }
            Value::List(items) => {
                let slot = normalize_index(key_as_index(key)?, items.len())?;
                items[slot] = value.clone();
                Ok(Value::Null)
            }
            other => Err(StoreError::WrongContainer {
                op: "setitem",
                kind: other.type_name(),
            }),
        },
        ModEvent::DelItem { key, .. } => match node {
            Value::Map(map) => map
                .remove(key)
                .ok_or_else(|| StoreError::KeyNotFound(key.to_string())),
            Value::List(items) => {
                let slot = normalize_index(key_as_index(key)?, items.len())?;
                Ok(items.remove(slot))
            }
            other => Err(StoreError::WrongContainer {
                op: "delitem",
                kind: other.type_name(),
            }),
        },
    }
}

fn list_mut<'a>(node: &'a mut Value, op: &'static str) -> Result<&'a mut Vec<Value>, StoreError> {
    match node {
        Value::List(items) => Ok(items),
        other => Err(StoreError::WrongContainer {
            op,
            kind: other.type_name(),
        }),
    }
}

fn key_as_index(key: &Value) -> Result<i64, StoreError> {
    key.as_int()
        .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
}

/// Negative indices count from the end.
fn normalize_index(index: i64, len: usize) -> Result<usize, StoreError> {
    let signed_len = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { index + signed_len } else { index };
    if (0..signed_len).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(StoreError::IndexOutOfRange { index, len })
    }
}

/// Out-of-range insert positions clamp to the ends of the list.
fn clamp_insert_index(index: i64, len: usize) -> usize {
    let signed_len = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { index + signed_len } else { index };
    resolved.clamp(0, signed_len) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn list(items: Vec<i64>) -> Value {
        Value::List(items.into_iter().map(Value::Int).collect())
    }

    #[test]
    fn test_event_wire_format() {
        let event = ModEvent::Append {
            path: vec![Value::from("runs")],
            value: Value::Int(3),
        };
        assert_eq!(
            encode(&event.to_value()),
            r#"{"action": "append", "path": ["runs"], "x": 3}"#
        );
        let decoded = ModEvent::from_value(&decode(&encode(&event.to_value())).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_init_wire_format() {
        let event = ModEvent::Init { value: list(vec![1]) };
        assert_eq!(
            encode(&event.to_value()),
            r#"{"action": "init", "struct": [1]}"#
        );
    }

    #[test]
    fn test_apply_list_operations() {
        let mut target = list(vec![1, 2, 3]);
        apply_event(&mut target, &ModEvent::Pop { path: vec![], index: -1 }).unwrap();
        apply_event(&mut target, &ModEvent::Insert { path: vec![], index: 0, value: Value::Int(0) }).unwrap();
        apply_event(&mut target, &ModEvent::Insert { path: vec![], index: 99, value: Value::Int(9) }).unwrap();
        apply_event(&mut target, &ModEvent::SetItem { path: vec![], key: Value::Int(1), value: Value::Int(7) }).unwrap();
        assert_eq!(target, list(vec![0, 7, 2, 9]));
    }

    #[test]
    fn test_apply_nested_path() {
        let mut target = Value::map([("a", Value::map([("b", list(vec![]))]))]);
        let event = ModEvent::Append {
            path: vec![Value::from("a"), Value::from("b")],
            value: Value::Int(5),
        };
        apply_event(&mut target, &event).unwrap();
        assert_eq!(
            resolve(&target, &[Value::from("a"), Value::from("b")]).unwrap(),
            &list(vec![5])
        );
    }

    #[test]
    fn test_errors_leave_target_unchanged() {
        let mut target = list(vec![1]);
        let before = target.clone();
        assert!(matches!(
            apply_event(&mut target, &ModEvent::Pop { path: vec![], index: 4 }),
            Err(StoreError::IndexOutOfRange { index: 4, len: 1 })
        ));
        assert!(matches!(
            apply_event(&mut target, &ModEvent::DelItem { path: vec![], key: Value::from("x") }),
            Err(StoreError::KeyNotFound(_))
        ));
        assert!(matches!(
            apply_event(&mut target, &ModEvent::Append { path: vec![Value::Int(0)], value: Value::Null }),
            Err(StoreError::WrongContainer { op: "append", kind: "int" })
        ));
        assert_eq!(target, before);
    }

    #[test]
    fn test_rejects_unknown_action() {
        let value = decode(r#"{"action": "explode", "path": []}"#).unwrap();
        assert!(matches!(ModEvent::from_value(&value), Err(StoreError::InvalidEvent(_))));
    }
}
