//! Mutation-tracking handles over a shared value tree.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = Notifier::new(Value::map([("runs", Value::List(vec![]))]));
//! store.set_publish(Some(Arc::new(|event: &ModEvent| println!("{:?}", event))));
//!
//! // Emits {"action": "append", "path": ["runs"], "x": 1}
//! store.index("runs").append(1)?;
//! ```

use super::event::{apply_at, resolve, resolve_mut, ModEvent};
use super::StoreError;
use crate::codec::{Value, MAX_DEPTH};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with every event, inside the root's critical section.
///
/// The callback must not mutate the notifier it is attached to.
pub type PublishFn = Arc<dyn Fn(&ModEvent) + Send + Sync>;

struct Root {
    value: Value,
    publish: Option<PublishFn>,
}

/// A handle addressing one node of a replicated value.
///
/// Cloning or indexing a `Notifier` never copies the backing value: every handle
/// derived from the same root shares its value and publish callback and only
/// differs in `path`. All writes through any handle of one root are serialised
/// by the root's lock, and each write emits its event before the lock is
/// released, so the event order equals the mutation order.
#[derive(Clone)]
pub struct Notifier {
    root: Arc<Mutex<Root>>,
    path: Vec<Value>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("path", &self.path)
            .field("has_publisher", &self.root.lock().publish.is_some())
            .finish()
    }
}

impl Notifier {
    /// Create a new store root around `value`.
    pub fn new(value: Value) -> Self {
        Self {
            root: Arc::new(Mutex::new(Root {
                value,
                publish: None,
            })),
            path: Vec::new(),
        }
    }

    /// A handle for the child at `key`. Does not mutate or publish anything, and
    /// does not check that the child exists until it is used.
    pub fn index(&self, key: impl Into<Value>) -> Notifier {
        let mut path = self.path.clone();
        path.push(key.into());
        Notifier {
            root: Arc::clone(&self.root),
            path,
        }
    }

    /// Keys from the store root to this node.
    pub fn path(&self) -> &[Value] {
        &self.path
    }

    /// Whether two handles address the same store.
    pub fn same_root(&self, other: &Notifier) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Attach (or detach, with `None`) the callback for the whole store.
    pub fn set_publish(&self, publish: Option<PublishFn>) {
        self.root.lock().publish = publish;
    }

    /// Clone of the value at this node.
    pub fn read(&self) -> Result<Value, StoreError> {
        let root = self.root.lock();
        resolve(&root.value, &self.path).cloned()
    }

    /// Clone of the whole store.
    pub fn read_root(&self) -> Value {
        self.root.lock().value.clone()
    }

    /// Run `f` on the store value while holding the lock that orders mutations.
    ///
    /// No event can be emitted while `f` runs, which lets a publisher take a
    /// snapshot and attach a subscriber without losing or duplicating events.
    pub fn with_root_locked<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        let root = self.root.lock();
        f(&root.value)
    }

    pub fn append(&self, value: impl Into<Value>) -> Result<(), StoreError> {
        self.mutate(ModEvent::Append {
            path: self.path.clone(),
            value: value.into(),
        })
        .map(|_| ())
    }

    pub fn insert(&self, index: i64, value: impl Into<Value>) -> Result<(), StoreError> {
        self.mutate(ModEvent::Insert {
            path: self.path.clone(),
            index,
            value: value.into(),
        })
        .map(|_| ())
    }

    /// Remove and return the element at `index` (negative counts from the end).
    pub fn pop(&self, index: i64) -> Result<Value, StoreError> {
        self.mutate(ModEvent::Pop {
            path: self.path.clone(),
            index,
        })
    }

    /// Set `key` in a map, or overwrite an element of a list.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<(), StoreError> {
        self.mutate(ModEvent::SetItem {
            path: self.path.clone(),
            key: key.into(),
            value: value.into(),
        })
        .map(|_| ())
    }

    /// Delete `key` from a map (or an element from a list) and return it.
    pub fn remove(&self, key: impl Into<Value>) -> Result<Value, StoreError> {
        self.mutate(ModEvent::DelItem {
            path: self.path.clone(),
            key: key.into(),
        })
    }

    fn mutate(&self, event: ModEvent) -> Result<Value, StoreError> {
        // Subscribers decode the whole store on attach, so it must stay
        // within the decoder's nesting limit.
        let inserted = match &event {
            ModEvent::Append { value, .. } | ModEvent::Insert { value, .. } => Some(value.depth()),
            ModEvent::SetItem { key, value, .. } => Some(key.depth().max(value.depth())),
            _ => None,
        };
        if inserted.is_some_and(|depth| self.path.len() + 1 + depth > MAX_DEPTH) {
            return Err(StoreError::TooDeep(MAX_DEPTH));
        }

        let mut guard = self.root.lock();
        let Root { value, publish } = &mut *guard;
        let node = resolve_mut(value, &self.path)?;
        let result = apply_at(node, &event)?;
        if let Some(publish) = publish {
            publish(&event);
        }
        Ok(result)
    }
}
