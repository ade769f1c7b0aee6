//! Named experiment parameters, replicated as the `"parameters"` store.
//!
//! The database is a map from parameter name to value. When a path is
//! configured the whole map is written back after every change, encoded the
//! same way it travels on the wire.
//!
//! A change is applied and published before it is written. If the write fails
//! the caller gets the error, but the change stays in memory and the next
//! successful save carries it to disk.

use crate::codec::{decode, encode, Value};
use crate::error::{AppResult, DaqError};
use crate::rpc::{Arguments, CallError, MethodTable};
use crate::sync_struct::{Notifier, StoreError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ParameterDb {
    store: Notifier,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl ParameterDb {
    /// An empty database that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            store: Notifier::new(Value::empty_map()),
            path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Open the database backed by `path`. A missing file gives an empty database.
    pub fn load(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let value = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let value = decode(text.trim())?;
            validate_contents(&value)?;
            value
        } else {
            debug!("Parameter file {} does not exist yet", path.display());
            Value::empty_map()
        };
        let count = value.as_map().map_or(0, |map| map.len());
        info!("Loaded {} parameters from {}", count, path.display());
        Ok(Self {
            store: Notifier::new(value),
            path: Some(path),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The notifier to publish.
    pub fn notifier(&self) -> &Notifier {
        &self.store
    }

    pub fn get(&self, name: &str) -> Result<Value, StoreError> {
        self.store.index(name).read()
    }

    /// Set a parameter and save.
    pub fn set(&self, name: &str, value: Value) -> AppResult<()> {
        self.store.set(name, value)?;
        self.save()
    }

    /// Remove a parameter, save, and return its last value.
    pub fn delete(&self, name: &str) -> AppResult<Value> {
        let value = self.store.remove(name)?;
        self.save()?;
        Ok(value)
    }

    /// Parameter names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.store.with_root_locked(|root| {
            root.as_map()
                .map(|map| map.keys().filter_map(|k| k.as_str().map(String::from)).collect())
                .unwrap_or_default()
        })
    }

    /// Write the database to its file, if it has one, replacing it atomically.
    pub fn save(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock();
        let mut text = encode(&self.store.read_root());
        text.push('\n');
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved parameters to {}", path.display());
        Ok(())
    }

    /// [`save`](Self::save) on the blocking pool.
    pub async fn save_in_background(self: Arc<Self>) -> AppResult<()> {
        if self.path.is_none() {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || self.save())
            .await
            .map_err(|e| DaqError::Task(format!("parameter save failed: {}", e)))?
    }
}

fn validate_contents(value: &Value) -> AppResult<()> {
    let map = value.as_map().ok_or_else(|| {
        DaqError::Configuration(format!(
            "parameter file must contain a map, found {}",
            value.type_name()
        ))
    })?;
    if let Some(key) = map.keys().find(|key| key.as_str().is_none()) {
        return Err(DaqError::Configuration(format!(
            "parameter names must be strings, found {}",
            key
        )));
    }
    Ok(())
}

fn call_error(err: DaqError) -> CallError {
    match err {
        DaqError::Store(StoreError::KeyNotFound(name)) => CallError::key_error(name),
        other => CallError::runtime_error(other.to_string()),
    }
}

/// Method table with `get`, `set`, `delete` and `names`.
pub fn methods(db: Arc<ParameterDb>) -> MethodTable {
    let mut table = MethodTable::new();

    let handle = Arc::clone(&db);
    table.register("get", move |args: Arguments| {
        let db = Arc::clone(&handle);
        async move {
            let name = args.string(0, "name")?;
            db.get(name).map_err(|e| call_error(e.into()))
        }
    });

    let handle = Arc::clone(&db);
    table.register("set", move |args: Arguments| {
        let db = Arc::clone(&handle);
        async move {
            let name = args.string(0, "name")?;
            let value = args.required(1, "value")?.clone();
            db.store.set(name, value).map_err(|e| call_error(e.into()))?;
            db.save_in_background().await.map_err(call_error)?;
            Ok::<_, CallError>(Value::Null)
        }
    });

    let handle = Arc::clone(&db);
    table.register("delete", move |args: Arguments| {
        let db = Arc::clone(&handle);
        async move {
            let name = args.string(0, "name")?;
            let value = db.store.remove(name).map_err(|e| call_error(e.into()))?;
            db.save_in_background().await.map_err(call_error)?;
            Ok::<_, CallError>(value)
        }
    });

    table.register("names", move |_args: Arguments| {
        let db = Arc::clone(&db);
        async move {
            let names = db.names().into_iter().map(Value::from).collect();
            Ok::<_, CallError>(Value::List(names))
        }
    });

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_delete() {
        let db = ParameterDb::in_memory();
        db.set("freq", Value::Float(1.5e6)).unwrap();
        db.set("enabled", Value::Bool(true)).unwrap();
        assert_eq!(db.get("freq").unwrap(), Value::Float(1.5e6));
        assert_eq!(db.names(), vec!["enabled".to_string(), "freq".to_string()]);
        assert_eq!(db.delete("enabled").unwrap(), Value::Bool(true));
        assert!(matches!(db.get("enabled"), Err(StoreError::KeyNotFound(_))));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.pyon");
        {
            let db = ParameterDb::load(&path).unwrap();
            assert!(db.names().is_empty());
            db.set("amplitude", Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
        }
        let reloaded = ParameterDb::load(&path).unwrap();
        assert_eq!(
            reloaded.get("amplitude").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_rejects_non_map_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.pyon");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(ParameterDb::load(&path), Err(DaqError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_rpc_set_saves_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.pyon");
        let table = methods(Arc::new(ParameterDb::load(&path).unwrap()));
        table
            .dispatch(
                "set",
                Arguments::positional(vec![Value::from("gain"), Value::Int(3)]),
            )
            .await
            .unwrap();
        let saved = decode(std::fs::read_to_string(&path).unwrap().trim()).unwrap();
        assert_eq!(saved, Value::map([("gain", Value::Int(3))]));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_change_in_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("params.pyon");
        let db = Arc::new(ParameterDb::load(&path).unwrap());
        let table = methods(Arc::clone(&db));

        let err = table
            .dispatch(
                "set",
                Arguments::positional(vec![Value::from("gain"), Value::Int(3)]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, "RuntimeError");
        assert_eq!(db.get("gain").unwrap(), Value::Int(3));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_get_unknown_is_key_error() {
        let table = methods(Arc::new(ParameterDb::in_memory()));
        let err = table
            .dispatch("get", Arguments::positional(vec![Value::from("nope")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "KeyError");
    }
}
