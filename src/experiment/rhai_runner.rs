//! Reference experiment runner executing Rhai scripts.
//!
//! Run parameters name the script and its arguments:
//!
//! ```text
//! {"file": "scans/ramp.rhai", "arguments": {"steps": 10, "start": 0.5}}
//! ```
//!
//! Each argument becomes a global variable of the script. `print` and `debug`
//! output is routed to the log, since stdout carries the worker protocol.

use super::ExperimentRunner;
use crate::codec::Value;
use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use std::path::PathBuf;
use tracing::{debug, info};

/// Default operation budget for one script execution.
pub const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

pub struct RhaiRunner {
    max_operations: u64,
    base_dir: Option<PathBuf>,
}

impl RhaiRunner {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_OPERATIONS)
    }

    /// A runner that aborts scripts after `max_operations` operations.
    pub fn with_limit(max_operations: u64) -> Self {
        Self {
            max_operations,
            base_dir: None,
        }
    }

    /// Resolve relative script paths against `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn script_path(&self, file: &str) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        }
    }
}

impl Default for RhaiRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExperimentRunner for RhaiRunner {
    async fn run(&mut self, run_params: &Value) -> Result<(), String> {
        let file = run_params
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| "run parameters have no 'file'".to_string())?;
        let path = self.script_path(file);

        let globals = match run_params.get("arguments") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Map(arguments)) => arguments
                .iter()
                .map(|(name, value)| {
                    let name = name
                        .as_str()
                        .ok_or_else(|| format!("argument name {} is not a string", name))?;
                    Ok((name.to_string(), to_dynamic(value)))
                })
                .collect::<Result<Vec<_>, String>>()?,
            Some(other) => {
                return Err(format!("'arguments' must be a map, not {}", other.type_name()))
            }
        };

        let max_operations = self.max_operations;
        info!("Running script {}", path.display());
        // Rhai evaluation is synchronous; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let script = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            let engine = build_engine(max_operations);
            let mut scope = Scope::new();
            for (name, value) in globals {
                scope.push_dynamic(name, value);
            }
            engine
                .run_with_scope(&mut scope, &script)
                .map_err(|e| describe_rhai_error(*e))
        })
        .await
        .map_err(|e| format!("script task failed: {}", e))?
    }
}

fn build_engine(max_operations: u64) -> Engine {
    let mut engine = Engine::new();
    engine.on_progress(move |count| {
        if count > max_operations {
            Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
        } else {
            None
        }
    });
    engine.on_print(|text| info!(target: "experiment", "{}", text));
    engine.on_debug(|text, source, pos| {
        debug!(target: "experiment", "{} @ {:?} {:?}", text, source, pos)
    });
    engine
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Int(i) => Dynamic::from(*i),
        Value::Float(f) => Dynamic::from(*f),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::Tuple(items) | Value::List(items) => {
            Dynamic::from_array(items.iter().map(to_dynamic).collect())
        }
        Value::Map(map) => {
            let map: rhai::Map = map
                .iter()
                .map(|(k, v)| {
                    let key = k.as_str().map_or_else(|| k.to_string(), String::from);
                    (key.into(), to_dynamic(v))
                })
                .collect();
            Dynamic::from_map(map)
        }
        Value::NdArray(array) => Dynamic::from_array(
            array.to_f64_vec().into_iter().map(Dynamic::from).collect(),
        ),
    }
}

fn describe_rhai_error(error: EvalAltResult) -> String {
    match error {
        EvalAltResult::ErrorParsing(parse_error, pos) => {
            format!("syntax error at {}: {}", pos, parse_error)
        }
        EvalAltResult::ErrorRuntime(message, pos) => format!("{} ({})", message, pos),
        EvalAltResult::ErrorTerminated(reason, _) => reason.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn script(source: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file
    }

    fn params(file: &NamedTempFile, arguments: Value) -> Value {
        Value::map([
            ("file", Value::from(file.path().to_string_lossy().as_ref())),
            ("arguments", arguments),
        ])
    }

    #[tokio::test]
    async fn test_arguments_become_globals() {
        let file = script("if steps * 2 != 20 { throw \"bad steps\"; } print(name);");
        let arguments = Value::map([("steps", Value::Int(10)), ("name", Value::from("ramp"))]);
        RhaiRunner::new().run(&params(&file, arguments)).await.unwrap();
    }

    #[tokio::test]
    async fn test_thrown_error_is_reported() {
        let file = script("throw \"hardware not ready\";");
        let err = RhaiRunner::new()
            .run(&params(&file, Value::Null))
            .await
            .unwrap_err();
        assert!(err.contains("hardware not ready"));
    }

    #[tokio::test]
    async fn test_operation_limit() {
        let file = script("let x = 0; loop { x += 1; }");
        let err = RhaiRunner::with_limit(1_000)
            .run(&params(&file, Value::Null))
            .await
            .unwrap_err();
        assert!(err.contains("Safety limit exceeded"));
    }

    #[tokio::test]
    async fn test_missing_file_parameter() {
        let err = RhaiRunner::new().run(&Value::empty_map()).await.unwrap_err();
        assert!(err.contains("file"));
    }
}
