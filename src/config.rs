//! Master configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, or `master.toml` in the working directory if present)
//! 3. environment variables prefixed with `DAQ_MASTER_`, `__` separating sections
//! 4. command-line flags, applied by the binary
//!
//! ```text
//! DAQ_MASTER_NETWORK__BIND=0.0.0.0
//! DAQ_MASTER_WORKER__PROGRAM=/opt/daq/bin/daq-worker
//! DAQ_MASTER_SCHEDULER__PERIODIC_POLICY=fixed_grid
//! ```
//!
//! # Example file
//!
//! ```toml
//! [network]
//! bind = "127.0.0.1"
//! notify_port = 3250
//! control_port = 3251
//!
//! [worker]
//! program = "daq-worker"
//! start_reply_timeout_ms = 2000
//!
//! [scheduler]
//! periodic_policy = "drift"
//! history_len = 64
//!
//! [parameters]
//! path = "parameters.pyon"
//! ```

use crate::error::{AppResult, DaqError};
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File read when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "master.toml";
/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DAQ_MASTER_";

/// Top-level master configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub network: NetworkConfig,
    pub worker: WorkerSection,
    pub scheduler: SchedulerConfig,
    pub parameters: ParametersConfig,
}

/// Listening addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface both servers bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port of the sync_struct publisher (0 picks a free port)
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,
    /// Port of the RPC server (0 picks a free port)
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            notify_port: default_notify_port(),
            control_port: default_control_port(),
        }
    }
}

/// Worker process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_step_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_step_timeout")]
    pub start_reply_timeout_ms: u64,
    #[serde(default = "default_step_timeout")]
    pub term_timeout_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: Vec::new(),
            send_timeout_ms: default_step_timeout(),
            start_reply_timeout_ms: default_step_timeout(),
            term_timeout_ms: default_step_timeout(),
        }
    }
}

/// Parameter database settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParametersConfig {
    /// File the database is loaded from and saved to; in-memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_notify_port() -> u16 {
    3250
}

fn default_control_port() -> u16 {
    3251
}

fn default_worker_program() -> String {
    "daq-worker".to_string()
}

fn default_step_timeout() -> u64 {
    1000
}

impl MasterConfig {
    /// Load defaults, then `path` (or [`DEFAULT_CONFIG_FILE`] if it exists), then
    /// the environment, and validate the result.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = match path {
            Some(path) if !path.exists() => {
                return Err(DaqError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )))
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        let config: Self = Figment::from(Serialized::defaults(MasterConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration semantics
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |message: String| Err(DaqError::Configuration(message));
        if self.worker.program.trim().is_empty() {
            return invalid("worker.program must not be empty".into());
        }
        for (name, value) in [
            ("send_timeout_ms", self.worker.send_timeout_ms),
            ("start_reply_timeout_ms", self.worker.start_reply_timeout_ms),
            ("term_timeout_ms", self.worker.term_timeout_ms),
        ] {
            if value == 0 {
                return invalid(format!("worker.{} must be greater than zero", name));
            }
        }
        let network = &self.network;
        if network.notify_port != 0 && network.notify_port == network.control_port {
            return invalid(format!(
                "network.notify_port and network.control_port are both {}",
                network.notify_port
            ));
        }
        if self.scheduler.command_capacity == 0 {
            return invalid("scheduler.command_capacity must be greater than zero".into());
        }
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            program: self.worker.program.clone(),
            args: self.worker.args.clone(),
            send_timeout: Duration::from_millis(self.worker.send_timeout_ms),
            start_reply_timeout: Duration::from_millis(self.worker.start_reply_timeout_ms),
            term_timeout: Duration::from_millis(self.worker.term_timeout_ms),
        }
    }

    pub fn notify_addr(&self) -> String {
        format!("{}:{}", self.network.bind, self.network.notify_port)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.network.bind, self.network.control_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::PeriodicPolicy;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = MasterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.notify_port, 3250);
        assert_eq!(config.network.control_port, 3251);
        assert_eq!(config.scheduler.history_len, 32);
        assert_eq!(config.worker_config().start_reply_timeout, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(
            &path,
            r#"
            [network]
            notify_port = 4000

            [worker]
            program = "/usr/local/bin/daq-worker"
            start_reply_timeout_ms = 2500

            [scheduler]
            periodic_policy = "fixed_grid"
            "#,
        )
        .unwrap();

        let config = MasterConfig::load(Some(&path)).unwrap();
        assert_eq!(config.network.notify_port, 4000);
        assert_eq!(config.network.control_port, 3251);
        assert_eq!(config.worker.program, "/usr/local/bin/daq-worker");
        assert_eq!(config.worker.send_timeout_ms, 1000);
        assert_eq!(config.scheduler.periodic_policy, PeriodicPolicy::FixedGrid);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "[network]\ncontrol_port = 5000\n").unwrap();

        std::env::set_var("DAQ_MASTER_NETWORK__CONTROL_PORT", "5001");
        let config = MasterConfig::load(Some(&path));
        std::env::remove_var("DAQ_MASTER_NETWORK__CONTROL_PORT");

        assert_eq!(config.unwrap().network.control_port, 5001);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = MasterConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = MasterConfig::default();
        config.worker.term_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = MasterConfig::default();
        config.network.control_port = config.network.notify_port;
        assert!(config.validate().is_err());

        let mut config = MasterConfig::default();
        config.network.notify_port = 0;
        config.network.control_port = 0;
        config.validate().unwrap();

        let mut config = MasterConfig::default();
        config.worker.program = "  ".into();
        assert!(config.validate().is_err());
    }
}
