//! Run scheduling.
//!
//! The schedule (FIFO queue of one-shot runs plus the periodic table) is owned
//! by a single actor task. A [`Scheduler`] is a cheap cloneable handle that
//! talks to the actor through [`SchedulerCommand`]s with oneshot replies, the
//! same message-passing layout the DAQ manager actor uses.
//!
//! At most one run executes at a time. Due periodic runs are fired first, in
//! ascending prid order; only then is the head of the queue started. While a run
//! executes the actor keeps answering commands, so queries see the executing
//! slot and queue edits take effect immediately.
//!
//! Every change to the queue and the periodic table is mirrored into two
//! [`Notifier`]s (`"queue"` and `"periodic"`) for replication.

mod actor;
pub mod messages;
pub mod policy;
pub mod rpc;

pub use messages::SchedulerCommand;
pub use policy::PeriodicPolicy;
pub use rpc::methods;

use crate::codec::Value;
use crate::sync_struct::Notifier;
use crate::worker::RunExecutor;
use actor::SchedulerActor;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// Id of a one-shot run. Increasing, never reused.
pub type Rid = u64;
/// Id of a periodic run. Smallest id not in use.
pub type Prid = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown run {0}")]
    UnknownRun(Rid),

    #[error("run {0} is executing and cannot be cancelled")]
    RunExecuting(Rid),

    #[error("unknown periodic run {0}")]
    UnknownPeriodic(Prid),

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("scheduler is closed")]
    Closed,
}

/// Seconds since the Unix epoch, as carried on the wire.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1e6
}

/// A queued one-shot run.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub rid: Rid,
    pub run_params: Value,
    pub timeout: Option<Duration>,
}

impl Run {
    /// `(rid, run_params, timeout)`
    pub fn to_value(&self) -> Value {
        Value::tuple(vec![
            Value::from(self.rid),
            self.run_params.clone(),
            Value::from_duration(self.timeout),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicRun {
    pub prid: Prid,
    pub next_run: DateTime<Utc>,
    pub run_params: Value,
    pub timeout: Option<Duration>,
    pub period: Duration,
}

impl PeriodicRun {
    /// `(next_run, run_params, timeout, period)` with times in seconds.
    pub fn to_value(&self) -> Value {
        Value::tuple(vec![
            Value::Float(unix_seconds(self.next_run)),
            self.run_params.clone(),
            Value::from_duration(self.timeout),
            Value::Float(self.period.as_secs_f64()),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOrigin {
    Once(Rid),
    Periodic(Prid),
}

impl RunOrigin {
    fn kind(self) -> &'static str {
        match self {
            RunOrigin::Once(_) => "once",
            RunOrigin::Periodic(_) => "periodic",
        }
    }

    fn id(self) -> u64 {
        match self {
            RunOrigin::Once(rid) => rid,
            RunOrigin::Periodic(prid) => u64::from(prid),
        }
    }
}

/// The run occupying the executing slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutingRun {
    pub origin: RunOrigin,
    pub run_params: Value,
    pub timeout: Option<Duration>,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ExecutingRun {
    pub fn to_value(&self) -> Value {
        Value::map([
            ("origin", Value::from(self.origin.kind())),
            ("id", Value::from(self.origin.id())),
            ("run_params", self.run_params.clone()),
            ("timeout", Value::from_duration(self.timeout)),
            ("elapsed", Value::Float(self.elapsed.as_secs_f64())),
        ])
    }
}

/// Point-in-time copy of the whole schedule.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduleSnapshot {
    pub executing: Option<ExecutingRun>,
    pub queued: Vec<Run>,
    pub periodic: BTreeMap<Prid, PeriodicRun>,
}

impl ScheduleSnapshot {
    pub fn to_value(&self) -> Value {
        let executing = self
            .executing
            .as_ref()
            .map_or(Value::Null, ExecutingRun::to_value);
        let queued = self.queued.iter().map(Run::to_value).collect::<Vec<_>>();
        let periodic = self
            .periodic
            .iter()
            .map(|(prid, run)| (Value::from(*prid), run.to_value()));
        Value::map([
            ("executing", executing),
            ("queued", Value::List(queued)),
            ("periodic", Value::Map(periodic.collect())),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Completed,
    /// The experiment reported a failure; the worker stays usable.
    Failed(String),
    /// The worker broke protocol or timed out and was recycled.
    WorkerFailed(String),
}

/// One finished run, kept in the bounded history.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub origin: RunOrigin,
    pub run_params: Value,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub result: RunResult,
}

impl RunRecord {
    pub fn to_value(&self) -> Value {
        let (status, message) = match &self.result {
            RunResult::Completed => ("completed", Value::Null),
            RunResult::Failed(message) => ("failed", Value::from(message.as_str())),
            RunResult::WorkerFailed(message) => ("worker_failed", Value::from(message.as_str())),
        };
        Value::map([
            ("origin", Value::from(self.origin.kind())),
            ("id", Value::from(self.origin.id())),
            ("run_params", self.run_params.clone()),
            ("started", Value::Float(unix_seconds(self.started))),
            ("finished", Value::Float(unix_seconds(self.finished))),
            ("status", Value::from(status)),
            ("message", message),
        ])
    }
}

/// Source of wall-clock time for scheduling decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `[scheduler]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub periodic_policy: PeriodicPolicy,
    /// Finished runs kept for `get_history`.
    pub history_len: usize,
    /// Capacity of the command channel.
    pub command_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            periodic_policy: PeriodicPolicy::Drift,
            history_len: 32,
            command_capacity: 64,
        }
    }
}

/// The replicated views of the schedule.
#[derive(Debug, Clone)]
pub struct ScheduleStores {
    /// List of queued runs, `(rid, run_params, timeout)` each.
    pub queue: Notifier,
    /// Map `prid -> (next_run, run_params, timeout, period)`.
    pub periodic: Notifier,
}

impl ScheduleStores {
    pub fn new() -> Self {
        Self {
            queue: Notifier::new(Value::List(Vec::new())),
            periodic: Notifier::new(Value::empty_map()),
        }
    }
}

impl Default for ScheduleStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running scheduler actor.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::Sender<SchedulerCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Spawn the scheduler actor on the current tokio runtime.
    pub fn start<E>(executor: E, stores: ScheduleStores, config: &SchedulerConfig) -> Self
    where
        E: RunExecutor + 'static,
    {
        Self::start_with_clock(executor, stores, config, Arc::new(SystemClock))
    }

    pub fn start_with_clock<E>(
        executor: E,
        stores: ScheduleStores,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        E: RunExecutor + 'static,
    {
        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let actor = SchedulerActor::new(executor, command_rx, stores, config, clock);
        let task = tokio::spawn(actor.run());
        Self {
            commands,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn request<T>(
        &self,
        (command, response): (SchedulerCommand, oneshot::Receiver<T>),
    ) -> Result<T, ScheduleError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ScheduleError::Closed)?;
        response.await.map_err(|_| ScheduleError::Closed)
    }

    /// Queue a one-shot run and return its rid.
    pub async fn run_once(
        &self,
        run_params: Value,
        timeout: Option<Duration>,
    ) -> Result<Rid, ScheduleError> {
        self.request(SchedulerCommand::run_once(run_params, timeout))
            .await
    }

    /// Remove a queued run.
    pub async fn cancel_once(&self, rid: Rid) -> Result<(), ScheduleError> {
        self.request(SchedulerCommand::cancel_once(rid)).await?
    }

    /// Add a periodic run, first due immediately.
    pub async fn run_periodic(
        &self,
        run_params: Value,
        timeout: Option<Duration>,
        period: Duration,
    ) -> Result<Prid, ScheduleError> {
        self.request(SchedulerCommand::run_periodic(run_params, timeout, period))
            .await?
    }

    pub async fn cancel_periodic(&self, prid: Prid) -> Result<(), ScheduleError> {
        self.request(SchedulerCommand::cancel_periodic(prid)).await?
    }

    pub async fn get_schedule(&self) -> Result<ScheduleSnapshot, ScheduleError> {
        self.request(SchedulerCommand::get_schedule()).await
    }

    /// Finished runs, oldest first.
    pub async fn get_history(&self) -> Result<Vec<RunRecord>, ScheduleError> {
        self.request(SchedulerCommand::get_history()).await
    }

    /// Stop after the current run, shut the executor down and wait for the actor.
    ///
    /// Safe to call from several handles; later calls return once the actor is gone.
    pub async fn close(&self) {
        // Fails only when the actor has already stopped.
        let _ = self.request(SchedulerCommand::shutdown()).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}
