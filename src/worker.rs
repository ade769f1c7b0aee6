//! Supervision of the worker subprocess that executes runs.
//!
//! The master talks to its worker over the child's stdio, one line per message:
//!
//! ```text
//! master -> worker   {"file": "scan.rhai", "arguments": {...}}   (encoded run params)
//! worker -> master   ack
//! worker -> master   {"status": "ok"} | {"status": "failed", "message": "..."}
//! ```
//!
//! Every step is bounded by a timeout. When a step fails the run is reported as
//! [`WorkerError::WorkerFailed`] and the [`RunExecutor`] implementation recycles
//! the process, so one misbehaving run never poisons the next.

use crate::codec::{encode, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Line a worker sends once it has accepted a run request.
pub const ACK: &str = "ack";

/// Errors raised by the worker supervisor.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The current run could not be completed; the process should be recycled.
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("worker process {0:?} is still alive")]
    ProcessAlive(Option<u32>),

    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn failed(message: impl Into<String>) -> WorkerError {
    WorkerError::WorkerFailed(message.into())
}

/// How to launch the worker and how long each protocol step may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub send_timeout: Duration,
    pub start_reply_timeout: Duration,
    pub term_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            send_timeout: Duration::from_secs(1),
            start_reply_timeout: Duration::from_secs(1),
            term_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NoProcess,
    Idle,
    Running,
    Terminating,
    Terminated,
}

/// Result line reported by the worker when a run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Ok,
    Failed { message: String },
}

struct Process {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Owns at most one worker process and runs one request at a time on it.
pub struct Worker {
    config: WorkerConfig,
    process: Option<Process>,
    state: WorkerState,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            process: None,
            state: WorkerState::NoProcess,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// OS id of the live process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    /// Spawn the worker process.
    ///
    /// Fails with [`WorkerError::ProcessAlive`] if a previous process has not
    /// exited yet.
    pub fn create_process(&mut self) -> Result<(), WorkerError> {
        if let Some(process) = self.process.as_mut() {
            match process.child.try_wait() {
                Ok(Some(status)) => debug!("Previous worker exited with {}", status),
                _ => return Err(WorkerError::ProcessAlive(process.child.id())),
            }
            self.process = None;
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failed("worker stdout is not piped"))?;
        info!("Started worker '{}' (pid {:?})", self.config.program, child.id());
        self.process = Some(Process {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });
        self.state = WorkerState::Idle;
        Ok(())
    }

    /// Send one run request and wait for it to finish.
    ///
    /// `timeout` bounds the run itself; `None` waits indefinitely.
    pub async fn run(
        &mut self,
        run_params: &Value,
        run_timeout: Option<Duration>,
    ) -> Result<RunOutcome, WorkerError> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| failed("no worker process"))?;
        self.state = WorkerState::Running;
        let mut request = encode(run_params);
        request.push('\n');
        let result = exchange(process, &self.config, &request, run_timeout).await;
        self.state = WorkerState::Idle;
        result
    }

    /// Stop the worker: close its stdin, ask it to terminate, then kill it if it
    /// is still running after `term_timeout`. Does nothing without a process.
    pub async fn end_process(&mut self) {
        let Some(mut process) = self.process.take() else {
            if self.state != WorkerState::NoProcess {
                self.state = WorkerState::Terminated;
            }
            return;
        };
        self.state = WorkerState::Terminating;
        drop(process.stdin.take());

        match process.child.try_wait() {
            Ok(Some(status)) => debug!("Worker already exited with {}", status),
            _ => {
                request_termination(&mut process.child);
                match timeout(self.config.term_timeout, process.child.wait()).await {
                    Ok(Ok(status)) => debug!("Worker exited with {}", status),
                    Ok(Err(e)) => warn!("Failed to wait for worker: {}", e),
                    Err(_) => {
                        warn!(
                            "Worker did not exit within {:?}, killing it",
                            self.config.term_timeout
                        );
                        if let Err(e) = process.child.kill().await {
                            warn!("Failed to kill worker: {}", e);
                        }
                    }
                }
            }
        }
        self.state = WorkerState::Terminated;
    }
}

async fn exchange(
    process: &mut Process,
    config: &WorkerConfig,
    request: &str,
    run_timeout: Option<Duration>,
) -> Result<RunOutcome, WorkerError> {
    let stdin = process
        .stdin
        .as_mut()
        .ok_or_else(|| failed("worker stdin is closed"))?;
    let send = async {
        stdin.write_all(request.as_bytes()).await?;
        stdin.flush().await
    };
    match timeout(config.send_timeout, send).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(failed(format!("failed to send run request: {}", e))),
        Err(_) => return Err(failed("timed out sending run request")),
    }

    let reply = read_reply(
        &mut process.stdout,
        Some(config.start_reply_timeout),
        "start acknowledgement",
    )
    .await?;
    if reply != ACK {
        return Err(failed(format!("expected '{}', worker replied '{}'", ACK, reply)));
    }

    let reply = read_reply(&mut process.stdout, run_timeout, "run completion").await?;
    serde_json::from_str(&reply)
        .map_err(|e| failed(format!("malformed completion reply '{}': {}", reply, e)))
}

async fn read_reply(
    stdout: &mut BufReader<ChildStdout>,
    limit: Option<Duration>,
    what: &str,
) -> Result<String, WorkerError> {
    let mut line = String::new();
    let read = stdout.read_line(&mut line);
    let read = match limit {
        Some(limit) => timeout(limit, read)
            .await
            .map_err(|_| failed(format!("timed out waiting for {}", what)))?,
        None => read.await,
    };
    let n = read.map_err(|e| failed(format!("failed to read {}: {}", what, e)))?;
    if n == 0 {
        return Err(failed(format!("worker exited before {}", what)));
    }
    Ok(line.trim_end().to_string())
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = child.id().and_then(|pid| i32::try_from(pid).ok());
    match pid {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to worker {}: {}", pid, e);
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop worker: {}", e);
    }
}

/// Something that can execute runs one at a time.
#[async_trait]
pub trait RunExecutor: Send {
    async fn execute(
        &mut self,
        run_params: &Value,
        run_timeout: Option<Duration>,
    ) -> Result<RunOutcome, WorkerError>;

    /// Release any resources; called once when the scheduler closes.
    async fn shutdown(&mut self);
}

#[async_trait]
impl RunExecutor for Worker {
    async fn execute(
        &mut self,
        run_params: &Value,
        run_timeout: Option<Duration>,
    ) -> Result<RunOutcome, WorkerError> {
        if self.process.is_none() {
            self.create_process()?;
        }
        let result = self.run(run_params, run_timeout).await;
        if let Err(e) = &result {
            warn!("Recycling worker after failure: {}", e);
            self.end_process().await;
        }
        result
    }

    async fn shutdown(&mut self) {
        self.end_process().await;
    }
}
