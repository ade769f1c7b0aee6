//! The task that owns the schedule.

use super::{
    Clock, ExecutingRun, PeriodicPolicy, PeriodicRun, Prid, Rid, Run, RunOrigin, RunRecord,
    RunResult, ScheduleError, ScheduleSnapshot, ScheduleStores, SchedulerCommand,
    SchedulerConfig,
};
use crate::codec::Value;
use crate::sync_struct::StoreError;
use crate::worker::{RunExecutor, RunOutcome, WorkerError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

struct Executing {
    origin: RunOrigin,
    run_params: Value,
    timeout: Option<Duration>,
    started: DateTime<Utc>,
}

/// Everything the actor owns except the executor and the command channel, so
/// commands can be handled while the executor is busy.
struct ScheduleState {
    clock: Arc<dyn Clock>,
    policy: PeriodicPolicy,
    history_len: usize,
    stores: ScheduleStores,
    next_rid: Rid,
    queued: VecDeque<Run>,
    periodic: BTreeMap<Prid, PeriodicRun>,
    executing: Option<Executing>,
    history: VecDeque<RunRecord>,
    closing: Vec<oneshot::Sender<()>>,
}

pub(super) struct SchedulerActor<E> {
    executor: E,
    commands: mpsc::Receiver<SchedulerCommand>,
    commands_open: bool,
    state: ScheduleState,
}

impl<E: RunExecutor> SchedulerActor<E> {
    pub(super) fn new(
        executor: E,
        commands: mpsc::Receiver<SchedulerCommand>,
        stores: ScheduleStores,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            commands,
            commands_open: true,
            state: ScheduleState {
                clock,
                policy: config.periodic_policy,
                history_len: config.history_len,
                stores,
                next_rid: 0,
                queued: VecDeque::new(),
                periodic: BTreeMap::new(),
                executing: None,
                history: VecDeque::new(),
                closing: Vec::new(),
            },
        }
    }

    pub(super) async fn run(mut self) {
        info!("Scheduler started ({:?} periodic policy)", self.state.policy);
        while self.commands_open && self.state.closing.is_empty() {
            let now = self.state.clock.now();

            if let Some(due) = self.state.due_periodic(now) {
                let scheduled = due.next_run;
                let completed = self
                    .execute(RunOrigin::Periodic(due.prid), due.run_params, due.timeout)
                    .await;
                self.state.rearm(due.prid, scheduled, completed);
                continue;
            }

            if let Some(run) = self.state.dequeue() {
                self.execute(RunOrigin::Once(run.rid), run.run_params, run.timeout)
                    .await;
                continue;
            }

            let wait = self
                .state
                .next_deadline()
                .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO));
            tokio::select! {
                command = self.commands.recv() => {
                    self.commands_open = self.state.accept(command);
                }
                _ = sleep_for(wait) => {}
            }
        }

        info!("Scheduler stopping");
        self.executor.shutdown().await;
        for responder in self.state.closing.drain(..) {
            let _ = responder.send(());
        }
        info!("Scheduler stopped");
    }

    /// Execute one run while continuing to serve commands. Returns the
    /// completion time.
    async fn execute(
        &mut self,
        origin: RunOrigin,
        run_params: Value,
        timeout: Option<Duration>,
    ) -> DateTime<Utc> {
        let started = self.state.clock.now();
        info!("Starting {:?}", origin);
        self.state.executing = Some(Executing {
            origin,
            run_params: run_params.clone(),
            timeout,
            started,
        });

        // The execution future borrows `run_params`; it must be dropped before
        // the params move into the history record.
        let result = {
            let execution = self.executor.execute(&run_params, timeout);
            tokio::pin!(execution);
            loop {
                tokio::select! {
                    result = &mut execution => break result,
                    command = self.commands.recv(), if self.commands_open => {
                        self.commands_open = self.state.accept(command);
                    }
                }
            }
        };

        self.state.executing = None;
        let finished = self.state.clock.now();
        self.state.record(origin, run_params, started, finished, result);
        finished
    }
}

impl ScheduleState {
    /// Handle one command. Returns `false` once every handle has been dropped.
    fn accept(&mut self, command: Option<SchedulerCommand>) -> bool {
        let Some(command) = command else {
            debug!("All scheduler handles dropped");
            return false;
        };
        match command {
            SchedulerCommand::RunOnce {
                run_params,
                timeout,
                response,
            } => {
                let _ = response.send(self.enqueue(run_params, timeout));
            }
            SchedulerCommand::CancelOnce { rid, response } => {
                let _ = response.send(self.cancel_once(rid));
            }
            SchedulerCommand::RunPeriodic {
                run_params,
                timeout,
                period,
                response,
            } => {
                let _ = response.send(self.add_periodic(run_params, timeout, period));
            }
            SchedulerCommand::CancelPeriodic { prid, response } => {
                let _ = response.send(self.cancel_periodic(prid));
            }
            SchedulerCommand::GetSchedule { response } => {
                let _ = response.send(self.snapshot());
            }
            SchedulerCommand::GetHistory { response } => {
                let _ = response.send(self.history.iter().cloned().collect());
            }
            SchedulerCommand::Shutdown { response } => {
                info!("Scheduler shutdown requested");
                self.closing.push(response);
            }
        }
        true
    }

    fn enqueue(&mut self, run_params: Value, timeout: Option<Duration>) -> Rid {
        let rid = self.next_rid;
        self.next_rid += 1;
        let run = Run {
            rid,
            run_params,
            timeout,
        };
        mirror(self.stores.queue.append(run.to_value()));
        self.queued.push_back(run);
        debug!("Queued run {}", rid);
        rid
    }

    fn dequeue(&mut self) -> Option<Run> {
        let run = self.queued.pop_front()?;
        mirror(self.stores.queue.pop(0));
        Some(run)
    }

    fn cancel_once(&mut self, rid: Rid) -> Result<(), ScheduleError> {
        if let Some(position) = self.queued.iter().position(|run| run.rid == rid) {
            self.queued.remove(position);
            mirror(self.stores.queue.pop(position as i64));
            info!("Cancelled run {}", rid);
            return Ok(());
        }
        match &self.executing {
            Some(executing) if executing.origin == RunOrigin::Once(rid) => {
                Err(ScheduleError::RunExecuting(rid))
            }
            _ => Err(ScheduleError::UnknownRun(rid)),
        }
    }

    fn add_periodic(
        &mut self,
        run_params: Value,
        timeout: Option<Duration>,
        period: Duration,
    ) -> Result<Prid, ScheduleError> {
        if period.is_zero() {
            return Err(ScheduleError::InvalidPeriod(
                "period must be greater than zero".into(),
            ));
        }
        // A firing entry keeps its prid reserved even if cancelled meanwhile.
        let firing = match &self.executing {
            Some(Executing {
                origin: RunOrigin::Periodic(prid),
                ..
            }) => Some(*prid),
            _ => None,
        };
        let prid = (0..=Prid::MAX)
            .find(|prid| !self.periodic.contains_key(prid) && Some(*prid) != firing)
            .ok_or_else(|| ScheduleError::InvalidPeriod("no free periodic id".into()))?;
        let run = PeriodicRun {
            prid,
            next_run: self.clock.now(),
            run_params,
            timeout,
            period,
        };
        mirror(self.stores.periodic.set(Value::from(prid), run.to_value()));
        self.periodic.insert(prid, run);
        info!("Added periodic run {} every {:?}", prid, period);
        Ok(prid)
    }

    fn cancel_periodic(&mut self, prid: Prid) -> Result<(), ScheduleError> {
        self.periodic
            .remove(&prid)
            .ok_or(ScheduleError::UnknownPeriodic(prid))?;
        mirror(self.stores.periodic.remove(Value::from(prid)));
        info!("Cancelled periodic run {}", prid);
        Ok(())
    }

    /// Lowest-prid periodic run that is due at `now`.
    fn due_periodic(&self, now: DateTime<Utc>) -> Option<PeriodicRun> {
        self.periodic
            .values()
            .find(|run| run.next_run <= now)
            .cloned()
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.periodic.values().map(|run| run.next_run).min()
    }

    fn rearm(&mut self, prid: Prid, scheduled: DateTime<Utc>, completed: DateTime<Utc>) {
        let policy = self.policy;
        let Some(run) = self.periodic.get_mut(&prid) else {
            debug!("Periodic run {} was cancelled while executing", prid);
            return;
        };
        run.next_run = policy.next_run(scheduled, completed, run.period);
        let value = run.to_value();
        mirror(self.stores.periodic.set(Value::from(prid), value));
    }

    fn snapshot(&self) -> ScheduleSnapshot {
        let now = self.clock.now();
        ScheduleSnapshot {
            executing: self.executing.as_ref().map(|executing| ExecutingRun {
                origin: executing.origin,
                run_params: executing.run_params.clone(),
                timeout: executing.timeout,
                started: executing.started,
                elapsed: (now - executing.started).to_std().unwrap_or(Duration::ZERO),
            }),
            queued: self.queued.iter().cloned().collect(),
            periodic: self.periodic.clone(),
        }
    }

    fn record(
        &mut self,
        origin: RunOrigin,
        run_params: Value,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        result: Result<RunOutcome, WorkerError>,
    ) {
        let result = match result {
            Ok(RunOutcome::Ok) => {
                info!("{:?} completed", origin);
                RunResult::Completed
            }
            Ok(RunOutcome::Failed { message }) => {
                warn!("{:?} failed: {}", origin, message);
                RunResult::Failed(message)
            }
            Err(e) => {
                error!("{:?} lost its worker: {}", origin, e);
                RunResult::WorkerFailed(e.to_string())
            }
        };
        if self.history_len == 0 {
            return;
        }
        while self.history.len() >= self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(RunRecord {
            origin,
            run_params,
            started,
            finished,
            result,
        });
    }
}

fn mirror<T>(result: Result<T, StoreError>) {
    if let Err(e) = result {
        warn!("Failed to mirror schedule change: {}", e);
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
