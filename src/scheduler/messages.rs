//! Commands accepted by the scheduler actor.

use super::{Prid, Rid, RunRecord, ScheduleError, ScheduleSnapshot};
use crate::codec::Value;
use std::time::Duration;
use tokio::sync::oneshot;

/// Commands that can be sent to the scheduler actor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Queue a one-shot run
    RunOnce {
        run_params: Value,
        timeout: Option<Duration>,
        response: oneshot::Sender<Rid>,
    },

    /// Remove a queued one-shot run
    CancelOnce {
        rid: Rid,
        response: oneshot::Sender<Result<(), ScheduleError>>,
    },

    /// Add a periodic run
    RunPeriodic {
        run_params: Value,
        timeout: Option<Duration>,
        period: Duration,
        response: oneshot::Sender<Result<Prid, ScheduleError>>,
    },

    /// Remove a periodic run
    CancelPeriodic {
        prid: Prid,
        response: oneshot::Sender<Result<(), ScheduleError>>,
    },

    /// Snapshot of the executing slot, queue and periodic table
    GetSchedule {
        response: oneshot::Sender<ScheduleSnapshot>,
    },

    /// Finished runs, oldest first
    GetHistory {
        response: oneshot::Sender<Vec<RunRecord>>,
    },

    /// Stop after the current run and shut the executor down
    Shutdown { response: oneshot::Sender<()> },
}

impl SchedulerCommand {
    pub fn run_once(
        run_params: Value,
        timeout: Option<Duration>,
    ) -> (Self, oneshot::Receiver<Rid>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RunOnce {
                run_params,
                timeout,
                response: tx,
            },
            rx,
        )
    }

    pub fn cancel_once(rid: Rid) -> (Self, oneshot::Receiver<Result<(), ScheduleError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CancelOnce { rid, response: tx }, rx)
    }

    pub fn run_periodic(
        run_params: Value,
        timeout: Option<Duration>,
        period: Duration,
    ) -> (Self, oneshot::Receiver<Result<Prid, ScheduleError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RunPeriodic {
                run_params,
                timeout,
                period,
                response: tx,
            },
            rx,
        )
    }

    pub fn cancel_periodic(prid: Prid) -> (Self, oneshot::Receiver<Result<(), ScheduleError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CancelPeriodic { prid, response: tx }, rx)
    }

    pub fn get_schedule() -> (Self, oneshot::Receiver<ScheduleSnapshot>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetSchedule { response: tx }, rx)
    }

    pub fn get_history() -> (Self, oneshot::Receiver<Vec<RunRecord>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetHistory { response: tx }, rx)
    }

    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
