//! RPC surface of the scheduler.

use super::{Prid, Rid, ScheduleError, Scheduler};
use crate::codec::Value;
use crate::rpc::{Arguments, CallError, MethodTable};

impl From<ScheduleError> for CallError {
    fn from(err: ScheduleError) -> Self {
        let message = err.to_string();
        match err {
            ScheduleError::UnknownRun(_) | ScheduleError::UnknownPeriodic(_) => {
                CallError::key_error(message)
            }
            ScheduleError::InvalidPeriod(_) => CallError::value_error(message),
            ScheduleError::RunExecuting(_) | ScheduleError::Closed => {
                CallError::runtime_error(message)
            }
        }
    }
}

fn rid_argument(args: &Arguments) -> Result<Rid, CallError> {
    let rid = args.int(0, "rid")?;
    Rid::try_from(rid).map_err(|_| CallError::value_error(format!("invalid rid {}", rid)))
}

fn prid_argument(args: &Arguments) -> Result<Prid, CallError> {
    let prid = args.int(0, "prid")?;
    Prid::try_from(prid).map_err(|_| CallError::value_error(format!("invalid prid {}", prid)))
}

/// Method table exposing `scheduler` under its operation names.
pub fn methods(scheduler: Scheduler) -> MethodTable {
    let mut table = MethodTable::new();

    let handle = scheduler.clone();
    table.register("run_once", move |args: Arguments| {
        let scheduler = handle.clone();
        async move {
            let run_params = args.required(0, "run_params")?.clone();
            let timeout = args.duration(1, "timeout")?;
            let rid = scheduler.run_once(run_params, timeout).await?;
            Ok::<_, CallError>(Value::from(rid))
        }
    });

    let handle = scheduler.clone();
    table.register("cancel_once", move |args: Arguments| {
        let scheduler = handle.clone();
        async move {
            scheduler.cancel_once(rid_argument(&args)?).await?;
            Ok::<_, CallError>(Value::Null)
        }
    });

    let handle = scheduler.clone();
    table.register("run_periodic", move |args: Arguments| {
        let scheduler = handle.clone();
        async move {
            let run_params = args.required(0, "run_params")?.clone();
            let timeout = args.duration(1, "timeout")?;
            let period = args
                .duration(2, "period")?
                .ok_or_else(|| CallError::type_error("missing required argument 'period'"))?;
            let prid = scheduler.run_periodic(run_params, timeout, period).await?;
            Ok::<_, CallError>(Value::from(prid))
        }
    });

    let handle = scheduler.clone();
    table.register("cancel_periodic", move |args: Arguments| {
        let scheduler = handle.clone();
        async move {
            scheduler.cancel_periodic(prid_argument(&args)?).await?;
            Ok::<_, CallError>(Value::Null)
        }
    });

    let handle = scheduler.clone();
    table.register("get_schedule", move |_args: Arguments| {
        let scheduler = handle.clone();
        async move { Ok::<_, CallError>(scheduler.get_schedule().await?.to_value()) }
    });

    let handle = scheduler;
    table.register("get_history", move |_args: Arguments| {
        let scheduler = handle.clone();
        async move {
            let history = scheduler.get_history().await?;
            Ok::<_, CallError>(Value::List(history.iter().map(|r| r.to_value()).collect()))
        }
    });

    table
}
