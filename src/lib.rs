//! Core library of the DAQ master control plane.
//!
//! The master schedules experiment runs onto a supervised worker process,
//! replicates its live state (run queue, periodic table, parameters) to any
//! number of observers as incremental diffs, and exposes the scheduler and the
//! parameter database over a line-based RPC protocol. The `daq-master`,
//! `daq-client` and `daq-worker` binaries are thin wrappers around this crate.

pub mod codec;
pub mod config;
pub mod error;
pub mod experiment;
pub mod master;
pub mod parameters;
pub mod rpc;
pub mod scheduler;
pub mod sync_struct;
pub mod worker;

pub use codec::Value;
pub use error::{AppResult, DaqError};
pub use master::Master;

use tokio::sync::watch;

/// Resolve once `shutdown` holds `true` or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender was dropped, which also ends the server.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
