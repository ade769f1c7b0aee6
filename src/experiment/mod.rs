//! Worker-process side of the run protocol.
//!
//! `daq-worker` reads one run request per line from stdin, acknowledges it,
//! hands it to an [`ExperimentRunner`] and reports the outcome as one JSON
//! line. See [`crate::worker`] for the master side.

pub mod rhai_runner;

pub use rhai_runner::RhaiRunner;

use crate::codec::{decode, Value};
use crate::error::AppResult;
use crate::worker::{RunOutcome, ACK};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Executes the experiment described by a run's parameters.
#[async_trait]
pub trait ExperimentRunner: Send {
    /// Run to completion; `Err` carries the failure message reported to the master.
    async fn run(&mut self, run_params: &Value) -> Result<(), String>;
}

/// Serve run requests from `reader` until it reaches end of file.
pub async fn serve_worker<R, W, E>(reader: R, mut writer: W, runner: &mut E) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    E: ExperimentRunner + ?Sized,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        write_line(&mut writer, ACK).await?;

        let outcome = match decode(line) {
            Ok(run_params) => {
                debug!("Run request: {}", run_params);
                match runner.run(&run_params).await {
                    Ok(()) => RunOutcome::Ok,
                    Err(message) => {
                        warn!("Run failed: {}", message);
                        RunOutcome::Failed { message }
                    }
                }
            }
            Err(e) => RunOutcome::Failed {
                message: format!("invalid run request: {}", e),
            },
        };
        let reply = serde_json::to_string(&outcome)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_line(&mut writer, &reply).await?;
    }
    info!("Master closed the request stream");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
