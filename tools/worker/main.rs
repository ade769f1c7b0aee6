//! `daq-worker`: executes runs sent by the master over stdin/stdout.
//!
//! Stdout carries the worker protocol, so all logging goes to stderr.

use anyhow::{Context, Result};
use daq_master::experiment::{serve_worker, RhaiRunner};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("Worker started (pid {})", std::process::id());
    let mut runner = RhaiRunner::new();
    serve_worker(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &mut runner,
    )
    .await
    .context("Worker protocol failed")?;
    Ok(())
}
