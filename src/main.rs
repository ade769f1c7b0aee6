//! `daq-master`: scheduler, parameter database and state publisher in one process.

use anyhow::{Context, Result};
use clap::Parser;
use daq_master::config::MasterConfig;
use daq_master::Master;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "daq-master", version, about = "DAQ master control plane")]
struct Cli {
    /// Configuration file (default: master.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind both servers to
    #[arg(long)]
    bind: Option<String>,

    /// Port of the state publisher
    #[arg(long = "port-notify")]
    port_notify: Option<u16>,

    /// Port of the RPC server
    #[arg(long = "port-control")]
    port_control: Option<u16>,

    /// Worker program that executes runs
    #[arg(long)]
    worker: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut MasterConfig) {
        if let Some(bind) = self.bind {
            config.network.bind = bind;
        }
        if let Some(port) = self.port_notify {
            config.network.notify_port = port;
        }
        if let Some(port) = self.port_control {
            config.network.control_port = port;
        }
        if let Some(worker) = self.worker {
            config.worker.program = worker;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config =
        MasterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let master = Master::start(&config)
        .await
        .context("Failed to start master")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Interrupt received");

    master.close().await.context("Shutdown failed")?;
    Ok(())
}
