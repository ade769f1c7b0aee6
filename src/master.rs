//! Assembly of the master control plane.
//!
//! ```text
//!            +-----------+  run_once, ...   +-----------+  stdin/stdout  +--------+
//! clients -> | RpcServer | ---------------> | Scheduler | -------------> | Worker |
//!            +-----------+                  +-----------+                +--------+
//!                  | pdb_*                        | "queue", "periodic"
//!                  v                              v
//!            +-------------+  "parameters"  +-----------+
//!            | ParameterDb | -------------> | Publisher | -> subscribers
//!            +-------------+                +-----------+
//! ```

use crate::config::MasterConfig;
use crate::error::{AppResult, DaqError};
use crate::parameters::{self, ParameterDb};
use crate::rpc::RpcServer;
use crate::scheduler::{self, ScheduleStores, Scheduler};
use crate::sync_struct::Publisher;
use crate::worker::{RunExecutor, Worker};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Prefix of the parameter database methods in the RPC namespace.
pub const PARAMETER_METHOD_PREFIX: &str = "pdb_";

/// A running master: scheduler, parameter database and both servers.
pub struct Master {
    scheduler: Scheduler,
    parameters: Arc<ParameterDb>,
    publisher: Arc<Publisher>,
    notify_addr: SocketAddr,
    control_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Master {
    /// Start a master whose runs execute on the configured worker program.
    pub async fn start(config: &MasterConfig) -> AppResult<Self> {
        Self::start_with_executor(config, Worker::new(config.worker_config())).await
    }

    /// Start a master with a custom run executor.
    pub async fn start_with_executor<E>(config: &MasterConfig, executor: E) -> AppResult<Self>
    where
        E: RunExecutor + 'static,
    {
        config.validate()?;
        let parameters = Arc::new(match &config.parameters.path {
            Some(path) => ParameterDb::load(path.clone())?,
            None => ParameterDb::in_memory(),
        });

        let stores = ScheduleStores::new();
        let publisher = Arc::new(Publisher::new([
            ("queue", stores.queue.clone()),
            ("periodic", stores.periodic.clone()),
            ("parameters", parameters.notifier().clone()),
        ]));

        let notify_listener = TcpListener::bind(config.notify_addr()).await?;
        let control_listener = TcpListener::bind(config.control_addr()).await?;
        let notify_addr = notify_listener.local_addr()?;
        let control_addr = control_listener.local_addr()?;

        let scheduler = Scheduler::start(executor, stores, &config.scheduler);
        let mut methods = scheduler::methods(scheduler.clone());
        methods.merge_prefixed(
            PARAMETER_METHOD_PREFIX,
            parameters::methods(Arc::clone(&parameters)),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(&publisher).serve(notify_listener, shutdown_rx.clone())),
            tokio::spawn(RpcServer::new(methods).serve(control_listener, shutdown_rx)),
        ];

        info!(
            "Master started: notifications on {}, control on {}",
            notify_addr, control_addr
        );
        Ok(Self {
            scheduler,
            parameters,
            publisher,
            notify_addr,
            control_addr,
            shutdown,
            tasks,
        })
    }

    /// Address of the sync_struct publisher.
    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    /// Address of the RPC server.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn parameters(&self) -> &Arc<ParameterDb> {
        &self.parameters
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Stop both servers, let the current run finish, end the worker and save
    /// the parameter database.
    pub async fn close(self) -> AppResult<()> {
        info!("Shutting down master");
        let _ = self.shutdown.send(true);
        let mut errors = Vec::new();
        for task in self.tasks {
            if let Err(e) = task.await {
                errors.push(DaqError::Task(e.to_string()));
            }
        }
        self.scheduler.close().await;
        if let Err(e) = self.parameters.save() {
            errors.push(e);
        }
        if errors.is_empty() {
            info!("Master stopped");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}
