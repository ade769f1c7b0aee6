//! The assembled master, driven over its two TCP ports.

use async_trait::async_trait;
use daq_master::codec::{decode, Value};
use daq_master::config::MasterConfig;
use daq_master::rpc::RpcClient;
use daq_master::sync_struct::{ModEvent, Subscriber};
use daq_master::worker::{RunExecutor, RunOutcome, WorkerError};
use daq_master::{DaqError, Master};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct InstantExecutor;

#[async_trait]
impl RunExecutor for InstantExecutor {
    async fn execute(
        &mut self,
        _run_params: &Value,
        _run_timeout: Option<Duration>,
    ) -> Result<RunOutcome, WorkerError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(RunOutcome::Ok)
    }

    async fn shutdown(&mut self) {}
}

fn test_config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.network.notify_port = 0;
    config.network.control_port = 0;
    config
}

async fn history_len(client: &mut RpcClient) -> usize {
    let history = client.call_positional("get_history", Vec::new()).await.unwrap();
    history.as_seq().map_or(0, <[Value]>::len)
}

#[tokio::test]
async fn test_submitted_run_is_published_and_executed() {
    let master = Master::start_with_executor(&test_config(), InstantExecutor)
        .await
        .unwrap();
    let mut queue = Subscriber::connect(master.notify_addr(), "queue", |v| v)
        .await
        .unwrap();
    let mut client = RpcClient::connect(master.control_addr().to_string())
        .await
        .unwrap();

    let params = Value::map([("file", Value::from("scan.rhai"))]);
    let rid = client
        .call_positional("run_once", vec![params.clone(), Value::Null])
        .await
        .unwrap();
    assert_eq!(rid, Value::Int(0));

    let event = timeout(WAIT, queue.receive()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        event,
        ModEvent::Append {
            path: Vec::new(),
            value: Value::tuple(vec![Value::Int(0), params, Value::Null]),
        }
    );
    // Dequeued when it starts executing.
    let event = timeout(WAIT, queue.receive()).await.unwrap().unwrap().unwrap();
    assert_eq!(event.action(), "pop");
    assert_eq!(queue.replica(), &Value::List(Vec::new()));

    timeout(WAIT, async {
        while history_len(&mut client).await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let history = client.call_positional("get_history", Vec::new()).await.unwrap();
    let record = &history.as_seq().unwrap()[0];
    assert_eq!(record.get("status"), Some(&Value::from("completed")));
    assert_eq!(record.get("origin"), Some(&Value::from("once")));

    client.close();
    master.close().await.unwrap();
}

#[tokio::test]
async fn test_scheduler_errors_reach_the_client() {
    let master = Master::start_with_executor(&test_config(), InstantExecutor)
        .await
        .unwrap();
    let mut client = RpcClient::new(master.control_addr().to_string());

    let err = client
        .call_positional("cancel_once", vec![Value::Int(7)])
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Remote(ref m) if m.starts_with("KeyError")));

    let err = client
        .call_positional(
            "run_periodic",
            vec![Value::empty_map(), Value::Null, Value::Int(0)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Remote(ref m) if m.starts_with("ValueError")));

    let schedule = client.call_positional("get_schedule", Vec::new()).await.unwrap();
    assert_eq!(schedule.get("queued"), Some(&Value::List(Vec::new())));
    assert_eq!(schedule.get("periodic"), Some(&Value::empty_map()));

    master.close().await.unwrap();
}

#[tokio::test]
async fn test_parameters_are_replicated_and_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parameters.pyon");
    let mut config = test_config();
    config.parameters.path = Some(path.clone());

    let master = Master::start_with_executor(&config, InstantExecutor)
        .await
        .unwrap();
    let mut params = Subscriber::connect(master.notify_addr(), "parameters", |v| v)
        .await
        .unwrap();
    let mut client = RpcClient::new(master.control_addr().to_string());

    client
        .call_positional("pdb_set", vec![Value::from("gain"), Value::Float(1.5)])
        .await
        .unwrap();
    let event = timeout(WAIT, params.receive()).await.unwrap().unwrap().unwrap();
    assert_eq!(event.action(), "setitem");
    assert_eq!(params.replica(), &Value::map([("gain", Value::Float(1.5))]));

    let gain = client
        .call_positional("pdb_get", vec![Value::from("gain")])
        .await
        .unwrap();
    assert_eq!(gain, Value::Float(1.5));
    let err = client
        .call_positional("pdb_get", vec![Value::from("offset")])
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Remote(ref m) if m.starts_with("KeyError")));

    master.close().await.unwrap();
    let saved = decode(std::fs::read_to_string(&path).unwrap().trim()).unwrap();
    assert_eq!(saved, Value::map([("gain", Value::Float(1.5))]));
}

#[tokio::test]
async fn test_close_disconnects_clients() {
    let master = Master::start_with_executor(&test_config(), InstantExecutor)
        .await
        .unwrap();
    let mut queue = Subscriber::connect(master.notify_addr(), "queue", |v| v)
        .await
        .unwrap();
    let control_addr = master.control_addr();

    master.close().await.unwrap();
    let end = timeout(WAIT, queue.receive()).await.unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));
    assert!(RpcClient::connect(control_addr.to_string())
        .await
        .is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_runs_on_worker_process() {
    let mut config = test_config();
    config.worker.program = "sh".into();
    config.worker.args = vec![
        "-c".into(),
        r#"while read line; do echo ack; echo '{"status": "ok"}'; done"#.into(),
    ];
    let master = Master::start(&config).await.unwrap();
    let mut client = RpcClient::new(master.control_addr().to_string());

    client
        .call_positional("run_once", vec![Value::empty_map(), Value::Float(5.0)])
        .await
        .unwrap();
    timeout(WAIT, async {
        while history_len(&mut client).await == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let history = client.call_positional("get_history", Vec::new()).await.unwrap();
    assert_eq!(
        history.as_seq().unwrap()[0].get("status"),
        Some(&Value::from("completed"))
    );
    master.close().await.unwrap();
}
