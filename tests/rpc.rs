//! RPC server and client over loopback TCP.

use daq_master::codec::Value;
use daq_master::rpc::{Arguments, CallError, MethodTable, RpcClient, RpcServer};
use daq_master::DaqError;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

fn methods() -> MethodTable {
    let mut table = MethodTable::new();
    table
        .register("echo", |args: Arguments| async move {
            Ok::<_, CallError>(args.required(0, "value")?.clone())
        })
        .register("fail", |_args: Arguments| async move {
            Err::<Value, _>(CallError::value_error("bad"))
        })
        .register("greet", |args: Arguments| async move {
            let name = args.string(0, "name")?;
            let punctuation = args.optional(1, "punctuation").and_then(Value::as_str).unwrap_or(".");
            Ok::<_, CallError>(Value::from(format!("hello {}{}", name, punctuation)))
        })
        .register("sleep", |args: Arguments| async move {
            let delay = args.duration(0, "delay")?.unwrap_or_default();
            tokio::time::sleep(delay).await;
            Ok::<_, CallError>(Value::Null)
        });
    table
}

async fn serve() -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(RpcServer::new(methods()).serve(listener, shutdown_rx));
    (addr, shutdown)
}

#[tokio::test]
async fn test_remote_error_carries_kind_and_message() {
    let (addr, _shutdown) = serve().await;
    let mut client = RpcClient::connect(addr.to_string()).await.unwrap();

    match client.call_positional("fail", Vec::new()).await {
        Err(DaqError::Remote(message)) => assert!(message.contains("ValueError: bad")),
        other => panic!("expected remote error, got {:?}", other),
    }
    // The connection survives a remote error.
    assert!(client.is_connected());
    let ret = client
        .call_positional("echo", vec![Value::from("still here")])
        .await
        .unwrap();
    assert_eq!(ret, Value::from("still here"));
}

#[tokio::test]
async fn test_unknown_method_is_remote_error() {
    let (addr, _shutdown) = serve().await;
    let mut client = RpcClient::new(addr.to_string());
    assert!(!client.is_connected());

    let err = client.call_positional("nope", Vec::new()).await.unwrap_err();
    assert!(matches!(err, DaqError::Remote(ref m) if m.contains("AttributeError")));
}

#[tokio::test]
async fn test_keyword_arguments() {
    let (addr, _shutdown) = serve().await;
    let mut client = RpcClient::connect(addr.to_string()).await.unwrap();

    let mut kwargs = BTreeMap::new();
    kwargs.insert("punctuation".to_string(), Value::from("!"));
    let ret = client
        .call("greet", vec![Value::from("lab")], kwargs)
        .await
        .unwrap();
    assert_eq!(ret, Value::from("hello lab!"));

    let err = client.call_positional("greet", vec![Value::Int(3)]).await.unwrap_err();
    assert!(matches!(err, DaqError::Remote(ref m) if m.starts_with("TypeError")));
}

#[tokio::test]
async fn test_slow_call_does_not_block_other_clients() {
    let (addr, _shutdown) = serve().await;
    let mut slow = RpcClient::connect(addr.to_string()).await.unwrap();
    let slow_call = tokio::spawn(async move {
        slow.call_positional("sleep", vec![Value::Float(1.0)]).await
    });

    let mut fast = RpcClient::connect(addr.to_string()).await.unwrap();
    let started = Instant::now();
    fast.call_positional("echo", vec![Value::Int(1)]).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    slow_call.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_its_reply() {
    let (addr, _shutdown) = serve().await;
    let mut client = RpcClient::connect(addr.to_string()).await.unwrap();

    let abandoned = timeout(
        Duration::from_millis(50),
        client.call_positional("sleep", vec![Value::Float(0.3)]),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(!client.is_connected());

    let ret = client
        .call_positional("echo", vec![Value::from("fast")])
        .await
        .unwrap();
    assert_eq!(ret, Value::from("fast"));

    // Give the sleeping call time to answer on the old connection.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let ret = client
        .call_positional("echo", vec![Value::Int(2)])
        .await
        .unwrap();
    assert_eq!(ret, Value::Int(2));
}

#[tokio::test]
async fn test_malformed_request_keeps_connection() {
    let (addr, _shutdown) = serve().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"{\"action\": \n").await.unwrap();
    let response = lines.next_line().await.unwrap().unwrap();
    assert!(response.contains("\"error\""));

    write_half
        .write_all(b"{\"action\": \"call\", \"name\": \"echo\", \"args\": [5], \"kwargs\": {}}\n")
        .await
        .unwrap();
    let response = lines.next_line().await.unwrap().unwrap();
    assert!(response.contains("\"ok\""));
    assert!(response.contains('5'));
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(RpcServer::new(methods()).serve(listener, shutdown_rx));

    let mut client = RpcClient::new(addr.to_string());
    client.call_positional("echo", vec![Value::Int(1)]).await.unwrap();

    shutdown.send(true).unwrap();
    server.await.unwrap();
    let err = timeout(
        Duration::from_secs(5),
        client.call_positional("echo", vec![Value::Int(2)]),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(!matches!(err, DaqError::Remote(_)));
    assert!(!client.is_connected());

    let listener = TcpListener::bind(addr).await.unwrap();
    let (_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(RpcServer::new(methods()).serve(listener, shutdown_rx));
    let ret = client.call_positional("echo", vec![Value::Int(3)]).await.unwrap();
    assert_eq!(ret, Value::Int(3));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut client = RpcClient::new(addr.to_string());
    let err = client.call_positional("echo", vec![Value::Null]).await.unwrap_err();
    assert!(matches!(err, DaqError::Io(_)));
    assert!(!client.is_connected());
}
