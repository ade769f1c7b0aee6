//! Method tables and the connection loop that serves them.

use super::{error_response, ok_response, CallError, Request};
use crate::codec::{decode, encode, Value};
use crate::error::AppResult;
use crate::shutdown_requested;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Arguments {
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// The argument at position `pos`, or else the keyword argument `name`.
    pub fn optional(&self, pos: usize, name: &str) -> Option<&Value> {
        self.args.get(pos).or_else(|| self.kwargs.get(name))
    }

    pub fn required(&self, pos: usize, name: &str) -> Result<&Value, CallError> {
        self.optional(pos, name)
            .ok_or_else(|| CallError::type_error(format!("missing required argument '{}'", name)))
    }

    pub fn int(&self, pos: usize, name: &str) -> Result<i64, CallError> {
        let value = self.required(pos, name)?;
        value.as_int().ok_or_else(|| {
            CallError::type_error(format!(
                "argument '{}' must be an int, not {}",
                name,
                value.type_name()
            ))
        })
    }

    pub fn string(&self, pos: usize, name: &str) -> Result<&str, CallError> {
        let value = self.required(pos, name)?;
        value.as_str().ok_or_else(|| {
            CallError::type_error(format!(
                "argument '{}' must be a str, not {}",
                name,
                value.type_name()
            ))
        })
    }

    /// Seconds as a duration; absent or `null` means no duration.
    pub fn duration(&self, pos: usize, name: &str) -> Result<Option<Duration>, CallError> {
        match self.optional(pos, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value @ (Value::Int(_) | Value::Float(_))) => value
                .as_duration()
                .map(Some)
                .ok_or_else(|| CallError::value_error(format!("argument '{}' must be a non-negative number of seconds", name))),
            Some(other) => Err(CallError::type_error(format!(
                "argument '{}' must be a number, not {}",
                name,
                other.type_name()
            ))),
        }
    }
}

/// Boxed async method handler.
pub type Handler =
    Arc<dyn Fn(Arguments) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync>;

/// Explicit name to handler mapping exposed by an [`RpcServer`].
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn merge(&mut self, other: MethodTable) -> &mut Self {
        self.methods.extend(other.methods);
        self
    }

    /// Merge `other` with every name prefixed by `prefix`.
    pub fn merge_prefixed(&mut self, prefix: &str, other: MethodTable) -> &mut Self {
        self.methods.extend(
            other
                .methods
                .into_iter()
                .map(|(name, handler)| (format!("{}{}", prefix, name), handler)),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke the handler registered under `name`.
    ///
    /// A panicking handler is reported as a `Panic` error instead of unwinding
    /// into the connection task.
    pub async fn dispatch(&self, name: &str, arguments: Arguments) -> Result<Value, CallError> {
        let handler = self
            .methods
            .get(name)
            .cloned()
            .ok_or_else(|| CallError::new("AttributeError", format!("no method named '{}'", name)))?;
        let call = AssertUnwindSafe(async move { handler(arguments).await });
        match call.catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!("RPC method '{}' panicked: {}", name, message);
                Err(CallError::new("Panic", message))
            }
        }
    }
}

/// Serves a [`MethodTable`] to any number of clients.
pub struct RpcServer {
    methods: Arc<MethodTable>,
}

impl RpcServer {
    pub fn new(methods: MethodTable) -> Self {
        Self {
            methods: Arc::new(methods),
        }
    }

    /// Accept clients until `shutdown` flips to `true`. Each connection is served
    /// by its own task; calls on one connection are answered in order.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("RPC server listening on {}", addr);
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let methods = Arc::clone(&self.methods);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(methods, stream, peer, shutdown).await {
                                debug!("RPC connection {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("RPC server failed to accept connection: {}", e),
                },
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        info!("RPC server stopped");
    }
}

async fn serve_connection(
    methods: Arc<MethodTable>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    debug!("RPC client {} connected", peer);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = shutdown_requested(&mut shutdown) => break,
        };
        let response = handle_line(&methods, &line).await;
        let mut out = encode(&response);
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
    debug!("RPC client {} disconnected", peer);
    Ok(())
}

async fn handle_line(methods: &MethodTable, line: &str) -> Value {
    let request = match decode(line.trim_end()) {
        Ok(value) => Request::from_value(&value),
        Err(e) => Err(CallError::new("ProtocolError", e.to_string())),
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting malformed RPC request: {}", e);
            return error_response(e.to_string());
        }
    };
    let Request { name, args, kwargs } = request;
    match methods.dispatch(&name, Arguments::new(args, kwargs)).await {
        Ok(ret) => ok_response(ret),
        Err(e) => {
            debug!("RPC method '{}' failed: {}", name, e);
            error_response(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn table() -> MethodTable {
        let mut table = MethodTable::new();
        table
            .register("add", |args: Arguments| async move {
                Ok::<_, CallError>(Value::Int(args.int(0, "a")? + args.int(1, "b")?))
            })
            .register("boom", |_args: Arguments| async move {
                if true {
                    panic!("exploded");
                }
                Ok::<_, CallError>(Value::Null)
            });
        table
    }

    #[tokio::test]
    async fn test_dispatch_positional_and_keyword() {
        let table = table();
        let mut kwargs = BTreeMap::new();
        kwargs.insert("b".to_string(), Value::Int(2));
        let ret = table
            .dispatch("add", Arguments::new(vec![Value::Int(1)], kwargs))
            .await
            .unwrap();
        assert_eq!(ret, Value::Int(3));
    }

    #[tokio::test]
    async fn test_missing_argument_is_type_error() {
        let err = table()
            .dispatch("add", Arguments::positional(vec![Value::Int(1)]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "TypeError: missing required argument 'b'");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = table().dispatch("sub", Arguments::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "AttributeError: no method named 'sub'");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panic_is_reported() {
        let err = table().dispatch("boom", Arguments::default()).await.unwrap_err();
        assert_eq!(err.kind, "Panic");
        assert!(err.message.contains("exploded"));
        assert!(logs_contain("RPC method 'boom' panicked"));
    }

    #[tokio::test]
    async fn test_merge_prefixed() {
        let mut merged = MethodTable::new();
        merged.merge_prefixed("pdb_", table());
        assert_eq!(merged.names(), vec!["pdb_add".to_string(), "pdb_boom".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_response() {
        let response = handle_line(&table(), "{not valid").await;
        assert_eq!(response.get("result"), Some(&Value::from("error")));
    }

    #[test]
    fn test_duration_argument() {
        let args = Arguments::positional(vec![Value::Float(1.5), Value::Null, Value::Int(-1)]);
        assert_eq!(args.duration(0, "t").unwrap(), Some(Duration::from_millis(1500)));
        assert_eq!(args.duration(1, "t").unwrap(), None);
        assert_eq!(args.duration(3, "t").unwrap(), None);
        assert_eq!(args.duration(2, "t").unwrap_err().kind, "ValueError");
    }
}
