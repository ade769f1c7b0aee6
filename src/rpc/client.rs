//! RPC client with a lazily opened, reused connection.

use super::{parse_response, Request};
use crate::codec::{decode, encode, Value};
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Calls methods on one [`RpcServer`](super::RpcServer).
///
/// # Example
///
/// ```rust,ignore
/// let mut client = RpcClient::connect("127.0.0.1:3251").await?;
/// let rid = client.call_positional("run_once", vec![params, Value::Null]).await?;
/// ```
pub struct RpcClient {
    addr: String,
    connection: Option<Connection>,
}

impl RpcClient {
    /// A client for `addr`; nothing is opened until the first call.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: None,
        }
    }

    /// A client with its connection already open.
    pub async fn connect(addr: impl Into<String>) -> AppResult<Self> {
        let mut client = Self::new(addr);
        client.ensure_connected().await?;
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn ensure_connected(&mut self) -> AppResult<&mut Connection> {
        if self.connection.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            let (read_half, writer) = stream.into_split();
            debug!("Connected to RPC server {}", self.addr);
            self.connection = Some(Connection {
                reader: BufReader::new(read_half),
                writer,
            });
        }
        self.connection.as_mut().ok_or(DaqError::ConnectionClosed)
    }

    /// Call `name` and wait for its return value.
    ///
    /// An error answered by the server is `DaqError::Remote` and leaves the
    /// connection open. Any other failure drops the connection so the next call
    /// reconnects, and so does dropping the returned future before it resolves.
    pub async fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> AppResult<Value> {
        let request = Request {
            name: name.to_string(),
            args,
            kwargs,
        };
        let mut line = encode(&request.to_value());
        line.push('\n');
        let result = match self.exchange(&line).await {
            Ok(response) => parse_response(&response),
            Err(e) => Err(e),
        };
        if matches!(result, Err(ref e) if !matches!(e, DaqError::Remote(_))) {
            self.connection = None;
        }
        result
    }

    pub async fn call_positional(&mut self, name: &str, args: Vec<Value>) -> AppResult<Value> {
        self.call(name, args, BTreeMap::new()).await
    }

    /// Send one request line and read its response line.
    ///
    /// The connection is taken out of `self` for the whole exchange and only put
    /// back once a complete response has been read, so a call dropped midway
    /// leaves the client disconnected instead of out of step with the server.
    async fn exchange(&mut self, line: &str) -> AppResult<Value> {
        self.ensure_connected().await?;
        let mut connection = self.connection.take().ok_or(DaqError::ConnectionClosed)?;
        connection.writer.write_all(line.as_bytes()).await?;
        let mut response = String::new();
        if connection.reader.read_line(&mut response).await? == 0 {
            return Err(DaqError::ConnectionClosed);
        }
        self.connection = Some(connection);
        Ok(decode(response.trim_end())?)
    }

    /// Drop the connection, if any.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("Closed RPC connection to {}", self.addr);
        }
    }
}
