//! Client side of the replication protocol.

use super::{apply_event, ModEvent, HANDSHAKE};
use crate::codec::{decode, Value};
use crate::error::{AppResult, DaqError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// A live replica of one published store.
pub struct Subscriber {
    reader: BufReader<OwnedReadHalf>,
    // Dropping the write half would signal EOF to the publisher.
    _writer: OwnedWriteHalf,
    replica: Value,
    line: String,
}

impl Subscriber {
    /// Connect, request `name` and build the replica from the `init` event.
    ///
    /// `build` receives the initial value and returns the replica that later
    /// events are applied to; pass `|v| v` to keep it as is.
    pub async fn connect<A, F>(addr: A, name: &str, build: F) -> AppResult<Self>
    where
        A: ToSocketAddrs,
        F: FnOnce(Value) -> Value,
    {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        writer.write_all(HANDSHAKE).await?;
        writer.write_all(format!("{}\n", name).as_bytes()).await?;

        let mut subscriber = Self {
            reader: BufReader::new(read_half),
            _writer: writer,
            replica: Value::Null,
            line: String::new(),
        };
        match subscriber.read_event().await? {
            Some(ModEvent::Init { value }) => subscriber.replica = build(value),
            Some(other) => {
                return Err(DaqError::Protocol(format!(
                    "expected init event, got '{}'",
                    other.action()
                )))
            }
            None => return Err(DaqError::ConnectionClosed),
        }
        debug!("Subscribed to '{}'", name);
        Ok(subscriber)
    }

    async fn read_event(&mut self) -> AppResult<Option<ModEvent>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line).await? == 0 {
            return Ok(None);
        }
        let value = decode(self.line.trim_end())?;
        Ok(Some(ModEvent::from_value(&value)?))
    }

    /// Wait for the next event and apply it to the replica.
    ///
    /// Returns `None` once the publisher closes the connection.
    pub async fn receive(&mut self) -> AppResult<Option<ModEvent>> {
        let Some(event) = self.read_event().await? else {
            return Ok(None);
        };
        apply_event(&mut self.replica, &event)?;
        Ok(Some(event))
    }

    pub fn replica(&self) -> &Value {
        &self.replica
    }

    pub fn into_replica(self) -> Value {
        self.replica
    }

    /// Apply events until the publisher disconnects, calling `on_event` after each.
    pub async fn run<F>(&mut self, mut on_event: F) -> AppResult<()>
    where
        F: FnMut(&Value, &ModEvent),
    {
        while let Some(event) = self.receive().await? {
            on_event(&self.replica, &event);
        }
        Ok(())
    }
}
