//! TCP fan-out of named notifiers.

use super::{ModEvent, Notifier, HANDSHAKE};
use crate::codec::encode;
use crate::error::{AppResult, DaqError};
use crate::shutdown_requested;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

type Line = Arc<str>;

#[derive(Default)]
struct FanOut {
    next_id: u64,
    queues: Vec<(u64, mpsc::UnboundedSender<Line>)>,
}

impl FanOut {
    fn attach(&mut self, queue: mpsc::UnboundedSender<Line>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queues.push((id, queue));
        id
    }

    fn detach(&mut self, id: u64) {
        self.queues.retain(|(queue_id, _)| *queue_id != id);
    }
}

struct Store {
    notifier: Notifier,
    fanout: Arc<Mutex<FanOut>>,
}

/// Removes a subscriber's queue from the fan-out list when its connection ends.
struct Detach {
    fanout: Arc<Mutex<FanOut>>,
    id: u64,
}

impl Drop for Detach {
    fn drop(&mut self) {
        self.fanout.lock().detach(self.id);
    }
}

fn event_line(event: &ModEvent) -> Line {
    let mut line = encode(&event.to_value());
    line.push('\n');
    Line::from(line)
}

/// Serves a fixed set of named stores to any number of subscribers.
///
/// Constructing a publisher installs its fan-out callback on every notifier, so
/// the stores must not be given another publish callback afterwards.
pub struct Publisher {
    stores: HashMap<String, Store>,
}

impl Publisher {
    pub fn new<I, S>(notifiers: I) -> Self
    where
        I: IntoIterator<Item = (S, Notifier)>,
        S: Into<String>,
    {
        let stores = notifiers
            .into_iter()
            .map(|(name, notifier)| {
                let fanout = Arc::new(Mutex::new(FanOut::default()));
                let sink = Arc::clone(&fanout);
                notifier.set_publish(Some(Arc::new(move |event: &ModEvent| {
                    let fanout = sink.lock();
                    if fanout.queues.is_empty() {
                        return;
                    }
                    let line = event_line(event);
                    for (_, queue) in &fanout.queues {
                        // A closed queue belongs to a connection that is detaching.
                        let _ = queue.send(Arc::clone(&line));
                    }
                })));
                (name.into(), Store { notifier, fanout })
            })
            .collect();
        Self { stores }
    }

    /// Names of the published stores.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of subscribers currently attached to `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.stores
            .get(name)
            .map_or(0, |store| store.fanout.lock().queues.len())
    }

    /// Accept subscribers until `shutdown` flips to `true`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("Publisher listening on {}", addr);
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let publisher = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = publisher.handle_connection(stream, peer, shutdown).await {
                                log_connection_error(peer, &e);
                            }
                        });
                    }
                    Err(e) => error!("Publisher failed to accept connection: {}", e),
                },
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        info!("Publisher stopped");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<()> {
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let name = tokio::select! {
            name = read_store_name(&mut reader) => name?,
            _ = shutdown_requested(&mut shutdown) => {
                debug!("Dropping {} before handshake: shutting down", peer);
                return Ok(());
            }
        };
        let name = name.as_str();
        let store = self
            .stores
            .get(name)
            .ok_or_else(|| DaqError::Protocol(format!("unknown store '{}'", name)))?;

        let (queue, mut outbound) = mpsc::unbounded_channel();
        let id = store.notifier.with_root_locked(|value| {
            let _ = queue.send(event_line(&ModEvent::Init {
                value: value.clone(),
            }));
            store.fanout.lock().attach(queue)
        });
        let _detach = Detach {
            fanout: Arc::clone(&store.fanout),
            id,
        };
        debug!("Subscriber {} attached to '{}'", peer, name);

        let mut discard = [0u8; 256];
        loop {
            tokio::select! {
                line = outbound.recv() => match line {
                    Some(line) => write_half.write_all(line.as_bytes()).await?,
                    None => break,
                },
                read = reader.read(&mut discard) => {
                    if read? == 0 {
                        break;
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        debug!("Subscriber {} detached from '{}'", peer, name);
        Ok(())
    }
}

/// Read the handshake and the requested store name.
async fn read_store_name(reader: &mut BufReader<OwnedReadHalf>) -> AppResult<String> {
    let mut greeting = vec![0u8; HANDSHAKE.len()];
    reader.read_exact(&mut greeting).await?;
    if greeting != HANDSHAKE {
        return Err(DaqError::Protocol("bad sync_struct handshake".into()));
    }
    let mut name = String::new();
    if reader.read_line(&mut name).await? == 0 {
        return Err(DaqError::ConnectionClosed);
    }
    Ok(name.trim_end_matches(['\r', '\n']).to_string())
}

fn log_connection_error(peer: SocketAddr, err: &DaqError) {
    match err {
        DaqError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
            ) =>
        {
            debug!("Subscriber {} went away: {}", peer, io)
        }
        DaqError::ConnectionClosed => debug!("Subscriber {} closed before naming a store", peer),
        other => warn!("Closing subscriber connection {}: {}", peer, other),
    }
}
