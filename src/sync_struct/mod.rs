//! Structural state replication ("sync_struct").
//!
//! A [`Notifier`] wraps a [`Value`](crate::codec::Value) tree and turns every
//! write into a [`ModEvent`]. A [`Publisher`] serves a fixed set of named
//! notifiers over TCP: each subscriber first receives an `init` event carrying
//! the full current value, then every later mutation in the order it happened.
//! A [`Subscriber`] rebuilds a replica from that stream.
//!
//! ```text
//! Notifier.append(x) --ModEvent--> Publisher fan-out --line--> Subscriber.replica
//! ```

pub mod event;
pub mod notifier;
pub mod publisher;
pub mod subscriber;

pub use event::{apply_event, ModEvent};
pub use notifier::{Notifier, PublishFn};
pub use publisher::Publisher;
pub use subscriber::Subscriber;

use thiserror::Error;

/// Bytes a subscriber sends before naming the store it wants.
pub const HANDSHAKE: &[u8] = b"ARTIQ sync_struct\n";

/// Errors raised while addressing or mutating a replicated structure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("cannot {op} on a {kind}")]
    WrongContainer { op: &'static str, kind: &'static str },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("value would nest deeper than {0} levels")]
    TooDeep(usize),
}
