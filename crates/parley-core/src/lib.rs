//! Core state machines
//!
//! Sans-IO logic for the discussion synchronization engine. Both machines
//! follow the action pattern: methods take time as input where relevant and
//! return actions for a driver to execute. This keeps the state machines pure
//! (no I/O, no timers) and makes testing straightforward.
//!
//! # Components
//!
//! - [`Connection`]: connection lifecycle (connect, reconnect with attempt
//!   counting, advisory connect timeout, heartbeats)
//! - [`MessageSynchronizer`]: the ordered, duplicate-free message list with
//!   idempotent-by-identifier merging of snapshot, push events, and
//!   optimistic local operations

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod connection;
mod error;
mod sync;

pub use connection::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionStatus, DEFAULT_CONNECT_WINDOW,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_WINDOW, DEFAULT_RETRY_DELAY,
};
pub use error::SyncError;
pub use sync::{MessageSynchronizer, OpTicket, SyncAction};
