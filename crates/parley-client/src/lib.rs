//! Client
//!
//! Tokio I/O layer for the parley discussion synchronization engine. Drives
//! the sans-IO machines in [`parley_core`] with real transports: an
//! authenticated HTTP client for snapshots and CRUD, a websocket for the
//! push stream, and a single-flight media cache for attachment blobs.
//!
//! # Components
//!
//! - [`DiscussionSession`]: composition root; the contract the UI consumes
//! - [`ConnectionManager`]: one real-time subscription at a time, with
//!   transparent reconnection surfaced as [`ConnectionStatus`] values
//! - [`MediaCache`]: session-private attachment blobs, fetched once per key
//! - [`DiscussionApi`]: snapshot/CRUD HTTP calls
//! - [`TokenSource`] / [`CachedTokens`]: bearer credential supply

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod api;
mod auth;
mod config;
mod error;
mod manager;
mod media;
mod session;
mod transport;

pub use api::{ApiError, DiscussionApi, MessageDraft};
pub use auth::{AuthError, CachedTokens, DEFAULT_TOKEN_TTL, StaticTokens, TokenSource};
pub use config::ClientConfig;
pub use error::SessionError;
pub use manager::ConnectionManager;
pub use media::{CacheEvent, FileFetcher, Lookup, MediaCache};
pub use parley_core::{ConnectionStatus, MessageSynchronizer, OpTicket, SyncError};
pub use parley_proto::{
    Discussion, DiscussionId, MediaKind, Message, MessageId, ParticipantState, ResourceKey, UserId,
    UserRef,
};
pub use session::DiscussionSession;
pub use transport::TransportError;
