//! Session-level error types.

use parley_core::SyncError;
use thiserror::Error;

use crate::api::ApiError;

/// Errors returned by [`crate::DiscussionSession`] operations.
///
/// Only locally-initiated calls fail: snapshot loads and CRUD calls surface
/// their errors to the caller synchronously, after any optimistic change has
/// been rolled back. Transport and connection failures never appear here;
/// they are recovered into [`parley_core::ConnectionStatus`] values.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No discussion is open.
    #[error("no discussion is open")]
    NotOpen,

    /// The draft has neither text nor attachments.
    #[error("message has neither text nor attachments")]
    EmptyMessage,

    /// A local edit or delete named an unknown message.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The underlying HTTP call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}
