//! Error types for the synchronization core.

use parley_proto::MessageId;
use thiserror::Error;

/// Errors raised by [`crate::MessageSynchronizer`] for caller mistakes.
///
/// Remote events never produce errors: redeliveries, unknown ids, and stale
/// frames all merge as no-ops. Only locally-initiated operations that name a
/// message which does not exist are rejected, so the caller can report the
/// failure instead of optimistically mutating nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A local edit or delete named a message that is not in the list.
    #[error("no message with id {0}")]
    UnknownMessage(MessageId),
}
