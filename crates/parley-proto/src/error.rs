//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding or validating wire frames.
///
/// A malformed push frame is never fatal to the stream: the transport drops
/// the single frame, logs the error, and keeps reading.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match any known action.
    #[error("malformed event frame: {0}")]
    Decode(String),

    /// Frame could not be serialized for sending.
    #[error("frame encoding failed: {0}")]
    Encode(String),

    /// A create/update event carried a message without a server identifier.
    #[error("event message is missing a server id")]
    MissingMessageId,

    /// A message violated the content invariant (no body, no attachment).
    #[error("message has neither text nor attachments")]
    EmptyMessage,
}
