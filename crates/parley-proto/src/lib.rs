//! Wire model
//!
//! Data types and tagged wire events for the parley discussion protocol.
//! Frames are JSON text; every push frame is decoded and validated here, at
//! the transport boundary, so that the synchronization logic above never
//! handles a raw untyped payload.
//!
//! # Components
//!
//! - [`Discussion`], [`Message`], [`UserRef`]: the data model
//! - [`ServerEvent`]: server-pushed create/update/delete/status frames
//! - [`ClientFrame`]: client-sent frames (topic subscription)
//! - [`ResourceKey`], [`MediaKind`]: keys for attachment blobs

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod event;
mod types;

pub use error::ProtocolError;
pub use event::{ClientFrame, ServerEvent};
pub use types::{
    Discussion, DiscussionId, MediaKind, Message, MessageId, ParticipantState, ParticipantStatus,
    ResourceKey, UserId, UserRef,
};
