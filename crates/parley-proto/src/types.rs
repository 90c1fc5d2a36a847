//! Core data model: discussions, messages, participants, and media keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a discussion thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscussionId(String);

/// Server-assigned identifier of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

/// Stable identifier of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            /// Wrap a raw identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }
    };
}

string_id!(DiscussionId);
string_id!(MessageId);
string_id!(UserId);

/// Reference to a user, as embedded in messages and status frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Stable user identifier.
    pub id: UserId,
    /// Display name at the time the referencing object was created.
    pub name: String,
}

/// A named thread of messages.
///
/// Immutable once loaded; title edits happen elsewhere and arrive only via a
/// fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discussion {
    /// Stable discussion identifier.
    pub id: DiscussionId,
    /// Human-readable title.
    pub title: String,
    /// User who created the discussion.
    pub creator: UserRef,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A single message in a discussion.
///
/// `id` is `None` while the message is a local optimistic entry the server
/// has not yet acknowledged. Invariant: a message has a non-empty body or at
/// least one attachment reference (see [`Message::has_content`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier. Absent until the server confirms the send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Message author.
    pub author: UserRef,
    /// Message timestamp, used for list ordering.
    pub timestamp: DateTime<Utc>,
    /// Text body. May be empty when an attachment is present.
    #[serde(default)]
    pub text: String,
    /// Image attachment file name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Video attachment file name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
}

impl Message {
    /// Whether the message satisfies the content invariant: a non-empty body
    /// or at least one attachment reference.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || self.image.is_some() || self.video.is_some()
    }

    /// Cache keys for every attachment this message references.
    pub fn attachment_keys(&self, discussion: &DiscussionId) -> Vec<ResourceKey> {
        let mut keys = Vec::new();
        if let Some(name) = &self.image {
            keys.push(ResourceKey::new(discussion.clone(), MediaKind::Image, name.clone()));
        }
        if let Some(name) = &self.video {
            keys.push(ResourceKey::new(discussion.clone(), MediaKind::Video, name.clone()));
        }
        keys
    }
}

/// Category of a binary attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Video clip.
    Video,
}

impl MediaKind {
    /// URL path segment used by the file endpoint.
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
        }
    }
}

/// Key identifying one cached attachment blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Discussion the attachment belongs to.
    pub discussion: DiscussionId,
    /// Attachment category.
    pub kind: MediaKind,
    /// File name within the discussion's media namespace.
    pub filename: String,
}

impl ResourceKey {
    /// Build a key from its parts.
    pub fn new(discussion: DiscussionId, kind: MediaKind, filename: impl Into<String>) -> Self {
        Self { discussion, kind, filename: filename.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.discussion, self.kind.path_segment(), self.filename)
    }
}

/// Activity state a participant reports for the current discussion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    /// The participant is composing a message.
    Typing,
    /// The participant stopped composing.
    Idle,
}

/// Payload of a `status` push frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    /// Participant the status applies to.
    pub user: UserRef,
    /// Reported activity state.
    pub state: ParticipantState,
}
