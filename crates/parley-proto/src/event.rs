//! Tagged wire events.
//!
//! Push frames are JSON objects tagged by an `action` field. They are decoded
//! into [`ServerEvent`] and validated here, at the transport boundary, so the
//! synchronization logic never sees a raw payload. Unknown actions are
//! rejected rather than silently ignored.
//!
//! # Invariants
//!
//! - Each action tag maps to exactly one variant (enforced by the serde tag).
//! - A decoded create/update event always carries a server message id and a
//!   message that satisfies the content invariant.

use serde::{Deserialize, Serialize};

use crate::{
    error::ProtocolError,
    types::{DiscussionId, Message, MessageId, ParticipantStatus},
};

/// A server-pushed event frame.
///
/// `discussion_id` is optional on the wire; `status` frames routinely omit it
/// and apply to the currently subscribed discussion. The transport resolves
/// missing ids against the active topic before forwarding (see
/// [`ServerEvent::assume_discussion`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ServerEvent {
    /// A message was created.
    Create {
        /// Discussion the message belongs to.
        #[serde(rename = "discussionId", skip_serializing_if = "Option::is_none")]
        discussion_id: Option<DiscussionId>,
        /// The created message.
        message: Message,
    },

    /// An existing message was edited.
    Update {
        /// Discussion the message belongs to.
        #[serde(rename = "discussionId", skip_serializing_if = "Option::is_none")]
        discussion_id: Option<DiscussionId>,
        /// The full replacement message.
        message: Message,
    },

    /// A message was deleted.
    Delete {
        /// Discussion the message belonged to.
        #[serde(rename = "discussionId", skip_serializing_if = "Option::is_none")]
        discussion_id: Option<DiscussionId>,
        /// Identifier of the removed message.
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },

    /// A participant changed activity state.
    Status {
        /// Discussion the status applies to. Usually omitted on the wire.
        #[serde(rename = "discussionId", skip_serializing_if = "Option::is_none")]
        discussion_id: Option<DiscussionId>,
        /// The reported status.
        status: ParticipantStatus,
    },
}

impl ServerEvent {
    /// Decode and validate one push frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Decode`] if the text is not valid JSON or carries an
    ///   unknown action
    /// - [`ProtocolError::MissingMessageId`] if a create/update message lacks
    ///   a server id
    /// - [`ProtocolError::EmptyMessage`] if a create/update message violates
    ///   the content invariant
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        if let Self::Create { message, .. } | Self::Update { message, .. } = &event {
            if message.id.is_none() {
                return Err(ProtocolError::MissingMessageId);
            }
            if !message.has_content() {
                return Err(ProtocolError::EmptyMessage);
            }
        }

        Ok(event)
    }

    /// Encode the event as a JSON frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Discussion the event targets, if the frame named one.
    pub fn discussion_id(&self) -> Option<&DiscussionId> {
        match self {
            Self::Create { discussion_id, .. }
            | Self::Update { discussion_id, .. }
            | Self::Delete { discussion_id, .. }
            | Self::Status { discussion_id, .. } => discussion_id.as_ref(),
        }
    }

    /// Resolve a missing discussion id against the active topic.
    pub fn assume_discussion(&mut self, current: &DiscussionId) {
        match self {
            Self::Create { discussion_id, .. }
            | Self::Update { discussion_id, .. }
            | Self::Delete { discussion_id, .. }
            | Self::Status { discussion_id, .. } => {
                if discussion_id.is_none() {
                    *discussion_id = Some(current.clone());
                }
            },
        }
    }
}

/// A client-sent frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Subscribe to one discussion's topic. Sent once after the transport
    /// opens; the server starts pushing events for that discussion.
    Subscribe {
        /// Discussion topic to subscribe to.
        #[serde(rename = "discussionId")]
        discussion_id: DiscussionId,
    },
}

impl ClientFrame {
    /// Encode the frame as JSON text.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::types::{ParticipantState, UserId, UserRef};

    fn message(id: Option<&str>, text: &str) -> Message {
        Message {
            id: id.map(MessageId::new),
            author: UserRef { id: UserId::new("u1"), name: "ada".to_owned() },
            timestamp: DateTime::from_timestamp(100, 0).unwrap(),
            text: text.to_owned(),
            image: None,
            video: None,
        }
    }

    #[test]
    fn create_event_round_trip() {
        let event = ServerEvent::Create {
            discussion_id: Some(DiscussionId::new("d1")),
            message: message(Some("m1"), "hello"),
        };

        let encoded = event.encode().unwrap();
        let decoded = ServerEvent::decode(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn decode_reads_wire_field_names() {
        let text = r#"{
            "action": "delete",
            "discussionId": "d1",
            "messageId": "m7"
        }"#;

        let event = ServerEvent::decode(text).unwrap();
        assert_eq!(event, ServerEvent::Delete {
            discussion_id: Some(DiscussionId::new("d1")),
            message_id: MessageId::new("m7"),
        });
    }

    #[test]
    fn unknown_action_is_rejected() {
        let text = r#"{"action": "explode"}"#;
        assert!(matches!(ServerEvent::decode(text), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn create_without_id_is_rejected() {
        let event = ServerEvent::Create { discussion_id: None, message: message(None, "hello") };
        let encoded = event.encode().unwrap();
        assert_eq!(ServerEvent::decode(&encoded), Err(ProtocolError::MissingMessageId));
    }

    #[test]
    fn create_without_content_is_rejected() {
        let event = ServerEvent::Create { discussion_id: None, message: message(Some("m1"), "") };
        let encoded = event.encode().unwrap();
        assert_eq!(ServerEvent::decode(&encoded), Err(ProtocolError::EmptyMessage));
    }

    #[test]
    fn status_without_discussion_resolves_to_current() {
        let text = r#"{
            "action": "status",
            "status": { "user": { "id": "u2", "name": "grace" }, "state": "typing" }
        }"#;

        let mut event = ServerEvent::decode(text).unwrap();
        assert_eq!(event.discussion_id(), None);

        event.assume_discussion(&DiscussionId::new("d1"));
        assert_eq!(event.discussion_id(), Some(&DiscussionId::new("d1")));

        let ServerEvent::Status { status, .. } = event else {
            unreachable!("decoded a status frame");
        };
        assert_eq!(status.state, ParticipantState::Typing);
    }

    #[test]
    fn subscribe_frame_encodes_action_tag() {
        let frame = ClientFrame::Subscribe { discussion_id: DiscussionId::new("d1") };
        let encoded = frame.encode().unwrap();

        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["discussionId"], "d1");
    }
}
