//! Message list synchronization.
//!
//! [`MessageSynchronizer`] reconciles three independent, partially-ordered
//! event sources into one consistent message list: the initial REST snapshot,
//! server-pushed create/update/delete/status events, and locally-initiated
//! optimistic sends, edits, and deletes.
//!
//! # Invariants
//!
//! - No two entries share a server identifier.
//! - The list is fully sorted after every mutation: ascending by timestamp,
//!   ties broken by arrival order (stable insert).
//! - Every mutation is idempotent by identifier: the server may redeliver any
//!   event, and local echoes race server confirmations, so applying the same
//!   `create`/`update` twice is a no-op the second time and a `delete` for an
//!   absent id never errors.
//!
//! Local operations carry an [`OpTicket`] so the eventual server response can
//! be matched back to the optimistic change instead of being treated as a
//! brand-new remote event.

use std::collections::HashMap;

use parley_proto::{
    DiscussionId, Message, MessageId, ParticipantState, ResourceKey, ServerEvent, UserId,
};
use uuid::Uuid;

use crate::error::SyncError;

/// Correlation token for a locally-initiated operation awaiting server
/// confirmation.
pub type OpTicket = Uuid;

/// Actions the synchronizer produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// The message list changed; observers should re-render.
    ListChanged,
    /// A newly visible attachment reference should be fetched into the cache.
    FetchAttachment(ResourceKey),
    /// The participant status map changed.
    ParticipantsChanged,
}

/// One list entry: the message plus bookkeeping for ordering and pending
/// reconciliation.
#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Monotonic arrival counter; the tie-break for equal timestamps.
    arrival: u64,
    /// Ticket of the local send this entry mirrors, until confirmed.
    ticket: Option<OpTicket>,
}

/// A locally-initiated mutation awaiting server confirmation. Edit and delete
/// retain what they replaced so a failed call can roll back.
#[derive(Debug, Clone)]
enum PendingOp {
    Send,
    Edit { id: MessageId, previous: String },
    Delete { entry: Entry },
}

/// The canonical ordered message list for one discussion.
#[derive(Debug, Clone)]
pub struct MessageSynchronizer {
    discussion: DiscussionId,
    entries: Vec<Entry>,
    next_arrival: u64,
    pending: HashMap<OpTicket, PendingOp>,
    participants: HashMap<UserId, ParticipantState>,
}

impl MessageSynchronizer {
    /// Create an empty synchronizer bound to one discussion.
    pub fn new(discussion: DiscussionId) -> Self {
        Self {
            discussion,
            entries: Vec::new(),
            next_arrival: 0,
            pending: HashMap::new(),
            participants: HashMap::new(),
        }
    }

    /// Discussion this synchronizer is bound to.
    pub fn discussion(&self) -> &DiscussionId {
        &self.discussion
    }

    /// Replace the list wholesale with a snapshot.
    ///
    /// Clears pending operations and participant status. Snapshot entries
    /// without a server id are skipped; duplicate ids keep the first
    /// occurrence.
    pub fn load_snapshot(&mut self, messages: Vec<Message>) -> Vec<SyncAction> {
        self.entries.clear();
        self.next_arrival = 0;
        self.pending.clear();
        self.participants.clear();

        let mut actions = vec![SyncAction::ListChanged];
        for message in messages {
            let Some(id) = &message.id else { continue };
            if self.contains(id) {
                continue;
            }
            for key in message.attachment_keys(&self.discussion) {
                actions.push(SyncAction::FetchAttachment(key));
            }
            let arrival = self.bump_arrival();
            self.entries.push(Entry { message, arrival, ticket: None });
        }
        self.entries.sort_by_key(|e| (e.message.timestamp, e.arrival));

        actions
    }

    /// Merge one server-pushed event.
    ///
    /// Events that name a different discussion are dropped; this guards
    /// against frames that slip through a connection teardown during a
    /// discussion switch.
    pub fn apply_remote(&mut self, event: ServerEvent) -> Vec<SyncAction> {
        if let Some(id) = event.discussion_id()
            && *id != self.discussion
        {
            return vec![];
        }

        match event {
            ServerEvent::Create { message, .. } => self.merge_created(message),
            ServerEvent::Update { message, .. } => self.merge_updated(message),
            ServerEvent::Delete { message_id, .. } => self.merge_deleted(&message_id),
            ServerEvent::Status { status, .. } => {
                let changed = match status.state {
                    ParticipantState::Typing => {
                        self.participants.insert(status.user.id, status.state)
                            != Some(ParticipantState::Typing)
                    },
                    ParticipantState::Idle => self.participants.remove(&status.user.id).is_some(),
                };
                if changed { vec![SyncAction::ParticipantsChanged] } else { vec![] }
            },
        }
    }

    /// Apply a local send optimistically. The message must not have a server
    /// id yet; it is inserted at its sorted position immediately.
    pub fn apply_local_send(&mut self, ticket: OpTicket, message: Message) -> Vec<SyncAction> {
        self.pending.insert(ticket, PendingOp::Send);
        let arrival = self.bump_arrival();
        self.insert_sorted(Entry { message, arrival, ticket: Some(ticket) });
        vec![SyncAction::ListChanged]
    }

    /// Reconcile a local send with the server's confirmation.
    ///
    /// If the push stream echoed the create before the HTTP response landed,
    /// the confirmed id is already present and the optimistic entry is
    /// dropped instead of duplicated. Unknown tickets are a no-op.
    pub fn confirm_send(&mut self, ticket: OpTicket, confirmed: Message) -> Vec<SyncAction> {
        if self.pending.remove(&ticket).is_none() {
            return vec![];
        }

        let position = self.entries.iter().position(|e| e.ticket == Some(ticket));

        let Some(id) = confirmed.id.clone() else {
            // A confirmation without an id cannot be reconciled; keep the
            // optimistic entry and let the push stream supply the real one.
            return vec![];
        };

        if self.contains(&id) {
            // The push echo won the race.
            if let Some(i) = position {
                self.entries.remove(i);
                return vec![SyncAction::ListChanged];
            }
            return vec![];
        }

        match position {
            Some(i) => {
                let mut actions = vec![SyncAction::ListChanged];
                for key in confirmed.attachment_keys(&self.discussion) {
                    actions.push(SyncAction::FetchAttachment(key));
                }
                self.entries[i].message = confirmed;
                self.entries[i].ticket = None;
                self.entries.sort_by_key(|e| (e.message.timestamp, e.arrival));
                actions
            },
            // Entry vanished (snapshot reload); treat as a fresh remote create.
            None => self.merge_created(confirmed),
        }
    }

    /// Roll back a failed local send.
    pub fn reject_send(&mut self, ticket: OpTicket) -> Vec<SyncAction> {
        if self.pending.remove(&ticket).is_none() {
            return vec![];
        }
        if let Some(i) = self.entries.iter().position(|e| e.ticket == Some(ticket)) {
            self.entries.remove(i);
            return vec![SyncAction::ListChanged];
        }
        vec![]
    }

    /// Apply a local edit optimistically.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownMessage`] if no message has the given id.
    pub fn apply_local_edit(
        &mut self,
        ticket: OpTicket,
        id: &MessageId,
        text: String,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let Some(i) = self.position(id) else {
            return Err(SyncError::UnknownMessage(id.clone()));
        };

        let previous = std::mem::replace(&mut self.entries[i].message.text, text);
        self.pending.insert(ticket, PendingOp::Edit { id: id.clone(), previous });
        Ok(vec![SyncAction::ListChanged])
    }

    /// Mark a local edit confirmed. The optimistic text already matches.
    pub fn confirm_edit(&mut self, ticket: OpTicket) -> Vec<SyncAction> {
        self.pending.remove(&ticket);
        vec![]
    }

    /// Roll back a failed local edit, restoring the previous text.
    pub fn reject_edit(&mut self, ticket: OpTicket) -> Vec<SyncAction> {
        let Some(PendingOp::Edit { id, previous }) = self.pending.remove(&ticket) else {
            return vec![];
        };
        if let Some(i) = self.position(&id) {
            self.entries[i].message.text = previous;
            return vec![SyncAction::ListChanged];
        }
        vec![]
    }

    /// Apply a local delete optimistically.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownMessage`] if no message has the given id.
    pub fn apply_local_delete(
        &mut self,
        ticket: OpTicket,
        id: &MessageId,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let Some(i) = self.position(id) else {
            return Err(SyncError::UnknownMessage(id.clone()));
        };

        let entry = self.entries.remove(i);
        self.pending.insert(ticket, PendingOp::Delete { entry });
        Ok(vec![SyncAction::ListChanged])
    }

    /// Mark a local delete confirmed.
    pub fn confirm_delete(&mut self, ticket: OpTicket) -> Vec<SyncAction> {
        self.pending.remove(&ticket);
        vec![]
    }

    /// Roll back a failed local delete, reinserting the removed message at
    /// its original position. If the server re-delivered the message in the
    /// meantime, the reinsert is skipped (no duplicate).
    pub fn reject_delete(&mut self, ticket: OpTicket) -> Vec<SyncAction> {
        let Some(PendingOp::Delete { entry }) = self.pending.remove(&ticket) else {
            return vec![];
        };
        if let Some(id) = &entry.message.id
            && self.contains(id)
        {
            return vec![];
        }
        self.insert_sorted(entry);
        vec![SyncAction::ListChanged]
    }

    /// Current sorted, deduplicated message sequence.
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Number of messages in the list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Participants currently reported as typing, sorted by id.
    pub fn typing_participants(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.participants.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn merge_created(&mut self, message: Message) -> Vec<SyncAction> {
        let Some(id) = &message.id else {
            // Remote messages without an id cannot be deduplicated; drop.
            return vec![];
        };
        if self.contains(id) {
            return vec![];
        }

        let mut actions = vec![SyncAction::ListChanged];
        for key in message.attachment_keys(&self.discussion) {
            actions.push(SyncAction::FetchAttachment(key));
        }
        let arrival = self.bump_arrival();
        self.insert_sorted(Entry { message, arrival, ticket: None });
        actions
    }

    fn merge_updated(&mut self, message: Message) -> Vec<SyncAction> {
        let Some(id) = &message.id else {
            return vec![];
        };
        // No speculative insert for unknown ids.
        let Some(i) = self.position(id) else {
            return vec![];
        };

        let previous_keys = self.entries[i].message.attachment_keys(&self.discussion);
        let mut actions = vec![SyncAction::ListChanged];
        for key in message.attachment_keys(&self.discussion) {
            if !previous_keys.contains(&key) {
                actions.push(SyncAction::FetchAttachment(key));
            }
        }

        self.entries[i].message = message;
        self.entries.sort_by_key(|e| (e.message.timestamp, e.arrival));
        actions
    }

    fn merge_deleted(&mut self, id: &MessageId) -> Vec<SyncAction> {
        match self.position(id) {
            Some(i) => {
                self.entries.remove(i);
                vec![SyncAction::ListChanged]
            },
            None => vec![],
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id.as_ref() == Some(id))
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let at = self
            .entries
            .partition_point(|e| (e.message.timestamp, e.arrival) <= (entry.message.timestamp, entry.arrival));
        self.entries.insert(at, entry);
    }

    fn bump_arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }
}
