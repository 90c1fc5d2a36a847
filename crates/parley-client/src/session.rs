//! Discussion session.
//!
//! [`DiscussionSession`] is the composition root: it binds one discussion id
//! to a [`ConnectionManager`], a [`MessageSynchronizer`], and a
//! [`MediaCache`] for the lifetime of a UI view, and exposes the contract
//! the UI layer consumes.
//!
//! Teardown is structured: each `open` creates a cancellation scope; the
//! event pump and every cache fetch register against it, and `close` cancels
//! the scope so late completions are ignored rather than mutating state that
//! no longer has an observer.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use parley_core::{ConnectionStatus, MessageSynchronizer, SyncAction};
use parley_proto::{Discussion, DiscussionId, Message, MessageId, ServerEvent, UserId};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    api::{DiscussionApi, MessageDraft},
    auth::{CachedTokens, TokenSource},
    config::ClientConfig,
    error::SessionError,
    manager::ConnectionManager,
    media::{FileFetcher, MediaCache},
};

/// State bound to the currently open discussion.
struct ActiveDiscussion {
    id: DiscussionId,
    discussion: Discussion,
    sync: Arc<Mutex<MessageSynchronizer>>,
    cache: Arc<MediaCache>,
    scope: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

/// One user's view of one discussion at a time.
///
/// All methods are safe to call in any order; operations that need an open
/// discussion return [`SessionError::NotOpen`] otherwise.
pub struct DiscussionSession {
    config: Arc<ClientConfig>,
    api: Arc<DiscussionApi>,
    manager: ConnectionManager,
    scope: CancellationToken,
    active: Option<ActiveDiscussion>,
    changes_tx: watch::Sender<u64>,
    changes_rx: watch::Receiver<u64>,
}

impl DiscussionSession {
    /// Build a session from endpoints and a credential source.
    pub fn new(config: ClientConfig, source: impl TokenSource) -> Result<Self, SessionError> {
        let config = Arc::new(config);
        let tokens = Arc::new(CachedTokens::new(source));
        let api = Arc::new(DiscussionApi::new(&config, Arc::clone(&tokens))?);
        let scope = CancellationToken::new();
        let manager = ConnectionManager::new(Arc::clone(&config), tokens, scope.child_token());
        let (changes_tx, changes_rx) = watch::channel(0);

        Ok(Self { config, api, manager, scope, active: None, changes_tx, changes_rx })
    }

    /// Open a discussion: load the snapshot, then connect to its topic.
    ///
    /// Any previously open discussion is closed first; its subscription and
    /// cached handles do not outlive the switch.
    pub async fn open(&mut self, id: DiscussionId) -> Result<(), SessionError> {
        self.close().await;

        let discussion = self.api.discussion(&id).await?;
        let snapshot = self.api.messages(&id).await?;

        let scope = self.scope.child_token();
        let fetcher: Arc<dyn FileFetcher> = self.api.clone();
        let cache = Arc::new(MediaCache::new(fetcher, scope.clone()));

        let mut sync = MessageSynchronizer::new(id.clone());
        let actions = sync.load_snapshot(snapshot);
        let sync = Arc::new(Mutex::new(sync));
        execute_actions(actions, &cache, &self.changes_tx);

        let pump = match self.manager.connect(&id).await {
            Some(events) => Some(tokio::spawn(pump_events(
                events,
                Arc::clone(&sync),
                Arc::clone(&cache),
                self.changes_tx.clone(),
                scope.clone(),
            ))),
            None => None,
        };

        debug!(%id, messages = lock(&sync).len(), "discussion opened");
        self.active = Some(ActiveDiscussion { id, discussion, sync, cache, scope, pump });
        Ok(())
    }

    /// Close the open discussion: disconnect, cancel the open scope, and
    /// release every cached handle. Idempotent.
    pub async fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.manager.disconnect().await;
        active.scope.cancel();
        active.cache.invalidate_all();
        if let Some(pump) = active.pump {
            let _ = pump.await;
        }
        debug!(id = %active.id, "discussion closed");
    }

    /// Switch to another discussion without tearing the session down.
    pub async fn switch_to(&mut self, id: DiscussionId) -> Result<(), SessionError> {
        self.open(id).await
    }

    /// Send a message: apply it optimistically, issue the create call, and
    /// reconcile or roll back with the result.
    pub async fn send(&self, draft: MessageDraft) -> Result<Message, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotOpen)?;
        if !draft.has_content() {
            return Err(SessionError::EmptyMessage);
        }

        let ticket = Uuid::new_v4();
        let optimistic = Message {
            id: None,
            author: self.config.user.clone(),
            timestamp: Utc::now(),
            text: draft.text.clone(),
            image: draft.image.as_ref().map(|(name, _)| name.clone()),
            video: draft.video.as_ref().map(|(name, _)| name.clone()),
        };

        let actions = lock(&active.sync).apply_local_send(ticket, optimistic);
        execute_actions(actions, &active.cache, &self.changes_tx);

        match self.api.create_message(&active.id, draft).await {
            Ok(confirmed) => {
                let actions = lock(&active.sync).confirm_send(ticket, confirmed.clone());
                execute_actions(actions, &active.cache, &self.changes_tx);
                Ok(confirmed)
            },
            Err(e) => {
                let actions = lock(&active.sync).reject_send(ticket);
                execute_actions(actions, &active.cache, &self.changes_tx);
                Err(e.into())
            },
        }
    }

    /// Edit a message's text, optimistically first.
    pub async fn edit(&self, id: &MessageId, text: impl Into<String>) -> Result<(), SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotOpen)?;
        let text = text.into();

        let ticket = Uuid::new_v4();
        let actions = lock(&active.sync).apply_local_edit(ticket, id, text.clone())?;
        execute_actions(actions, &active.cache, &self.changes_tx);

        match self.api.update_message(&active.id, id, &text).await {
            Ok(()) => {
                let actions = lock(&active.sync).confirm_edit(ticket);
                execute_actions(actions, &active.cache, &self.changes_tx);
                Ok(())
            },
            Err(e) => {
                let actions = lock(&active.sync).reject_edit(ticket);
                execute_actions(actions, &active.cache, &self.changes_tx);
                Err(e.into())
            },
        }
    }

    /// Delete a message, optimistically first.
    pub async fn delete(&self, id: &MessageId) -> Result<(), SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotOpen)?;

        let ticket = Uuid::new_v4();
        let actions = lock(&active.sync).apply_local_delete(ticket, id)?;
        execute_actions(actions, &active.cache, &self.changes_tx);

        match self.api.delete_message(&active.id, id).await {
            Ok(()) => {
                let actions = lock(&active.sync).confirm_delete(ticket);
                execute_actions(actions, &active.cache, &self.changes_tx);
                Ok(())
            },
            Err(e) => {
                let actions = lock(&active.sync).reject_delete(ticket);
                execute_actions(actions, &active.cache, &self.changes_tx);
                Err(e.into())
            },
        }
    }

    /// Current sorted, deduplicated message list. Empty when no discussion
    /// is open.
    pub fn messages(&self) -> Vec<Message> {
        self.active.as_ref().map_or_else(Vec::new, |active| lock(&active.sync).messages())
    }

    /// Metadata of the open discussion.
    pub fn discussion(&self) -> Option<Discussion> {
        self.active.as_ref().map(|active| active.discussion.clone())
    }

    /// Id of the open discussion.
    pub fn discussion_id(&self) -> Option<&DiscussionId> {
        self.active.as_ref().map(|active| &active.id)
    }

    /// Participants currently reported as typing.
    pub fn typing_participants(&self) -> Vec<UserId> {
        self.active
            .as_ref()
            .map_or_else(Vec::new, |active| lock(&active.sync).typing_participants())
    }

    /// Last-known connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    /// Subscribe to connection status transitions. The last-known status is
    /// delivered immediately.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.subscribe_status()
    }

    /// Subscribe to the view revision counter. It bumps on every list or
    /// participant change; observers re-read [`Self::messages`] when it
    /// does.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes_rx.clone()
    }

    /// The open discussion's media cache.
    pub fn cache(&self) -> Option<Arc<MediaCache>> {
        self.active.as_ref().map(|active| Arc::clone(&active.cache))
    }
}

impl Drop for DiscussionSession {
    fn drop(&mut self) {
        // Kills the subscription task and any in-flight fetches; each checks
        // this scope before applying results.
        self.scope.cancel();
    }
}

/// Apply decoded push events to the synchronizer in arrival order.
async fn pump_events(
    mut events: mpsc::Receiver<ServerEvent>,
    sync: Arc<Mutex<MessageSynchronizer>>,
    cache: Arc<MediaCache>,
    changes: watch::Sender<u64>,
    scope: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = scope.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let actions = lock(&sync).apply_remote(event);
        execute_actions(actions, &cache, &changes);
    }
}

/// Execute synchronizer actions: bump the view revision and start cache
/// fetches for newly visible attachments.
fn execute_actions(actions: Vec<SyncAction>, cache: &MediaCache, changes: &watch::Sender<u64>) {
    for action in actions {
        match action {
            SyncAction::ListChanged | SyncAction::ParticipantsChanged => {
                changes.send_modify(|revision| *revision = revision.wrapping_add(1));
            },
            SyncAction::FetchAttachment(key) => {
                let _ = cache.get(&key);
            },
        }
    }
}

fn lock(sync: &Mutex<MessageSynchronizer>) -> std::sync::MutexGuard<'_, MessageSynchronizer> {
    sync.lock().unwrap_or_else(PoisonError::into_inner)
}
