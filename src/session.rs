//! The engine's public surface.
//!
//! [`ChatSession`] owns one user's sync state: the open conversation's
//! [`Reconciler`], the pending-event buffer, the live subscriptions, and the
//! signed-URL map. All of it sits behind a single `tokio::sync::Mutex` that
//! is only ever held for short, non-blocking sections; network calls happen
//! between lock scopes.
//!
//! Every conversation switch bumps an epoch counter. Background work (feed
//! dispatch, bulk loads, hydration, URL signing) captures the epoch it was
//! started under and drops its result if the epoch has moved on.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::backend::{BackendError, ChangeFeed, ChatBackend, ObjectStorage};
use crate::cache::{CacheError, CacheStore, ConversationSnapshot, KvCache, SnapshotLimits};
use crate::clock::Clock;
use crate::config::{SyncConfig, EVENT_CHANNEL_CAPACITY};
use crate::feed::{self, Subscription};
use crate::hydration::HydrationScheduler;
use crate::ingest::ChangeKind;
use crate::journal::LoadJournal;
use crate::loader;
use crate::logging::conv_id;
use crate::model::{
    AttachmentId, ChatOverview, ConversationId, MessageId, Millis, Profile, ThreadId, UserId,
};
use crate::optimistic::{self, ReactionToggle};
use crate::pending::PendingEventBuffer;
use crate::reconciler::Reconciler;
use crate::view::{build_view, ChatView};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("no conversation is open")]
    NoActiveConversation,
    #[error("the conversation was switched before the operation finished")]
    Superseded,
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("message {0} was not sent by this user")]
    NotOwner(MessageId),
    #[error("invalid media: {0}")]
    InvalidMedia(String),
    #[error("message body is empty")]
    EmptyMessage,
}

impl SyncError {
    /// One-line text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Backend(BackendError::Network(_)) => {
                "Couldn't reach the server. Check your connection and try again.".to_string()
            }
            SyncError::Backend(BackendError::Status { status, .. }) if *status == 401 || *status == 403 => {
                "You don't have permission to do that.".to_string()
            }
            SyncError::Backend(_) => "Something went wrong on the server. Please try again.".to_string(),
            SyncError::Cache(_) => "Couldn't update local storage.".to_string(),
            SyncError::NoActiveConversation => "Open a conversation first.".to_string(),
            SyncError::Superseded => "The conversation changed before this finished.".to_string(),
            SyncError::UnknownMessage(_) => "That message is no longer available.".to_string(),
            SyncError::UnknownThread(_) => "That thread is no longer available.".to_string(),
            SyncError::NotOwner(_) => "You can only delete your own messages.".to_string(),
            SyncError::InvalidMedia(reason) => format!("Couldn't send that file: {reason}."),
            SyncError::EmptyMessage => "Type a message first.".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Broadcast to every [`ChatSession::subscribe_events`] receiver.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The open conversation's view changed; call [`ChatSession::view`].
    Changed { conversation_id: ConversationId },
    /// A bulk load finished.
    Loaded {
        conversation_id: ConversationId,
        message_count: usize,
    },
    Error {
        conversation_id: Option<ConversationId>,
        message: String,
    },
    /// A row event from a city-scoped feed.
    CityActivity {
        city: String,
        table: String,
        kind: ChangeKind,
        record: Value,
    },
    Closed { conversation_id: ConversationId },
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The signed-in user every call acts on behalf of.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: UserId,
}

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ChatBackend>,
    pub storage: Arc<dyn ObjectStorage>,
    pub feed: Arc<dyn ChangeFeed>,
    pub cache: Arc<dyn KvCache>,
    pub clock: Arc<dyn Clock>,
}

pub(crate) struct SessionState {
    pub epoch: u64,
    pub conversation: Option<Reconciler>,
    pub pending: PendingEventBuffer,
    pub signed_urls: HashMap<AttachmentId, String>,
    pub thread_reads: HashMap<ThreadId, Millis>,
    pub subscription: Option<Subscription>,
    pub city: Option<Subscription>,
    pub last_error: Option<String>,
    pub journal: LoadJournal,
}

impl SessionState {
    /// The open conversation, provided `epoch` is still current.
    pub fn active(&self, epoch: u64) -> Option<&Reconciler> {
        if self.epoch != epoch {
            return None;
        }
        self.conversation.as_ref()
    }

    pub fn active_mut(&mut self, epoch: u64) -> Option<&mut Reconciler> {
        if self.epoch != epoch {
            return None;
        }
        self.conversation.as_mut()
    }

    /// Tear down everything scoped to the open conversation and start a new
    /// epoch. Returns the conversation that was open.
    fn reset(&mut self, hydration: &HydrationScheduler) -> Option<ConversationId> {
        if let Some(sub) = self.subscription.take() {
            sub.close();
        }
        self.pending.clear();
        self.journal.clear();
        hydration.cancel_all();
        self.epoch += 1;
        self.signed_urls.clear();
        self.thread_reads.clear();
        self.last_error = None;
        self.conversation
            .take()
            .map(|rec| rec.conversation_id().clone())
    }
}

pub(crate) struct SessionShared {
    pub ctx: UserContext,
    pub config: SyncConfig,
    pub clock: Arc<dyn Clock>,
    pub backend: Arc<dyn ChatBackend>,
    pub storage: Arc<dyn ObjectStorage>,
    pub feed: Arc<dyn ChangeFeed>,
    pub cache: CacheStore,
    pub hydration: HydrationScheduler,
    pub state: Mutex<SessionState>,
    pub events: broadcast::Sender<SessionEvent>,
}

pub(crate) type SharedSession = Arc<SessionShared>;

impl SessionShared {
    pub fn me(&self) -> &UserId {
        &self.ctx.user_id
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn snapshot_limits(&self) -> SnapshotLimits {
        SnapshotLimits {
            max_messages: self.config.snapshot_max_messages,
            max_threads: self.config.snapshot_max_threads,
        }
    }

    /// Schedule a coalesced snapshot write of the open conversation and
    /// notify listeners. The snapshot is captured when the write fires.
    pub fn publish_change(self: &Arc<Self>, st: &SessionState) {
        let Some(rec) = st.conversation.as_ref() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let epoch = st.epoch;
        self.cache
            .schedule_conversation_write(self.me(), rec.conversation_id(), async move {
                let Some(shared) = weak.upgrade() else {
                    return None;
                };
                let limits = shared.snapshot_limits();
                let st = shared.state.lock().await;
                let snapshot = st
                    .active(epoch)
                    .map(|rec| ConversationSnapshot::capture(rec, limits));
                drop(st);
                snapshot
            });
        self.emit(SessionEvent::Changed {
            conversation_id: rec.conversation_id().clone(),
        });
    }

    /// Write the open conversation's snapshot now if a coalesced write for
    /// it has not fired yet. Called before the conversation is torn down.
    fn flush_snapshot(&self, st: &SessionState) {
        let Some(rec) = st.conversation.as_ref() else {
            return;
        };
        if self
            .cache
            .is_conversation_write_pending(self.me(), rec.conversation_id())
        {
            let snapshot = ConversationSnapshot::capture(rec, self.snapshot_limits());
            self.cache.flush_conversation(self.me(), &snapshot);
        }
    }

    /// Notify listeners without touching the cache.
    pub fn notify_change(&self, st: &SessionState) {
        if let Some(rec) = st.conversation.as_ref() {
            self.emit(SessionEvent::Changed {
                conversation_id: rec.conversation_id().clone(),
            });
        }
    }

    /// Record `error` as the latest user-facing failure and broadcast it.
    pub async fn report(&self, error: &SyncError) {
        if matches!(error, SyncError::Superseded) {
            return;
        }
        let message = error.user_message();
        tracing::warn!("session: {} ({})", error, message);
        let conversation_id = {
            let mut st = self.state.lock().await;
            st.last_error = Some(message.clone());
            st.conversation
                .as_ref()
                .map(|rec| rec.conversation_id().clone())
        };
        self.emit(SessionEvent::Error {
            conversation_id,
            message,
        });
    }
}

// ---------------------------------------------------------------------------
// ChatSession
// ---------------------------------------------------------------------------

/// Handle to one user's chat sync engine. Cheap to clone.
#[derive(Clone)]
pub struct ChatSession {
    shared: SharedSession,
}

impl ChatSession {
    pub fn new(ctx: UserContext, config: SyncConfig, deps: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = SessionShared {
            cache: CacheStore::new(deps.cache, config.cache_write_delay),
            hydration: HydrationScheduler::new(config.hydration_delay),
            state: Mutex::new(SessionState {
                epoch: 0,
                conversation: None,
                pending: PendingEventBuffer::new(config.pending_max_messages),
                signed_urls: HashMap::new(),
                thread_reads: HashMap::new(),
                subscription: None,
                city: None,
                last_error: None,
                journal: LoadJournal::default(),
            }),
            ctx,
            config,
            clock: deps.clock,
            backend: deps.backend,
            storage: deps.storage,
            feed: deps.feed,
            events,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn user_id(&self) -> &UserId {
        self.shared.me()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    async fn surface<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        if let Err(e) = &result {
            self.shared.report(e).await;
        }
        result
    }

    // -----------------------------------------------------------------------
    // Conversation lifecycle
    // -----------------------------------------------------------------------

    /// Switch to `conversation`: tear down the previous one, pre-fill from
    /// the cache, subscribe to the change feed, then run the bulk load.
    ///
    /// Returns the number of messages after the load. Fails with
    /// [`SyncError::Superseded`] if another conversation was opened (or this
    /// one closed) before the load finished.
    pub async fn open_conversation(&self, conversation: ConversationId) -> Result<usize, SyncError> {
        let shared = &self.shared;
        let epoch = {
            let mut st = shared.state.lock().await;
            shared.flush_snapshot(&st);
            let previous = st.reset(&shared.hydration);
            if let Some(previous) = previous {
                shared.emit(SessionEvent::Closed {
                    conversation_id: previous,
                });
            }

            let mut rec = Reconciler::new(conversation.clone());
            if let Some(snapshot) = shared.cache.read_conversation(
                shared.me(),
                &conversation,
                shared.config.conversation_cache_max_age_ms,
            ) {
                let restored = snapshot.restore_into(&mut rec);
                tracing::debug!(
                    "session: pre-filled {} with {} cached message(s)",
                    conv_id(conversation.as_str()),
                    restored.len()
                );
            }
            st.conversation = Some(rec);
            shared.notify_change(&st);
            st.epoch
        };
        tracing::info!("session: opening {}", conv_id(conversation.as_str()));

        match feed::subscribe_conversation(shared, epoch, conversation.clone()).await {
            Ok(sub) => {
                let mut st = shared.state.lock().await;
                if st.active(epoch).is_none() {
                    sub.close();
                    return Err(SyncError::Superseded);
                }
                st.subscription = Some(sub);
            }
            Err(e) => {
                // The bulk load still gives a usable (if static) view.
                self.shared.report(&SyncError::Backend(e)).await;
            }
        }

        let result = loader::load_conversation(shared, epoch).await;
        self.surface_in(epoch, result).await
    }

    /// Like `surface`, but a failure from a conversation that is no longer
    /// open becomes `Superseded` and is not reported.
    async fn surface_in<T>(&self, epoch: u64, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match result {
            Err(e) if !matches!(e, SyncError::Superseded) => {
                if self.shared.state.lock().await.epoch != epoch {
                    return Err(SyncError::Superseded);
                }
                self.shared.report(&e).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Close the open conversation, if any.
    pub async fn close_conversation(&self) {
        let previous = {
            let mut st = self.shared.state.lock().await;
            self.shared.flush_snapshot(&st);
            st.reset(&self.shared.hydration)
        };
        if let Some(conversation_id) = previous {
            tracing::info!("session: closed {}", conv_id(conversation_id.as_str()));
            self.shared.emit(SessionEvent::Closed { conversation_id });
        }
    }

    /// Re-run the bulk load for the open conversation.
    pub async fn reload(&self) -> Result<usize, SyncError> {
        let epoch = self.current_epoch().await?;
        let result = loader::load_conversation(&self.shared, epoch).await;
        self.surface_in(epoch, result).await
    }

    async fn current_epoch(&self) -> Result<u64, SyncError> {
        let st = self.shared.state.lock().await;
        match st.conversation {
            Some(_) => Ok(st.epoch),
            None => Err(SyncError::NoActiveConversation),
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        let st = self.shared.state.lock().await;
        st.conversation
            .as_ref()
            .map(|rec| rec.conversation_id().clone())
    }

    /// An immutable, render-ready copy of the open conversation.
    pub async fn view(&self) -> Option<ChatView> {
        let st = self.shared.state.lock().await;
        let rec = st.conversation.as_ref()?;
        Some(build_view(
            rec,
            &st.signed_urls,
            &st.thread_reads,
            self.shared.me(),
            st.pending.message_count(),
            st.last_error.clone(),
        ))
    }

    /// A copy of the raw reconciled state of the open conversation.
    pub async fn snapshot(&self) -> Option<Reconciler> {
        let st = self.shared.state.lock().await;
        st.conversation.clone()
    }

    pub async fn signed_url(&self, attachment: &AttachmentId) -> Option<String> {
        let st = self.shared.state.lock().await;
        st.signed_urls.get(attachment).cloned()
    }

    /// Hydration checks currently waiting or running.
    pub fn pending_hydrations(&self) -> usize {
        self.shared.hydration.pending()
    }

    pub fn is_hydration_scheduled(&self, message: &MessageId) -> bool {
        self.shared.hydration.is_scheduled(message)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub async fn send_text(&self, body: &str) -> Result<MessageId, SyncError> {
        let result = optimistic::send_text(&self.shared, body).await;
        self.surface(result).await
    }

    /// Upload `bytes` and send them as a media message. The MIME type is
    /// guessed from `filename`.
    pub async fn send_media(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<MessageId, SyncError> {
        let result = optimistic::send_media(&self.shared, bytes, filename, caption).await;
        self.surface(result).await
    }

    pub async fn create_thread(&self, body: &str, title: Option<&str>) -> Result<ThreadId, SyncError> {
        let result = optimistic::create_thread(&self.shared, body, title).await;
        self.surface(result).await
    }

    pub async fn toggle_reaction(
        &self,
        message: &MessageId,
        emoji: &str,
    ) -> Result<ReactionToggle, SyncError> {
        let result = optimistic::toggle_reaction(&self.shared, message, emoji).await;
        self.surface(result).await
    }

    pub async fn delete_own_message(&self, message: &MessageId) -> Result<(), SyncError> {
        let result = optimistic::delete_own_message(&self.shared, message).await;
        self.surface(result).await
    }

    // -----------------------------------------------------------------------
    // UI focus
    // -----------------------------------------------------------------------

    /// Focus a thread (`None` for the main timeline) and mark it read.
    pub async fn open_thread(&self, thread: Option<ThreadId>) -> Result<(), SyncError> {
        let mut st = self.shared.state.lock().await;
        let now = self.shared.clock.now_ms();
        let epoch = st.epoch;
        let rec = st.active_mut(epoch).ok_or(SyncError::NoActiveConversation)?;
        if let Some(id) = &thread {
            if rec.thread(id).is_none() {
                return Err(SyncError::UnknownThread(id.clone()));
            }
        }
        rec.set_active_thread(thread.clone());
        if let Some(id) = thread {
            st.thread_reads.insert(id, now);
        }
        self.shared.notify_change(&st);
        Ok(())
    }

    pub async fn set_replying_to(&self, message: Option<MessageId>) -> Result<(), SyncError> {
        let mut st = self.shared.state.lock().await;
        let epoch = st.epoch;
        let rec = st.active_mut(epoch).ok_or(SyncError::NoActiveConversation)?;
        if let Some(id) = &message {
            if !rec.has_message(id) {
                return Err(SyncError::UnknownMessage(id.clone()));
            }
        }
        rec.set_replying_to(message);
        self.shared.notify_change(&st);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Profiles and user-level state
    // -----------------------------------------------------------------------

    /// Re-fetch a profile even if it is already known.
    pub async fn refresh_profile(&self, user: &UserId) -> Result<Option<Profile>, SyncError> {
        let epoch = self.shared.state.lock().await.epoch;
        let result = loader::ensure_profiles(&self.shared, epoch, vec![user.clone()], true)
            .await
            .map(|profiles| profiles.into_iter().find(|p| &p.id == user))
            .map_err(SyncError::from);
        self.surface(result).await
    }

    /// The overview as last cached, if still fresh.
    pub fn cached_overview(&self) -> Option<ChatOverview> {
        self.shared
            .cache
            .read_overview(self.shared.me(), self.shared.config.overview_cache_max_age_ms)
    }

    /// Fetch the conversation list and roster from the backend and cache it.
    pub async fn load_overview(&self) -> Result<ChatOverview, SyncError> {
        let result = loader::load_overview(&self.shared).await;
        self.surface(result).await
    }

    pub async fn join_group(&self, conversation: &ConversationId) -> Result<(), SyncError> {
        let result = self.change_membership(conversation, true).await;
        self.surface(result).await
    }

    pub async fn leave_group(&self, conversation: &ConversationId) -> Result<(), SyncError> {
        let result = self.change_membership(conversation, false).await;
        self.surface(result).await
    }

    async fn change_membership(&self, conversation: &ConversationId, join: bool) -> Result<(), SyncError> {
        if join {
            self.shared.backend.join_group(conversation).await?;
        } else {
            self.shared.backend.leave_group(conversation).await?;
        }
        tracing::info!(
            "session: {} {}",
            if join { "joined" } else { "left" },
            conv_id(conversation.as_str())
        );
        self.shared.cache.invalidate_user(self.shared.me())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // City feed
    // -----------------------------------------------------------------------

    /// Listen to `city`'s activity feed, replacing any previous city.
    pub async fn subscribe_city(&self, city: &str) -> Result<(), SyncError> {
        self.close_city().await;
        let result = feed::subscribe_city(&self.shared, city.to_string())
            .await
            .map_err(SyncError::from);
        match result {
            Ok(sub) => {
                let mut st = self.shared.state.lock().await;
                if let Some(old) = st.city.replace(sub) {
                    old.close();
                }
                Ok(())
            }
            Err(e) => self.surface(Err(e)).await,
        }
    }

    pub async fn close_city(&self) {
        let old = self.shared.state.lock().await.city.take();
        if let Some(sub) = old {
            sub.close();
        }
    }
}
