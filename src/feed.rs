//! Change-feed subscriber.
//!
//! One [`Subscription`] per open conversation (and one per followed city).
//! A pump task reads [`RawChange`]s from the collaborator's stream, decodes
//! them at the ingestion boundary, and applies them to the open conversation
//! if the epoch they were subscribed under is still current.
//!
//! Child rows (attachments, reactions) whose message is not known yet go to
//! the pending buffer; a message upsert drains whatever was waiting for it.
//! Child rows applied while a bulk load is running are also recorded in the
//! load journal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::backend::{BackendError, FeedScope};
use crate::ingest::{decode_change, FeedEvent, RawChange};
use crate::journal::ChildChange;
use crate::loader;
use crate::logging::{conv_id, msg_id};
use crate::model::{Attachment, AttachmentId, ConversationId, MessageId, UserId};
use crate::pending::{PendingEvent, Stash};
use crate::reconciler::{Reconciler, Upsert};
use crate::session::{SessionEvent, SessionShared, SharedSession, SyncError};

/// Handle to a live change-feed. Closing is synchronous and idempotent;
/// dropping the handle closes it.
pub struct Subscription {
    scope: FeedScope,
    pump: AbortHandle,
    connection: Option<AbortHandle>,
    closed: AtomicBool,
}

impl Subscription {
    fn new(scope: FeedScope, pump: AbortHandle, connection: Option<AbortHandle>) -> Self {
        Self {
            scope,
            pump,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pump.abort();
        if let Some(connection) = &self.connection {
            connection.abort();
        }
        tracing::debug!("feed: closed {}", self.scope.topic());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribe to `conversation` and start applying its events under `epoch`.
pub(crate) async fn subscribe_conversation(
    shared: &SharedSession,
    epoch: u64,
    conversation: ConversationId,
) -> Result<Subscription, BackendError> {
    let scope = FeedScope::Conversation(conversation.clone());
    let stream = shared.feed.subscribe(&scope).await?;
    let mut events = stream.events;
    let mut reconnects = stream.reconnects;
    let weak: Weak<SessionShared> = Arc::downgrade(shared);

    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                change = events.recv() => {
                    let Some(change) = change else {
                        break;
                    };
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    dispatch(&shared, epoch, change).await;
                }
                Some(()) = next_reconnect(&mut reconnects) => {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    resync(&shared, epoch, &conversation);
                }
            }
        }
        tracing::debug!("feed: stream for {} ended", conv_id(conversation.as_str()));
    });
    tracing::info!("feed: subscribed to {}", scope.topic());
    Ok(Subscription::new(scope, pump.abort_handle(), stream.connection))
}

async fn next_reconnect(reconnects: &mut Option<watch::Receiver<u64>>) -> Option<()> {
    let Some(rx) = reconnects.as_mut() else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(()),
        Err(_) => {
            *reconnects = None;
            None
        }
    }
}

/// Reload the conversation after the feed reconnected; events sent while it
/// was down never arrive.
fn resync(shared: &SharedSession, epoch: u64, conversation: &ConversationId) {
    tracing::info!(
        "feed: {} reconnected, reloading to catch up",
        conv_id(conversation.as_str())
    );
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        match loader::load_conversation(&shared, epoch).await {
            Ok(_) | Err(SyncError::Superseded) => {}
            Err(e) => {
                if shared.state.lock().await.epoch == epoch {
                    shared.report(&e).await;
                }
            }
        }
    });
}

/// Subscribe to a city's activity feed. Rows are forwarded to listeners as
/// [`SessionEvent::CityActivity`] without touching conversation state.
pub(crate) async fn subscribe_city(shared: &SharedSession, city: String) -> Result<Subscription, BackendError> {
    let scope = FeedScope::City(city.clone());
    let stream = shared.feed.subscribe(&scope).await?;
    let mut events = stream.events;
    let weak: Weak<SessionShared> = Arc::downgrade(shared);

    let pump = tokio::spawn(async move {
        while let Some(change) = events.recv().await {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            shared.emit(SessionEvent::CityActivity {
                city: city.clone(),
                table: change.table,
                kind: change.kind,
                record: change.record,
            });
        }
    });
    tracing::info!("feed: subscribed to {}", scope.topic());
    Ok(Subscription::new(scope, pump.abort_handle(), stream.connection))
}

pub(crate) async fn dispatch(shared: &SharedSession, epoch: u64, change: RawChange) {
    match decode_change(&change) {
        Ok(event) => apply_event(shared, epoch, event).await,
        Err(e) => tracing::warn!("feed: dropping {:?} on {}: {}", change.kind, change.table, e),
    }
}

#[derive(Default)]
struct Followup {
    sign: Vec<Attachment>,
    profiles: Vec<UserId>,
}

async fn apply_event(shared: &SharedSession, epoch: u64, event: FeedEvent) {
    let mut followup = Followup::default();
    {
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;
        if st.epoch != epoch {
            return;
        }
        let Some(rec) = st.conversation.as_mut() else {
            return;
        };

        let changed = match event {
            FeedEvent::MessageUpsert(message) => {
                let id = message.id.clone();
                let sender = message.sender_id.clone();
                let children = attachment_ids(rec, &id);
                let outcome = rec.upsert_message(message);
                match outcome {
                    Upsert::Inserted | Upsert::Replaced => {
                        for pending in st.pending.drain_for([&id]) {
                            let attachment = match &pending {
                                PendingEvent::Attachment(a) => Some(a.clone()),
                                PendingEvent::Reaction(_) => None,
                            };
                            if pending.apply(rec).changed() {
                                followup.sign.extend(attachment);
                            }
                        }
                        if !rec.has_profile(&sender) {
                            followup.profiles.push(sender);
                        }
                        if outcome == Upsert::Inserted && rec.is_missing_media(&id) {
                            shared.hydration.schedule(shared, epoch, id);
                        }
                    }
                    Upsert::Removed | Upsert::Ignored => {
                        st.pending.drain_for([&id]);
                        if outcome == Upsert::Removed {
                            for child in &children {
                                st.signed_urls.remove(child);
                            }
                        }
                    }
                }
                outcome.changed()
            }
            FeedEvent::MessageDelete(id) => {
                st.pending.drain_for([&id]);
                for child in attachment_ids(rec, &id) {
                    st.signed_urls.remove(&child);
                }
                rec.remove_message(&id)
            }
            FeedEvent::ThreadUpsert(thread) => rec.upsert_thread(thread).changed(),
            FeedEvent::ThreadDelete(id) => rec.remove_thread(&id),
            FeedEvent::AttachmentUpsert(attachment) => {
                if rec.has_message(&attachment.message_id) {
                    st.journal
                        .record(ChildChange::AttachmentUpsert(attachment.clone()));
                    let uploader = attachment.uploader_id.clone();
                    let changed = rec.upsert_attachment(attachment.clone()).changed();
                    if changed {
                        followup.sign.push(attachment);
                        if !rec.has_profile(&uploader) {
                            followup.profiles.push(uploader);
                        }
                    }
                    changed
                } else {
                    stash(&mut st.pending, PendingEvent::Attachment(attachment));
                    false
                }
            }
            FeedEvent::AttachmentDelete(id) => {
                st.pending.forget_attachment(&id);
                st.journal.record(ChildChange::AttachmentDelete(id.clone()));
                st.signed_urls.remove(&id);
                rec.remove_attachment(&id)
            }
            FeedEvent::ReactionInsert(reaction) => {
                if rec.has_message(&reaction.message_id) {
                    st.journal
                        .record(ChildChange::ReactionUpsert(reaction.clone()));
                    let user = reaction.user_id.clone();
                    let changed = rec.upsert_reaction(reaction).changed();
                    if changed && !rec.has_profile(&user) {
                        followup.profiles.push(user);
                    }
                    changed
                } else {
                    stash(&mut st.pending, PendingEvent::Reaction(reaction));
                    false
                }
            }
            FeedEvent::ReactionDelete(key) => {
                st.pending.forget_reaction(&key);
                st.journal.record(ChildChange::ReactionDelete(key.clone()));
                rec.remove_reaction(&key)
            }
        };

        if changed {
            shared.publish_change(st);
        }
    }

    if !followup.sign.is_empty() || !followup.profiles.is_empty() {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            if !followup.profiles.is_empty() {
                if let Err(e) = loader::ensure_profiles(&shared, epoch, followup.profiles, false).await {
                    tracing::warn!("feed: profile fetch failed: {}", e);
                }
            }
            loader::sign_attachments(&shared, epoch, followup.sign).await;
        });
    }
}

fn attachment_ids(rec: &Reconciler, message: &MessageId) -> Vec<AttachmentId> {
    rec.attachments_for(message).iter().map(|a| a.id.clone()).collect()
}

fn stash(pending: &mut crate::pending::PendingEventBuffer, event: PendingEvent) {
    let message_id = event.message_id().clone();
    match pending.stash(event) {
        Stash::Buffered => tracing::debug!(
            "feed: buffered child event for unknown {}",
            msg_id(message_id.as_str())
        ),
        Stash::Duplicate | Stash::Overflowed => {}
    }
}
