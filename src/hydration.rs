//! Self-healing backfill for media messages that show up without attachments.
//!
//! When a new image or animated-image message is ingested with no
//! attachments, a check is scheduled a short while later. If the message is
//! still known and still bare when the timer fires, its attachments,
//! reactions and the profiles they reference are fetched directly and fed
//! through the reconciler. At most one check per message id is waiting or
//! running at any time, and all checks are cancelled together when the
//! conversation changes.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::ingest::{attachment_from_row, decode_rows, profile_from_row, reaction_from_row};
use crate::journal::ChildChange;
use crate::loader;
use crate::model::MessageId;
use crate::scheduler::Debouncer;
use crate::session::SharedSession;

pub struct HydrationScheduler {
    timers: Debouncer,
    delay: Duration,
}

impl HydrationScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            timers: Debouncer::new(),
            delay,
        }
    }

    /// Schedule a backfill check for `message_id`. Ignored (returns `false`)
    /// when a check for the same id is already waiting or running.
    pub(crate) fn schedule(&self, shared: &SharedSession, epoch: u64, message_id: MessageId) -> bool {
        let key = message_id.0.clone();
        let weak = std::sync::Arc::downgrade(shared);
        self.timers.schedule_once(key, self.delay, async move {
            if let Some(shared) = weak.upgrade() {
                hydrate(&shared, epoch, message_id).await;
            }
        })
    }

    pub fn is_scheduled(&self, message_id: &MessageId) -> bool {
        self.timers.is_scheduled(message_id.as_str())
    }

    pub fn cancel_all(&self) {
        self.timers.cancel_all();
    }

    /// Checks currently waiting or running.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

/// Fetch and apply the attachments and reactions of one bare media message.
pub(crate) async fn hydrate(shared: &SharedSession, epoch: u64, message_id: MessageId) {
    {
        let mut st = shared.state.lock().await;
        match st.active_mut(epoch) {
            Some(rec) if rec.is_missing_media(&message_id) => {}
            _ => return,
        }
    }

    tracing::debug!(
        "hydration: fetching attachments for {}",
        crate::logging::msg_id(message_id.as_str())
    );
    let ids = [message_id.clone()];
    let fetched = tokio::try_join!(
        shared.backend.fetch_attachments(&ids),
        shared.backend.fetch_reactions(&ids)
    );
    let (attachment_rows, reaction_rows) = match fetched {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(
                "hydration: fetch for {} failed: {}",
                crate::logging::msg_id(message_id.as_str()),
                e
            );
            return;
        }
    };
    let attachments = decode_rows(&attachment_rows, attachment_from_row);
    let reactions = decode_rows(&reaction_rows, reaction_from_row);

    let mut user_ids = BTreeSet::new();
    user_ids.extend(attachments.iter().map(|a| a.uploader_id.clone()));
    user_ids.extend(reactions.iter().map(|r| r.user_id.clone()));
    {
        let mut st = shared.state.lock().await;
        let Some(rec) = st.active_mut(epoch) else {
            return;
        };
        user_ids.retain(|id| !rec.has_profile(id));
    }
    let profiles = if user_ids.is_empty() {
        Vec::new()
    } else {
        let ids: Vec<_> = user_ids.into_iter().collect();
        match shared.backend.fetch_profiles(&ids).await {
            Ok(rows) => decode_rows(&rows, profile_from_row),
            Err(e) => {
                tracing::warn!("hydration: profile fetch failed: {}", e);
                Vec::new()
            }
        }
    };

    let mut applied = Vec::new();
    {
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;
        if st.epoch != epoch {
            return;
        }
        let Some(rec) = st.conversation.as_mut() else {
            return;
        };
        for attachment in attachments {
            st.journal
                .record(ChildChange::AttachmentUpsert(attachment.clone()));
            if rec.upsert_attachment(attachment.clone()).changed() {
                applied.push(attachment);
            }
        }
        for reaction in reactions {
            st.journal.record(ChildChange::ReactionUpsert(reaction.clone()));
            rec.upsert_reaction(reaction);
        }
        for profile in profiles {
            rec.upsert_profile(profile);
        }
        tracing::debug!(
            "hydration: {} attachment(s) recovered for {}",
            applied.len(),
            crate::logging::msg_id(message_id.as_str())
        );
        shared.publish_change(st);
    }

    if !applied.is_empty() {
        loader::sign_attachments(shared, epoch, applied).await;
    }
}
