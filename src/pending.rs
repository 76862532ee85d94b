//! Holding area for child events that arrive before their parent message.
//!
//! Attachments and reactions are delivered on their own per-table streams, so
//! an attachment insert can land before the message insert it belongs to.
//! Those events wait here, bucketed by message id, until the message becomes
//! known and [`PendingEventBuffer::drain_for`] hands them back in arrival
//! order.

use std::collections::HashMap;

use crate::model::{Attachment, AttachmentId, MessageId, Reaction, ReactionKey};
use crate::reconciler::{Reconciler, Upsert};

#[derive(Debug, Clone, PartialEq)]
pub enum PendingEvent {
    Attachment(Attachment),
    Reaction(Reaction),
}

impl PendingEvent {
    pub fn message_id(&self) -> &MessageId {
        match self {
            PendingEvent::Attachment(a) => &a.message_id,
            PendingEvent::Reaction(r) => &r.message_id,
        }
    }

    /// Replay this event through the reconciler's upsert operations.
    pub fn apply(self, reconciler: &mut Reconciler) -> Upsert {
        match self {
            PendingEvent::Attachment(a) => reconciler.upsert_attachment(a),
            PendingEvent::Reaction(r) => reconciler.upsert_reaction(r),
        }
    }

    fn same_identity(&self, other: &PendingEvent) -> bool {
        match (self, other) {
            (PendingEvent::Attachment(a), PendingEvent::Attachment(b)) => a.id == b.id,
            (PendingEvent::Reaction(a), PendingEvent::Reaction(b)) => {
                a.user_id == b.user_id && a.emoji == b.emoji
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stash {
    Buffered,
    Duplicate,
    /// The distinct-message ceiling was exceeded and the whole buffer was dropped.
    Overflowed,
}

#[derive(Debug)]
pub struct PendingEventBuffer {
    buckets: HashMap<MessageId, Vec<(u64, PendingEvent)>>,
    next_seq: u64,
    max_messages: usize,
}

impl PendingEventBuffer {
    pub fn new(max_messages: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            next_seq: 0,
            max_messages,
        }
    }

    pub fn stash(&mut self, event: PendingEvent) -> Stash {
        let bucket = self.buckets.entry(event.message_id().clone()).or_default();
        if bucket.iter().any(|(_, e)| e.same_identity(&event)) {
            return Stash::Duplicate;
        }
        bucket.push((self.next_seq, event));
        self.next_seq += 1;

        if self.buckets.len() > self.max_messages {
            tracing::warn!(
                "pending: {} orphaned message ids exceed ceiling of {}, dropping buffer",
                self.buckets.len(),
                self.max_messages
            );
            self.clear();
            return Stash::Overflowed;
        }
        Stash::Buffered
    }

    /// Remove and return every buffered event for `message_ids`, oldest first.
    pub fn drain_for<'a>(
        &mut self,
        message_ids: impl IntoIterator<Item = &'a MessageId>,
    ) -> Vec<PendingEvent> {
        let mut drained: Vec<(u64, PendingEvent)> = Vec::new();
        for id in message_ids {
            if let Some(bucket) = self.buckets.remove(id) {
                drained.extend(bucket);
            }
        }
        drained.sort_by_key(|(seq, _)| *seq);
        drained.into_iter().map(|(_, e)| e).collect()
    }

    /// Drop a buffered attachment whose delete event arrived before its parent.
    pub fn forget_attachment(&mut self, id: &AttachmentId) {
        self.buckets.retain(|_, bucket| {
            bucket.retain(|(_, e)| !matches!(e, PendingEvent::Attachment(a) if &a.id == id));
            !bucket.is_empty()
        });
    }

    pub fn forget_reaction(&mut self, key: &ReactionKey) {
        if let Some(bucket) = self.buckets.get_mut(&key.message_id) {
            bucket.retain(|(_, e)| !matches!(e, PendingEvent::Reaction(r) if r.matches(key)));
            if bucket.is_empty() {
                self.buckets.remove(&key.message_id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Number of distinct message ids with buffered events.
    pub fn message_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
