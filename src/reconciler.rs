//! In-memory canonical state for the open conversation.
//!
//! The [`Reconciler`] owns the message, thread, attachment, reaction and
//! profile collections. Every mutation goes through one of the named upsert
//! or remove operations so the soft-delete and cascade rules always hold:
//!
//! - a soft-deleted message or archived thread is never stored;
//! - removing a message removes its attachments and reactions and clears a
//!   composer reply reference pointing at it;
//! - children whose parent message is unknown are ignored (the caller routes
//!   them to the [`crate::pending::PendingEventBuffer`] instead);
//! - message order is recomputed on every mutation, never taken from arrival
//!   order.
//!
//! None of the operations fail. Malformed or foreign input is ignored and
//! reported through [`Upsert::Ignored`].

use std::collections::{BTreeMap, HashMap};

use crate::model::{
    Attachment, AttachmentId, ConversationId, Message, MessageId, Profile, Reaction, ReactionKey,
    Thread, ThreadId, UserId,
};

/// What an upsert did to the collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    /// The row carried a soft-delete/archive marker and an existing entry was removed.
    Removed,
    /// Nothing changed: unknown parent, duplicate, foreign conversation, or a
    /// soft-deleted row that was not present.
    Ignored,
}

impl Upsert {
    pub fn changed(&self) -> bool {
        !matches!(self, Upsert::Ignored)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciler {
    conversation_id: ConversationId,
    messages: Vec<Message>,
    threads: BTreeMap<ThreadId, Thread>,
    attachments: HashMap<MessageId, Vec<Attachment>>,
    reactions: HashMap<MessageId, Vec<Reaction>>,
    profiles: HashMap<UserId, Profile>,
    active_thread: Option<ThreadId>,
    replying_to: Option<MessageId>,
}

impl Reconciler {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            threads: BTreeMap::new(),
            attachments: HashMap::new(),
            reactions: HashMap::new(),
            profiles: HashMap::new(),
            active_thread: None,
            replying_to: None,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn upsert_message(&mut self, message: Message) -> Upsert {
        if message.conversation_id != self.conversation_id {
            return Upsert::Ignored;
        }
        if message.is_deleted() {
            return if self.remove_message(&message.id) {
                Upsert::Removed
            } else {
                Upsert::Ignored
            };
        }

        let outcome = match self.position(&message.id) {
            Some(pos) => {
                self.messages[pos] = message;
                Upsert::Replaced
            }
            None => {
                self.messages.push(message);
                Upsert::Inserted
            }
        };
        self.messages.sort_by(|a, b| a.order_cmp(b));
        outcome
    }

    /// Remove a message and everything bound to it. Returns whether the
    /// message was present.
    pub fn remove_message(&mut self, id: &MessageId) -> bool {
        let existed = match self.position(id) {
            Some(pos) => {
                self.messages.remove(pos);
                true
            }
            None => false,
        };
        // Cascade even when the message itself was unknown so stray children
        // never outlive a delete event.
        self.attachments.remove(id);
        self.reactions.remove(id);
        if self.replying_to.as_ref() == Some(id) {
            self.replying_to = None;
        }
        existed
    }

    pub fn has_message(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|pos| &self.messages[pos])
    }

    /// All messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// A media message that is known locally but has no attachments yet.
    pub fn is_missing_media(&self, id: &MessageId) -> bool {
        match self.message(id) {
            Some(m) => m.kind.is_media() && self.attachments_for(id).is_empty(),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    pub fn upsert_thread(&mut self, thread: Thread) -> Upsert {
        if thread.conversation_id != self.conversation_id {
            return Upsert::Ignored;
        }
        if thread.is_archived() {
            return if self.remove_thread(&thread.id) {
                Upsert::Removed
            } else {
                Upsert::Ignored
            };
        }
        match self.threads.insert(thread.id.clone(), thread) {
            Some(_) => Upsert::Replaced,
            None => Upsert::Inserted,
        }
    }

    /// Remove a thread. Its messages stay addressable; UI focus on the thread
    /// falls back to the main timeline.
    pub fn remove_thread(&mut self, id: &ThreadId) -> bool {
        if self.active_thread.as_ref() == Some(id) {
            self.active_thread = None;
        }
        self.threads.remove(id).is_some()
    }

    pub fn thread(&self, id: &ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    /// Active (non-archived) threads, oldest first.
    pub fn threads(&self) -> Vec<&Thread> {
        let mut threads: Vec<&Thread> = self.threads.values().collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        threads
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    pub fn upsert_attachment(&mut self, attachment: Attachment) -> Upsert {
        if !self.has_message(&attachment.message_id) {
            return Upsert::Ignored;
        }
        let bucket = self
            .attachments
            .entry(attachment.message_id.clone())
            .or_default();
        let outcome = match bucket.iter().position(|a| a.id == attachment.id) {
            Some(pos) => {
                bucket[pos] = attachment;
                Upsert::Replaced
            }
            None => {
                bucket.push(attachment);
                Upsert::Inserted
            }
        };
        bucket.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        outcome
    }

    pub fn remove_attachment(&mut self, id: &AttachmentId) -> bool {
        let mut removed = false;
        self.attachments.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|a| &a.id != id);
            removed |= bucket.len() != before;
            !bucket.is_empty()
        });
        removed
    }

    pub fn attachments_for(&self, message_id: &MessageId) -> &[Attachment] {
        self.attachments
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn attachment(&self, id: &AttachmentId) -> Option<&Attachment> {
        self.attachments
            .values()
            .flat_map(|bucket| bucket.iter())
            .find(|a| &a.id == id)
    }

    pub fn all_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.values().flat_map(|bucket| bucket.iter())
    }

    // -----------------------------------------------------------------------
    // Reactions
    // -----------------------------------------------------------------------

    pub fn upsert_reaction(&mut self, reaction: Reaction) -> Upsert {
        if !self.has_message(&reaction.message_id) {
            return Upsert::Ignored;
        }
        let key = reaction.key();
        let bucket = self
            .reactions
            .entry(reaction.message_id.clone())
            .or_default();
        if bucket.iter().any(|r| r.matches(&key)) {
            return Upsert::Ignored;
        }
        bucket.push(reaction);
        bucket.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
                .then_with(|| a.emoji.cmp(&b.emoji))
        });
        Upsert::Inserted
    }

    pub fn remove_reaction(&mut self, key: &ReactionKey) -> bool {
        let Some(bucket) = self.reactions.get_mut(&key.message_id) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|r| !r.matches(key));
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            self.reactions.remove(&key.message_id);
        }
        removed
    }

    pub fn reaction(&self, key: &ReactionKey) -> Option<&Reaction> {
        self.reactions_for(&key.message_id)
            .iter()
            .find(|r| r.matches(key))
    }

    pub fn reactions_for(&self, message_id: &MessageId) -> &[Reaction] {
        self.reactions
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    pub fn upsert_profile(&mut self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, id: &UserId) -> Option<&Profile> {
        self.profiles.get(id)
    }

    pub fn has_profile(&self, id: &UserId) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    // -----------------------------------------------------------------------
    // UI focus
    // -----------------------------------------------------------------------

    pub fn active_thread(&self) -> Option<&ThreadId> {
        self.active_thread.as_ref()
    }

    /// Focus a thread, or the main timeline with `None`. Returns `false` (and
    /// leaves focus unchanged) for a thread that is not known.
    pub fn set_active_thread(&mut self, thread: Option<ThreadId>) -> bool {
        if let Some(id) = &thread {
            if !self.threads.contains_key(id) {
                return false;
            }
        }
        self.active_thread = thread;
        true
    }

    pub fn replying_to(&self) -> Option<&MessageId> {
        self.replying_to.as_ref()
    }

    pub fn set_replying_to(&mut self, message: Option<MessageId>) -> bool {
        if let Some(id) = &message {
            if !self.has_message(id) {
                return false;
            }
        }
        self.replying_to = message;
        true
    }
}
