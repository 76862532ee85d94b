//! Render-ready projection of a conversation.
//!
//! A [`ChatView`] is an owned copy built under the session lock; the UI can
//! hold onto it while the engine keeps mutating the live state.

use std::collections::HashMap;

use serde::Serialize;

use crate::model::{
    Attachment, AttachmentId, ConversationId, Message, MessageId, Millis, Profile, Thread,
    ThreadId, UserId,
};
use crate::reconciler::Reconciler;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatView {
    pub conversation_id: ConversationId,
    pub active_thread: Option<ThreadId>,
    pub replying_to: Option<MessageId>,
    /// Messages for the focused thread, or the main timeline when no thread
    /// is focused.
    pub messages: Vec<MessageView>,
    pub threads: Vec<ThreadSummary>,
    /// Orphaned child events still waiting for their message.
    pub pending_events: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub message: Message,
    pub sender: Option<Profile>,
    pub attachments: Vec<AttachmentView>,
    pub reactions: Vec<ReactionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentView {
    pub attachment: Attachment,
    pub signed_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_me: bool,
    pub users: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSummary {
    pub thread: Thread,
    pub message_count: usize,
    /// Messages from other people newer than the last time the thread was opened.
    pub unread_count: usize,
    pub last_activity_at: Millis,
}

impl ChatView {
    pub fn message(&self, id: &MessageId) -> Option<&MessageView> {
        self.messages.iter().find(|m| &m.message.id == id)
    }

    pub fn thread(&self, id: &ThreadId) -> Option<&ThreadSummary> {
        self.threads.iter().find(|t| &t.thread.id == id)
    }
}

pub fn build_view(
    rec: &Reconciler,
    signed_urls: &HashMap<AttachmentId, String>,
    thread_reads: &HashMap<ThreadId, Millis>,
    me: &UserId,
    pending_events: usize,
    last_error: Option<String>,
) -> ChatView {
    let focus = rec.active_thread();
    let messages = rec
        .messages()
        .iter()
        .filter(|m| m.thread_id.as_ref() == focus)
        .map(|m| message_view(rec, m, signed_urls, me))
        .collect();

    let threads = rec
        .threads()
        .into_iter()
        .map(|thread| {
            let read_at = thread_reads.get(&thread.id).copied();
            let mut summary = ThreadSummary {
                thread: thread.clone(),
                message_count: 0,
                unread_count: 0,
                last_activity_at: thread.created_at,
            };
            for m in rec
                .messages()
                .iter()
                .filter(|m| m.thread_id.as_ref() == Some(&thread.id))
            {
                summary.message_count += 1;
                summary.last_activity_at = summary.last_activity_at.max(m.created_at);
                let unread = read_at.map_or(true, |read| m.created_at > read);
                if unread && &m.sender_id != me {
                    summary.unread_count += 1;
                }
            }
            summary
        })
        .collect();

    ChatView {
        conversation_id: rec.conversation_id().clone(),
        active_thread: focus.cloned(),
        replying_to: rec.replying_to().cloned(),
        messages,
        threads,
        pending_events,
        last_error,
    }
}

fn message_view(
    rec: &Reconciler,
    message: &Message,
    signed_urls: &HashMap<AttachmentId, String>,
    me: &UserId,
) -> MessageView {
    let attachments = rec
        .attachments_for(&message.id)
        .iter()
        .map(|a| AttachmentView {
            attachment: a.clone(),
            signed_url: signed_urls.get(&a.id).cloned(),
        })
        .collect();

    // Group by emoji, in order of first appearance.
    let mut reactions: Vec<ReactionSummary> = Vec::new();
    for r in rec.reactions_for(&message.id) {
        let idx = match reactions.iter().position(|s| s.emoji == r.emoji) {
            Some(idx) => idx,
            None => {
                reactions.push(ReactionSummary {
                    emoji: r.emoji.clone(),
                    count: 0,
                    reacted_by_me: false,
                    users: Vec::new(),
                });
                reactions.len() - 1
            }
        };
        let summary = &mut reactions[idx];
        summary.count += 1;
        summary.reacted_by_me |= &r.user_id == me;
        summary.users.push(r.user_id.clone());
    }

    MessageView {
        message: message.clone(),
        sender: rec.profile(&message.sender_id).cloned(),
        attachments,
        reactions,
    }
}
