//! Local-first writes.
//!
//! - Reaction toggles flip local state immediately, then call the backend,
//!   and put the original state back if the call fails.
//! - Sends and thread creation go to the backend first (it assigns ids) and
//!   upsert a synthesized row on success, ahead of the change-feed echo.
//! - Deletes remove locally first; a failed remote delete triggers a full
//!   reload of the conversation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rand::RngCore;
use serde::Serialize;
use serde_json::Value;

use crate::backend::{NewAttachment, OutgoingMessage};
use crate::journal::ChildChange;
use crate::loader;
use crate::logging::msg_id;
use crate::model::{
    Attachment, AttachmentKind, ConversationId, Message, MessageId, MessageKind, Reaction,
    ReactionKey, StorageLocation, Thread, ThreadId,
};
use crate::session::{SharedSession, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionToggle {
    Added,
    Removed,
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

pub(crate) async fn toggle_reaction(
    shared: &SharedSession,
    message_id: &MessageId,
    emoji: &str,
) -> Result<ReactionToggle, SyncError> {
    let key = ReactionKey {
        message_id: message_id.clone(),
        user_id: shared.me().clone(),
        emoji: emoji.to_string(),
    };

    let (epoch, original, added) = {
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;
        let epoch = st.epoch;
        let rec = st
            .conversation
            .as_mut()
            .ok_or(SyncError::NoActiveConversation)?;
        if !rec.has_message(message_id) {
            return Err(SyncError::UnknownMessage(message_id.clone()));
        }
        let original = rec.reaction(&key).cloned();
        let added = match original {
            Some(_) => {
                rec.remove_reaction(&key);
                st.journal.record(ChildChange::ReactionDelete(key.clone()));
                None
            }
            None => {
                let reaction = Reaction {
                    message_id: key.message_id.clone(),
                    user_id: key.user_id.clone(),
                    emoji: key.emoji.clone(),
                    created_at: shared.clock.now_ms(),
                };
                rec.upsert_reaction(reaction.clone());
                st.journal
                    .record(ChildChange::ReactionUpsert(reaction.clone()));
                Some(reaction)
            }
        };
        shared.publish_change(st);
        (epoch, original, added)
    };

    let (result, toggle) = match &added {
        Some(reaction) => (shared.backend.add_reaction(reaction).await, ReactionToggle::Added),
        None => (shared.backend.remove_reaction(&key).await, ReactionToggle::Removed),
    };
    let error = match result {
        Ok(()) => return Ok(toggle),
        // Someone (or an earlier tap) already inserted the same row.
        Err(e) if e.is_conflict() && toggle == ReactionToggle::Added => return Ok(toggle),
        Err(e) => e,
    };

    tracing::warn!(
        "optimistic: reaction {} on {} failed, rolling back: {}",
        emoji,
        msg_id(message_id.as_str()),
        error
    );
    let mut guard = shared.state.lock().await;
    let st = &mut *guard;
    if st.epoch == epoch {
        if let Some(rec) = st.conversation.as_mut() {
            let restore = match original {
                Some(reaction) => ChildChange::ReactionUpsert(reaction),
                None => ChildChange::ReactionDelete(key),
            };
            st.journal.record(restore.clone());
            restore.apply(rec);
            shared.publish_change(st);
        }
    }
    Err(error.into())
}

// ---------------------------------------------------------------------------
// Sends
// ---------------------------------------------------------------------------

struct Compose {
    epoch: u64,
    conversation_id: ConversationId,
    thread_id: Option<ThreadId>,
    reply_to: Option<MessageId>,
}

async fn compose(shared: &SharedSession) -> Result<Compose, SyncError> {
    let st = shared.state.lock().await;
    let rec = st
        .conversation
        .as_ref()
        .ok_or(SyncError::NoActiveConversation)?;
    Ok(Compose {
        epoch: st.epoch,
        conversation_id: rec.conversation_id().clone(),
        thread_id: rec.active_thread().cloned(),
        reply_to: rec.replying_to().cloned(),
    })
}

fn synthesize(shared: &SharedSession, id: MessageId, outgoing: &OutgoingMessage) -> Message {
    Message {
        id,
        conversation_id: outgoing.conversation_id.clone(),
        thread_id: outgoing.thread_id.clone(),
        sender_id: shared.me().clone(),
        reply_to: outgoing.reply_to.clone(),
        kind: outgoing.kind,
        body: outgoing.body.clone(),
        metadata: outgoing.metadata.clone(),
        created_at: shared.clock.now_ms(),
        deleted_at: None,
    }
}

/// Upsert our own just-sent message unless the feed echo beat us to it, and
/// clear the reply target it was sent against.
async fn apply_sent(
    shared: &SharedSession,
    epoch: u64,
    message: Message,
    attachment: Option<Attachment>,
) {
    let mut guard = shared.state.lock().await;
    let st = &mut *guard;
    if st.epoch != epoch {
        return;
    }
    let Some(rec) = st.conversation.as_mut() else {
        return;
    };
    let id = message.id.clone();
    let reply_to = message.reply_to.clone();
    if !rec.has_message(&id) {
        rec.upsert_message(message);
    }
    for pending in st.pending.drain_for([&id]) {
        pending.apply(rec);
    }
    if let Some(attachment) = attachment {
        rec.upsert_attachment(attachment);
    }
    if reply_to.is_some() && rec.replying_to() == reply_to.as_ref() {
        rec.set_replying_to(None);
    }
    shared.publish_change(st);
}

pub(crate) async fn send_text(shared: &SharedSession, body: &str) -> Result<MessageId, SyncError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(SyncError::EmptyMessage);
    }
    let compose = compose(shared).await?;
    let outgoing = OutgoingMessage {
        conversation_id: compose.conversation_id,
        body: Some(body.to_string()),
        kind: MessageKind::Text,
        thread_id: compose.thread_id,
        reply_to: compose.reply_to,
        metadata: BTreeMap::new(),
    };

    let id = shared.backend.send_message(&outgoing).await?;
    tracing::debug!("optimistic: sent {}", msg_id(id.as_str()));
    apply_sent(shared, compose.epoch, synthesize(shared, id.clone(), &outgoing), None).await;
    Ok(id)
}

fn random_object_name() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) async fn send_media(
    shared: &SharedSession,
    bytes: Vec<u8>,
    filename: &str,
    caption: Option<&str>,
) -> Result<MessageId, SyncError> {
    if bytes.is_empty() {
        return Err(SyncError::InvalidMedia("the file is empty".to_string()));
    }
    let mime_type = mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    let kind = AttachmentKind::from_mime(&mime_type);
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "bin".to_string());

    let compose = compose(shared).await?;
    let location = StorageLocation {
        bucket: shared.config.media_bucket.clone(),
        path: format!(
            "{}/{}/{}.{}",
            compose.conversation_id,
            shared.me(),
            random_object_name(),
            extension
        ),
    };
    let size_bytes = bytes.len() as u64;
    shared.storage.upload(&location, bytes, &mime_type).await?;

    let mut metadata = BTreeMap::new();
    metadata.insert("filename".to_string(), Value::String(filename.to_string()));
    let outgoing = OutgoingMessage {
        conversation_id: compose.conversation_id,
        body: caption
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
        kind: kind.message_kind(),
        thread_id: compose.thread_id,
        reply_to: compose.reply_to,
        metadata,
    };

    let message_id = match shared.backend.send_message(&outgoing).await {
        Ok(id) => id,
        Err(e) => {
            remove_upload(shared, &location).await;
            return Err(e.into());
        }
    };
    let new_attachment = NewAttachment {
        message_id: message_id.clone(),
        kind,
        location: location.clone(),
        mime_type: mime_type.clone(),
        size_bytes,
        width: None,
        height: None,
    };
    let attachment_id = match shared.backend.insert_attachment(&new_attachment).await {
        Ok(id) => id,
        Err(e) => {
            remove_upload(shared, &location).await;
            return Err(e.into());
        }
    };

    let now = shared.clock.now_ms();
    let attachment = Attachment {
        id: attachment_id,
        message_id: message_id.clone(),
        kind,
        location,
        mime_type,
        size_bytes,
        width: None,
        height: None,
        uploader_id: shared.me().clone(),
        created_at: now,
    };
    let message = synthesize(shared, message_id.clone(), &outgoing);
    apply_sent(shared, compose.epoch, message, Some(attachment.clone())).await;
    loader::sign_attachments(shared, compose.epoch, vec![attachment]).await;
    Ok(message_id)
}

async fn remove_upload(shared: &SharedSession, location: &StorageLocation) {
    if let Err(e) = shared
        .storage
        .remove(&location.bucket, std::slice::from_ref(&location.path))
        .await
    {
        tracing::warn!("optimistic: could not remove orphaned upload {}: {}", location.path, e);
    }
}

pub(crate) async fn create_thread(
    shared: &SharedSession,
    body: &str,
    title: Option<&str>,
) -> Result<ThreadId, SyncError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(SyncError::EmptyMessage);
    }
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let compose = compose(shared).await?;
    let created = shared
        .backend
        .create_thread(&compose.conversation_id, body, title)
        .await?;

    let now = shared.clock.now_ms();
    let mut guard = shared.state.lock().await;
    let st = &mut *guard;
    if let Some(rec) = st.active_mut(compose.epoch) {
        if rec.thread(&created.thread_id).is_none() {
            rec.upsert_thread(Thread {
                id: created.thread_id.clone(),
                title: title.map(str::to_string),
                conversation_id: compose.conversation_id.clone(),
                creator_id: shared.me().clone(),
                created_at: now,
                archived_at: None,
            });
        }
        if !rec.has_message(&created.root_message_id) {
            rec.upsert_message(Message {
                id: created.root_message_id.clone(),
                conversation_id: compose.conversation_id,
                thread_id: Some(created.thread_id.clone()),
                sender_id: shared.me().clone(),
                reply_to: None,
                kind: MessageKind::Text,
                body: Some(body.to_string()),
                metadata: BTreeMap::new(),
                created_at: now,
                deleted_at: None,
            });
        }
        rec.set_active_thread(Some(created.thread_id.clone()));
        st.thread_reads.insert(created.thread_id.clone(), now);
        shared.publish_change(st);
    }
    Ok(created.thread_id)
}

// ---------------------------------------------------------------------------
// Deletes
// ---------------------------------------------------------------------------

pub(crate) async fn delete_own_message(shared: &SharedSession, message_id: &MessageId) -> Result<(), SyncError> {
    let (epoch, attachments) = {
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;
        let epoch = st.epoch;
        let rec = st.active_mut(epoch).ok_or(SyncError::NoActiveConversation)?;
        let message = rec
            .message(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
        if &message.sender_id != shared.me() {
            return Err(SyncError::NotOwner(message_id.clone()));
        }
        let attachments = rec.attachments_for(message_id).to_vec();
        rec.remove_message(message_id);
        for attachment in &attachments {
            st.signed_urls.remove(&attachment.id);
        }
        st.pending.drain_for([message_id]);
        shared.publish_change(st);
        (epoch, attachments)
    };

    let mut by_bucket: HashMap<String, Vec<String>> = HashMap::new();
    for attachment in attachments {
        by_bucket
            .entry(attachment.location.bucket)
            .or_default()
            .push(attachment.location.path);
    }
    let remote = async {
        for (bucket, paths) in &by_bucket {
            shared.storage.remove(bucket, paths).await?;
        }
        shared.backend.delete_message(message_id).await
    };
    if let Err(e) = remote.await {
        tracing::warn!(
            "optimistic: delete of {} failed, reloading: {}",
            msg_id(message_id.as_str()),
            e
        );
        if let Err(reload) = loader::load_conversation(shared, epoch).await {
            tracing::warn!("optimistic: recovery reload failed: {}", reload);
        }
        return Err(e.into());
    }
    Ok(())
}
