//! Ingestion boundary: raw backend rows into typed entities.
//!
//! Both the bulk loader and the change-feed subscriber hand their rows to the
//! functions here. Anything that fails validation is rejected with an
//! [`IngestError`] and dropped by the caller; past this module every
//! component works only with the types in [`crate::model`].

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    Attachment, AttachmentId, AttachmentKind, ConversationId, ConversationSummary, Message,
    MessageId, MessageKind, Millis, Profile, Reaction, ReactionKey, StorageLocation, Thread,
    ThreadId, UserId,
};

pub const MESSAGES_TABLE: &str = "messages";
pub const THREADS_TABLE: &str = "threads";
pub const ATTACHMENTS_TABLE: &str = "message_attachments";
pub const REACTIONS_TABLE: &str = "message_reactions";

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("{table}: missing field `{field}`")]
    MissingField {
        table: &'static str,
        field: &'static str,
    },
    #[error("{table}: invalid field `{field}`: {reason}")]
    InvalidField {
        table: &'static str,
        field: &'static str,
        reason: String,
    },
    #[error("{table}: unknown kind `{value}`")]
    UnknownKind { table: &'static str, value: String },
    #[error("unknown table `{0}`")]
    UnknownTable(String),
}

// ---------------------------------------------------------------------------
// Change-feed events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// An untyped row-level event as delivered by a [`crate::backend::ChangeFeed`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Value,
    pub old_record: Value,
}

/// A validated change-feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    MessageUpsert(Message),
    MessageDelete(MessageId),
    ThreadUpsert(Thread),
    ThreadDelete(ThreadId),
    AttachmentUpsert(Attachment),
    AttachmentDelete(AttachmentId),
    ReactionInsert(Reaction),
    ReactionDelete(ReactionKey),
}

/// Coerce a raw change into a [`FeedEvent`].
///
/// Deletes are decoded from `old_record`, which for most tables only carries
/// the primary key.
pub fn decode_change(change: &RawChange) -> Result<FeedEvent, IngestError> {
    match (change.table.as_str(), change.kind) {
        (MESSAGES_TABLE, ChangeKind::Delete) => {
            let id = required_str(&change.old_record, MESSAGES_TABLE, "id")?;
            Ok(FeedEvent::MessageDelete(MessageId(id)))
        }
        (MESSAGES_TABLE, _) => Ok(FeedEvent::MessageUpsert(message_from_row(&change.record)?)),
        (THREADS_TABLE, ChangeKind::Delete) => {
            let id = required_str(&change.old_record, THREADS_TABLE, "id")?;
            Ok(FeedEvent::ThreadDelete(ThreadId(id)))
        }
        (THREADS_TABLE, _) => Ok(FeedEvent::ThreadUpsert(thread_from_row(&change.record)?)),
        (ATTACHMENTS_TABLE, ChangeKind::Delete) => {
            let id = required_str(&change.old_record, ATTACHMENTS_TABLE, "id")?;
            Ok(FeedEvent::AttachmentDelete(AttachmentId(id)))
        }
        (ATTACHMENTS_TABLE, _) => Ok(FeedEvent::AttachmentUpsert(attachment_from_row(
            &change.record,
        )?)),
        (REACTIONS_TABLE, ChangeKind::Delete) => {
            Ok(FeedEvent::ReactionDelete(reaction_key_from_row(&change.old_record)?))
        }
        // Reactions are never updated in place; an update is treated as an insert
        // and absorbed by deduplication.
        (REACTIONS_TABLE, _) => Ok(FeedEvent::ReactionInsert(reaction_from_row(&change.record)?)),
        (other, _) => Err(IngestError::UnknownTable(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Row coercion
// ---------------------------------------------------------------------------

pub fn message_from_row(row: &Value) -> Result<Message, IngestError> {
    const T: &str = MESSAGES_TABLE;
    let kind_str = optional_str(row, "kind").unwrap_or_else(|| "text".to_string());
    let kind = match kind_str.as_str() {
        "text" => MessageKind::Text,
        "image" => MessageKind::Image,
        "gif" | "animated_image" => MessageKind::AnimatedImage,
        "system" => MessageKind::System,
        _ => {
            return Err(IngestError::UnknownKind {
                table: T,
                value: kind_str,
            })
        }
    };
    let metadata = match row.get("metadata") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
        Some(Value::Null) | None => BTreeMap::new(),
        Some(_) => {
            return Err(IngestError::InvalidField {
                table: T,
                field: "metadata",
                reason: "expected an object".to_string(),
            })
        }
    };
    Ok(Message {
        id: MessageId(required_str(row, T, "id")?),
        conversation_id: ConversationId(required_str(row, T, "conversation_id")?),
        thread_id: optional_str(row, "thread_id").map(ThreadId),
        sender_id: UserId(required_str(row, T, "sender_id")?),
        reply_to: optional_str(row, "reply_to_id").map(MessageId),
        kind,
        body: optional_str(row, "body"),
        metadata,
        created_at: required_timestamp(row, T, "created_at")?,
        deleted_at: optional_timestamp(row, T, "deleted_at")?,
    })
}

pub fn thread_from_row(row: &Value) -> Result<Thread, IngestError> {
    const T: &str = THREADS_TABLE;
    Ok(Thread {
        id: ThreadId(required_str(row, T, "id")?),
        title: optional_str(row, "title"),
        conversation_id: ConversationId(required_str(row, T, "conversation_id")?),
        creator_id: UserId(required_str(row, T, "created_by")?),
        created_at: required_timestamp(row, T, "created_at")?,
        archived_at: optional_timestamp(row, T, "archived_at")?,
    })
}

pub fn attachment_from_row(row: &Value) -> Result<Attachment, IngestError> {
    const T: &str = ATTACHMENTS_TABLE;
    let mime_type = required_str(row, T, "mime_type")?;
    let kind = match optional_str(row, "kind").as_deref() {
        Some("image") => AttachmentKind::Image,
        Some("gif") | Some("animated_image") => AttachmentKind::AnimatedImage,
        Some("file") => AttachmentKind::File,
        Some(other) => {
            return Err(IngestError::UnknownKind {
                table: T,
                value: other.to_string(),
            })
        }
        None => AttachmentKind::from_mime(&mime_type),
    };
    let size_bytes = required_u64(row, T, "size_bytes")?;
    if size_bytes == 0 {
        return Err(IngestError::InvalidField {
            table: T,
            field: "size_bytes",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(Attachment {
        id: AttachmentId(required_str(row, T, "id")?),
        message_id: MessageId(required_str(row, T, "message_id")?),
        kind,
        location: StorageLocation {
            bucket: required_str(row, T, "bucket")?,
            path: required_str(row, T, "path")?,
        },
        mime_type,
        size_bytes,
        width: optional_u32(row, "width"),
        height: optional_u32(row, "height"),
        uploader_id: UserId(required_str(row, T, "uploader_id")?),
        created_at: required_timestamp(row, T, "created_at")?,
    })
}

pub fn reaction_from_row(row: &Value) -> Result<Reaction, IngestError> {
    let key = reaction_key_from_row(row)?;
    Ok(Reaction {
        message_id: key.message_id,
        user_id: key.user_id,
        emoji: key.emoji,
        created_at: required_timestamp(row, REACTIONS_TABLE, "created_at")?,
    })
}

fn reaction_key_from_row(row: &Value) -> Result<ReactionKey, IngestError> {
    const T: &str = REACTIONS_TABLE;
    Ok(ReactionKey {
        message_id: MessageId(required_str(row, T, "message_id")?),
        user_id: UserId(required_str(row, T, "user_id")?),
        emoji: required_str(row, T, "emoji")?,
    })
}

pub fn profile_from_row(row: &Value) -> Result<Profile, IngestError> {
    Ok(Profile {
        id: UserId(required_str(row, "profiles", "id")?),
        display_name: optional_str(row, "display_name").or_else(|| optional_str(row, "username")),
        avatar: optional_str(row, "avatar_url"),
    })
}

pub fn conversation_from_row(row: &Value) -> Result<ConversationSummary, IngestError> {
    const T: &str = "conversations";
    Ok(ConversationSummary {
        id: ConversationId(required_str(row, T, "id")?),
        title: optional_str(row, "title").or_else(|| optional_str(row, "name")),
        is_channel: row
            .get("is_channel")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        joined: row.get("joined").and_then(Value::as_bool).unwrap_or(false),
        member_count: optional_u32(row, "member_count").unwrap_or(0),
        last_message_at: optional_timestamp(row, T, "last_message_at")?,
    })
}

/// Decode every row in `rows`, logging and skipping the ones that fail.
pub fn decode_rows<T>(
    rows: &[Value],
    decode: impl Fn(&Value) -> Result<T, IngestError>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("ingest: dropping row: {}", e);
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn optional_str(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_str(row: &Value, table: &'static str, field: &'static str) -> Result<String, IngestError> {
    optional_str(row, field).ok_or(IngestError::MissingField { table, field })
}

fn optional_u32(row: &Value, field: &str) -> Option<u32> {
    row.get(field)?.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn required_u64(row: &Value, table: &'static str, field: &'static str) -> Result<u64, IngestError> {
    match row.get(field) {
        None | Some(Value::Null) => Err(IngestError::MissingField { table, field }),
        Some(v) => v.as_u64().ok_or_else(|| IngestError::InvalidField {
            table,
            field,
            reason: format!("expected a non-negative integer, got {v}"),
        }),
    }
}

fn optional_timestamp(
    row: &Value,
    table: &'static str,
    field: &'static str,
) -> Result<Option<Millis>, IngestError> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| IngestError::InvalidField {
            table,
            field,
            reason: "timestamp out of range".to_string(),
        }),
        Some(Value::String(s)) => parse_timestamp(s).map(Some).ok_or_else(|| {
            IngestError::InvalidField {
                table,
                field,
                reason: format!("unparseable timestamp `{s}`"),
            }
        }),
        Some(other) => Err(IngestError::InvalidField {
            table,
            field,
            reason: format!("unexpected value {other}"),
        }),
    }
}

fn required_timestamp(
    row: &Value,
    table: &'static str,
    field: &'static str,
) -> Result<Millis, IngestError> {
    optional_timestamp(row, table, field)?.ok_or(IngestError::MissingField { table, field })
}

/// Accepts RFC 3339 and the Postgres `timestamptz` text form.
pub fn parse_timestamp(s: &str) -> Option<Millis> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}
