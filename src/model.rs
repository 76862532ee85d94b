//! Typed entities for the chat engine.
//!
//! Rows arriving from the backend are coerced into these types by
//! [`crate::ingest`]; nothing past that boundary handles raw JSON.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// Opaque message identity assigned by the server.
    MessageId
);
id_type!(ConversationId);
id_type!(ThreadId);
id_type!(AttachmentId);
id_type!(UserId);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    AnimatedImage,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::AnimatedImage => "animated_image",
            MessageKind::System => "system",
        }
    }

    /// Media messages are expected to carry at least one attachment.
    pub fn is_media(&self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::AnimatedImage)
    }
}

/// Timestamps throughout the engine are milliseconds since the UNIX epoch.
pub type Millis = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub thread_id: Option<ThreadId>,
    pub sender_id: UserId,
    pub reply_to: Option<MessageId>,
    pub kind: MessageKind,
    pub body: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: Millis,
    pub deleted_at: Option<Millis>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Display order: creation time ascending, id as the tie-break.
    pub fn order_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub title: Option<String>,
    pub conversation_id: ConversationId,
    pub creator_id: UserId,
    pub created_at: Millis,
    pub archived_at: Option<Millis>,
}

impl Thread {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    AnimatedImage,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::AnimatedImage => "animated_image",
            AttachmentKind::File => "file",
        }
    }

    /// Classify an upload by MIME type.
    pub fn from_mime(mime: &str) -> Self {
        if mime == "image/gif" {
            AttachmentKind::AnimatedImage
        } else if mime.starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        }
    }

    /// Message kind a message carrying only this attachment should have.
    pub fn message_kind(&self) -> MessageKind {
        match self {
            AttachmentKind::Image => MessageKind::Image,
            AttachmentKind::AnimatedImage => MessageKind::AnimatedImage,
            AttachmentKind::File => MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub kind: AttachmentKind,
    pub location: StorageLocation,
    pub mime_type: String,
    /// Always at least 1.
    pub size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub uploader_id: UserId,
    pub created_at: Millis,
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

/// Composite identity of a reaction row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactionKey {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: Millis,
}

impl Reaction {
    pub fn key(&self) -> ReactionKey {
        ReactionKey {
            message_id: self.message_id.clone(),
            user_id: self.user_id.clone(),
            emoji: self.emoji.clone(),
        }
    }

    pub fn matches(&self, key: &ReactionKey) -> bool {
        self.message_id == key.message_id && self.user_id == key.user_id && self.emoji == key.emoji
    }
}

// ---------------------------------------------------------------------------
// Profiles and the user-level overview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

/// One row of the conversation list (a joined group or a public channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: Option<String>,
    pub is_channel: bool,
    pub joined: bool,
    pub member_count: u32,
    pub last_message_at: Option<Millis>,
}

/// User-level state: conversations and channels, plus the roster of people
/// the user shares them with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOverview {
    pub conversations: Vec<ConversationSummary>,
    pub roster: Vec<Profile>,
}
