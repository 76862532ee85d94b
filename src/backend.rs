//! Collaborator interfaces the engine consumes.
//!
//! The managed backend is split into three traits: [`ChatBackend`] (bulk
//! queries and remote procedure calls), [`ObjectStorage`] (media blobs and
//! signed URLs) and [`ChangeFeed`] (live row-level events). Query results are
//! returned as raw JSON rows; typing happens in [`crate::ingest`].
//!
//! [`crate::rest`] and [`crate::realtime`] provide the HTTP and websocket
//! implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::ingest::RawChange;
use crate::model::{
    AttachmentId, AttachmentKind, ConversationId, MessageId, MessageKind, Reaction, ReactionKey,
    StorageLocation, ThreadId, UserId,
};

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub body: Option<String>,
    pub kind: MessageKind,
    pub thread_id: Option<ThreadId>,
    pub reply_to: Option<MessageId>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedThread {
    pub thread_id: ThreadId,
    pub root_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAttachment {
    pub message_id: MessageId,
    pub kind: AttachmentKind,
    pub location: StorageLocation,
    pub mime_type: String,
    pub size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Non-deleted messages of a conversation, oldest first.
    async fn fetch_messages(&self, conversation: &ConversationId) -> Result<Vec<Value>, BackendError>;
    /// Non-archived threads of a conversation.
    async fn fetch_threads(&self, conversation: &ConversationId) -> Result<Vec<Value>, BackendError>;
    async fn fetch_attachments(&self, messages: &[MessageId]) -> Result<Vec<Value>, BackendError>;
    async fn fetch_reactions(&self, messages: &[MessageId]) -> Result<Vec<Value>, BackendError>;
    async fn fetch_profiles(&self, users: &[UserId]) -> Result<Vec<Value>, BackendError>;
    /// `{"conversations": [...], "roster": [...]}` for the given user.
    async fn fetch_overview(&self, user: &UserId) -> Result<Value, BackendError>;

    /// Returns the server-assigned message id.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<MessageId, BackendError>;
    async fn create_thread(
        &self,
        conversation: &ConversationId,
        body: &str,
        title: Option<&str>,
    ) -> Result<CreatedThread, BackendError>;
    async fn insert_attachment(&self, attachment: &NewAttachment) -> Result<AttachmentId, BackendError>;
    /// A duplicate insert fails with [`BackendError::Conflict`].
    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), BackendError>;
    async fn remove_reaction(&self, key: &ReactionKey) -> Result<(), BackendError>;
    /// Soft-deletes the message row.
    async fn delete_message(&self, message: &MessageId) -> Result<(), BackendError>;

    async fn join_group(&self, conversation: &ConversationId) -> Result<(), BackendError>;
    async fn leave_group(&self, conversation: &ConversationId) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        location: &StorageLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError>;
    async fn create_signed_url(
        &self,
        location: &StorageLocation,
        ttl_secs: u64,
    ) -> Result<String, BackendError>;
    /// Returns `(path, url)` pairs for the paths that could be signed.
    async fn create_signed_urls(
        &self,
        bucket: &str,
        paths: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<(String, String)>, BackendError>;
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), BackendError>;
}

/// What a change-feed subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedScope {
    Conversation(ConversationId),
    City(String),
}

impl FeedScope {
    /// Channel topic name for this scope.
    pub fn topic(&self) -> String {
        match self {
            FeedScope::Conversation(id) => format!("sprig:conversation:{id}"),
            FeedScope::City(city) => format!("sprig:city:{city}"),
        }
    }
}

/// An open change-feed: the event receiver plus the task driving the
/// underlying connection, if any.
pub struct FeedStream {
    pub events: mpsc::Receiver<RawChange>,
    pub connection: Option<AbortHandle>,
    /// Bumped each time the connection is re-established. Events sent while
    /// it was down are lost, so subscribers should resynchronize.
    pub reconnects: Option<watch::Receiver<u64>>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: &FeedScope) -> Result<FeedStream, BackendError>;
}
