//! HTTP implementation of [`ChatBackend`] and [`ObjectStorage`].
//!
//! Talks to a PostgREST-style row API (`/rest/v1`), its RPC endpoints
//! (`/rest/v1/rpc/<name>`) and an object storage API (`/storage/v1`).
//! Requests use blocking `ureq` calls moved onto tokio's blocking pool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::backend::{
    BackendError, ChatBackend, CreatedThread, NewAttachment, ObjectStorage, OutgoingMessage,
};
use crate::ingest::{ATTACHMENTS_TABLE, MESSAGES_TABLE, REACTIONS_TABLE, THREADS_TABLE};
use crate::model::{
    AttachmentId, ConversationId, MessageId, Reaction, ReactionKey, StorageLocation, UserId,
};

#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project base URL, e.g. `https://example.supabase.co`.
    pub base_url: String,
    pub api_key: String,
    /// User session token; the API key is used when absent.
    pub access_token: Option<String>,
}

#[derive(Clone)]
pub struct RestBackend {
    config: Arc<RestConfig>,
    agent: ureq::Agent,
}

fn map_ureq_error(error: ureq::Error) -> BackendError {
    match error {
        ureq::Error::Status(409, response) => {
            BackendError::Conflict(response.into_string().unwrap_or_default())
        }
        ureq::Error::Status(status, response) => BackendError::Status {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => BackendError::Network(transport.to_string()),
    }
}

fn in_list<T: std::fmt::Display>(ids: &[T]) -> String {
    let joined: Vec<String> = ids.iter().map(|id| format!("\"{id}\"")).collect();
    format!("in.({})", joined.join(","))
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(30))
            .build();
        Self {
            config: Arc::new(config),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        self.agent
            .request(method, &self.url(path))
            .set("apikey", &self.config.api_key)
            .set("Authorization", &format!("Bearer {token}"))
    }

    /// Run a blocking request on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(RestBackend) -> Result<T, BackendError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| BackendError::Network(format!("request task failed: {e}")))?
    }

    async fn select(&self, table: &'static str, filters: Vec<(&'static str, String)>) -> Result<Vec<Value>, BackendError> {
        self.blocking(move |this| {
            let mut req = this.request("GET", &format!("/rest/v1/{table}")).query("select", "*");
            for (column, filter) in &filters {
                req = req.query(column, filter);
            }
            let rows: Vec<Value> = req
                .call()
                .map_err(map_ureq_error)?
                .into_json()
                .map_err(|e| BackendError::Decode(format!("{table}: {e}")))?;
            Ok(rows)
        })
        .await
    }

    async fn rpc(&self, name: &'static str, args: Value) -> Result<Value, BackendError> {
        self.blocking(move |this| {
            let response = this
                .request("POST", &format!("/rest/v1/rpc/{name}"))
                .send_json(args)
                .map_err(map_ureq_error)?;
            let text = response
                .into_string()
                .map_err(|e| BackendError::Decode(format!("rpc {name}: {e}")))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(format!("rpc {name}: {e}")))
        })
        .await
    }
}

#[async_trait]
impl ChatBackend for RestBackend {
    async fn fetch_messages(&self, conversation: &ConversationId) -> Result<Vec<Value>, BackendError> {
        self.select(
            MESSAGES_TABLE,
            vec![
                ("conversation_id", format!("eq.{conversation}")),
                ("deleted_at", "is.null".to_string()),
                ("order", "created_at.asc,id.asc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_threads(&self, conversation: &ConversationId) -> Result<Vec<Value>, BackendError> {
        self.select(
            THREADS_TABLE,
            vec![
                ("conversation_id", format!("eq.{conversation}")),
                ("archived_at", "is.null".to_string()),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_attachments(&self, messages: &[MessageId]) -> Result<Vec<Value>, BackendError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        self.select(ATTACHMENTS_TABLE, vec![("message_id", in_list(messages))])
            .await
    }

    async fn fetch_reactions(&self, messages: &[MessageId]) -> Result<Vec<Value>, BackendError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        self.select(REACTIONS_TABLE, vec![("message_id", in_list(messages))])
            .await
    }

    async fn fetch_profiles(&self, users: &[UserId]) -> Result<Vec<Value>, BackendError> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        self.select("profiles", vec![("id", in_list(users))]).await
    }

    async fn fetch_overview(&self, user: &UserId) -> Result<Value, BackendError> {
        self.rpc("get_chat_overview", json!({ "p_user_id": user })).await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<MessageId, BackendError> {
        let args = json!({
            "p_conversation_id": message.conversation_id,
            "p_body": message.body,
            "p_kind": message.kind.as_str(),
            "p_thread_id": message.thread_id,
            "p_reply_to_id": message.reply_to,
            "p_metadata": message.metadata,
        });
        match self.rpc("send_message", args).await? {
            Value::String(id) => Ok(MessageId(id)),
            other => Err(BackendError::Decode(format!(
                "send_message: expected an id, got {other}"
            ))),
        }
    }

    async fn create_thread(
        &self,
        conversation: &ConversationId,
        body: &str,
        title: Option<&str>,
    ) -> Result<CreatedThread, BackendError> {
        let args = json!({
            "p_conversation_id": conversation,
            "p_body": body,
            "p_title": title,
        });
        let value = self.rpc("create_thread", args).await?;
        // Set-returning functions come back as a one-element array.
        let value = match value {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            other => other,
        };
        serde_json::from_value(value).map_err(|e| BackendError::Decode(format!("create_thread: {e}")))
    }

    async fn insert_attachment(&self, attachment: &NewAttachment) -> Result<AttachmentId, BackendError> {
        let row = json!({
            "message_id": attachment.message_id,
            "kind": attachment.kind.as_str(),
            "bucket": attachment.location.bucket,
            "path": attachment.location.path,
            "mime_type": attachment.mime_type,
            "size_bytes": attachment.size_bytes,
            "width": attachment.width,
            "height": attachment.height,
        });
        self.blocking(move |this| {
            let rows: Vec<Value> = this
                .request("POST", &format!("/rest/v1/{ATTACHMENTS_TABLE}"))
                .set("Prefer", "return=representation")
                .send_json(row)
                .map_err(map_ureq_error)?
                .into_json()
                .map_err(|e| BackendError::Decode(format!("insert attachment: {e}")))?;
            rows.first()
                .and_then(|r| r.get("id"))
                .and_then(Value::as_str)
                .map(AttachmentId::from)
                .ok_or_else(|| BackendError::Decode("insert attachment: no id returned".to_string()))
        })
        .await
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), BackendError> {
        let row = json!({
            "message_id": reaction.message_id,
            "user_id": reaction.user_id,
            "emoji": reaction.emoji,
        });
        self.blocking(move |this| {
            this.request("POST", &format!("/rest/v1/{REACTIONS_TABLE}"))
                .send_json(row)
                .map_err(map_ureq_error)?;
            Ok(())
        })
        .await
    }

    async fn remove_reaction(&self, key: &ReactionKey) -> Result<(), BackendError> {
        let key = key.clone();
        self.blocking(move |this| {
            this.request("DELETE", &format!("/rest/v1/{REACTIONS_TABLE}"))
                .query("message_id", &format!("eq.{}", key.message_id))
                .query("user_id", &format!("eq.{}", key.user_id))
                .query("emoji", &format!("eq.{}", key.emoji))
                .call()
                .map_err(map_ureq_error)?;
            Ok(())
        })
        .await
    }

    async fn delete_message(&self, message: &MessageId) -> Result<(), BackendError> {
        self.rpc("delete_message", json!({ "p_message_id": message }))
            .await
            .map(|_| ())
    }

    async fn join_group(&self, conversation: &ConversationId) -> Result<(), BackendError> {
        self.rpc("join_group", json!({ "p_conversation_id": conversation }))
            .await
            .map(|_| ())
    }

    async fn leave_group(&self, conversation: &ConversationId) -> Result<(), BackendError> {
        self.rpc("leave_group", json!({ "p_conversation_id": conversation }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ObjectStorage for RestBackend {
    async fn upload(
        &self,
        location: &StorageLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError> {
        let path = format!("/storage/v1/object/{}/{}", location.bucket, location.path);
        let content_type = content_type.to_string();
        self.blocking(move |this| {
            this.request("POST", &path)
                .set("Content-Type", &content_type)
                .send_bytes(&bytes)
                .map_err(map_ureq_error)?;
            Ok(())
        })
        .await
    }

    async fn create_signed_url(
        &self,
        location: &StorageLocation,
        ttl_secs: u64,
    ) -> Result<String, BackendError> {
        let path = format!("/storage/v1/object/sign/{}/{}", location.bucket, location.path);
        self.blocking(move |this| {
            let body: Value = this
                .request("POST", &path)
                .send_json(json!({ "expiresIn": ttl_secs }))
                .map_err(map_ureq_error)?
                .into_json()
                .map_err(|e| BackendError::Decode(format!("sign url: {e}")))?;
            let signed = body
                .get("signedURL")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Decode("sign url: missing signedURL".to_string()))?;
            Ok(this.url(&format!("/storage/v1{signed}")))
        })
        .await
    }

    async fn create_signed_urls(
        &self,
        bucket: &str,
        paths: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<(String, String)>, BackendError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = format!("/storage/v1/object/sign/{bucket}");
        let paths = paths.to_vec();
        self.blocking(move |this| {
            let rows: Vec<Value> = this
                .request("POST", &endpoint)
                .send_json(json!({ "expiresIn": ttl_secs, "paths": paths }))
                .map_err(map_ureq_error)?
                .into_json()
                .map_err(|e| BackendError::Decode(format!("sign urls: {e}")))?;
            Ok(rows
                .iter()
                .filter_map(|row| {
                    let path = row.get("path")?.as_str()?;
                    let signed = row.get("signedURL")?.as_str()?;
                    Some((path.to_string(), this.url(&format!("/storage/v1{signed}"))))
                })
                .collect())
        })
        .await
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), BackendError> {
        if paths.is_empty() {
            return Ok(());
        }
        let endpoint = format!("/storage/v1/object/{bucket}");
        let paths = paths.to_vec();
        self.blocking(move |this| {
            this.request("DELETE", &endpoint)
                .send_json(json!({ "prefixes": paths }))
                .map_err(map_ureq_error)?;
            Ok(())
        })
        .await
    }
}
