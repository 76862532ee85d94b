//! In-process fakes of the backend collaborators shared by the integration
//! tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Notify};

use sprig::backend::{
    BackendError, ChangeFeed, ChatBackend, CreatedThread, FeedScope, FeedStream, NewAttachment,
    ObjectStorage, OutgoingMessage,
};
use sprig::cache::MemoryCache;
use sprig::clock::ManualClock;
use sprig::config::SyncConfig;
use sprig::ingest::{ChangeKind, RawChange};
use sprig::model::{
    AttachmentId, ConversationId, MessageId, Reaction, ReactionKey, StorageLocation, ThreadId,
    UserId,
};
use sprig::{ChatSession, Collaborators, UserContext};

pub const ME: &str = "me";

// ---------------------------------------------------------------------------
// Row builders
// ---------------------------------------------------------------------------

pub fn message_row(id: &str, conversation: &str, sender: &str, kind: &str, created_at: i64) -> Value {
    json!({
        "id": id,
        "conversation_id": conversation,
        "thread_id": null,
        "sender_id": sender,
        "reply_to_id": null,
        "kind": kind,
        "body": format!("body of {id}"),
        "metadata": {},
        "created_at": created_at,
        "deleted_at": null,
    })
}

pub fn thread_row(id: &str, conversation: &str, created_at: i64) -> Value {
    json!({
        "id": id,
        "title": format!("thread {id}"),
        "conversation_id": conversation,
        "created_by": "bob",
        "created_at": created_at,
        "archived_at": null,
    })
}

pub fn attachment_row(id: &str, message: &str, conversation: &str) -> Value {
    json!({
        "id": id,
        "message_id": message,
        "conversation_id": conversation,
        "kind": "image",
        "bucket": "chat-media",
        "path": format!("{conversation}/bob/{id}.jpg"),
        "mime_type": "image/jpeg",
        "size_bytes": 4096,
        "width": 800,
        "height": 600,
        "uploader_id": "bob",
        "created_at": 1,
    })
}

pub fn reaction_row(message: &str, user: &str, emoji: &str, created_at: i64) -> Value {
    json!({
        "message_id": message,
        "user_id": user,
        "emoji": emoji,
        "created_at": created_at,
    })
}

pub fn profile_row(id: &str, name: &str) -> Value {
    json!({ "id": id, "display_name": name, "avatar_url": null })
}

pub fn insert(table: &str, record: Value) -> RawChange {
    RawChange {
        table: table.to_string(),
        kind: ChangeKind::Insert,
        record,
        old_record: Value::Null,
    }
}

pub fn delete(table: &str, old_record: Value) -> RawChange {
    RawChange {
        table: table.to_string(),
        kind: ChangeKind::Delete,
        record: Value::Null,
        old_record,
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BackendRows {
    pub messages: Vec<Value>,
    pub threads: Vec<Value>,
    pub attachments: Vec<Value>,
    pub reactions: Vec<Value>,
    pub profiles: Vec<Value>,
    pub overview: Value,
    /// Operation names that fail with a network error.
    pub failing: HashSet<&'static str>,
    /// Operation names that fail with a conflict.
    pub conflicting: HashSet<&'static str>,
    pub calls: Vec<String>,
    pub next_id: u64,
    /// `fetch_messages` for these conversations waits until notified.
    pub gates: HashMap<ConversationId, Arc<Notify>>,
}

#[derive(Default)]
pub struct FakeBackend {
    rows: Mutex<BackendRows>,
}

impl FakeBackend {
    pub fn rows(&self) -> MutexGuard<'_, BackendRows> {
        self.rows.lock().unwrap()
    }

    pub fn fail(&self, op: &'static str) {
        self.rows().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.rows().failing.remove(op);
    }

    pub fn conflict(&self, op: &'static str) {
        self.rows().conflicting.insert(op);
    }

    /// Hold `fetch_messages` for `conversation` until the returned notify fires.
    pub fn gate(&self, conversation: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.rows()
            .gates
            .insert(ConversationId::from(conversation), notify.clone());
        notify
    }

    pub fn calls(&self, op: &str) -> usize {
        self.rows().calls.iter().filter(|c| c.as_str() == op).count()
    }

    fn enter(&self, op: &'static str) -> Result<(), BackendError> {
        let mut rows = self.rows();
        rows.calls.push(op.to_string());
        if rows.failing.contains(op) {
            return Err(BackendError::Network(format!("{op}: connection reset")));
        }
        if rows.conflicting.contains(op) {
            return Err(BackendError::Conflict(format!("{op}: duplicate key")));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut rows = self.rows();
        rows.next_id += 1;
        format!("{prefix}-{}", rows.next_id)
    }
}

fn by_message(rows: &[Value], ids: &[MessageId]) -> Vec<Value> {
    rows.iter()
        .filter(|r| ids.iter().any(|id| r["message_id"] == id.as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_messages(&self, conversation: &ConversationId) -> Result<Vec<Value>, BackendError> {
        let gate = self.rows().gates.get(conversation).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.enter("fetch_messages")?;
        Ok(self
            .rows()
            .messages
            .iter()
            .filter(|r| r["conversation_id"] == conversation.as_str())
            .cloned()
            .collect())
    }

    async fn fetch_threads(&self, conversation: &ConversationId) -> Result<Vec<Value>, BackendError> {
        self.enter("fetch_threads")?;
        Ok(self
            .rows()
            .threads
            .iter()
            .filter(|r| r["conversation_id"] == conversation.as_str())
            .cloned()
            .collect())
    }

    async fn fetch_attachments(&self, messages: &[MessageId]) -> Result<Vec<Value>, BackendError> {
        self.enter("fetch_attachments")?;
        Ok(by_message(&self.rows().attachments, messages))
    }

    async fn fetch_reactions(&self, messages: &[MessageId]) -> Result<Vec<Value>, BackendError> {
        self.enter("fetch_reactions")?;
        Ok(by_message(&self.rows().reactions, messages))
    }

    async fn fetch_profiles(&self, users: &[UserId]) -> Result<Vec<Value>, BackendError> {
        self.enter("fetch_profiles")?;
        Ok(self
            .rows()
            .profiles
            .iter()
            .filter(|r| users.iter().any(|u| r["id"] == u.as_str()))
            .cloned()
            .collect())
    }

    async fn fetch_overview(&self, _user: &UserId) -> Result<Value, BackendError> {
        self.enter("fetch_overview")?;
        Ok(self.rows().overview.clone())
    }

    async fn send_message(&self, _message: &OutgoingMessage) -> Result<MessageId, BackendError> {
        self.enter("send_message")?;
        Ok(MessageId(self.next_id("sent")))
    }

    async fn create_thread(
        &self,
        _conversation: &ConversationId,
        _body: &str,
        _title: Option<&str>,
    ) -> Result<CreatedThread, BackendError> {
        self.enter("create_thread")?;
        Ok(CreatedThread {
            thread_id: ThreadId(self.next_id("thread")),
            root_message_id: MessageId(self.next_id("root")),
        })
    }

    async fn insert_attachment(&self, _attachment: &NewAttachment) -> Result<AttachmentId, BackendError> {
        self.enter("insert_attachment")?;
        Ok(AttachmentId(self.next_id("att")))
    }

    async fn add_reaction(&self, _reaction: &Reaction) -> Result<(), BackendError> {
        self.enter("add_reaction")
    }

    async fn remove_reaction(&self, _key: &ReactionKey) -> Result<(), BackendError> {
        self.enter("remove_reaction")
    }

    async fn delete_message(&self, _message: &MessageId) -> Result<(), BackendError> {
        self.enter("delete_message")
    }

    async fn join_group(&self, _conversation: &ConversationId) -> Result<(), BackendError> {
        self.enter("join_group")
    }

    async fn leave_group(&self, _conversation: &ConversationId) -> Result<(), BackendError> {
        self.enter("leave_group")
    }
}

// ---------------------------------------------------------------------------
// Object storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StorageLog {
    pub uploads: Vec<(StorageLocation, usize, String)>,
    pub removed: Vec<(String, Vec<String>)>,
    pub single_signs: usize,
    pub batch_signs: usize,
    pub fail_upload: bool,
    pub fail_remove: bool,
}

#[derive(Default)]
pub struct FakeStorage {
    log: Mutex<StorageLog>,
}

impl FakeStorage {
    pub fn log(&self) -> MutexGuard<'_, StorageLog> {
        self.log.lock().unwrap()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(
        &self,
        location: &StorageLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError> {
        let mut log = self.log();
        if log.fail_upload {
            return Err(BackendError::Network("upload: timed out".to_string()));
        }
        log.uploads
            .push((location.clone(), bytes.len(), content_type.to_string()));
        Ok(())
    }

    async fn create_signed_url(&self, location: &StorageLocation, _ttl_secs: u64) -> Result<String, BackendError> {
        self.log().single_signs += 1;
        Ok(format!("https://signed/{}/{}", location.bucket, location.path))
    }

    async fn create_signed_urls(
        &self,
        bucket: &str,
        paths: &[String],
        _ttl_secs: u64,
    ) -> Result<Vec<(String, String)>, BackendError> {
        self.log().batch_signs += 1;
        Ok(paths
            .iter()
            .map(|p| (p.clone(), format!("https://signed/{bucket}/{p}")))
            .collect())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), BackendError> {
        let mut log = self.log();
        if log.fail_remove {
            return Err(BackendError::Network("remove: timed out".to_string()));
        }
        log.removed.push((bucket.to_string(), paths.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeFeed {
    senders: Mutex<HashMap<FeedScope, mpsc::Sender<RawChange>>>,
    reconnects: Mutex<HashMap<FeedScope, watch::Sender<u64>>>,
    pub subscriptions: Mutex<Vec<FeedScope>>,
}

impl FakeFeed {
    pub fn conversation(&self, id: &str) -> Option<mpsc::Sender<RawChange>> {
        self.senders
            .lock()
            .unwrap()
            .get(&FeedScope::Conversation(ConversationId::from(id)))
            .cloned()
    }

    pub fn city(&self, city: &str) -> Option<mpsc::Sender<RawChange>> {
        self.senders
            .lock()
            .unwrap()
            .get(&FeedScope::City(city.to_string()))
            .cloned()
    }

    /// Whether a subscriber is still listening on `id`'s stream.
    pub fn is_listening(&self, id: &str) -> bool {
        self.conversation(id).map_or(false, |tx| !tx.is_closed())
    }

    /// Signal that `id`'s connection dropped and came back.
    pub fn reconnect(&self, id: &str) {
        let scope = FeedScope::Conversation(ConversationId::from(id));
        let reconnects = self.reconnects.lock().unwrap();
        reconnects
            .get(&scope)
            .expect("no subscription for conversation")
            .send_modify(|n| *n += 1);
    }

    pub async fn push(&self, conversation: &str, change: RawChange) {
        let tx = self
            .conversation(conversation)
            .expect("no subscription for conversation");
        tx.send(change).await.expect("subscriber dropped");
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, scope: &FeedScope) -> Result<FeedStream, BackendError> {
        let (tx, rx) = mpsc::channel(64);
        let (reconnected, reconnects) = watch::channel(0);
        self.senders.lock().unwrap().insert(scope.clone(), tx);
        self.reconnects
            .lock()
            .unwrap()
            .insert(scope.clone(), reconnected);
        self.subscriptions.lock().unwrap().push(scope.clone());
        Ok(FeedStream {
            events: rx,
            connection: None,
            reconnects: Some(reconnects),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub session: ChatSession,
    pub backend: Arc<FakeBackend>,
    pub storage: Arc<FakeStorage>,
    pub feed: Arc<FakeFeed>,
    pub cache: Arc<MemoryCache>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cache(None)
    }

    /// Build a session over `cache` (or a fresh one), so a second session can
    /// start from what a first one persisted.
    pub fn with_cache(cache: Option<(Arc<MemoryCache>, Arc<ManualClock>)>) -> Self {
        let (cache, clock) = cache.unwrap_or_else(|| {
            let clock = Arc::new(ManualClock::new(1_000_000));
            (Arc::new(MemoryCache::new(clock.clone())), clock)
        });
        let backend = Arc::new(FakeBackend::default());
        let storage = Arc::new(FakeStorage::default());
        let feed = Arc::new(FakeFeed::default());
        let session = ChatSession::new(
            UserContext {
                user_id: UserId::from(ME),
            },
            SyncConfig::default(),
            Collaborators {
                backend: backend.clone(),
                storage: storage.clone(),
                feed: feed.clone(),
                cache: cache.clone(),
                clock: clock.clone(),
            },
        );
        Self {
            session,
            backend,
            storage,
            feed,
            cache,
            clock,
        }
    }
}

/// Let spawned tasks (feed pumps, signing, profile fetches) run to quiescence.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Let debounced work (hydration, cache writes) fire. Requires paused time.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}
