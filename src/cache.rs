//! Durable key/value cache for reconciled chat state.
//!
//! Two layers live here:
//!
//! - [`KvCache`]: a payload store with write timestamps and max-age reads,
//!   backed by SQLite ([`SqliteCache`]) or memory ([`MemoryCache`]).
//! - [`CacheStore`]: the engine-facing wrapper that knows the key scheme,
//!   truncates snapshots before writing, coalesces bursts of writes, and
//!   invalidates everything belonging to a user.
//!
//! Keys are scoped per user (`sprig:v1:<user>:overview`) and per user and
//! conversation (`sprig:v1:<user>:conv:<conversation>`).

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::model::{
    Attachment, ChatOverview, ConversationId, Message, MessageId, Millis, Profile, Reaction,
    Thread, UserId,
};
use crate::reconciler::Reconciler;
use crate::scheduler::Debouncer;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Key/value backends
// ---------------------------------------------------------------------------

pub trait KvCache: Send + Sync {
    /// The payload stored under `key`, if it was written no more than
    /// `max_age_ms` ago.
    fn read(&self, key: &str, max_age_ms: Millis) -> Result<Option<String>, CacheError>;
    /// Replace the payload stored under `key`.
    fn write(&self, key: &str, payload: &str) -> Result<(), CacheError>;
    fn delete_key(&self, key: &str) -> Result<(), CacheError>;
    /// Delete every key starting with `prefix`, returning how many were removed.
    fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

fn is_fresh(written_at: Millis, now: Millis, max_age_ms: Millis) -> bool {
    now.saturating_sub(written_at) <= max_age_ms
}

pub struct SqliteCache {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    /// Open or create a cache database at `path`.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?, clock)
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_cache (
                key         TEXT PRIMARY KEY,
                payload     TEXT NOT NULL,
                written_at  INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvCache for SqliteCache {
    fn read(&self, key: &str, max_age_ms: Millis) -> Result<Option<String>, CacheError> {
        let row: Option<(String, i64)> = self
            .conn()
            .query_row(
                "SELECT payload, written_at FROM kv_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let now = self.clock.now_ms();
        Ok(row.and_then(|(payload, written_at)| {
            is_fresh(written_at, now, max_age_ms).then_some(payload)
        }))
    }

    fn write(&self, key: &str, payload: &str) -> Result<(), CacheError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO kv_cache (key, payload, written_at) VALUES (?1, ?2, ?3)",
            params![key, payload, self.clock.now_ms()],
        )?;
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        self.conn()
            .execute("DELETE FROM kv_cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let affected = self.conn().execute(
            "DELETE FROM kv_cache WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(affected)
    }
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Millis, String)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (Millis, String)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KvCache for MemoryCache {
    fn read(&self, key: &str, max_age_ms: Millis) -> Result<Option<String>, CacheError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries()
            .get(key)
            .filter(|(written_at, _)| is_fresh(*written_at, now, max_age_ms))
            .map(|(_, payload)| payload.clone()))
    }

    fn write(&self, key: &str, payload: &str) -> Result<(), CacheError> {
        let now = self.clock.now_ms();
        self.entries()
            .insert(key.to_string(), (now, payload.to_string()));
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        self.entries().remove(key);
        Ok(())
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SnapshotLimits {
    pub max_messages: usize,
    pub max_threads: usize,
}

/// A bounded copy of one conversation's reconciled state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub threads: Vec<Thread>,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub profiles: Vec<Profile>,
}

impl ConversationSnapshot {
    /// Capture the most recent messages and threads plus only the
    /// attachment, reaction and profile rows those messages still reference.
    pub fn capture(rec: &Reconciler, limits: SnapshotLimits) -> Self {
        let all = rec.messages();
        let messages: Vec<Message> = all[all.len().saturating_sub(limits.max_messages)..].to_vec();

        let threads_by_age = rec.threads();
        let threads: Vec<Thread> = threads_by_age
            [threads_by_age.len().saturating_sub(limits.max_threads)..]
            .iter()
            .map(|t| (*t).clone())
            .collect();

        let mut attachments = Vec::new();
        let mut reactions = Vec::new();
        let mut users = BTreeSet::new();
        for m in &messages {
            users.insert(m.sender_id.clone());
            for a in rec.attachments_for(&m.id) {
                users.insert(a.uploader_id.clone());
                attachments.push(a.clone());
            }
            for r in rec.reactions_for(&m.id) {
                users.insert(r.user_id.clone());
                reactions.push(r.clone());
            }
        }
        let profiles = users
            .iter()
            .filter_map(|id| rec.profile(id).cloned())
            .collect();

        Self {
            conversation_id: rec.conversation_id().clone(),
            messages,
            threads,
            attachments,
            reactions,
            profiles,
        }
    }

    /// Replay the snapshot through the reconciler's upsert operations.
    pub fn restore_into(self, rec: &mut Reconciler) -> Vec<MessageId> {
        for thread in self.threads {
            rec.upsert_thread(thread);
        }
        let ids = self.messages.iter().map(|m| m.id.clone()).collect();
        for message in self.messages {
            rec.upsert_message(message);
        }
        for attachment in self.attachments {
            rec.upsert_attachment(attachment);
        }
        for reaction in self.reactions {
            rec.upsert_reaction(reaction);
        }
        for profile in self.profiles {
            rec.upsert_profile(profile);
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

const KEY_NAMESPACE: &str = "sprig:v1";

pub fn user_prefix(user: &UserId) -> String {
    format!("{KEY_NAMESPACE}:{user}:")
}

pub fn overview_key(user: &UserId) -> String {
    format!("{}overview", user_prefix(user))
}

pub fn conversation_prefix(user: &UserId) -> String {
    format!("{}conv:", user_prefix(user))
}

pub fn conversation_key(user: &UserId, conversation: &ConversationId) -> String {
    format!("{}{}", conversation_prefix(user), conversation)
}

#[derive(Clone)]
pub struct CacheStore {
    kv: Arc<dyn KvCache>,
    writes: Debouncer,
    write_delay: Duration,
}

impl CacheStore {
    pub fn new(kv: Arc<dyn KvCache>, write_delay: Duration) -> Self {
        Self {
            kv,
            writes: Debouncer::new(),
            write_delay,
        }
    }

    pub fn read_conversation(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        max_age_ms: Millis,
    ) -> Option<ConversationSnapshot> {
        self.read_json(&conversation_key(user, conversation), max_age_ms)
    }

    /// Coalesce a conversation write. `capture` runs once, when the quiet
    /// period ends, and may return `None` to skip the write.
    pub fn schedule_conversation_write<F>(&self, user: &UserId, conversation: &ConversationId, capture: F)
    where
        F: Future<Output = Option<ConversationSnapshot>> + Send + 'static,
    {
        let key = conversation_key(user, conversation);
        let kv = Arc::clone(&self.kv);
        let task_key = key.clone();
        self.writes.schedule(key, self.write_delay, async move {
            if let Some(snapshot) = capture.await {
                write_json(kv.as_ref(), &task_key, &snapshot);
            }
        });
    }

    pub fn is_conversation_write_pending(&self, user: &UserId, conversation: &ConversationId) -> bool {
        self.writes.is_scheduled(&conversation_key(user, conversation))
    }

    /// Write `snapshot` immediately, replacing any coalesced write for it.
    pub fn flush_conversation(&self, user: &UserId, snapshot: &ConversationSnapshot) {
        let key = conversation_key(user, &snapshot.conversation_id);
        self.writes.cancel(&key);
        write_json(self.kv.as_ref(), &key, snapshot);
    }

    pub fn read_overview(&self, user: &UserId, max_age_ms: Millis) -> Option<ChatOverview> {
        self.read_json(&overview_key(user), max_age_ms)
    }

    pub fn schedule_overview_write(&self, user: &UserId, overview: &ChatOverview) {
        self.schedule_json(overview_key(user), overview);
    }

    /// Drop the overview and every conversation snapshot for `user`,
    /// including writes that have not landed yet.
    pub fn invalidate_user(&self, user: &UserId) -> Result<(), CacheError> {
        let cancelled = self.writes.cancel_prefix(&user_prefix(user));
        self.kv.delete_key(&overview_key(user))?;
        let removed = self.kv.delete_by_prefix(&conversation_prefix(user))?;
        tracing::info!(
            "cache: invalidated {} conversation snapshot(s) for {} ({} pending write(s) dropped)",
            removed,
            crate::logging::user_id(user.as_str()),
            cancelled
        );
        Ok(())
    }

    /// Writes waiting for their quiet period.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, key: &str, max_age_ms: Millis) -> Option<T> {
        let payload = match self.kv.read(key, max_age_ms) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("cache: read {} failed: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("cache: discarding unreadable payload at {}: {}", key, e);
                let _ = self.kv.delete_key(key);
                None
            }
        }
    }

    fn schedule_json<T: Serialize>(&self, key: String, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("cache: failed to serialize {}: {}", key, e);
                return;
            }
        };
        let kv = Arc::clone(&self.kv);
        let task_key = key.clone();
        self.writes.schedule(key, self.write_delay, async move {
            if let Err(e) = kv.write(&task_key, &payload) {
                tracing::warn!("cache: write {} failed: {}", task_key, e);
            }
        });
    }
}

fn write_json<T: Serialize>(kv: &dyn KvCache, key: &str, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(CacheError::from)
        .and_then(|payload| kv.write(key, &payload));
    if let Err(e) = result {
        tracing::warn!("cache: write {} failed: {}", key, e);
    }
}
