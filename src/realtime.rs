//! Websocket [`ChangeFeed`] speaking the Phoenix channel protocol used by
//! Supabase Realtime.
//!
//! Each subscription owns one connection task. The task joins a channel with
//! `postgres_changes` bindings for the scope's tables, sends a heartbeat
//! every 25 seconds, forwards decoded row events into an mpsc channel, and
//! reconnects with exponential backoff when the socket drops. Every
//! successful reconnect bumps [`FeedStream::reconnects`]. Aborting the task
//! (via [`FeedStream::connection`]) tears the connection down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::backend::{BackendError, ChangeFeed, FeedScope, FeedStream};
use crate::config::FEED_CHANNEL_CAPACITY;
use crate::ingest::{ChangeKind, RawChange, ATTACHMENTS_TABLE, MESSAGES_TABLE, REACTIONS_TABLE, THREADS_TABLE};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Table carrying city-scoped community activity.
pub const CITY_EVENTS_TABLE: &str = "city_events";

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project base URL (`https://...`); the websocket URL is derived from it.
    pub base_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
}

#[derive(Clone)]
pub struct RealtimeFeed {
    config: Arc<RealtimeConfig>,
}

impl RealtimeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn socket_url(&self) -> Result<Url, BackendError> {
        let base = self.config.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let mut url = Url::parse(&format!("{ws_base}/realtime/v1/websocket"))
            .map_err(|e| BackendError::Network(format!("invalid realtime url {ws_base}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.config.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, scope: &FeedScope) -> Result<FeedStream, BackendError> {
        let url = self.socket_url()?.to_string();
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let (reconnected, reconnects) = watch::channel(0);
        let join = join_frame(scope, self.config.access_token.as_deref());
        let topic = channel_topic(scope);
        let task = tokio::spawn(connection_loop(url, topic, join, tx, reconnected));
        Ok(FeedStream {
            events: rx,
            connection: Some(task.abort_handle()),
            reconnects: Some(reconnects),
        })
    }
}

fn channel_topic(scope: &FeedScope) -> String {
    format!("realtime:{}", scope.topic())
}

fn bindings(scope: &FeedScope) -> Vec<Value> {
    match scope {
        FeedScope::Conversation(id) => [MESSAGES_TABLE, THREADS_TABLE, ATTACHMENTS_TABLE, REACTIONS_TABLE]
            .iter()
            .map(|table| {
                json!({
                    "event": "*",
                    "schema": "public",
                    "table": table,
                    "filter": format!("conversation_id=eq.{id}"),
                })
            })
            .collect(),
        FeedScope::City(city) => vec![json!({
            "event": "*",
            "schema": "public",
            "table": CITY_EVENTS_TABLE,
            "filter": format!("city=eq.{city}"),
        })],
    }
}

fn join_frame(scope: &FeedScope, access_token: Option<&str>) -> Value {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": bindings(scope),
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    json!({
        "topic": channel_topic(scope),
        "event": "phx_join",
        "payload": payload,
        "ref": "1",
    })
}

fn heartbeat_frame(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

/// Extract a row change from a server frame. Replies, presence and system
/// frames yield `None`.
pub fn parse_frame(text: &str) -> Option<RawChange> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("event")?.as_str()? != "postgres_changes" {
        return None;
    }
    let data = frame.get("payload")?.get("data")?;
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    Some(RawChange {
        table: data.get("table")?.as_str()?.to_string(),
        kind,
        record: data.get("record").cloned().unwrap_or(Value::Null),
        old_record: data.get("old_record").cloned().unwrap_or(Value::Null),
    })
}

async fn connection_loop(
    url: String,
    topic: String,
    join: Value,
    tx: mpsc::Sender<RawChange>,
    reconnected: watch::Sender<u64>,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let refs = AtomicU64::new(2);
    let mut connected_before = false;

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                tracing::info!("realtime: connected, joining {}", topic);
                if connected_before {
                    reconnected.send_modify(|n| *n += 1);
                }
                connected_before = true;
                let (mut write, mut read) = ws_stream.split();

                if let Err(e) = write.send(WsMessage::Text(join.to_string())).await {
                    tracing::warn!("realtime: join for {} failed: {}", topic, e);
                } else {
                    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
                    heartbeat.tick().await;
                    loop {
                        tokio::select! {
                            _ = heartbeat.tick() => {
                                let frame = heartbeat_frame(refs.fetch_add(1, Ordering::Relaxed));
                                if let Err(e) = write.send(WsMessage::Text(frame.to_string())).await {
                                    tracing::warn!("realtime: heartbeat failed: {}", e);
                                    break;
                                }
                            }
                            msg = read.next() => match msg {
                                Some(Ok(WsMessage::Text(text))) => {
                                    if let Some(change) = parse_frame(&text) {
                                        if tx.send(change).await.is_err() {
                                            // Subscriber is gone.
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(WsMessage::Ping(payload))) => {
                                    let _ = write.send(WsMessage::Pong(payload)).await;
                                }
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    tracing::warn!("realtime: {} error: {}", topic, e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
                tracing::info!(
                    "realtime: {} disconnected, reconnecting in {}s",
                    topic,
                    backoff_secs
                );
            }
            Err(e) => {
                tracing::warn!(
                    "realtime: connection failed (retry in {}s): {}",
                    backoff_secs,
                    e
                );
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}
