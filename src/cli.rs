//! `sprig-tail`: follow one conversation from the terminal.
//!
//! Opens the conversation against the HTTP and realtime adapters, prints the
//! timeline after the bulk load and again after every change, and optionally
//! sends a message first.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

use crate::cache::{CacheError, SqliteCache};
use crate::clock::SystemClock;
use crate::config::SyncConfig;
use crate::model::{ConversationId, UserId};
use crate::realtime::{RealtimeConfig, RealtimeFeed};
use crate::rest::{RestBackend, RestConfig};
use crate::session::{ChatSession, Collaborators, SessionEvent, SyncError, UserContext};
use crate::view::ChatView;

/// Tail a Sprig community conversation.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "sprig-tail", version, about)]
pub struct Cli {
    /// Conversation to open
    pub conversation: String,

    /// Backend base URL [env: SPRIG_URL]
    #[arg(long, short = 'u')]
    pub url: Option<String>,

    /// Public API key [env: SPRIG_ANON_KEY]
    #[arg(long)]
    pub anon_key: Option<String>,

    /// Session token of the signed-in user [env: SPRIG_ACCESS_TOKEN]
    #[arg(long)]
    pub access_token: Option<String>,

    /// Id of the signed-in user [env: SPRIG_USER_ID]
    #[arg(long)]
    pub user_id: Option<String>,

    /// Directory holding the local cache [env: SPRIG_HOME] [default: ~/.sprig]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Send this text to the conversation once it is open
    #[arg(long, short = 's')]
    pub send: Option<String>,

    /// Also follow a city's activity feed
    #[arg(long)]
    pub city: Option<String>,

    /// Exit after the initial load instead of following changes
    #[arg(long)]
    pub once: bool,
}

pub struct Config {
    pub conversation: ConversationId,
    pub base_url: String,
    pub anon_key: String,
    pub access_token: Option<String>,
    pub user_id: UserId,
    pub data_dir: PathBuf,
    pub send: Option<String>,
    pub city: Option<String>,
    pub once: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("missing {0}: pass it as an argument or set {1}")]
    Missing(&'static str, &'static str),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{}", .0.user_message())]
    Sync(#[from] SyncError),
}

fn required(value: Option<String>, name: &'static str, env: &'static str) -> Result<String, CliError> {
    value
        .or_else(|| std::env::var(env).ok())
        .filter(|v| !v.is_empty())
        .ok_or(CliError::Missing(name, env))
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, CliError> {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("SPRIG_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".sprig"))
                    .unwrap_or_else(|_| PathBuf::from(".sprig"))
            });

        let access_token = cli
            .access_token
            .or_else(|| std::env::var("SPRIG_ACCESS_TOKEN").ok());

        Ok(Self {
            conversation: ConversationId(cli.conversation),
            base_url: required(cli.url, "backend URL", "SPRIG_URL")?,
            anon_key: required(cli.anon_key, "API key", "SPRIG_ANON_KEY")?,
            access_token,
            user_id: UserId(required(cli.user_id, "user id", "SPRIG_USER_ID")?),
            data_dir,
            send: cli.send,
            city: cli.city,
            once: cli.once,
        })
    }
}

/// Entry point: parse CLI, wire up the adapters, follow the conversation.
pub async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli)?;

    crate::logging::init();

    tracing::info!("sprig-tail starting");
    tracing::info!("  backend: {}", config.base_url);
    tracing::info!("  data directory: {}", config.data_dir.display());
    tracing::info!("  user: {}", crate::logging::user_id(config.user_id.as_str()));

    let clock = Arc::new(SystemClock);
    let cache = SqliteCache::open(&config.data_dir.join("cache.db"), clock.clone())?;
    let backend = RestBackend::new(RestConfig {
        base_url: config.base_url.clone(),
        api_key: config.anon_key.clone(),
        access_token: config.access_token.clone(),
    });
    let feed = RealtimeFeed::new(RealtimeConfig {
        base_url: config.base_url.clone(),
        api_key: config.anon_key.clone(),
        access_token: config.access_token.clone(),
    });

    let session = ChatSession::new(
        UserContext {
            user_id: config.user_id.clone(),
        },
        SyncConfig::default(),
        Collaborators {
            backend: Arc::new(backend.clone()),
            storage: Arc::new(backend),
            feed: Arc::new(feed),
            cache: Arc::new(cache),
            clock,
        },
    );
    let mut events = session.subscribe_events();

    session.open_conversation(config.conversation.clone()).await?;
    if let Some(view) = session.view().await {
        print_view(&view);
    }

    if let Some(text) = &config.send {
        let id = session.send_text(text).await?;
        tracing::info!("sent {}", crate::logging::msg_id(id.as_str()));
    }
    if config.once {
        return Ok(());
    }
    if let Some(city) = &config.city {
        session.subscribe_city(city).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Changed { .. }) => {
                    if let Some(view) = session.view().await {
                        print_view(&view);
                    }
                }
                Ok(SessionEvent::Error { message, .. }) => eprintln!("! {message}"),
                Ok(SessionEvent::CityActivity { city, table, kind, .. }) => {
                    println!("[{city}] {kind:?} on {table}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.close_conversation().await;
    Ok(())
}

fn print_view(view: &ChatView) {
    println!("── {} ({} messages) ──", view.conversation_id, view.messages.len());
    for entry in &view.messages {
        let name = entry
            .sender
            .as_ref()
            .and_then(|p| p.display_name.clone())
            .unwrap_or_else(|| entry.message.sender_id.to_string());
        let body = entry.message.body.as_deref().unwrap_or("");
        let media = if entry.attachments.is_empty() {
            String::new()
        } else {
            format!(" [{} attachment(s)]", entry.attachments.len())
        };
        let reactions: Vec<String> = entry
            .reactions
            .iter()
            .map(|r| format!("{}×{}", r.emoji, r.count))
            .collect();
        println!("{name}: {body}{media} {}", reactions.join(" "));
    }
    for t in &view.threads {
        println!(
            "  # {} ({} messages, {} unread)",
            t.thread.title.as_deref().unwrap_or("untitled"),
            t.message_count,
            t.unread_count
        );
    }
}
