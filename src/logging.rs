//! Log setup and identifier formatting.
//!
//! Log output goes through `tracing`. [`init`] installs a `fmt` subscriber
//! writing to stderr, filtered by `SPRIG_LOG` (falling back to `RUST_LOG`,
//! then `info`):
//!
//! ```text
//! 2026-02-11T21:33:12.000Z  INFO sprig::loader: loader: 42 message(s) for c-general
//! ```
//!
//! On a terminal, the helpers below colour identifiers by a hash of their
//! content, so the same message or user stands out across lines.

use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let is_terminal = io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let filter = std::env::var("SPRIG_LOG")
        .ok()
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(is_terminal)
        .try_init();
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";

/// Bright, visually distinct colours for ID hashing.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn format_id(prefix: &str, id: &str, colour: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{colour}{prefix}-{short}{RESET}")
    } else {
        format!("{prefix}-{short}")
    }
}

/// Format a user ID, e.g. `u-5f0c2a91`.
pub fn user_id(id: &str) -> String {
    format_id("u", id, hash_colour(id))
}

/// Format a conversation ID, e.g. `c-general`.
pub fn conv_id(id: &str) -> String {
    format_id("c", id, hash_colour(id))
}

const MSG_ID_COLOUR: &str = "\x1b[93m"; // bright yellow

/// Format a message ID, e.g. `m-01HZX4QK`.
pub fn msg_id(id: &str) -> String {
    format_id("m", id, MSG_ID_COLOUR)
}
