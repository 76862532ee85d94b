//! Tunables for the sync engine.

use std::time::Duration;

use crate::model::Millis;

/// Quiet period before a media message without attachments is re-fetched.
pub const HYDRATION_DELAY_MS: u64 = 650;
/// Quiet period that coalesces bursts of cache writes into one.
pub const CACHE_WRITE_DELAY_MS: u64 = 220;
/// Distinct orphaned message ids the pending buffer tolerates before dropping everything.
pub const PENDING_MAX_MESSAGES: usize = 200;
pub const SNAPSHOT_MAX_MESSAGES: usize = 180;
pub const SNAPSHOT_MAX_THREADS: usize = 80;
pub const CONVERSATION_CACHE_MAX_AGE_MS: Millis = 24 * 60 * 60 * 1000;
pub const OVERVIEW_CACHE_MAX_AGE_MS: Millis = 10 * 60 * 1000;
pub const SIGNED_URL_TTL_SECS: u64 = 3600;
pub const MEDIA_BUCKET: &str = "chat-media";
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;
pub(crate) const FEED_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub hydration_delay: Duration,
    pub cache_write_delay: Duration,
    pub pending_max_messages: usize,
    pub snapshot_max_messages: usize,
    pub snapshot_max_threads: usize,
    pub conversation_cache_max_age_ms: Millis,
    pub overview_cache_max_age_ms: Millis,
    pub signed_url_ttl_secs: u64,
    pub media_bucket: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hydration_delay: Duration::from_millis(HYDRATION_DELAY_MS),
            cache_write_delay: Duration::from_millis(CACHE_WRITE_DELAY_MS),
            pending_max_messages: PENDING_MAX_MESSAGES,
            snapshot_max_messages: SNAPSHOT_MAX_MESSAGES,
            snapshot_max_threads: SNAPSHOT_MAX_THREADS,
            conversation_cache_max_age_ms: CONVERSATION_CACHE_MAX_AGE_MS,
            overview_cache_max_age_ms: OVERVIEW_CACHE_MAX_AGE_MS,
            signed_url_ttl_secs: SIGNED_URL_TTL_SECS,
            media_bucket: MEDIA_BUCKET.to_string(),
        }
    }
}
