//! Runtime configuration for the routing core.
//!
//! The original design reached for global property lookups; here every
//! component receives a `Config` (usually behind an `Arc`) at construction.
//! Defaults mirror the tuning values the production deployments run with.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Maximum allowed size for a connection's stanza extraction buffer.
///
/// If the buffer exceeds this limit after stanza extraction, the connection
/// is closed. This prevents unbounded memory growth when the peer sends
/// data that never forms a complete stanza (malformed XML, malicious input,
/// or protocol errors). 1 MB is generous for XMPP: typical stanzas are a
/// few KB, and even vCard avatars rarely exceed 100 KB.
pub const DEFAULT_MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// After this many unacknowledged outbound stanzas, request an `<a/>`
/// from the peer with an `<r/>` element.
pub const DEFAULT_SM_REQUEST_FREQUENCY: u64 = 5;

/// The maximum number of stanzas kept waiting for acknowledgement. When
/// the buffer grows past this, stream management is disabled for the
/// session and the buffer is cleared rather than exhausting memory.
pub const DEFAULT_SM_MAX_UNACKED: usize = 10_000;

/// Fixed block size for proxied byte-stream transfers.
pub const DEFAULT_TRANSFER_BLOCK_SIZE: usize = 8 * 1_024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// XMPP domain this process is authoritative for.
    pub domain: String,
    /// Cap on a single connection's partial-stanza buffer, in bytes.
    pub max_stanza_buffer_size: usize,
    /// Emit `<r/>` every N unacknowledged sends.
    pub sm_request_frequency: u64,
    /// Unacknowledged-stanza buffer hard limit.
    pub sm_max_unacked: usize,
    /// Skip normalization of the `to` address when the transport layer
    /// has already validated it (connection-multiplexer deployments).
    pub skip_address_validation: bool,
    /// Aggregate byte budget for each cache.
    pub cache_max_bytes: usize,
    /// Maximum entry age before time-based eviction, in seconds.
    pub cache_max_lifetime_secs: u64,
    /// Block size for proxied byte-stream transfers.
    pub transfer_block_size: usize,
    /// Sweep interval for the lock-registry reaper, in seconds.
    pub lock_reaper_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            max_stanza_buffer_size: DEFAULT_MAX_STANZA_BUFFER_SIZE,
            sm_request_frequency: DEFAULT_SM_REQUEST_FREQUENCY,
            sm_max_unacked: DEFAULT_SM_MAX_UNACKED,
            skip_address_validation: false,
            cache_max_bytes: 10 * 1_024 * 1_024,
            cache_max_lifetime_secs: 6 * 60 * 60,
            transfer_block_size: DEFAULT_TRANSFER_BLOCK_SIZE,
            lock_reaper_interval_secs: 60,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn cache_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.cache_max_lifetime_secs)
    }

    pub fn lock_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.lock_reaper_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sm_request_frequency, 5);
        assert_eq!(config.sm_max_unacked, 10_000);
        assert!(!config.skip_address_validation);
    }

    #[test]
    fn test_partial_toml_overrides_defaults() {
        let config = Config::from_toml(
            "domain = \"example.org\"\nsm_request_frequency = 2\n",
        )
        .unwrap();
        assert_eq!(config.domain, "example.org");
        assert_eq!(config.sm_request_frequency, 2);
        // Untouched fields keep their defaults
        assert_eq!(config.sm_max_unacked, DEFAULT_SM_MAX_UNACKED);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::from_toml("domain = [not toml").is_err());
    }
}
