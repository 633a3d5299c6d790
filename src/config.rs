//! Receiver configuration
//!
//! All sections deserialize from the embedder's config file (TOML, JSON,
//! whatever the outer process uses; loading is not this crate's job) and
//! every field carries a default, so an empty table is a valid configuration.
//!
//! ```toml
//! [udp]
//! port = 8001
//!
//! [jitter]
//! target_ms = 100
//! min_ms = 50
//! max_ms = 300
//! adaptive = true
//!
//! [session]
//! timeout_ms = 300000
//! cleanup_interval_ms = 30000
//!
//! [memory]
//! per_session_bytes = 52428800
//! total_bytes = 524288000
//!
//! [subtitles]
//! default_duration_ms = 5000
//! ```

use serde::Deserialize;

/// Top-level receiver configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub udp: UdpConfig,
    pub jitter: JitterConfig,
    pub session: SessionConfig,
    pub memory: MemoryConfig,
    pub subtitles: SubtitleConfig,
}

/// Data-plane socket settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Bound port for the data plane. Port 0 binds an ephemeral port,
    /// which tests and SESSION_READY advertisement rely on.
    pub port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { port: 8001 }
    }
}

/// Jitter buffer hold times, in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Base hold applied above each chunk's deadline.
    pub target_ms: u64,
    /// Lower clamp for the adaptive hold.
    pub min_ms: u64,
    /// Upper clamp for the adaptive hold.
    pub max_ms: u64,
    /// When false, `target_ms` never adapts to observed under/overruns.
    pub adaptive: bool,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_ms: 100,
            min_ms: 50,
            max_ms: 300,
            adaptive: true,
        }
    }
}

/// Session lifecycle timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// An active session with no packets for this long is reaped.
    pub timeout_ms: u64,
    /// Cadence of the idle-session sweep.
    pub cleanup_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

/// Payload memory caps. When exceeded, new inserts are refused and counted
/// as memory pressure; nothing already buffered is evicted for this reason.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub per_session_bytes: usize,
    pub total_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            per_session_bytes: 50 * 1024 * 1024,
            total_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Subtitle scheduling settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubtitleConfig {
    /// Hide deadline applied when a record carries no end time
    /// (or an end time at/before its start time).
    pub default_duration_ms: u64,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReceiverConfig::default();
        assert_eq!(cfg.udp.port, 8001);
        assert_eq!(cfg.jitter.target_ms, 100);
        assert_eq!(cfg.jitter.min_ms, 50);
        assert_eq!(cfg.jitter.max_ms, 300);
        assert!(cfg.jitter.adaptive);
        assert_eq!(cfg.session.timeout_ms, 300_000);
        assert_eq!(cfg.memory.per_session_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.subtitles.default_duration_ms, 5_000);
    }

    #[test]
    fn test_partial_deserialization() {
        let cfg: ReceiverConfig =
            serde_json::from_str(r#"{"udp": {"port": 9100}, "jitter": {"target_ms": 80}}"#)
                .unwrap();
        assert_eq!(cfg.udp.port, 9100);
        assert_eq!(cfg.jitter.target_ms, 80);
        // Untouched sections keep their defaults
        assert_eq!(cfg.jitter.max_ms, 300);
        assert_eq!(cfg.session.cleanup_interval_ms, 30_000);
    }
}
