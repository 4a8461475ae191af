//! Client-side configuration.

use std::time::Duration;

/// Retry policy handed to the transport. The session supervisor only
/// configures it; the transport enforces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPolicy {
    /// Connection attempts before the transport gives up.
    pub reconnection_attempts: u32,
    /// Backoff before the second attempt; doubled for each further attempt.
    pub reconnection_delay: Duration,
    pub reconnection_delay_max: Duration,
    /// Upper bound for a single connection attempt.
    pub timeout: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            reconnection_attempts: 6,
            reconnection_delay: Duration::from_millis(1000),
            reconnection_delay_max: Duration::from_millis(5000),
            timeout: Duration::from_millis(20_000),
        }
    }
}

impl TransportPolicy {
    /// Delay after failed attempt number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.reconnection_delay
            .saturating_mul(factor)
            .min(self.reconnection_delay_max)
    }
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:9090`.
    pub backend_url: String,
    /// Resolve the channel path and send liveness calls over HTTP. When
    /// false the channel path is the room id and no liveness calls are made.
    pub use_room_api: bool,
    /// Quiet period before buffered file content is emitted.
    pub content_debounce: Duration,
    /// Idle period after which a typing-pause is emitted.
    pub typing_idle: Duration,
    /// Consecutive transport failures before the session gives up.
    pub failure_threshold: u32,
    pub heartbeat_interval: Duration,
    /// How long to wait for the drawing snapshot before committing the
    /// local state as baseline.
    pub bootstrap_timeout: Duration,
    pub root_name: String,
    /// Edits kept for replay while the channel is down.
    pub outbox_capacity: usize,
    pub transport: TransportPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:9090".to_string(),
            use_room_api: true,
            content_debounce: Duration::from_millis(5000),
            typing_idle: Duration::from_millis(1000),
            failure_threshold: 3,
            heartbeat_interval: Duration::from_secs(10 * 60),
            bootstrap_timeout: Duration::from_secs(3),
            root_name: "workspace".to_string(),
            outbox_capacity: 10_000,
            transport: TransportPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Config for a relay reached directly, without the room HTTP API.
    pub fn direct(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            use_room_api: false,
            ..Self::default()
        }
    }

    /// WebSocket URL for the given channel path.
    pub fn channel_url(&self, path: &str) -> String {
        let base = self.backend_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/{}", path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_policy_default() {
        let policy = TransportPolicy::default();
        assert_eq!(policy.reconnection_attempts, 6);
        assert_eq!(policy.reconnection_delay, Duration::from_millis(1000));
        assert_eq!(policy.reconnection_delay_max, Duration::from_millis(5000));
        assert_eq!(policy.timeout, Duration::from_millis(20_000));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = TransportPolicy::default();
        let delays: Vec<u64> = (0..6).map(|a| policy.backoff_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000, 5000]);
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.content_debounce, Duration::from_millis(5000));
        assert_eq!(config.typing_idle, Duration::from_millis(1000));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(600));
        assert!(config.use_room_api);
    }

    #[test]
    fn test_channel_url() {
        let config = SyncConfig::direct("http://localhost:5000/");
        assert_eq!(config.channel_url("room-1"), "ws://localhost:5000/room-1");

        let secure = SyncConfig::direct("https://example.com");
        assert_eq!(secure.channel_url("/abc"), "wss://example.com/abc");

        let raw = SyncConfig::direct("ws://127.0.0.1:9");
        assert_eq!(raw.channel_url("x"), "ws://127.0.0.1:9/x");
    }
}
