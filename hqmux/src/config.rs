//! Session configuration and tunable parameters.

use serde::Deserialize;
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Configuration for a single HTTP-over-QUIC session.
///
/// Defaults balance interoperability and resource use; adjust per
/// deployment. Timeout values are consumed by the embedding's timer wheel,
/// not by the session itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum `on_read_available` callbacks honored per loop turn.
    ///
    /// Prevents read starvation of writes and timers on busy connections;
    /// skipped streams are picked up on the next turn.
    pub max_reads_per_loop: u32,

    /// QPACK dynamic table capacity advertised in SETTINGS (RFC 9204
    /// Section 3.2.3).
    pub qpack_max_table_capacity: u64,

    /// Maximum QPACK blocked streams advertised in SETTINGS (RFC 9204
    /// Section 2.1.4).
    pub qpack_blocked_streams: u64,

    /// Maximum field section size advertised in SETTINGS (RFC 9114
    /// Section 7.2.4.2). Zero means unlimited.
    pub max_field_section_size: u64,

    /// Per-stream receive flow control window to request on new ingress
    /// streams, when set.
    pub receive_stream_window: Option<u64>,

    /// Session idle timeout; owned by the embedding's timer wheel.
    pub idle_timeout: Duration,

    /// Per-transaction timeout; owned by the transaction layer.
    pub transaction_timeout: Duration,

    /// Compare inbound stream ids against the GOAWAY limit with `>=`
    /// instead of the draft's strictly-greater `>`.
    pub goaway_inclusive: bool,

    /// Accept server push streams on upstream HTTP/3 sessions.
    #[serde(default = "default_true")]
    pub enable_push: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reads_per_loop: 16,
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 100,
            max_field_section_size: 64 * 1024,
            receive_stream_window: None,
            idle_timeout: Duration::from_secs(60),
            transaction_timeout: Duration::from_secs(30),
            goaway_inclusive: false,
            enable_push: true,
        }
    }
}

impl SessionConfig {
    /// Configuration for memory-constrained deployments.
    pub fn low_memory() -> Self {
        Self {
            qpack_max_table_capacity: 512,
            qpack_blocked_streams: 10,
            max_field_section_size: 8192,
            receive_stream_window: Some(64 * 1024),
            enable_push: false,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_reads_per_loop == 0 {
            return Err("max_reads_per_loop must be non-zero".into());
        }
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be non-zero".into());
        }
        if self.transaction_timeout.is_zero() {
            return Err("transaction_timeout must be non-zero".into());
        }
        if let Some(window) = self.receive_stream_window {
            if window == 0 {
                return Err("receive_stream_window must be non-zero when set".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::low_memory().validate().is_ok());
    }

    #[test]
    fn zero_read_cap_rejected() {
        let config = SessionConfig {
            max_reads_per_loop: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_receive_window_rejected() {
        let config = SessionConfig {
            receive_stream_window: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
