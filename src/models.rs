//! Data models for the coin-link client library.
//!
//! Defines the structures exchanged with the service over both transports:
//! the channel init payload, transfer receipts, history records, and the
//! connection-level options.

use serde::{Deserialize, Serialize};

/// Initialization payload sent by the service once per channel connection.
///
/// The service is liberal about which fields it includes; everything here
/// defaults so partial payloads still decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitPayload {
    /// Current balance, in coin thousandths.
    pub score: i64,
    /// Position in the global ranking.
    pub place: i64,
    pub random_id: i64,
    /// Proof-of-work challenge string (unused by this client).
    pub pow: String,
    /// Recent transaction ids.
    pub tx: Vec<i64>,
    pub top: Option<TopSnapshot>,
    pub tick: i64,
    pub ccp: i64,
    pub first_time: bool,
    pub ttl: i64,
    pub has_gift: bool,
}

/// Leaderboard snapshot embedded in the init payload and returned by the
/// top query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TopSnapshot {
    pub user_top: Vec<TopUser>,
    pub group_top: Vec<TopGroup>,
    pub online: i64,
    pub tx_sum: Vec<i64>,
    pub total: Vec<i64>,
}

/// One user entry in the leaderboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopUser {
    pub id: i64,
    pub score: i64,
    pub first_name: String,
    pub last_name: String,
    pub photo_200: String,
    pub link: String,
}

/// One group entry in the leaderboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopGroup {
    pub id: i64,
    pub score: i64,
    pub name: String,
    pub screen_name: String,
    pub photo_200: String,
    pub link: String,
}

/// Group details returned by the group query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupInfo {
    pub id: i64,
    pub name: String,
    pub screen_name: String,
    pub is_closed: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub photo_200: String,
}

/// Receipt for a completed transfer, via either transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendReceipt {
    /// Transaction id.
    pub id: i64,
    /// Amount actually transferred, in coin thousandths.
    pub amount: i64,
    /// The sender's balance after the transfer.
    pub current: i64,
}

/// One record in the transfer history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferRecord {
    pub id: i64,
    pub from_id: i64,
    pub to_id: i64,
    /// The service reports amounts as decimal strings in history listings.
    pub amount: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub payload: i64,
    pub external_id: i64,
    pub created_at: i64,
}

/// Connection-level options for the realtime channel.
///
/// Reconnection is enabled the moment the transport first opens. The retry
/// cadence is configurable: `reconnect_delay_ms = 0` reconnects immediately
/// on every unexpected close, a non-zero value applies exponential backoff
/// up to `max_reconnect_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Reconnect automatically after an unexpected close.
    /// Default: true.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Base delay between reconnection attempts, in milliseconds.
    /// Zero means immediate retry. Default: 1000.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Cap for the exponential backoff delay. Default: 30000.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Give up after this many consecutive failed attempts.
    /// Default: None (retry forever).
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the base reconnection delay in milliseconds (0 = immediate).
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the backoff delay cap in milliseconds.
    pub fn with_max_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = delay_ms;
        self
    }

    /// Limit the number of consecutive reconnection attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Delay before the given (zero-based) reconnection attempt.
    pub(crate) fn reconnect_delay(&self, attempt: u32) -> std::time::Duration {
        let ms = self
            .reconnect_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_reconnect_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_init_payload_tolerates_partial_json() {
        let payload: InitPayload =
            serde_json::from_str(r#"{"type":"INIT","score":1234,"place":7}"#).unwrap();
        assert_eq!(payload.score, 1234);
        assert_eq!(payload.place, 7);
        assert!(payload.tx.is_empty());
        assert!(payload.top.is_none());
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let options = ConnectionOptions::new()
            .with_reconnect_delay_ms(1000)
            .with_max_reconnect_delay_ms(8000);
        assert_eq!(options.reconnect_delay(0), Duration::from_millis(1000));
        assert_eq!(options.reconnect_delay(2), Duration::from_millis(4000));
        assert_eq!(options.reconnect_delay(10), Duration::from_millis(8000));
    }

    #[test]
    fn test_zero_delay_means_immediate_retry() {
        let options = ConnectionOptions::new().with_reconnect_delay_ms(0);
        assert_eq!(options.reconnect_delay(5), Duration::ZERO);
    }
}
