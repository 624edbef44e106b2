//! Domain operations layered on the channel's command primitive.
//!
//! Each method formats one correlated command and parses its textual answer
//! into a structured value. Argument validation happens locally, before any
//! network round trip.

use crate::connection::ChannelConnection;
use crate::error::{CoinLinkError, Result};
use crate::models::{GroupInfo, SendReceipt, TopSnapshot, TransferRecord};
use crate::protocol::opcodes;
use std::collections::HashMap;

/// Transfer payloads must fit the service's signed 32-bit-ish window.
pub const PAYLOAD_MIN: i64 = -2_000_000_000;
/// Upper bound of the accepted transfer payload range.
pub const PAYLOAD_MAX: i64 = 2_000_000_000;

impl ChannelConnection {
    /// Send coins to another user over the channel.
    ///
    /// `from_url` marks the transfer as originating from a payment link;
    /// `as_merchant` marks it as a shop transfer and requires a `payload`.
    /// The two modes are mutually exclusive. `payload` is an opaque value
    /// echoed back in history records and must lie within
    /// [`PAYLOAD_MIN`]..=[`PAYLOAD_MAX`]. Violations fail fast with a
    /// validation error, without touching the network.
    pub async fn transfer(
        &self,
        to_id: i64,
        amount: i64,
        from_url: bool,
        payload: Option<i64>,
        as_merchant: Option<bool>,
    ) -> Result<SendReceipt> {
        if from_url && as_merchant == Some(true) {
            return Err(CoinLinkError::ValidationError(
                "a transfer cannot be from a payment link and from a merchant at once"
                    .to_string(),
            ));
        }
        if as_merchant.is_some() && payload.is_none() {
            return Err(CoinLinkError::ValidationError(
                "a payload is required when as_merchant is given".to_string(),
            ));
        }
        if let Some(value) = payload {
            if !(PAYLOAD_MIN..=PAYLOAD_MAX).contains(&value) {
                return Err(CoinLinkError::ValidationError(format!(
                    "payload must be within {}..={}, got {}",
                    PAYLOAD_MIN, PAYLOAD_MAX, value
                )));
            }
        }

        let mut command = format!(
            "{} {} {} {}",
            opcodes::TRANSACTION,
            to_id,
            amount,
            u8::from(from_url)
        );
        if let Some(value) = payload {
            command.push_str(&format!(" {}", value));
        }
        if let Some(merchant) = as_merchant {
            command.push_str(&format!(" {}", u8::from(merchant)));
        }

        let body = self.command(command).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Obtain the merchant key for this session, required by the plain
    /// merchant transport.
    pub async fn get_merchant_key(&self) -> Result<String> {
        let body = self.command(opcodes::NEW_MERCHANT).await?;
        // The answer body is a JSON-quoted string.
        Ok(serde_json::from_str(&body)?)
    }

    /// Balances for the given user ids, in coin thousandths. Users the
    /// service does not know map to `None`.
    pub async fn get_user_scores(&self, user_ids: &[i64]) -> Result<HashMap<i64, Option<i64>>> {
        let body = self
            .command(join_command(opcodes::GET_SCORE, user_ids))
            .await?;
        let raw: HashMap<String, Option<i64>> = serde_json::from_str(&body)?;
        let mut scores = HashMap::with_capacity(raw.len());
        for (id, score) in raw {
            let id = id.parse::<i64>().map_err(|_| {
                CoinLinkError::service(format!("non-numeric user id in score answer: {}", id))
            })?;
            scores.insert(id, score);
        }
        Ok(scores)
    }

    /// Re-sync the recent transaction id list for this user.
    pub async fn sync_history(&self) -> Result<Vec<i64>> {
        let body = self.command(opcodes::SYNC_TX_LIST).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// This user's position in the global ranking.
    pub async fn get_my_place(&self) -> Result<i64> {
        let body = self.command(opcodes::GET_MY_PLACE).await?;
        body.trim().parse::<i64>().map_err(|_| {
            CoinLinkError::service(format!("non-numeric place answer: {}", body))
        })
    }

    /// Full records for the given transaction ids.
    pub async fn get_transactions_by_id(&self, tx_ids: &[i64]) -> Result<Vec<TransferRecord>> {
        let body = self
            .command(join_command(opcodes::GET_TRANSACTIONS, tx_ids))
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Current leaderboard snapshot.
    pub async fn get_top(&self) -> Result<TopSnapshot> {
        let body = self.command(opcodes::TOP).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Details for one group.
    pub async fn get_group_by_id(&self, group_id: i64) -> Result<GroupInfo> {
        let body = self
            .command(format!("{} {}", opcodes::LOAD_GROUP, group_id))
            .await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// `"<opcode> <id> <id> ..."`, or just the opcode when there are no ids.
fn join_command(opcode: &str, ids: &[i64]) -> String {
    let mut command = String::from(opcode);
    for id in ids {
        command.push(' ');
        command.push_str(&id.to_string());
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_handlers::EventHandlers;
    use crate::models::ConnectionOptions;
    use crate::timeouts::CoinLinkTimeouts;

    fn unconnected_channel() -> ChannelConnection {
        ChannelConnection::new(
            ConnectionOptions::default(),
            CoinLinkTimeouts::default(),
            EventHandlers::new(),
        )
    }

    #[test]
    fn test_join_command() {
        assert_eq!(join_command("GS", &[1, 2, 3]), "GS 1 2 3");
        assert_eq!(join_command("SY", &[]), "SY");
    }

    #[tokio::test]
    async fn test_out_of_range_payload_fails_without_network() {
        // The channel was never connected, so any network interaction would
        // surface as a lifecycle error instead of a validation error.
        let channel = unconnected_channel();
        let err = channel
            .transfer(1, 5, false, Some(2_000_000_001), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinLinkError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_merchant_mode_requires_payload() {
        let channel = unconnected_channel();
        let err = channel
            .transfer(1, 5, false, None, Some(true))
            .await
            .unwrap_err();
        assert!(matches!(err, CoinLinkError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_exclusive_transfer_modes_are_rejected() {
        let channel = unconnected_channel();
        let err = channel
            .transfer(1, 5, true, Some(0), Some(true))
            .await
            .unwrap_err();
        assert!(matches!(err, CoinLinkError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_transfer_before_connect_is_a_lifecycle_error() {
        let channel = unconnected_channel();
        let err = channel.transfer(1, 5, false, None, None).await.unwrap_err();
        assert!(matches!(err, CoinLinkError::LifecycleError(_)));
    }
}
