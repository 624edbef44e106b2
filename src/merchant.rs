//! Merchant REST API client.
//!
//! A thin wrapper over the service's merchant endpoint. Every method posts a
//! JSON body to `merchant/<method>/`, with the merchant id and key merged
//! into the caller's parameters, and unwraps the service's response
//! envelope.

use crate::error::{CoinLinkError, Result};
use crate::models::{SendReceipt, TransferRecord};
use crate::timeouts::CoinLinkTimeouts;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Production merchant endpoint.
pub const MERCHANT_BASE_URL: &str = "https://coin-without-bugs.vkforms.ru/merchant";

/// Response envelope shared by all merchant methods: exactly one of
/// `response` and `error` is populated.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: i64,
    message: String,
}

/// Client for the merchant REST endpoint.
///
/// Cheap to clone; the underlying HTTP client pools connections.
#[derive(Clone)]
pub struct MerchantApi {
    base_url: String,
    http: reqwest::Client,
    merchant_id: i64,
    key: String,
}

impl MerchantApi {
    /// Create a merchant client against the production endpoint.
    pub fn new(merchant_id: i64, key: impl Into<String>, timeouts: &CoinLinkTimeouts) -> Result<Self> {
        Self::with_base_url(MERCHANT_BASE_URL, merchant_id, key, timeouts)
    }

    /// Create a merchant client against a custom endpoint (tests, proxies).
    pub fn with_base_url(
        base_url: impl Into<String>,
        merchant_id: i64,
        key: impl Into<String>,
        timeouts: &CoinLinkTimeouts,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.http_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            merchant_id,
            key: key.into(),
        })
    }

    /// The merchant id this client authenticates as.
    pub fn merchant_id(&self) -> i64 {
        self.merchant_id
    }

    /// Call one merchant method with the given extra parameters, returning
    /// the unwrapped `response` value.
    async fn call(&self, method: &str, mut params: Value) -> Result<Value> {
        let url = format!("{}/{}/", self.base_url, method);
        if let Some(map) = params.as_object_mut() {
            map.insert("merchantId".to_string(), json!(self.merchant_id));
            map.insert("key".to_string(), json!(self.key));
        }

        log::debug!("[MERCHANT] POST {} method={}", url, method);
        let response = self.http.post(&url).json(&params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::debug!("[MERCHANT] {} failed: HTTP {}", method, status);
            return Err(CoinLinkError::TransportError {
                status_code: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope = response.json().await?;
        if let Some(error) = envelope.error {
            log::debug!(
                "[MERCHANT] {} rejected: code={} message={}",
                method,
                error.code,
                error.message
            );
            return Err(CoinLinkError::ServiceError {
                code: error.code.to_string(),
                message: error.message,
            });
        }

        Ok(envelope.response.unwrap_or(Value::Null))
    }

    /// Transfer `amount` thousandths to `to_id`. With `from_shop` the
    /// transfer is marked as coming from the merchant rather than the user.
    pub async fn send_coins(&self, to_id: i64, amount: i64, from_shop: bool) -> Result<SendReceipt> {
        let response = self
            .call(
                "send",
                json!({
                    "toId": to_id,
                    "amount": amount,
                    "markAsMerchant": from_shop,
                }),
            )
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Balances for a batch of users. Users the merchant cannot see map
    /// to `None`.
    pub async fn get_users_balance(&self, user_ids: &[i64]) -> Result<HashMap<i64, Option<i64>>> {
        let response = self.call("score", json!({ "userIds": user_ids })).await?;
        let raw: HashMap<String, Option<i64>> = serde_json::from_value(response)?;

        let mut balances = HashMap::with_capacity(user_ids.len());
        for (id, balance) in raw {
            let id = id.parse::<i64>().map_err(|_| {
                CoinLinkError::ValidationError(format!("non-numeric user id in response: {id}"))
            })?;
            balances.insert(id, balance);
        }
        // Ids the service omitted entirely are still unknown.
        for id in user_ids {
            balances.entry(*id).or_insert(None);
        }
        Ok(balances)
    }

    /// Balance of a single user, if visible to this merchant.
    pub async fn get_user_balance(&self, user_id: i64) -> Result<Option<i64>> {
        let balances = self.get_users_balance(&[user_id]).await?;
        Ok(balances.get(&user_id).copied().flatten())
    }

    /// The merchant's own balance.
    pub async fn get_my_balance(&self) -> Result<Option<i64>> {
        self.get_user_balance(self.merchant_id).await
    }

    /// Transfer history. `tx` selects the listing: `1` for payment-link
    /// transfers, `2` for direct account transfers.
    pub async fn get_transactions(&self, tx: u8) -> Result<Vec<TransferRecord>> {
        if tx != 1 && tx != 2 {
            return Err(CoinLinkError::ValidationError(format!(
                "tx selector must be 1 or 2, got {tx}"
            )));
        }
        let response = self.call("tx", json!({ "tx": [tx] })).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Transfers received through payment links.
    pub async fn get_transactions_from_links(&self) -> Result<Vec<TransferRecord>> {
        self.get_transactions(1).await
    }

    /// Transfers received directly to the account.
    pub async fn get_transactions_from_account(&self) -> Result<Vec<TransferRecord>> {
        self.get_transactions(2).await
    }

    /// Rename the shop shown to paying users.
    pub async fn set_shop_name(&self, name: &str) -> Result<()> {
        self.call("set", json!({ "name": name })).await?;
        Ok(())
    }

    /// Point incoming-transfer notifications at `url`. Returns whether the
    /// callback ended up enabled.
    pub async fn set_callback(&self, url: &str) -> Result<bool> {
        let response = self.call("set", json!({ "callback": url })).await?;
        Ok(response.as_str() == Some("ON"))
    }

    /// Disable incoming-transfer notifications.
    pub async fn remove_callback(&self) -> Result<()> {
        self.call("set", json!({ "callback": Value::Null })).await?;
        Ok(())
    }

    /// Recent callback delivery log lines, most recent last.
    pub async fn callback_logs(&self) -> Result<Vec<String>> {
        let response = self.call("set", json!({ "status": 1 })).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Payment link for this merchant. See [`payment_link`].
    pub fn payment_link(&self, amount: i64, payload: i64, fixed: bool) -> String {
        payment_link(self.merchant_id, amount, payload, fixed)
    }
}

/// Build a payment link: opening it prompts the visitor to transfer
/// `amount` thousandths to `user_id` with the given payload attached. With
/// `fixed` the visitor cannot change the amount.
pub fn payment_link(user_id: i64, amount: i64, payload: i64, fixed: bool) -> String {
    let suffix = if fixed { "" } else { "_1" };
    format!("https://vk.com/coin#x{user_id}_{amount}_{payload}{suffix}")
}

/// Render a raw thousandths amount as a human-readable coin count:
/// space-separated thousands groups and a comma decimal separator. With
/// `fixed` the fractional part is always printed to three places;
/// otherwise trailing zeros are dropped and a whole number prints bare.
pub fn format_coins(coins: i64, fixed: bool) -> String {
    let sign = if coins < 0 { "-" } else { "" };
    let magnitude = coins.unsigned_abs();
    let whole = magnitude / 1_000;
    let frac = (magnitude % 1_000) as u16;

    let mut grouped = String::new();
    let digits = whole.to_string();
    let offset = digits.len() % 3;
    for (i, ch) in digits.chars().enumerate() {
        if i != 0 && i % 3 == offset % 3 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }

    if fixed {
        format!("{sign}{grouped},{frac:03}")
    } else if frac == 0 {
        format!("{sign}{grouped}")
    } else {
        let mut frac_str = format!("{frac:03}");
        while frac_str.ends_with('0') {
            frac_str.pop();
        }
        format!("{sign}{grouped},{frac_str}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_link_fixed_and_free_amount() {
        assert_eq!(
            payment_link(123456, 1000, 42, true),
            "https://vk.com/coin#x123456_1000_42"
        );
        assert_eq!(
            payment_link(123456, 1000, 42, false),
            "https://vk.com/coin#x123456_1000_42_1"
        );
    }

    #[test]
    fn test_format_coins_grouping_and_fraction() {
        assert_eq!(format_coins(1_234_567, false), "1 234,567");
        assert_eq!(format_coins(1_000, false), "1");
        assert_eq!(format_coins(1_500, false), "1,5");
        assert_eq!(format_coins(999, false), "0,999");
        assert_eq!(format_coins(0, false), "0");
        assert_eq!(format_coins(1_234_567_890, false), "1 234 567,89");
    }

    #[test]
    fn test_format_coins_fixed_always_three_places() {
        assert_eq!(format_coins(1_000, true), "1,000");
        assert_eq!(format_coins(1_500, true), "1,500");
        assert_eq!(format_coins(-2_050, true), "-2,050");
    }

    #[tokio::test]
    async fn test_get_transactions_rejects_bad_selector() {
        let timeouts = CoinLinkTimeouts::default();
        let api = MerchantApi::new(1, "key", &timeouts).unwrap();
        let err = api.get_transactions(3).await.unwrap_err();
        assert!(matches!(err, CoinLinkError::ValidationError(_)));
    }
}
