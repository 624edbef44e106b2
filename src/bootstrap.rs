//! Identity bootstrap against the VK API.
//!
//! Turning an access token into a realtime channel requires two facts the
//! token alone does not carry: the numeric user id behind it, and the app's
//! iframe entry URL (whose query string holds the channel credentials).
//! Both come from the VK API, and the two lookups are independent, so they
//! run concurrently.

use crate::error::{CoinLinkError, Result};
use serde::Deserialize;
use serde_json::Value;

const VK_API_BASE_URL: &str = "https://api.vk.com/method";
const VK_API_VERSION: &str = "5.131";
/// The coin app's id in the VK app catalog.
const COIN_APP_ID: &str = "6915965";

#[derive(Debug, Deserialize)]
struct VkEnvelope {
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<VkError>,
}

#[derive(Debug, Deserialize)]
struct VkError {
    error_code: i64,
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    id: i64,
}

#[derive(Debug, Default, Deserialize)]
struct AppEntry {
    #[serde(default)]
    mobile_iframe_url: Option<String>,
    #[serde(default)]
    webview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppsResponse {
    #[serde(default)]
    items: Vec<AppEntry>,
}

/// Resolve `(user_id, entry_url)` for an access token, querying the user id
/// and the app entry URL concurrently.
pub async fn resolve_identity(http: &reqwest::Client, token: &str) -> Result<(i64, String)> {
    log::debug!("[BOOTSTRAP] Resolving identity via VK API");
    let (user_id, entry_url) =
        tokio::try_join!(fetch_user_id(http, token), fetch_entry_url(http, token))?;
    log::debug!("[BOOTSTRAP] Resolved user_id={}", user_id);
    Ok((user_id, entry_url))
}

/// Numeric id of the user the token belongs to (`users.get`).
pub async fn fetch_user_id(http: &reqwest::Client, token: &str) -> Result<i64> {
    let response = call_vk_method(http, "users.get", token, &[]).await?;
    let users: Vec<UserEntry> = serde_json::from_value(response)?;
    users
        .first()
        .map(|user| user.id)
        .ok_or_else(|| CoinLinkError::ConfigurationError("users.get returned no users".to_string()))
}

/// Entry URL for the coin app's iframe (`apps.get`), preferring the mobile
/// variant. The channel credentials live in its query string.
pub async fn fetch_entry_url(http: &reqwest::Client, token: &str) -> Result<String> {
    let response = call_vk_method(
        http,
        "apps.get",
        token,
        &[("app_id", COIN_APP_ID), ("platform", "android")],
    )
    .await?;
    let apps: AppsResponse = serde_json::from_value(response)?;
    let entry = apps.items.into_iter().next().unwrap_or_default();

    entry
        .mobile_iframe_url
        .or(entry.webview_url)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            CoinLinkError::ConfigurationError(
                "apps.get returned no iframe URL for the coin app".to_string(),
            )
        })
}

async fn call_vk_method(
    http: &reqwest::Client,
    method: &str,
    token: &str,
    extra: &[(&str, &str)],
) -> Result<Value> {
    let url = format!("{VK_API_BASE_URL}/{method}");
    let mut form: Vec<(&str, &str)> = vec![("access_token", token), ("v", VK_API_VERSION)];
    form.extend_from_slice(extra);

    let response = http.post(&url).form(&form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(CoinLinkError::TransportError {
            status_code: status.as_u16(),
            message,
        });
    }

    let envelope: VkEnvelope = response.json().await?;
    if let Some(error) = envelope.error {
        log::debug!(
            "[BOOTSTRAP] {} rejected: code={} msg={}",
            method,
            error.error_code,
            error.error_msg
        );
        return Err(CoinLinkError::ServiceError {
            code: error.error_code.to_string(),
            message: error.error_msg,
        });
    }

    envelope.response.ok_or_else(|| {
        CoinLinkError::ConfigurationError(format!("{method} returned an empty response"))
    })
}
