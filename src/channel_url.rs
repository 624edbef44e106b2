//! Entry-URL handling for the realtime channel.
//!
//! The service hands out an HTTP(S) entry URL whose query string carries the
//! numeric user id. The realtime channel lives at a sharded WebSocket path
//! derived from that URL.

use crate::error::{CoinLinkError, Result};
use reqwest::Url;

/// Number of channel shards on the service side. The shard for a user is
/// `user_id % CHANNEL_SHARDS`.
pub const CHANNEL_SHARDS: i64 = 32;

/// Convert an HTTP(S) entry URL into the WebSocket channel URL.
///
/// The transform:
/// - rewrites `http` → `ws` and `https` → `wss`
/// - routes to `/channel/<user_id mod 32>/`
/// - keeps the original query string and appends
///   `&ver=1&upd=1&pass=<user_id - 1>`
///
/// Fails if the URL has no query string, no usable scheme, or no numeric
/// `vk_user_id` query parameter.
pub fn format_channel_url(entry_url: &str) -> Result<String> {
    let url = Url::parse(entry_url.trim()).map_err(|e| {
        CoinLinkError::ConfigurationError(format!("invalid entry URL '{}': {}", entry_url, e))
    })?;

    let query = url
        .query()
        .filter(|q| !q.is_empty())
        .ok_or_else(|| {
            CoinLinkError::ConfigurationError("entry URL has no query string".to_string())
        })?;

    let ws_scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(CoinLinkError::ConfigurationError(format!(
                "unsupported entry URL scheme '{}'; expected http(s)",
                other
            )));
        }
    };

    let host = url.host_str().ok_or_else(|| {
        CoinLinkError::ConfigurationError("entry URL must include a host".to_string())
    })?;

    let user_id = user_id_from_query(&url).ok_or_else(|| {
        CoinLinkError::ConfigurationError(
            "entry URL query has no numeric vk_user_id parameter".to_string(),
        )
    })?;

    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    Ok(format!(
        "{}://{}/channel/{}/?{}&ver=1&upd=1&pass={}",
        ws_scheme,
        authority,
        user_id.rem_euclid(CHANNEL_SHARDS),
        query,
        channel_pass(user_id),
    ))
}

/// Extract the numeric user id from an entry URL string.
pub fn user_id_from_entry_url(entry_url: &str) -> Result<i64> {
    let url = Url::parse(entry_url.trim()).map_err(|e| {
        CoinLinkError::ConfigurationError(format!("invalid entry URL '{}': {}", entry_url, e))
    })?;
    user_id_from_query(&url).ok_or_else(|| {
        CoinLinkError::ConfigurationError(
            "entry URL query has no numeric vk_user_id parameter".to_string(),
        )
    })
}

/// Extract the numeric user id from the entry URL query string.
pub fn user_id_from_query(url: &Url) -> Option<i64> {
    url.query_pairs()
        .find(|(k, _)| k == "vk_user_id")
        .and_then(|(_, v)| v.parse::<i64>().ok())
}

/// Handshake token derived from the user id.
fn channel_pass(user_id: i64) -> i64 {
    user_id - 1
}

/// Whether a frame is a structurally valid JSON document.
///
/// The service sends exactly one JSON frame per connection (the init
/// payload); everything else is plain text.
pub fn is_json_payload(text: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_channel_url() {
        let url = format_channel_url(
            "https://coin-without-bugs.vkforms.ru/index.html?vk_user_id=290331922&vk_app_id=1",
        )
        .unwrap();
        // 290331922 % 32 == 18, pass == 290331921
        assert_eq!(
            url,
            "wss://coin-without-bugs.vkforms.ru/channel/18/?vk_user_id=290331922&vk_app_id=1&ver=1&upd=1&pass=290331921"
        );
    }

    #[test]
    fn test_http_maps_to_ws_and_keeps_port() {
        let url =
            format_channel_url("http://localhost:8080/index.html?vk_user_id=33").unwrap();
        assert!(url.starts_with("ws://localhost:8080/channel/1/?vk_user_id=33"));
        assert!(url.ends_with("&ver=1&upd=1&pass=32"));
    }

    #[test]
    fn test_missing_query_is_rejected() {
        let err = format_channel_url("https://example.com/index.html").unwrap_err();
        assert!(matches!(err, CoinLinkError::ConfigurationError(_)));
    }

    #[test]
    fn test_missing_user_id_is_rejected() {
        let err = format_channel_url("https://example.com/?vk_app_id=1").unwrap_err();
        assert!(matches!(err, CoinLinkError::ConfigurationError(_)));
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let err = format_channel_url("ftp://example.com/?vk_user_id=1").unwrap_err();
        assert!(matches!(err, CoinLinkError::ConfigurationError(_)));
    }

    #[test]
    fn test_is_json_payload() {
        assert!(is_json_payload("{\"type\":\"INIT\"}"));
        assert!(is_json_payload("[1,2,3]"));
        assert!(is_json_payload("42"));
        assert!(!is_json_payload("TR 5 290331922 570760228"));
        assert!(!is_json_payload("ALREADY_CONNECTED"));
    }
}
