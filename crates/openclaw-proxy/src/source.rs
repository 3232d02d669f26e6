//! Source identity: which logical client is this request from.
//!
//! Priority order: explicit source headers, then the api key (prefix only,
//! the full credential never becomes an identity string), then the remote
//! address.

use axum::http::HeaderMap;

const SOURCE_HEADERS: &[&str] = &["x-openclaw-source", "x-source"];

/// Characters of an api key that may appear in a source id.
const KEY_PREFIX: usize = 8;

pub fn identify_source(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    for name in SOURCE_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }

    if let Some(key) = bearer_or_api_key(headers) {
        let prefix: String = key.chars().take(KEY_PREFIX).collect();
        return format!("key:{prefix}");
    }

    remote_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The request's credential, from `Authorization: Bearer` or `x-api-key`.
pub fn bearer_or_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Explicit session override, if the client sent one.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn explicit_header_wins() {
        let h = headers(&[
            ("x-openclaw-source", "ci-bot"),
            ("authorization", "Bearer sk-abcdef123456"),
        ]);
        assert_eq!(identify_source(&h, Some("1.2.3.4")), "ci-bot");
    }

    #[test]
    fn api_key_prefix_fallback() {
        let h = headers(&[("authorization", "Bearer sk-abcdef123456")]);
        assert_eq!(identify_source(&h, None), "key:sk-abcde");
    }

    #[test]
    fn x_api_key_also_counts() {
        let h = headers(&[("x-api-key", "k-short")]);
        assert_eq!(identify_source(&h, None), "key:k-short");
    }

    #[test]
    fn remote_addr_last_resort() {
        let h = HeaderMap::new();
        assert_eq!(identify_source(&h, Some("10.0.0.9:1234")), "10.0.0.9:1234");
        assert_eq!(identify_source(&h, None), "unknown");
    }

    #[test]
    fn session_header_roundtrip() {
        let h = headers(&[("x-session-id", "sess-42")]);
        assert_eq!(session_id(&h).as_deref(), Some("sess-42"));
        assert!(session_id(&HeaderMap::new()).is_none());
    }
}
