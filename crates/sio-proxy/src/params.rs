//! Connection parameters carried on the inbound handshake query string.

use serde::Deserialize;

use crate::error::ProxyError;
use crate::protocol::normalize_namespace;

pub const TARGET_URL_PARAM: &str = "targetUrl";
pub const NAMESPACE_PARAM: &str = "namespace";
pub const HEADERS_PARAM: &str = "headers";

/// Headers to present to the target, in first-seen order.
///
/// Keys compare ASCII case-insensitively, like HTTP header names. A key that
/// appears more than once keeps its first position and spelling, and its
/// last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedHeaderSet {
    entries: Vec<(String, String)>,
}

impl ForwardedHeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for ForwardedHeaderSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

#[derive(Deserialize)]
struct HeaderPair {
    key: String,
    value: String,
}

/// Parse the `headers` payload: a JSON array of `{ "key", "value" }` objects.
pub fn parse_headers(raw: &str) -> Result<ForwardedHeaderSet, ProxyError> {
    let pairs: Vec<HeaderPair> =
        serde_json::from_str(raw).map_err(|e| ProxyError::HeaderParse(e.to_string()))?;
    Ok(pairs.into_iter().map(|p| (p.key, p.value)).collect())
}

/// The three raw handshake values, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawParams {
    pub target_url: Option<String>,
    pub namespace: Option<String>,
    pub headers: Option<String>,
}

impl RawParams {
    /// Pick the proxy parameters out of a URL query string. Unrelated keys
    /// (`EIO`, `transport`, ...) are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut raw = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                TARGET_URL_PARAM => raw.target_url = Some(value.into_owned()),
                NAMESPACE_PARAM => raw.namespace = Some(value.into_owned()),
                HEADERS_PARAM => raw.headers = Some(value.into_owned()),
                _ => {}
            }
        }
        raw
    }
}

/// Validated parameters for one proxy session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub target_url: String,
    pub namespace: String,
    pub headers: ForwardedHeaderSet,
}

impl ConnectParams {
    pub fn parse(raw: &RawParams) -> Result<Self, ProxyError> {
        let target_url = required(raw.target_url.as_deref(), TARGET_URL_PARAM)?;
        let namespace = required(raw.namespace.as_deref(), NAMESPACE_PARAM)?;

        let headers = match raw.headers.as_deref().map(str::trim) {
            None | Some("") => ForwardedHeaderSet::new(),
            Some(payload) => parse_headers(payload)?,
        };

        Ok(Self {
            target_url: target_url.to_string(),
            namespace: normalize_namespace(namespace),
            headers,
        })
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, ProxyError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProxyError::InvalidParameters(format!(
            "missing required query parameter '{name}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(target: Option<&str>, namespace: Option<&str>, headers: Option<&str>) -> RawParams {
        RawParams {
            target_url: target.map(str::to_string),
            namespace: namespace.map(str::to_string),
            headers: headers.map(str::to_string),
        }
    }

    #[test]
    fn parses_full_handshake() {
        let params = ConnectParams::parse(&raw(
            Some("wss://echo.example.com"),
            Some("/chat"),
            Some(r#"[{"key":"Authorization","value":"Bearer abc"}]"#),
        ))
        .unwrap();
        assert_eq!(params.target_url, "wss://echo.example.com");
        assert_eq!(params.namespace, "/chat");
        assert_eq!(params.headers.len(), 1);
        assert_eq!(params.headers.get("Authorization"), Some("Bearer abc"));
    }

    #[test]
    fn missing_or_empty_required_params_are_rejected() {
        for case in [
            raw(None, Some("/chat"), None),
            raw(Some(""), Some("/chat"), None),
            raw(Some("  "), Some("/chat"), None),
            raw(Some("ws://x"), None, None),
            raw(Some("ws://x"), Some(""), None),
        ] {
            let err = ConnectParams::parse(&case).unwrap_err();
            assert!(matches!(err, ProxyError::InvalidParameters(_)), "{case:?}");
        }
    }

    #[test]
    fn absent_headers_mean_empty_set() {
        let params = ConnectParams::parse(&raw(Some("ws://x"), Some("/"), None)).unwrap();
        assert!(params.headers.is_empty());
        let params = ConnectParams::parse(&raw(Some("ws://x"), Some("/"), Some(""))).unwrap();
        assert!(params.headers.is_empty());
    }

    #[test]
    fn malformed_headers_fail_with_header_parse() {
        for payload in ["not-json", r#"{"key":"a","value":"b"}"#, r#"[{"key":"a"}]"#, "[1,2]"] {
            let err = ConnectParams::parse(&raw(Some("ws://x"), Some("/"), Some(payload)))
                .unwrap_err();
            assert!(matches!(err, ProxyError::HeaderParse(_)), "{payload}");
        }
    }

    #[test]
    fn unique_headers_round_trip_unmodified() {
        let set = parse_headers(
            r#"[{"key":"X-One","value":" spaced "},{"key":"x-two","value":"ünï"},{"key":"Cookie","value":"a=b; c=d"}]"#,
        )
        .unwrap();
        let pairs: Vec<(&str, &str)> = set.iter().collect();
        assert_eq!(
            pairs,
            vec![("X-One", " spaced "), ("x-two", "ünï"), ("Cookie", "a=b; c=d")]
        );
    }

    #[test]
    fn duplicate_header_keys_last_value_wins() {
        let set = parse_headers(r#"[{"key":"X","value":"1"},{"key":"Y","value":"y"},{"key":"X","value":"2"}]"#)
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("X"), Some("2"));
        assert_eq!(set.iter().next(), Some(("X", "2")));
    }

    #[test]
    fn header_keys_differing_only_in_case_collapse() {
        let set = parse_headers(
            r#"[{"key":"Authorization","value":"old"},{"key":"authorization","value":"new"}]"#,
        )
        .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("AUTHORIZATION"), Some("new"));
        assert_eq!(set.iter().next(), Some(("Authorization", "new")));
    }

    #[test]
    fn namespace_without_slash_is_normalised() {
        let params = ConnectParams::parse(&raw(Some("ws://x"), Some("chat"), None)).unwrap();
        assert_eq!(params.namespace, "/chat");
    }

    #[test]
    fn reads_params_from_query_string() {
        let query = "EIO=4&transport=websocket&targetUrl=wss%3A%2F%2Fecho.example.com\
                     &namespace=%2Fchat&headers=%5B%7B%22key%22%3A%22A%22%2C%22value%22%3A%22b%22%7D%5D";
        let raw = RawParams::from_query(query);
        assert_eq!(raw.target_url.as_deref(), Some("wss://echo.example.com"));
        assert_eq!(raw.namespace.as_deref(), Some("/chat"));
        assert_eq!(raw.headers.as_deref(), Some(r#"[{"key":"A","value":"b"}]"#));

        assert_eq!(RawParams::from_query(""), RawParams::default());
    }
}
