//! Cross-origin policy for inbound upgrades.
//!
//! The gateway exists so that browsers can reach endpoints their origin
//! policy would otherwise block, so the default allowlist is `["*"]`.
//! Deployments may narrow it to glob patterns.

use thiserror::Error;

/// Allowlist entry that admits every origin.
pub const ANY_ORIGIN: &str = "*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginRejection {
    #[error("empty Origin header")]
    Malformed,
    #[error("origin '{origin}' is not allowed")]
    NotAllowed { origin: String },
}

/// `*` matches any run of characters, including none. No other wildcards.
fn glob_match(pattern: &str, value: &str) -> bool {
    let mut pieces = pattern.split('*');
    let head = pieces.next().unwrap_or_default();
    let Some(mut rest) = value.strip_prefix(head) else {
        return false;
    };

    let tail: Vec<&str> = pieces.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };

    for piece in middle {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Decide whether an upgrade carrying `origin_header` may proceed.
///
/// Requests without an `Origin` header (non-browser clients) are admitted.
pub fn validate_origin(
    origin_header: Option<&str>,
    allowlist: &[String],
) -> Result<(), OriginRejection> {
    if allowlist.iter().any(|p| p == ANY_ORIGIN) {
        return Ok(());
    }
    let origin = match origin_header {
        None => return Ok(()),
        Some("") => return Err(OriginRejection::Malformed),
        Some(origin) => origin,
    };

    if allowlist.iter().any(|pattern| glob_match(pattern, origin)) {
        Ok(())
    } else {
        Err(OriginRejection::NotAllowed {
            origin: origin.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wildcard_admits_everything() {
        let any = list(&["*"]);
        assert!(validate_origin(Some("https://app.example.com"), &any).is_ok());
        assert!(validate_origin(Some(""), &any).is_ok());
        assert!(validate_origin(None, &any).is_ok());
    }

    #[test]
    fn missing_origin_is_admitted() {
        assert!(validate_origin(None, &[]).is_ok());
    }

    #[test]
    fn empty_origin_is_malformed_under_a_narrow_list() {
        let narrow = list(&["https://app.example.com"]);
        assert_eq!(
            validate_origin(Some(""), &narrow),
            Err(OriginRejection::Malformed)
        );
    }

    #[test]
    fn narrow_list_filters_origins() {
        let narrow = list(&["https://*.example.com", "http://localhost:*"]);
        assert!(validate_origin(Some("https://app.example.com"), &narrow).is_ok());
        assert!(validate_origin(Some("http://localhost:5173"), &narrow).is_ok());
        assert_eq!(
            validate_origin(Some("https://evil.com"), &narrow),
            Err(OriginRejection::NotAllowed {
                origin: "https://evil.com".into()
            })
        );
    }

    #[test]
    fn glob_semantics() {
        assert!(glob_match("abc", "abc"));
        assert!(!glob_match("abc", "abcd"));
        assert!(glob_match("abc*", "abc"));
        assert!(glob_match("*.com", ".com"));
        assert!(!glob_match("*.com", "example.org"));
        assert!(glob_match("a*c", "aXYZc"));
        assert!(!glob_match("ab*b", "ab"));
        assert!(glob_match("https://*.example.*", "https://app.example.org"));
        assert!(glob_match("*", ""));
    }
}
