//! Hardening checks applied before any server-directed URL is fetched and
//! before user-supplied identifiers reach the resolution pipeline.

use url::Url;

/// True when `url` is acceptable as an outbound endpoint: HTTPS anywhere,
/// plaintext HTTP only for loopback hosts (local development and tests).
pub fn is_safe_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };

    match parsed.scheme() {
        "https" => parsed.host_str().is_some(),
        "http" => matches!(
            parsed.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1")
        ),
        _ => false,
    }
}

/// Syntactic handle check: dotted labels of alphanumerics and hyphens, at
/// least two labels, no label starting or ending with a hyphen.
pub fn is_valid_handle(handle: &str) -> bool {
    if handle.len() > 253 || !handle.contains('.') {
        return false;
    }

    handle.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Syntactic DID check: `did:<method>:<identifier>` with a lowercase
/// alphabetic method and a non-empty identifier.
pub fn is_valid_did(did: &str) -> bool {
    let mut parts = did.splitn(3, ':');
    let (Some(prefix), Some(method), Some(ident)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    prefix == "did"
        && !method.is_empty()
        && method.chars().all(|c| c.is_ascii_lowercase())
        && !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '-' | ':'))
}
