//! Token redaction for diagnostics
//!
//! Access and refresh tokens must never appear verbatim in logs, error
//! messages, or status responses. When an operator needs to correlate a
//! token with an account, `redact` produces a short fingerprint keeping
//! only the first and last few characters.

/// Leading characters kept in a redacted token (enough to show the
/// `sk-ant-oat01-` / `sk-ant-ort01-` prefix family).
const KEEP_PREFIX: usize = 8;

/// Trailing characters kept in a redacted token.
const KEEP_SUFFIX: usize = 4;

/// Redact a token down to `<prefix>…<suffix>`.
///
/// Tokens too short to retain any middle section are fully masked so the
/// output never round-trips back to the original value.
pub fn redact(token: &str) -> String {
    if token.len() <= KEEP_PREFIX + KEEP_SUFFIX {
        return "[REDACTED]".to_string();
    }
    // Token material is ASCII; fall back to full masking if it isn't.
    let (Some(prefix), Some(suffix)) = (
        token.get(..KEEP_PREFIX),
        token.get(token.len() - KEEP_SUFFIX..),
    ) else {
        return "[REDACTED]".to_string();
    };
    format!("{prefix}…{suffix}")
}
