//! OAuth2 refresh-grant client
//!
//! The refresh scheduler and the admin force-refresh path both go through
//! `TokenClient::refresh`. The endpoint URL and client id come from
//! configuration (the constants module provides the Anthropic defaults).
//!
//! The token endpoint signals a dead refresh token with HTTP 400 and an
//! `invalid_grant` error body; 401/403 mean the same thing. Both map to
//! `Error::InvalidGrant`, which the pool treats as terminal — no automatic
//! retry, the account needs operator re-authentication.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Response from the token endpoint for the refresh grant.
///
/// `expires_in` is a seconds delta from response time; the caller converts
/// it to an absolute unix-millisecond timestamp before storing. A missing
/// `refresh_token` means the grant was not rotated — keep the old one.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// HTTP client for the OAuth token endpoint.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    endpoint_url: String,
    client_id: String,
    timeout: Duration,
}

impl TokenClient {
    pub fn new(
        http: reqwest::Client,
        endpoint_url: String,
        client_id: String,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            endpoint_url,
            client_id,
            timeout,
        }
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        debug!(token = %common::redact(refresh_token), "requesting refresh grant");

        let response = self
            .http
            .post(&self.endpoint_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Http(format!(
                        "token endpoint timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    Error::Http(format!("token refresh request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            if is_terminal_rejection(status.as_u16(), &body) {
                return Err(Error::InvalidGrant(format!(
                    "token endpoint returned {status}: {body}"
                )));
            }
            return Err(Error::Refresh(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Refresh(format!("invalid refresh response: {e}")))
    }
}

/// Whether a token endpoint failure means the refresh token itself is dead.
///
/// 401/403 are always terminal. 400 is terminal only when the body carries
/// `invalid_grant` or mentions expiry — other 400s (malformed request,
/// endpoint hiccups) stay retryable.
fn is_terminal_rejection(status: u16, body: &str) -> bool {
    match status {
        401 | 403 => true,
        400 => {
            let lower = body.to_lowercase();
            lower.contains("invalid_grant") || lower.contains("expired")
        }
        _ => false,
    }
}
