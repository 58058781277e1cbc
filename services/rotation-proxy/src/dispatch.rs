//! Request dispatcher
//!
//! For each client request: select an account (round-robin, or manually
//! via the `x-account-name` header), stamp its bearer token, forward to
//! upstream, and classify the response. In automatic mode 429/401/5xx
//! trigger failover up to the attempt cap, always to an account not yet
//! tried in this dispatch; manual mode passes the upstream response
//! through unchanged.
//!
//! Streaming: only the initial response status participates in failover.
//! Once a 2xx arrives the body is relayed chunk-by-chunk with an idle-read
//! timeout; a mid-stream failure is surfaced to the client as a truncated
//! stream rather than retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use claude_pool::{Clock, Error as PoolError, Lease, Outcome, Pool, cooldown_from_headers};

use crate::metrics;

/// Request header for manual account selection.
pub const ACCOUNT_NAME_HEADER: &str = "x-account-name";

/// Headers stripped before forwarding (hop-by-hop per RFC 9110 §7.6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum buffered request body size.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared dispatcher state, cloned into each handler invocation.
#[derive(Clone)]
pub struct DispatchState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub pool: Arc<Pool>,
    pub clock: Arc<dyn Clock>,
    /// Failover attempt cap, including the first attempt.
    pub max_attempts: u32,
    /// With rotation disabled, a single attempt and no failover.
    pub rotation_enabled: bool,
    pub total_timeout: Duration,
    pub idle_timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub failovers_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// JSON error body: `{"error":{"type":...,"message":...,"request_id":...}}`.
/// Account names may appear in messages; token material never does.
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Dispatch one client request through the pool.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn dispatch(
    state: &DispatchState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    state.in_flight.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let method_label = request.method().to_string();

    let response = dispatch_inner(state, request, &request_id).await;

    state.in_flight.fetch_sub(1, Ordering::Relaxed);
    if response.status().is_server_error() {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(
        response.status().as_u16(),
        &method_label,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn dispatch_inner(
    state: &DispatchState,
    request: axum::http::Request<Body>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let upstream_url = build_upstream_url(&state.upstream_url, request.uri());

    let manual_name = request
        .headers()
        .get(ACCOUNT_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Forwarded headers: drop hop-by-hop, the selection hint, and any
    // client-supplied authentication — the pool's bearer replaces it.
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || lower == ACCOUNT_NAME_HEADER
            || name == header::AUTHORIZATION
            || lower == "x-api-key"
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("failed to read request body: {e}"),
                request_id,
            );
        }
    };

    match manual_name {
        Some(name) => {
            manual_dispatch(state, &name, method, &upstream_url, &headers, &body, request_id).await
        }
        None => auto_dispatch(state, method, &upstream_url, &headers, &body, request_id).await,
    }
}

/// The outcome of the final (or only) failed attempt, kept for the
/// aggregated client error once the cap is reached.
enum FailureKind {
    RateLimited,
    Auth,
    Transient(String),
}

async fn auto_dispatch(
    state: &DispatchState,
    method: Method,
    upstream_url: &str,
    base_headers: &reqwest::header::HeaderMap,
    body: &Bytes,
    request_id: &str,
) -> Response {
    let attempts = if state.rotation_enabled {
        state.max_attempts
    } else {
        1
    };
    let mut best_hint: Option<Duration> = None;
    let mut last_failure: Option<FailureKind> = None;
    // Accounts already tried in this dispatch. Failover never retries one
    // of these, so the cap is bounded by the number of distinct accounts.
    let mut tried: Vec<String> = Vec::new();

    for attempt in 1..=attempts {
        let lease = match state.pool.acquire_excluding(&tried).await {
            Ok(lease) => lease,
            Err(e) => {
                if last_failure.is_none() {
                    return pool_failure_response(state, e, request_id);
                }
                // Every distinct account has been tried; aggregate below
                break;
            }
        };
        tried.push(lease.name.clone());
        if attempt > 1 {
            state.failovers_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_failover(failover_label(&last_failure));
        }

        match send_upstream(state, &lease, method.clone(), upstream_url, base_headers, body).await {
            Attempt::Success(upstream) => {
                state.pool.report(&lease.name, Outcome::Ok).await;
                return relay_response(upstream, state.idle_timeout, request_id);
            }
            Attempt::ClientError { response } => {
                // Not an account failure; passes through unchanged
                return buffered_into_response(response, request_id);
            }
            Attempt::RateLimited { retry_after, .. } => {
                info!(account = %lease.name, attempt, "upstream rate limited");
                metrics::record_upstream_error("rate_limited");
                state
                    .pool
                    .report(&lease.name, Outcome::RateLimited { retry_after })
                    .await;
                best_hint = match (best_hint, retry_after) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (hint, None) | (None, hint) => hint,
                };
                last_failure = Some(FailureKind::RateLimited);
            }
            Attempt::AuthError { detail, .. } => {
                warn!(account = %lease.name, attempt, error = %detail, "upstream auth failure");
                metrics::record_upstream_error("auth");
                state
                    .pool
                    .report(&lease.name, Outcome::AuthError { detail })
                    .await;
                last_failure = Some(FailureKind::Auth);
            }
            Attempt::ServerError { response } => {
                warn!(account = %lease.name, attempt, status = %response.status, "upstream server error");
                metrics::record_upstream_error("server");
                state.pool.report(&lease.name, Outcome::Transient).await;
                last_failure = Some(FailureKind::Transient(format!(
                    "upstream returned {}",
                    response.status
                )));
            }
            Attempt::NetworkError { detail } => {
                warn!(account = %lease.name, attempt, error = %detail, "upstream network error");
                metrics::record_upstream_error("network");
                state.pool.report(&lease.name, Outcome::Transient).await;
                last_failure = Some(FailureKind::Transient(detail));
            }
        }
    }

    let attempted = tried.len();
    match last_failure {
        Some(FailureKind::RateLimited) => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "upstream_rate_limited",
                &format!("all {attempted} attempts were rate limited"),
                request_id,
            );
            if let Some(hint) = best_hint
                && let Ok(value) = HeaderValue::from_str(&hint.as_secs().max(1).to_string())
            {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        Some(FailureKind::Auth) => error_response(
            StatusCode::BAD_GATEWAY,
            "upstream_auth_error",
            "upstream rejected the proxy's credentials on every attempt",
            request_id,
        ),
        Some(FailureKind::Transient(detail)) => error_response(
            StatusCode::BAD_GATEWAY,
            "upstream_transient",
            &format!("upstream unavailable after {attempted} attempts: {detail}"),
            request_id,
        ),
        // The loop always records a failure before falling through
        None => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            "unexpected retry exhaustion",
            request_id,
        ),
    }
}

/// Manual mode: one attempt against the named account, response passed
/// through as-is. A 429 still marks the account's cooldown (account truth
/// regardless of who selected it); 401/403 is telemetry-only.
async fn manual_dispatch(
    state: &DispatchState,
    name: &str,
    method: Method,
    upstream_url: &str,
    base_headers: &reqwest::header::HeaderMap,
    body: &Bytes,
    request_id: &str,
) -> Response {
    let lease = match state.pool.acquire_named(name).await {
        Ok(lease) => lease,
        Err(PoolError::NoSuchAccount(name)) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "no_such_account",
                &format!("account '{name}' is unknown or disabled"),
                request_id,
            );
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &e.to_string(),
                request_id,
            );
        }
    };
    debug!(account = %lease.name, state = lease.state.label(), "manual account selection");

    match send_upstream(state, &lease, method, upstream_url, base_headers, body).await {
        Attempt::Success(upstream) => {
            state.pool.report(&lease.name, Outcome::Ok).await;
            relay_response(upstream, state.idle_timeout, request_id)
        }
        Attempt::RateLimited {
            retry_after,
            response,
        } => {
            state
                .pool
                .report(&lease.name, Outcome::RateLimited { retry_after })
                .await;
            buffered_into_response(response, request_id)
        }
        Attempt::AuthError { detail, response } => {
            info!(account = %lease.name, error = %detail, "auth failure on manually selected account");
            metrics::record_upstream_error("auth");
            buffered_into_response(response, request_id)
        }
        Attempt::ClientError { response } | Attempt::ServerError { response } => {
            buffered_into_response(response, request_id)
        }
        Attempt::NetworkError { detail } => {
            state.pool.report(&lease.name, Outcome::Transient).await;
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_transient",
                &detail,
                request_id,
            )
        }
    }
}

/// One upstream attempt, classified by the initial response status.
enum Attempt {
    /// 2xx; body not yet consumed so it can stream.
    Success(reqwest::Response),
    RateLimited {
        retry_after: Option<Duration>,
        response: Buffered,
    },
    AuthError {
        detail: String,
        response: Buffered,
    },
    /// Non-retryable 4xx.
    ClientError {
        response: Buffered,
    },
    ServerError {
        response: Buffered,
    },
    NetworkError {
        detail: String,
    },
}

/// A fully-read upstream response for passthrough or inspection.
struct Buffered {
    status: StatusCode,
    headers: reqwest::header::HeaderMap,
    body: Bytes,
}

async fn send_upstream(
    state: &DispatchState,
    lease: &Lease,
    method: Method,
    upstream_url: &str,
    base_headers: &reqwest::header::HeaderMap,
    body: &Bytes,
) -> Attempt {
    let mut headers = base_headers.clone();
    let bearer = match HeaderValue::from_str(&format!("Bearer {}", lease.access_token)) {
        Ok(value) => value,
        Err(_) => {
            return Attempt::NetworkError {
                detail: format!("account '{}' token is not a valid header value", lease.name),
            };
        }
    };
    headers.insert(header::AUTHORIZATION, bearer);

    let send = state
        .client
        .request(method, upstream_url)
        .headers(headers)
        .body(body.clone())
        .send();

    let response = match tokio::time::timeout(state.total_timeout, send).await {
        Err(_) => {
            return Attempt::NetworkError {
                detail: format!(
                    "upstream deadline of {}s exceeded",
                    state.total_timeout.as_secs()
                ),
            };
        }
        Ok(Err(e)) => {
            return Attempt::NetworkError {
                detail: format!("upstream request failed: {e}"),
            };
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if status.is_success() {
        return Attempt::Success(response);
    }

    match status.as_u16() {
        429 => {
            let retry_after = cooldown_from_headers(
                header_str(response.headers(), "retry-after"),
                header_str(response.headers(), "anthropic-ratelimit-unified-reset"),
                state.clock.now_ms(),
            );
            Attempt::RateLimited {
                retry_after,
                response: buffer_response(response, state.total_timeout).await,
            }
        }
        401 | 403 => {
            let response = buffer_response(response, state.total_timeout).await;
            let detail = extract_error_message(&response.body)
                .unwrap_or_else(|| format!("upstream returned {status}"));
            Attempt::AuthError { detail, response }
        }
        500..=599 => Attempt::ServerError {
            response: buffer_response(response, state.total_timeout).await,
        },
        _ => Attempt::ClientError {
            response: buffer_response(response, state.total_timeout).await,
        },
    }
}

/// Read a non-2xx response body for passthrough/inspection. A body that
/// fails to read degrades to empty rather than failing the classification.
async fn buffer_response(response: reqwest::Response, deadline: Duration) -> Buffered {
    let status = response.status();
    let headers = response.headers().clone();
    let body = match tokio::time::timeout(deadline, response.bytes()).await {
        Ok(Ok(bytes)) => bytes,
        _ => Bytes::new(),
    };
    Buffered {
        status,
        headers,
        body,
    }
}

/// Relay a 2xx upstream response, streaming the body through with an
/// idle-read timeout. After the first byte there is no failover: an
/// upstream error or stall mid-stream truncates the client's stream.
/// A disappearing client drops the channel, which cancels the upstream
/// read; the account's success report has already landed by then.
fn relay_response(upstream: reqwest::Response, idle_timeout: Duration, request_id: &str) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        loop {
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("idle timeout of {}s on upstream stream", idle_timeout.as_secs()),
                        )))
                        .await;
                    break;
                }
            }
        }
    });

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build relay response");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Turn a buffered upstream response into the client response, verbatim
/// except for hop-by-hop headers.
fn buffered_into_response(buffered: Buffered, request_id: &str) -> Response {
    let mut builder = Response::builder().status(buffered.status);
    for (name, value) in &buffered.headers {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(buffered.body))
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build passthrough response");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Map a pool acquisition failure onto the client response: 429 with a
/// Retry-After when accounts are merely cooling down, 503 otherwise
/// (empty pool, auth errors, disabled), 400 for a bad manual name.
fn pool_failure_response(state: &DispatchState, error: PoolError, request_id: &str) -> Response {
    match error {
        PoolError::NoAccountAvailable {
            counts,
            soonest_ready_ms,
        } => {
            let (status, message) = if counts.rate_limited > 0 {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    format!("all accounts are rate limited ({counts})"),
                )
            } else {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("no accounts available ({counts})"),
                )
            };
            let mut response =
                error_response(status, "no_account_available", &message, request_id);
            if let Some(ready_ms) = soonest_ready_ms {
                let secs = ready_ms
                    .saturating_sub(state.clock.now_ms())
                    .div_ceil(1000)
                    .max(1);
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            response
        }
        PoolError::NoSuchAccount(name) => error_response(
            StatusCode::BAD_REQUEST,
            "no_such_account",
            &format!("account '{name}' is unknown or disabled"),
            request_id,
        ),
    }
}

fn failover_label(last: &Option<FailureKind>) -> &'static str {
    match last {
        Some(FailureKind::RateLimited) => "rate_limited",
        Some(FailureKind::Auth) => "auth",
        Some(FailureKind::Transient(_)) => "transient",
        None => "unknown",
    }
}

/// Extract `error.message` from an upstream JSON error body.
fn extract_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a reqwest::header::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build the upstream URL from the configured base plus the request's
/// path and query.
fn build_upstream_url(upstream_url: &str, uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(pq) => format!("{}{}", upstream_url.trim_end_matches('/'), pq),
        None => upstream_url.to_string(),
    }
}

/// Whether a header is hop-by-hop and must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}
