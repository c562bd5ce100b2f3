// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Upstream error taxonomy.
//!
//! Every upstream outcome maps onto one closed [`ErrorKind`]; the
//! dispatcher's retry/switch/wait decisions key off the kind, never off
//! raw status codes or message strings.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bearer token expired or was rejected; refresh and retry.
    AuthExpired,
    /// Credential is beyond recovery (revoked grant etc.); the account
    /// must be re-enrolled.
    AuthPermanentlyInvalid,
    /// Per-user quota exhausted on this account.
    RateLimitedUserQuota,
    /// Daily quota exhausted; resets on a long horizon.
    RateLimitedDaily,
    /// Server-wide capacity pressure; not this account's fault.
    RateLimitedCapacity,
    /// 5xx-class transient server failure.
    ServerTransient,
    /// The request itself is unacceptable; retrying cannot help.
    BadRequest,
    /// Connection-level failure before a response arrived.
    NetworkTransient,
    /// The response was blocked by a safety filter (success path for
    /// the client, surfaced as explanatory text).
    ContentFiltered,
    Unknown,
}

impl ErrorKind {
    pub fn is_rate_limit(self) -> bool {
        matches!(
            self,
            Self::RateLimitedUserQuota | Self::RateLimitedDaily | Self::RateLimitedCapacity
        )
    }

    /// `true` when the account itself should be penalised (capacity
    /// pressure is server-wide and is not).
    pub fn penalises_account(self) -> bool {
        matches!(self, Self::RateLimitedUserQuota | Self::RateLimitedDaily)
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {status}: {message}")]
    Status {
        status: u16,
        kind: ErrorKind,
        message: String,
        /// Reset hint extracted from the payload or headers.
        retry_after: Option<Duration>,
    },
    #[error("network: {0}")]
    Network(String),
    #[error("auth refresh failed: {0}")]
    AuthRefresh(String),
    #[error("account credential permanently invalid: {0}")]
    AuthInvalid(String),
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Status { kind, .. } => *kind,
            Self::Network(_) => ErrorKind::NetworkTransient,
            Self::AuthRefresh(_) => ErrorKind::AuthExpired,
            Self::AuthInvalid(_) => ErrorKind::AuthPermanentlyInvalid,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Substrings in a token-refresh failure that mean the credential is
/// gone for good.  Anything else is treated as transient.
pub const PERMANENT_AUTH_FAILURES: &[&str] = &[
    "invalid_grant",
    "token revoked",
    "invalid_client",
    "credentials are invalid",
    "refresh token has expired",
];

pub fn is_permanent_auth_failure(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    PERMANENT_AUTH_FAILURES.iter().any(|m| lower.contains(m))
}

/// Classify an HTTP error response into an [`UpstreamError::Status`].
///
/// `retry_after_header` comes from the `Retry-After` header when
/// present; the payload's `RetryInfo` detail takes precedence because
/// it is more specific.
pub fn classify_status(
    status: u16,
    body: &str,
    retry_after_header: Option<Duration>,
) -> UpstreamError {
    let payload: Option<Value> = serde_json::from_str(body).ok();
    let message = extract_message(payload.as_ref(), body);
    let retry_after = payload
        .as_ref()
        .and_then(extract_retry_delay)
        .or(retry_after_header);

    let kind = match status {
        401 => ErrorKind::AuthExpired,
        403 => {
            if is_permanent_auth_failure(&message) {
                ErrorKind::AuthPermanentlyInvalid
            } else {
                // Project-permission errors are not retryable either.
                ErrorKind::BadRequest
            }
        }
        429 => classify_rate_limit(&message, body),
        400 | 404 | 405 | 409 | 422 => ErrorKind::BadRequest,
        408 => ErrorKind::NetworkTransient,
        500..=599 => ErrorKind::ServerTransient,
        _ => ErrorKind::Unknown,
    };

    UpstreamError::Status { status, kind, message, retry_after }
}

fn classify_rate_limit(message: &str, body: &str) -> ErrorKind {
    let haystack = format!("{} {}", message.to_ascii_lowercase(), body.to_ascii_lowercase());
    if haystack.contains("per day")
        || haystack.contains("perday")
        || haystack.contains("daily")
    {
        ErrorKind::RateLimitedDaily
    } else if haystack.contains("capacity")
        || haystack.contains("overloaded")
        || haystack.contains("try again later")
    {
        ErrorKind::RateLimitedCapacity
    } else {
        ErrorKind::RateLimitedUserQuota
    }
}

/// Pull the human-readable message out of a
/// `{"error": {"message": ...}}` payload, falling back to the raw body.
fn extract_message(payload: Option<&Value>, body: &str) -> String {
    payload
        .and_then(|v| v["error"]["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "(empty response body)".to_string()
            } else {
                trimmed.chars().take(500).collect()
            }
        })
}

/// Extract `retryDelay` from a google.rpc.RetryInfo error detail
/// (`"retryDelay": "3.5s"` or `"30s"`).
fn extract_retry_delay(payload: &Value) -> Option<Duration> {
    let details = payload["error"]["details"].as_array()?;
    for detail in details {
        if let Some(delay) = detail["retryDelay"].as_str() {
            let secs: f64 = delay.trim_end_matches('s').parse().ok()?;
            return Some(Duration::from_secs_f64(secs));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unauthorized_is_auth_expired() {
        let e = classify_status(401, "", None);
        assert_eq!(e.kind(), ErrorKind::AuthExpired);
    }

    #[test]
    fn forbidden_with_revoked_token_is_permanent() {
        let body = json!({ "error": { "message": "Token revoked by user" } }).to_string();
        let e = classify_status(403, &body, None);
        assert_eq!(e.kind(), ErrorKind::AuthPermanentlyInvalid);
    }

    #[test]
    fn forbidden_without_auth_marker_is_bad_request() {
        let body = json!({ "error": { "message": "Project does not have access" } }).to_string();
        let e = classify_status(403, &body, None);
        assert_eq!(e.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn quota_429_is_user_quota() {
        let body = json!({ "error": { "message": "Quota exceeded for model" } }).to_string();
        let e = classify_status(429, &body, None);
        assert_eq!(e.kind(), ErrorKind::RateLimitedUserQuota);
    }

    #[test]
    fn daily_429_is_daily() {
        let body =
            json!({ "error": { "message": "Quota exceeded: requests per day" } }).to_string();
        let e = classify_status(429, &body, None);
        assert_eq!(e.kind(), ErrorKind::RateLimitedDaily);
    }

    #[test]
    fn capacity_429_is_capacity() {
        let body = json!({ "error": { "message": "Model is overloaded" } }).to_string();
        let e = classify_status(429, &body, None);
        assert_eq!(e.kind(), ErrorKind::RateLimitedCapacity);
        assert!(!e.kind().penalises_account());
    }

    #[test]
    fn retry_delay_extracted_from_details() {
        let body = json!({
            "error": {
                "message": "Quota exceeded",
                "details": [
                    { "@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "30s" }
                ]
            }
        })
        .to_string();
        let e = classify_status(429, &body, None);
        assert_eq!(e.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn header_retry_after_is_fallback() {
        let e = classify_status(429, "{}", Some(Duration::from_secs(12)));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 529] {
            assert_eq!(
                classify_status(status, "", None).kind(),
                ErrorKind::ServerTransient
            );
        }
    }

    #[test]
    fn bad_request_is_fatal() {
        let e = classify_status(400, "{\"error\":{\"message\":\"bad schema\"}}", None);
        assert_eq!(e.kind(), ErrorKind::BadRequest);
        assert_eq!(e.message(), "bad schema");
    }

    #[test]
    fn permanent_failure_markers_match_case_insensitively() {
        assert!(is_permanent_auth_failure("Error: Invalid_Grant returned"));
        assert!(is_permanent_auth_failure("refresh token has expired"));
        assert!(!is_permanent_auth_failure("temporary outage"));
    }

    #[test]
    fn message_falls_back_to_truncated_body() {
        let e = classify_status(500, "plain text failure", None);
        assert_eq!(e.message(), "plain text failure");
    }
}
