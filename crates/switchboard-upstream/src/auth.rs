// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer-token management for pool accounts.
//!
//! Each account carries either a raw API key (used as-is) or a
//! long-lived OAuth refresh token that is exchanged for short-lived
//! bearer tokens.  Tokens are cached per account and refreshed a little
//! before expiry.  Specific refresh-failure reasons permanently
//! invalidate the account; everything else is treated as transient.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{is_permanent_auth_failure, UpstreamError};

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
/// Public installed-app client credentials for the CLI OAuth flow.
const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";
/// Refresh this long before the reported expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_SKEW < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Credential material as the pool stores it; mirrored here to avoid a
/// crate cycle.
#[derive(Debug, Clone, Default)]
pub struct AccountCredential {
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
}

pub struct TokenProvider {
    http: reqwest::Client,
    token_endpoint: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoint(http, TOKEN_ENDPOINT.to_string())
    }

    pub fn with_endpoint(http: reqwest::Client, token_endpoint: String) -> Self {
        Self { http, token_endpoint, cache: Mutex::new(HashMap::new()) }
    }

    /// A bearer token for `email`, refreshed from the long-lived
    /// credential when the cached one is stale.
    ///
    /// Returns [`UpstreamError::AuthInvalid`] when the refresh failure
    /// indicates a revoked or malformed credential.
    pub async fn bearer_token(
        &self,
        email: &str,
        credential: &AccountCredential,
    ) -> Result<String, UpstreamError> {
        if let Some(key) = &credential.api_key {
            return Ok(key.clone());
        }

        let now = Instant::now();
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(email) {
                if cached.is_fresh(now) {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let refresh_token = credential.refresh_token.as_deref().ok_or_else(|| {
            UpstreamError::AuthInvalid("account has no refresh token or API key".into())
        })?;

        debug!(email, "refreshing upstream bearer token");
        let resp = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
            ])
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            if is_permanent_auth_failure(&body) {
                warn!(email, "refresh token permanently invalid");
                return Err(UpstreamError::AuthInvalid(body));
            }
            return Err(UpstreamError::AuthRefresh(format!("{status}: {body}")));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::AuthRefresh(format!("malformed token response: {e}")))?;

        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: now + Duration::from_secs(token.expires_in),
        };
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(email.to_string(), cached);
        Ok(token.access_token)
    }

    /// Drop the cached token for `email` so the next call re-refreshes.
    /// Used after a 401 from the upstream.
    pub fn invalidate(&self, email: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(email);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_token_freshness_honours_skew() {
        let now = Instant::now();
        let fresh = CachedToken {
            access_token: "t".into(),
            expires_at: now + Duration::from_secs(300),
        };
        assert!(fresh.is_fresh(now));

        let nearly_expired = CachedToken {
            access_token: "t".into(),
            expires_at: now + Duration::from_secs(30),
        };
        // Within the 60s skew window: refresh early.
        assert!(!nearly_expired.is_fresh(now));
    }

    #[tokio::test]
    async fn api_key_bypasses_refresh() {
        let p = TokenProvider::new(reqwest::Client::new());
        let cred = AccountCredential {
            refresh_token: None,
            api_key: Some("sk-key".into()),
        };
        let token = p.bearer_token("a@x", &cred).await.unwrap();
        assert_eq!(token, "sk-key");
    }

    #[tokio::test]
    async fn missing_credential_is_permanently_invalid() {
        let p = TokenProvider::new(reqwest::Client::new());
        let err = p
            .bearer_token("a@x", &AccountCredential::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::AuthInvalid(_)));
    }

    #[test]
    fn invalidate_clears_cache_entry() {
        let p = TokenProvider::new(reqwest::Client::new());
        p.cache.lock().unwrap().insert(
            "a@x".into(),
            CachedToken {
                access_token: "t".into(),
                expires_at: Instant::now() + Duration::from_secs(600),
            },
        );
        p.invalidate("a@x");
        assert!(p.cache.lock().unwrap().is_empty());
    }
}
