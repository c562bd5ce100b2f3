// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP client for the upstream code-assist service.
//!
//! Two operational endpoints per host — `:generateContent` (unary) and
//! `:streamGenerateContent?alt=sse` — plus the metadata endpoints for
//! quota and subscription-tier discovery.  Hosts are tried in
//! preference order by the dispatcher; this client only knows how to
//! talk to one host at a time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use switchboard_protocol::gemini::{GenerateContentResponse, GenerateEnvelope};

use crate::error::{classify_status, UpstreamError};

/// Upstream hosts in preference order.  The daily channel mirrors the
/// stable one and tends to survive stable-channel incidents.
pub const DEFAULT_HOSTS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com",
    "https://daily-cloudcode-pa.googleapis.com",
];

const API_PATH: &str = "v1internal";

/// Which header set to present upstream.  The two sets draw from
/// separate quota buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Cli,
    Antigravity,
}

impl HeaderMode {
    fn user_agent(self) -> &'static str {
        match self {
            Self::Cli => "GeminiCLI/0.8.1 (linux; x64)",
            Self::Antigravity => "antigravity/1.4.0 (linux; x64)",
        }
    }

    fn api_client(self) -> &'static str {
        match self {
            Self::Cli => "gl-node/22.0.0 gemini-cli/0.8.1",
            Self::Antigravity => "gl-node/22.0.0 antigravity/1.4.0",
        }
    }
}

/// One SSE frame from the streaming endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(Value),
    Done,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    hosts: Vec<String>,
    mode: HeaderMode,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(mode: HeaderMode, timeout: Duration) -> Self {
        Self::with_hosts(
            DEFAULT_HOSTS.iter().map(|h| h.to_string()).collect(),
            mode,
            timeout,
        )
    }

    pub fn with_hosts(hosts: Vec<String>, mode: HeaderMode, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), hosts, mode, timeout }
    }

    /// Hosts in preference order.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn request(&self, host: &str, method: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{host}/{API_PATH}:{method}"))
            .bearer_auth(token)
            .header("User-Agent", self.mode.user_agent())
            .header("X-Goog-Api-Client", self.mode.api_client())
            .timeout(self.timeout)
    }

    /// Unary generation call.
    pub async fn generate(
        &self,
        host: &str,
        token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        debug!(host, model = %envelope.model, "upstream generateContent");
        let resp = self
            .request(host, "generateContent", token)
            .json(envelope)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body: Value = resp.json().await?;
        GenerateContentResponse::from_json(body).map_err(|e| UpstreamError::Network(format!(
            "malformed upstream response: {e}"
        )))
    }

    /// Streaming generation call.  Returns a stream of parsed SSE
    /// frames; the relay turns them into client events.
    pub async fn stream_generate(
        &self,
        host: &str,
        token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<impl Stream<Item = Result<SseFrame, UpstreamError>> + Send + Unpin, UpstreamError>
    {
        debug!(host, model = %envelope.model, "upstream streamGenerateContent");
        let resp = self
            .http
            .post(format!("{host}/{API_PATH}:streamGenerateContent?alt=sse"))
            .bearer_auth(token)
            .header("User-Agent", self.mode.user_agent())
            .header("X-Goog-Api-Client", self.mode.api_client())
            .timeout(self.timeout)
            .json(envelope)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        // SSE lines can be split across TCP chunks; carry the remainder
        // forward and only parse complete lines.
        let byte_stream = resp.bytes_stream();
        let frames = byte_stream
            .scan(String::new(), |buf, chunk| {
                let frames = match chunk {
                    Ok(bytes) => parse_sse_chunk(buf, &String::from_utf8_lossy(&bytes))
                        .into_iter()
                        .map(Ok)
                        .collect(),
                    Err(e) => vec![Err(UpstreamError::Network(e.to_string()))],
                };
                futures::future::ready(Some(frames))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(frames))
    }

    // ── Metadata discovery ────────────────────────────────────────────────────

    /// Fetch per-model quota state for the account behind `token`.
    pub async fn fetch_available_models(
        &self,
        token: &str,
        project: &str,
    ) -> Result<Vec<ModelQuota>, UpstreamError> {
        let host = &self.hosts[0];
        let resp = self
            .request(host, "fetchAvailableModels", token)
            .json(&serde_json::json!({ "project": project }))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body: Value = resp.json().await?;
        Ok(parse_model_quotas(&body))
    }

    /// Discover the project id and subscription tier for this account.
    pub async fn load_code_assist(&self, token: &str) -> Result<CodeAssistInfo, UpstreamError> {
        let host = &self.hosts[0];
        let resp = self
            .request(host, "loadCodeAssist", token)
            .json(&serde_json::json!({
                "metadata": { "pluginType": "GEMINI" }
            }))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body: Value = resp.json().await?;
        Ok(parse_code_assist(&body))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), &body, retry_after))
}

/// Append `chunk` to `buf` and drain every complete SSE `data:` line
/// into frames.
pub fn parse_sse_chunk(buf: &mut String, chunk: &str) -> Vec<SseFrame> {
    buf.push_str(chunk);
    let mut frames = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        buf.drain(..=pos);
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data == "[DONE]" {
                frames.push(SseFrame::Done);
            } else if let Ok(v) = serde_json::from_str::<Value>(data) {
                frames.push(SseFrame::Data(v));
            }
        }
    }
    frames
}

// ─── Metadata payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ModelQuota {
    pub model: String,
    pub remaining_fraction: f64,
    pub reset_time: Option<DateTime<Utc>>,
}

/// Parse the `fetchAvailableModels` response:
/// `{"models": [{"name": ..., "quotaInfo": {"remainingFraction": ..., "resetTime": ...}}]}`.
pub fn parse_model_quotas(v: &Value) -> Vec<ModelQuota> {
    let Some(models) = v["models"].as_array() else {
        return Vec::new();
    };
    models
        .iter()
        .filter_map(|m| {
            let model = m["name"]
                .as_str()
                .or_else(|| m["model"].as_str())?
                .rsplit('/')
                .next()?
                .to_string();
            let quota = &m["quotaInfo"];
            let remaining_fraction = quota["remainingFraction"].as_f64().unwrap_or(1.0);
            let reset_time = quota["resetTime"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            Some(ModelQuota { model, remaining_fraction, reset_time })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeAssistInfo {
    pub project_id: Option<String>,
    /// "free" | "pro" | "ultra" when recognised.
    pub tier: Option<String>,
}

/// Parse `loadCodeAssist`: the project id lives in
/// `cloudaicompanionProject`, the tier in `currentTier.id` (with
/// `allowedTiers[].isDefault` as fallback).
pub fn parse_code_assist(v: &Value) -> CodeAssistInfo {
    let project_id = v["cloudaicompanionProject"].as_str().map(str::to_string);
    let tier = v["currentTier"]["id"]
        .as_str()
        .or_else(|| {
            v["allowedTiers"].as_array().and_then(|tiers| {
                tiers
                    .iter()
                    .find(|t| t["isDefault"].as_bool() == Some(true))
                    .and_then(|t| t["id"].as_str())
            })
        })
        .map(normalise_tier);
    CodeAssistInfo { project_id, tier }
}

fn normalise_tier(id: &str) -> String {
    let lower = id.to_ascii_lowercase();
    if lower.contains("ultra") {
        "ultra".into()
    } else if lower.contains("pro") || lower.contains("standard") {
        "pro".into()
    } else if lower.contains("free") || lower.contains("legacy") {
        "free".into()
    } else {
        "unknown".into()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
