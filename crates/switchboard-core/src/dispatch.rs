// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The dispatcher: the outer retry loop around account selection,
//! upstream endpoint fallback, error classification, and model
//! fallback.
//!
//! One request flows through: select account → borrow concurrency
//! permit → translate → call upstream (walking the endpoint preference
//! list) → classify the outcome into retry / switch-account / wait /
//! fail → translate the response back.  The permit is RAII so the slot
//! frees on every exit path, including client disconnects mid-stream.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_config::{Config, HeaderMode};
use switchboard_pool::{
    AccountPool, LimitType, Outcome, Permit, QuotaClass, QuotaKey, SelectionContext,
    SelectionPolicy, SessionTracker, SignatureCache, UsageHistory,
};
use switchboard_protocol::claude::{MessagesRequest, MessagesResponse, StreamEvent};
use switchboard_protocol::gemini::{
    Content, GenerateContentResponse, GenerateEnvelope, Part,
};
use switchboard_protocol::model_family::{prefers_streaming_upstream, ModelFamily};
use switchboard_upstream::{
    CodeAssistInfo, ErrorKind, ModelQuota, SseFrame, TokenProvider, UpstreamClient, UpstreamError,
};

use crate::fallback::{is_pinned, resolve_model, FallbackChain};
use crate::relay::SseRelay;
use crate::response::{translate_response, ResponseOptions};
use crate::translate::{translate_request, TranslateOptions};

/// Short backoff for server-wide capacity pressure before retrying the
/// same account.
const CAPACITY_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff between endpoint attempts after a transient server error.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(1);
/// Sleep when accounts exist but none is selectable right now
/// (usually a concurrency-cap collision).
const CONTENTION_BACKOFF: Duration = Duration::from_secs(2);
/// Wait-loop slice; progress is logged per slice.
const WAIT_CHUNK: Duration = Duration::from_secs(10);

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, UpstreamError>> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// The upstream seam.  The production implementation wraps the HTTP
/// client; tests script it.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn hosts(&self) -> Vec<String>;

    async fn generate(
        &self,
        host: &str,
        token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<GenerateContentResponse, UpstreamError>;

    async fn stream_generate(
        &self,
        host: &str,
        token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<FrameStream, UpstreamError>;

    async fn load_code_assist(&self, token: &str) -> Result<CodeAssistInfo, UpstreamError>;

    async fn fetch_available_models(
        &self,
        token: &str,
        project: &str,
    ) -> Result<Vec<ModelQuota>, UpstreamError>;
}

#[async_trait]
impl Upstream for UpstreamClient {
    fn hosts(&self) -> Vec<String> {
        UpstreamClient::hosts(self).to_vec()
    }

    async fn generate(
        &self,
        host: &str,
        token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        UpstreamClient::generate(self, host, token, envelope).await
    }

    async fn stream_generate(
        &self,
        host: &str,
        token: &str,
        envelope: &GenerateEnvelope,
    ) -> Result<FrameStream, UpstreamError> {
        let stream = UpstreamClient::stream_generate(self, host, token, envelope).await?;
        Ok(Box::pin(stream))
    }

    async fn load_code_assist(&self, token: &str) -> Result<CodeAssistInfo, UpstreamError> {
        UpstreamClient::load_code_assist(self, token).await
    }

    async fn fetch_available_models(
        &self,
        token: &str,
        project: &str,
    ) -> Result<Vec<ModelQuota>, UpstreamError> {
        UpstreamClient::fetch_available_models(self, token, project).await
    }
}

// ─── Request context & errors ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub requested_model: String,
    pub resolved_model: String,
    pub session_id: String,
    pub quota_class: QuotaClass,
    pub attempt: u32,
    /// Set once the fallback chain has been walked, to prevent
    /// recursive fallback.
    pub fallback_disabled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Every account is exhausted and the reset is too far away.
    /// Surfaced as 400 (not 429) to stop client-side auto-retry storms.
    #[error("{message}")]
    RateLimited { message: String, retry_in: Duration },
    #[error("{0}")]
    BadRequest(String),
    #[error("permission denied: {0}")]
    Forbidden(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no accounts configured")]
    NoAccounts,
    #[error("retries exhausted across all accounts and endpoints")]
    MaxRetries,
    #[error("internal: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimited { .. } | Self::BadRequest(_) => 400,
            Self::Auth(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NoAccounts | Self::MaxRetries => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Client-facing error type label for SSE error events.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limit_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::Forbidden(_) => "permission_error",
            Self::Auth(_) => "authentication_error",
            Self::NoAccounts | Self::MaxRetries => "overloaded_error",
            Self::Internal(_) => "api_error",
        }
    }
}

fn sse_error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::AuthExpired | ErrorKind::AuthPermanentlyInvalid => "authentication_error",
        ErrorKind::RateLimitedUserQuota
        | ErrorKind::RateLimitedDaily
        | ErrorKind::RateLimitedCapacity => "rate_limit_error",
        ErrorKind::BadRequest => "invalid_request_error",
        ErrorKind::ServerTransient | ErrorKind::NetworkTransient => "overloaded_error",
        ErrorKind::ContentFiltered | ErrorKind::Unknown => "api_error",
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

enum CallMode {
    Unary,
    Stream,
}

enum CallSuccess {
    Unary(GenerateContentResponse),
    Stream { frames: FrameStream, permit: Permit },
}

enum AccountAttempt {
    Success(CallSuccess),
    /// Try another account.  `backoff` asks the outer loop for an
    /// exponential pause first (transient failures); rate-limit and
    /// auth switches go straight to the next account.
    Switch { backoff: bool },
    Fatal(DispatchError),
}

pub struct Dispatcher {
    pub config: Arc<Config>,
    pub pool: Arc<AccountPool>,
    pub sessions: Arc<SessionTracker>,
    pub signatures: Arc<SignatureCache>,
    pub usage: Arc<UsageHistory>,
    pub policy: Arc<dyn SelectionPolicy>,
    pub tokens: Arc<TokenProvider>,
    pub upstream: Arc<dyn Upstream>,
    pub fallback: FallbackChain,
}

impl Dispatcher {
    /// Derive the request context: request id, resolved model, session.
    pub fn begin_context(&self, req: &MessagesRequest) -> RequestContext {
        let first_user_text = req
            .messages
            .iter()
            .find(|m| m.role == switchboard_protocol::claude::Role::User)
            .map(|m| {
                m.blocks()
                    .iter()
                    .filter_map(|b| match b {
                        switchboard_protocol::claude::ContentBlock::Text { text } => {
                            Some(text.clone())
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let session_id = SessionTracker::derive_id(&first_user_text);
        self.sessions.touch(&session_id, req.messages.len() as u32);

        let quota_class = match self.config.gemini_header_mode {
            HeaderMode::Cli => QuotaClass::Cli,
            HeaderMode::Antigravity => QuotaClass::Antigravity,
        };

        RequestContext {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            requested_model: req.model.clone(),
            resolved_model: resolve_model(&self.config, &req.model),
            session_id,
            quota_class,
            attempt: 0,
            fallback_disabled: false,
        }
    }

    /// Non-streaming request.
    pub async fn dispatch_unary(
        self: &Arc<Self>,
        req: &MessagesRequest,
        ctx: &mut RequestContext,
    ) -> Result<MessagesResponse, DispatchError> {
        let success = self.run(req, ctx, CallMode::Unary, None).await?;
        let upstream_response = match success {
            CallSuccess::Unary(resp) => resp,
            CallSuccess::Stream { frames, permit } => {
                // Thinking models are served via the streaming endpoint
                // even for unary clients; aggregate before translating.
                let resp = aggregate_frames(frames).await?;
                drop(permit);
                resp
            }
        };
        let out = translate_response(
            &upstream_response,
            &self.signatures,
            &ResponseOptions {
                message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
                model: ctx.requested_model.clone(),
                session_id: ctx.session_id.clone(),
            },
        );
        self.sessions.record_tokens(
            &ctx.session_id,
            out.usage.input_tokens + out.usage.output_tokens,
        );
        self.signatures.save();
        Ok(out)
    }

    /// Streaming request: acquire an account and open the upstream
    /// stream first (so pre-stream failures keep their HTTP status),
    /// then relay events.
    pub async fn dispatch_stream(
        self: &Arc<Self>,
        req: &MessagesRequest,
        ctx: &mut RequestContext,
        progress: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<EventStream, DispatchError> {
        let success = self.run(req, ctx, CallMode::Stream, progress.as_ref()).await?;
        let CallSuccess::Stream { frames, permit } = success else {
            return Err(DispatchError::Internal("stream dispatch yielded unary result".into()));
        };

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let this = Arc::clone(self);
        let relay = SseRelay::new(
            format!("msg_{}", uuid::Uuid::new_v4().simple()),
            ctx.requested_model.clone(),
            ctx.session_id.clone(),
        );
        let session_id = ctx.session_id.clone();
        tokio::spawn(async move {
            this.drive_relay(frames, relay, tx, session_id).await;
            // Dropping the permit here releases the concurrency slot; a
            // client disconnect aborts `drive_relay` at the next send.
            drop(permit);
        });
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn drive_relay(
        &self,
        mut frames: FrameStream,
        mut relay: SseRelay,
        tx: mpsc::Sender<StreamEvent>,
        session_id: String,
    ) {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(SseFrame::Data(v)) => {
                    for event in relay.on_frame(&v, &self.signatures) {
                        if tx.send(event).await.is_err() {
                            debug!("client disconnected; aborting relay");
                            return;
                        }
                    }
                }
                Ok(SseFrame::Done) => break,
                Err(e) => {
                    warn!(error = %e, "upstream stream failed mid-flight");
                    for event in relay.error(sse_error_label(e.kind()), &e.message()) {
                        let _ = tx.send(event).await;
                    }
                    return;
                }
            }
        }
        for event in relay.finish() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
        let usage = relay.usage();
        self.sessions
            .record_tokens(&session_id, usage.input_tokens + usage.output_tokens);
        self.signatures.save();
    }

    // ── The outer retry loop ──────────────────────────────────────────────────

    async fn run(
        self: &Arc<Self>,
        req: &MessagesRequest,
        ctx: &mut RequestContext,
        mode: CallMode,
        progress: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<CallSuccess, DispatchError> {
        let started = Instant::now();
        let max_wait = Duration::from_millis(self.config.max_wait_before_error_ms);
        let infinite = self.config.infinite_retry_mode;

        loop {
            let key = QuotaKey::new(ctx.resolved_model.clone(), ctx.quota_class);
            let max_attempts = self.config.max_retries.max(self.pool.len() as u32 + 1);
            let mut attempt = 0u32;
            let mut optimistic_reset_done = false;

            while attempt < max_attempts {
                let selection = self.policy.select(
                    &self.pool,
                    &self.sessions,
                    &SelectionContext {
                        key: &key,
                        session_id: Some(&ctx.session_id),
                        max_wait,
                    },
                );

                let Some(email) = selection.account else {
                    if self.pool.is_empty() {
                        return Err(DispatchError::NoAccounts);
                    }
                    if self.pool.all_limited(&key) {
                        let wait = self
                            .pool
                            .min_wait(&key)
                            .unwrap_or(CONTENTION_BACKOFF)
                            .max(Duration::from_millis(100));
                        if wait > max_wait && !infinite {
                            return Err(DispatchError::RateLimited {
                                message: format!(
                                    "all accounts rate-limited for {}; limits reset in {}",
                                    key,
                                    format_duration(wait)
                                ),
                                retry_in: wait,
                            });
                        }
                        self.wait_for_reset(wait, &key, progress).await;
                        self.pool.clear_expired();
                        if self.pool.usable_emails(&key).is_empty() && !optimistic_reset_done {
                            // The recorded reset times are upper bounds
                            // and often wrong; force one fresh probe.
                            self.pool.reset_all_for(&ctx.resolved_model);
                            optimistic_reset_done = true;
                        }
                        continue; // waiting does not consume an attempt
                    }
                    // Accounts exist but none is selectable (likely a
                    // concurrency-cap collision); brief pause and retry.
                    if started.elapsed() > max_wait && !infinite {
                        return Err(DispatchError::MaxRetries);
                    }
                    tokio::time::sleep(CONTENTION_BACKOFF).await;
                    continue; // contention does not consume an attempt
                };

                if !selection.wait.is_zero() {
                    // Degraded-tier throttle from the hybrid policy.
                    tokio::time::sleep(selection.wait).await;
                }

                attempt += 1;
                ctx.attempt = attempt;
                debug!(
                    request = %ctx.request_id,
                    attempt,
                    account = %email,
                    model = %ctx.resolved_model,
                    "dispatching to upstream"
                );

                match self.try_account(&email, req, ctx, &key, &mode).await {
                    AccountAttempt::Success(success) => return Ok(success),
                    AccountAttempt::Fatal(err) => return Err(err),
                    AccountAttempt::Switch { backoff } => {
                        if backoff && attempt < max_attempts {
                            tokio::time::sleep(self.switch_backoff(attempt)).await;
                        }
                        continue;
                    }
                }
            }

            // Attempts exhausted for this model: walk the fallback chain
            // once, with fallback disabled below to prevent recursion.
            if self.config.auto_fallback
                && !ctx.fallback_disabled
                && !is_pinned(&self.config, &ctx.requested_model)
            {
                if let Some(next) = self.fallback.next(&ctx.resolved_model) {
                    warn!(
                        from = %ctx.resolved_model,
                        to = %next,
                        "model exhausted; walking fallback chain"
                    );
                    ctx.resolved_model = next.to_string();
                    ctx.fallback_disabled = true;
                    continue;
                }
            }
            return Err(DispatchError::MaxRetries);
        }
    }

    /// One account: walk the endpoint preference list, classifying each
    /// failure into retry-same / next-endpoint / switch-account / fatal.
    async fn try_account(
        self: &Arc<Self>,
        email: &str,
        req: &MessagesRequest,
        ctx: &RequestContext,
        key: &QuotaKey,
        mode: &CallMode,
    ) -> AccountAttempt {
        let Some(permit) = self.pool.borrow(email) else {
            return AccountAttempt::Switch { backoff: false };
        };

        let Some((credential, mut project_id)) = self.pool.with_account(email, |a| {
            (
                switchboard_upstream::AccountCredential {
                    refresh_token: a.credential.refresh_token.clone(),
                    api_key: a.credential.api_key.clone(),
                },
                a.project_id.clone(),
            )
        }) else {
            return AccountAttempt::Switch { backoff: false };
        };

        let mut token = match self.tokens.bearer_token(email, &credential).await {
            Ok(t) => t,
            Err(UpstreamError::AuthInvalid(reason)) => {
                self.pool.mark_invalid(email, &reason);
                self.policy.record_outcome(email, Outcome::Failure);
                return AccountAttempt::Switch { backoff: false };
            }
            Err(e) => {
                warn!(email, error = %e, "token refresh failed");
                return AccountAttempt::Switch { backoff: true };
            }
        };

        // Project id is derived lazily on first use and cached.
        if project_id.is_none() {
            match self.upstream.load_code_assist(&token).await {
                Ok(info) => {
                    if let Some(project) = &info.project_id {
                        self.pool.set_project_id(email, project);
                    }
                    if let Some(tier) = &info.tier {
                        self.pool.set_subscription_tier(email, parse_tier(tier));
                    }
                    project_id = info.project_id;
                }
                Err(e) => {
                    warn!(email, error = %e, "project discovery failed");
                    return AccountAttempt::Switch { backoff: true };
                }
            }
        }
        let Some(project) = project_id else {
            self.pool
                .mark_invalid(email, "upstream reported no project for this account");
            return AccountAttempt::Switch { backoff: false };
        };

        let envelope = GenerateEnvelope {
            project,
            model: ctx.resolved_model.clone(),
            user_agent: match self.config.gemini_header_mode {
                HeaderMode::Cli => "gemini-cli".into(),
                HeaderMode::Antigravity => "antigravity".into(),
            },
            request_type: "agent".into(),
            request_id: ctx.request_id.clone(),
            request: translate_request(
                req,
                &self.signatures,
                &TranslateOptions {
                    model: ctx.resolved_model.clone(),
                    session_id: ctx.session_id.clone(),
                    max_context_tokens: self.config.max_context_tokens,
                    default_thinking_budget: self.config.default_thinking_budget,
                    default_thinking_level: self
                        .config
                        .default_thinking_level
                        .map(|l| l.as_str().to_string()),
                },
            ),
        };

        let want_stream = matches!(mode, CallMode::Stream)
            || prefers_streaming_upstream(&ctx.resolved_model);

        let mut saw_rate_limit = false;
        let mut saw_other_failure = false;
        let mut min_reset: Option<Duration> = None;
        let mut worst_limit = LimitType::Other;

        for host in self.upstream.hosts() {
            let mut auth_retried = false;
            let mut capacity_retried = false;

            loop {
                enum RawOk {
                    Unary(GenerateContentResponse),
                    Stream(FrameStream),
                }
                let result: Result<RawOk, UpstreamError> = if want_stream {
                    self.upstream
                        .stream_generate(&host, &token, &envelope)
                        .await
                        .map(RawOk::Stream)
                } else {
                    self.upstream
                        .generate(&host, &token, &envelope)
                        .await
                        .map(RawOk::Unary)
                };

                match result {
                    Ok(raw) => {
                        self.pool.record_success(email, key);
                        self.policy.record_outcome(email, Outcome::Success);
                        let family = ModelFamily::of(&ctx.resolved_model);
                        self.usage.record(
                            &format!("{family:?}").to_lowercase(),
                            &ctx.resolved_model,
                        );
                        let success = match raw {
                            RawOk::Unary(resp) => CallSuccess::Unary(resp),
                            RawOk::Stream(frames) => {
                                if matches!(mode, CallMode::Unary) {
                                    // Unary client on the streaming
                                    // endpoint: aggregate here while the
                                    // permit is held.
                                    match aggregate_frames(frames).await {
                                        Ok(resp) => CallSuccess::Unary(resp),
                                        Err(e) => return AccountAttempt::Fatal(e),
                                    }
                                } else {
                                    CallSuccess::Stream { frames, permit }
                                }
                            }
                        };
                        return AccountAttempt::Success(success);
                    }
                    Err(e) => {
                        let kind = e.kind();
                        debug!(email, host = %host, ?kind, "upstream call failed");
                        match kind {
                            ErrorKind::AuthExpired if !auth_retried => {
                                self.tokens.invalidate(email);
                                match self.tokens.bearer_token(email, &credential).await {
                                    Ok(t) => {
                                        token = t;
                                        auth_retried = true;
                                        continue;
                                    }
                                    Err(UpstreamError::AuthInvalid(reason)) => {
                                        self.pool.mark_invalid(email, &reason);
                                        self.policy.record_outcome(email, Outcome::Failure);
                                        return AccountAttempt::Switch { backoff: false };
                                    }
                                    Err(_) => break,
                                }
                            }
                            ErrorKind::AuthExpired => {
                                saw_other_failure = true;
                                break;
                            }
                            ErrorKind::AuthPermanentlyInvalid => {
                                self.pool.mark_invalid(email, &e.message());
                                self.policy.record_outcome(email, Outcome::Failure);
                                return AccountAttempt::Switch { backoff: false };
                            }
                            ErrorKind::RateLimitedCapacity if !capacity_retried => {
                                // Server-wide pressure; not this
                                // account's fault, so no penalty.
                                tokio::time::sleep(CAPACITY_BACKOFF).await;
                                capacity_retried = true;
                                continue;
                            }
                            ErrorKind::RateLimitedCapacity => break,
                            ErrorKind::RateLimitedUserQuota | ErrorKind::RateLimitedDaily => {
                                saw_rate_limit = true;
                                if kind == ErrorKind::RateLimitedDaily {
                                    worst_limit = LimitType::Daily;
                                }
                                min_reset = match (min_reset, e.retry_after()) {
                                    (Some(a), Some(b)) => Some(a.min(b)),
                                    (a, b) => a.or(b),
                                };
                                break;
                            }
                            ErrorKind::ServerTransient => {
                                saw_other_failure = true;
                                tokio::time::sleep(TRANSIENT_BACKOFF).await;
                                break;
                            }
                            ErrorKind::NetworkTransient => {
                                // Connection-level noise; switch
                                // accounts without a health penalty.
                                tokio::time::sleep(TRANSIENT_BACKOFF).await;
                                return AccountAttempt::Switch { backoff: false };
                            }
                            ErrorKind::BadRequest => {
                                let status = match &e {
                                    UpstreamError::Status { status, .. } => *status,
                                    _ => 400,
                                };
                                return AccountAttempt::Fatal(if status == 403 {
                                    DispatchError::Forbidden(e.message())
                                } else {
                                    DispatchError::BadRequest(e.message())
                                });
                            }
                            ErrorKind::ContentFiltered => {
                                // Filtered content arrives as a normal
                                // response, not an HTTP error; treat an
                                // explicit kind conservatively.
                                saw_other_failure = true;
                                break;
                            }
                            ErrorKind::Unknown => {
                                warn!(email, error = %e, "unclassified upstream failure");
                                self.policy.record_outcome(email, Outcome::Failure);
                                tokio::time::sleep(Duration::from_millis(
                                    self.config.retry_max_ms,
                                ))
                                .await;
                                return AccountAttempt::Switch { backoff: false };
                            }
                        }
                    }
                }
            }
        }

        if saw_rate_limit && !saw_other_failure {
            self.pool.mark_rate_limited(email, key, min_reset, worst_limit);
            self.policy.record_outcome(email, Outcome::RateLimited);
            AccountAttempt::Switch { backoff: false }
        } else {
            self.policy.record_outcome(email, Outcome::Failure);
            AccountAttempt::Switch { backoff: true }
        }
    }

    /// Exponential backoff between account switches caused by transient
    /// failures: `retry_base_ms × 2^(attempt-1)`, capped at
    /// `retry_max_ms`.
    fn switch_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_ms.max(1);
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(base.saturating_mul(factor).min(self.config.retry_max_ms))
    }

    /// Refresh quota snapshots for every live account from the upstream
    /// metadata endpoint.  Called from the periodic maintenance task;
    /// failures are logged and skipped, never fatal.
    pub async fn refresh_quota_snapshots(&self) {
        for account in self.pool.accounts() {
            if account.invalid || !account.enabled {
                continue;
            }
            let Some(project) = account.project_id.clone() else { continue };
            let credential = switchboard_upstream::AccountCredential {
                refresh_token: account.credential.refresh_token.clone(),
                api_key: account.credential.api_key.clone(),
            };
            let token = match self.tokens.bearer_token(&account.email, &credential).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(email = %account.email, error = %e, "quota refresh: token unavailable");
                    continue;
                }
            };
            match self.upstream.fetch_available_models(&token, &project).await {
                Ok(quotas) => {
                    for q in quotas {
                        self.pool.update_quota_snapshot(
                            &account.email,
                            &q.model,
                            switchboard_pool::QuotaSnapshot {
                                remaining_fraction: q.remaining_fraction,
                                reset_time: q.reset_time,
                                fetched_at: chrono::Utc::now(),
                            },
                        );
                    }
                }
                Err(e) => {
                    debug!(email = %account.email, error = %e, "quota refresh failed");
                }
            }
        }
    }

    /// Sleep out a rate-limit reset in slices, logging progress and
    /// optionally pinging a streaming client so intermediaries keep the
    /// connection open.
    async fn wait_for_reset(
        &self,
        total: Duration,
        key: &QuotaKey,
        progress: Option<&mpsc::Sender<StreamEvent>>,
    ) {
        // A small buffer past the nominal reset avoids re-hitting the
        // limit by a few milliseconds.
        let total = total + Duration::from_millis(250);
        info!(key = %key, wait = %format_duration(total), "all accounts limited; waiting for reset");
        let mut remaining = total;
        while !remaining.is_zero() {
            let slice = remaining.min(WAIT_CHUNK);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
            if !remaining.is_zero() {
                info!(key = %key, remaining = %format_duration(remaining), "still waiting for rate-limit reset");
                if self.config.wait_progress_updates {
                    if let Some(tx) = progress {
                        let _ = tx.send(StreamEvent::Ping).await;
                    }
                }
            }
        }
    }
}

fn parse_tier(tier: &str) -> switchboard_pool::SubscriptionTier {
    use switchboard_pool::SubscriptionTier;
    match tier {
        "free" => SubscriptionTier::Free,
        "pro" => SubscriptionTier::Pro,
        "ultra" => SubscriptionTier::Ultra,
        _ => SubscriptionTier::Unknown,
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Collapse a finished frame stream into one response: parts are
/// concatenated (merging adjacent text parts of the same kind), the
/// last finish reason and usage win.
async fn aggregate_frames(mut frames: FrameStream) -> Result<GenerateContentResponse, DispatchError> {
    let mut merged = GenerateContentResponse::default();
    let mut parts: Vec<Part> = Vec::new();
    let mut finish = None;
    let mut safety = None;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(SseFrame::Done) => break,
            Ok(SseFrame::Data(v)) => {
                let Ok(resp) = GenerateContentResponse::from_json(v) else { continue };
                if let Some(meta) = resp.usage_metadata {
                    merged.usage_metadata = Some(meta);
                }
                let Some(candidate) = resp.candidates.into_iter().next() else { continue };
                if candidate.finish_reason.is_some() {
                    finish = candidate.finish_reason;
                }
                if candidate.safety_ratings.is_some() {
                    safety = candidate.safety_ratings;
                }
                if let Some(content) = candidate.content {
                    for part in content.parts {
                        merge_part(&mut parts, part);
                    }
                }
            }
            Err(e) => {
                return Err(match e.kind() {
                    ErrorKind::BadRequest => DispatchError::BadRequest(e.message()),
                    _ => DispatchError::Internal(format!("upstream stream failed: {e}")),
                });
            }
        }
    }

    merged.candidates = vec![switchboard_protocol::gemini::Candidate {
        content: Some(Content {
            role: switchboard_protocol::gemini::ContentRole::Model,
            parts,
        }),
        finish_reason: finish,
        safety_ratings: safety,
        grounding_metadata: None,
    }];
    Ok(merged)
}

/// Append `part`, merging consecutive plain-text or reasoning deltas
/// into one part.
fn merge_part(parts: &mut Vec<Part>, part: Part) {
    if let (Some(last), Some(text)) = (parts.last_mut(), part.text.as_deref()) {
        if part.function_call.is_none()
            && last.function_call.is_none()
            && last.thought == part.thought
            && last.inline_data.is_none()
            && part.inline_data.is_none()
        {
            if let Some(existing) = &mut last.text {
                existing.push_str(text);
                if part.thought_signature.is_some() {
                    last.thought_signature = part.thought_signature;
                }
                return;
            }
        }
    }
    parts.push(part);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
