// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Upstream producer surface: the HTTP client for the code-assist
//! service, bearer-token management, and the error taxonomy the
//! dispatcher's retry policy keys off.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::{AccountCredential, TokenProvider};
pub use client::{
    parse_sse_chunk, CodeAssistInfo, HeaderMode, ModelQuota, SseFrame, UpstreamClient,
    DEFAULT_HOSTS,
};
pub use error::{classify_status, is_permanent_auth_failure, ErrorKind, UpstreamError};
