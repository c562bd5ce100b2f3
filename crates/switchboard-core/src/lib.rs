// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The dispatch and translation engine: request/response translators
//! between the client and upstream wire formats, the streaming relay,
//! and the outer retry loop over accounts, endpoints, and the model
//! fallback chain.

pub mod dispatch;
pub mod fallback;
pub mod relay;
pub mod response;
pub mod translate;

pub use dispatch::{
    DispatchError, Dispatcher, EventStream, FrameStream, RequestContext, Upstream,
};
pub use fallback::{is_pinned, resolve_model, FallbackChain};
pub use relay::SseRelay;
pub use response::{translate_response, ResponseOptions};
pub use translate::{translate_request, TranslateOptions};
