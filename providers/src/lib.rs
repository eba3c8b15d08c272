//! HTTP inference backend.
//!
//! # Architecture
//!
//! [`HttpBackend`] implements [`hearth_worker::InferenceBackend`] on top of two
//! remote services:
//!
//! - a model hub, from which the configured artifacts are downloaded into the
//!   [`hearth_cache::BlobCache`] with byte progress ([`download`])
//! - a local OpenAI-compatible runtime, checked via `/v1/models` and streamed via
//!   `/v1/chat/completions` server-sent events
//!
//! # Error Mapping
//!
//! | Condition | Result |
//! |-----------|--------|
//! | hub 401/403 | `LoadErrorKind::AuthRequired` |
//! | hub 404 | `LoadErrorKind::NotFound` |
//! | transport failure, 408/429/5xx after retries | `LoadErrorKind::Network` |
//! | runtime unreachable at load | `LoadErrorKind::IncompatibleRuntime` |
//! | runtime unreachable or model not served (404) | `GenerateError::Unavailable` |
//! | other runtime error or stalled stream | `GenerateError::Failed` |

mod backend;
mod chat;
pub mod download;
pub mod retry;
mod sse;

use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;

pub use backend::{BackendConfig, DEFAULT_STREAM_IDLE_TIMEOUT, HttpBackend, LoadedModel};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Shared client. Redirects are followed because hubs serve artifacts from a CDN.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!("Failed to build tuned HTTP client: {e}. Falling back to defaults.");
            reqwest::Client::new()
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::limited(10))
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .user_agent(concat!("hearth/", env!("CARGO_PKG_VERSION")))
}

/// Read at most 32 KiB of an error body for diagnostics.
pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
