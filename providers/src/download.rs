//! Model artifact downloads through the blob cache.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use url::Url;

use hearth_cache::BlobCache;
use hearth_types::{AccessToken, LoadError, LoadProgress};
use hearth_worker::ProgressSink;

use crate::retry::{self, RetryConfig, RetryOutcome};

/// Resolve `{hub}/{model_id}/resolve/main/{file}`.
pub fn artifact_url(hub: &Url, model_id: &str, file: &str) -> Result<Url, LoadError> {
    let model_id = model_id.trim().trim_matches('/');
    if model_id.is_empty() {
        return Err(LoadError::not_found("model id is empty"));
    }
    let mut base = hub.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(&format!("{model_id}/resolve/main/{file}"))
        .map_err(|e| LoadError::not_found(format!("invalid artifact path {model_id}/{file}: {e}")))
}

/// Map a hub HTTP status to a load failure.
#[must_use]
pub fn classify_status(status: StatusCode, has_token: bool, url: &Url) -> LoadError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN if has_token => {
            LoadError::auth_required(format!("access token was rejected for {url}"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            LoadError::auth_required(format!("{url} requires an access token"))
        }
        StatusCode::NOT_FOUND => LoadError::not_found(format!("{url} does not exist")),
        status if retry::is_retryable_status(status) => {
            LoadError::network(format!("hub answered {status} for {url}"))
        }
        status => LoadError::other(format!("hub answered {status} for {url}")),
    }
}

pub(crate) struct Downloader<'a> {
    pub client: &'a reqwest::Client,
    pub cache: &'a BlobCache,
    pub retry: &'a RetryConfig,
    pub idle_timeout: Duration,
}

impl Downloader<'_> {
    /// Fetch one artifact into the cache and return its local path.
    pub(crate) async fn fetch(
        &self,
        url: &Url,
        token: Option<&AccessToken>,
        progress: &ProgressSink,
    ) -> Result<PathBuf, LoadError> {
        if let Some(meta) = self.cache.meta(url)
            && let Some(path) = self.cache.path_for(url)
        {
            tracing::debug!(%url, "Artifact served from cache");
            progress.emit(LoadProgress::new(meta.size, Some(meta.size))).await;
            return Ok(path);
        }

        let build = || {
            let request = self.client.get(url.clone());
            match token {
                Some(token) => request.bearer_auth(token.expose_secret()),
                None => request,
            }
        };
        let response = match self.retry.send(build).await {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                return Err(classify_status(response.status(), token.is_some(), url));
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(LoadError::network(format!(
                    "failed to reach {url} after {attempts} attempts: {source}"
                )));
            }
        };

        let total = response.content_length();
        let mut writer = self
            .cache
            .writer(url)
            .map_err(|e| LoadError::other(format!("cache write failed: {e}")))?;
        let mut stream = response.bytes_stream();
        let mut loaded = 0u64;

        loop {
            let Ok(next) = tokio::time::timeout(self.idle_timeout, stream.next()).await else {
                return Err(LoadError::network(format!("download of {url} stalled")));
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| LoadError::network(format!("download of {url} failed: {e}")))?;
            writer
                .write_chunk(&chunk)
                .map_err(|e| LoadError::other(format!("cache write failed: {e}")))?;
            loaded += chunk.len() as u64;
            progress.emit(LoadProgress::new(loaded, total)).await;
        }

        if let Some(total) = total
            && loaded != total
        {
            return Err(LoadError::network(format!(
                "download of {url} ended after {loaded} of {total} bytes"
            )));
        }
        writer
            .commit()
            .map_err(|e| LoadError::other(format!("cache write failed: {e}")))
    }
}
