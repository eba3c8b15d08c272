use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use hearth_cache::BlobCache;
use hearth_types::{Capability, ChatMessage, GenerateError, LoadError, ModelSpec, Sampling};
use hearth_worker::{CancellationToken, FragmentSink, InferenceBackend, ProgressSink};

use crate::chat::{ChatBody, ChatStream};
use crate::download::{Downloader, artifact_url};
use crate::retry::RetryConfig;

const RUNTIME_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Model hub serving `{model_id}/resolve/main/{file}`.
    pub hub_url: Url,
    /// Local runtime exposing `/v1/models` and `/v1/chat/completions`.
    pub runtime_url: Url,
    /// Artifacts to fetch for every model, relative to the repository root.
    pub files: Vec<String>,
    pub retry: RetryConfig,
    pub idle_timeout: Duration,
}

impl BackendConfig {
    #[must_use]
    pub fn new(hub_url: Url, runtime_url: Url, files: Vec<String>) -> Self {
        Self {
            hub_url,
            runtime_url,
            files,
            retry: RetryConfig::default(),
            idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }

    fn runtime_endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let mut base = self.runtime_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path)
    }
}

/// A model whose artifacts are on disk and which the runtime can serve.
#[derive(Debug)]
pub struct LoadedModel {
    id: String,
    artifacts: Vec<PathBuf>,
    /// Whether the next request may reuse the runtime's cached prompt prefix.
    reuse_prefix: AtomicBool,
}

impl LoadedModel {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }
}

/// Inference backend talking HTTP to a model hub and a local runtime.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    config: BackendConfig,
    cache: BlobCache,
    client: reqwest::Client,
}

impl HttpBackend {
    #[must_use]
    pub fn new(config: BackendConfig, cache: BlobCache) -> Self {
        Self::with_client(config, cache, crate::http_client().clone())
    }

    #[must_use]
    pub fn with_client(config: BackendConfig, cache: BlobCache, client: reqwest::Client) -> Self {
        Self {
            config,
            cache,
            client,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// First model the runtime reports serving, or why it could not be asked.
    async fn served_model(&self) -> Result<Option<String>, String> {
        let url = self
            .config
            .runtime_endpoint("v1/models")
            .map_err(|e| format!("invalid runtime url: {e}"))?;
        let response = self
            .client
            .get(url.clone())
            .timeout(RUNTIME_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("runtime unreachable at {url}: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("runtime answered {} at {url}", response.status()));
        }
        Ok(response
            .json::<ModelList>()
            .await
            .ok()
            .and_then(|list| list.data.into_iter().next())
            .map(|entry| entry.id))
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl InferenceBackend for HttpBackend {
    type Model = LoadedModel;

    async fn check_capability(&self) -> Capability {
        match self.served_model().await {
            Ok(served) => {
                let adapter = match served {
                    Some(model) => format!("{} ({model})", self.config.runtime_url),
                    None => self.config.runtime_url.to_string(),
                };
                Capability::Supported { adapter }
            }
            Err(reason) => Capability::Unsupported { reason },
        }
    }

    async fn load_model(
        &self,
        spec: &ModelSpec,
        progress: &ProgressSink,
    ) -> Result<LoadedModel, LoadError> {
        // The runtime may have gone away since the capability check.
        self.served_model().await.map_err(LoadError::incompatible)?;

        let downloader = Downloader {
            client: &self.client,
            cache: &self.cache,
            retry: &self.config.retry,
            idle_timeout: self.config.idle_timeout,
        };
        let mut artifacts = Vec::with_capacity(self.config.files.len());
        for file in &self.config.files {
            let url = artifact_url(&self.config.hub_url, &spec.id, file)?;
            progress.note(format!("Downloading {file}...")).await;
            artifacts.push(downloader.fetch(&url, spec.access_token.as_ref(), progress).await?);
        }
        tracing::info!(model = %spec.id, files = artifacts.len(), "Model artifacts ready");
        Ok(LoadedModel {
            id: spec.id.clone(),
            artifacts,
            reuse_prefix: AtomicBool::new(false),
        })
    }

    async fn generate(
        &self,
        model: &LoadedModel,
        messages: Vec<ChatMessage>,
        sampling: Sampling,
        fragments: &FragmentSink,
        cancel: CancellationToken,
    ) -> Result<String, GenerateError> {
        let url = self
            .config
            .runtime_endpoint("v1/chat/completions")
            .map_err(|e| GenerateError::Failed(format!("invalid runtime url: {e}")))?;
        let reuse_prefix = model.reuse_prefix.swap(true, Ordering::SeqCst);
        let body = ChatBody::new(&model.id, &messages, sampling, reuse_prefix);
        let stream = ChatStream {
            client: &self.client,
            url,
            retry: &self.config.retry,
            idle_timeout: self.config.idle_timeout,
        };
        stream.run(&body, fragments, &cancel).await
    }

    fn reset_context(&self, model: &LoadedModel) {
        model.reuse_prefix.store(false, Ordering::SeqCst);
    }
}
