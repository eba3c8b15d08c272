//! Model activation: resolve, download, initialize, warm up.
//!
//! ```text
//! NotLoaded ─> Resolving ─> Downloading(p)* ─> Initializing ─> Loaded
//!                  │               │                 │
//!                  └───────────────┴─────────────────┴──> Failed(err)
//! ```
//!
//! A new `load` may start from any phase; the previous model is simply
//! replaced by the caller once the new one is ready.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use hearth_types::{ChatMessage, GenerateError, LoadError, LoadProgress, ModelSpec, Sampling};

use crate::backend::{FragmentSink, InferenceBackend, ProgressSink};
use crate::protocol::WorkerEvent;

const WARM_UP_PROMPT: &str = "a";
const WARM_UP_NOTE: &str = "Compiling shaders and warming up model...";

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderPhase {
    NotLoaded,
    Resolving,
    Downloading(LoadProgress),
    Initializing,
    Loaded,
    Failed(LoadError),
}

impl LoaderPhase {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not_loaded",
            Self::Resolving => "resolving",
            Self::Downloading(_) => "downloading",
            Self::Initializing => "initializing",
            Self::Loaded => "loaded",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct ModelLoader {
    phase: Arc<watch::Sender<LoaderPhase>>,
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLoader {
    #[must_use]
    pub fn new() -> Self {
        let (phase, _) = watch::channel(LoaderPhase::NotLoaded);
        Self {
            phase: Arc::new(phase),
        }
    }

    #[must_use]
    pub fn phase(&self) -> LoaderPhase {
        self.phase.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LoaderPhase> {
        self.phase.subscribe()
    }

    /// Load `spec` and run a one-token warm-up generation.
    ///
    /// Progress and status notes go to `events`. The returned model is fully
    /// initialized; on error the phase is left at `Failed`.
    pub async fn load<B: InferenceBackend>(
        &self,
        backend: &B,
        spec: &ModelSpec,
        events: &mpsc::Sender<WorkerEvent>,
    ) -> Result<B::Model, LoadError> {
        self.phase.send_replace(LoaderPhase::Resolving);
        tracing::info!(model = %spec.id, "Loading model");

        let sink = ProgressSink::new(events.clone(), Arc::clone(&self.phase));

        let result = match backend.load_model(spec, &sink).await {
            Ok(model) => self.warm_up(backend, model, &sink).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => {
                self.phase.send_replace(LoaderPhase::Loaded);
                tracing::info!(model = %spec.id, "Model ready");
            }
            Err(err) => {
                self.phase.send_replace(LoaderPhase::Failed(err.clone()));
                tracing::warn!(model = %spec.id, kind = %err.kind, "Model load failed: {}", err.message);
            }
        }
        result
    }

    async fn warm_up<B: InferenceBackend>(
        &self,
        backend: &B,
        model: B::Model,
        sink: &ProgressSink,
    ) -> Result<B::Model, LoadError> {
        self.phase.send_replace(LoaderPhase::Initializing);
        sink.note(WARM_UP_NOTE).await;

        let messages = vec![ChatMessage::user(WARM_UP_PROMPT)];
        backend
            .generate(
                &model,
                messages,
                Sampling::warm_up(),
                &FragmentSink::discard(),
                CancellationToken::new(),
            )
            .await
            .map_err(|err| match err {
                GenerateError::Unavailable(reason) => LoadError::incompatible(reason),
                err => LoadError::other(format!("warm-up failed: {err}")),
            })?;
        backend.reset_context(&model);
        Ok(model)
    }
}
