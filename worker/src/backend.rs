use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use hearth_types::{
    Capability, ChatMessage, GenerateError, GenerationId, LoadError, LoadProgress, ModelSpec,
    Sampling,
};

use crate::loader::LoaderPhase;
use crate::protocol::WorkerEvent;

/// An execution backend able to host one model at a time.
///
/// Implementations own all heavy resources. The worker serializes loads and
/// allows at most one `generate` in flight; `generate` must return promptly
/// after `cancel` fires, with whatever text it produced so far.
pub trait InferenceBackend: Send + Sync + 'static {
    type Model: Send + Sync + 'static;

    fn check_capability(&self) -> impl Future<Output = Capability> + Send;

    fn load_model(
        &self,
        spec: &ModelSpec,
        progress: &ProgressSink,
    ) -> impl Future<Output = Result<Self::Model, LoadError>> + Send;

    fn generate(
        &self,
        model: &Self::Model,
        messages: Vec<ChatMessage>,
        sampling: Sampling,
        fragments: &FragmentSink,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<String, GenerateError>> + Send;

    /// Drop any decode state retained between generations.
    fn reset_context(&self, model: &Self::Model);
}

/// Receives download progress from [`InferenceBackend::load_model`].
#[derive(Debug, Clone)]
pub struct ProgressSink {
    events: Option<mpsc::Sender<WorkerEvent>>,
    phase: Option<Arc<watch::Sender<LoaderPhase>>>,
}

impl ProgressSink {
    pub(crate) fn new(
        events: mpsc::Sender<WorkerEvent>,
        phase: Arc<watch::Sender<LoaderPhase>>,
    ) -> Self {
        Self {
            events: Some(events),
            phase: Some(phase),
        }
    }

    /// A sink that drops every update.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            events: None,
            phase: None,
        }
    }

    pub async fn emit(&self, progress: LoadProgress) {
        if let Some(phase) = &self.phase {
            phase.send_replace(LoaderPhase::Downloading(progress));
        }
        if let Some(events) = &self.events {
            let _ = events.send(WorkerEvent::progress(progress)).await;
        }
    }

    pub async fn note(&self, note: impl Into<String>) {
        if let Some(events) = &self.events {
            let _ = events.send(WorkerEvent::Loading { note: note.into() }).await;
        }
    }
}

/// Receives decoded text from [`InferenceBackend::generate`], tagged with the
/// generation it belongs to.
#[derive(Debug, Clone)]
pub struct FragmentSink {
    target: Option<(GenerationId, mpsc::Sender<WorkerEvent>)>,
}

impl FragmentSink {
    pub(crate) fn new(id: GenerationId, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            target: Some((id, events)),
        }
    }

    /// A sink that drops every fragment, used for warm-up runs.
    #[must_use]
    pub fn discard() -> Self {
        Self { target: None }
    }

    /// Forward one fragment. Returns `false` once nobody is listening, so the
    /// backend may stop decoding early.
    pub async fn emit(&self, text: impl Into<String>) -> bool {
        let Some((id, events)) = &self.target else {
            return true;
        };
        let text = text.into();
        if text.is_empty() {
            return true;
        }
        events
            .send(WorkerEvent::Fragment { id: *id, text })
            .await
            .is_ok()
    }
}
