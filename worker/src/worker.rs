use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hearth_types::{ChatMessage, GenerateError, GenerationId, ModelSpec, Sampling};

use crate::backend::{FragmentSink, InferenceBackend};
use crate::loader::{LoaderPhase, ModelLoader};
use crate::protocol::{WorkerEvent, WorkerGone, WorkerPort, WorkerRequest, clean_generated_text};

/// Bounded so a stalled foreground applies backpressure to decoding.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Foreground handle to a running worker. Dropping every clone stops it.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    phase: watch::Receiver<LoaderPhase>,
}

impl WorkerHandle {
    /// Latest loader phase, for diagnostics.
    #[must_use]
    pub fn loader_phase(&self) -> LoaderPhase {
        self.phase.borrow().clone()
    }
}

impl WorkerPort for WorkerHandle {
    fn send(&self, request: WorkerRequest) -> Result<(), WorkerGone> {
        tracing::debug!(request = request.name(), "Posting worker request");
        self.requests.send(request).map_err(|_| WorkerGone)
    }
}

/// Start the worker loop on the current tokio runtime.
pub fn spawn_worker<B: InferenceBackend>(backend: B) -> (WorkerHandle, mpsc::Receiver<WorkerEvent>) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let loader = ModelLoader::new();
    let handle = WorkerHandle {
        requests: request_tx,
        phase: loader.subscribe(),
    };
    let worker = Worker {
        backend: Arc::new(backend),
        loader,
        model: None,
        active: None,
        events: event_tx,
    };
    tokio::spawn(worker.run(request_rx));
    (handle, event_rx)
}

struct ActiveGeneration {
    id: GenerationId,
    cancel: CancellationToken,
    /// Set before the terminal event is sent.
    done: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ActiveGeneration {
    fn is_winding_down(&self) -> bool {
        self.cancel.is_cancelled() || self.done.load(Ordering::Acquire)
    }
}

struct Worker<B: InferenceBackend> {
    backend: Arc<B>,
    loader: ModelLoader,
    model: Option<Arc<B::Model>>,
    active: Option<ActiveGeneration>,
    events: mpsc::Sender<WorkerEvent>,
}

impl<B: InferenceBackend> Worker<B> {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<WorkerRequest>) {
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<GenerationId>();
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request, &finished_tx).await;
                }
                Some(id) = finished_rx.recv() => {
                    if self.active.as_ref().is_some_and(|active| active.id == id) {
                        self.active = None;
                    }
                }
            }
            if self.events.is_closed() {
                break;
            }
        }
        self.cancel_active().await;
        tracing::debug!("Worker loop stopped");
    }

    async fn handle(&mut self, request: WorkerRequest, finished: &mpsc::UnboundedSender<GenerationId>) {
        match request {
            WorkerRequest::Check => {
                let capability = self.backend.check_capability().await;
                tracing::info!(?capability, "Capability check finished");
                self.emit(WorkerEvent::CapabilityResult { capability }).await;
            }
            WorkerRequest::Load { spec } => self.load(spec).await,
            WorkerRequest::Generate {
                id,
                messages,
                temperature,
                top_k,
                max_new_tokens,
            } => {
                let sampling = Sampling {
                    temperature,
                    top_k,
                    max_new_tokens,
                };
                self.start_generation(id, messages, sampling, finished).await;
            }
            WorkerRequest::Interrupt => {
                if let Some(active) = &self.active {
                    tracing::debug!(id = %active.id, "Interrupting generation");
                    active.cancel.cancel();
                }
            }
            WorkerRequest::Reset => {
                // Per-generation tokens mean there is no sticky interrupt flag to clear.
                if let Some(model) = &self.model {
                    self.backend.reset_context(model);
                }
            }
            WorkerRequest::Unknown => {
                tracing::debug!("Ignoring unknown worker request");
            }
        }
    }

    async fn load(&mut self, spec: ModelSpec) {
        self.cancel_active().await;
        self.emit(WorkerEvent::Loading {
            note: "Loading model...".to_string(),
        })
        .await;

        match self.loader.load(self.backend.as_ref(), &spec, &self.events).await {
            Ok(model) => {
                self.model = Some(Arc::new(model));
                self.emit(WorkerEvent::Ready).await;
            }
            Err(err) => {
                self.model = None;
                self.emit(WorkerEvent::load_error(err.kind, err.message)).await;
            }
        }
    }

    async fn start_generation(
        &mut self,
        id: GenerationId,
        messages: Vec<ChatMessage>,
        sampling: Sampling,
        finished: &mpsc::UnboundedSender<GenerationId>,
    ) {
        match &self.active {
            // An interrupted or finished generation may still be between its
            // terminal event and the finished notice; let it wind down first.
            Some(active) if active.is_winding_down() => self.cancel_active().await,
            Some(_) => {
                self.emit(WorkerEvent::generation_error(id, GenerateError::Busy.to_string()))
                    .await;
                return;
            }
            None => {}
        }
        let Some(model) = self.model.clone() else {
            self.emit(WorkerEvent::generation_error(id, GenerateError::NotLoaded.to_string()))
                .await;
            return;
        };

        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_generation(
            Arc::clone(&self.backend),
            model,
            GenerationJob {
                id,
                messages,
                sampling,
                cancel: cancel.clone(),
                done: Arc::clone(&done),
            },
            self.events.clone(),
            finished.clone(),
        ));
        self.active = Some(ActiveGeneration {
            id,
            cancel,
            done,
            task,
        });
    }

    /// Cancel the running generation and wait for it to deliver its terminal event.
    async fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(err) = active.task.await {
                tracing::warn!(id = %active.id, "Generation task aborted: {err}");
            }
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}

struct GenerationJob {
    id: GenerationId,
    messages: Vec<ChatMessage>,
    sampling: Sampling,
    cancel: CancellationToken,
    done: Arc<AtomicBool>,
}

async fn run_generation<B: InferenceBackend>(
    backend: Arc<B>,
    model: Arc<B::Model>,
    job: GenerationJob,
    events: mpsc::Sender<WorkerEvent>,
    finished: mpsc::UnboundedSender<GenerationId>,
) {
    let GenerationJob {
        id,
        messages,
        sampling,
        cancel,
        done,
    } = job;
    let _ = events.send(WorkerEvent::Started { id }).await;

    let fragments = FragmentSink::new(id, events.clone());
    let outcome = backend
        .generate(&model, messages, sampling, &fragments, cancel.clone())
        .await;
    drop(fragments);

    let terminal = match outcome {
        Ok(text) => {
            tracing::debug!(%id, interrupted = cancel.is_cancelled(), "Generation finished");
            WorkerEvent::Complete {
                id,
                text: clean_generated_text(&text),
            }
        }
        Err(err) => {
            tracing::warn!(%id, "Generation failed: {err}");
            WorkerEvent::generation_error(id, err.to_string())
        }
    };
    // The foreground may answer the terminal event with a new Generate
    // before the finished notice reaches the worker loop.
    done.store(true, Ordering::Release);
    let _ = events.send(terminal).await;
    let _ = finished.send(id);
}
