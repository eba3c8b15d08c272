//! The session state machine.
//!
//! [`SessionController`] is a synchronous transition function: UI intents
//! and [`WorkerEvent`]s go in, [`WorkerRequest`]s and renders come out. It
//! never awaits, so every transition is testable without a runtime or model.
//!
//! ```text
//! Idle --start--> CheckingCapability --supported--> LoadingModel --ready--> Ready
//! CheckingCapability --unsupported--> Failed
//! LoadingModel --error--> Failed --retry--> LoadingModel
//! Ready --submit--> Generating --complete | interrupt | error | timeout--> Ready
//! Ready | Generating --save (reload)--> LoadingModel
//! Ready | Generating --save (prompt only)--> Ready
//! ```

use std::time::{Duration, Instant};

use hearth_context::{ConversationStore, Retention, Turn};
use hearth_types::{
    Capability, Failure, FailureKind, GenerationId, LoadErrorKind, LoadProgress, ModelSpec,
    Sampling, SessionState, Settings, SettingsChange, SettingsDraft, SubmitAffordance,
};
use hearth_worker::{WorkerEvent, WorkerPort, WorkerRequest};

use crate::errors::{ControllerError, StreamError};
use crate::render::Renderer;
use crate::streaming::{Finished, StreamingSession};

const DEFAULT_MAX_NEW_TOKENS: u32 = 1024;

/// Status line shown outside the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Banner {
    Info(String),
    Error(String),
}

impl Banner {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Info(text) | Self::Error(text) => text,
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Assembles a [`SessionController`]. The worker port and renderer are required.
pub struct ControllerBuilder {
    model_id: String,
    port: Option<Box<dyn WorkerPort>>,
    renderer: Option<Box<dyn Renderer>>,
    settings: Settings,
    retention: Retention,
    max_new_tokens: u32,
    generation_timeout: Option<Duration>,
}

impl ControllerBuilder {
    fn new(model_id: String) -> Self {
        Self {
            model_id,
            port: None,
            renderer: None,
            settings: Settings::default(),
            retention: Retention::default(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            generation_timeout: None,
        }
    }

    pub fn worker(mut self, port: impl WorkerPort + 'static) -> Self {
        self.port = Some(Box::new(port));
        self
    }

    pub fn renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Some(Box::new(renderer));
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens.max(1);
        self
    }

    pub fn generation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.generation_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn build(self) -> Result<SessionController, ControllerError> {
        let port = self
            .port
            .ok_or(ControllerError::MissingCollaborator("worker port"))?;
        let renderer = self
            .renderer
            .ok_or(ControllerError::MissingCollaborator("renderer"))?;
        Ok(SessionController {
            state: SessionState::Idle,
            settings: self.settings,
            store: ConversationStore::new(self.retention),
            streaming: StreamingSession::new(),
            port,
            renderer,
            model_id: self.model_id,
            max_new_tokens: self.max_new_tokens,
            generation_timeout: self.generation_timeout,
            banner: None,
            rendered_version: None,
        })
    }
}

pub struct SessionController {
    state: SessionState,
    settings: Settings,
    store: ConversationStore,
    streaming: StreamingSession,
    port: Box<dyn WorkerPort>,
    renderer: Box<dyn Renderer>,
    model_id: String,
    max_new_tokens: u32,
    generation_timeout: Option<Duration>,
    banner: Option<Banner>,
    rendered_version: Option<u64>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state)
            .field("model_id", &self.model_id)
            .field("settings", &self.settings)
            .field("turns", &self.store.display().len())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    pub fn builder(model_id: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder::new(model_id.into())
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    #[must_use]
    pub fn transcript(&self) -> &[Turn] {
        self.store.display()
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[must_use]
    pub fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    #[must_use]
    pub fn affordance(&self) -> SubmitAffordance {
        self.state.affordance()
    }

    #[must_use]
    pub fn active_generation(&self) -> Option<GenerationId> {
        self.streaming.active_id()
    }

    /// Check the execution backend; loading follows automatically.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if !matches!(self.state, SessionState::Idle) {
            return Err(self.invalid("start"));
        }
        self.port.send(WorkerRequest::Check)?;
        self.banner = Some(Banner::Info("Checking accelerator support...".to_string()));
        self.set_state(SessionState::CheckingCapability);
        self.sync_view();
        Ok(())
    }

    /// Apply one event from the worker.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::CapabilityResult { capability } => self.on_capability(capability),
            WorkerEvent::Progress { loaded, total } => {
                if matches!(self.state, SessionState::LoadingModel(_)) {
                    self.set_state(SessionState::LoadingModel(LoadProgress::new(loaded, total)));
                }
            }
            WorkerEvent::Loading { note } => {
                if matches!(self.state, SessionState::LoadingModel(_)) {
                    self.banner = Some(Banner::Info(note));
                }
            }
            WorkerEvent::Ready => {
                if matches!(self.state, SessionState::LoadingModel(_)) {
                    self.banner = Some(Banner::Info(
                        "Model loaded successfully. Enter a query to get started.".to_string(),
                    ));
                    self.set_state(SessionState::Ready);
                } else {
                    tracing::debug!(state = self.state.name(), "Ignoring unexpected ready");
                }
            }
            WorkerEvent::Started { id } => self.streaming.on_started(id),
            WorkerEvent::Fragment { id, text } => {
                if let Err(err) = self.streaming.on_fragment(&mut self.store, id, &text) {
                    tracing::warn!(%id, "Dropping fragment: {err}");
                }
            }
            WorkerEvent::Complete { id, text } => {
                let finished = self.streaming.on_complete(&mut self.store, id, &text);
                self.after_generation(finished);
            }
            WorkerEvent::Error {
                id: Some(id),
                message,
                ..
            } => {
                let finished = self.streaming.on_error(&mut self.store, id, &message);
                self.after_generation(finished);
            }
            WorkerEvent::Error {
                id: None,
                load_kind,
                message,
            } => self.on_load_error(load_kind.unwrap_or(LoadErrorKind::Other), message),
            WorkerEvent::Unknown => tracing::debug!("Ignoring unknown worker event"),
        }
        self.sync_view();
    }

    /// Send `text` as the next user turn and start a generation.
    pub fn submit(&mut self, text: &str) -> Result<GenerationId, ControllerError> {
        if !self.state.accepts_input() {
            return Err(self.invalid("submit"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ControllerError::EmptyInput);
        }

        self.store.append_user(text)?;
        let prompt = self.store.prompt(self.settings.system_prompt());
        let sampling = Sampling::from_settings(&self.settings, self.max_new_tokens);
        let started = self
            .streaming
            .start(&mut self.store, &*self.port, prompt, sampling);
        let id = match started {
            Ok(id) => id,
            Err(err) => {
                self.banner = Some(Banner::Error(err.to_string()));
                self.sync_view();
                return Err(err.into());
            }
        };
        tracing::info!(%id, prompt_entries = self.store.model_history().len() + 1, "Submitted");
        self.set_state(SessionState::Generating);
        self.sync_view();
        Ok(id)
    }

    /// Stop the running generation, keeping its partial text. Returns whether
    /// anything was running.
    pub fn interrupt(&mut self) -> Result<bool, ControllerError> {
        if !self.state.is_generating() {
            return Ok(false);
        }
        let finished = self.streaming.interrupt(&mut self.store, &*self.port);
        self.after_generation(finished);
        self.sync_view();
        Ok(true)
    }

    /// Validate and apply new settings. Histories are cleared on every
    /// successful save; the model is reloaded only when sampling parameters
    /// or the credential changed, or when the last load failed.
    pub fn save_settings(&mut self, draft: SettingsDraft) -> Result<SettingsChange, ControllerError> {
        let settings = Settings::validate(draft)?;
        let change = settings.change_from(&self.settings);

        let reload = match &self.state {
            SessionState::Idle => None,
            SessionState::Ready | SessionState::Generating => {
                Some(change == SettingsChange::ReloadRequired)
            }
            SessionState::Failed(failure) if !failure.kind.is_fatal() => Some(true),
            SessionState::CheckingCapability
            | SessionState::LoadingModel(_)
            | SessionState::Failed(_) => return Err(self.invalid("save settings")),
        };
        let Some(reload) = reload else {
            // Nothing loaded yet; `start` will pick the new settings up.
            self.settings = settings;
            self.store.reset();
            self.sync_view();
            return Ok(change);
        };

        self.streaming.abandon(&*self.port);
        self.settings = settings;
        self.store.reset();
        tracing::info!(?change, reload, "Settings saved");

        let outcome = self.port.send(WorkerRequest::Reset).map_err(ControllerError::from);
        let outcome = outcome.and_then(|()| {
            if reload {
                self.request_load()
            } else {
                self.banner = Some(Banner::Info("Settings saved.".to_string()));
                self.set_state(SessionState::Ready);
                Ok(())
            }
        });
        if let Err(err) = &outcome {
            // The stream is already abandoned; never stay in Generating
            // with nothing left to interrupt.
            self.fail(Failure::new(FailureKind::Load(LoadErrorKind::Other), err.to_string()));
        }
        self.sync_view();
        outcome.map(|()| change)
    }

    /// Start a new conversation with the current settings.
    pub fn clear_conversation(&mut self) -> Result<SettingsChange, ControllerError> {
        self.save_settings(SettingsDraft::from_settings(&self.settings))
    }

    /// Re-issue the model load after a retryable failure.
    pub fn retry(&mut self) -> Result<(), ControllerError> {
        match &self.state {
            SessionState::Failed(failure) if failure.kind.is_retryable() => {
                let result = self.request_load();
                self.sync_view();
                result
            }
            _ => Err(self.invalid("retry")),
        }
    }

    /// Stop the generation if it has exceeded the configured timeout.
    /// Returns whether it was stopped.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let Some(timeout) = self.generation_timeout else {
            return false;
        };
        if !self.state.is_generating() {
            return false;
        }
        let finished = self
            .streaming
            .expire(&mut self.store, &*self.port, timeout, now);
        let expired = matches!(finished, Ok(Some(_)));
        if expired {
            self.after_generation(finished);
            self.sync_view();
        }
        expired
    }

    fn on_capability(&mut self, capability: Capability) {
        if !matches!(self.state, SessionState::CheckingCapability) {
            tracing::debug!(state = self.state.name(), "Ignoring late capability result");
            return;
        }
        match capability {
            Capability::Supported { adapter } => {
                tracing::info!(%adapter, "Accelerator supported");
                self.banner = Some(Banner::Info(format!(
                    "Accelerator supported: {adapter}. Loading model..."
                )));
                if let Err(err) = self.request_load() {
                    self.fail(Failure::new(FailureKind::Load(LoadErrorKind::Other), err.to_string()));
                }
            }
            Capability::Unsupported { reason } => {
                self.fail(Failure::new(FailureKind::CapabilityUnsupported, reason));
            }
        }
    }

    fn on_load_error(&mut self, kind: LoadErrorKind, message: String) {
        match self.state {
            SessionState::LoadingModel(_) | SessionState::CheckingCapability => {
                self.fail(Failure::new(FailureKind::Load(kind), message));
            }
            _ => tracing::warn!(
                state = self.state.name(),
                %kind,
                "Load error outside of loading: {message}"
            ),
        }
    }

    fn after_generation(
        &mut self,
        finished: Result<Option<Finished>, StreamError>,
    ) {
        match finished {
            Ok(Some(finished)) => {
                if let Finished::TimedOut(_) = finished {
                    self.banner = Some(Banner::Error("Generation timed out.".to_string()));
                }
                tracing::debug!(?finished, "Generation finished");
                if self.state.is_generating() {
                    self.set_state(SessionState::Ready);
                }
            }
            Ok(None) => {}
            Err(err) => {
                // The store rejected the transition; never leave the session stuck.
                tracing::warn!("Generation bookkeeping failed: {err}");
                if self.state.is_generating() {
                    self.set_state(SessionState::Ready);
                }
            }
        }
    }

    fn request_load(&mut self) -> Result<(), ControllerError> {
        let spec = ModelSpec::new(self.model_id.clone(), self.settings.access_token().cloned());
        self.port.send(WorkerRequest::Load { spec })?;
        self.set_state(SessionState::LoadingModel(LoadProgress::default()));
        Ok(())
    }

    fn fail(&mut self, failure: Failure) {
        tracing::warn!(kind = ?failure.kind, "{failure}");
        let mut text = failure.to_string();
        if let FailureKind::Load(kind) = failure.kind {
            text.push_str(&format!(". {}", kind.hint()));
        }
        self.banner = Some(Banner::Error(text));
        self.set_state(SessionState::Failed(failure));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state.name() != state.name() {
            tracing::info!(from = self.state.name(), to = state.name(), "Session state");
        }
        self.state = state;
        self.renderer.state_changed(&self.state);
    }

    fn invalid(&self, action: &'static str) -> ControllerError {
        let err = ControllerError::InvalidState {
            action,
            state: self.state.name(),
        };
        tracing::warn!("{err}");
        err
    }

    fn sync_view(&mut self) {
        let version = self.store.version();
        if self.rendered_version != Some(version) {
            self.renderer.render(self.store.display());
            self.rendered_version = Some(version);
        }
    }
}
