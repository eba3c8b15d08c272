//! The in-flight generation.
//!
//! [`StreamingSession`] owns at most one generation at a time and is the only
//! place that maps worker events onto the assistant turn they belong to.
//! Events carrying any other [`GenerationId`] are stale and dropped.

use std::time::{Duration, Instant};

use hearth_context::{ConversationStore, TurnAnnotation};
use hearth_types::{ChatMessage, GenerationId, Sampling, TurnId};
use hearth_worker::{WorkerPort, WorkerRequest};

use crate::errors::StreamError;

#[derive(Debug, Clone, Copy)]
struct ActiveGeneration {
    id: GenerationId,
    turn: TurnId,
    started_at: Instant,
    acknowledged: bool,
}

/// How a generation ended, as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    Completed(TurnId),
    Interrupted(TurnId),
    TimedOut(TurnId),
    Failed(TurnId),
}

impl Finished {
    #[must_use]
    pub const fn turn(self) -> TurnId {
        match self {
            Self::Completed(turn)
            | Self::Interrupted(turn)
            | Self::TimedOut(turn)
            | Self::Failed(turn) => turn,
        }
    }
}

#[derive(Debug)]
pub struct StreamingSession {
    next_id: GenerationId,
    active: Option<ActiveGeneration>,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: GenerationId::new(1),
            active: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn active_id(&self) -> Option<GenerationId> {
        self.active.map(|active| active.id)
    }

    #[must_use]
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.map(|active| active.turn)
    }

    /// Whether the worker has confirmed the active generation.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.active.is_some_and(|active| active.acknowledged)
    }

    /// Open the placeholder turn and post the generate request.
    ///
    /// The placeholder exists before this returns, so no fragment can arrive
    /// without a turn to land in.
    pub fn start(
        &mut self,
        store: &mut ConversationStore,
        port: &dyn WorkerPort,
        prompt: Vec<ChatMessage>,
        sampling: Sampling,
    ) -> Result<GenerationId, StreamError> {
        if let Some(active) = self.active {
            return Err(StreamError::AlreadyActive(active.id));
        }
        let turn = store.begin_assistant_turn()?;
        let id = self.next_id;
        self.next_id = id.next();

        if let Err(gone) = port.send(WorkerRequest::generate(id, prompt, sampling)) {
            store.fail_turn(turn, gone.to_string())?;
            return Err(gone.into());
        }
        tracing::debug!(%id, %turn, "Generation requested");
        self.active = Some(ActiveGeneration {
            id,
            turn,
            started_at: Instant::now(),
            acknowledged: false,
        });
        Ok(id)
    }

    pub fn on_started(&mut self, id: GenerationId) {
        match &mut self.active {
            Some(active) if active.id == id => active.acknowledged = true,
            _ => tracing::debug!(%id, "Ignoring started signal for stale generation"),
        }
    }

    /// Append streamed text. Returns whether the fragment was applied.
    pub fn on_fragment(
        &mut self,
        store: &mut ConversationStore,
        id: GenerationId,
        text: &str,
    ) -> Result<bool, StreamError> {
        let Some(active) = self.current(id) else {
            tracing::debug!(%id, "Discarding fragment for stale generation");
            return Ok(false);
        };
        store.append_fragment(active.turn, text)?;
        Ok(true)
    }

    /// Finalize with the worker's authoritative text.
    pub fn on_complete(
        &mut self,
        store: &mut ConversationStore,
        id: GenerationId,
        final_text: &str,
    ) -> Result<Option<Finished>, StreamError> {
        let Some(active) = self.finish(id) else {
            tracing::debug!(%id, "Ignoring completion for stale generation");
            return Ok(None);
        };
        store.finalize_turn(active.turn, final_text)?;
        Ok(Some(Finished::Completed(active.turn)))
    }

    /// Finalize the partial turn with an error annotation.
    pub fn on_error(
        &mut self,
        store: &mut ConversationStore,
        id: GenerationId,
        reason: &str,
    ) -> Result<Option<Finished>, StreamError> {
        let Some(active) = self.finish(id) else {
            tracing::debug!(%id, "Ignoring error for stale generation");
            return Ok(None);
        };
        store.fail_turn(active.turn, reason)?;
        Ok(Some(Finished::Failed(active.turn)))
    }

    /// Ask the worker to stop and keep whatever has streamed so far.
    ///
    /// Idempotent: without an active generation this does nothing. Later
    /// events for the stopped generation are discarded as stale.
    pub fn interrupt(
        &mut self,
        store: &mut ConversationStore,
        port: &dyn WorkerPort,
    ) -> Result<Option<Finished>, StreamError> {
        self.stop(store, port, TurnAnnotation::Interrupted)
            .map(|turn| turn.map(Finished::Interrupted))
    }

    /// Stop the generation if it has run for `timeout` or longer at `now`.
    pub fn expire(
        &mut self,
        store: &mut ConversationStore,
        port: &dyn WorkerPort,
        timeout: Duration,
        now: Instant,
    ) -> Result<Option<Finished>, StreamError> {
        let overdue = self
            .active
            .is_some_and(|active| now.saturating_duration_since(active.started_at) >= timeout);
        if !overdue {
            return Ok(None);
        }
        tracing::warn!(timeout_secs = timeout.as_secs(), "Generation timed out");
        self.stop(store, port, TurnAnnotation::TimedOut)
            .map(|turn| turn.map(Finished::TimedOut))
    }

    /// Cancel without touching the transcript, for when it is about to be cleared.
    pub fn abandon(&mut self, port: &dyn WorkerPort) {
        if let Some(active) = self.active.take() {
            tracing::debug!(id = %active.id, "Abandoning generation");
            if let Err(gone) = port.send(WorkerRequest::Interrupt) {
                tracing::warn!("Could not interrupt abandoned generation: {gone}");
            }
        }
    }

    fn stop(
        &mut self,
        store: &mut ConversationStore,
        port: &dyn WorkerPort,
        annotation: TurnAnnotation,
    ) -> Result<Option<TurnId>, StreamError> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        // The turn is finalized either way; a dead worker cannot stream more.
        if let Err(gone) = port.send(WorkerRequest::Interrupt) {
            tracing::warn!(id = %active.id, "Could not deliver interrupt: {gone}");
        }
        store.finalize_interrupted(active.turn, annotation)?;
        Ok(Some(active.turn))
    }

    fn current(&self, id: GenerationId) -> Option<ActiveGeneration> {
        self.active.filter(|active| active.id == id)
    }

    fn finish(&mut self, id: GenerationId) -> Option<ActiveGeneration> {
        let active = self.current(id)?;
        self.active = None;
        Some(active)
    }
}
