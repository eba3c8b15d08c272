//! The conversation store.
//!
//! Invariants maintained by every operation:
//! - at most one display turn is incomplete, and it is the last one;
//! - `model.len() <= retention.model_window` after any append;
//! - the prompt history never starts with an assistant entry and never holds
//!   two entries of the same role back to back.

use hearth_types::{ChatMessage, Role, TurnId};

use crate::retention::Retention;
use crate::turn::{Turn, TurnAnnotation};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("turn {0} is still streaming")]
    IncompleteTurnExists(TurnId),
    #[error("unknown turn {0}")]
    UnknownTurn(TurnId),
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    model: Vec<ChatMessage>,
    display: Vec<Turn>,
    retention: Retention,
    next_turn_id: u64,
    version: u64,
}

impl ConversationStore {
    #[must_use]
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Prompt-facing history, oldest first.
    #[must_use]
    pub fn model_history(&self) -> &[ChatMessage] {
        &self.model
    }

    /// Display transcript, oldest first.
    #[must_use]
    pub fn display(&self) -> &[Turn] {
        &self.display
    }

    #[must_use]
    pub fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.display.iter().find(|turn| turn.id() == id)
    }

    #[must_use]
    pub fn incomplete_turn(&self) -> Option<TurnId> {
        self.display
            .last()
            .filter(|turn| !turn.is_complete())
            .map(Turn::id)
    }

    /// Bumped on every mutation; renderers compare it to skip redundant draws.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// `[system, ...model history]`, ready to hand to the inference capability.
    #[must_use]
    pub fn prompt(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.model.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(self.model.iter().cloned());
        messages
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> Result<TurnId, StoreError> {
        if let Some(pending) = self.incomplete_turn() {
            return Err(StoreError::IncompleteTurnExists(pending));
        }
        let text = text.into();
        let id = self.issue_id();

        // A user entry directly after another one means the previous exchange
        // never produced an answer; keep only the newest question.
        if self.model.last().is_some_and(|m| m.role == Role::User) {
            self.model.pop();
        }
        self.model.push(ChatMessage::user(text.clone()));
        self.display.push(Turn::user(id, text));
        self.apply_retention();
        self.touch();
        Ok(id)
    }

    pub fn begin_assistant_turn(&mut self) -> Result<TurnId, StoreError> {
        if let Some(pending) = self.incomplete_turn() {
            return Err(StoreError::IncompleteTurnExists(pending));
        }
        let id = self.issue_id();
        self.display.push(Turn::pending_assistant(id));
        self.truncate_display(self.retention.model_window);
        self.touch();
        Ok(id)
    }

    /// Concatenate streamed text onto a turn. Completed turns are left untouched.
    pub fn append_fragment(&mut self, id: TurnId, fragment: &str) -> Result<(), StoreError> {
        let turn = self.turn_mut(id)?;
        if turn.is_complete() {
            tracing::debug!(turn = %id, "Ignoring fragment for completed turn");
            return Ok(());
        }
        turn.push_fragment(fragment);
        self.touch();
        Ok(())
    }

    /// Complete a turn with authoritative text and project it into the prompt history.
    pub fn finalize_turn(
        &mut self,
        id: TurnId,
        final_text: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.complete_turn(id, final_text.into(), None)
    }

    /// Complete a stopped turn with whatever text has streamed in so far.
    pub fn finalize_interrupted(
        &mut self,
        id: TurnId,
        annotation: TurnAnnotation,
    ) -> Result<(), StoreError> {
        let partial = self.turn_mut(id)?.text().to_string();
        self.complete_turn(id, partial, Some(annotation))
    }

    /// Complete a failed turn. The partial output stays visible with the
    /// failure note; the unanswered user entry is withdrawn from the prompt
    /// history so the next prompt remains role-alternating.
    pub fn fail_turn(&mut self, id: TurnId, reason: impl Into<String>) -> Result<(), StoreError> {
        let turn = self.turn_mut(id)?;
        if turn.is_complete() {
            return Ok(());
        }
        let partial = turn.text().to_string();
        turn.finish(partial, Some(TurnAnnotation::Failed(reason.into())));
        self.rollback_pending_user();
        self.touch();
        Ok(())
    }

    /// Drop the oldest entries until both histories fit `window`.
    pub fn truncate(&mut self, window: usize) {
        let window = window.max(1);
        if self.model.len() > window {
            let excess = self.model.len() - window;
            self.model.drain(..excess);
        }
        // Preserve role pairing: the prompt history must open with a user entry.
        let leading_assistants = self
            .model
            .iter()
            .take_while(|m| m.role == Role::Assistant)
            .count();
        if leading_assistants > 0 {
            self.model.drain(..leading_assistants);
        }
        self.truncate_display(window);
        self.touch();
    }

    pub fn reset(&mut self) {
        self.model.clear();
        self.display.clear();
        self.touch();
    }

    fn complete_turn(
        &mut self,
        id: TurnId,
        text: String,
        annotation: Option<TurnAnnotation>,
    ) -> Result<(), StoreError> {
        let turn = self.turn_mut(id)?;
        if turn.is_complete() {
            tracing::debug!(turn = %id, "Turn already finalized");
            return Ok(());
        }
        let role = turn.role();
        turn.finish(text.clone(), annotation);

        if role == Role::Assistant {
            if text.is_empty() {
                // Nothing to answer with; an empty assistant entry is not usable context.
                self.rollback_pending_user();
            } else if self.model.last().is_some_and(|m| m.role == Role::User) {
                self.model.push(ChatMessage::assistant(text));
                self.apply_retention();
            }
        }
        self.touch();
        Ok(())
    }

    fn rollback_pending_user(&mut self) {
        if self.model.last().is_some_and(|m| m.role == Role::User) {
            self.model.pop();
        }
    }

    fn apply_retention(&mut self) {
        let window = self.retention.model_window;
        if self.model.len() > window || self.display_over_cap(window) {
            self.truncate(window);
        }
    }

    fn display_over_cap(&self, window: usize) -> bool {
        self.retention
            .display_cap(window)
            .is_some_and(|cap| self.display.len() > cap)
    }

    fn truncate_display(&mut self, window: usize) {
        let Some(cap) = self.retention.display_cap(window) else {
            return;
        };
        while self.display.len() > cap {
            // The streaming turn is always last; never drop it.
            if self.display.first().is_some_and(|turn| !turn.is_complete()) {
                break;
            }
            self.display.remove(0);
        }
    }

    fn turn_mut(&mut self, id: TurnId) -> Result<&mut Turn, StoreError> {
        self.display
            .iter_mut()
            .find(|turn| turn.id() == id)
            .ok_or(StoreError::UnknownTurn(id))
    }

    fn issue_id(&mut self) -> TurnId {
        let id = TurnId::new(self.next_turn_id);
        self.next_turn_id += 1;
        id
    }

    fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}
