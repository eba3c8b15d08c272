use hearth_context::StoreError;
use hearth_types::{GenerationId, SettingsError};
use hearth_worker::WorkerGone;

/// Failure of a [`crate::StreamingSession`] operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("generation {0} is already running")]
    AlreadyActive(GenerationId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    WorkerGone(#[from] WorkerGone),
}

/// Failure of a [`crate::SessionController`] intent. None of these change
/// state, except a lost worker during a settings save, which fails the session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] SettingsError),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
    #[error("Please enter a query.")]
    EmptyInput,
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    WorkerGone(#[from] WorkerGone),
}
