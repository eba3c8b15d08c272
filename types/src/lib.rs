//! Core domain types for Hearth.
//!
//! Pure values with no IO and no async. Everything here can cross the worker
//! boundary; the wire-facing types derive serde and enforce their bounds on
//! decode as well as on construction.

mod ids;
mod message;
mod model;
mod settings;
mod state;

pub use ids::{GenerationId, TurnId};
pub use message::{ChatMessage, Role};
pub use model::{
    Capability, GenerateError, LoadError, LoadErrorKind, LoadProgress, ModelSpec, Sampling,
};
pub use settings::{
    AccessToken, DEFAULT_SYSTEM_PROMPT, Settings, SettingsChange, SettingsDraft, SettingsError,
    Temperature, TopK,
};
pub use state::{Failure, FailureKind, SessionState, SubmitAffordance};
