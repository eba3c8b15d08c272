//! Session lifecycle state.
//!
//! # State Machine
//! ```text
//! Idle ──check──> CheckingCapability ──supported──> LoadingModel ──ready──> Ready
//!                        │                              │                   │  ^
//!                   unsupported                       error            submit  complete | interrupt | error
//!                        v                              v                   v  │
//!                      Failed <─────────────────────────┘               Generating
//! ```
//! A settings save from `Ready`/`Generating` either re-enters `LoadingModel`
//! (reload required) or stays in `Ready` (prompt-only).

use std::fmt;

use crate::{LoadErrorKind, LoadProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The execution backend is unavailable. Fatal for the session.
    CapabilityUnsupported,
    /// Model loading failed.
    Load(LoadErrorKind),
}

impl FailureKind {
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::CapabilityUnsupported)
    }

    /// The loader may be invoked again as-is.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        match self {
            Self::CapabilityUnsupported => false,
            Self::Load(kind) => kind.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::CapabilityUnsupported => {
                write!(f, "Accelerator unsupported: {}", self.message)
            }
            FailureKind::Load(kind) => write!(f, "Model loading failed ({kind}): {}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    CheckingCapability,
    LoadingModel(LoadProgress),
    Ready,
    Generating,
    Failed(Failure),
}

impl SessionState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingCapability => "checking_capability",
            Self::LoadingModel(_) => "loading_model",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Failed(_) => "failed",
        }
    }

    #[must_use]
    pub const fn accepts_input(&self) -> bool {
        matches!(self, Self::Ready)
    }

    #[must_use]
    pub const fn is_generating(&self) -> bool {
        matches!(self, Self::Generating)
    }

    /// Projection of the state onto the submit control.
    #[must_use]
    pub fn affordance(&self) -> SubmitAffordance {
        let (enabled, label) = match self {
            Self::Idle => (false, "Configure Settings"),
            Self::CheckingCapability => (false, "Checking GPU..."),
            Self::LoadingModel(_) => (false, "Loading Model..."),
            Self::Ready => (true, "Get Response"),
            Self::Generating => (false, "Generating..."),
            Self::Failed(failure) if failure.kind.is_retryable() => (false, "Retry Load"),
            Self::Failed(_) => (false, "Error Occurred"),
        };
        SubmitAffordance {
            enabled,
            label,
            interrupt_visible: self.is_generating(),
        }
    }
}

/// What the submit/interrupt controls should show for a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAffordance {
    pub enabled: bool,
    pub label: &'static str,
    pub interrupt_visible: bool,
}
