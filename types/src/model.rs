use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{AccessToken, Settings, Temperature, TopK};

const DEFAULT_MAX_NEW_TOKENS: u32 = 1024;

/// Identifies the model the worker should activate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
}

impl ModelSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, access_token: Option<AccessToken>) -> Self {
        Self {
            id: id.into(),
            access_token,
        }
    }
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub temperature: Temperature,
    pub top_k: TopK,
    pub max_new_tokens: u32,
}

impl Sampling {
    #[must_use]
    pub fn from_settings(settings: &Settings, max_new_tokens: u32) -> Self {
        Self {
            temperature: settings.temperature(),
            top_k: settings.top_k(),
            max_new_tokens,
        }
    }

    /// Single-token request used to pay shader/JIT compilation up front.
    #[must_use]
    pub fn warm_up() -> Self {
        let defaults = Settings::default();
        Self {
            temperature: defaults.temperature(),
            top_k: defaults.top_k(),
            max_new_tokens: 1,
        }
    }
}

impl Default for Sampling {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), DEFAULT_MAX_NEW_TOKENS)
    }
}

/// Result of probing the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Capability {
    Supported { adapter: String },
    Unsupported { reason: String },
}

/// Byte progress of a model download.
///
/// `total` is `None` when the remote side did not announce a size; such
/// updates are indeterminate heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub loaded: u64,
    #[serde(default)]
    pub total: Option<u64>,
}

impl LoadProgress {
    #[must_use]
    pub const fn new(loaded: u64, total: Option<u64>) -> Self {
        Self { loaded, total }
    }

    /// Percentage in `[0, 100]`, or `None` for indeterminate progress.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.loaded as f64 / total as f64 * 100.0).min(100.0)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self.total, None | Some(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    /// A credential is mandatory and was absent or rejected.
    AuthRequired,
    /// The remote artifact does not exist.
    NotFound,
    /// Transport failure; reconnecting and retrying may help.
    Network,
    /// The execution backend cannot run the model.
    IncompatibleRuntime,
    /// Any other load or warm-up failure.
    Other,
}

impl LoadErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "authentication required",
            Self::NotFound => "model not found",
            Self::Network => "network error",
            Self::IncompatibleRuntime => "incompatible runtime",
            Self::Other => "load failed",
        }
    }

    /// Whether invoking the loader again without changing settings can succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Other)
    }

    #[must_use]
    pub const fn hint(self) -> &'static str {
        match self {
            Self::AuthRequired => "Add an access token in settings, then save.",
            Self::NotFound => "Check the model id in the config file.",
            Self::Network => "Reconnect and retry.",
            Self::IncompatibleRuntime => "This device cannot run the model.",
            Self::Other => "Retry loading the model.",
        }
    }
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    #[must_use]
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::AuthRequired, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Network, message)
    }

    #[must_use]
    pub fn incompatible(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::IncompatibleRuntime, message)
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Other, message)
    }
}

/// Failure of a single generation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerateError {
    #[error("a generation is already running")]
    Busy,
    #[error("no model is loaded")]
    NotLoaded,
    #[error("generation failed: {0}")]
    Failed(String),
    /// The runtime cannot be reached or does not serve the model.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_optional() {
        assert_eq!(LoadProgress::new(50, Some(200)).percent(), Some(25.0));
        assert_eq!(LoadProgress::new(300, Some(200)).percent(), Some(100.0));
        assert_eq!(LoadProgress::new(300, None).percent(), None);
        assert!(LoadProgress::new(1, Some(0)).is_indeterminate());
    }

    #[test]
    fn only_transport_and_generic_failures_are_retryable() {
        assert!(LoadErrorKind::Network.is_retryable());
        assert!(LoadErrorKind::Other.is_retryable());
        assert!(!LoadErrorKind::AuthRequired.is_retryable());
        assert!(!LoadErrorKind::NotFound.is_retryable());
        assert!(!LoadErrorKind::IncompatibleRuntime.is_retryable());
    }

    #[test]
    fn warm_up_requests_one_token() {
        assert_eq!(Sampling::warm_up().max_new_tokens, 1);
    }

    #[test]
    fn model_spec_omits_missing_token() {
        let json = serde_json::to_value(ModelSpec::new("org/model", None)).unwrap();
        assert_eq!(json, serde_json::json!({ "id": "org/model" }));
    }
}
