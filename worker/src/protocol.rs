//! Messages exchanged between the foreground session and the worker.
//!
//! Both directions are internally tagged JSON objects (`{"type": "generate", ...}`)
//! so the worker can also run behind a process or thread boundary. Unknown
//! `type` values decode to an `Unknown` variant and are ignored by receivers.

use serde::{Deserialize, Serialize};

use hearth_types::{
    Capability, ChatMessage, GenerationId, LoadErrorKind, LoadProgress, ModelSpec, Sampling,
    Temperature, TopK,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Check the execution backend.
    Check,
    /// Activate a model, replacing any previous one.
    Load { spec: ModelSpec },
    Generate {
        id: GenerationId,
        messages: Vec<ChatMessage>,
        temperature: Temperature,
        top_k: TopK,
        max_new_tokens: u32,
    },
    /// Cooperatively stop the running generation. Idempotent.
    Interrupt,
    /// Drop retained decode state and clear any pending interrupt.
    Reset,
    #[serde(other)]
    Unknown,
}

impl WorkerRequest {
    #[must_use]
    pub fn generate(id: GenerationId, messages: Vec<ChatMessage>, sampling: Sampling) -> Self {
        Self::Generate {
            id,
            messages,
            temperature: sampling.temperature,
            top_k: sampling.top_k,
            max_new_tokens: sampling.max_new_tokens,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Load { .. } => "load",
            Self::Generate { .. } => "generate",
            Self::Interrupt => "interrupt",
            Self::Reset => "reset",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    CapabilityResult {
        capability: Capability,
    },
    /// Download progress; `total` is absent for indeterminate heartbeats.
    Progress {
        loaded: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
    /// Free-form loading status, e.g. while warming up.
    Loading {
        note: String,
    },
    Ready,
    Started {
        id: GenerationId,
    },
    Fragment {
        id: GenerationId,
        text: String,
    },
    /// Authoritative final text of a generation.
    Complete {
        id: GenerationId,
        text: String,
    },
    /// `id` is set for generation failures, `load_kind` for load failures.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<GenerationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        load_kind: Option<LoadErrorKind>,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl WorkerEvent {
    #[must_use]
    pub fn progress(progress: LoadProgress) -> Self {
        Self::Progress {
            loaded: progress.loaded,
            total: progress.total,
        }
    }

    #[must_use]
    pub fn generation_error(id: GenerationId, message: impl Into<String>) -> Self {
        Self::Error {
            id: Some(id),
            load_kind: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn load_error(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            id: None,
            load_kind: Some(kind),
            message: message.into(),
        }
    }

    /// Generation this event belongs to, if any.
    #[must_use]
    pub fn generation(&self) -> Option<GenerationId> {
        match self {
            Self::Started { id } | Self::Fragment { id, .. } | Self::Complete { id, .. } => {
                Some(*id)
            }
            Self::Error { id, .. } => *id,
            _ => None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The worker has shut down and can no longer receive requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("inference worker is not running")]
pub struct WorkerGone;

/// Foreground-side handle for posting requests to a worker.
pub trait WorkerPort {
    fn send(&self, request: WorkerRequest) -> Result<(), WorkerGone>;
}

const TURN_START_MARKER: &str = "<|im_start|>assistant";
const TURN_END_MARKER: &str = "<|im_end|>";

/// Strip chat-template control markers from decoded output.
#[must_use]
pub fn clean_generated_text(text: &str) -> String {
    text.replace(TURN_START_MARKER, "")
        .replace(TURN_END_MARKER, "")
        .trim()
        .to_string()
}
