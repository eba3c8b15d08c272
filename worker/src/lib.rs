//! The background inference context.
//!
//! # Architecture
//!
//! The foreground talks to the worker exclusively through [`WorkerRequest`]
//! messages and receives [`WorkerEvent`]s back; nothing mutable is shared.
//!
//! ```text
//! foreground ──WorkerRequest──> worker loop ──> ModelLoader ──> InferenceBackend::load_model
//!     ^                              │
//!     │                              └──spawn──> generation task ──> InferenceBackend::generate
//!     └──────────────WorkerEvent─────────────────────┘
//! ```
//!
//! | Request | Answer |
//! |---------|--------|
//! | `check` | `capability_result` |
//! | `load` | `loading`, `progress`*, `ready` or `error{load_kind}` |
//! | `generate` | `started`, `fragment`*, then exactly one of `complete` / `error{id}` |
//! | `interrupt` | cooperative; the running generation completes early |
//! | `reset` | clears retained decode state, no answer |

mod backend;
mod loader;
mod protocol;
mod worker;

pub use backend::{FragmentSink, InferenceBackend, ProgressSink};
pub use loader::{LoaderPhase, ModelLoader};
pub use protocol::{WorkerEvent, WorkerGone, WorkerPort, WorkerRequest, clean_generated_text};
pub use worker::{EVENT_CHANNEL_CAPACITY, WorkerHandle, spawn_worker};

pub use tokio_util::sync::CancellationToken;
