//! Session orchestration for Hearth.
//!
//! This crate contains the foreground half of the worker boundary and has no
//! async or IO of its own:
//!
//! - [`SessionController`]: lifecycle state machine and UI intents
//! - [`StreamingSession`]: the single in-flight generation
//! - [`Renderer`] / [`Markdown`]: injected view collaborators
//!
//! The controller talks to the worker only through
//! [`hearth_worker::WorkerPort`] and reacts to [`hearth_worker::WorkerEvent`]s
//! fed in by the caller's event loop.

mod controller;
mod errors;
mod render;
mod streaming;

pub use controller::{Banner, ControllerBuilder, SessionController};
pub use errors::{ControllerError, StreamError};
pub use render::{
    HtmlMarkdown, Markdown, MarkdownError, Renderer, escape_html, markdown_or_escaped,
    transcript_html,
};
pub use streaming::{Finished, StreamingSession};

pub use hearth_context::{ConversationStore, DisplayWindow, Retention, Turn, TurnAnnotation};
pub use hearth_types::{SessionState, Settings, SettingsChange, SettingsDraft, SubmitAffordance};

#[cfg(test)]
mod tests;
