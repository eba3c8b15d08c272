//! Conversation transcript and prompt-context management.
//!
//! The store keeps two views of one conversation:
//!
//! ```text
//! ConversationStore
//! ├── model: Vec<ChatMessage>   (bounded, role-alternating; prompt context)
//! └── display: Vec<Turn>        (what the renderer draws; may hold one streaming turn)
//! ```
//!
//! Streaming text is addressed by [`hearth_types::TurnId`], never by position.

mod history;
mod retention;
mod turn;

pub use history::{ConversationStore, StoreError};
pub use retention::{DEFAULT_WINDOW, DisplayWindow, Retention};
pub use turn::{Turn, TurnAnnotation};
