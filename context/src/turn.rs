use std::borrow::Cow;

use hearth_types::{Role, TurnId};

/// Why a turn ended other than by normal completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAnnotation {
    /// The user stopped the generation.
    Interrupted,
    /// The generation exceeded its deadline.
    TimedOut,
    /// The generation failed; carries the reason.
    Failed(String),
}

/// One message of the display transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    id: TurnId,
    role: Role,
    text: String,
    complete: bool,
    annotation: Option<TurnAnnotation>,
}

impl Turn {
    pub(crate) fn user(id: TurnId, text: String) -> Self {
        Self {
            id,
            role: Role::User,
            text,
            complete: true,
            annotation: None,
        }
    }

    pub(crate) fn pending_assistant(id: TurnId) -> Self {
        Self {
            id,
            role: Role::Assistant,
            text: String::new(),
            complete: false,
            annotation: None,
        }
    }

    pub(crate) fn push_fragment(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    pub(crate) fn finish(&mut self, text: String, annotation: Option<TurnAnnotation>) {
        self.text = text;
        self.complete = true;
        self.annotation = annotation;
    }

    #[must_use]
    pub fn id(&self) -> TurnId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub fn annotation(&self) -> Option<&TurnAnnotation> {
        self.annotation.as_ref()
    }

    /// Text as shown to the user, including any end-of-turn annotation.
    #[must_use]
    pub fn display_text(&self) -> Cow<'_, str> {
        let note = match &self.annotation {
            None => return Cow::Borrowed(&self.text),
            Some(TurnAnnotation::Interrupted) => "[Interrupted]".to_string(),
            Some(TurnAnnotation::TimedOut) => "[Timed out]".to_string(),
            Some(TurnAnnotation::Failed(reason)) => {
                format!("[Error generating response: {reason}. Please try again.]")
            }
        };
        if self.text.is_empty() {
            Cow::Owned(note)
        } else {
            Cow::Owned(format!("{}\n\n{note}", self.text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_appends_annotation() {
        let mut turn = Turn::pending_assistant(TurnId::new(1));
        turn.finish("partial".to_string(), Some(TurnAnnotation::Interrupted));
        assert_eq!(turn.display_text(), "partial\n\n[Interrupted]");
    }

    #[test]
    fn display_text_without_partial_is_just_the_note() {
        let mut turn = Turn::pending_assistant(TurnId::new(1));
        turn.finish(String::new(), Some(TurnAnnotation::Failed("oom".to_string())));
        assert_eq!(
            turn.display_text(),
            "[Error generating response: oom. Please try again.]"
        );
    }

    #[test]
    fn plain_turn_borrows_text() {
        let turn = Turn::user(TurnId::new(0), "hi".to_string());
        assert!(matches!(turn.display_text(), Cow::Borrowed("hi")));
    }
}
