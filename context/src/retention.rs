/// Prompt-history window, counted in entries (5 user/assistant pairs).
pub const DEFAULT_WINDOW: usize = 10;

/// How the display transcript is bounded relative to the prompt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayWindow {
    /// Truncate together with the prompt history, using the same window.
    #[default]
    Lockstep,
    /// Independent cap, in turns.
    Capped(usize),
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub model_window: usize,
    pub display: DisplayWindow,
}

impl Retention {
    #[must_use]
    pub fn new(model_window: usize, display: DisplayWindow) -> Self {
        Self {
            model_window: model_window.max(1),
            display,
        }
    }

    /// Display cap implied by a prompt window of `window` entries.
    #[must_use]
    pub fn display_cap(&self, window: usize) -> Option<usize> {
        match self.display {
            DisplayWindow::Lockstep => Some(window),
            DisplayWindow::Capped(cap) => Some(cap),
            DisplayWindow::Unbounded => None,
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DisplayWindow::Lockstep)
    }
}
