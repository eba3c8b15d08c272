//! Rendering collaborators.
//!
//! The controller only knows [`Renderer`]. Turning assistant Markdown into
//! HTML is a pure function behind [`Markdown`]; [`HtmlMarkdown`] is the
//! default, and any failure degrades to escaped plain text.

use pulldown_cmark::{Event, Options, Parser, html};

use hearth_context::Turn;
use hearth_types::{Role, SessionState};

/// Receives the display transcript after every change. Must be idempotent:
/// the same snapshot may be delivered more than once.
pub trait Renderer {
    fn render(&mut self, turns: &[Turn]);

    /// Lifecycle notification; the default ignores it.
    fn state_changed(&mut self, _state: &SessionState) {}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkdownError {
    #[error("markdown input exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

pub trait Markdown {
    fn to_html(&self, text: &str) -> Result<String, MarkdownError>;
}

/// CommonMark + GFM extensions with hard line breaks.
#[derive(Debug, Clone, Copy)]
pub struct HtmlMarkdown {
    max_input_bytes: usize,
}

impl HtmlMarkdown {
    pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

    #[must_use]
    pub fn new(max_input_bytes: usize) -> Self {
        Self { max_input_bytes }
    }
}

impl Default for HtmlMarkdown {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_INPUT_BYTES)
    }
}

impl Markdown for HtmlMarkdown {
    fn to_html(&self, text: &str) -> Result<String, MarkdownError> {
        if text.len() > self.max_input_bytes {
            return Err(MarkdownError::TooLarge {
                limit: self.max_input_bytes,
            });
        }
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);

        // Model output may contain XML-like tags; never pass them through as markup.
        let events = Parser::new_ext(text, options).map(|event| match event {
            Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
            Event::SoftBreak => Event::HardBreak,
            other => other,
        });
        let mut out = String::with_capacity(text.len() * 3 / 2);
        html::push_html(&mut out, events);
        Ok(out)
    }
}

/// Markdown to HTML, falling back to escaped raw text.
#[must_use]
pub fn markdown_or_escaped(markdown: &dyn Markdown, text: &str) -> String {
    markdown.to_html(text).unwrap_or_else(|err| {
        tracing::warn!("Markdown rendering failed, showing raw text: {err}");
        format!("<p>{}</p>", escape_html(text))
    })
}

#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// One `<div>` per turn. User text is escaped; assistant text goes through
/// `markdown`.
#[must_use]
pub fn transcript_html(turns: &[Turn], markdown: &dyn Markdown) -> String {
    let mut out = String::new();
    for turn in turns {
        let (class, body) = match turn.role() {
            Role::User => ("user-message", escape_html(turn.text())),
            _ => ("model-message", markdown_or_escaped(markdown, &turn.display_text())),
        };
        out.push_str(&format!(
            "<div class=\"{class}\"><strong>{}</strong>{body}</div>\n",
            turn.role().display_prefix()
        ));
    }
    out
}
