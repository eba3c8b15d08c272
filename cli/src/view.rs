//! Line-oriented transcript output.
//!
//! The controller hands over full snapshots; this view prints only what is
//! new since the last one, so streamed fragments appear as they arrive.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use hearth_engine::{HtmlMarkdown, Renderer, SessionState, Turn, transcript_html};
use hearth_types::TurnId;

pub struct TerminalView {
    printed: Vec<(TurnId, String)>,
    line_open: bool,
    export: Option<HtmlExport>,
}

struct HtmlExport {
    path: PathBuf,
    markdown: HtmlMarkdown,
    latest: String,
}

impl TerminalView {
    pub fn new(html_path: Option<PathBuf>) -> Self {
        Self {
            printed: Vec::new(),
            line_open: false,
            export: html_path.map(|path| HtmlExport {
                path,
                markdown: HtmlMarkdown::default(),
                latest: String::new(),
            }),
        }
    }

    fn write_delta(&mut self, out: &mut impl Write, turns: &[Turn]) -> io::Result<()> {
        if turns.is_empty() && !self.printed.is_empty() {
            self.close_line(out)?;
            writeln!(out, "--- new conversation ---")?;
            self.printed.clear();
            return Ok(());
        }
        // Turns that fell out of the display window are forgotten.
        self.printed
            .retain(|(id, _)| turns.iter().any(|turn| turn.id() == *id));

        for turn in turns {
            let text = turn.display_text();
            match self.printed.iter().position(|(id, _)| *id == turn.id()) {
                Some(index) => {
                    let old = &self.printed[index].1;
                    if *old == text {
                        continue;
                    }
                    if let Some(suffix) = text.strip_prefix(old.as_str()) {
                        out.write_all(suffix.as_bytes())?;
                    } else {
                        self.close_line(out)?;
                        write!(out, "{}{text}", turn.role().display_prefix())?;
                    }
                    self.printed[index].1 = text.into_owned();
                }
                None => {
                    self.close_line(out)?;
                    write!(out, "{}{text}", turn.role().display_prefix())?;
                    self.printed.push((turn.id(), text.into_owned()));
                }
            }
            self.line_open = true;
        }
        out.flush()
    }

    fn close_line(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.line_open {
            writeln!(out)?;
            self.line_open = false;
        }
        Ok(())
    }
}

impl Renderer for TerminalView {
    fn render(&mut self, turns: &[Turn]) {
        let stdout = io::stdout();
        if let Err(err) = self.write_delta(&mut stdout.lock(), turns) {
            tracing::warn!("Failed to write transcript: {err}");
        }
        if let Some(export) = &mut self.export {
            export.latest = transcript_html(turns, &export.markdown);
        }
    }

    fn state_changed(&mut self, state: &SessionState) {
        if !matches!(state, SessionState::Ready) {
            return;
        }
        let stdout = io::stdout();
        let _ = self.close_line(&mut stdout.lock());
        if let Some(export) = &self.export
            && let Err(err) = fs::write(&export.path, &export.latest)
        {
            tracing::warn!(path = %export.path.display(), "Failed to export transcript: {err}");
        }
    }
}
