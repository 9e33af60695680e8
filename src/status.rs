//! In-place status line for the operator terminal.
//!
//! "Waiting for capture signal" and the break countdown are redrawn in place with a
//! carriage return instead of flooding the log. Discrete events go through
//! `tracing` (see [`crate::logging`]).

use std::io::{IsTerminal, Write};

/// Single redrawable terminal line on stdout.
#[derive(Debug, Default)]
pub struct StatusLine {
    enabled: bool,
    last: String,
}

impl StatusLine {
    /// Status line that prints only when `enabled`.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last: String::new(),
        }
    }

    /// Enabled only when stdout is a terminal.
    pub fn for_stdout() -> Self {
        Self::new(std::io::stdout().is_terminal())
    }

    /// Status line that prints nothing.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Redraw the line if the text changed.
    pub fn show(&mut self, text: &str) {
        if !self.enabled || self.last == text {
            return;
        }
        let pad = self.last.chars().count().saturating_sub(text.chars().count());
        let mut out = std::io::stdout().lock();
        // Status output is best effort.
        let _ = write!(out, "\r{text}{}", " ".repeat(pad));
        let _ = out.flush();
        self.last = text.to_string();
    }

    /// End the line so following log output starts on a fresh one.
    pub fn finish(&mut self) {
        if self.enabled && !self.last.is_empty() {
            let _ = writeln!(std::io::stdout().lock());
        }
        self.last.clear();
    }

    /// Text currently displayed.
    pub fn current(&self) -> &str {
        &self.last
    }
}

/// `MM:SS` for a countdown (minutes are not wrapped at 60).
pub fn format_countdown(remaining: std::time::Duration) -> String {
    let secs = remaining.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
