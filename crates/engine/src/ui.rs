//! One-way user notification sink.
//!
//! Steps narrate progress through a [`Ui`]; the engine never reads from it
//! for control flow. Structured diagnostics go to `tracing` separately.

use std::sync::Mutex;

pub trait Ui: Send + Sync {
    /// Announces a new phase of work.
    fn say(&self, message: &str);
    /// Detail line under the current phase.
    fn message(&self, message: &str);
    fn error(&self, message: &str);
}

/// Writes to stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        println!("==> {message}");
    }

    fn message(&self, message: &str) {
        println!("    {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("==> {message}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLevel {
    Say,
    Message,
    Error,
}

/// Captures lines for later inspection.
#[derive(Debug, Default)]
pub struct RecordingUi {
    lines: Mutex<Vec<(UiLevel, String)>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(UiLevel, String)> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(level, _)| *level == UiLevel::Error)
            .map(|(_, line)| line)
            .collect()
    }

    /// True when any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, line)| line.contains(needle))
    }

    fn push(&self, level: UiLevel, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((level, message.to_string()));
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.push(UiLevel::Say, message);
    }

    fn message(&self, message: &str) {
        self.push(UiLevel::Message, message);
    }

    fn error(&self, message: &str) {
        self.push(UiLevel::Error, message);
    }
}
