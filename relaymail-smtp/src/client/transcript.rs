//! Append-only record of a protocol session.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Client,
    Server,
    /// Local progress or error notes that never crossed the wire.
    Note,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub direction: Direction,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    /// `C: ...`, `S: ...`, or the bare note.
    #[must_use]
    pub fn render(&self) -> String {
        match self.direction {
            Direction::Client => format!("C: {}", self.line),
            Direction::Server => format!("S: {}", self.line),
            Direction::Note => self.line.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(&mut self, direction: Direction, line: impl Into<String>) {
        self.entries.push(TranscriptEntry {
            direction,
            line: line.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn client(&mut self, line: impl Into<String>) {
        self.push(Direction::Client, line);
    }

    pub fn server(&mut self, line: impl Into<String>) {
        self.push(Direction::Server, line);
    }

    pub fn note(&mut self, line: impl Into<String>) {
        self.push(Direction::Note, line);
    }

    pub fn error(&mut self, error: &impl std::fmt::Display) {
        self.push(Direction::Note, format!("ERROR: {error}"));
    }

    #[must_use]
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    #[must_use]
    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The transcript as operator-facing log lines.
    #[must_use]
    pub fn log_lines(&self) -> Vec<String> {
        self.entries.iter().map(TranscriptEntry::render).collect()
    }
}
