//! Bounded conversation history
//!
//! Completed exchanges are kept oldest-first and capped at a fixed number of
//! turns. The generator receives an owned copy of the window, never a
//! reference into the log.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of turns kept as generation context
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Malformed history document: {0}")]
    ParseError(String),
    #[error("History file error: {0}")]
    Io(String),
}

/// One user utterance and the reply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub assistant: String,
    pub language: String,
}

impl Turn {
    pub fn new(
        sequence: u64,
        user: impl Into<String>,
        assistant: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            user: user.into(),
            assistant: assistant.into(),
            language: language.into(),
        }
    }
}

/// Statistics over the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub turns: usize,
    /// Distinct language codes, sorted
    pub languages: Vec<String>,
    /// Seconds between the first and last turn
    pub span_secs: i64,
}

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<Turn>,
    limit: usize,
    next_sequence: u64,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ConversationHistory {
    /// Create an empty history holding at most `limit` turns (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            turns: VecDeque::with_capacity(limit),
            limit,
            next_sequence: 0,
        }
    }

    /// Sequence number for the next turn to be recorded.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Record a turn, evicting the oldest entries past the limit.
    pub fn append(&mut self, turn: Turn) {
        self.next_sequence = self.next_sequence.max(turn.sequence.saturating_add(1));
        self.turns.push_back(turn);
        while self.turns.len() > self.limit {
            if let Some(evicted) = self.turns.pop_front() {
                log::debug!("History full, evicted turn #{}", evicted.sequence);
            }
        }
    }

    /// Oldest-first copy of the current window.
    pub fn context_window(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Pretty JSON array of turns, oldest-first.
    pub fn export(&self) -> Result<String, HistoryError> {
        serde_json::to_string_pretty(&self.turns).map_err(|e| HistoryError::ParseError(e.to_string()))
    }

    /// Replace the whole history with a previously exported document.
    ///
    /// The document is fully parsed before anything changes; on error the
    /// current history is untouched. Only the most recent `limit` turns of a
    /// longer document are kept. Returns the number of turns kept.
    pub fn import(&mut self, document: &str) -> Result<usize, HistoryError> {
        let mut turns: VecDeque<Turn> =
            serde_json::from_str(document).map_err(|e| HistoryError::ParseError(e.to_string()))?;

        let excess = turns.len().saturating_sub(self.limit);
        turns.drain(..excess);

        let max_sequence = turns.iter().map(|t| t.sequence.saturating_add(1)).max().unwrap_or(0);
        self.next_sequence = self.next_sequence.max(max_sequence);
        self.turns = turns;

        log::info!("Imported {} turns into history", self.turns.len());
        Ok(self.turns.len())
    }

    /// Export to a file.
    pub fn save_to(&self, path: &Path) -> Result<(), HistoryError> {
        let document = self.export()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HistoryError::Io(e.to_string()))?;
        }
        std::fs::write(path, document).map_err(|e| HistoryError::Io(e.to_string()))?;
        log::info!("History exported to {:?}", path);
        Ok(())
    }

    /// Import from a file. A missing or unreadable file leaves the history untouched.
    pub fn load_from(&mut self, path: &Path) -> Result<usize, HistoryError> {
        let document = std::fs::read_to_string(path).map_err(|e| HistoryError::Io(e.to_string()))?;
        self.import(&document)
    }

    pub fn summary(&self) -> HistorySummary {
        let languages: BTreeSet<&str> = self.turns.iter().map(|t| t.language.as_str()).collect();
        let span_secs = match (self.turns.front(), self.turns.back()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_seconds(),
            _ => 0,
        };

        HistorySummary {
            turns: self.turns.len(),
            languages: languages.into_iter().map(str::to_string).collect(),
            span_secs,
        }
    }
}
