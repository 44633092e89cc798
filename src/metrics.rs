//! Metrics collection for voice turns
//!
//! Tracks per-stage timing and outcomes for recording/processing cycles.
//! Used for diagnostics and performance monitoring.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::pipeline::StageTimings;

/// Maximum number of completed turns to retain in history
const MAX_TURN_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a completed turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub turn_id: String,
    /// Unix timestamp when recording started (seconds)
    pub started_at: u64,
    pub recording_duration_ms: u64,
    pub transcription_duration_ms: u64,
    pub generation_duration_ms: u64,
    pub synthesis_duration_ms: u64,
    pub playback_duration_ms: u64,
    /// From recording start to the end of processing
    pub total_turn_ms: u64,
    pub success: bool,
    /// Outcome label ("reply played", "no speech detected", ...) or error message
    pub detail: String,
}

/// Summary statistics across all recorded turns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_turns: u64,
    pub successful_turns: u64,
    pub failed_turns: u64,
    /// Averages across successful turns
    pub avg_recording_duration_ms: u64,
    pub avg_transcription_duration_ms: u64,
    pub avg_generation_duration_ms: u64,
    pub avg_synthesis_duration_ms: u64,
    pub avg_total_turn_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "capture", "transcription", "generation")
    pub error_type: String,
    pub message: String,
    pub turn_id: Option<String>,
}

/// Internal state for tracking an in-progress turn
struct TurnInProgress {
    turn_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    recording_duration: Option<Duration>,
}

impl TurnInProgress {
    fn new(turn_id: Uuid) -> Self {
        Self {
            turn_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            recording_duration: None,
        }
    }

    fn to_metrics(&self, timings: &StageTimings, success: bool, detail: String) -> TurnMetrics {
        TurnMetrics {
            turn_id: self.turn_id.to_string(),
            started_at: self.started_at_unix,
            recording_duration_ms: self
                .recording_duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            transcription_duration_ms: timings.transcription_ms,
            generation_duration_ms: timings.generation_ms,
            synthesis_duration_ms: timings.synthesis_ms,
            playback_duration_ms: timings.playback_ms,
            total_turn_ms: self.started_at.elapsed().as_millis() as u64,
            success,
            detail,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Collects and stores metrics for turns
pub struct MetricsCollector {
    /// History of completed turns (newest first)
    history: VecDeque<TurnMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current_turn: Option<TurnInProgress>,
    total_turns: u64,
    successful_turns: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_TURN_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_turn: None,
            total_turns: 0,
            successful_turns: 0,
        }
    }

    /// Start tracking a new turn when recording begins
    pub fn start_turn(&mut self, turn_id: Uuid) {
        if let Some(old) = self.current_turn.take() {
            log::warn!(
                "Metrics: discarding in-progress turn {} to start turn {}",
                old.turn_id,
                turn_id
            );
            let metrics = old.to_metrics(
                &StageTimings::default(),
                false,
                "Discarded: new turn started".to_string(),
            );
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting turn {}", turn_id);
        self.current_turn = Some(TurnInProgress::new(turn_id));
        self.total_turns += 1;
    }

    /// Mark that recording has stopped for the current turn
    pub fn recording_stopped(&mut self) {
        if let Some(ref mut turn) = self.current_turn {
            turn.recording_duration = Some(turn.started_at.elapsed());
            log::info!(
                "Metrics: recording stopped for turn {} - duration {:?}",
                turn.turn_id,
                turn.recording_duration
            );
        }
    }

    /// Mark the current turn as finished without error
    pub fn turn_completed(&mut self, timings: &StageTimings, outcome: String) {
        if let Some(turn) = self.current_turn.take() {
            let metrics = turn.to_metrics(timings, true, outcome);
            log::info!(
                "Metrics: turn {} completed - total {}ms (record {}ms, transcribe {}ms, generate {}ms, synthesize {}ms)",
                metrics.turn_id,
                metrics.total_turn_ms,
                metrics.recording_duration_ms,
                metrics.transcription_duration_ms,
                metrics.generation_duration_ms,
                metrics.synthesis_duration_ms
            );
            self.add_to_history(metrics);
            self.successful_turns += 1;
        }
    }

    /// Mark the current turn as failed
    pub fn turn_failed(&mut self, timings: &StageTimings, error_type: &str, error: String) {
        let turn_id = self.current_turn.as_ref().map(|t| t.turn_id.to_string());

        if let Some(turn) = self.current_turn.take() {
            let metrics = turn.to_metrics(timings, false, error.clone());
            log::warn!(
                "Metrics: turn {} failed after {}ms - {}",
                metrics.turn_id,
                metrics.total_turn_ms,
                error
            );
            self.add_to_history(metrics);
        }

        self.record_error(error_type.to_string(), error, turn_id);
    }

    /// Cancel the current turn without recording metrics
    pub fn turn_cancelled(&mut self) {
        if let Some(turn) = self.current_turn.take() {
            log::debug!("Metrics: turn {} cancelled", turn.turn_id);
            // Cancelled turns aren't counted
            self.total_turns = self.total_turns.saturating_sub(1);
        }
    }

    /// Record an error (not necessarily tied to a turn)
    pub fn record_error(&mut self, error_type: String, message: String, turn_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            turn_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|t| t.success).collect();
        let count = successful.len() as u64;
        let avg = |f: fn(&TurnMetrics) -> u64| -> u64 {
            if count == 0 {
                0
            } else {
                successful.iter().map(|&t| f(t)).sum::<u64>() / count
            }
        };

        MetricsSummary {
            total_turns: self.total_turns,
            successful_turns: self.successful_turns,
            failed_turns: self.total_turns.saturating_sub(self.successful_turns),
            avg_recording_duration_ms: avg(|t| t.recording_duration_ms),
            avg_transcription_duration_ms: avg(|t| t.transcription_duration_ms),
            avg_generation_duration_ms: avg(|t| t.generation_duration_ms),
            avg_synthesis_duration_ms: avg(|t| t.synthesis_duration_ms),
            avg_total_turn_ms: avg(|t| t.total_turn_ms),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Get the turn history (newest first)
    pub fn get_history(&self) -> Vec<TurnMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_turn(&self, turn_id: Uuid) -> bool {
        self.current_turn
            .as_ref()
            .map(|t| t.turn_id == turn_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: TurnMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_TURN_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
