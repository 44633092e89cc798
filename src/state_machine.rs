//! Turn state machine
//!
//! This module implements the session state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects for the state loop to execute.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::AudioError;
use crate::pipeline::{PipelineReport, PipelineStage, TurnError};

/// Internal state of the turn workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Ready,
    Recording {
        turn_id: Uuid,
        started_at: Instant,
        max_duration: Duration,
    },
    Processing {
        turn_id: Uuid,
        stage: PipelineStage,
    },
    Error {
        error: TurnError,
    },
}

impl State {
    pub fn is_processing(&self) -> bool {
        matches!(self, State::Processing { .. })
    }

    fn turn_id(&self) -> Option<Uuid> {
        match self {
            State::Recording { turn_id, .. } | State::Processing { turn_id, .. } => Some(*turn_id),
            State::Ready | State::Error { .. } => None,
        }
    }
}

/// Events that can trigger state transitions.
/// Front-end commands, capture results, ticks and processing reports all
/// arrive here.
#[derive(Debug, Clone)]
pub enum Event {
    /// Front end asked to start recording
    StartRequested {
        configured: bool,
        max_duration: Duration,
    },
    /// Front end asked to stop recording and process the turn
    StopRequested,
    /// Front end asked to abandon the recording
    CancelRequested,
    /// A status snapshot was handed out
    StatusRead,
    /// Tick while recording (includes id to prevent stale ticks)
    RecordingTick {
        id: Uuid,
    },

    // Capture events
    CaptureStarted {
        id: Uuid,
    },
    CaptureFailed {
        id: Uuid,
        error: AudioError,
    },

    // Processing events
    StageStarted {
        id: Uuid,
        stage: PipelineStage,
    },
    /// Generation succeeded; the exchange is ready to be recorded
    TurnRecorded {
        id: Uuid,
        user: String,
        assistant: String,
        language: String,
    },
    PipelineDone {
        id: Uuid,
        report: PipelineReport,
    },
}

/// Effects to be executed by the state loop after a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    StartCapture {
        id: Uuid,
    },
    /// Detach the captured frames and dispatch the processing task
    ProcessTurn {
        id: Uuid,
    },
    DiscardCapture {
        id: Uuid,
    },
    /// Start sending RecordingTick events every second while recording
    StartRecordingTick {
        id: Uuid,
    },
    /// Fail the pending front-end request without changing anything else
    Reject(TurnError),
    RecordTurn {
        user: String,
        assistant: String,
        language: String,
    },
    PublishStage {
        id: Uuid,
        stage: PipelineStage,
    },
    PublishReport {
        id: Uuid,
        report: PipelineReport,
    },
    /// Publish the current session snapshot
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale turn IDs
/// - Always emit EmitStatus after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.turn_id();
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Ready / Error: a new turn may start
        // -----------------
        (Ready | Error { .. }, StartRequested { configured: false, .. }) => {
            (state.clone(), vec![Reject(TurnError::NotConfigured)])
        }
        (Ready | Error { .. }, StartRequested { max_duration, .. }) => {
            let id = Uuid::new_v4();
            (
                Recording {
                    turn_id: id,
                    started_at: Instant::now(),
                    max_duration,
                },
                vec![StartCapture { id }],
            )
        }
        (Error { .. }, StatusRead) => (Ready, vec![EmitStatus]),

        // -----------------
        // Recording
        // -----------------
        (Recording { turn_id, .. }, CaptureStarted { id }) if *turn_id == id => {
            (state.clone(), vec![StartRecordingTick { id }, EmitStatus])
        }
        (Recording { turn_id, .. }, CaptureFailed { id, error }) if *turn_id == id => {
            (Ready, vec![Reject(TurnError::Capture(error)), EmitStatus])
        }
        (Recording { turn_id, .. }, StopRequested) => (
            Processing {
                turn_id: *turn_id,
                stage: PipelineStage::Encode,
            },
            vec![ProcessTurn { id: *turn_id }, EmitStatus],
        ),
        // Cancel discards the frames and never runs the pipeline
        (Recording { turn_id, .. }, CancelRequested) => {
            (Ready, vec![DiscardCapture { id: *turn_id }, EmitStatus])
        }
        (
            Recording {
                turn_id,
                started_at,
                max_duration,
            },
            RecordingTick { id },
        ) if *turn_id == id => {
            let elapsed = started_at.elapsed();

            if elapsed >= *max_duration {
                log::warn!(
                    "Recording {} auto-stopped after {:?} (max duration reached)",
                    turn_id,
                    elapsed
                );
                (
                    Processing {
                        turn_id: *turn_id,
                        stage: PipelineStage::Encode,
                    },
                    vec![ProcessTurn { id: *turn_id }, EmitStatus],
                )
            } else {
                (state.clone(), vec![EmitStatus])
            }
        }

        // -----------------
        // Processing
        // -----------------
        (Processing { turn_id, .. }, StageStarted { id, stage }) if *turn_id == id => (
            Processing {
                turn_id: *turn_id,
                stage,
            },
            vec![PublishStage { id, stage }, EmitStatus],
        ),
        (
            Processing { turn_id, .. },
            TurnRecorded {
                id,
                user,
                assistant,
                language,
            },
        ) if *turn_id == id => (
            state.clone(),
            vec![RecordTurn {
                user,
                assistant,
                language,
            }],
        ),
        (Processing { turn_id, .. }, PipelineDone { id, report }) if *turn_id == id => {
            let next = match &report.result {
                Ok(_) => Ready,
                Err(error) => Error {
                    error: error.clone(),
                },
            };
            (next, vec![PublishReport { id, report }, EmitStatus])
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureStarted { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, RecordingTick { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, StageStarted { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, TurnRecorded { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, PipelineDone { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition (start/stop/cancel outside their states)
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
