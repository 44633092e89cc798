//! Turn processing pipeline
//!
//! Runs the stages of one turn strictly in order: encode, transcribe,
//! generate, synthesize, persist, play. Each failure short-circuits the
//! remaining stages. The pipeline never touches session state directly; it
//! reports progress and its final result to the state loop as events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::wav::encode_frames;
use crate::audio::{persist_artifact, AudioError, AudioPlayer, Frame, PlaybackError};
use crate::history::{HistoryError, Turn};
use crate::providers::{Collaborators, GenerationError, SynthesisError, TranscriptionError};
use crate::state_machine::Event;

/// Orchestrator error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("Speech services are not configured")]
    NotConfigured,
    #[error(transparent)]
    Capture(#[from] AudioError),
    #[error("Failed to encode recording: {0}")]
    EncodeFailure(String),
    #[error("Transcription failed: {0}")]
    TranscriptionFailure(TranscriptionError),
    #[error("Reply generation failed: {0}")]
    GenerationFailure(GenerationError),
    #[error("Speech synthesis failed: {0}")]
    SynthesisFailure(SynthesisError),
    #[error("Failed to save reply audio: {0}")]
    PersistenceFailure(String),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error("A turn is being processed")]
    Busy,
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("The assistant has shut down")]
    Stopped,
    /// A processing task died without reporting
    #[error("Turn processing aborted: {0}")]
    Aborted(String),
}

impl TurnError {
    /// Short machine-readable category, e.g. for status displays
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::NotConfigured => "not_configured",
            TurnError::Capture(_) => "capture",
            TurnError::EncodeFailure(_) => "encode",
            TurnError::TranscriptionFailure(_) => "transcription",
            TurnError::GenerationFailure(_) => "generation",
            TurnError::SynthesisFailure(_) => "synthesis",
            TurnError::PersistenceFailure(_) => "persistence",
            TurnError::Playback(_) => "playback",
            TurnError::Busy => "busy",
            TurnError::History(_) => "history",
            TurnError::Stopped => "stopped",
            TurnError::Aborted(_) => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Encode,
    Transcribe,
    Generate,
    Synthesize,
    Persist,
    Play,
}

impl PipelineStage {
    /// Progress line for front ends
    pub fn description(&self) -> &'static str {
        match self {
            PipelineStage::Encode => "Encoding audio...",
            PipelineStage::Transcribe => "Transcribing audio...",
            PipelineStage::Generate => "Generating response...",
            PipelineStage::Synthesize => "Converting to speech...",
            PipelineStage::Persist => "Saving reply audio...",
            PipelineStage::Play => "Playing response...",
        }
    }
}

/// Non-error end of a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Capture produced no frames
    NoAudio,
    /// The recognizer returned blank text
    NoSpeech,
    Completed {
        artifact: PathBuf,
        reply: String,
        /// Playback failure on an otherwise successful turn
        warning: Option<PlaybackError>,
    },
}

impl TurnOutcome {
    pub fn summary(&self) -> String {
        match self {
            TurnOutcome::NoAudio => "no audio recorded".to_string(),
            TurnOutcome::NoSpeech => "no speech detected".to_string(),
            TurnOutcome::Completed { warning: None, .. } => "reply played".to_string(),
            TurnOutcome::Completed {
                warning: Some(w), ..
            } => format!("reply saved, playback failed: {}", w),
        }
    }
}

/// Per-stage durations in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub encode_ms: u64,
    pub transcription_ms: u64,
    pub generation_ms: u64,
    pub synthesis_ms: u64,
    pub playback_ms: u64,
}

/// Final result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub result: Result<TurnOutcome, TurnError>,
    pub timings: StageTimings,
}

/// Everything a processing task needs; nothing here is shared with the
/// state loop.
pub struct TurnJob {
    pub turn_id: Uuid,
    pub frames: Vec<Frame>,
    pub sample_rate: u32,
    pub language: String,
    pub voice: String,
    /// Generation context, copied when the turn was dispatched
    pub context: Vec<Turn>,
    pub output_dir: PathBuf,
    pub collaborators: Collaborators,
    pub player: Arc<dyn AudioPlayer>,
}

/// Run one turn to completion and report back to the state loop.
pub async fn run_turn(job: TurnJob, events: mpsc::Sender<Event>) {
    let turn_id = job.turn_id;
    let started = Instant::now();
    let mut timings = StageTimings::default();

    let result = execute(&job, &events, &mut timings).await;

    match &result {
        Ok(outcome) => log::info!(
            "Turn {} finished in {}ms: {}",
            turn_id,
            started.elapsed().as_millis(),
            outcome.summary()
        ),
        Err(e) => log::warn!(
            "Turn {} failed after {}ms: {}",
            turn_id,
            started.elapsed().as_millis(),
            e
        ),
    }

    let report = PipelineReport { result, timings };
    if events
        .send(Event::PipelineDone { id: turn_id, report })
        .await
        .is_err()
    {
        log::debug!("State loop gone, dropping report for turn {}", turn_id);
    }
}

async fn notify(events: &mpsc::Sender<Event>, id: Uuid, stage: PipelineStage) {
    log::debug!("Turn {}: {}", id, stage.description());
    let _ = events.send(Event::StageStarted { id, stage }).await;
}

fn encode_recording(frames: &[Frame], sample_rate: u32) -> Result<Vec<u8>, TurnError> {
    encode_frames(frames, sample_rate).map_err(encode_failure)
}

fn encode_failure(err: AudioError) -> TurnError {
    match err {
        AudioError::EncodeFailed(message) => TurnError::EncodeFailure(message),
        other => TurnError::EncodeFailure(other.to_string()),
    }
}

async fn save_reply(dir: PathBuf, audio: Vec<u8>) -> Result<PathBuf, TurnError> {
    match tokio::task::spawn_blocking(move || persist_artifact(&dir, &audio)).await {
        Ok(Ok(path)) => Ok(path),
        Ok(Err(e)) => Err(TurnError::PersistenceFailure(e.to_string())),
        Err(e) => Err(TurnError::PersistenceFailure(e.to_string())),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

async fn execute(
    job: &TurnJob,
    events: &mpsc::Sender<Event>,
    timings: &mut StageTimings,
) -> Result<TurnOutcome, TurnError> {
    let id = job.turn_id;

    // 1. Encode
    notify(events, id, PipelineStage::Encode).await;
    if job.frames.is_empty() {
        return Ok(TurnOutcome::NoAudio);
    }
    let started = Instant::now();
    let wav = encode_recording(&job.frames, job.sample_rate)?;
    timings.encode_ms = elapsed_ms(started);
    log::debug!(
        "Turn {}: encoded {} frames into {} bytes",
        id,
        job.frames.len(),
        wav.len()
    );

    // 2. Transcribe
    notify(events, id, PipelineStage::Transcribe).await;
    let started = Instant::now();
    let transcript = job
        .collaborators
        .recognizer
        .transcribe(wav, &job.language)
        .await
        .map_err(TurnError::TranscriptionFailure)?;
    timings.transcription_ms = elapsed_ms(started);

    if transcript.is_blank() {
        return Ok(TurnOutcome::NoSpeech);
    }
    let user_text = transcript.text.trim().to_string();

    // 3. Generate
    notify(events, id, PipelineStage::Generate).await;
    let started = Instant::now();
    let reply = job
        .collaborators
        .generator
        .generate(job.context.clone(), &user_text, &job.language)
        .await
        .map_err(TurnError::GenerationFailure)?;
    timings.generation_ms = elapsed_ms(started);

    let reply = reply.trim().to_string();
    if reply.is_empty() {
        return Err(TurnError::GenerationFailure(GenerationError::EmptyReply));
    }

    // The exchange is complete; record it before anything else can fail.
    let _ = events
        .send(Event::TurnRecorded {
            id,
            user: user_text,
            assistant: reply.clone(),
            language: job.language.clone(),
        })
        .await;

    // 4. Synthesize
    notify(events, id, PipelineStage::Synthesize).await;
    let started = Instant::now();
    let audio = job
        .collaborators
        .synthesizer
        .synthesize(&reply, &job.voice, &job.language)
        .await
        .map_err(TurnError::SynthesisFailure)?;
    timings.synthesis_ms = elapsed_ms(started);

    if audio.is_empty() {
        return Err(TurnError::SynthesisFailure(SynthesisError::EmptyAudio));
    }

    // 5. Persist + play
    notify(events, id, PipelineStage::Persist).await;
    let artifact = save_reply(job.output_dir.clone(), audio).await?;

    notify(events, id, PipelineStage::Play).await;
    let started = Instant::now();
    let player = job.player.clone();
    let path = artifact.clone();
    let warning = match tokio::task::spawn_blocking(move || player.play(&path)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            log::warn!("Turn {}: playback failed: {}", id, e);
            Some(e)
        }
        Err(e) => {
            log::error!("Turn {}: playback task panicked: {}", id, e);
            Some(PlaybackError::PlaybackFailure(e.to_string()))
        }
    };
    timings.playback_ms = elapsed_ms(started);

    Ok(TurnOutcome::Completed {
        artifact,
        reply,
        warning,
    })
}
