//! End-to-end tests for the turn orchestrator
//!
//! Capture, the three collaborators and playback are replaced with scripted
//! fakes; everything else (state loop, reducer, pipeline, history, artifact
//! persistence) is the real thing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use voice_assistant::audio::{AudioCapture, AudioError, AudioPlayer, Frame, PlaybackError};
use voice_assistant::history::Turn;
use voice_assistant::providers::{
    GenerationError, ReplyGenerator, SpeechRecognizer, SpeechSynthesizer, SynthesisError,
    Transcript, TranscriptionError,
};
use voice_assistant::{
    Collaborators, Orchestrator, OrchestratorConfig, PipelineStage, SessionStatus, TurnError,
    TurnEvent, TurnOutcome,
};

// ============================================================================
// Fakes
// ============================================================================

struct ScriptedCapture {
    frames: Vec<Frame>,
    capturing: bool,
}

impl ScriptedCapture {
    fn with_frames(count: usize) -> Self {
        let frames = (0..count)
            .map(|i| Frame::new(vec![(i as i16) * 100; 1024], 1, i as u64))
            .collect();
        Self {
            frames,
            capturing: false,
        }
    }
}

impl AudioCapture for ScriptedCapture {
    fn start_capture(&mut self) -> Result<(), AudioError> {
        if self.capturing {
            return Err(AudioError::AlreadyCapturing);
        }
        self.capturing = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> Vec<Frame> {
        if !std::mem::replace(&mut self.capturing, false) {
            return Vec::new();
        }
        self.frames.clone()
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn sample_rate(&self) -> u32 {
        16000
    }

    fn channels(&self) -> u16 {
        1
    }
}

struct FakeRecognizer {
    text: String,
    calls: Arc<AtomicUsize>,
    wav_bytes: Arc<AtomicUsize>,
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn transcribe(
        &self,
        wav: Vec<u8>,
        _language: &str,
    ) -> Result<Transcript, TranscriptionError> {
        assert_eq!(&wav[..4], b"RIFF");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.wav_bytes.store(wav.len(), Ordering::SeqCst);
        Ok(Transcript::new(self.text.clone()))
    }
}

struct FakeGenerator {
    reply: Result<String, GenerationError>,
    contexts: Arc<Mutex<Vec<Vec<Turn>>>>,
    gate: Option<Arc<Semaphore>>,
    panics: bool,
}

#[async_trait]
impl ReplyGenerator for FakeGenerator {
    async fn generate(
        &self,
        context: Vec<Turn>,
        _user_text: &str,
        _language: &str,
    ) -> Result<String, GenerationError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.contexts.lock().unwrap().push(context);
        if self.panics {
            panic!("generator blew up");
        }
        self.reply.clone()
    }
}

struct FakeSynthesizer {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &str,
        _language: &str,
    ) -> Result<Vec<u8>, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("RIFF{}", text).into_bytes())
    }
}

#[derive(Default)]
struct FakePlayer {
    played: Mutex<Vec<PathBuf>>,
    fail: bool,
}

impl AudioPlayer for FakePlayer {
    fn play(&self, path: &Path) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push(path.to_path_buf());
        if self.fail {
            return Err(PlaybackError::PlaybackFailure("no output device".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    assistant: Orchestrator,
    events: mpsc::Receiver<TurnEvent>,
    recognizer_calls: Arc<AtomicUsize>,
    /// Size of the last WAV handed to the recognizer
    wav_bytes: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<Vec<Turn>>>>,
    synthesizer_calls: Arc<AtomicUsize>,
    player: Arc<FakePlayer>,
    dir: tempfile::TempDir,
}

struct Setup {
    transcript: &'static str,
    reply: Result<String, GenerationError>,
    frames: usize,
    gate: Option<Arc<Semaphore>>,
    generator_panics: bool,
    player_fails: bool,
    configured: bool,
    has_device: bool,
    max_recording: Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            transcript: "hello",
            reply: Ok("hi there".to_string()),
            frames: 3,
            gate: None,
            generator_panics: false,
            player_fails: false,
            configured: true,
            has_device: true,
            max_recording: Duration::from_secs(60),
        }
    }
}

impl Setup {
    fn spawn(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let recognizer_calls = Arc::new(AtomicUsize::new(0));
        let wav_bytes = Arc::new(AtomicUsize::new(0));
        let contexts = Arc::new(Mutex::new(Vec::new()));
        let synthesizer_calls = Arc::new(AtomicUsize::new(0));
        let player = Arc::new(FakePlayer {
            played: Mutex::new(Vec::new()),
            fail: self.player_fails,
        });

        let collaborators = self.configured.then(|| {
            Collaborators::new(
                Arc::new(FakeRecognizer {
                    text: self.transcript.to_string(),
                    calls: recognizer_calls.clone(),
                    wav_bytes: wav_bytes.clone(),
                }),
                Arc::new(FakeGenerator {
                    reply: self.reply.clone(),
                    contexts: contexts.clone(),
                    gate: self.gate.clone(),
                    panics: self.generator_panics,
                }),
                Arc::new(FakeSynthesizer {
                    calls: synthesizer_calls.clone(),
                }),
            )
        });

        let capture: Option<Box<dyn AudioCapture>> = if self.has_device {
            Some(Box::new(ScriptedCapture::with_frames(self.frames)))
        } else {
            None
        };

        let config = OrchestratorConfig {
            language: "en".to_string(),
            voice: "alloy".to_string(),
            history_limit: 10,
            output_dir: dir.path().join("temp_audio"),
            max_recording: self.max_recording,
        };

        let (assistant, events) =
            Orchestrator::spawn(config, capture, collaborators, player.clone());

        Harness {
            assistant,
            events,
            recognizer_calls,
            wav_bytes,
            contexts,
            synthesizer_calls,
            player,
            dir,
        }
    }
}

impl Harness {
    async fn run_turn(&mut self) -> Result<TurnOutcome, TurnError> {
        self.assistant.start_recording().await.unwrap();
        self.assistant.stop_recording().await.unwrap();
        self.next_outcome().await
    }

    async fn next_outcome(&mut self) -> Result<TurnOutcome, TurnError> {
        let events = &mut self.events;
        timeout(Duration::from_secs(5), async move {
            while let Some(event) = events.recv().await {
                match event {
                    TurnEvent::Completed { outcome, .. } => return Ok(outcome),
                    TurnEvent::Failed { error, .. } => return Err(error),
                    _ => {}
                }
            }
            panic!("event channel closed");
        })
        .await
        .expect("turn did not finish in time")
    }

    async fn wait_for_stage(&mut self, wanted: PipelineStage) {
        let events = &mut self.events;
        timeout(Duration::from_secs(5), async move {
            while let Some(event) = events.recv().await {
                if let TurnEvent::Stage { stage, .. } = event {
                    if stage == wanted {
                        return;
                    }
                }
            }
            panic!("event channel closed");
        })
        .await
        .expect("stage never started")
    }

    async fn status(&self) -> SessionStatus {
        self.assistant.status().await.unwrap().status
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn completed_turn_records_history_and_plays_reply() {
    let mut h = Setup::default().spawn();

    let (artifact, reply, warning) = match h.run_turn().await.unwrap() {
        TurnOutcome::Completed {
            artifact,
            reply,
            warning,
        } => (artifact, reply, warning),
        other => panic!("expected a completed turn, got {:?}", other),
    };

    assert_eq!(reply, "hi there");
    assert!(warning.is_none());
    assert!(artifact.exists());
    assert!(artifact.starts_with(h.dir.path()));
    let name = artifact.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("response_") && name.ends_with(".wav"), "{}", name);
    assert_eq!(std::fs::read(&artifact).unwrap(), b"RIFFhi there");

    let history = h.assistant.history_snapshot().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user, "hello");
    assert_eq!(history[0].assistant, "hi there");
    assert_eq!(history[0].language, "en");

    let snapshot = h.assistant.status().await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Ready);
    assert_eq!(snapshot.last_artifact, Some(artifact.clone()));
    assert_eq!(snapshot.history_len, 1);
    assert_eq!(h.player.played.lock().unwrap().as_slice(), &[artifact]);

    assert_eq!(h.recognizer_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 1);
    // 3 mono frames of 1024 samples behind a 44 byte header
    assert_eq!(h.wav_bytes.load(Ordering::SeqCst), 44 + 3 * 1024 * 2);
}

#[tokio::test]
async fn second_turn_sees_first_as_context() {
    let mut h = Setup::default().spawn();

    h.run_turn().await.unwrap();
    h.run_turn().await.unwrap();

    let contexts = h.contexts.lock().unwrap().clone();
    assert_eq!(contexts.len(), 2);
    assert!(contexts[0].is_empty());
    assert_eq!(contexts[1].len(), 1);
    assert_eq!(contexts[1][0].user, "hello");

    let history = h.assistant.history_snapshot().await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].sequence < history[1].sequence);
}

#[tokio::test]
async fn generation_failure_surfaces_once_then_clears() {
    let mut h = Setup {
        reply: Err(GenerationError::Network("connection refused".to_string())),
        ..Default::default()
    }
    .spawn();

    let error = h.run_turn().await.unwrap_err();
    assert!(matches!(error, TurnError::GenerationFailure(_)));

    let first = h.assistant.status().await.unwrap();
    assert_eq!(first.status, SessionStatus::Error);
    assert_eq!(first.error.unwrap().kind, "generation");
    assert_eq!(first.last_artifact, None);

    assert_eq!(h.status().await, SessionStatus::Ready);
    assert!(h.assistant.history_snapshot().await.unwrap().is_empty());
    assert!(h.player.played.lock().unwrap().is_empty());
    assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blank_reply_is_a_generation_failure() {
    let mut h = Setup {
        reply: Ok("   ".to_string()),
        ..Default::default()
    }
    .spawn();

    let error = h.run_turn().await.unwrap_err();
    assert_eq!(
        error,
        TurnError::GenerationFailure(GenerationError::EmptyReply)
    );
    assert!(h.assistant.history_snapshot().await.unwrap().is_empty());
    assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blank_transcript_ends_turn_without_reply() {
    let mut h = Setup {
        transcript: "  ",
        ..Default::default()
    }
    .spawn();

    assert_eq!(h.run_turn().await.unwrap(), TurnOutcome::NoSpeech);
    assert!(h.contexts.lock().unwrap().is_empty());
    assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 0);
    assert!(h.assistant.history_snapshot().await.unwrap().is_empty());
    assert_eq!(h.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn panicking_collaborator_fails_the_turn_and_session_recovers() {
    let mut h = Setup {
        generator_panics: true,
        ..Default::default()
    }
    .spawn();

    let error = h.run_turn().await.unwrap_err();
    assert!(matches!(error, TurnError::Aborted(_)), "{:?}", error);

    let first = h.assistant.status().await.unwrap();
    assert_eq!(first.status, SessionStatus::Error);
    assert_eq!(first.error.unwrap().kind, "aborted");
    assert_eq!(h.status().await, SessionStatus::Ready);
    assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 0);
    let summary = h.assistant.metrics_summary().await.unwrap();
    assert_eq!(summary.failed_turns, 1);

    h.assistant.start_recording().await.unwrap();
    assert_eq!(h.status().await, SessionStatus::Recording);
}

#[tokio::test]
async fn empty_recording_skips_collaborators() {
    let mut h = Setup {
        frames: 0,
        ..Default::default()
    }
    .spawn();

    assert_eq!(h.run_turn().await.unwrap(), TurnOutcome::NoAudio);
    assert_eq!(h.recognizer_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn playback_failure_keeps_the_turn() {
    let mut h = Setup {
        player_fails: true,
        ..Default::default()
    }
    .spawn();

    let outcome = h.run_turn().await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Completed {
            warning: Some(PlaybackError::PlaybackFailure(_)),
            ..
        }
    ));
    assert_eq!(h.assistant.history_snapshot().await.unwrap().len(), 1);
    assert_eq!(h.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn cancel_discards_recording() {
    let h = Setup::default().spawn();

    h.assistant.start_recording().await.unwrap();
    assert_eq!(h.status().await, SessionStatus::Recording);

    h.assistant.cancel_recording().await.unwrap();
    assert_eq!(h.status().await, SessionStatus::Ready);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.recognizer_calls.load(Ordering::SeqCst), 0);
    assert!(h.assistant.history_snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_while_recording_is_a_no_op() {
    let h = Setup::default().spawn();

    h.assistant.start_recording().await.unwrap();
    let first = h.assistant.status().await.unwrap();
    h.assistant.start_recording().await.unwrap();
    let second = h.assistant.status().await.unwrap();

    assert_eq!(second.status, SessionStatus::Recording);
    assert_eq!(first.recording_started_at.is_some(), second.recording_started_at.is_some());
}

#[tokio::test]
async fn stop_while_ready_is_a_no_op() {
    let h = Setup::default().spawn();

    h.assistant.stop_recording().await.unwrap();
    assert_eq!(h.status().await, SessionStatus::Ready);
    assert_eq!(h.recognizer_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_without_services_is_rejected() {
    let h = Setup {
        configured: false,
        ..Default::default()
    }
    .spawn();

    assert_eq!(
        h.assistant.start_recording().await,
        Err(TurnError::NotConfigured)
    );
    assert_eq!(h.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn start_without_input_device_is_rejected() {
    let h = Setup {
        has_device: false,
        ..Default::default()
    }
    .spawn();

    assert_eq!(
        h.assistant.start_recording().await,
        Err(TurnError::Capture(AudioError::NoInputDevice))
    );
    assert_eq!(h.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn history_is_locked_while_processing() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = Setup {
        gate: Some(gate.clone()),
        ..Default::default()
    }
    .spawn();

    h.assistant.start_recording().await.unwrap();
    h.assistant.stop_recording().await.unwrap();
    h.wait_for_stage(PipelineStage::Generate).await;

    let snapshot = h.assistant.status().await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Processing);
    assert_eq!(snapshot.stage, Some(PipelineStage::Generate));

    assert_eq!(h.assistant.clear_history().await, Err(TurnError::Busy));
    assert_eq!(
        h.assistant.import_history("[]").await,
        Err(TurnError::Busy)
    );
    // Start during processing is ignored
    h.assistant.start_recording().await.unwrap();

    gate.add_permits(1);
    h.next_outcome().await.unwrap();

    assert_eq!(h.assistant.history_snapshot().await.unwrap().len(), 1);
    h.assistant.clear_history().await.unwrap();
    assert!(h.assistant.history_snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn replay_plays_last_artifact_again() {
    let mut h = Setup::default().spawn();

    assert!(matches!(
        h.assistant.replay_last().await,
        Err(TurnError::Playback(_))
    ));

    h.run_turn().await.unwrap();
    h.assistant.replay_last().await.unwrap();

    let played = h.player.played.lock().unwrap().clone();
    assert_eq!(played.len(), 2);
    assert_eq!(played[0], played[1]);
    assert_eq!(h.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn long_recording_stops_itself() {
    let mut h = Setup {
        max_recording: Duration::from_millis(200),
        ..Default::default()
    }
    .spawn();

    h.assistant.start_recording().await.unwrap();
    let outcome = h.next_outcome().await.unwrap();

    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert_eq!(h.recognizer_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn history_round_trips_through_a_file() {
    let mut h = Setup::default().spawn();
    h.run_turn().await.unwrap();

    let path = h.dir.path().join("exports").join("history.json");
    h.assistant.save_history(&path).await.unwrap();

    let other = Setup::default().spawn();
    assert_eq!(other.assistant.load_history(&path).await.unwrap(), 1);
    assert_eq!(
        other.assistant.last_turn().await.unwrap(),
        h.assistant.last_turn().await.unwrap()
    );

    let missing = other
        .assistant
        .load_history(&h.dir.path().join("missing.json"))
        .await;
    assert!(matches!(missing, Err(TurnError::History(_))));
}

#[tokio::test]
async fn metrics_count_turns() {
    let mut h = Setup::default().spawn();
    h.run_turn().await.unwrap();

    let summary = h.assistant.metrics_summary().await.unwrap();
    assert_eq!(summary.total_turns, 1);
    assert_eq!(summary.successful_turns, 1);
}

#[tokio::test]
async fn calls_after_shutdown_fail() {
    let h = Setup::default().spawn();
    h.assistant.start_recording().await.unwrap();
    h.assistant.shutdown().await.unwrap();

    assert_eq!(h.assistant.status().await.err(), Some(TurnError::Stopped));
}
