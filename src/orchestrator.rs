//! Turn orchestrator
//!
//! [`Orchestrator`] is a cheap, cloneable handle to a single state loop task.
//! The loop is the only writer of the session state, the conversation
//! history and the capture device: front-end calls arrive as commands with a
//! oneshot reply, and processing tasks report back as [`Event`]s that go
//! through the reducer like everything else.

use std::collections::VecDeque;
use std::mem::discriminant;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::audio::{AudioCapture, AudioError, AudioPlayer, Frame, PlaybackError};
use crate::history::{ConversationHistory, HistorySummary, Turn};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::pipeline::{run_turn, PipelineReport, PipelineStage, TurnError, TurnJob, TurnOutcome};
use crate::providers::Collaborators;
use crate::settings::AssistantSettings;
use crate::state_machine::{reduce, Effect, Event, State};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const OUTBOUND_CHANNEL_CAPACITY: usize = 128;

/// Stopping joins the capture thread, so it happens off the state loop.
type SharedCapture = Arc<Mutex<Box<dyn AudioCapture>>>;

/// Per-session parameters, usually taken from [`AssistantSettings`]
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub language: String,
    pub voice: String,
    pub history_limit: usize,
    pub output_dir: PathBuf,
    pub max_recording: Duration,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &AssistantSettings) -> Self {
        Self {
            language: settings.language.clone(),
            voice: settings.voice.clone(),
            history_limit: settings.history_limit,
            output_dir: settings.output_dir.clone(),
            max_recording: Duration::from_secs(settings.max_recording_secs),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&AssistantSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ready,
    Recording,
    Processing,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionError {
    pub kind: String,
    pub message: String,
}

/// Read-only view of the session handed to front ends
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// Present iff recording
    pub recording_started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<u64>,
    /// Present iff processing
    pub stage: Option<PipelineStage>,
    /// Present iff in error; the read that returns it clears it
    pub error: Option<SessionError>,
    pub last_artifact: Option<PathBuf>,
    pub last_outcome: Option<String>,
    pub history_len: usize,
}

/// Notifications for the front end
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Status(SessionSnapshot),
    Stage { turn_id: Uuid, stage: PipelineStage },
    TurnRecorded(Turn),
    Completed { turn_id: Uuid, outcome: TurnOutcome },
    Failed { turn_id: Uuid, error: TurnError },
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start(Reply<Result<(), TurnError>>),
    Stop(Reply<Result<(), TurnError>>),
    Cancel(Reply<Result<(), TurnError>>),
    Status(Reply<SessionSnapshot>),
    LastTurn(Reply<Option<Turn>>),
    History(Reply<Vec<Turn>>),
    HistorySummary(Reply<HistorySummary>),
    ClearHistory(Reply<Result<(), TurnError>>),
    ExportHistory(Reply<Result<String, TurnError>>),
    ImportHistory(String, Reply<Result<usize, TurnError>>),
    SaveHistory(PathBuf, Reply<Result<(), TurnError>>),
    LoadHistory(PathBuf, Reply<Result<usize, TurnError>>),
    ReplayLast(Reply<Result<(), TurnError>>),
    Metrics(Reply<MetricsSummary>),
    Shutdown(Reply<()>),
}

/// Handle to a running state loop. Clones share the same session.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::Sender<Command>,
}

impl Orchestrator {
    /// Start the state loop on the current tokio runtime.
    ///
    /// `capture` is `None` when no input device could be opened; starting a
    /// recording then fails with a capture error. `collaborators` is `None`
    /// when the speech services are not configured.
    pub fn spawn(
        config: OrchestratorConfig,
        capture: Option<Box<dyn AudioCapture>>,
        collaborators: Option<Collaborators>,
        player: Arc<dyn AudioPlayer>,
    ) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let state_loop = StateLoop {
            state: State::default(),
            history: ConversationHistory::new(config.history_limit),
            config,
            capture: capture.map(|capture| Arc::new(Mutex::new(capture))),
            collaborators,
            player,
            metrics: MetricsCollector::new(),
            last_artifact: None,
            last_outcome: None,
            tick_cancel: None,
            events: event_tx,
            outbound: outbound_tx,
        };

        tokio::spawn(state_loop.run(command_rx, event_rx));

        (
            Self {
                commands: command_tx,
            },
            outbound_rx,
        )
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, TurnError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TurnError::Stopped)?;
        rx.await.map_err(|_| TurnError::Stopped)
    }

    /// Begin recording. A no-op while a turn is already recording or processing.
    pub async fn start_recording(&self) -> Result<(), TurnError> {
        self.request(Command::Start).await?
    }

    /// Stop recording and process the turn. A no-op unless recording.
    pub async fn stop_recording(&self) -> Result<(), TurnError> {
        self.request(Command::Stop).await?
    }

    /// Abandon the current recording without processing it.
    pub async fn cancel_recording(&self) -> Result<(), TurnError> {
        self.request(Command::Cancel).await?
    }

    pub async fn status(&self) -> Result<SessionSnapshot, TurnError> {
        self.request(Command::Status).await
    }

    pub async fn last_turn(&self) -> Result<Option<Turn>, TurnError> {
        self.request(Command::LastTurn).await
    }

    pub async fn history_snapshot(&self) -> Result<Vec<Turn>, TurnError> {
        self.request(Command::History).await
    }

    pub async fn history_summary(&self) -> Result<HistorySummary, TurnError> {
        self.request(Command::HistorySummary).await
    }

    pub async fn clear_history(&self) -> Result<(), TurnError> {
        self.request(Command::ClearHistory).await?
    }

    pub async fn export_history(&self) -> Result<String, TurnError> {
        self.request(Command::ExportHistory).await?
    }

    /// Replace the history with an exported document. Returns the number of
    /// turns kept.
    pub async fn import_history(&self, document: impl Into<String>) -> Result<usize, TurnError> {
        let document = document.into();
        self.request(|reply| Command::ImportHistory(document, reply))
            .await?
    }

    /// Write the exported history to `path`.
    pub async fn save_history(&self, path: &Path) -> Result<(), TurnError> {
        let path = path.to_path_buf();
        self.request(|reply| Command::SaveHistory(path, reply))
            .await?
    }

    /// Replace the history with the document stored at `path`.
    pub async fn load_history(&self, path: &Path) -> Result<usize, TurnError> {
        let path = path.to_path_buf();
        self.request(|reply| Command::LoadHistory(path, reply))
            .await?
    }

    /// Play the most recent reply again. Never changes the session status.
    pub async fn replay_last(&self) -> Result<(), TurnError> {
        self.request(Command::ReplayLast).await?
    }

    pub async fn metrics_summary(&self) -> Result<MetricsSummary, TurnError> {
        self.request(Command::Metrics).await
    }

    /// Stop the state loop, discarding any recording in progress.
    pub async fn shutdown(&self) -> Result<(), TurnError> {
        self.request(Command::Shutdown).await
    }
}

struct StateLoop {
    state: State,
    config: OrchestratorConfig,
    capture: Option<SharedCapture>,
    collaborators: Option<Collaborators>,
    player: Arc<dyn AudioPlayer>,
    history: ConversationHistory,
    metrics: MetricsCollector,
    last_artifact: Option<PathBuf>,
    last_outcome: Option<String>,
    /// Dropping this stops the recording tick task
    tick_cancel: Option<oneshot::Sender<()>>,
    events: mpsc::Sender<Event>,
    outbound: mpsc::Sender<TurnEvent>,
}

impl StateLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::Receiver<Event>) {
        log::info!("State loop started");
        self.run_effect(Effect::EmitStatus);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => {
                    let _ = self.dispatch(event);
                }
            }
        }

        log::info!("State loop ended");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.dispatch(Event::StartRequested {
                    configured: self.collaborators.is_some(),
                    max_duration: self.config.max_recording,
                });
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.dispatch(Event::StopRequested));
            }
            Command::Cancel(reply) => {
                let _ = reply.send(self.dispatch(Event::CancelRequested));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.snapshot());
                let _ = self.dispatch(Event::StatusRead);
            }
            Command::LastTurn(reply) => {
                let _ = reply.send(self.history.last().cloned());
            }
            Command::History(reply) => {
                let _ = reply.send(self.history.context_window());
            }
            Command::HistorySummary(reply) => {
                let _ = reply.send(self.history.summary());
            }
            Command::ClearHistory(reply) => {
                let result = self.ensure_not_processing().map(|()| {
                    self.history.clear();
                    log::info!("History cleared");
                });
                let _ = reply.send(result);
            }
            Command::ExportHistory(reply) => {
                let _ = reply.send(self.history.export().map_err(TurnError::from));
            }
            Command::ImportHistory(document, reply) => {
                let result = self
                    .ensure_not_processing()
                    .and_then(|()| self.history.import(&document).map_err(TurnError::from));
                let _ = reply.send(result);
            }
            Command::SaveHistory(path, reply) => {
                let _ = reply.send(self.history.save_to(&path).map_err(TurnError::from));
            }
            Command::LoadHistory(path, reply) => {
                let result = self
                    .ensure_not_processing()
                    .and_then(|()| self.history.load_from(&path).map_err(TurnError::from));
                let _ = reply.send(result);
            }
            Command::ReplayLast(reply) => self.replay_last(reply),
            Command::Metrics(reply) => {
                let _ = reply.send(self.metrics.get_summary());
            }
            Command::Shutdown(reply) => {
                // Handled in run(); kept for exhaustiveness
                let _ = reply.send(());
            }
        }
    }

    fn ensure_not_processing(&self) -> Result<(), TurnError> {
        if self.state.is_processing() {
            return Err(TurnError::Busy);
        }
        Ok(())
    }

    /// Feed an event through the reducer, running effects until no follow-up
    /// events remain. Returns the first rejection raised along the way.
    fn dispatch(&mut self, event: Event) -> Result<(), TurnError> {
        let mut pending = VecDeque::from([event]);
        let mut result = Ok(());

        while let Some(event) = pending.pop_front() {
            log::debug!("Received event: {:?}", event);

            let (next, effects) = reduce(&self.state, event);
            if discriminant(&self.state) != discriminant(&next) {
                log::info!(
                    "State transition: {} -> {}",
                    state_name(&self.state),
                    state_name(&next)
                );
            }
            self.state = next;

            for effect in effects {
                match effect {
                    Effect::Reject(error) => {
                        log::warn!("Request rejected: {}", error);
                        if result.is_ok() {
                            result = Err(error);
                        }
                    }
                    other => pending.extend(self.run_effect(other)),
                }
            }
        }

        result
    }

    fn run_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::StartCapture { id } => Some(self.start_capture(id)),
            Effect::ProcessTurn { id } => self.process_turn(id),
            Effect::DiscardCapture { id } => {
                self.stop_tick();
                if let Some(mut capture) = self.capture.as_ref().and_then(|c| c.lock().ok()) {
                    capture.discard_capture();
                }
                self.metrics.turn_cancelled();
                log::info!("Recording {} cancelled", id);
                None
            }
            Effect::StartRecordingTick { id } => {
                self.start_tick(id);
                None
            }
            Effect::RecordTurn {
                user,
                assistant,
                language,
            } => {
                let turn = Turn::new(self.history.next_sequence(), user, assistant, language);
                log::info!("Recorded turn #{}", turn.sequence);
                self.history.append(turn.clone());
                self.publish(TurnEvent::TurnRecorded(turn));
                None
            }
            Effect::PublishStage { id, stage } => {
                self.publish(TurnEvent::Stage { turn_id: id, stage });
                None
            }
            Effect::PublishReport { id, report } => {
                self.record_report(id, report);
                None
            }
            Effect::EmitStatus => {
                self.publish(TurnEvent::Status(self.snapshot()));
                None
            }
            Effect::Reject(_) => None,
        }
    }

    fn start_capture(&mut self, id: Uuid) -> Event {
        let Some(capture) = self.capture.as_ref() else {
            return Event::CaptureFailed {
                id,
                error: AudioError::NoInputDevice,
            };
        };

        let started = match capture.lock() {
            Ok(mut capture) => capture.start_capture(),
            Err(_) => Err(AudioError::DeviceUnavailable(
                "capture device lock poisoned".to_string(),
            )),
        };
        match started {
            Ok(()) => {
                self.metrics.start_turn(id);
                Event::CaptureStarted { id }
            }
            Err(error) => {
                self.metrics
                    .record_error("capture".to_string(), error.to_string(), Some(id.to_string()));
                Event::CaptureFailed { id, error }
            }
        }
    }

    fn process_turn(&mut self, id: Uuid) -> Option<Event> {
        self.stop_tick();
        self.metrics.recording_stopped();

        // Frames are filled in once the capture has been drained
        let job = self.collaborators.clone().map(|collaborators| TurnJob {
            turn_id: id,
            frames: Vec::new(),
            sample_rate: 0,
            language: self.config.language.clone(),
            voice: self.config.voice.clone(),
            context: self.history.context_window(),
            output_dir: self.config.output_dir.clone(),
            collaborators,
            player: self.player.clone(),
        });

        let capture = self.capture.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let (frames, sample_rate) = drain_capture(capture).await;

            let Some(mut job) = job else {
                log::warn!("Turn {}: dropping {} frames, services not configured", id, frames.len());
                let report = PipelineReport {
                    result: Err(TurnError::NotConfigured),
                    timings: Default::default(),
                };
                let _ = events.send(Event::PipelineDone { id, report }).await;
                return;
            };

            log::info!("Dispatching turn {} ({} frames)", id, frames.len());
            job.frames = frames;
            job.sample_rate = sample_rate;
            supervise_turn(job, events).await;
        });
        None
    }

    fn record_report(&mut self, id: Uuid, report: PipelineReport) {
        match report.result {
            Ok(outcome) => {
                if let TurnOutcome::Completed {
                    artifact, warning, ..
                } = &outcome
                {
                    self.last_artifact = Some(artifact.clone());
                    if let Some(warning) = warning {
                        self.metrics.record_error(
                            "playback".to_string(),
                            warning.to_string(),
                            Some(id.to_string()),
                        );
                    }
                }
                self.last_outcome = Some(outcome.summary());
                self.metrics.turn_completed(&report.timings, outcome.summary());
                self.publish(TurnEvent::Completed {
                    turn_id: id,
                    outcome,
                });
            }
            Err(error) => {
                self.last_outcome = None;
                self.metrics
                    .turn_failed(&report.timings, error.kind(), error.to_string());
                self.publish(TurnEvent::Failed { turn_id: id, error });
            }
        }
    }

    fn replay_last(&self, reply: Reply<Result<(), TurnError>>) {
        let Some(path) = self.last_artifact.clone() else {
            let _ = reply.send(Err(TurnError::Playback(PlaybackError::PlaybackFailure(
                "no reply to replay yet".to_string(),
            ))));
            return;
        };

        let player = self.player.clone();
        tokio::spawn(async move {
            log::info!("Replaying {:?}", path);
            let result = match tokio::task::spawn_blocking(move || player.play(&path)).await {
                Ok(played) => played.map_err(TurnError::Playback),
                Err(e) => Err(TurnError::Playback(PlaybackError::PlaybackFailure(
                    e.to_string(),
                ))),
            };
            let _ = reply.send(result);
        });
    }

    fn start_tick(&mut self, id: Uuid) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.tick_cancel = Some(cancel_tx);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        log::debug!("Recording tick stopping for {}", id);
                        break;
                    }
                    _ = interval.tick() => {
                        if events.send(Event::RecordingTick { id }).await.is_err() {
                            log::debug!("Recording tick stopping - channel closed");
                            break;
                        }
                    }
                }
            }
        });
    }

    fn stop_tick(&mut self) {
        self.tick_cancel = None;
    }

    fn shutdown(&mut self) {
        self.stop_tick();
        if let Some(mut capture) = self.capture.as_ref().and_then(|c| c.lock().ok()) {
            if capture.is_capturing() {
                log::info!("Discarding in-progress recording on shutdown");
                capture.discard_capture();
            }
        }
    }

    fn publish(&self, event: TurnEvent) {
        if let Err(e) = self.outbound.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!("Turn event channel full, dropping event")
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot {
            status: SessionStatus::Ready,
            recording_started_at: None,
            elapsed_secs: None,
            stage: None,
            error: None,
            last_artifact: self.last_artifact.clone(),
            last_outcome: self.last_outcome.clone(),
            history_len: self.history.len(),
        };

        match &self.state {
            State::Ready => {}
            State::Recording { started_at, .. } => {
                let elapsed = started_at.elapsed();
                snapshot.status = SessionStatus::Recording;
                snapshot.elapsed_secs = Some(elapsed.as_secs());
                snapshot.recording_started_at = chrono::Duration::from_std(elapsed)
                    .ok()
                    .map(|d| Utc::now() - d);
            }
            State::Processing { stage, .. } => {
                snapshot.status = SessionStatus::Processing;
                snapshot.stage = Some(*stage);
            }
            State::Error { error } => {
                snapshot.status = SessionStatus::Error;
                snapshot.error = Some(SessionError {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                });
            }
        }

        snapshot
    }
}

fn state_name(state: &State) -> &'static str {
    match state {
        State::Ready => "Ready",
        State::Recording { .. } => "Recording",
        State::Processing { .. } => "Processing",
        State::Error { .. } => "Error",
    }
}

/// Stop the capture on a blocking thread and take its frames.
async fn drain_capture(capture: Option<SharedCapture>) -> (Vec<Frame>, u32) {
    let Some(capture) = capture else {
        return (Vec::new(), 0);
    };

    let drained = tokio::task::spawn_blocking(move || match capture.lock() {
        Ok(mut capture) => (capture.stop_capture(), capture.sample_rate()),
        Err(_) => {
            log::error!("Capture device lock poisoned, no frames recovered");
            (Vec::new(), 0)
        }
    })
    .await;

    drained.unwrap_or_else(|e| {
        log::error!("Stopping capture failed: {}", e);
        (Vec::new(), 0)
    })
}

/// Run the pipeline in its own task so that a panic in a collaborator still
/// ends the turn with a report.
async fn supervise_turn(job: TurnJob, events: mpsc::Sender<Event>) {
    let id = job.turn_id;
    if let Err(e) = tokio::spawn(run_turn(job, events.clone())).await {
        log::error!("Turn {} processing task died: {}", id, e);
        let report = PipelineReport {
            result: Err(TurnError::Aborted(e.to_string())),
            timings: Default::default(),
        };
        let _ = events.send(Event::PipelineDone { id, report }).await;
    }
}
