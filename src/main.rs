use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use voice_assistant::audio::{AudioCapture, AudioPlayer, CaptureEngine, DeviceRegistry, PlaybackEngine};
use voice_assistant::settings::{default_settings_path, load_settings};
use voice_assistant::{
    AssistantSettings, Collaborators, Orchestrator, OrchestratorConfig, ProviderConfig,
    SessionSnapshot, SessionStatus, TurnEvent,
};

const HELP: &str = "\
Commands:
  <Enter>  start / stop recording
  c        cancel recording
  p        replay last reply
  h        show history
  x        print history as JSON
  d        clear history
  s        show status
  m        show metrics
  w <file> save history to a file
  l <file> load history from a file
  q        quit";

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--list-devices") {
        list_devices();
        return;
    }

    let settings_path = args
        .iter()
        .position(|a| a == "--settings")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    log::info!("Using settings from {:?}", settings_path);
    let settings = load_settings(&settings_path);

    let capture = open_capture(&settings);
    let collaborators = ProviderConfig::from_env().map(|config| Collaborators::from_config(&config));
    if collaborators.is_none() {
        log::warn!("Speech services not configured; recording is disabled");
    }
    let player: Arc<dyn AudioPlayer> = Arc::new(PlaybackEngine::new());

    let (assistant, mut events) = Orchestrator::spawn(
        OrchestratorConfig::from_settings(&settings),
        capture,
        collaborators,
        player,
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let result = match line {
            "" => toggle(&assistant).await,
            "c" => assistant.cancel_recording().await,
            "p" => assistant.replay_last().await,
            "h" => show_history(&assistant).await,
            "x" => assistant
                .export_history()
                .await
                .map(|document| println!("{}", document)),
            "d" => assistant.clear_history().await,
            "s" => assistant.status().await.map(|snapshot| {
                println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
            }),
            "m" => assistant.metrics_summary().await.map(|summary| {
                println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
            }),
            "q" => break,
            _ if line.starts_with("w ") => {
                assistant.save_history(Path::new(line[2..].trim())).await
            }
            _ if line.starts_with("l ") => assistant
                .load_history(Path::new(line[2..].trim()))
                .await
                .map(|kept| println!("* loaded {} turns", kept)),
            _ => {
                println!("{}", HELP);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("! {}", e);
        }
    }

    if let Err(e) = assistant.shutdown().await {
        log::warn!("Shutdown: {}", e);
    }
}

fn list_devices() {
    match DeviceRegistry::new().list_input_devices() {
        Ok(devices) if devices.is_empty() => println!("No input devices found"),
        Ok(devices) => {
            for device in devices {
                println!("{}", device.label());
            }
        }
        Err(e) => eprintln!("Failed to list devices: {}", e),
    }
}

fn open_capture(settings: &AssistantSettings) -> Option<Box<dyn AudioCapture>> {
    let registry = DeviceRegistry::new();
    let device = match &settings.input_device {
        Some(name) => registry.find_by_name(name),
        None => registry.resolve_default(),
    };

    let opened = device.and_then(|device| {
        log::info!("Input device: {}", device.label());
        CaptureEngine::open(&device, settings.frame_samples)
    });

    match opened {
        Ok(engine) => Some(Box::new(engine)),
        Err(e) => {
            log::error!("Audio input unavailable: {}", e);
            None
        }
    }
}

async fn toggle(assistant: &Orchestrator) -> Result<(), voice_assistant::TurnError> {
    let snapshot = assistant.status().await?;
    // Reading the status clears a pending error, so show it here
    if let Some(error) = toggle_notice(&snapshot) {
        println!("! {}", error);
    }
    if snapshot.status == SessionStatus::Recording {
        assistant.stop_recording().await
    } else {
        assistant.start_recording().await
    }
}

fn toggle_notice(snapshot: &SessionSnapshot) -> Option<&str> {
    match (&snapshot.status, &snapshot.error) {
        (SessionStatus::Error, Some(error)) => Some(error.message.as_str()),
        _ => None,
    }
}

async fn show_history(assistant: &Orchestrator) -> Result<(), voice_assistant::TurnError> {
    let turns = assistant.history_snapshot().await?;
    if turns.is_empty() {
        println!("(no turns yet)");
    }
    for turn in turns {
        println!(
            "#{} [{}] {}\n  you: {}\n  assistant: {}",
            turn.sequence,
            turn.language,
            turn.timestamp.format("%H:%M:%S"),
            turn.user,
            turn.assistant
        );
    }
    Ok(())
}

fn print_event(event: &TurnEvent) {
    match event {
        TurnEvent::Status(snapshot) => match snapshot.status {
            SessionStatus::Recording => println!("* Recording... press Enter to stop"),
            SessionStatus::Error => {
                if let Some(error) = &snapshot.error {
                    println!("! {}", error.message);
                }
            }
            SessionStatus::Ready | SessionStatus::Processing => {}
        },
        TurnEvent::Stage { stage, .. } => println!("  {}", stage.description()),
        TurnEvent::TurnRecorded(turn) => {
            println!("you: {}\nassistant: {}", turn.user, turn.assistant)
        }
        TurnEvent::Completed { outcome, .. } => println!("* {}", outcome.summary()),
        TurnEvent::Failed { error, .. } => println!("! {}", error),
    }
}
