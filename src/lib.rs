//! Voice conversation turns: record from the microphone, transcribe, generate
//! a reply, speak it, and keep a bounded history of the exchange.

pub mod audio;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod settings;
pub mod state_machine;

pub use history::{ConversationHistory, Turn};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, SessionError, SessionSnapshot, SessionStatus, TurnEvent,
};
pub use pipeline::{PipelineStage, TurnError, TurnOutcome};
pub use providers::Collaborators;
pub use settings::{AssistantSettings, ProviderConfig};
