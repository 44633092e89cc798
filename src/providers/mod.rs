//! Speech and language collaborators
//!
//! The orchestrator only talks to the three traits defined here. The HTTP
//! clients in the submodules are the reference implementations, configured
//! from [`crate::settings::ProviderConfig`].

mod chat;
mod speech;
mod whisper;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::history::Turn;
use crate::settings::ProviderConfig;

pub use chat::{ChatClient, CHAT_API_VERSION};
pub use speech::{SpeechClient, MAX_TTS_INPUT_CHARS};
pub use whisper::WhisperClient;

/// Language codes offered for transcription and replies
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("zh", "Mandarin Chinese"),
    ("ru", "Russian"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
];

/// Synthesis voices
pub const VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

/// Display name for a language code, if known.
pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Result of speech recognition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// True when the recognizer heard nothing usable.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptionError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Transcription API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse transcription response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Chat API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse chat response: {0}")]
    Parse(String),
    #[error("Generator returned an empty reply")]
    EmptyReply,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Speech API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Text too long for synthesis ({len} > {max} characters)")]
    TextTooLong { len: usize, max: usize },
    #[error("Synthesizer returned no audio")]
    EmptyAudio,
}

/// Speech-to-text
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>, language: &str)
        -> Result<Transcript, TranscriptionError>;
}

/// Reply generation. Stateless per call: all context is passed in.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        context: Vec<Turn>,
        user_text: &str,
        language: &str,
    ) -> Result<String, GenerationError>;
}

/// Text-to-speech, returning WAV bytes
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        language: &str,
    ) -> Result<Vec<u8>, SynthesisError>;
}

/// The three collaborators a turn needs.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl Collaborators {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            recognizer,
            generator,
            synthesizer,
        }
    }

    /// Build the HTTP clients from provider configuration.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            Arc::new(WhisperClient::new(&config.api_key, &config.whisper_url)),
            Arc::new(ChatClient::new(
                &config.api_key,
                &config.chat_url,
                &config.chat_model,
            )),
            Arc::new(SpeechClient::new(
                &config.api_key,
                &config.tts_url,
                &config.tts_model,
            )),
        )
    }
}

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead).
/// Timeouts are set per request.
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| Client::builder().build().unwrap_or_default())
}

/// API error body: `{"error": {"message": ...}}`
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Pull the message out of an API error body, falling back to the raw text.
fn api_error_message(body: String) -> String {
    match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body,
    }
}
