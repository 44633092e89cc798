//! Whisper transcription client
//!
//! Posts the utterance as multipart WAV to an Azure/OpenAI-compatible
//! transcription endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{api_error_message, http_client, SpeechRecognizer, Transcript, TranscriptionError};

const TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

pub struct WhisperClient {
    api_key: String,
    endpoint: String,
}

impl WhisperClient {
    pub fn new(api_key: &str, endpoint: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    fn form(wav: Vec<u8>, language: &str) -> Result<Form, TranscriptionError> {
        let file_part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Parse(e.to_string()))?;

        Ok(Form::new()
            .part("file", file_part)
            .text("language", language.to_string())
            .text("response_format", "json"))
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperClient {
    async fn transcribe(
        &self,
        wav: Vec<u8>,
        language: &str,
    ) -> Result<Transcript, TranscriptionError> {
        log::info!("Transcribing {} bytes of audio (language={})", wav.len(), language);

        let response = http_client()
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("api-key", &self.api_key)
            .timeout(TRANSCRIPTION_TIMEOUT)
            .multipart(Self::form(wav, language)?)
            .send()
            .await
            .map_err(|e| TranscriptionError::Network(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            let parsed: WhisperResponse = response
                .json()
                .await
                .map_err(|e| TranscriptionError::Parse(e.to_string()))?;

            log::info!("Transcription successful: {} chars", parsed.text.len());
            Ok(Transcript::new(parsed.text))
        } else {
            let message = api_error_message(response.text().await.unwrap_or_default());
            log::error!("Transcription API error ({}): {}", status.as_u16(), message);

            Err(TranscriptionError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parses_text_only() {
        let parsed: WhisperResponse =
            serde_json::from_str(r#"{"text": "hello there", "language": "en"}"#).unwrap();
        assert_eq!(parsed.text, "hello there");
    }

    #[test]
    fn test_form_builds() {
        assert!(WhisperClient::form(vec![0u8; 44], "en").is_ok());
    }
}
