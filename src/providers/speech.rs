//! Text-to-speech client
//!
//! Requests 16 kHz mono PCM WAV so the reply can be stored and played as is.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{api_error_message, http_client, SpeechSynthesizer, SynthesisError};

/// Longest input the speech endpoint accepts
pub const MAX_TTS_INPUT_CHARS: usize = 4096;

const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_FORMAT: &str = "riff-16khz-16bit-mono-pcm";

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    language: &'a str,
    output_format: &'a str,
}

pub struct SpeechClient {
    api_key: String,
    endpoint: String,
    model: String,
}

impl SpeechClient {
    pub fn new(api_key: &str, endpoint: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

fn check_length(text: &str) -> Result<(), SynthesisError> {
    let len = text.chars().count();
    if len > MAX_TTS_INPUT_CHARS {
        return Err(SynthesisError::TextTooLong {
            len,
            max: MAX_TTS_INPUT_CHARS,
        });
    }
    Ok(())
}

#[async_trait]
impl SpeechSynthesizer for SpeechClient {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        language: &str,
    ) -> Result<Vec<u8>, SynthesisError> {
        check_length(text)?;

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            language,
            output_format: OUTPUT_FORMAT,
        };

        log::info!("Synthesizing {} chars (voice={})", text.len(), voice);

        let response = http_client()
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "audio/wav")
            .timeout(SYNTHESIS_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = api_error_message(response.text().await.unwrap_or_default());
            log::error!("Speech API error ({}): {}", status.as_u16(), message);
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }

        log::info!("Synthesis successful: {} bytes", audio.len());
        Ok(audio.to_vec())
    }
}
