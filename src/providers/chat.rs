//! Chat completion client for reply generation
//!
//! Targets an Azure OpenAI deployment. Every call carries the full context
//! window as alternating user/assistant messages.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{api_error_message, http_client, language_name, GenerationError, ReplyGenerator};
use crate::history::Turn;

pub const CHAT_API_VERSION: &str = "2024-02-01";

const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOKENS: u32 = 500;
const TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatClient {
    api_key: String,
    url: String,
}

impl ChatClient {
    pub fn new(api_key: &str, base_url: &str, deployment: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            url: completions_url(base_url, deployment),
        }
    }
}

fn completions_url(base_url: &str, deployment: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        base_url.trim_end_matches('/'),
        deployment,
        CHAT_API_VERSION
    )
}

fn system_prompt(language: &str) -> String {
    let language = language_name(language).unwrap_or(language);
    format!(
        "You are a helpful voice assistant. Respond in {}. Keep replies conversational and brief enough to be spoken aloud.",
        language
    )
}

fn build_messages(context: &[Turn], user_text: &str, language: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.len() * 2 + 2);
    messages.push(ChatMessage {
        role: "system",
        content: system_prompt(language),
    });

    for turn in context {
        messages.push(ChatMessage {
            role: "user",
            content: turn.user.clone(),
        });
        messages.push(ChatMessage {
            role: "assistant",
            content: turn.assistant.clone(),
        });
    }

    messages.push(ChatMessage {
        role: "user",
        content: user_text.to_string(),
    });
    messages
}

#[async_trait]
impl ReplyGenerator for ChatClient {
    async fn generate(
        &self,
        context: Vec<Turn>,
        user_text: &str,
        language: &str,
    ) -> Result<String, GenerationError> {
        let request = ChatRequest {
            messages: build_messages(&context, user_text, language),
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        log::info!(
            "Generating reply ({} context turns, language={})",
            context.len(),
            language
        );

        let response = http_client()
            .post(&self.url)
            .header("api-key", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(GENERATION_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = api_error_message(response.text().await.unwrap_or_default());
            log::error!("Chat API error ({}): {}", status.as_u16(), message);
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;

        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();

        if reply.is_empty() {
            return Err(GenerationError::EmptyReply);
        }

        log::info!("Reply generated: {} chars", reply.len());
        Ok(reply)
    }
}
