use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatModel, ChatResponse};
use crate::error::{GenerationError, GenerationResult};

pub struct OllamaChat {
    client: Client,
    endpoint: String,
    max_output_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl OllamaChat {
    pub fn new(endpoint: &str, timeout: Duration) -> GenerationResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            max_output_tokens: None,
        })
    }

    /// Cap generated tokens (`num_predict`).
    pub fn with_max_output_tokens(mut self, n: usize) -> Self {
        self.max_output_tokens = Some(n);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ChatModel for OllamaChat {
    fn chat(&self, model: &str, messages: &[ChatMessage]) -> GenerationResult<ChatResponse> {
        let url = format!("{}/api/chat", self.endpoint);
        tracing::debug!(url = %url, model, "chat request");
        let response = self
            .client
            .post(&url)
            .json(&ChatRequest {
                model,
                messages,
                stream: false,
                options: self
                    .max_output_tokens
                    .map(|num_predict| ChatOptions { num_predict }),
            })
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(GenerationError::Chat(error_message(status.as_u16(), &body)));
        }
        parse_chat_response(&body)
    }
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(e) => format!("HTTP {status}: {}", e.error),
        Err(_) => format!("HTTP {status}: {body}"),
    }
}

fn parse_chat_response(body: &str) -> GenerationResult<ChatResponse> {
    serde_json::from_str(body).map_err(|e| GenerationError::Chat(format!("parse response: {e}")))
}
