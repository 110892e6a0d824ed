use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::{EncoderApi, EncoderSettings};
use crate::error::{EncoderError, EncoderResult};

pub trait EmbeddingEncoder: Send + Sync {
    fn encode(&self, text: &str) -> EncoderResult<Vec<f32>>;

    fn embedding_dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Encoder backed by an embedding HTTP service (Ollama or OpenAI-compatible).
#[derive(Debug)]
pub struct HttpEncoder {
    client: Client,
    settings: EncoderSettings,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedResponse {
    #[serde(default)]
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorPayload,
}

/// Ollama sends `{"error": "..."}`, OpenAI `{"error": {"message": "..."}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayload {
    Text(String),
    Object { message: String },
}

const DIMENSION_SAMPLE: &str = "dimension";

impl HttpEncoder {
    /// Build the client and query the service once to learn the dimension.
    pub fn load(settings: EncoderSettings) -> EncoderResult<Self> {
        tracing::info!(
            endpoint = %settings.endpoint,
            model = %settings.model,
            "loading embedding encoder"
        );
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = settings.api_key.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| EncoderError::Api(format!("invalid api key: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()?;

        let mut encoder = Self {
            client,
            settings,
            dimension: 0,
        };
        let sample = encoder.request(DIMENSION_SAMPLE)?;
        encoder.dimension = sample.len();
        tracing::info!(dimension = encoder.dimension, "embedding encoder loaded");
        Ok(encoder)
    }

    fn request(&self, text: &str) -> EncoderResult<Vec<f32>> {
        let builder = self.client.post(&self.settings.endpoint);
        let builder = match self.settings.api {
            EncoderApi::Ollama => builder.json(&OllamaEmbedRequest {
                model: &self.settings.model,
                input: [text],
            }),
            EncoderApi::OpenAi => builder.json(&OpenAiEmbedRequest {
                model: &self.settings.model,
                input: [text],
                encoding_format: "float",
            }),
        };
        let response = builder.send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(EncoderError::Api(error_message(status.as_u16(), &body)));
        }
        let vector = parse_embedding(self.settings.api, &body)?;
        if vector.is_empty() {
            return Err(EncoderError::Empty);
        }
        Ok(vector)
    }
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorPayload::Text(m),
        })
        | Ok(ErrorBody {
            error: ErrorPayload::Object { message: m },
        }) => format!("HTTP {status}: {m}"),
        Err(_) => format!("HTTP {status}: {body}"),
    }
}

fn parse_embedding(api: EncoderApi, body: &str) -> EncoderResult<Vec<f32>> {
    let first = match api {
        EncoderApi::Ollama => serde_json::from_str::<OllamaEmbedResponse>(body)
            .map_err(|e| EncoderError::Api(format!("parse response: {e}")))?
            .embeddings
            .into_iter()
            .next(),
        EncoderApi::OpenAi => serde_json::from_str::<OpenAiEmbedResponse>(body)
            .map_err(|e| EncoderError::Api(format!("parse response: {e}")))?
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding),
    };
    first.ok_or(EncoderError::Empty)
}

impl EmbeddingEncoder for HttpEncoder {
    fn encode(&self, text: &str) -> EncoderResult<Vec<f32>> {
        let vector = self.request(text)?;
        if vector.len() != self.dimension {
            return Err(EncoderError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(vector)
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.settings.model
    }
}
