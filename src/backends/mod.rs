#[cfg(feature = "native")]
pub mod native;
pub mod ollama;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{BackendSettings, GenerationLimits};
use crate::error::{GenerationError, GenerationResult, UnknownBackend};
use crate::prompts::{prompt_declares_direction, TargetLanguage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// NLLB-200, pinned to Breton with a forced language token.
    Nllb,
    /// Opus-MT French to English.
    Helsinki,
    /// Chat model served by Ollama.
    Llama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    FixedTargetSeq2Seq,
    Seq2Seq,
    Chat,
}

impl BackendId {
    pub const ALL: [BackendId; 3] = [BackendId::Nllb, BackendId::Helsinki, BackendId::Llama];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nllb => "nllb",
            Self::Helsinki => "helsinki",
            Self::Llama => "llama",
        }
    }

    pub fn kind(self) -> BackendKind {
        match self {
            Self::Nllb => BackendKind::FixedTargetSeq2Seq,
            Self::Helsinki => BackendKind::Seq2Seq,
            Self::Llama => BackendKind::Chat,
        }
    }

    pub fn target(self) -> TargetLanguage {
        match self {
            Self::Helsinki => TargetLanguage::English,
            Self::Nllb | Self::Llama => TargetLanguage::Breton,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Nllb => "facebook/nllb-200-distilled-600M",
            Self::Helsinki => "Helsinki-NLP/opus-mt-fr-en",
            Self::Llama => "llama3",
        }
    }

    pub fn default_target_marker(self) -> Option<&'static str> {
        match self {
            Self::Nllb => Some("bre_Latn"),
            Self::Helsinki | Self::Llama => None,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nllb" => Ok(Self::Nllb),
            "helsinki" => Ok(Self::Helsinki),
            "llama" => Ok(Self::Llama),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
}

/// Tokenizer + encoder-decoder model pair.
pub trait Seq2SeqModel: Send + Sync {
    /// Token ids for `text`, truncated to `max_length`.
    fn tokenize(&self, text: &str, max_length: usize) -> GenerationResult<Vec<u32>>;

    /// Generated ids only. `forced_start` is fed to the model as the first
    /// decoder token and is not part of the returned ids.
    fn generate(
        &self,
        input: &[u32],
        max_output_length: usize,
        forced_start: Option<u32>,
    ) -> GenerationResult<Vec<u32>>;

    /// Text for `ids` with special tokens skipped.
    fn decode(&self, ids: &[u32]) -> GenerationResult<String>;

    /// Vocabulary id of a language marker such as `bre_Latn`.
    fn token_id(&self, marker: &str) -> Option<u32>;
}

pub trait ChatModel: Send + Sync {
    fn chat(&self, model: &str, messages: &[ChatMessage]) -> GenerationResult<ChatResponse>;
}

/// A loaded backend, one variant per [`BackendKind`].
#[derive(Clone)]
pub enum Generator {
    FixedTargetSeq2Seq {
        model: Arc<dyn Seq2SeqModel>,
        target: TargetLanguage,
        target_marker: String,
    },
    Seq2Seq {
        model: Arc<dyn Seq2SeqModel>,
    },
    Chat {
        client: Arc<dyn ChatModel>,
        model_name: String,
    },
}

impl Generator {
    /// Seq2seq generator for `id`; falls back to the unconstrained variant
    /// when the backend has no fixed target or no marker is configured.
    pub fn seq2seq(
        id: BackendId,
        model: Arc<dyn Seq2SeqModel>,
        target_marker: Option<String>,
    ) -> Self {
        match (id.kind(), target_marker) {
            (BackendKind::FixedTargetSeq2Seq, Some(target_marker)) => Self::FixedTargetSeq2Seq {
                model,
                target: id.target(),
                target_marker,
            },
            _ => Self::Seq2Seq { model },
        }
    }

    pub fn chat(client: Arc<dyn ChatModel>, model_name: impl Into<String>) -> Self {
        Self::Chat {
            client,
            model_name: model_name.into(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::FixedTargetSeq2Seq { .. } => BackendKind::FixedTargetSeq2Seq,
            Self::Seq2Seq { .. } => BackendKind::Seq2Seq,
            Self::Chat { .. } => BackendKind::Chat,
        }
    }

    pub fn generate(&self, prompt: &str, limits: &GenerationLimits) -> GenerationResult<String> {
        match self {
            Self::FixedTargetSeq2Seq {
                model,
                target,
                target_marker,
            } => {
                let forced = if prompt_declares_direction(prompt, *target) {
                    None
                } else {
                    let id = model.token_id(target_marker);
                    if id.is_none() {
                        tracing::warn!(
                            marker = %target_marker,
                            "language marker not in vocabulary; generating without it"
                        );
                    }
                    id
                };
                run_seq2seq(model.as_ref(), prompt, limits, forced)
            }
            Self::Seq2Seq { model } => run_seq2seq(model.as_ref(), prompt, limits, None),
            Self::Chat { client, model_name } => {
                let response = client.chat(model_name, &[ChatMessage::user(prompt)])?;
                Ok(response.message.content)
            }
        }
    }
}

fn run_seq2seq(
    model: &dyn Seq2SeqModel,
    prompt: &str,
    limits: &GenerationLimits,
    forced_start: Option<u32>,
) -> GenerationResult<String> {
    let mut input = model.tokenize(prompt, limits.max_input_tokens)?;
    input.truncate(limits.max_input_tokens);
    if let Some(id) = forced_start {
        tracing::debug!(token = id, "forcing target language token");
    }
    let output = model.generate(&input, limits.max_output_tokens, forced_start)?;
    model.decode(&output)
}

/// Routes a backend id to its loaded [`Generator`].
#[derive(Clone, Default)]
pub struct BackendDispatcher {
    generators: HashMap<BackendId, Generator>,
    limits: GenerationLimits,
}

impl BackendDispatcher {
    pub fn new(limits: GenerationLimits) -> Self {
        Self {
            generators: HashMap::new(),
            limits,
        }
    }

    /// Register every backend that can be brought up from `backends`.
    /// Backends that cannot be loaded stay unregistered and report
    /// [`GenerationError::NotLoaded`] when dispatched.
    pub fn from_settings(backends: &[BackendSettings], limits: GenerationLimits) -> Self {
        let mut dispatcher = Self::new(limits);
        for settings in backends {
            match load_generator(settings, &limits) {
                Ok(Some(generator)) => dispatcher.register(settings.id, generator),
                Ok(None) => {
                    tracing::info!(backend = %settings.id, "backend not configured; left unloaded")
                }
                Err(err) => {
                    tracing::error!(backend = %settings.id, error = %err, "failed to load backend")
                }
            }
        }
        dispatcher
    }

    pub fn register(&mut self, id: BackendId, generator: Generator) {
        tracing::info!(backend = %id, kind = ?generator.kind(), "backend registered");
        self.generators.insert(id, generator);
    }

    pub fn is_loaded(&self, id: BackendId) -> bool {
        self.generators.contains_key(&id)
    }

    pub fn dispatch(&self, id: BackendId, prompt: &str) -> GenerationResult<String> {
        let generator = self
            .generators
            .get(&id)
            .ok_or_else(|| GenerationError::NotLoaded(id.to_string()))?;
        generator.generate(prompt, &self.limits)
    }
}

fn load_generator(
    settings: &BackendSettings,
    limits: &GenerationLimits,
) -> anyhow::Result<Option<Generator>> {
    if let Some(generator) = load_native(settings, limits)? {
        return Ok(Some(generator));
    }
    match settings.id.kind() {
        BackendKind::Chat => {
            let client = ollama::OllamaChat::new(&settings.endpoint, settings.timeout)?
                .with_max_output_tokens(limits.max_output_tokens);
            tracing::info!(
                backend = %settings.id,
                endpoint = %client.endpoint(),
                model = %settings.model,
                "using ollama chat backend"
            );
            Ok(Some(Generator::chat(Arc::new(client), settings.model.clone())))
        }
        BackendKind::FixedTargetSeq2Seq | BackendKind::Seq2Seq => Ok(None),
    }
}

#[cfg(feature = "native")]
fn load_native(
    settings: &BackendSettings,
    limits: &GenerationLimits,
) -> anyhow::Result<Option<Generator>> {
    if settings.path.is_none() {
        return Ok(None);
    }
    let model = Arc::new(native::NativeModel::load(settings, limits.max_output_tokens)?);
    Ok(Some(match settings.id.kind() {
        BackendKind::Chat => Generator::chat(model, settings.model.clone()),
        BackendKind::FixedTargetSeq2Seq | BackendKind::Seq2Seq => {
            Generator::seq2seq(settings.id, model, settings.target_marker.clone())
        }
    }))
}

#[cfg(not(feature = "native"))]
fn load_native(
    settings: &BackendSettings,
    _limits: &GenerationLimits,
) -> anyhow::Result<Option<Generator>> {
    if let Some(path) = settings.path.as_ref() {
        tracing::warn!(
            backend = %settings.id,
            path = %path.display(),
            "model path ignored: built without the `native` feature"
        );
    }
    Ok(None)
}
