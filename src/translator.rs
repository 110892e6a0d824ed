use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::backends::{BackendDispatcher, BackendId};
use crate::config::{IndexSettings, Settings};
use crate::encoder::{EmbeddingEncoder, HttpEncoder};
use crate::error::ConfigError;
use crate::index::{IndexConnector, LoadedCollection, MilvusConnector, VectorIndexClient};
use crate::prompts::assemble_prompt;
use crate::retrieval::{Example, ExampleRetriever, RetrievalMode, RetrievalRequest};
use crate::textutil::log_preview;
use crate::trace::TraceWriter;

pub const DEFAULT_MAX_K: usize = 30;

/// How the prompt is augmented before generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssistMode {
    Default,
    FewShot,
    Rag,
}

impl AssistMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::FewShot => "few-shot",
            Self::Rag => "rag",
        }
    }

    /// The single retrieval this mode asks for with `k` examples.
    pub fn retrieval_request(self, text: &str, k: usize) -> RetrievalRequest {
        match self {
            Self::Default => RetrievalRequest::from_counts(text, 0, 0),
            Self::FewShot => RetrievalRequest::from_counts(text, 0, k),
            Self::Rag => RetrievalRequest::from_counts(text, k, 0),
        }
    }
}

impl fmt::Display for AssistMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssistMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" | "défaut" | "defaut" => Ok(Self::Default),
            "few-shot" | "few-shot learning" | "fewshot" | "prompt" => Ok(Self::FewShot),
            "rag" => Ok(Self::Rag),
            other => Err(format!(
                "unknown mode '{other}' (expected default, few-shot or rag)"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TranslationResult {
    pub prompt_sent: String,
    pub output_text: String,
    pub examples: Vec<Example>,
}

/// Startup-built collaborators shared by every request. Read-only once built.
pub struct TranslationContext {
    encoder: Option<Arc<dyn EmbeddingEncoder>>,
    collection: Option<LoadedCollection>,
    source_field: String,
    target_field: String,
}

impl TranslationContext {
    pub fn new(
        encoder: Option<Arc<dyn EmbeddingEncoder>>,
        collection: Option<LoadedCollection>,
        index: &IndexSettings,
    ) -> Self {
        Self {
            encoder,
            collection,
            source_field: index.source_field.clone(),
            target_field: index.target_field.clone(),
        }
    }

    /// Context with no retrieval; every augmented mode falls back.
    pub fn offline() -> Self {
        Self::new(None, None, &IndexSettings::default())
    }

    /// Load the HTTP encoder and connect to Milvus / Zilliz. Without index
    /// credentials neither is contacted.
    pub fn initialize(settings: &Settings) -> Self {
        if let Err(err) = settings.index.check() {
            return Self::unconfigured(&settings.index, &err);
        }
        let encoder = match HttpEncoder::load(settings.encoder.clone()) {
            Ok(encoder) => {
                tracing::info!(
                    encoder = encoder.name(),
                    dimension = encoder.embedding_dimension(),
                    "embedding encoder ready"
                );
                Some(Arc::new(encoder) as Arc<dyn EmbeddingEncoder>)
            }
            Err(err) => {
                tracing::warn!(error = %err, "embedding encoder unavailable");
                None
            }
        };
        let connector = MilvusConnector {
            request_timeout: settings.index.request_timeout,
        };
        Self::initialize_with(&settings.index, Box::new(connector), encoder)
    }

    fn unconfigured(index: &IndexSettings, err: &ConfigError) -> Self {
        tracing::warn!(error = %err, "vector index not configured; retrieval disabled");
        tracing::warn!("few-shot and rag modes unavailable; prompts will fall back");
        Self::new(None, None, index)
    }

    /// Startup with an explicit connector and an already-loaded encoder.
    pub fn initialize_with(
        index: &IndexSettings,
        connector: Box<dyn IndexConnector>,
        encoder: Option<Arc<dyn EmbeddingEncoder>>,
    ) -> Self {
        if let Err(err) = index.check() {
            return Self::unconfigured(index, &err);
        }
        let client = VectorIndexClient::new(index.clone(), connector);
        let collection = client.ensure_loaded(&index.collection, index.load_timeout);
        if let Some(collection) = collection.as_ref() {
            tracing::info!(collection = %collection.name(), "vector index ready");
        }
        let context = Self::new(encoder, collection, index);
        if !context.retrieval_ready() {
            tracing::warn!("few-shot and rag modes unavailable; prompts will fall back");
        }
        context
    }

    pub fn encoder(&self) -> Option<&dyn EmbeddingEncoder> {
        self.encoder.as_deref()
    }

    pub fn collection(&self) -> Option<&LoadedCollection> {
        self.collection.as_ref()
    }

    pub fn retrieval_ready(&self) -> bool {
        self.encoder.is_some() && self.collection.is_some()
    }

    pub fn retriever(&self) -> ExampleRetriever<'_> {
        ExampleRetriever::new(
            self.encoder(),
            self.collection(),
            &self.source_field,
            &self.target_field,
        )
    }
}

pub struct Translator {
    context: TranslationContext,
    dispatcher: BackendDispatcher,
    max_k: usize,
    trace: TraceWriter,
    requests: AtomicUsize,
}

impl Translator {
    pub fn new(context: TranslationContext, dispatcher: BackendDispatcher) -> Self {
        Self {
            context,
            dispatcher,
            max_k: DEFAULT_MAX_K,
            trace: TraceWriter::disabled(),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k;
        self
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = trace;
        self
    }

    /// Build everything from resolved settings: retrieval context, backends
    /// and the optional trace directory.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let context = TranslationContext::initialize(settings);
        let dispatcher = BackendDispatcher::from_settings(&settings.backends, settings.limits);
        let trace = TraceWriter::from_settings(&settings.trace)?;
        if trace.is_enabled() {
            tracing::info!(dir = %trace.dir().display(), "request traces enabled");
        }
        for id in BackendId::ALL {
            if !dispatcher.is_loaded(id) {
                tracing::warn!(backend = %id, "backend unavailable; requests will report an error");
            }
        }
        Ok(Self::new(context, dispatcher)
            .with_max_k(settings.max_k)
            .with_trace(trace))
    }

    pub fn context(&self) -> &TranslationContext {
        &self.context
    }

    pub fn clamp_k(&self, k: i64) -> usize {
        usize::try_from(k.max(0)).unwrap_or(usize::MAX).min(self.max_k)
    }

    pub fn translate(&self, text: &str, backend: &str, mode: AssistMode, k: i64) -> TranslationResult {
        let request_id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            request = request_id,
            backend,
            mode = %mode,
            k,
            text = %log_preview(text),
            "translation request"
        );

        let id = match backend.parse::<BackendId>() {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(request = request_id, backend, "unknown backend");
                return self.finalize(
                    request_id,
                    TranslationResult {
                        prompt_sent: text.to_string(),
                        output_text: err.to_string(),
                        examples: Vec::new(),
                    },
                );
            }
        };

        let request = mode.retrieval_request(text, self.clamp_k(k));
        if request.mode != RetrievalMode::None && !self.context.retrieval_ready() {
            tracing::warn!(
                request = request_id,
                mode = %mode,
                "retrieval unavailable; using fallback prompt"
            );
        }
        let outcome = self.context.retriever().retrieve(&request);
        let prompt = assemble_prompt(request.mode, &outcome, text, id.target());
        tracing::debug!(
            request = request_id,
            examples = outcome.examples.len(),
            prompt = %log_preview(&prompt),
            "prompt assembled"
        );

        let output_text = match self.dispatcher.dispatch(id, &prompt) {
            Ok(output) => {
                tracing::info!(
                    request = request_id,
                    backend = %id,
                    output = %log_preview(&output),
                    "translation done"
                );
                output
            }
            Err(err) => {
                tracing::error!(request = request_id, backend = %id, error = %err, "generation failed");
                format!("Error during generation: {err}")
            }
        };

        self.finalize(
            request_id,
            TranslationResult {
                prompt_sent: prompt,
                output_text,
                examples: outcome.examples,
            },
        )
    }

    fn finalize(&self, request_id: usize, result: TranslationResult) -> TranslationResult {
        for (kind, text) in [("prompt", &result.prompt_sent), ("output", &result.output_text)] {
            if let Err(err) = self.trace.write_request_text(request_id, kind, text) {
                tracing::warn!(request = request_id, error = %err, "failed to write trace file");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mode_aliases() {
        for (s, mode) in [
            ("default", AssistMode::Default),
            ("Défaut", AssistMode::Default),
            ("few-shot", AssistMode::FewShot),
            ("Few-shot learning", AssistMode::FewShot),
            ("fewshot", AssistMode::FewShot),
            ("prompt", AssistMode::FewShot),
            (" RAG ", AssistMode::Rag),
        ] {
            assert_eq!(s.parse::<AssistMode>(), Ok(mode), "{s}");
        }
        assert!("zero-shot".parse::<AssistMode>().is_err());
    }

    #[test]
    fn mode_maps_to_one_retrieval() {
        assert_eq!(
            AssistMode::Rag.retrieval_request("t", 3).mode,
            RetrievalMode::Similarity
        );
        assert_eq!(
            AssistMode::FewShot.retrieval_request("t", 3).mode,
            RetrievalMode::Random
        );
        assert_eq!(
            AssistMode::Default.retrieval_request("t", 3).mode,
            RetrievalMode::None
        );
        assert_eq!(AssistMode::Rag.retrieval_request("t", 0).mode, RetrievalMode::None);
    }

    #[test]
    fn k_is_clamped() {
        let t = Translator::new(
            TranslationContext::offline(),
            BackendDispatcher::default(),
        );
        assert_eq!(t.clamp_k(-4), 0);
        assert_eq!(t.clamp_k(5), 5);
        assert_eq!(t.clamp_k(1_000), DEFAULT_MAX_K);
        assert_eq!(t.with_max_k(3).clamp_k(10), 3);
    }

    #[test]
    fn unloaded_backend_yields_diagnostic() {
        let t = Translator::new(
            TranslationContext::offline(),
            BackendDispatcher::default(),
        );
        let result = t.translate("Bonjour", "nllb", AssistMode::Default, 0);
        assert_eq!(result.prompt_sent, "Traduire en breton:\n\nBonjour");
        assert_eq!(result.output_text, "Error during generation: backend nllb is not loaded");
        assert!(result.examples.is_empty());
    }

    #[test]
    fn trace_files_follow_request_numbers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let trace = TraceWriter::new(tmp.path().to_path_buf(), true).expect("trace");
        let t = Translator::new(
            TranslationContext::offline(),
            BackendDispatcher::default(),
        )
        .with_trace(trace);
        t.translate("Bonjour", "gpt", AssistMode::Default, 0);
        t.translate("Salut", "helsinki", AssistMode::Default, 0);
        let prompt =
            std::fs::read_to_string(tmp.path().join("req_000002.prompt.txt")).expect("prompt");
        assert_eq!(prompt, "Translate to English:\n\nSalut");
        let output =
            std::fs::read_to_string(tmp.path().join("req_000001.output.txt")).expect("output");
        assert_eq!(output, "Error: Model 'gpt' unknown.");
    }
}
