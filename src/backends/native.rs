use std::num::NonZeroU32;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use encoding_rs::UTF_8;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;
use once_cell::sync::OnceCell;

use super::{ChatMessage, ChatModel, ChatResponse, Seq2SeqModel};
use crate::config::BackendSettings;
use crate::error::{GenerationError, GenerationResult};

static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn llama_backend() -> anyhow::Result<&'static LlamaBackend> {
    LLAMA_BACKEND.get_or_try_init(|| LlamaBackend::init().context("init llama.cpp backend"))
}

pub struct NativeModel {
    name: String,
    max_output_tokens: usize,
    state: Mutex<NativeState>,
}

struct NativeState {
    model: Option<Box<LlamaModel>>,
    ctx: Option<LlamaContext<'static>>,
    template: LlamaChatTemplate,
}

// `LlamaContext` wraps a raw pointer and is not `Send`. The backend traits
// need `Send + Sync`.
// SAFETY: the context is only reached through the `NativeModel` mutex.
unsafe impl Send for NativeState {}

impl NativeModel {
    pub fn load(settings: &BackendSettings, max_output_tokens: usize) -> anyhow::Result<Self> {
        let name = settings.id.to_string();
        let model_path = settings
            .path
            .clone()
            .ok_or_else(|| anyhow!("{name}: no model path configured"))?;
        if !model_path.exists() {
            return Err(anyhow!("{name} model not found: {}", model_path.display()));
        }
        let backend = llama_backend()?;

        let mut model_params = LlamaModelParams::default();
        if settings.gpu_layers == -1 {
            // llama.cpp treats values above n_layer as "all layers".
            model_params = model_params.with_n_gpu_layers(9999);
        } else if settings.gpu_layers >= 0 {
            model_params = model_params.with_n_gpu_layers(settings.gpu_layers as u32);
        }

        tracing::info!(backend = %name, path = %model_path.display(), "loading native model");
        let model = Box::new(
            LlamaModel::load_from_file(backend, &model_path, &model_params)
                .with_context(|| format!("load model {}", model_path.display()))?,
        );
        // `LlamaContext` borrows `LlamaModel`; the model is boxed for a stable address.
        // SAFETY: `NativeState::drop` releases `ctx` before `model`.
        let model_ptr: *const LlamaModel = &*model;
        let model_ref: &'static LlamaModel = unsafe { &*model_ptr };

        let ctx_train = model_ref.n_ctx_train();
        let mut ctx_size = settings.ctx_size;
        if ctx_size == 0 || (ctx_train > 0 && ctx_size > ctx_train) {
            ctx_size = ctx_train.max(256);
        }
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(ctx_size))
            .with_n_batch(512)
            .with_n_ubatch(512);
        if settings.threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(settings.threads)
                .with_n_threads_batch(settings.threads);
        }
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .context("create model context")?;

        let template = match model_ref.chat_template(None) {
            Ok(t) => t,
            Err(_) => {
                let hint = settings.template_hint.as_deref().unwrap_or("chatml");
                LlamaChatTemplate::new(hint).context("build fallback chat template")?
            }
        };
        tracing::info!(backend = %name, ctx_size, ctx_train, "native model loaded");

        Ok(Self {
            name,
            max_output_tokens,
            state: Mutex::new(NativeState {
                model: Some(model),
                ctx: Some(ctx),
                template,
            }),
        })
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut NativeState) -> GenerationResult<T>,
    ) -> GenerationResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| GenerationError::Generate(format!("{}: model lock poisoned", self.name)))?;
        f(&mut state)
    }
}

impl NativeState {
    fn ctx(&mut self) -> GenerationResult<&mut LlamaContext<'static>> {
        self.ctx
            .as_mut()
            .ok_or_else(|| GenerationError::NotLoaded("native context".to_string()))
    }

    fn model(&self) -> GenerationResult<&LlamaModel> {
        self.model
            .as_deref()
            .ok_or_else(|| GenerationError::NotLoaded("native model".to_string()))
    }

    fn tokenize(&self, text: &str) -> GenerationResult<Vec<LlamaToken>> {
        self.model()?
            .str_to_token(text, decide_add_bos(text))
            .map_err(|e| GenerationError::Tokenize(e.to_string()))
    }

    /// Greedy decode after `prompt`, optionally starting from `forced`.
    fn generate(
        &mut self,
        name: &str,
        prompt: &[LlamaToken],
        max_tokens: usize,
        forced: Option<LlamaToken>,
    ) -> GenerationResult<Vec<LlamaToken>> {
        if prompt.is_empty() {
            return Err(GenerationError::Tokenize("empty prompt tokens".to_string()));
        }
        let ctx = self.ctx()?;
        ctx.clear_kv_cache();
        let n_ctx = ctx.n_ctx() as usize;
        let reserved = prompt.len() + 1 + usize::from(forced.is_some());
        if reserved >= n_ctx {
            return Err(GenerationError::Generate(format!(
                "prompt_too_long: prompt_tokens={} n_ctx={n_ctx}",
                prompt.len()
            )));
        }
        let max_tokens = max_tokens.min(n_ctx - reserved);
        let n_batch = (ctx.n_batch() as usize).max(1);

        let seeded = seed_tokens(prompt, forced);
        let last_index = seeded.len() - 1;
        let mut chunk_start = 0;
        while chunk_start < seeded.len() {
            let chunk_end = (chunk_start + n_batch).min(seeded.len());
            let mut batch = LlamaBatch::new(chunk_end - chunk_start, 1);
            for (pos, token) in seeded.iter().copied().enumerate().take(chunk_end).skip(chunk_start) {
                batch
                    .add(token, pos as i32, &[0], pos == last_index)
                    .map_err(|e| GenerationError::Generate(format!("batch.add(prompt): {e}")))?;
            }
            decode_checked(ctx, &mut batch, name, "decode prompt")?;
            chunk_start = chunk_end;
        }

        let mut sampler = LlamaSampler::greedy();
        let mut out = Vec::new();
        let mut batch = LlamaBatch::new(1, 1);
        let mut n_cur = seeded.len() as i32;
        for _ in 0..max_tokens {
            let token = sampler.sample(ctx, -1);
            sampler.accept(token);
            if ctx.model.is_eog_token(token) {
                break;
            }
            out.push(token);
            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| GenerationError::Generate(format!("batch.add(gen): {e}")))?;
            n_cur += 1;
            decode_checked(ctx, &mut batch, name, "decode(gen)")?;
        }
        Ok(out)
    }

    fn detokenize(&self, tokens: &[LlamaToken]) -> GenerationResult<String> {
        let model = self.model()?;
        let mut decoder = UTF_8.new_decoder();
        let mut out = String::new();
        for &token in tokens {
            // Plaintext renders control tokens (language markers, eos) as nothing.
            let bytes = model
                .token_to_bytes(token, Special::Plaintext)
                .map_err(|e| GenerationError::Decode(e.to_string()))?;
            let _ = decoder.decode_to_string(&bytes, &mut out, false);
        }
        let _ = decoder.decode_to_string(&[], &mut out, true);
        Ok(out.trim().to_string())
    }
}

impl Drop for NativeState {
    fn drop(&mut self) {
        let _ = self.ctx.take();
        let _ = self.model.take();
    }
}

/// Prompt tokens followed by the forced start token, if any.
fn seed_tokens(prompt: &[LlamaToken], forced: Option<LlamaToken>) -> Vec<LlamaToken> {
    let mut seeded = Vec::with_capacity(prompt.len() + 1);
    seeded.extend_from_slice(prompt);
    seeded.extend(forced);
    seeded
}

fn decode_checked(
    ctx: &mut LlamaContext<'static>,
    batch: &mut LlamaBatch,
    name: &str,
    stage: &str,
) -> GenerationResult<()> {
    ctx.decode(batch).map_err(|err| match err {
        DecodeError::Unknown(-2) => GenerationError::Generate(format!(
            "llama_decode threw a foreign exception (likely OOM) (model={name}, stage={stage})"
        )),
        other => GenerationError::Generate(other.to_string()),
    })
}

fn decide_add_bos(prompt: &str) -> AddBos {
    let p = prompt.trim_start();
    if p.starts_with("<s>")
        || p.starts_with("<|begin_of_text|>")
        || p.starts_with("<bos>")
        || p.starts_with("<|startoftext|>")
    {
        AddBos::Never
    } else {
        AddBos::Always
    }
}

fn to_token(id: u32) -> LlamaToken {
    LlamaToken::new(id as i32)
}

fn from_token(token: LlamaToken) -> u32 {
    token.0 as u32
}

impl Seq2SeqModel for NativeModel {
    fn tokenize(&self, text: &str, max_length: usize) -> GenerationResult<Vec<u32>> {
        self.with_state(|state| {
            let mut ids: Vec<u32> = state.tokenize(text)?.into_iter().map(from_token).collect();
            ids.truncate(max_length);
            Ok(ids)
        })
    }

    fn generate(
        &self,
        input: &[u32],
        max_output_length: usize,
        forced_start: Option<u32>,
    ) -> GenerationResult<Vec<u32>> {
        let prompt: Vec<LlamaToken> = input.iter().copied().map(to_token).collect();
        self.with_state(|state| {
            let generated =
                state.generate(&self.name, &prompt, max_output_length, forced_start.map(to_token))?;
            Ok(generated.into_iter().map(from_token).collect())
        })
    }

    fn decode(&self, ids: &[u32]) -> GenerationResult<String> {
        let tokens: Vec<LlamaToken> = ids.iter().copied().map(to_token).collect();
        self.with_state(|state| state.detokenize(&tokens))
    }

    fn token_id(&self, marker: &str) -> Option<u32> {
        let tokens = self
            .with_state(|state| {
                state
                    .model()?
                    .str_to_token(marker, AddBos::Never)
                    .map_err(|e| GenerationError::Tokenize(e.to_string()))
            })
            .ok()?;
        match tokens.as_slice() {
            [single] => Some(from_token(*single)),
            _ => None,
        }
    }
}

impl ChatModel for NativeModel {
    fn chat(&self, _model: &str, messages: &[ChatMessage]) -> GenerationResult<ChatResponse> {
        self.with_state(|state| {
            let chat = messages
                .iter()
                .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| GenerationError::Chat(format!("build chat message: {e}")))?;
            let prompt = state
                .model()?
                .apply_chat_template(&state.template, &chat, true)
                .map_err(|e| GenerationError::Chat(format!("apply chat template: {e}")))?;
            let tokens = state.tokenize(&prompt)?;
            let generated = state.generate(&self.name, &tokens, self.max_output_tokens, None)?;
            Ok(ChatResponse {
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: state.detokenize(&generated)?,
                },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bos_is_skipped_when_template_carries_one() {
        assert!(matches!(decide_add_bos("<|begin_of_text|>hi"), AddBos::Never));
        assert!(matches!(decide_add_bos("  <s>[INST]"), AddBos::Never));
        assert!(matches!(decide_add_bos("Traduire en breton:"), AddBos::Always));
    }

    #[test]
    fn token_ids_convert_both_ways() {
        assert_eq!(from_token(to_token(256_001)), 256_001);
    }

    #[test]
    fn forced_marker_is_fed_after_the_prompt() {
        let prompt = [to_token(1), to_token(42)];
        assert_eq!(
            seed_tokens(&prompt, Some(to_token(256_001))),
            vec![to_token(1), to_token(42), to_token(256_001)]
        );
        assert_eq!(seed_tokens(&prompt, None), prompt.to_vec());
    }

    #[test]
    fn load_requires_a_model_path() {
        let settings = BackendSettings::defaults_for(super::super::BackendId::Nllb);
        let err = NativeModel::load(&settings, 150).err().expect("no path");
        assert!(err.to_string().contains("no model path"));
    }
}
