//! llama.cpp backend implementation
//!
//! This module encapsulates all llama.cpp-specific logic.

use crate::cancel::CancelToken;
use crate::llm::{ChatEngine, ChatRequest, EngineError, EngineLoader};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use paramgen_core::RuntimeSettings;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// llama.cpp can only be initialised once per process
static LLAMA_BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend(verbose: bool) -> Result<&'static LlamaBackend, EngineError> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        if !verbose {
            backend.void_logs();
        }
        Ok(backend)
    });
    result
        .as_ref()
        .map_err(|e| EngineError::Load(format!("llama.cpp backend init: {e}")))
}

fn gen_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Generation(e.to_string())
}

/// Loads GGUF models through llama.cpp
pub struct LlamaCppLoader {
    verbose: bool,
}

impl LlamaCppLoader {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EngineLoader for LlamaCppLoader {
    /// The generation loop checks the cancel token on every token.
    fn supports_abort(&self) -> bool {
        true
    }

    fn load(
        &self,
        model_path: &Path,
        settings: &RuntimeSettings,
    ) -> Result<Box<dyn ChatEngine>, EngineError> {
        Ok(Box::new(LlamaCppEngine::new(
            backend(self.verbose)?,
            model_path,
            settings,
        )?))
    }
}

/// A loaded model plus one reusable context
///
/// The context borrows the boxed model; the box keeps the model's address
/// stable and field order drops the context first.
pub struct LlamaCppEngine {
    context: LlamaContext<'static>,
    model: Box<LlamaModel>,
    template: LlamaChatTemplate,
    n_ctx: usize,
    n_batch: usize,
    cache_prompt: bool,
    /// Tokens currently held in sequence 0 of the KV cache
    cached: Vec<LlamaToken>,
}

// SAFETY: the context and model are only touched through `&mut self`, and
// callers serialize all access behind the inference lock.
unsafe impl Send for LlamaCppEngine {}

impl LlamaCppEngine {
    pub fn new(
        backend: &LlamaBackend,
        model_path: &Path,
        settings: &RuntimeSettings,
    ) -> Result<Self, EngineError> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(settings.n_gpu_layers);
        let model = Box::new(
            LlamaModel::load_from_file(backend, model_path, &model_params)
                .map_err(|e| EngineError::Load(e.to_string()))?,
        );

        let template = match model.chat_template(None) {
            Ok(template) => template,
            Err(_) => {
                warn!("model has no embedded chat template, falling back to chatml");
                LlamaChatTemplate::new("chatml").map_err(|e| EngineError::Load(e.to_string()))?
            }
        };

        let threads = settings.n_threads.max(1) as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(settings.n_ctx))
            .with_n_batch(settings.n_batch.max(1))
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let context = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::Load(e.to_string()))?;

        // SAFETY: the model is boxed so its address is stable, and it lives
        // in the same struct as the context, which is dropped first.
        let context =
            unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(context) };

        Ok(Self {
            context,
            model,
            template,
            n_ctx: settings.n_ctx as usize,
            n_batch: settings.n_batch.max(1) as usize,
            cache_prompt: settings.cache_prompt,
            cached: Vec::new(),
        })
    }

    fn render_prompt(&self, request: &ChatRequest<'_>) -> Result<String, EngineError> {
        let messages = request
            .messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(gen_err)?;
        self.model
            .apply_chat_template(&self.template, &messages, true)
            .map_err(gen_err)
    }

    fn build_sampler(&self, request: &ChatRequest<'_>) -> Result<LlamaSampler, EngineError> {
        let mut samplers = Vec::new();
        if let Some(grammar) = request.grammar {
            let sampler = LlamaSampler::grammar(&self.model, grammar, "root")
                .map_err(|e| EngineError::Grammar(e.to_string()))?;
            samplers.push(sampler);
        }
        samplers.push(LlamaSampler::top_p(request.top_p, 1));
        samplers.push(LlamaSampler::temp(request.temperature));
        samplers.push(LlamaSampler::dist(request.seed));
        Ok(LlamaSampler::chain_simple(samplers))
    }

    fn reset_cache(&mut self) {
        self.context.clear_kv_cache();
        self.cached.clear();
    }

    /// Bring the KV cache to `tokens`, reusing a shared prefix when allowed.
    ///
    /// Returns the batch index holding the logits of the last prompt token.
    fn ingest_prompt(
        &mut self,
        tokens: &[LlamaToken],
        batch: &mut LlamaBatch,
        abort: &CancelToken,
    ) -> Result<i32, EngineError> {
        let mut keep = if self.cache_prompt {
            self.cached
                .iter()
                .zip(tokens)
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            0
        };
        // The last prompt token is always decoded again to get fresh logits
        keep = keep.min(tokens.len() - 1);

        if keep == 0 {
            self.reset_cache();
        } else {
            self.context
                .clear_kv_cache_seq(Some(0), Some(keep as u32), None)
                .map_err(gen_err)?;
            self.cached.truncate(keep);
            debug!(reused = keep, "prompt cache hit");
        }

        let mut last_index = 0;
        for (chunk_no, chunk) in tokens[keep..].chunks(self.n_batch).enumerate() {
            if abort.is_canceled() {
                return Err(EngineError::Aborted);
            }
            batch.clear();
            let base = keep + chunk_no * self.n_batch;
            for (i, token) in chunk.iter().enumerate() {
                let is_last = base + i == tokens.len() - 1;
                batch
                    .add(*token, (base + i) as i32, &[0], is_last)
                    .map_err(gen_err)?;
            }
            self.context.decode(batch).map_err(gen_err)?;
            self.cached.extend_from_slice(chunk);
            last_index = chunk.len() as i32 - 1;
        }
        Ok(last_index)
    }

    fn generate(
        &mut self,
        request: &ChatRequest<'_>,
        abort: &CancelToken,
    ) -> Result<String, EngineError> {
        let prompt = self.render_prompt(request)?;
        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(gen_err)?;
        if tokens.is_empty() || tokens.len() >= self.n_ctx {
            return Err(EngineError::Generation(format!(
                "prompt has {} tokens, context holds {}",
                tokens.len(),
                self.n_ctx
            )));
        }

        let mut sampler = self.build_sampler(request)?;
        let mut batch = LlamaBatch::new(self.n_batch.max(1), 1);
        let mut logits_index = self.ingest_prompt(&tokens, &mut batch, abort)?;

        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output = String::new();
        let mut position = tokens.len();

        for _ in 0..request.max_tokens {
            if abort.is_canceled() {
                return Err(EngineError::Aborted);
            }
            if position >= self.n_ctx {
                break;
            }

            // `sample` also accepts the token into the chain (grammar state included)
            let token = sampler.sample(&self.context, logits_index);
            if self.model.is_eog_token(token) {
                break;
            }

            let piece = self
                .model
                .token_to_piece(token, &mut decoder, false, None)
                .map_err(gen_err)?;
            output.push_str(&piece);

            batch.clear();
            batch
                .add(token, position as i32, &[0], true)
                .map_err(gen_err)?;
            self.context.decode(&mut batch).map_err(gen_err)?;
            self.cached.push(token);
            position += 1;
            logits_index = 0;
        }

        Ok(output.trim().to_string())
    }
}

impl ChatEngine for LlamaCppEngine {
    fn complete(
        &mut self,
        request: &ChatRequest<'_>,
        abort: &CancelToken,
    ) -> Result<String, EngineError> {
        let result = self.generate(request, abort);
        if result.is_err() {
            self.reset_cache();
        }
        result
    }
}
