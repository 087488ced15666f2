mod cache;
mod outcome;
mod shared;

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use crate::error::{panic_detail, GenerationError, ProvisionError};
use crate::prompting::{GenerationPolicy, MemoryContext, PromptEnvelope};
use crate::provisioner::ModelProvisioner;

pub use cache::{CacheKeyScope, Fingerprint, ResponseCache};
pub use outcome::{TurnOutcome, GENERIC_FAILURE_REPLY, RESOURCE_EXHAUSTED_REPLY};
pub use shared::SharedResponder;

/// Something that turns a rendered prompt into new text.
pub trait TextGenerator {
    fn generate(
        &mut self,
        prompt: &str,
        policy: &GenerationPolicy,
        max_prompt_tokens: usize,
    ) -> Result<String, GenerationError>;

    /// Frees per-generation device memory after an out-of-memory failure.
    fn release_transient_memory(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub cache_capacity: usize,
    pub max_prompt_tokens: usize,
    pub cache_key: CacheKeyScope,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 100,
            max_prompt_tokens: 2048,
            cache_key: CacheKeyScope::InputOnly,
        }
    }
}

/// Persona-aware single-turn responder over one exclusively owned generator.
pub struct ResponseEngine<G = ModelProvisioner> {
    backend: G,
    policy: GenerationPolicy,
    persona: String,
    options: EngineOptions,
    cache: ResponseCache,
}

impl ResponseEngine<ModelProvisioner> {
    /// Loads the provisioner's model; a load failure is returned, not swallowed.
    pub fn new(
        mut provisioner: ModelProvisioner,
        persona: impl Into<String>,
        options: EngineOptions,
    ) -> Result<Self, ProvisionError> {
        provisioner.load_model()?;
        let policy = provisioner.generation_policy()?.clone();
        Ok(Self::with_backend(provisioner, policy, persona, options))
    }
}

impl<G: TextGenerator> ResponseEngine<G> {
    pub fn with_backend(
        backend: G,
        policy: GenerationPolicy,
        persona: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        let cache = ResponseCache::new(options.cache_capacity);
        debug!(
            cache_capacity = cache.capacity(),
            cache_key = ?options.cache_key,
            max_prompt_tokens = options.max_prompt_tokens,
            "response engine ready"
        );
        Self {
            backend,
            policy,
            persona: persona.into(),
            cache,
            options,
        }
    }

    pub fn build_prompt(&self, user_input: &str, memory: Option<&MemoryContext>) -> PromptEnvelope {
        PromptEnvelope::build(&self.persona, user_input, memory)
    }

    /// Plain-text reply for one turn. Never fails: internal errors become
    /// one of the two fixed apologies.
    pub fn generate_response(&mut self, user_input: &str, memory: Option<&MemoryContext>) -> String {
        self.respond(user_input, memory).into_text()
    }

    pub fn respond(&mut self, user_input: &str, memory: Option<&MemoryContext>) -> TurnOutcome {
        let key = Fingerprint::of_turn(user_input, memory, self.options.cache_key);
        if let Some(hit) = self.cache.get(&key) {
            debug!("response cache hit");
            return TurnOutcome::Cached(hit.to_string());
        }

        let prompt = self.build_prompt(user_input, memory).render();
        let max_prompt_tokens = self.options.max_prompt_tokens;
        let backend = &mut self.backend;
        let policy = &self.policy;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            backend.generate(&prompt, policy, max_prompt_tokens)
        }))
        .unwrap_or_else(|payload| {
            Err(GenerationError::Failed(anyhow::Error::msg(panic_detail(
                "generator",
                payload,
            ))))
        });

        match result {
            Ok(text) => {
                if self.cache.insert(key, text.clone()).is_some() {
                    debug!("evicted oldest cached response");
                }
                TurnOutcome::Generated(text)
            }
            Err(GenerationError::ResourceExhausted(detail)) => {
                warn!(detail = %detail, "device out of memory during generation, releasing transient memory");
                self.backend.release_transient_memory();
                TurnOutcome::ResourceExhausted
            }
            Err(GenerationError::Failed(err)) => {
                let detail = format!("{:#}", err);
                error!(error = %detail, "generation failed");
                TurnOutcome::Failed
            }
        }
    }

    /// Takes effect on the next prompt; cached replies from the old persona stay.
    pub fn update_persona(&mut self, persona: impl Into<String>) {
        self.persona = persona.into();
        info!("persona updated");
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn backend(&self) -> &G {
        &self.backend
    }
}
