use std::fmt;

use candle_transformers::generation::Sampling;
use indexmap::IndexMap;
use serde::Deserialize;

pub const NO_MEMORY_MARKER: &str = "No memories yet.";

/// User-tunable sampling values, the `[generation]` table of the config file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub repeat_last_n: usize,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: 1.1,
            repeat_last_n: 64,
            do_sample: true,
            seed: 299_792_458,
        }
    }
}

impl SamplingSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_new_tokens == 0 {
            return Err("max_new_tokens must be > 0".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be in [0.0, 2.0]".to_string());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err("top_p must be in (0.0, 1.0]".to_string());
        }
        if !(self.repetition_penalty > 0.0) {
            return Err("repetition_penalty must be > 0".to_string());
        }
        Ok(())
    }
}

/// End-of-sequence ids resolved from the loaded tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos: u32,
    pub eot: u32,
}

/// Frozen sampling policy shared by every generation call of a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPolicy {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub repeat_last_n: usize,
    pub do_sample: bool,
    pub seed: u64,
    pub pad_token_id: u32,
    pub stop_token_ids: Vec<u32>,
}

impl GenerationPolicy {
    pub fn new(settings: &SamplingSettings, special: SpecialTokens) -> Self {
        let mut stop_token_ids = vec![special.eos];
        if special.eot != special.eos {
            stop_token_ids.push(special.eot);
        }

        Self {
            max_new_tokens: settings.max_new_tokens,
            temperature: settings.temperature,
            top_p: settings.top_p,
            repetition_penalty: settings.repetition_penalty,
            repeat_last_n: settings.repeat_last_n,
            do_sample: settings.do_sample,
            seed: settings.seed,
            pad_token_id: special.eos,
            stop_token_ids,
        }
    }

    pub fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 1e-7 {
            Sampling::ArgMax
        } else if self.top_p < 1.0 {
            Sampling::TopP {
                p: self.top_p,
                temperature: self.temperature,
            }
        } else {
            Sampling::All {
                temperature: self.temperature,
            }
        }
    }

    pub fn is_stop_token(&self, token: u32) -> bool {
        self.stop_token_ids.contains(&token)
    }
}

/// Ordered label -> fact map supplied fresh with each turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryContext {
    facts: IndexMap<String, String>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-inserting an existing label keeps its position and replaces the fact.
    pub fn insert(&mut self, label: impl Into<String>, fact: impl Into<String>) -> Option<String> {
        self.facts.insert(label.into(), fact.into())
    }

    pub fn remove(&mut self, label: &str) -> Option<String> {
        self.facts.shift_remove(label)
    }

    pub fn clear(&mut self) {
        self.facts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.facts.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MemoryContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut memory = MemoryContext::new();
        for (label, fact) in iter {
            memory.insert(label, fact);
        }
        memory
    }
}

pub fn render_memory(memory: Option<&MemoryContext>) -> String {
    match memory {
        Some(memory) if !memory.is_empty() => memory
            .iter()
            .map(|(label, fact)| format!("- {}: {}", label, fact))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => NO_MEMORY_MARKER.to_string(),
    }
}

/// Call-scoped prompt: role setup, memory context and the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptEnvelope {
    role_setup: String,
    memory_context: String,
    current_turn: String,
}

impl PromptEnvelope {
    pub fn build(persona: &str, user_input: &str, memory: Option<&MemoryContext>) -> Self {
        Self {
            role_setup: persona.to_string(),
            memory_context: render_memory(memory),
            current_turn: format!("User: {}", user_input),
        }
    }

    pub fn role_setup(&self) -> &str {
        &self.role_setup
    }

    pub fn memory_context(&self) -> &str {
        &self.memory_context
    }

    pub fn current_turn(&self) -> &str {
        &self.current_turn
    }

    pub fn render(&self) -> String {
        format!(
            "[Persona]\n{}\n\n[Memory Context]\n{}\n\n[Current Turn]\n{}\nAssistant:",
            self.role_setup, self.memory_context, self.current_turn
        )
        .trim()
        .to_string()
    }
}

impl fmt::Display for PromptEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
