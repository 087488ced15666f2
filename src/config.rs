use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::prompting::SamplingSettings;
use crate::responder::{CacheKeyScope, EngineOptions};

pub const DEFAULT_PERSONA: &str =
    "You are a warm, attentive companion. You answer briefly, stay in character and remember what the user shares with you.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub model: ModelSettings,
    pub generation: SamplingSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    pub remote: RemoteSettings,
}

/// Where the checkpoint comes from and how it should be loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Local `.gguf` file, local checkpoint directory, or Hub repository id.
    pub id: String,
    pub quantize: bool,
    /// GGUF file name inside a Hub repository; required for quantized Hub loads.
    pub gguf_file: Option<String>,
    /// Local tokenizer.json path or Hub repository id holding one.
    pub tokenizer: Option<String>,
    pub revision: Option<String>,
    /// Accelerator memory budget. Checkpoints larger than this are streamed to host memory.
    pub accelerator_memory_mb: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            id: "deepseek-ai/DeepSeek-R1-Distill-Llama-8B".to_string(),
            quantize: false,
            gguf_file: None,
            tokenizer: None,
            revision: None,
            accelerator_memory_mb: None,
        }
    }
}

impl ModelSettings {
    pub fn new(id: impl Into<String>, quantize: bool) -> Self {
        Self {
            id: id.into(),
            quantize,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub persona: String,
    pub cache_capacity: usize,
    pub max_prompt_tokens: usize,
    pub cache_key: CacheKeyScope,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let options = EngineOptions::default();
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            cache_capacity: options.cache_capacity,
            max_prompt_tokens: options.max_prompt_tokens,
            cache_key: options.cache_key,
        }
    }
}

impl EngineSettings {
    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            cache_capacity: self.cache_capacity,
            max_prompt_tokens: self.max_prompt_tokens,
            cache_key: self.cache_key,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub base_url: String,
    /// Alias -> hosted model name.
    pub models: BTreeMap<String, String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert("GPT4".to_string(), "gpt-4-turbo-preview".to_string());
        models.insert("GPT3".to_string(), "gpt-3.5-turbo".to_string());
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            models,
        }
    }
}

impl CompanionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: CompanionConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.id.trim().is_empty() {
            return Err(ConfigError::Invalid("model.id must not be empty".to_string()));
        }
        self.generation
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("generation: {}", e)))?;
        if self.engine.max_prompt_tokens == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_prompt_tokens must be > 0".to_string(),
            ));
        }
        if self.model.accelerator_memory_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "model.accelerator_memory_mb must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = CompanionConfig::from_toml_str("").expect("empty config is valid");
        assert!(!config.model.quantize);
        assert_eq!(config.engine.cache_capacity, 100);
        assert_eq!(config.engine.max_prompt_tokens, 2048);
        assert_eq!(config.engine.cache_key, CacheKeyScope::InputOnly);
        assert_eq!(config.generation.max_new_tokens, 512);
        assert_eq!(config.generation.temperature, 0.7);
        assert_eq!(config.generation.top_p, 0.9);
        assert_eq!(config.generation.repetition_penalty, 1.1);
        assert!(config.generation.do_sample);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(
            config.remote.models.get("GPT3").map(String::as_str),
            Some("gpt-3.5-turbo")
        );
    }

    #[test]
    fn partial_tables_override_only_named_fields() {
        let raw = r#"
            [model]
            id = "models/qwen2.5-7b-instruct-q4_k_m.gguf"
            quantize = true

            [generation]
            temperature = 0.2

            [engine]
            persona = "A terse librarian."
            cache_capacity = 8
            cache_key = "input_and_memory"
        "#;
        let config = CompanionConfig::from_toml_str(raw).expect("valid config");
        assert!(config.model.quantize);
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.generation.top_p, 0.9);
        assert_eq!(config.engine.persona, "A terse librarian.");
        assert_eq!(config.engine.options().cache_capacity, 8);
        assert_eq!(config.engine.cache_key, CacheKeyScope::InputAndMemory);
    }

    #[test]
    fn out_of_range_sampling_is_rejected() {
        let err = CompanionConfig::from_toml_str("[generation]\ntop_p = 1.5\n")
            .expect_err("top_p above 1 must be rejected");
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("top_p")));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = CompanionConfig::from_toml_str("[engine\npersona = 1").expect_err("bad toml");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = CompanionConfig::load("/definitely/not/here/companion.toml")
            .expect_err("missing file");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
