use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("failed to load model '{model}': {source:#}")]
    LoadFailed {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("model is not loaded")]
    NotLoaded,

    #[error("provisioner is unusable after a failed load ({reason}); construct a new one to retry")]
    Terminal { reason: String },
}

/// Failure of a single generation turn. Never crosses the engine boundary.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("device out of memory: {0}")]
    ResourceExhausted(String),

    #[error("generation failed: {0:#}")]
    Failed(#[from] anyhow::Error),
}

impl GenerationError {
    /// Sorts a candle error into exhaustion or generic failure by its message.
    pub fn from_candle(err: candle_core::Error) -> Self {
        let msg = err.to_string();
        if is_out_of_memory(&msg) {
            Self::ResourceExhausted(msg)
        } else {
            Self::Failed(anyhow::Error::new(err))
        }
    }
}

impl From<candle_core::Error> for GenerationError {
    fn from(err: candle_core::Error) -> Self {
        Self::from_candle(err)
    }
}

pub(crate) fn is_out_of_memory(msg: &str) -> bool {
    let lowered = msg.to_lowercase();
    lowered.contains("out of memory")
        || lowered.contains("out_of_memory")
        || lowered.contains("outofmemory")
        || lowered.contains("failed to allocate")
}

/// Readable text for a caught panic payload.
pub(crate) fn panic_detail(context: &str, payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("{} panicked: {}", context, msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("{} panicked: {}", context, msg)
    } else {
        format!("{} panicked", context)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("request to {model} failed: {detail}")]
    Http { model: String, detail: String },

    #[error("cannot decode response from {model}: {source}")]
    Decode {
        model: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{model} returned no choices")]
    EmptyChoices { model: String },

    #[error("no hosted model configured for alias '{0}'")]
    UnknownAlias(String),
}
