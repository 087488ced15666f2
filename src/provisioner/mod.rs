mod checkpoint;
mod device;
mod generate;
mod lifecycle;
mod quantization;
mod tokenizer;

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::{error, info};

use crate::config::{CompanionConfig, ModelSettings};
use crate::error::{panic_detail, GenerationError, ProvisionError};
use crate::prompting::{GenerationPolicy, SamplingSettings};
use crate::responder::TextGenerator;

pub use device::{resolve_device, AcceleratorProbe, DeviceChoice};
pub use lifecycle::{LoadPath, LoadedModel};
pub use quantization::{build_quantization_policy, weight_bits, QuantScheme, QuantizationPolicy};

enum ProvisionState {
    Unloaded,
    Loading,
    Loaded {
        model: Box<LoadedModel>,
        policy: GenerationPolicy,
    },
    LoadFailed(String),
}

/// Owns the one loaded model of a process. Device and quantization are
/// decided at construction; loading happens on demand.
pub struct ModelProvisioner {
    settings: ModelSettings,
    sampling: SamplingSettings,
    device: DeviceChoice,
    quantization: Option<QuantizationPolicy>,
    state: ProvisionState,
}

impl ModelProvisioner {
    pub fn new(settings: ModelSettings, sampling: SamplingSettings) -> Self {
        let device = resolve_device();
        Self::with_device(settings, sampling, device)
    }

    pub fn with_device(settings: ModelSettings, sampling: SamplingSettings, device: DeviceChoice) -> Self {
        let quantization = build_quantization_policy(settings.quantize);
        Self {
            settings,
            sampling,
            device,
            quantization,
            state: ProvisionState::Unloaded,
        }
    }

    pub fn from_config(config: &CompanionConfig) -> Self {
        Self::new(config.model.clone(), config.generation)
    }

    pub fn model_id(&self) -> &str {
        &self.settings.id
    }

    pub fn device(&self) -> DeviceChoice {
        self.device
    }

    pub fn quantization(&self) -> Option<&QuantizationPolicy> {
        self.quantization.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, ProvisionState::Loaded { .. })
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            ProvisionState::Unloaded => "unloaded",
            ProvisionState::Loading => "loading",
            ProvisionState::Loaded { .. } => "loaded",
            ProvisionState::LoadFailed(_) => "load-failed",
        }
    }

    /// Loads on first call, returns the resident model afterwards.
    /// A failed load is terminal for this instance.
    pub fn load_model(&mut self) -> Result<&mut LoadedModel, ProvisionError> {
        if let ProvisionState::LoadFailed(reason) = &self.state {
            return Err(ProvisionError::Terminal {
                reason: reason.clone(),
            });
        }
        if matches!(self.state, ProvisionState::Unloaded) {
            self.run_load()?;
        }

        match &mut self.state {
            ProvisionState::Loaded { model, .. } => Ok(model.as_mut()),
            _ => Err(ProvisionError::NotLoaded),
        }
    }

    fn run_load(&mut self) -> Result<(), ProvisionError> {
        self.state = ProvisionState::Loading;
        info!(
            model = %self.settings.id,
            device = self.device.name(),
            quantized = self.quantization.is_some(),
            "loading model"
        );

        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            lifecycle::load(
                &self.settings,
                self.device,
                self.quantization.as_ref(),
                &self.sampling,
            )
        }));
        self.finish_load(attempt)
    }

    // A panicking loader (malformed tensor data) counts as a failed load.
    fn finish_load(
        &mut self,
        attempt: thread::Result<anyhow::Result<(LoadedModel, GenerationPolicy)>>,
    ) -> Result<(), ProvisionError> {
        let outcome = attempt.unwrap_or_else(|payload| {
            Err(anyhow::Error::msg(panic_detail("model loader", payload)))
        });

        match outcome {
            Ok((model, policy)) => {
                info!(
                    model = %self.settings.id,
                    family = ?model.family(),
                    path = ?model.load_path(),
                    device = model.placement().name(),
                    "model loaded"
                );
                self.state = ProvisionState::Loaded {
                    model: Box::new(model),
                    policy,
                };
                Ok(())
            }
            Err(source) => {
                let detail = format!("{:#}", source);
                error!(model = %self.settings.id, error = %detail, "model loading failed");
                self.state = ProvisionState::LoadFailed(detail);
                Err(ProvisionError::LoadFailed {
                    model: self.settings.id.clone(),
                    source,
                })
            }
        }
    }

    pub fn generation_policy(&self) -> Result<&GenerationPolicy, ProvisionError> {
        match &self.state {
            ProvisionState::Loaded { policy, .. } => Ok(policy),
            ProvisionState::LoadFailed(reason) => Err(ProvisionError::Terminal {
                reason: reason.clone(),
            }),
            _ => Err(ProvisionError::NotLoaded),
        }
    }

    pub fn loaded(&self) -> Option<&LoadedModel> {
        match &self.state {
            ProvisionState::Loaded { model, .. } => Some(model.as_ref()),
            _ => None,
        }
    }

    /// Drops the resident model and its device memory. A failed provisioner stays failed.
    pub fn unload(&mut self) {
        if let ProvisionState::Loaded { .. } = self.state {
            self.state = ProvisionState::Unloaded;
            info!(model = %self.settings.id, "model unloaded");
        }
    }
}

impl TextGenerator for ModelProvisioner {
    fn generate(
        &mut self,
        prompt: &str,
        policy: &GenerationPolicy,
        max_prompt_tokens: usize,
    ) -> Result<String, GenerationError> {
        match &mut self.state {
            ProvisionState::Loaded { model, .. } => model.generate(prompt, policy, max_prompt_tokens),
            _ => Err(GenerationError::Failed(anyhow::Error::new(ProvisionError::NotLoaded))),
        }
    }

    fn release_transient_memory(&mut self) {
        if let ProvisionState::Loaded { model, .. } = &mut self.state {
            model.release_transient_memory();
        }
    }
}
