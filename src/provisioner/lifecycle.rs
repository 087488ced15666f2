use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::backend::{ModelFamily, RuntimeModel};
use crate::config::ModelSettings;
use crate::prompting::{GenerationPolicy, SamplingSettings};

use super::checkpoint::{self, CheckpointFiles, WeightFormat};
use super::device::DeviceChoice;
use super::quantization::{dominant_weight_dtype, QuantizationPolicy};
use super::tokenizer::resolve_special_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPath {
    /// Weights went straight onto the resolved accelerator.
    Direct,
    /// Skeleton inspected first, weights streamed into host memory.
    Streamed,
}

/// Tokenizer and model bound to one device. Owned by a single provisioner.
pub struct LoadedModel {
    pub(crate) tokenizer: Tokenizer,
    pub(crate) model: RuntimeModel,
    pub(crate) device: Device,
    pub(crate) placement: DeviceChoice,
    pub(crate) family: ModelFamily,
    pub(crate) path: LoadPath,
    /// Token fed through quantized runtimes to shrink their caches.
    pub(crate) eos: u32,
}

impl LoadedModel {
    pub fn placement(&self) -> DeviceChoice {
        self.placement
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn load_path(&self) -> LoadPath {
        self.path
    }
}

/// Checkpoint header read without touching the weight data.
enum Skeleton {
    Gguf {
        content: gguf_file::Content,
        file: File,
    },
    Safetensors {
        weights: Vec<PathBuf>,
        config: PathBuf,
    },
}

struct InspectedCheckpoint {
    skeleton: Skeleton,
    family: ModelFamily,
    required_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadStrategy {
    Direct { device: DeviceChoice },
    Streamed,
}

/// Picks the load path from the device and memory footprint.
/// `None` budgets mean "unknown" and never block a load.
pub(crate) fn plan_strategy(
    choice: DeviceChoice,
    required_bytes: u64,
    accelerator_budget: Option<u64>,
    host_available: Option<u64>,
) -> Result<LoadStrategy> {
    let fits_accelerator = accelerator_budget.map_or(true, |budget| required_bytes <= budget);
    if choice.is_accelerator() && fits_accelerator {
        return Ok(LoadStrategy::Direct { device: choice });
    }

    if choice.is_accelerator() {
        warn!(
            device = choice.name(),
            required_mb = required_bytes / MB,
            budget_mb = accelerator_budget.unwrap_or_default() / MB,
            "checkpoint exceeds accelerator budget, streaming into host memory"
        );
    }

    if let Some(available) = host_available {
        if required_bytes > available {
            return Err(E::msg(format!(
                "Insufficient memory: checkpoint needs {} MB, host has {} MB available",
                required_bytes / MB,
                available / MB
            )));
        }
    }

    Ok(LoadStrategy::Streamed)
}

const MB: u64 = 1024 * 1024;

fn host_available_bytes() -> Option<u64> {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    match sys.available_memory() {
        0 => None,
        bytes => Some(bytes),
    }
}

fn inspect(files: &CheckpointFiles) -> Result<InspectedCheckpoint> {
    match files.format {
        WeightFormat::Gguf => {
            let path = files
                .weights
                .first()
                .ok_or_else(|| E::msg("GGUF checkpoint without a weight file"))?;
            let mut file = File::open(path)
                .map_err(|e| E::msg(format!("Failed to open model file: {}", e)))?;
            let content = gguf_file::Content::read(&mut file)
                .with_context(|| format!("Invalid GGUF header in {}", path.display()))?;

            let architecture = content
                .metadata
                .get("general.architecture")
                .and_then(|v| v.to_string().ok())
                .cloned()
                .unwrap_or_else(|| "llama".to_string());
            let family = ModelFamily::from_architecture(&architecture).ok_or_else(|| {
                E::msg(format!("Unsupported GGUF architecture '{}'", architecture))
            })?;

            let file_len = file.metadata()?.len();
            let required_bytes = file_len.saturating_sub(content.tensor_data_offset);

            Ok(InspectedCheckpoint {
                skeleton: Skeleton::Gguf { content, file },
                family,
                required_bytes,
            })
        }
        WeightFormat::Safetensors => {
            let config = files
                .config
                .clone()
                .ok_or_else(|| E::msg("Safetensors checkpoint without config.json"))?;
            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("Failed to read {}", config.display()))?;
            let parsed: serde_json::Value = serde_json::from_str(&raw)?;
            let model_type = parsed
                .get("model_type")
                .and_then(|v| v.as_str())
                .unwrap_or("llama");
            let family = ModelFamily::from_architecture(model_type).ok_or_else(|| {
                E::msg(format!("Unsupported model_type '{}' in config.json", model_type))
            })?;

            let mut required_bytes = 0u64;
            for weight in &files.weights {
                required_bytes += std::fs::metadata(weight)
                    .with_context(|| format!("Missing weight shard {}", weight.display()))?
                    .len();
            }

            Ok(InspectedCheckpoint {
                skeleton: Skeleton::Safetensors {
                    weights: files.weights.clone(),
                    config,
                },
                family,
                required_bytes,
            })
        }
    }
}

fn full_precision_dtype(strategy: LoadStrategy) -> DType {
    match strategy {
        LoadStrategy::Direct {
            device: DeviceChoice::Cuda,
        } => DType::BF16,
        LoadStrategy::Direct {
            device: DeviceChoice::Metal,
        } => DType::F16,
        _ => DType::F32,
    }
}

/// Resolves, inspects and loads a checkpoint. Nothing is kept on failure.
pub(super) fn load(
    settings: &ModelSettings,
    choice: DeviceChoice,
    quantization: Option<&QuantizationPolicy>,
    sampling: &SamplingSettings,
) -> Result<(LoadedModel, GenerationPolicy)> {
    let files = checkpoint::resolve(settings, quantization.is_some())?;

    info!(tokenizer = %files.tokenizer.display(), "loading tokenizer");
    let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(E::msg)?;

    let inspected = inspect(&files)?;

    if let (Some(policy), Skeleton::Gguf { content, .. }) = (quantization, &inspected.skeleton) {
        let dominant = dominant_weight_dtype(&content.tensor_infos)
            .ok_or_else(|| E::msg("GGUF checkpoint has no tensors"))?;
        if !policy.accepts(dominant) {
            return Err(E::msg(format!(
                "Checkpoint weights are {:?}, quantization policy requires {}-bit ({:?})",
                dominant,
                policy.bits,
                policy.preferred_dtype()
            )));
        }
    }
    if quantization.is_none() && files.format == WeightFormat::Gguf {
        info!("GGUF checkpoint selected without quantization request; loading its stored precision");
    }

    let strategy = plan_strategy(
        choice,
        inspected.required_bytes,
        settings.accelerator_memory_mb.map(|mb| mb * MB),
        host_available_bytes(),
    )?;

    let (device, placement, path) = match strategy {
        LoadStrategy::Direct { device } => (device.open()?, device, LoadPath::Direct),
        LoadStrategy::Streamed => (Device::Cpu, DeviceChoice::Cpu, LoadPath::Streamed),
    };

    info!(
        family = ?inspected.family,
        path = ?path,
        device = placement.name(),
        required_mb = inspected.required_bytes / MB,
        "loading weights"
    );

    let model = match inspected.skeleton {
        Skeleton::Gguf { content, mut file } => {
            RuntimeModel::from_gguf(content, &mut file, inspected.family, &device)?
        }
        Skeleton::Safetensors { weights, config } => {
            let use_flash_attn =
                cfg!(feature = "flash-attn") && path == LoadPath::Direct && placement == DeviceChoice::Cuda;
            RuntimeModel::from_safetensors(
                &weights,
                &config,
                inspected.family,
                full_precision_dtype(strategy),
                &device,
                use_flash_attn,
            )?
        }
    };

    let special = resolve_special_tokens(&tokenizer, inspected.family).map_err(E::msg)?;
    info!(eos = special.eos, eot = special.eot, kind = model.kind(), "model ready");

    let policy = GenerationPolicy::new(sampling, special);
    let loaded = LoadedModel {
        tokenizer,
        model,
        device,
        placement,
        family: inspected.family,
        path,
        eos: special.eos,
    };
    Ok((loaded, policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerator_with_room_loads_directly() {
        let strategy = plan_strategy(DeviceChoice::Cuda, 4 * MB, Some(8 * MB), Some(MB)).unwrap();
        assert_eq!(
            strategy,
            LoadStrategy::Direct {
                device: DeviceChoice::Cuda
            }
        );
    }

    #[test]
    fn unknown_accelerator_budget_is_trusted() {
        let strategy = plan_strategy(DeviceChoice::Metal, 64 * MB, None, None).unwrap();
        assert_eq!(
            strategy,
            LoadStrategy::Direct {
                device: DeviceChoice::Metal
            }
        );
    }

    #[test]
    fn oversized_checkpoint_streams_to_host() {
        let strategy = plan_strategy(DeviceChoice::Cuda, 16 * MB, Some(8 * MB), Some(32 * MB)).unwrap();
        assert_eq!(strategy, LoadStrategy::Streamed);
    }

    #[test]
    fn cpu_always_streams() {
        let strategy = plan_strategy(DeviceChoice::Cpu, 16 * MB, Some(MB), None).unwrap();
        assert_eq!(strategy, LoadStrategy::Streamed);
    }

    #[test]
    fn host_too_small_is_a_load_failure() {
        let err = plan_strategy(DeviceChoice::Cpu, 16 * MB, None, Some(8 * MB))
            .expect_err("insufficient host memory");
        assert!(err.to_string().contains("Insufficient memory"));
    }

    #[test]
    fn full_precision_dtype_follows_placement() {
        assert_eq!(
            full_precision_dtype(LoadStrategy::Direct {
                device: DeviceChoice::Cuda
            }),
            DType::BF16
        );
        assert_eq!(full_precision_dtype(LoadStrategy::Streamed), DType::F32);
    }
}
