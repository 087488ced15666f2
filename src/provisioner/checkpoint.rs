use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error as E, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tracing::info;

use crate::config::ModelSettings;

use super::tokenizer::resolve_tokenizer_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WeightFormat {
    Gguf,
    Safetensors,
}

/// Every file a load needs, already present on local disk.
#[derive(Debug, Clone)]
pub(crate) struct CheckpointFiles {
    pub format: WeightFormat,
    pub weights: Vec<PathBuf>,
    pub config: Option<PathBuf>,
    pub tokenizer: PathBuf,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

pub(crate) fn resolve(settings: &ModelSettings, quantized: bool) -> Result<CheckpointFiles> {
    let local = Path::new(&settings.id);
    if local.exists() {
        return resolve_local(local, quantized, settings.tokenizer.as_deref());
    }
    if looks_like_repo_id(&settings.id) {
        return resolve_hub(settings, quantized);
    }
    Err(E::msg(format!(
        "Model '{}' is neither an existing path nor a Hub repository id",
        settings.id
    )))
}

pub(crate) fn looks_like_repo_id(id: &str) -> bool {
    let mut parts = id.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => {
            !owner.is_empty() && !name.is_empty() && !id.ends_with(".gguf") && !id.contains('\\')
        }
        _ => false,
    }
}

/// Distinct shard file names listed in `model.safetensors.index.json`, sorted.
pub(crate) fn shard_names(index_json: &str) -> Result<Vec<String>> {
    let index: SafetensorsIndex =
        serde_json::from_str(index_json).context("invalid safetensors index")?;
    let names: BTreeSet<String> = index.weight_map.into_values().collect();
    if names.is_empty() {
        return Err(E::msg("safetensors index lists no shards"));
    }
    Ok(names.into_iter().collect())
}

fn resolve_local(path: &Path, quantized: bool, tokenizer: Option<&str>) -> Result<CheckpointFiles> {
    let hint = tokenizer.map(PathBuf::from);

    if path.is_file() {
        let is_gguf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
        if !is_gguf {
            return Err(E::msg(format!(
                "Unsupported model file {}: expected a .gguf file or a checkpoint directory",
                path.display()
            )));
        }
        let tokenizer = resolve_tokenizer_path(path, hint)
            .ok_or_else(|| E::msg("Tokenizer not found for selected model (fail-fast policy)."))?;
        return Ok(CheckpointFiles {
            format: WeightFormat::Gguf,
            weights: vec![path.to_path_buf()],
            config: None,
            tokenizer,
        });
    }

    let tokenizer = resolve_tokenizer_path(path, hint)
        .ok_or_else(|| E::msg("Tokenizer not found for selected model (fail-fast policy)."))?;

    if quantized {
        let gguf = files_with_extension(path, "gguf")?
            .into_iter()
            .next()
            .ok_or_else(|| E::msg(format!("No .gguf file in {}", path.display())))?;
        return Ok(CheckpointFiles {
            format: WeightFormat::Gguf,
            weights: vec![gguf],
            config: None,
            tokenizer,
        });
    }

    let config = path.join("config.json");
    if !config.exists() {
        return Err(E::msg(format!("Missing config.json in {}", path.display())));
    }

    let index_path = path.join("model.safetensors.index.json");
    let weights = if index_path.exists() {
        let raw = fs::read_to_string(&index_path)?;
        shard_names(&raw)?
            .into_iter()
            .map(|name| path.join(name))
            .collect()
    } else {
        files_with_extension(path, "safetensors")?
    };
    if weights.is_empty() {
        return Err(E::msg(format!("No .safetensors weights in {}", path.display())));
    }
    if let Some(missing) = weights.iter().find(|w| !w.exists()) {
        return Err(E::msg(format!("Missing weight shard {}", missing.display())));
    }

    Ok(CheckpointFiles {
        format: WeightFormat::Safetensors,
        weights,
        config: Some(config),
        tokenizer,
    })
}

fn resolve_hub(settings: &ModelSettings, quantized: bool) -> Result<CheckpointFiles> {
    info!(repo = %settings.id, quantized, "fetching checkpoint from the Hub");
    let api = Api::new()?;
    let repo = open_repo(&api, &settings.id, settings.revision.as_deref());

    let tokenizer = match settings.tokenizer.as_deref() {
        Some(local) if Path::new(local).exists() => PathBuf::from(local),
        Some(other_repo) => open_repo(&api, other_repo, None)
            .get("tokenizer.json")
            .with_context(|| format!("tokenizer.json not found in {}", other_repo))?,
        None => repo
            .get("tokenizer.json")
            .with_context(|| format!("tokenizer.json not found in {}", settings.id))?,
    };

    if quantized {
        let file = settings.gguf_file.as_deref().ok_or_else(|| {
            E::msg("Quantized Hub loads need model.gguf_file naming the GGUF inside the repository")
        })?;
        let weights = repo
            .get(file)
            .with_context(|| format!("{} not found in {}", file, settings.id))?;
        return Ok(CheckpointFiles {
            format: WeightFormat::Gguf,
            weights: vec![weights],
            config: None,
            tokenizer,
        });
    }

    let config = repo
        .get("config.json")
        .with_context(|| format!("config.json not found in {}", settings.id))?;

    let weights = match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let raw = fs::read_to_string(&index_path)?;
            shard_names(&raw)?
                .iter()
                .map(|name| repo.get(name).with_context(|| format!("shard {}", name)))
                .collect::<Result<Vec<_>>>()?
        }
        Err(_) => vec![repo
            .get("model.safetensors")
            .with_context(|| format!("model.safetensors not found in {}", settings.id))?],
    };

    Ok(CheckpointFiles {
        format: WeightFormat::Safetensors,
        weights,
        config: Some(config),
        tokenizer,
    })
}

fn open_repo(api: &Api, id: &str, revision: Option<&str>) -> ApiRepo {
    match revision {
        Some(rev) => api.repo(Repo::with_revision(
            id.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(id.to_string()),
    }
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| E::msg(format!("Model directory read failed '{}': {}", dir.display(), e)))?;

    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if ext.eq_ignore_ascii_case(extension) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
