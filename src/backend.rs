use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama;
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Llama,
    Qwen2,
}

impl ModelFamily {
    /// Maps a GGUF `general.architecture` or a config.json `model_type`.
    pub fn from_architecture(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "llama" => Some(Self::Llama),
            "qwen2" => Some(Self::Qwen2),
            _ => None,
        }
    }
}

/// How [`RuntimeModel::release_kv`] freed the key/value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvRelease {
    Rebuilt,
    Shrunk,
}

pub enum RuntimeModel {
    QuantizedLlama(quantized_llama::ModelWeights),
    QuantizedQwen2(quantized_qwen2::ModelWeights),
    Llama {
        model: llama::Llama,
        cache: llama::Cache,
        config: llama::Config,
        dtype: DType,
    },
}

impl RuntimeModel {
    pub fn from_gguf<R: Read + Seek>(
        content: gguf_file::Content,
        reader: &mut R,
        family: ModelFamily,
        device: &Device,
    ) -> Result<Self> {
        match family {
            ModelFamily::Llama => {
                let model = quantized_llama::ModelWeights::from_gguf(content, reader, device)?;
                Ok(Self::QuantizedLlama(model))
            }
            ModelFamily::Qwen2 => {
                match quantized_qwen2::ModelWeights::from_gguf(content, reader, device) {
                    Ok(model) => Ok(Self::QuantizedQwen2(model)),
                    Err(e) => {
                        let msg = format!("{}", e);
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            Err(E::msg(
                                "Qwen2 load failed: missing 'output_norm.weight'. The GGUF is likely an incomplete split shard; merge all parts into one file.",
                            ))
                        } else {
                            Err(E::msg(msg))
                        }
                    }
                }
            }
        }
    }

    pub fn from_safetensors(
        weights: &[PathBuf],
        config_path: &Path,
        family: ModelFamily,
        dtype: DType,
        device: &Device,
        use_flash_attn: bool,
    ) -> Result<Self> {
        if family != ModelFamily::Llama {
            return Err(E::msg(format!(
                "{:?} checkpoints are only supported as quantized GGUF files",
                family
            )));
        }

        let raw = std::fs::read_to_string(config_path)
            .map_err(|e| E::msg(format!("Failed to read {}: {}", config_path.display(), e)))?;
        let llama_config: llama::LlamaConfig = serde_json::from_str(&raw)?;
        let config = llama_config.into_config(use_flash_attn);

        // SAFETY: the checkpoint files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        Self::llama_from_var_builder(vb, config, dtype, device)
    }

    pub(crate) fn llama_from_var_builder(
        vb: VarBuilder,
        config: llama::Config,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let model = llama::Llama::load(vb, &config)?;
        let cache = llama::Cache::new(true, dtype, &config, device)?;

        Ok(Self::Llama {
            model,
            cache,
            config,
            dtype,
        })
    }

    pub fn forward(&mut self, input: &Tensor, position: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::QuantizedLlama(model) => model.forward(input, position),
            Self::QuantizedQwen2(model) => model.forward(input, position),
            Self::Llama { model, cache, .. } => model.forward(input, position, cache),
        }
    }

    /// Drops accumulated key/value state. Quantized runtimes rebuild theirs
    /// whenever a forward pass starts at position zero.
    pub fn reset(&mut self, device: &Device) -> candle_core::Result<()> {
        if let Self::Llama {
            cache,
            config,
            dtype,
            ..
        } = self
        {
            *cache = llama::Cache::new(true, *dtype, config, device)?;
        }
        Ok(())
    }

    /// Gives back key/value memory held from an aborted sequence.
    ///
    /// The full-precision cache is rebuilt empty. Quantized layers keep their
    /// cache inside the weights and restart it whenever a pass begins at
    /// position zero, so a single `filler` token at position zero shrinks every
    /// layer's cache to one entry.
    pub fn release_kv(&mut self, device: &Device, filler: u32) -> candle_core::Result<KvRelease> {
        match self {
            Self::Llama { .. } => {
                self.reset(device)?;
                Ok(KvRelease::Rebuilt)
            }
            Self::QuantizedLlama(_) | Self::QuantizedQwen2(_) => {
                let input = Tensor::new(&[[filler]], device)?;
                self.forward(&input, 0)?;
                Ok(KvRelease::Shrunk)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuantizedLlama(_) => "quantized-llama",
            Self::QuantizedQwen2(_) => "quantized-qwen2",
            Self::Llama { .. } => "llama",
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;

    use candle_core::quantized::{gguf_file, GgmlDType, QTensor};
    use candle_core::{DType, Device, IndexOp, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::models::llama;
    use tokenizers::Tokenizer;

    use super::{KvRelease, ModelFamily, RuntimeModel};

    pub(crate) const VOCAB: [&str; 8] = ["</s>", "[UNK]", "hello", "there", "friend", "again", "apple", "banana"];
    pub(crate) const BANANA: u32 = 7;

    const HIDDEN: usize = 8;
    const HEADS: usize = 2;
    const INTERMEDIATE: usize = 16;

    /// Word-level tokenizer over [`VOCAB`] with `</s>` as the only special token.
    pub(crate) fn tiny_tokenizer() -> Tokenizer {
        let vocab: Vec<String> = VOCAB
            .iter()
            .enumerate()
            .map(|(id, word)| format!("\"{}\": {}", word, id))
            .collect();
        let json = format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [{{"id": 0, "content": "</s>", "single_word": false, "lstrip": false,
                                   "rstrip": false, "normalized": false, "special": true}}],
                "normalizer": null,
                "pre_tokenizer": {{"type": "Whitespace"}},
                "post_processor": null,
                "decoder": null,
                "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "[UNK]"}}
            }}"#,
            vocab.join(", ")
        );
        Tokenizer::from_bytes(json.as_bytes()).unwrap()
    }

    // Every row is all ones except `favoured`, which is all twos. With zeroed
    // attention and feed-forward weights the final hidden state is the
    // normalised embedding, so tied logits always peak at `favoured`.
    fn embeddings(favoured: u32) -> Tensor {
        let mut data = vec![1f32; VOCAB.len() * HIDDEN];
        let row = favoured as usize * HIDDEN;
        for value in &mut data[row..row + HIDDEN] {
            *value = 2.0;
        }
        Tensor::from_vec(data, (VOCAB.len(), HIDDEN), &Device::Cpu).unwrap()
    }

    fn zeros(rows: usize, cols: usize) -> Tensor {
        Tensor::zeros((rows, cols), DType::F32, &Device::Cpu).unwrap()
    }

    fn ones(len: usize) -> Tensor {
        Tensor::ones(len, DType::F32, &Device::Cpu).unwrap()
    }

    /// One-layer full-precision llama whose greedy choice is always `favoured`.
    pub(crate) fn tiny_llama(favoured: u32) -> RuntimeModel {
        let raw = format!(
            r#"{{
                "hidden_size": {HIDDEN},
                "intermediate_size": {INTERMEDIATE},
                "vocab_size": {},
                "num_hidden_layers": 1,
                "num_attention_heads": {HEADS},
                "num_key_value_heads": {HEADS},
                "rms_norm_eps": 1e-5,
                "rope_theta": 10000.0,
                "max_position_embeddings": 64,
                "tie_word_embeddings": true
            }}"#,
            VOCAB.len()
        );
        let config = serde_json::from_str::<llama::LlamaConfig>(&raw)
            .unwrap()
            .into_config(false);

        let mut tensors = HashMap::new();
        tensors.insert("model.embed_tokens.weight".to_string(), embeddings(favoured));
        tensors.insert("model.norm.weight".to_string(), ones(HIDDEN));
        let layer = "model.layers.0";
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            tensors.insert(format!("{layer}.self_attn.{proj}.weight"), zeros(HIDDEN, HIDDEN));
        }
        tensors.insert(format!("{layer}.mlp.gate_proj.weight"), zeros(INTERMEDIATE, HIDDEN));
        tensors.insert(format!("{layer}.mlp.up_proj.weight"), zeros(INTERMEDIATE, HIDDEN));
        tensors.insert(format!("{layer}.mlp.down_proj.weight"), zeros(HIDDEN, INTERMEDIATE));
        tensors.insert(format!("{layer}.input_layernorm.weight"), ones(HIDDEN));
        tensors.insert(format!("{layer}.post_attention_layernorm.weight"), ones(HIDDEN));

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        RuntimeModel::llama_from_var_builder(vb, config, DType::F32, &Device::Cpu).unwrap()
    }

    /// Same weights as [`tiny_llama`], written to an in-memory GGUF and loaded
    /// through the quantized llama runtime.
    pub(crate) fn tiny_quantized_llama(favoured: u32) -> RuntimeModel {
        let q = |t: Tensor| QTensor::quantize(&t, GgmlDType::F32).unwrap();
        let mut tensors: Vec<(String, QTensor)> = vec![
            ("token_embd.weight".to_string(), q(embeddings(favoured))),
            ("output.weight".to_string(), q(embeddings(favoured))),
            ("output_norm.weight".to_string(), q(ones(HIDDEN))),
            ("blk.0.attn_norm.weight".to_string(), q(ones(HIDDEN))),
            ("blk.0.ffn_norm.weight".to_string(), q(ones(HIDDEN))),
            ("blk.0.ffn_gate.weight".to_string(), q(zeros(INTERMEDIATE, HIDDEN))),
            ("blk.0.ffn_up.weight".to_string(), q(zeros(INTERMEDIATE, HIDDEN))),
            ("blk.0.ffn_down.weight".to_string(), q(zeros(HIDDEN, INTERMEDIATE))),
        ];
        for name in ["attn_q", "attn_k", "attn_v", "attn_output"] {
            tensors.push((format!("blk.0.{name}.weight"), q(zeros(HIDDEN, HIDDEN))));
        }

        let metadata = [
            ("general.architecture", gguf_file::Value::String("llama".to_string())),
            ("llama.attention.head_count", gguf_file::Value::U32(HEADS as u32)),
            ("llama.attention.head_count_kv", gguf_file::Value::U32(HEADS as u32)),
            ("llama.block_count", gguf_file::Value::U32(1)),
            ("llama.embedding_length", gguf_file::Value::U32(HIDDEN as u32)),
            ("llama.rope.dimension_count", gguf_file::Value::U32((HIDDEN / HEADS) as u32)),
            ("llama.attention.layer_norm_rms_epsilon", gguf_file::Value::F32(1e-5)),
        ];
        let metadata: Vec<(&str, &gguf_file::Value)> = metadata.iter().map(|(k, v)| (*k, v)).collect();
        let tensors: Vec<(&str, &QTensor)> = tensors.iter().map(|(k, v)| (k.as_str(), v)).collect();

        let mut buffer = Cursor::new(Vec::new());
        gguf_file::write(&mut buffer, &metadata, &tensors).unwrap();
        buffer.set_position(0);
        let content = gguf_file::Content::read(&mut buffer).unwrap();
        RuntimeModel::from_gguf(content, &mut buffer, ModelFamily::Llama, &Device::Cpu).unwrap()
    }

    fn greedy_next(model: &mut RuntimeModel, tokens: &[u32], position: usize) -> u32 {
        let input = Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let logits = model.forward(&input, position).unwrap();
        logits.i(0).unwrap().argmax(0).unwrap().to_scalar::<u32>().unwrap()
    }

    #[test]
    fn architectures_map_to_runtime_families() {
        assert_eq!(ModelFamily::from_architecture("llama"), Some(ModelFamily::Llama));
        assert_eq!(ModelFamily::from_architecture("Qwen2"), Some(ModelFamily::Qwen2));
        assert_eq!(ModelFamily::from_architecture("gpt2"), None);
    }

    #[test]
    fn full_precision_release_rebuilds_the_cache() {
        let mut model = tiny_llama(BANANA);
        assert_eq!(model.kind(), "llama");
        assert_eq!(greedy_next(&mut model, &[2, 3, 4], 0), BANANA);
        assert_eq!(greedy_next(&mut model, &[BANANA], 3), BANANA);

        assert_eq!(model.release_kv(&Device::Cpu, 0).unwrap(), KvRelease::Rebuilt);
        assert_eq!(greedy_next(&mut model, &[2], 0), BANANA);
    }

    #[test]
    fn quantized_release_shrinks_the_layer_caches() {
        let mut model = tiny_quantized_llama(BANANA);
        assert_eq!(model.kind(), "quantized-llama");
        assert_eq!(greedy_next(&mut model, &[2, 3, 4], 0), BANANA);
        assert_eq!(greedy_next(&mut model, &[BANANA], 3), BANANA);

        assert_eq!(model.release_kv(&Device::Cpu, 0).unwrap(), KvRelease::Shrunk);
        // One cached entry remains, so decoding continues from position one.
        assert_eq!(greedy_next(&mut model, &[2], 1), BANANA);
    }
}
