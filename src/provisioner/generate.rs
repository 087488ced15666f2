use anyhow::Error as E;
use candle_core::{DType, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::utils::apply_repeat_penalty;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::prompting::GenerationPolicy;
use crate::responder::TextGenerator;

use super::lifecycle::LoadedModel;

/// Keeps the first `max_len` ids, dropping the tail of an overlong prompt.
pub(crate) fn truncate_prompt(ids: &mut Vec<u32>, max_len: usize) -> bool {
    if ids.len() > max_len {
        ids.truncate(max_len);
        true
    } else {
        false
    }
}

impl LoadedModel {
    pub fn encode_prompt(&self, prompt: &str, max_prompt_tokens: usize) -> Result<Vec<u32>, GenerationError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| GenerationError::Failed(E::msg(e)))?;
        let mut ids = encoding.get_ids().to_vec();
        let original = ids.len();
        if truncate_prompt(&mut ids, max_prompt_tokens) {
            warn!(original, kept = max_prompt_tokens, "prompt truncated");
        }
        Ok(ids)
    }
}

impl TextGenerator for LoadedModel {
    fn generate(
        &mut self,
        prompt: &str,
        policy: &GenerationPolicy,
        max_prompt_tokens: usize,
    ) -> Result<String, GenerationError> {
        let mut tokens = self.encode_prompt(prompt, max_prompt_tokens)?;
        if tokens.is_empty() {
            return Err(GenerationError::Failed(E::msg("prompt produced no tokens")));
        }
        let prompt_len = tokens.len();
        debug!(prompt_tokens = prompt_len, "starting generation");

        self.model.reset(&self.device)?;
        let mut logits_processor = LogitsProcessor::from_sampling(policy.seed, policy.sampling());
        let mut index_pos = 0;

        for _ in 0..policy.max_new_tokens {
            let context_size = if index_pos == 0 { tokens.len() } else { 1 };
            let start_pos = tokens.len().saturating_sub(context_size);

            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;

            let logits = if policy.repetition_penalty == 1.0 {
                logits
            } else {
                let window_start = tokens.len().saturating_sub(policy.repeat_last_n);
                apply_repeat_penalty(&logits, policy.repetition_penalty, &tokens[window_start..])?
            };

            index_pos += context_size;

            let next_token = logits_processor.sample(&logits)?;
            if policy.is_stop_token(next_token) {
                break;
            }
            tokens.push(next_token);
        }

        let generated = &tokens[prompt_len..];
        debug!(new_tokens = generated.len(), "generation finished");

        let text = self
            .tokenizer
            .decode(generated, true)
            .map_err(|e| GenerationError::Failed(E::msg(e)))?;
        Ok(text.trim().to_string())
    }

    fn release_transient_memory(&mut self) {
        match self.model.release_kv(&self.device, self.eos) {
            Ok(how) => debug!(release = ?how, "key/value cache released"),
            Err(e) => warn!(error = %e, "failed to release key/value cache"),
        }
        if let Err(e) = self.device.synchronize() {
            warn!(error = %e, "device synchronize failed while releasing memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::truncate_prompt;
    use crate::backend::tests::{tiny_llama, tiny_quantized_llama, tiny_tokenizer, BANANA};
    use crate::backend::{ModelFamily, RuntimeModel};
    use crate::prompting::{GenerationPolicy, SamplingSettings, SpecialTokens};
    use crate::provisioner::{DeviceChoice, LoadPath, LoadedModel};
    use crate::responder::TextGenerator;

    fn loaded(model: RuntimeModel) -> LoadedModel {
        LoadedModel {
            tokenizer: tiny_tokenizer(),
            model,
            device: Device::Cpu,
            placement: DeviceChoice::Cpu,
            family: ModelFamily::Llama,
            path: LoadPath::Streamed,
            eos: 0,
        }
    }

    fn greedy(max_new_tokens: usize) -> GenerationPolicy {
        let settings = SamplingSettings {
            max_new_tokens,
            do_sample: false,
            ..SamplingSettings::default()
        };
        GenerationPolicy::new(&settings, SpecialTokens { eos: 0, eot: 0 })
    }

    #[test]
    fn overlong_prompt_keeps_its_head() {
        let mut ids: Vec<u32> = (0..10).collect();
        assert!(truncate_prompt(&mut ids, 4));
        assert_eq!(ids, vec![0, 1, 2, 3]);

        let mut short = vec![1, 2];
        assert!(!truncate_prompt(&mut short, 4));
        assert_eq!(short, vec![1, 2]);
    }

    #[test]
    fn tokenizer_encoding_is_truncated_to_the_budget() {
        let model = loaded(tiny_llama(BANANA));
        assert_eq!(model.encode_prompt("hello there friend", 64).unwrap(), vec![2, 3, 4]);
        assert_eq!(model.encode_prompt("hello there friend", 2).unwrap(), vec![2, 3]);
    }

    #[test]
    fn only_new_tokens_are_decoded() {
        let mut model = loaded(tiny_llama(BANANA));
        let reply = model.generate("hello there friend", &greedy(3), 64).unwrap();

        assert_eq!(reply, "banana banana banana");
        for word in ["hello", "there", "friend"] {
            assert!(!reply.contains(word), "prompt word {word} leaked into {reply:?}");
        }
    }

    #[test]
    fn new_token_count_is_capped() {
        let mut model = loaded(tiny_llama(BANANA));
        for limit in [1, 2, 5] {
            let reply = model.generate("hello", &greedy(limit), 64).unwrap();
            assert_eq!(reply.split_whitespace().count(), limit);
        }
    }

    #[test]
    fn stop_token_ends_generation_unseen() {
        let mut model = loaded(tiny_llama(BANANA));
        let mut policy = greedy(8);
        policy.stop_token_ids.push(BANANA);

        assert_eq!(model.generate("hello there", &policy, 64).unwrap(), "");
    }

    #[test]
    fn truncated_prompt_still_generates() {
        let mut model = loaded(tiny_llama(BANANA));
        let reply = model.generate("hello there friend again", &greedy(2), 1).unwrap();
        assert_eq!(reply, "banana banana");
    }

    #[test]
    fn generation_recovers_after_memory_release() {
        for runtime in [tiny_llama(BANANA), tiny_quantized_llama(BANANA)] {
            let mut model = loaded(runtime);
            let first = model.generate("hello there", &greedy(2), 64).unwrap();
            model.release_transient_memory();
            let second = model.generate("hello there", &greedy(2), 64).unwrap();
            assert_eq!(first, second);
            assert_eq!(second, "banana banana");
        }
    }
}
