use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::backend::ModelFamily;
use crate::prompting::SpecialTokens;

/// Looks for tokenizer.json next to the weights, then in the working
/// directory, then under `models/`.
pub(super) fn resolve_tokenizer_path(weights_path: &Path, hint: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(hint) = hint {
        if hint.exists() {
            return Some(hint);
        }
    }

    let parent_dir = if weights_path.is_dir() {
        weights_path
    } else {
        weights_path.parent().unwrap_or(Path::new("."))
    };
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let root_tok_path = Path::new("tokenizer.json");
    if root_tok_path.exists() {
        return Some(root_tok_path.to_path_buf());
    }

    let models_tok_path = Path::new("models").join("tokenizer.json");
    if models_tok_path.exists() {
        return Some(models_tok_path);
    }

    None
}

pub(super) fn resolve_special_tokens(
    tokenizer: &Tokenizer,
    family: ModelFamily,
) -> Result<SpecialTokens, String> {
    match family {
        ModelFamily::Llama => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("<｜end▁of▁sentence｜>"))
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| {
                    "Tokenizer/model incompatibility: Llama requires <|end_of_text|>, <｜end▁of▁sentence｜> or </s>."
                        .to_string()
                })?;

            // Llama 3 chat checkpoints close turns with <|eot_id|>; older ones only have EOS.
            let eot = tokenizer.token_to_id("<|eot_id|>").unwrap_or(eos);

            Ok(SpecialTokens { eos, eot })
        }
        ModelFamily::Qwen2 => {
            let eos = tokenizer
                .token_to_id("<|endoftext|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| {
                    "Tokenizer/model incompatibility: Qwen2 requires <|endoftext|> or </s>."
                        .to_string()
                })?;

            let eot = tokenizer.token_to_id("<|im_end|>").unwrap_or(eos);

            Ok(SpecialTokens { eos, eot })
        }
    }
}
