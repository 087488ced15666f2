use std::collections::HashMap;

use candle_core::quantized::{gguf_file, GgmlDType};
use candle_core::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantScheme {
    /// 4-bit k-quant: 256-weight super-blocks whose block scales are themselves quantized.
    Q4K,
}

/// Reduced-precision weight storage recipe. Only present when quantization was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationPolicy {
    pub bits: u8,
    pub double_quant: bool,
    pub scheme: QuantScheme,
    pub compute_dtype: DType,
}

pub fn build_quantization_policy(requested: bool) -> Option<QuantizationPolicy> {
    requested.then_some(QuantizationPolicy {
        bits: 4,
        double_quant: true,
        scheme: QuantScheme::Q4K,
        compute_dtype: DType::F32,
    })
}

impl QuantizationPolicy {
    pub fn accepts(&self, dtype: GgmlDType) -> bool {
        weight_bits(dtype) == Some(self.bits)
    }

    pub fn preferred_dtype(&self) -> GgmlDType {
        match self.scheme {
            QuantScheme::Q4K => GgmlDType::Q4K,
        }
    }
}

pub fn weight_bits(dtype: GgmlDType) -> Option<u8> {
    match dtype {
        GgmlDType::Q2K => Some(2),
        GgmlDType::Q3K => Some(3),
        GgmlDType::Q4_0 | GgmlDType::Q4_1 | GgmlDType::Q4K => Some(4),
        GgmlDType::Q5_0 | GgmlDType::Q5_1 | GgmlDType::Q5K => Some(5),
        GgmlDType::Q6K => Some(6),
        GgmlDType::Q8_0 | GgmlDType::Q8_1 | GgmlDType::Q8K => Some(8),
        GgmlDType::F16 | GgmlDType::BF16 => Some(16),
        GgmlDType::F32 => Some(32),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Most common tensor dtype, ignoring the F32/F16 norms and biases.
pub fn dominant_weight_dtype(
    tensor_infos: &HashMap<String, gguf_file::TensorInfo>,
) -> Option<GgmlDType> {
    let dtypes = tensor_infos.values().map(|info| info.ggml_dtype);
    dominant_of(dtypes)
}

fn dominant_of(dtypes: impl Iterator<Item = GgmlDType>) -> Option<GgmlDType> {
    let mut counts: Vec<(GgmlDType, usize)> = Vec::new();
    for dtype in dtypes {
        match counts.iter_mut().find(|(seen, _)| *seen == dtype) {
            Some((_, count)) => *count += 1,
            None => counts.push((dtype, 1)),
        }
    }

    let quantized = counts
        .iter()
        .filter(|(dtype, _)| !matches!(dtype, GgmlDType::F32 | GgmlDType::F16))
        .max_by_key(|(_, count)| *count)
        .map(|(dtype, _)| *dtype);

    quantized.or_else(|| counts.iter().max_by_key(|(_, c)| *c).map(|(d, _)| *d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_only_when_requested() {
        assert!(build_quantization_policy(false).is_none());
        let policy = build_quantization_policy(true).expect("policy");
        assert_eq!(policy.bits, 4);
        assert!(policy.double_quant);
        assert_eq!(policy.scheme, QuantScheme::Q4K);
        assert_eq!(policy.preferred_dtype(), GgmlDType::Q4K);
    }

    #[test]
    fn policy_accepts_four_bit_weights_only() {
        let policy = build_quantization_policy(true).expect("policy");
        assert!(policy.accepts(GgmlDType::Q4K));
        assert!(policy.accepts(GgmlDType::Q4_0));
        assert!(!policy.accepts(GgmlDType::Q8_0));
        assert!(!policy.accepts(GgmlDType::F16));
    }

    #[test]
    fn norms_do_not_decide_dominant_dtype() {
        let dtypes = [
            GgmlDType::F32,
            GgmlDType::F32,
            GgmlDType::F32,
            GgmlDType::Q4K,
            GgmlDType::Q4K,
            GgmlDType::Q6K,
        ];
        assert_eq!(dominant_of(dtypes.into_iter()), Some(GgmlDType::Q4K));
        assert_eq!(
            dominant_of([GgmlDType::F32, GgmlDType::F32].into_iter()),
            Some(GgmlDType::F32)
        );
        assert_eq!(dominant_of(std::iter::empty()), None);
    }
}
