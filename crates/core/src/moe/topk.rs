//! Top-k softmax for MoE routing.
//!
//! ## Algorithm
//!
//! 1. Softmax over all expert logits, in F32
//! 2. Select the top-k experts by probability; ties go to the lower index
//! 3. Apply the normalization policy
//!
//! Selection runs on the host. Logits on another device are copied over and
//! the results copied back, which is negligible at `[tokens, experts]` size.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{Error, Result};

/// What happens to the selected probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopKNormalization {
    /// Divide by their sum so each token's weights add up to 1.
    Renormalize,
    /// Keep the probabilities of the full softmax.
    FullSoftmax,
}

impl TopKNormalization {
    pub fn from_renormalize(renormalize: bool) -> Self {
        if renormalize {
            Self::Renormalize
        } else {
            Self::FullSoftmax
        }
    }

    pub fn renormalizes(self) -> bool {
        self == Self::Renormalize
    }
}

/// Compute top-k routing from router logits.
///
/// # Arguments
/// * `router_logits` - Shape `[num_tokens, num_experts]`
/// * `top_k` - Experts per token, `1..=num_experts`
///
/// # Returns
/// `(weights, ids)`: F32 `[num_tokens, top_k]` and U32 `[num_tokens, top_k]`,
/// both ordered by descending probability.
pub fn topk_softmax(
    router_logits: &Tensor,
    top_k: usize,
    normalization: TopKNormalization,
) -> Result<(Tensor, Tensor)> {
    match router_logits.device() {
        Device::Cpu => topk_softmax_cpu(router_logits, top_k, normalization),
        device => {
            let logits = router_logits.to_device(&Device::Cpu)?;
            let (weights, ids) = topk_softmax_cpu(&logits, top_k, normalization)?;
            Ok((weights.to_device(device)?, ids.to_device(device)?))
        }
    }
}

fn topk_softmax_cpu(
    router_logits: &Tensor,
    top_k: usize,
    normalization: TopKNormalization,
) -> Result<(Tensor, Tensor)> {
    let (num_tokens, num_experts) = router_logits.dims2()?;
    if top_k == 0 || top_k > num_experts {
        return Err(Error::config(format!(
            "top_k ({top_k}) must be in 1..={num_experts}"
        )));
    }

    let probs = candle_nn::ops::softmax(&router_logits.to_dtype(DType::F32)?, D::Minus1)?
        .to_vec2::<f32>()?;

    let mut weights = Vec::with_capacity(num_tokens * top_k);
    let mut ids = Vec::with_capacity(num_tokens * top_k);
    let mut order: Vec<usize> = Vec::with_capacity(num_experts);
    for row in &probs {
        order.clear();
        order.extend(0..num_experts);
        // Stable sort keeps equal probabilities in index order.
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

        let selected = &order[..top_k];
        let scale = match normalization {
            TopKNormalization::Renormalize => {
                1.0 / selected.iter().map(|&e| row[e]).sum::<f32>()
            }
            TopKNormalization::FullSoftmax => 1.0,
        };
        for &e in selected {
            weights.push(row[e] * scale);
            ids.push(e as u32);
        }
    }

    let device = router_logits.device();
    Ok((
        Tensor::from_vec(weights, (num_tokens, top_k), device)?,
        Tensor::from_vec(ids, (num_tokens, top_k), device)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn topk_softmax_renormalized_rows_sum_to_one() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (16, 8), &device).unwrap();
        let (weights, ids) = topk_softmax(&logits, 3, TopKNormalization::Renormalize).unwrap();

        assert_eq!(weights.dims(), &[16, 3]);
        assert_eq!(ids.dtype(), DType::U32);
        for row in weights.to_vec2::<f32>().unwrap() {
            assert!(approx_eq(row.iter().sum(), 1.0, 1e-5));
            assert!(row.windows(2).all(|w| w[0] >= w[1]));
        }
        for row in ids.to_vec2::<u32>().unwrap() {
            let mut sorted = row.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 3);
        }
    }

    #[test]
    fn topk_softmax_full_softmax_keeps_probabilities() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let (weights, ids) = topk_softmax(&logits, 2, TopKNormalization::FullSoftmax).unwrap();

        let probs = candle_nn::ops::softmax(&logits, D::Minus1)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![3, 2]]);
        let w = weights.to_vec2::<f32>().unwrap();
        assert!(approx_eq(w[0][0], probs[0][3], 1e-6));
        assert!(approx_eq(w[0][1], probs[0][2], 1e-6));
        assert!(w[0][0] + w[0][1] < 1.0);
    }

    #[test]
    fn topk_softmax_ties_prefer_lower_index() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.5f32, 2.0, 2.0, 0.5, 2.0]], &device).unwrap();
        let (weights, ids) = topk_softmax(&logits, 2, TopKNormalization::Renormalize).unwrap();
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![1, 2]]);
        let w = weights.to_vec2::<f32>().unwrap();
        assert!(approx_eq(w[0][0], 0.5, 1e-6));
    }

    #[test]
    fn topk_softmax_rejects_bad_k() {
        let logits = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(topk_softmax(&logits, 0, TopKNormalization::Renormalize).is_err());
        assert!(topk_softmax(&logits, 5, TopKNormalization::Renormalize).is_err());
    }

    #[test]
    fn topk_softmax_accepts_half_logits() {
        let logits = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let (weights, _) = topk_softmax(&logits, 2, TopKNormalization::Renormalize).unwrap();
        assert_eq!(weights.dtype(), DType::F32);
    }
}
