//! Task-level masks built once per encoding pass.
//!
//! All three are stored as single logical tensors and broadcast over the
//! batch dimension where they are used.

use candle_core::{Device, Tensor};

use crate::error::DistillResult;
use crate::features::LabelVocab;

/// Heads in the hybrid attention stack.
pub const HYBRID_HEADS: usize = 12;
/// Smoothing constant added to every label count before weighting.
pub const CLASS_WEIGHT_SMOOTHING: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct TaskMasks {
    /// `[labels, labels]` u8; `1` means label `j` is not a candidate for true class `i`.
    pub candidate_mask: Tensor,
    /// `[labels]` f32 inverse-frequency weights.
    pub class_weight: Tensor,
    /// `[12, seq, seq]` u8; `1` means query `i` may attend to key `j`.
    pub hybrid_attention: Option<Tensor>,
}

impl TaskMasks {
    pub fn build(
        vocab: &LabelVocab,
        label_counts: &[usize],
        max_seq_length: usize,
        hybrid: bool,
        device: &Device,
    ) -> DistillResult<Self> {
        let n = vocab.len();
        let candidate_mask = Tensor::from_vec(candidate_mask(vocab), (n, n), device)?;
        let weights = class_weight(label_counts);
        let class_weight = Tensor::from_vec(weights, n, device)?;
        let hybrid_attention = if hybrid {
            let s = max_seq_length;
            Some(Tensor::from_vec(hybrid_attention(s), (HYBRID_HEADS, s, s), device)?)
        } else {
            None
        };
        Ok(Self { candidate_mask, class_weight, hybrid_attention })
    }
}

/// Row-major `[n, n]` candidate mask: 1 wherever the two labels belong to
/// different characters.
pub fn candidate_mask(vocab: &LabelVocab) -> Vec<u8> {
    let labels = vocab.labels();
    let mut out = Vec::with_capacity(labels.len() * labels.len());
    for a in labels {
        let ca = LabelVocab::char_of(a);
        for b in labels {
            out.push(u8::from(ca != LabelVocab::char_of(b)));
        }
    }
    out
}

/// `max(count) / (count + 100)` per label.
pub fn class_weight(label_counts: &[usize]) -> Vec<f32> {
    let max = label_counts.iter().copied().max().unwrap_or(0) as f64;
    label_counts
        .iter()
        .map(|&c| (max / (c as f64 + CLASS_WEIGHT_SMOOTHING)) as f32)
        .collect()
}

/// Row-major `[12, seq, seq]` hybrid attention pattern.
///
/// Heads 0-1 see only the left context (lower triangle), heads 2-3 only the
/// right context (upper triangle), heads 4-5 a window of one token either
/// side; heads 6-11 are unrestricted. The diagonal is always visible.
pub fn hybrid_attention(seq: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HYBRID_HEADS * seq * seq);
    for head in 0..HYBRID_HEADS {
        for i in 0..seq {
            for j in 0..seq {
                let visible = match head {
                    0 | 1 => j <= i,
                    2 | 3 => j >= i,
                    4 | 5 => i.abs_diff(j) <= 1,
                    _ => true,
                };
                out.push(u8::from(visible));
            }
        }
    }
    out
}
