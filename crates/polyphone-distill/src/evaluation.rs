//! Held-out evaluation at polyphone positions.
//!
//! The student's label logits are read at each example's `label_pos`. With
//! the candidate mask enabled, every label belonging to a different
//! character than the gold label is excluded before the arg-max and the
//! cross-entropy, so the model is only scored among the pronunciations of
//! the character actually in the text.

use candle_core::{DType, Device};
use serde::Serialize;
use tracing::{info, warn};

use polyphone_core::StudentModel;

use crate::distiller::progress_bar;
use crate::error::DistillResult;
use crate::features::EncodedCorpus;
use crate::sampler::Sampler;

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    pub batch_size: usize,
    /// Restrict predictions to labels sharing the gold label's character.
    pub use_logit_mask: bool,
    /// Weight the cross-entropy by inverse label frequency.
    pub use_weight: bool,
    pub show_progress: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self { batch_size: 8, use_logit_mask: true, use_weight: false, show_progress: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalReport {
    /// Examples with a gold label at `label_pos`.
    pub evaluated: usize,
    /// Examples whose `label_pos` carried no label.
    pub skipped: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub loss: f64,
}

pub fn evaluate<S: StudentModel>(
    student: &S,
    corpus: &EncodedCorpus,
    opts: &EvalOptions,
    device: &Device,
) -> DistillResult<EvalReport> {
    let candidates = corpus.masks.candidate_mask.to_dtype(DType::U8)?.to_vec2::<u8>()?;
    let weights = corpus.masks.class_weight.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let head_bias = match &corpus.masks.hybrid_attention {
        Some(mask) if student.supports_head_bias() => Some(mask),
        Some(_) => {
            warn!("Student ignores hybrid attention patterns, evaluating without them");
            None
        }
        None => None,
    };

    let order = Sampler::Sequential.indices(corpus.len(), 0);
    let batch_size = opts.batch_size.max(1);
    let pb = progress_bar(order.len().div_ceil(batch_size) as u64, "Evaluating", opts.show_progress);

    let mut report = EvalReport::default();
    let mut loss_sum = 0f64;
    let mut weight_sum = 0f64;

    for chunk in order.chunks(batch_size) {
        let batch = corpus.batch(chunk, device)?;
        let logits = student
            .classify(&batch.input_ids, &batch.input_mask, &batch.label_pos, head_bias)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        for (row, &target) in logits.iter().zip(&batch.targets) {
            if target < 0 {
                report.skipped += 1;
                continue;
            }
            let target = target as usize;
            let allowed = |j: usize| !opts.use_logit_mask || candidates[target][j] == 0;

            let (prediction, max) = row
                .iter()
                .enumerate()
                .filter(|(j, _)| allowed(*j))
                .fold((target, f32::NEG_INFINITY), |best, (j, &v)| if v > best.1 { (j, v) } else { best });
            let log_z = max
                + row
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| allowed(*j))
                    .map(|(_, &v)| (v - max).exp())
                    .sum::<f32>()
                    .ln();
            let nll = (log_z - row[target]) as f64;
            let w = if opts.use_weight { weights[target] as f64 } else { 1.0 };

            loss_sum += w * nll;
            weight_sum += w;
            report.evaluated += 1;
            if prediction == target {
                report.correct += 1;
            }
        }
        pb.inc(1);
    }

    if report.evaluated > 0 {
        report.accuracy = report.correct as f64 / report.evaluated as f64;
    }
    if weight_sum > 0.0 {
        report.loss = loss_sum / weight_sum;
    }
    pb.finish_with_message(format!("accuracy {:.4}", report.accuracy));
    info!(
        evaluated = report.evaluated,
        skipped = report.skipped,
        correct = report.correct,
        accuracy = report.accuracy,
        loss = report.loss,
        "Evaluation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{EncodedFeature, LabelVocab};
    use crate::masks::TaskMasks;
    use candle_core::{Tensor, Var};
    use polyphone_core::CoreResult;

    /// Logits come straight from a fixed `[labels]` row.
    struct FixedLogits {
        row: Var,
    }

    impl StudentModel for FixedLogits {
        fn compute_loss(&self, _: &Tensor, _: &Tensor, _: &Tensor) -> CoreResult<Tensor> {
            Ok(self.row.as_tensor().sum_all()?)
        }

        fn classify(&self, ids: &Tensor, _: &Tensor, _: &Tensor, _: Option<&Tensor>) -> CoreResult<Tensor> {
            let (b, _) = ids.dims2()?;
            let n = self.row.as_tensor().dim(0)?;
            Ok(self.row.as_tensor().unsqueeze(0)?.broadcast_as((b, n))?.contiguous()?)
        }

        fn named_vars(&self) -> Vec<(String, Var)> {
            vec![("row".to_string(), self.row.clone())]
        }

        fn config_json(&self) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    fn feature(target: i64) -> EncodedFeature {
        EncodedFeature {
            input_ids: vec![2, 5, 3, 0],
            input_mask: vec![1, 1, 1, 0],
            label_ids: vec![-1, target, -1, -1],
            label_pos: 1,
            char: "弹".to_string(),
        }
    }

    fn corpus(targets: &[i64]) -> EncodedCorpus {
        let vocab = LabelVocab::new(vec![
            "弹\tdan4".to_string(),
            "弹\ttan2".to_string(),
            "行\txing2".to_string(),
        ]);
        let counts = vec![10, 1, 0];
        EncodedCorpus {
            features: targets.iter().map(|&t| feature(t)).collect(),
            masks: TaskMasks::build(&vocab, &counts, 4, false, &Device::Cpu).unwrap(),
            label_counts: counts,
            max_seq_length: 4,
        }
    }

    fn student(row: &[f32]) -> FixedLogits {
        FixedLogits { row: Var::new(row, &Device::Cpu).unwrap() }
    }

    fn opts(mask: bool) -> EvalOptions {
        EvalOptions { batch_size: 2, use_logit_mask: mask, use_weight: false, show_progress: false }
    }

    #[test]
    fn candidate_mask_hides_other_characters() {
        // label 2 wins overall but belongs to a different character
        let s = student(&[1.0, 0.0, 5.0]);
        let c = corpus(&[0, 0, 1]);

        let masked = evaluate(&s, &c, &opts(true), &Device::Cpu).unwrap();
        assert_eq!(masked.evaluated, 3);
        assert_eq!(masked.correct, 2);

        let unmasked = evaluate(&s, &c, &opts(false), &Device::Cpu).unwrap();
        assert_eq!(unmasked.correct, 0);
        assert!(unmasked.loss > masked.loss);
    }

    #[test]
    fn unlabelled_positions_are_skipped() {
        let s = student(&[1.0, 0.0, 0.0]);
        let report = evaluate(&s, &corpus(&[0, -1, -1]), &opts(true), &Device::Cpu).unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.accuracy, 1.0);
    }

    #[test]
    fn masked_loss_matches_two_way_softmax() {
        let s = student(&[0.0, 0.0, 9.0]);
        let report = evaluate(&s, &corpus(&[1]), &opts(true), &Device::Cpu).unwrap();
        assert!((report.loss - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn weighting_favours_rare_labels() {
        let s = student(&[2.0, 0.0, 0.0]);
        let c = corpus(&[0, 1]);
        let plain = evaluate(&s, &c, &opts(true), &Device::Cpu).unwrap();
        let weighted = evaluate(
            &s,
            &c,
            &EvalOptions { use_weight: true, ..opts(true) },
            &Device::Cpu,
        )
        .unwrap();
        // the rare label 1 is the one predicted wrong, so weighting raises the loss
        assert!(weighted.loss > plain.loss);
    }
}
