use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::CoreResult;
use crate::loader::apply_state;

/// Opaque name → tensor blob used to persist model and optimizer state.
pub type ModelState = HashMap<String, Tensor>;

/// A frozen model that supplies distillation targets.
///
/// Implementations run without gradient tracking; the returned tensor must be
/// detached from any graph.
pub trait TeacherModel {
    /// `input_ids` / `input_mask`: `[batch, seq]` u32. Returns `[batch, seq, hidden]`.
    fn forward(&self, input_ids: &Tensor, input_mask: &Tensor) -> CoreResult<Tensor>;

    fn hidden_size(&self) -> usize;

    fn parameter_count(&self) -> usize;
}

/// The trainable model.
///
/// Only [`compute_loss`](Self::compute_loss), [`classify`](Self::classify),
/// [`named_vars`](Self::named_vars) and [`config_json`](Self::config_json)
/// are required; state handling is derived from the variable list.
pub trait StudentModel {
    /// Distillation loss against `targets` (the teacher output).
    ///
    /// Either a scalar or a `[devices]` vector of per-replica losses; the
    /// training loop reduces the latter with a mean.
    fn compute_loss(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        targets: &Tensor,
    ) -> CoreResult<Tensor>;

    /// Label logits `[batch, labels]` read at each row's `label_pos`.
    ///
    /// `head_bias` is an optional `[heads, seq, seq]` attention pattern;
    /// adapters that cannot apply one ignore it (see
    /// [`supports_head_bias`](Self::supports_head_bias)).
    fn classify(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        label_pos: &Tensor,
        head_bias: Option<&Tensor>,
    ) -> CoreResult<Tensor>;

    /// Trainable variables sorted by name.
    fn named_vars(&self) -> Vec<(String, Var)>;

    /// Serializable model configuration written next to each checkpoint.
    fn config_json(&self) -> CoreResult<serde_json::Value>;

    fn state(&self) -> CoreResult<ModelState> {
        self.named_vars()
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite parameters from `state`. Non-strict loads tolerate missing keys.
    fn load_state(&self, state: &ModelState, strict: bool) -> CoreResult<()> {
        apply_state(&self.named_vars(), state, strict)?;
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.named_vars()
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum()
    }

    /// Hook for cross-process gradient averaging.
    ///
    /// Single-process adapters return the store unchanged; a distributed
    /// adapter all-reduces every gradient here before the optimizer step and
    /// reports so through [`supports_gradient_sync`](Self::supports_gradient_sync).
    fn sync_gradients(&self, grads: GradStore) -> CoreResult<GradStore> {
        Ok(grads)
    }

    /// Whether [`sync_gradients`](Self::sync_gradients) really averages
    /// across replicas. Sharded or replicated training needs it.
    fn supports_gradient_sync(&self) -> bool {
        false
    }

    fn supports_head_bias(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    struct Linear1 {
        w: Var,
    }

    impl StudentModel for Linear1 {
        fn compute_loss(&self, _: &Tensor, _: &Tensor, _: &Tensor) -> CoreResult<Tensor> {
            Ok(self.w.as_tensor().sum_all()?)
        }

        fn classify(&self, ids: &Tensor, _: &Tensor, _: &Tensor, _: Option<&Tensor>) -> CoreResult<Tensor> {
            Ok(Tensor::zeros((ids.dim(0)?, 2), DType::F32, ids.device())?)
        }

        fn named_vars(&self) -> Vec<(String, Var)> {
            vec![("w".to_string(), self.w.clone())]
        }

        fn config_json(&self) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({ "hidden_size": 4 }))
        }
    }

    #[test]
    fn test_default_state_roundtrip() {
        let m = Linear1 { w: Var::ones(4, DType::F32, &Device::Cpu).unwrap() };
        assert_eq!(m.parameter_count(), 4);
        let snapshot = m.state().unwrap();

        m.w.set(&Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap()).unwrap();
        m.load_state(&snapshot, true).unwrap();
        assert_eq!(m.w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.; 4]);
    }

    #[test]
    fn test_state_is_a_copy() {
        let m = Linear1 { w: Var::ones(2, DType::F32, &Device::Cpu).unwrap() };
        let snapshot = m.state().unwrap();
        m.w.set(&Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap()).unwrap();
        assert_eq!(snapshot["w"].to_vec1::<f32>().unwrap(), vec![1., 1.]);
        assert!(!m.supports_head_bias());
        assert!(!m.supports_gradient_sync());
    }
}
