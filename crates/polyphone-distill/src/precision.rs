//! Reduced-precision support: loss scaling over F32 master weights.
//!
//! Parameters, activations and optimizer moments stay in F32 in both modes;
//! the BERT encoder builds its additive attention mask in F32 and cannot mix
//! it with half-precision activations. [`Precision::Half`] switches the
//! training loop to a scaled loss and an optimizer-owned learning-rate
//! schedule.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::{debug, warn};

use crate::error::DistillResult;

const DYNAMIC_INITIAL_SCALE: f64 = 65536.0;
const DYNAMIC_GROWTH_INTERVAL: usize = 2000;
const MIN_SCALE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    Half,
}

impl Precision {
    pub fn is_half(self) -> bool {
        matches!(self, Precision::Half)
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Full => write!(f, "fp32"),
            Precision::Half => write!(f, "fp16"),
        }
    }
}

/// Multiplies the loss before backward and divides it out of the gradients.
///
/// A static scaler keeps its factor forever. A dynamic one halves the factor
/// and reports an overflow whenever a gradient is non-finite, and doubles it
/// after a run of clean steps.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    dynamic: bool,
    clean_steps: usize,
}

impl LossScaler {
    /// `loss_scale == 0` selects dynamic scaling.
    pub fn new(loss_scale: f64) -> Self {
        if loss_scale > 0.0 {
            Self { scale: loss_scale, dynamic: false, clean_steps: 0 }
        } else {
            Self { scale: DYNAMIC_INITIAL_SCALE, dynamic: true, clean_steps: 0 }
        }
    }

    /// Pass-through scaler for full precision.
    pub fn identity() -> Self {
        Self { scale: 1.0, dynamic: false, clean_steps: 0 }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn scale_loss(&self, loss: &Tensor) -> DistillResult<Tensor> {
        if self.scale == 1.0 {
            return Ok(loss.clone());
        }
        Ok((loss * self.scale)?)
    }

    /// Divide the scale out of every gradient in `grads`.
    ///
    /// Returns `None` when any gradient is non-finite; the caller must skip
    /// the optimizer step. The scale is adjusted accordingly.
    pub fn unscale(&mut self, mut grads: GradStore, vars: &[(String, Var)]) -> DistillResult<Option<GradStore>> {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for (_, var) in vars {
            let Some(g) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let g = g.to_dtype(DType::F32)?;
            if finite {
                let sum = g.abs()?.sum_all()?.to_scalar::<f32>()?;
                finite = sum.is_finite();
            }
            let g = if inv == 1.0 { g } else { (g * inv)? };
            grads.insert(var.as_tensor(), g);
        }
        self.update(finite);
        Ok(finite.then_some(grads))
    }

    fn update(&mut self, finite: bool) {
        if !self.dynamic {
            if !finite {
                warn!(scale = self.scale, "Non-finite gradients with static loss scale, skipping step");
            }
            return;
        }
        if finite {
            self.clean_steps += 1;
            if self.clean_steps >= DYNAMIC_GROWTH_INTERVAL {
                self.scale *= 2.0;
                self.clean_steps = 0;
                debug!(scale = self.scale, "Loss scale increased");
            }
        } else {
            self.scale = (self.scale / 2.0).max(MIN_SCALE);
            self.clean_steps = 0;
            warn!(scale = self.scale, "Gradient overflow, skipping step and reducing loss scale");
        }
    }
}
