//! BERT-style AdamW with checkpointable state.
//!
//! Differs from `candle_nn::optim::AdamW` in three ways the training loop
//! relies on: no bias correction, weight decay skipped for bias and
//! LayerNorm parameters, and moment buffers that can be exported to and
//! restored from a [`ModelState`] blob.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::{debug, warn};

use polyphone_core::{CoreError, ModelState};

use crate::error::DistillResult;

const STEP_KEY: &str = "step";
const EXP_AVG_PREFIX: &str = "exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "exp_avg_sq.";

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// Global gradient-norm clip; `<= 0` disables clipping.
    pub max_grad_norm: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 5e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
        }
    }
}

/// Linear warmup followed by linear decay, as a multiplier of the base rate.
///
/// `x` is training progress in `[0, 1]`; `warmup` the warmup fraction.
pub fn warmup_linear(x: f64, warmup: f64) -> f64 {
    if x < warmup {
        return x / warmup;
    }
    if (warmup - 1.0).abs() < f64::EPSILON {
        return 0.0;
    }
    ((x - 1.0) / (warmup - 1.0)).max(0.0)
}

/// A warmup schedule bound to a run length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupSchedule {
    pub warmup_proportion: f64,
    pub total_steps: usize,
}

impl WarmupSchedule {
    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr_at(&self, base_lr: f64, step: usize) -> f64 {
        let progress = step as f64 / self.total_steps.max(1) as f64;
        base_lr * warmup_linear(progress, self.warmup_proportion)
    }
}

/// Parameters exempt from weight decay.
pub fn is_no_decay(name: &str) -> bool {
    name.ends_with("bias") || name.ends_with("LayerNorm.weight")
}

struct ParamState {
    name: String,
    var: Var,
    decay: bool,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

pub struct AdamW {
    params: Vec<ParamState>,
    config: AdamWConfig,
    step: usize,
    schedule: Option<WarmupSchedule>,
}

impl AdamW {
    pub fn new(vars: Vec<(String, Var)>, config: AdamWConfig) -> DistillResult<Self> {
        let params = vars
            .into_iter()
            .map(|(name, var)| {
                let zeros = Tensor::zeros(var.shape(), DType::F32, var.device())?;
                Ok(ParamState {
                    decay: !is_no_decay(&name),
                    name,
                    var,
                    exp_avg: zeros.clone(),
                    exp_avg_sq: zeros,
                })
            })
            .collect::<DistillResult<Vec<_>>>()?;
        let no_decay = params.iter().filter(|p| !p.decay).count();
        debug!(params = params.len(), no_decay, "AdamW initialised");
        Ok(Self { params, config, step: 0, schedule: None })
    }

    /// Let the optimizer derive its own learning rate from the step count.
    pub fn with_schedule(mut self, schedule: WarmupSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// The rate the next [`step`](Self::step) will apply.
    pub fn learning_rate(&self) -> f64 {
        match &self.schedule {
            Some(s) => s.lr_at(self.config.lr, self.step),
            None => self.config.lr,
        }
    }

    /// Overrides the base rate; with an internal schedule the warmup
    /// multiplier is still applied on top.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Global L2 norm over all parameter gradients present in `grads`.
    pub fn grad_norm(&self, grads: &GradStore) -> DistillResult<f64> {
        let mut total = 0f64;
        for p in &self.params {
            if let Some(g) = grads.get(p.var.as_tensor()) {
                total += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(total.sqrt())
    }

    /// Apply one update from `grads`, clipping to `max_grad_norm` first.
    ///
    /// Returns the pre-clip gradient norm.
    pub fn step(&mut self, grads: &GradStore) -> DistillResult<f64> {
        let lr = self.learning_rate();
        let c = &self.config;
        let norm = self.grad_norm(grads)?;
        let clip = if c.max_grad_norm > 0.0 && norm > c.max_grad_norm {
            c.max_grad_norm / (norm + 1e-6)
        } else {
            1.0
        };

        for p in self.params.iter_mut() {
            let Some(g) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let g = (g.to_dtype(DType::F32)? * clip)?;
            let exp_avg = ((&p.exp_avg * c.beta1)? + (&g * (1.0 - c.beta1))?)?;
            let exp_avg_sq = ((&p.exp_avg_sq * c.beta2)? + (g.sqr()? * (1.0 - c.beta2))?)?;
            let weights = p.var.as_tensor().to_dtype(DType::F32)?;
            let mut update = (&exp_avg / (exp_avg_sq.sqrt()? + c.eps)?)?;
            if p.decay && c.weight_decay > 0.0 {
                update = (update + (&weights * c.weight_decay)?)?;
            }
            let next = (weights - (update * lr)?)?;
            p.var.set(&next.to_dtype(p.var.dtype())?)?;
            p.exp_avg = exp_avg;
            p.exp_avg_sq = exp_avg_sq;
        }
        self.step += 1;
        Ok(norm)
    }

    /// Export step counter and moment buffers.
    pub fn state(&self) -> DistillResult<ModelState> {
        let device = self
            .params
            .first()
            .map(|p| p.var.device().clone())
            .unwrap_or(candle_core::Device::Cpu);
        let mut state = ModelState::new();
        state.insert(STEP_KEY.to_string(), Tensor::new(&[self.step as f64], &device)?);
        for p in &self.params {
            state.insert(format!("{EXP_AVG_PREFIX}{}", p.name), p.exp_avg.copy()?);
            state.insert(format!("{EXP_AVG_SQ_PREFIX}{}", p.name), p.exp_avg_sq.copy()?);
        }
        Ok(state)
    }

    /// Restore state exported by [`state`](Self::state).
    ///
    /// Buffers absent from `state` keep their zero initialisation.
    pub fn load_state(&mut self, state: &ModelState) -> DistillResult<()> {
        if let Some(step) = state.get(STEP_KEY) {
            let v = step.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
            self.step = v.first().copied().unwrap_or(0.0) as usize;
        }
        let mut missing = 0usize;
        for p in self.params.iter_mut() {
            for (prefix, slot) in [
                (EXP_AVG_PREFIX, &mut p.exp_avg),
                (EXP_AVG_SQ_PREFIX, &mut p.exp_avg_sq),
            ] {
                let key = format!("{prefix}{}", p.name);
                match state.get(&key) {
                    Some(t) if t.dims() == slot.dims() => {
                        *slot = t.to_dtype(DType::F32)?.to_device(p.var.device())?;
                    }
                    Some(t) => {
                        return Err(CoreError::StateMismatch(format!(
                            "optimizer buffer {key} has shape {:?}, expected {:?}",
                            t.dims(),
                            slot.dims()
                        ))
                        .into())
                    }
                    None => missing += 1,
                }
            }
        }
        if missing > 0 {
            warn!(missing, "Optimizer buffers not found in state, starting them at zero");
        }
        debug!(step = self.step, "Optimizer state restored");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn warmup_linear_ramps_then_decays() {
        assert_eq!(warmup_linear(0.0, 0.1), 0.0);
        assert!((warmup_linear(0.05, 0.1) - 0.5).abs() < 1e-12);
        assert!((warmup_linear(0.1, 0.1) - 1.0).abs() < 1e-12);
        assert!((warmup_linear(0.55, 0.1) - 0.5).abs() < 1e-12);
        assert_eq!(warmup_linear(1.0, 0.1), 0.0);
        assert_eq!(warmup_linear(1.5, 0.1), 0.0);
        assert_eq!(warmup_linear(1.0, 1.0), 0.0);
    }

    #[test]
    fn schedule_uses_step_over_total() {
        let s = WarmupSchedule { warmup_proportion: 0.5, total_steps: 4 };
        assert_eq!(s.lr_at(1.0, 0), 0.0);
        assert!((s.lr_at(1.0, 1) - 0.5).abs() < 1e-12);
        assert!((s.lr_at(1.0, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn no_decay_names() {
        assert!(is_no_decay("encoder.layer.0.output.dense.bias"));
        assert!(is_no_decay("embeddings.LayerNorm.weight"));
        assert!(is_no_decay("embeddings.LayerNorm.bias"));
        assert!(!is_no_decay("encoder.layer.0.output.dense.weight"));
    }

    #[test]
    fn step_moves_against_gradient() {
        let w = var(&[1.0, -1.0]);
        let cfg = AdamWConfig { lr: 0.1, weight_decay: 0.0, ..Default::default() };
        let mut opt = AdamW::new(vec![("w".to_string(), w.clone())], cfg).unwrap();
        let loss = w.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        let after = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!(after[0] < 1.0 && after[1] < -1.0);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn bias_is_not_decayed() {
        let w = var(&[2.0]);
        let b = var(&[2.0]);
        let cfg = AdamWConfig { lr: 0.1, weight_decay: 0.5, max_grad_norm: 0.0, ..Default::default() };
        let mut opt = AdamW::new(
            vec![("dense.weight".to_string(), w.clone()), ("dense.bias".to_string(), b.clone())],
            cfg,
        )
        .unwrap();
        // zero gradients: only weight decay can move the parameters
        let mut grads = (w.as_tensor().sum_all().unwrap() + b.as_tensor().sum_all().unwrap())
            .unwrap()
            .backward()
            .unwrap();
        for v in [&w, &b] {
            grads.insert(v.as_tensor(), v.as_tensor().zeros_like().unwrap());
        }
        opt.step(&grads).unwrap();
        let decayed = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((decayed - 1.9).abs() < 1e-6, "got {decayed}");
        assert_eq!(b.as_tensor().to_vec1::<f32>().unwrap()[0], 2.0);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn clipping_reports_raw_norm() {
        let w = var(&[0.0, 0.0]);
        let mut opt = AdamW::new(vec![("w".to_string(), w.clone())], AdamWConfig::default()).unwrap();
        let loss = (w.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let norm = opt.step(&grads).unwrap();
        assert!((norm - (18f64).sqrt()).abs() < 1e-4);
    }

    #[test]
    fn internal_schedule_drives_learning_rate() {
        let w = var(&[1.0]);
        let mut opt = AdamW::new(vec![("w".to_string(), w.clone())], AdamWConfig::default())
            .unwrap()
            .with_schedule(WarmupSchedule { warmup_proportion: 0.5, total_steps: 2 });
        assert_eq!(opt.learning_rate(), 0.0);
        let grads = w.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        assert!((opt.learning_rate() - 5e-5).abs() < 1e-12);
    }

    #[test]
    fn state_roundtrip_restores_moments_and_step() {
        let w = var(&[1.0, 2.0]);
        let mut opt = AdamW::new(vec![("w".to_string(), w.clone())], AdamWConfig::default()).unwrap();
        for _ in 0..3 {
            let grads = w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let saved = opt.state().unwrap();

        let mut fresh = AdamW::new(vec![("w".to_string(), w.clone())], AdamWConfig::default()).unwrap();
        fresh.load_state(&saved).unwrap();
        assert_eq!(fresh.step_count(), 3);
        let a = saved["exp_avg.w"].to_vec1::<f32>().unwrap();
        let b = fresh.state().unwrap()["exp_avg.w"].to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
