//! Distillation training loop.
//!
//! Each micro-step pulls a batch in sampler order, runs the frozen teacher,
//! and backpropagates the student's distillation loss against the teacher
//! output. Gradients are summed over `gradient_accumulation_steps`
//! micro-steps before the optimizer updates the student:
//!
//! ```text
//! Initializing ─► Training(e, 0) ─► … ─► CheckpointingEpoch ─► Training(e+1, 0) ─► … ─► Finished
//! ```
//!
//! Every epoch ends with a tagged checkpoint; the run ends with an untagged
//! one which is read back once and shape-checked against the live student.
//!
//! In full precision the loop sets the warmup-scheduled learning rate before
//! every optimizer step. In half precision the optimizer carries the
//! schedule itself and the loss goes through a [`LossScaler`].

use std::path::PathBuf;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info};

use polyphone_core::{CoreError, StudentModel, TeacherModel};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::{DistillError, DistillResult};
use crate::evaluation::{evaluate, EvalOptions, EvalReport};
use crate::features::EncodedCorpus;
use crate::optimizer::{AdamW, AdamWConfig, WarmupSchedule};
use crate::precision::{LossScaler, Precision};
use crate::sampler::ExecutionMode;

// ── Config ────────────────────────────────────────────────────────────────────

/// Hyper-parameters for one distillation run.
#[derive(Debug, Clone)]
pub struct DistillConfig {
    pub epochs: usize,
    /// Examples per micro-step, already divided by the accumulation factor.
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    /// Fraction of total steps spent ramping the learning rate up.
    pub warmup_proportion: f64,
    /// Base learning rate lives in `optimizer.lr`.
    pub optimizer: AdamWConfig,
    pub precision: Precision,
    /// `0` selects dynamic loss scaling; only used in half precision.
    pub loss_scale: f64,
    pub seed: u64,
    pub eval_every_epoch: bool,
    pub use_logit_mask: bool,
    pub use_weight: bool,
    pub output_dir: PathBuf,
    pub show_progress: bool,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            train_batch_size: 32,
            eval_batch_size: 8,
            gradient_accumulation_steps: 1,
            warmup_proportion: 0.1,
            optimizer: AdamWConfig::default(),
            precision: Precision::Full,
            loss_scale: 0.0,
            seed: 42,
            eval_every_epoch: false,
            use_logit_mask: true,
            use_weight: false,
            output_dir: PathBuf::from("output"),
            show_progress: true,
        }
    }
}

impl DistillConfig {
    pub fn validate(&self) -> DistillResult<()> {
        if self.gradient_accumulation_steps < 1 {
            return Err(DistillError::Configuration(format!(
                "gradient accumulation steps must be >= 1, got {}",
                self.gradient_accumulation_steps
            )));
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(DistillError::Configuration("batch sizes must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.warmup_proportion) {
            return Err(DistillError::Configuration(format!(
                "warmup proportion must lie in [0, 1], got {}",
                self.warmup_proportion
            )));
        }
        Ok(())
    }

    /// Optimizer steps over the whole run, shared by every process.
    pub fn total_steps(&self, examples: usize, world_size: usize) -> usize {
        let steps = examples as f64
            / self.train_batch_size as f64
            / self.gradient_accumulation_steps as f64
            * self.epochs as f64
            / world_size.max(1) as f64;
        (steps.ceil() as usize).max(1)
    }

    fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            batch_size: self.eval_batch_size,
            use_logit_mask: self.use_logit_mask,
            use_weight: self.use_weight,
            show_progress: self.show_progress,
        }
    }
}

// ── Loop state ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Training { epoch: usize, step: usize },
    CheckpointingEpoch { epoch: usize },
    Finished,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Initializing => write!(f, "initializing"),
            LoopState::Training { epoch, step } => write!(f, "training(epoch {epoch}, step {step})"),
            LoopState::CheckpointingEpoch { epoch } => write!(f, "checkpointing(epoch {epoch})"),
            LoopState::Finished => write!(f, "finished"),
        }
    }
}

/// Summary returned after training.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingStats {
    pub global_step: usize,
    /// Last micro-step loss, before accumulation scaling.
    pub final_loss: f32,
    /// Mean micro-step loss per epoch trained in this run.
    pub epoch_losses: Vec<f32>,
    /// Learning rate applied at each optimizer step of this run.
    pub lr_history: Vec<f64>,
    pub evaluations: Vec<(usize, EvalReport)>,
    pub elapsed_secs: f64,
}

// ── Distiller ─────────────────────────────────────────────────────────────────

pub struct Distiller<T, S> {
    teacher: T,
    student: S,
    optimizer: AdamW,
    scaler: LossScaler,
    schedule: WarmupSchedule,
    mode: ExecutionMode,
    config: DistillConfig,
    checkpoints: CheckpointManager,
    device: Device,
    state: LoopState,
    start_epoch: usize,
    global_step: usize,
}

impl<T: TeacherModel, S: StudentModel> Distiller<T, S> {
    /// `train_examples` sizes the warmup schedule. Multi-process modes
    /// require a student that synchronises gradients; replicated modes fall
    /// back to one device without it.
    pub fn new(
        teacher: T,
        student: S,
        config: DistillConfig,
        mode: ExecutionMode,
        train_examples: usize,
        device: Device,
    ) -> DistillResult<Self> {
        config.validate()?;
        let mode = mode.settle(student.supports_gradient_sync())?;
        let schedule = WarmupSchedule {
            warmup_proportion: config.warmup_proportion,
            total_steps: config.total_steps(train_examples, mode.world_size()),
        };
        let optimizer = AdamW::new(student.named_vars(), config.optimizer.clone())?;
        let (optimizer, scaler) = if config.precision.is_half() {
            (optimizer.with_schedule(schedule), LossScaler::new(config.loss_scale))
        } else {
            (optimizer, LossScaler::identity())
        };
        let checkpoints = CheckpointManager::new(&config.output_dir);

        Ok(Self {
            teacher,
            student,
            optimizer,
            scaler,
            schedule,
            mode,
            config,
            checkpoints,
            device,
            state: LoopState::Initializing,
            start_epoch: 0,
            global_step: 0,
        })
    }

    /// Restore student and optimizer from the checkpoint of `epoch`;
    /// training continues at `epoch + 1`.
    pub fn resume(&mut self, epoch: usize, checkpoint: &Checkpoint) -> DistillResult<()> {
        self.student.load_state(&checkpoint.model, true)?;
        match &checkpoint.optimizer {
            Some(state) => {
                self.optimizer.load_state(state)?;
                self.global_step = self.optimizer.step_count();
            }
            None => {
                // no saved counter, so rebuild it from the epochs already done
                self.global_step = self.schedule.total_steps * (epoch + 1) / self.config.epochs.max(1);
            }
        }
        self.start_epoch = epoch + 1;
        info!(epoch, start_epoch = self.start_epoch, global_step = self.global_step, "Resuming from checkpoint");
        Ok(())
    }

    pub fn student(&self) -> &S {
        &self.student
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn total_steps(&self) -> usize {
        self.schedule.total_steps
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = %self.state, to = %next, "Loop state");
        self.state = next;
    }

    /// Train for the remaining epochs, checkpointing after each one.
    pub fn train(&mut self, train: &EncodedCorpus, eval: Option<&EncodedCorpus>) -> DistillResult<TrainingStats> {
        if train.is_empty() {
            return Err(DistillError::Configuration("no training features to distill on".to_string()));
        }
        let vars = self.student.named_vars();
        let sampler = self.mode.sampler(self.config.seed);
        let batch_size = self.config.train_batch_size;
        let accum = self.config.gradient_accumulation_steps;
        let primary = self.mode.is_primary();
        let micro_steps = sampler.epoch_len(train.len()).div_ceil(batch_size);

        info!(
            examples = train.len(),
            batch_size,
            accumulation = accum,
            steps = self.schedule.total_steps,
            teacher_params = self.teacher.parameter_count(),
            student_params = self.student.parameter_count(),
            mode = %self.mode,
            precision = %self.config.precision,
            loss_scale = self.scaler.scale(),
            dynamic_scale = self.scaler.is_dynamic(),
            "Running distillation"
        );

        let mut stats = TrainingStats { global_step: self.global_step, ..Default::default() };
        let mut pending = GradAccumulator::new(vars.len());
        let start = Instant::now();

        for epoch in self.start_epoch..self.config.epochs {
            self.transition(LoopState::Training { epoch, step: 0 });
            let order = sampler.indices(train.len(), epoch);
            let pb = progress_bar(
                micro_steps as u64,
                &format!("epoch {}/{}", epoch + 1, self.config.epochs),
                primary && self.config.show_progress,
            );
            let mut epoch_loss = 0f64;
            let mut epoch_steps = 0usize;

            for (step, chunk) in order.chunks(batch_size).enumerate() {
                self.state = LoopState::Training { epoch, step };
                let batch = train.batch(chunk, &self.device)?;

                let targets = self.teacher.forward(&batch.input_ids, &batch.input_mask)?;
                let mut loss = self.student.compute_loss(&batch.input_ids, &batch.input_mask, &targets)?;
                if loss.rank() > 0 {
                    loss = loss.mean_all()?;
                }
                let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
                if accum > 1 {
                    loss = (loss / accum as f64)?;
                }
                let grads = self.scaler.scale_loss(&loss)?.backward()?;

                stats.final_loss = value;
                epoch_loss += value as f64;
                epoch_steps += 1;

                if (step + 1) % accum != 0 {
                    pending.absorb(grads, &vars)?;
                } else {
                    let grads = pending.finish(grads, &vars)?;
                    if let Some(lr) = self.optimizer_step(grads, &vars)? {
                        stats.lr_history.push(lr);
                    }
                }
                pb.set_message(format!("epoch {}/{} loss {:.4}", epoch + 1, self.config.epochs, value));
                pb.inc(1);
            }

            let mean_loss = (epoch_loss / epoch_steps.max(1) as f64) as f32;
            stats.epoch_losses.push(mean_loss);
            pb.finish_with_message(format!("epoch {} done, loss {mean_loss:.4}", epoch + 1));
            info!(epoch, loss = mean_loss, global_step = self.global_step, "Epoch complete");

            self.transition(LoopState::CheckpointingEpoch { epoch });
            if primary {
                self.save(Some(epoch))?;
            }
            if let (true, Some(eval)) = (self.config.eval_every_epoch, eval) {
                let report = evaluate(&self.student, eval, &self.config.eval_options(), &self.device)?;
                stats.evaluations.push((epoch, report));
            }
        }

        if primary {
            self.save(None)?;
            self.verify_final()?;
        }
        self.transition(LoopState::Finished);

        stats.global_step = self.global_step;
        stats.elapsed_secs = start.elapsed().as_secs_f64();
        info!(
            global_step = stats.global_step,
            loss = stats.final_loss,
            elapsed = %format_duration(stats.elapsed_secs as u64),
            "Distillation complete"
        );
        Ok(stats)
    }

    /// Run the student over `corpus` once.
    pub fn evaluate(&self, corpus: &EncodedCorpus) -> DistillResult<EvalReport> {
        evaluate(&self.student, corpus, &self.config.eval_options(), &self.device)
    }

    /// Returns the applied learning rate, or `None` when the step was
    /// skipped on gradient overflow.
    fn optimizer_step(&mut self, grads: GradStore, vars: &[(String, Var)]) -> DistillResult<Option<f64>> {
        let grads = self.student.sync_gradients(grads)?;
        let Some(grads) = self.scaler.unscale(grads, vars)? else {
            return Ok(None);
        };
        if !self.config.precision.is_half() {
            let lr = self.schedule.lr_at(self.config.optimizer.lr, self.global_step);
            self.optimizer.set_learning_rate(lr);
        }
        let lr = self.optimizer.learning_rate();
        let norm = self.optimizer.step(&grads)?;
        self.global_step += 1;
        debug!(
            global_step = self.global_step,
            lr,
            grad_norm = norm,
            loss_scale = self.scaler.scale(),
            "Optimizer step"
        );
        Ok(Some(lr))
    }

    fn save(&self, epoch: Option<usize>) -> DistillResult<()> {
        self.checkpoints.save(
            epoch,
            &self.student.state()?,
            &self.optimizer.state()?,
            &self.student.config_json()?,
        )
    }

    /// Read the final checkpoint back and compare it with the live student.
    fn verify_final(&self) -> DistillResult<()> {
        let saved = self.checkpoints.load(None, &self.device)?;
        for (name, var) in self.student.named_vars() {
            let Some(t) = saved.model.get(&name) else {
                return Err(CoreError::StateMismatch(format!("final checkpoint lacks {name}")).into());
            };
            if t.dims() != var.dims() {
                return Err(CoreError::StateMismatch(format!(
                    "final checkpoint {name} has shape {:?}, student has {:?}",
                    t.dims(),
                    var.dims()
                ))
                .into());
            }
        }
        info!(tensors = saved.model.len(), "Final checkpoint verified");
        Ok(())
    }
}

// ── Gradient accumulation ─────────────────────────────────────────────────────

/// Running per-variable gradient sums between optimizer steps.
///
/// Only variable gradients are kept, so the activation gradients of earlier
/// micro-steps are dropped as soon as they are absorbed.
struct GradAccumulator {
    sums: Vec<Option<Tensor>>,
}

impl GradAccumulator {
    fn new(vars: usize) -> Self {
        Self { sums: vec![None; vars] }
    }

    fn absorb(&mut self, mut grads: GradStore, vars: &[(String, Var)]) -> DistillResult<()> {
        for (slot, (_, var)) in self.sums.iter_mut().zip(vars) {
            if let Some(g) = grads.remove(var.as_tensor()) {
                *slot = Some(match slot.take() {
                    Some(prev) => (prev + g)?,
                    None => g,
                });
            }
        }
        Ok(())
    }

    /// Fold the pending sums into the last micro-step's store and reset.
    fn finish(&mut self, mut grads: GradStore, vars: &[(String, Var)]) -> DistillResult<GradStore> {
        for (slot, (_, var)) in self.sums.iter_mut().zip(vars) {
            let Some(prev) = slot.take() else {
                continue;
            };
            let sum = match grads.remove(var.as_tensor()) {
                Some(g) => (prev + g)?,
                None => prev,
            };
            grads.insert(var.as_tensor(), sum);
        }
        Ok(grads)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub(crate) fn progress_bar(total: u64, label: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓░"),
    );
    pb.set_message(label.to_string());
    pb
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CONFIG_NAME, OPTIMIZER_NAME, WEIGHTS_NAME};
    use crate::features::{EncodedFeature, LabelVocab};
    use crate::masks::TaskMasks;
    use candle_core::DType;
    use polyphone_core::CoreResult;

    /// Emits zeros shaped `[batch, seq, 1]`.
    struct ZeroTeacher;

    impl TeacherModel for ZeroTeacher {
        fn forward(&self, input_ids: &Tensor, _: &Tensor) -> CoreResult<Tensor> {
            let (b, s) = input_ids.dims2()?;
            Ok(Tensor::zeros((b, s, 1), DType::F32, input_ids.device())?)
        }

        fn hidden_size(&self) -> usize {
            1
        }

        fn parameter_count(&self) -> usize {
            0
        }
    }

    /// Loss `w²` per micro-step, so a fresh student reports 1.0 each time.
    struct SquareStudent {
        w: Var,
    }

    impl SquareStudent {
        fn new() -> Self {
            Self { w: Var::new(&[1f32], &Device::Cpu).unwrap() }
        }

        fn weight(&self) -> f32 {
            self.w.as_tensor().to_vec1::<f32>().unwrap()[0]
        }
    }

    impl StudentModel for SquareStudent {
        fn compute_loss(&self, _: &Tensor, _: &Tensor, _: &Tensor) -> CoreResult<Tensor> {
            Ok(self.w.as_tensor().sqr()?.sum_all()?)
        }

        fn classify(&self, ids: &Tensor, _: &Tensor, _: &Tensor, _: Option<&Tensor>) -> CoreResult<Tensor> {
            let (b, _) = ids.dims2()?;
            Ok(self.w.as_tensor().unsqueeze(0)?.broadcast_as((b, 2))?.contiguous()?)
        }

        fn named_vars(&self) -> Vec<(String, Var)> {
            vec![("w".to_string(), self.w.clone())]
        }

        fn config_json(&self) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({ "kind": "square" }))
        }
    }

    fn corpus(n: usize) -> EncodedCorpus {
        let vocab = LabelVocab::new(vec!["弹\tdan4".to_string(), "弹\ttan2".to_string()]);
        let feature = EncodedFeature {
            input_ids: vec![2, 5, 3, 0],
            input_mask: vec![1, 1, 1, 0],
            label_ids: vec![-1, 0, -1, -1],
            label_pos: 1,
            char: "弹".to_string(),
        };
        EncodedCorpus {
            features: vec![feature; n],
            masks: TaskMasks::build(&vocab, &[n, 0], 4, false, &Device::Cpu).unwrap(),
            label_counts: vec![n, 0],
            max_seq_length: 4,
        }
    }

    fn config(dir: &std::path::Path, epochs: usize, accum: usize) -> DistillConfig {
        DistillConfig {
            epochs,
            train_batch_size: 1,
            gradient_accumulation_steps: accum,
            output_dir: dir.to_path_buf(),
            show_progress: false,
            ..Default::default()
        }
    }

    fn distiller(cfg: DistillConfig, examples: usize) -> Distiller<ZeroTeacher, SquareStudent> {
        Distiller::new(ZeroTeacher, SquareStudent::new(), cfg, ExecutionMode::Single, examples, Device::Cpu)
            .unwrap()
    }

    #[test]
    fn total_steps_divides_by_accumulation_and_world() {
        let cfg = DistillConfig { epochs: 3, train_batch_size: 4, gradient_accumulation_steps: 2, ..Default::default() };
        assert_eq!(cfg.total_steps(100, 1), 38);
        assert_eq!(cfg.total_steps(100, 2), 19);
        assert_eq!(cfg.total_steps(0, 1), 1);
    }

    #[test]
    fn invalid_accumulation_is_configuration_error() {
        let cfg = DistillConfig { gradient_accumulation_steps: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(DistillError::Configuration(_))));
    }

    #[test]
    fn accumulation_steps_only_after_second_micro_step() {
        let dir = tempfile::tempdir().unwrap();
        // two micro-steps of loss 1.0 with a factor of 3: no update at all
        let mut d = distiller(config(dir.path(), 1, 3), 2);
        let stats = d.train(&corpus(2), None).unwrap();
        assert_eq!(stats.global_step, 0);
        assert!(stats.lr_history.is_empty());
        assert_eq!(d.student().weight(), 1.0);
        assert_eq!(stats.final_loss, 1.0);

        // a pair of micro-steps with a factor of 2: exactly one update
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 1, 2);
        cfg.warmup_proportion = 0.0;
        let mut d = distiller(cfg, 2);
        assert_eq!(d.total_steps(), 1);
        let stats = d.train(&corpus(2), None).unwrap();
        assert_eq!(stats.global_step, 1);
        assert_eq!(stats.epoch_losses, vec![1.0]);
        assert!(d.student().weight() < 1.0);
    }

    #[test]
    fn learning_rate_follows_warmup_at_global_step() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 1, 2);
        let base = cfg.optimizer.lr;
        let mut d = distiller(cfg, 4);
        assert_eq!(d.total_steps(), 2);
        let stats = d.train(&corpus(4), None).unwrap();
        assert_eq!(stats.global_step, 2);
        let expected: Vec<f64> = (0..2)
            .map(|s| base * crate::optimizer::warmup_linear(s as f64 / 2.0, 0.1))
            .collect();
        assert_eq!(stats.lr_history.len(), 2);
        for (got, want) in stats.lr_history.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12);
        }
        assert_eq!(stats.lr_history[0], 0.0);
    }

    #[test]
    fn every_epoch_is_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = distiller(config(dir.path(), 2, 1), 3);
        d.train(&corpus(3), None).unwrap();
        assert_eq!(d.state(), LoopState::Finished);
        for name in [WEIGHTS_NAME, OPTIMIZER_NAME, CONFIG_NAME] {
            assert!(dir.path().join(format!("{name}_0")).is_file());
            assert!(dir.path().join(format!("{name}_1")).is_file());
            assert!(dir.path().join(name).is_file());
        }
        let mgr = CheckpointManager::new(dir.path());
        assert_eq!(mgr.latest_epoch().unwrap(), Some(1));
        let final_ckpt = mgr.load(None, &Device::Cpu).unwrap();
        assert_eq!(final_ckpt.config["kind"], "square");
    }

    #[test]
    fn resume_continues_after_latest_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = distiller(config(dir.path(), 3, 1), 2);
        first.train(&corpus(2), None).unwrap();
        let trained = first.student().weight();
        std::fs::remove_file(dir.path().join(WEIGHTS_NAME)).unwrap();

        let mgr = CheckpointManager::new(dir.path());
        let latest = mgr.resume_epoch().unwrap().unwrap();
        assert_eq!(latest, 2);
        let ckpt = mgr.load(Some(latest), &Device::Cpu).unwrap();

        let mut second = distiller(config(dir.path(), 4, 1), 2);
        second.resume(latest, &ckpt).unwrap();
        assert_eq!(second.student().weight(), trained);
        assert_eq!(second.global_step, 6);

        let stats = second.train(&corpus(2), None).unwrap();
        assert_eq!(stats.epoch_losses.len(), 1);
        assert_eq!(stats.global_step, 8);
        assert!(dir.path().join(format!("{WEIGHTS_NAME}_3")).is_file());
        assert!(dir.path().join(WEIGHTS_NAME).is_file());
    }

    #[test]
    fn resume_past_last_epoch_only_saves_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = distiller(config(dir.path(), 2, 1), 2);
        first.train(&corpus(2), None).unwrap();
        let mgr = CheckpointManager::new(dir.path());
        let ckpt = mgr.load(Some(1), &Device::Cpu).unwrap();

        let mut again = distiller(config(dir.path(), 2, 1), 2);
        again.resume(1, &ckpt).unwrap();
        let stats = again.train(&corpus(2), None).unwrap();
        assert!(stats.epoch_losses.is_empty());
        assert_eq!(stats.global_step, 4);
    }

    #[test]
    fn eval_every_epoch_records_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 2, 1);
        cfg.eval_every_epoch = true;
        let mut d = distiller(cfg, 2);
        let eval = corpus(3);
        let stats = d.train(&corpus(2), Some(&eval)).unwrap();
        assert_eq!(stats.evaluations.len(), 2);
        assert_eq!(stats.evaluations[0].1.evaluated, 3);
    }

    #[test]
    fn sharding_needs_gradient_sync() {
        let dir = tempfile::tempdir().unwrap();
        let sharded = ExecutionMode::Distributed { rank: 0, world_size: 2 };
        let built = Distiller::new(ZeroTeacher, SquareStudent::new(), config(dir.path(), 1, 1), sharded, 2, Device::Cpu);
        assert!(matches!(built, Err(DistillError::Configuration(_))));

        let replicated = ExecutionMode::DataParallel { devices: 2 };
        let d = Distiller::new(ZeroTeacher, SquareStudent::new(), config(dir.path(), 1, 1), replicated, 2, Device::Cpu)
            .unwrap();
        assert_eq!(d.mode(), ExecutionMode::Single);
        assert_eq!(d.total_steps(), 2);
    }

    #[test]
    fn half_precision_trains_bert_adapters() {
        use crate::student::{BertStudent, StudentHeads, StudentInit};
        use crate::teacher::tests::{tiny_config_json, write_tiny_bert};
        use crate::teacher::BertTeacher;

        let dir = tempfile::tempdir().unwrap();
        let (weights, teacher_config) = write_tiny_bert(dir.path(), 8);
        let teacher = BertTeacher::load(&weights, &teacher_config, &Device::Cpu).unwrap();
        let student_config = dir.path().join("student_config.json");
        std::fs::write(&student_config, tiny_config_json(4).to_string()).unwrap();
        let heads = StudentHeads { teacher_hidden_size: 8, num_labels: 2, kd_ratio: 1.0 };
        let student =
            BertStudent::build(StudentInit::Random { config: student_config }, heads, &Device::Cpu).unwrap();

        let mut cfg = config(dir.path(), 1, 1);
        cfg.precision = Precision::Half;
        cfg.loss_scale = 128.0;
        cfg.warmup_proportion = 0.0;
        cfg.eval_every_epoch = true;
        let mut d = Distiller::new(teacher, student, cfg, ExecutionMode::Single, 2, Device::Cpu).unwrap();
        let stats = d.train(&corpus(2), Some(&corpus(2))).unwrap();
        assert_eq!(stats.global_step, 2);
        assert_eq!(stats.lr_history.len(), 2);
        assert!(stats.final_loss.is_finite());
        assert_eq!(stats.evaluations[0].1.evaluated, 2);
        assert!(stats.evaluations[0].1.loss.is_finite());
    }

    #[test]
    fn durations_format_like_a_clock() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 05s");
        assert_eq!(format_duration(3725), "1h 02m 05s");
    }
}
