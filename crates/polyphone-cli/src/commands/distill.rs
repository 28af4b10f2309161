//! `polyphone distill`: train a student BERT against a frozen teacher.
//!
//! ## Modes
//!
//! **Train from a pretrained student** (hub id or local directory):
//! ```text
//! polyphone distill \
//!   --data-dir        ./data \
//!   --bert-model      bert-base-chinese \
//!   --teacher-model   ./teacher/pytorch_model.bin \
//!   --teacher-config  ./teacher/config.json \
//!   --output-dir      ./output/student \
//!   --do-train --eval-every-epoch
//! ```
//!
//! **Train a randomly initialised student** of a custom shape:
//! ```text
//! polyphone distill ... --do-train --no-pretrain --config-path ./small.json
//! ```
//!
//! **Evaluate only**: `--do-eval` without `--do-train` scores the final
//! checkpoint in `--output-dir` when one exists, else the pretrained model.
//!
//! ## Data directory
//!
//! ```text
//! data/
//!   train.json           [{"text": "...", "phone": [[pos, "弹\tdan4"]], "position": pos, "char": "弹"}]
//!   test_<set>.json      same shape
//!   info.json            {"phones": ["弹\tdan4", "弹\ttan2", ...]}
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Args;
use tracing::{info, warn};

use polyphone_core::device::{device_count, device_name, seed_device};
use polyphone_core::{select_device, ModelFiles, StudentModel, TeacherModel, Tokenizer};
use polyphone_distill::checkpoint::{CONFIG_NAME, WEIGHTS_NAME};
use polyphone_distill::optimizer::AdamWConfig;
use polyphone_distill::{
    encode, evaluate, BertStudent, BertTeacher, Checkpoint, CheckpointManager, CorpusLoader, DistillConfig,
    DistillError, Distiller, EncodeOptions, EncodedCorpus, EvalOptions, ExecutionMode, LabelVocab, Precision,
    StudentHeads, StudentInit,
};

use crate::config::{expand_cache_dir, AppConfig};

#[derive(Debug, Clone, Args)]
pub struct DistillArgs {
    /// Directory holding train.json, test_<set>.json and info.json.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Pretrained student and tokenizer: a Hugging Face id or a local directory.
    #[arg(long)]
    pub bert_model: String,

    /// Where checkpoints are written and resumed from.
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Maximum sequence length including [CLS] and [SEP].
    #[arg(long)]
    pub max_seq_length: Option<usize>,

    #[arg(long)]
    pub do_train: bool,

    #[arg(long)]
    pub do_eval: bool,

    /// Total batch size per optimizer step; divided by the accumulation factor.
    #[arg(long)]
    pub train_batch_size: Option<usize>,

    #[arg(long)]
    pub eval_batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub num_train_epochs: Option<usize>,

    /// Fraction of training spent on linear learning-rate warmup.
    #[arg(long)]
    pub warmup_proportion: Option<f64>,

    /// Never use an accelerator even when one is available.
    #[arg(long)]
    pub no_cuda: bool,

    /// Rank of this process in a distributed launch.
    #[arg(long)]
    pub local_rank: Option<usize>,

    /// Number of processes in a distributed launch.
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub gradient_accumulation_steps: Option<usize>,

    /// Mixed-precision mode: loss scaling over F32 master weights.
    #[arg(long)]
    pub fp16: bool,

    /// 0 selects dynamic loss scaling; a positive power of two is a static scale.
    #[arg(long, default_value_t = 0.0)]
    pub loss_scale: f64,

    /// Evaluation split: reads test_<set>.json.
    #[arg(long)]
    pub test_set: Option<String>,

    /// Score predictions against every label instead of the character's candidates.
    #[arg(long)]
    pub no_logit_mask: bool,

    #[arg(long)]
    pub eval_every_epoch: bool,

    /// Weight the evaluation loss by inverse label frequency.
    #[arg(long)]
    pub use_weight: bool,

    /// Build the left/right/local attention patterns.
    #[arg(long)]
    pub hybrid_attention: bool,

    /// State dict to start from instead of the pretrained weights.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Start from random weights; requires --config-path.
    #[arg(long)]
    pub no_pretrain: bool,

    /// Student BERT config for --no-pretrain or --state-dir starts.
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Teacher weights (.bin or .safetensors).
    #[arg(long)]
    pub teacher_model: Option<PathBuf>,

    /// Teacher BERT config.
    #[arg(long)]
    pub teacher_config: Option<PathBuf>,

    /// Weight of the distillation loss.
    #[arg(long, default_value_t = 1.0)]
    pub kd_ratio: f64,

    /// Hugging Face download cache (overrides the configured one).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

/// Arguments merged with configuration and validated.
#[derive(Debug, Clone)]
struct Settings {
    distill: DistillConfig,
    max_seq_length: usize,
    test_set: String,
    prefer_gpu: bool,
    cuda_device_id: usize,
    local_rank: Option<usize>,
    world_size: usize,
    cache_dir: Option<PathBuf>,
    /// (weights, config) of the teacher; present whenever training.
    teacher: Option<(PathBuf, PathBuf)>,
}

/// Merge flags over configuration and reject invalid combinations before
/// anything heavy is loaded.
fn resolve_settings(args: &DistillArgs, cfg: &AppConfig) -> Result<Settings, DistillError> {
    let t = &cfg.training;
    let accum = args.gradient_accumulation_steps.unwrap_or(t.gradient_accumulation_steps);
    if accum < 1 {
        return Err(DistillError::Configuration(format!(
            "invalid gradient accumulation steps {accum}, should be >= 1"
        )));
    }
    if !args.do_train && !args.do_eval {
        return Err(DistillError::Configuration(
            "at least one of --do-train or --do-eval must be given".to_string(),
        ));
    }
    if args.no_pretrain && args.config_path.is_none() {
        return Err(DistillError::Configuration(
            "--no-pretrain needs --config-path for the student architecture".to_string(),
        ));
    }
    if !args.no_pretrain && args.config_path.is_some() && args.state_dir.is_none() {
        return Err(DistillError::Configuration(
            "--config-path without --no-pretrain needs --state-dir for the weights".to_string(),
        ));
    }
    if let Some(rank) = args.local_rank {
        if rank >= args.world_size {
            return Err(DistillError::Configuration(format!(
                "--local-rank {rank} must be smaller than --world-size {}",
                args.world_size
            )));
        }
    }
    let teacher = match (args.do_train, &args.teacher_model, &args.teacher_config) {
        (true, Some(weights), Some(config)) => Some((weights.clone(), config.clone())),
        (true, _, _) => {
            return Err(DistillError::Configuration(
                "training needs both --teacher-model and --teacher-config".to_string(),
            ))
        }
        (false, _, _) => None,
    };

    let total_batch = args.train_batch_size.unwrap_or(t.train_batch_size);
    let train_batch_size = total_batch / accum;
    if train_batch_size == 0 {
        return Err(DistillError::Configuration(format!(
            "train batch size {total_batch} is smaller than the accumulation factor {accum}"
        )));
    }

    let distill = DistillConfig {
        epochs: args.num_train_epochs.unwrap_or(t.num_train_epochs),
        train_batch_size,
        eval_batch_size: args.eval_batch_size.unwrap_or(t.eval_batch_size),
        gradient_accumulation_steps: accum,
        warmup_proportion: args.warmup_proportion.unwrap_or(t.warmup_proportion),
        optimizer: AdamWConfig {
            lr: args.learning_rate.unwrap_or(t.learning_rate),
            weight_decay: t.weight_decay,
            max_grad_norm: t.max_grad_norm,
            ..AdamWConfig::default()
        },
        precision: if args.fp16 { Precision::Half } else { Precision::Full },
        loss_scale: args.loss_scale,
        seed: args.seed.unwrap_or(t.seed),
        eval_every_epoch: args.eval_every_epoch,
        use_logit_mask: !args.no_logit_mask,
        use_weight: args.use_weight,
        output_dir: args.output_dir.clone(),
        show_progress: true,
    };
    distill.validate()?;

    let cache_dir = match &args.cache_dir {
        Some(dir) => Some(dir.clone()),
        None if cfg.model.cache_dir.is_empty() => None,
        None => Some(expand_cache_dir(&cfg.model.cache_dir)),
    };

    Ok(Settings {
        distill,
        max_seq_length: args.max_seq_length.unwrap_or(t.max_seq_length),
        test_set: args.test_set.clone().unwrap_or_else(|| t.test_set.clone()),
        prefer_gpu: cfg.device.prefer_gpu && !args.no_cuda,
        cuda_device_id: cfg.device.cuda_device_id,
        local_rank: args.local_rank,
        world_size: args.world_size,
        cache_dir,
        teacher,
    })
}

// ── Main entry point ──────────────────────────────────────────────────────────

pub fn run(args: &DistillArgs, config: &AppConfig) -> Result<()> {
    let settings = resolve_settings(args, config)?;

    let visible = if settings.prefer_gpu { device_count() } else { 0 };
    let mode = ExecutionMode::resolve(settings.local_rank, settings.world_size, visible)?;
    let device = select_device(
        settings.prefer_gpu,
        settings.local_rank.unwrap_or(settings.cuda_device_id),
    )?;
    seed_device(&device, settings.distill.seed)?;
    info!(
        device = device_name(&device),
        visible_devices = visible,
        mode = %mode,
        precision = %settings.distill.precision,
        "Execution setup"
    );

    // ── Resume detection ──────────────────────────────────────────────────────
    let checkpoints = CheckpointManager::new(&args.output_dir);
    let resume = if args.do_train {
        checkpoints
            .resume_epoch()
            .with_context(|| format!("Cannot resume from {}", args.output_dir.display()))?
    } else {
        None
    };

    // ── Data ──────────────────────────────────────────────────────────────────
    let loader = CorpusLoader::new(&args.data_dir, settings.test_set.as_str());
    let vocab = LabelVocab::new(loader.labels()?);
    info!(num_labels = vocab.len(), "Label vocabulary loaded");

    let files = ModelFiles::resolve(&args.bert_model, settings.cache_dir.as_deref())
        .with_context(|| format!("Failed to resolve pretrained model '{}'", args.bert_model))?;
    let tokenizer = Tokenizer::from_model_dir(&files.dir)?;

    let opts = EncodeOptions {
        max_seq_length: settings.max_seq_length,
        hybrid_attention: args.hybrid_attention,
    };
    let eval_corpus = if args.do_eval || args.eval_every_epoch {
        let examples = loader.test_examples()?;
        Some(encode(&examples, &vocab, &tokenizer, opts, &device)?)
    } else {
        None
    };

    if !args.do_train {
        if let Some(eval) = &eval_corpus {
            evaluate_only(args, &settings, files, &checkpoints, eval, vocab.len(), &device)?;
        }
        return Ok(());
    }

    let train_examples = loader.train_examples()?;
    let train_corpus = encode(&train_examples, &vocab, &tokenizer, opts, &device)?;
    info!(features = train_corpus.len(), "Training features ready");

    // ── Models ────────────────────────────────────────────────────────────────
    let Some((teacher_weights, teacher_config)) = &settings.teacher else {
        return Err(DistillError::Configuration("training needs a teacher".to_string()).into());
    };
    let teacher = BertTeacher::load(teacher_weights, teacher_config, &device)
        .with_context(|| format!("Failed to load teacher {}", teacher_weights.display()))?;

    let heads = StudentHeads {
        teacher_hidden_size: teacher.hidden_size(),
        num_labels: vocab.len(),
        kd_ratio: args.kd_ratio,
    };
    let restored: Option<(usize, Checkpoint)> = match resume {
        Some(epoch) => Some((epoch, checkpoints.load(Some(epoch), &device)?)),
        None => None,
    };
    let init = match &restored {
        Some((_, ckpt)) => StudentInit::Resume { config: ckpt.config.clone() },
        None => student_init(args, files),
    };
    let student = BertStudent::build(init, heads, &device).context("Failed to build student")?;
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Cannot create {}", args.output_dir.display()))?;

    // ── Train ─────────────────────────────────────────────────────────────────
    let mut distiller = Distiller::new(
        teacher,
        student,
        settings.distill.clone(),
        mode,
        train_corpus.len(),
        device.clone(),
    )?;
    if let Some((epoch, ckpt)) = &restored {
        distiller.resume(*epoch, ckpt)?;
    }

    let eval_during = eval_corpus.as_ref().filter(|_| args.eval_every_epoch);
    let stats = distiller.train(&train_corpus, eval_during)?;
    info!(
        mode = %distiller.mode(),
        global_step = stats.global_step,
        final_loss = stats.final_loss,
        epochs = stats.epoch_losses.len(),
        elapsed_secs = stats.elapsed_secs,
        "Training finished"
    );

    if let (true, Some(eval)) = (args.do_eval, &eval_corpus) {
        let report = distiller.evaluate(eval)?;
        info!(accuracy = report.accuracy, loss = report.loss, "Final evaluation");
    }

    println!("\nDistillation complete!");
    println!("  Output     : {}", args.output_dir.display());
    println!("  Steps      : {}", stats.global_step);
    println!("  Final loss : {:.4}", stats.final_loss);
    Ok(())
}

fn student_init(args: &DistillArgs, files: ModelFiles) -> StudentInit {
    match (&args.config_path, &args.state_dir) {
        (Some(config), _) if args.no_pretrain => StudentInit::Random { config: config.clone() },
        (Some(config), Some(state)) => StudentInit::Explicit { config: config.clone(), state: state.clone() },
        _ => StudentInit::Pretrained { files, state_override: args.state_dir.clone() },
    }
}

/// Score the final checkpoint in the output directory, or the configured
/// student when no run has finished there yet.
fn evaluate_only(
    args: &DistillArgs,
    settings: &Settings,
    files: ModelFiles,
    checkpoints: &CheckpointManager,
    eval: &EncodedCorpus,
    num_labels: usize,
    device: &Device,
) -> Result<()> {
    let finished = checkpoints.path(WEIGHTS_NAME, None).is_file() && checkpoints.path(CONFIG_NAME, None).is_file();
    let (init, state, teacher_hidden_size) = if finished {
        let ckpt = checkpoints.load(None, device)?;
        let hidden = ckpt.config.get("teacher_hidden_size").and_then(|v| v.as_u64()).map(|v| v as usize);
        (StudentInit::Resume { config: ckpt.config.clone() }, Some(ckpt.model), hidden)
    } else {
        warn!(dir = %args.output_dir.display(), "No finished checkpoint, evaluating the initial student");
        let hidden = match &args.teacher_config {
            Some(path) => Some(polyphone_distill::teacher::read_bert_config(path)?.hidden_size),
            None => None,
        };
        (student_init(args, files.clone()), None, hidden)
    };

    // without a teacher the projection head is sized to the student itself
    let own_config = match &init {
        StudentInit::Resume { config } => config.clone(),
        StudentInit::Pretrained { files, .. } => read_json(&files.config)?,
        StudentInit::Explicit { config, .. } | StudentInit::Random { config } => read_json(config)?,
    };
    let own_hidden = own_config.get("hidden_size").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

    let heads = StudentHeads {
        teacher_hidden_size: teacher_hidden_size.unwrap_or(own_hidden),
        num_labels,
        kd_ratio: args.kd_ratio,
    };
    let student = BertStudent::build(init, heads, device)?;
    if let Some(state) = state {
        student.load_state(&state, true)?;
    }
    let opts = EvalOptions {
        batch_size: settings.distill.eval_batch_size,
        use_logit_mask: settings.distill.use_logit_mask,
        use_weight: settings.distill.use_weight,
        show_progress: true,
    };
    let report = evaluate(&student, eval, &opts, device)?;
    println!("\nEvaluation complete!");
    println!("  Evaluated : {}", report.evaluated);
    println!("  Skipped   : {}", report.skipped);
    println!("  Accuracy  : {:.4}", report.accuracy);
    println!("  Loss      : {:.4}", report.loss);
    Ok(())
}

fn read_json(path: &std::path::Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Cannot parse {}", path.display()))
}
