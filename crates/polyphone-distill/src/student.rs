//! Trainable BERT student.
//!
//! The student is a BERT encoder held in a [`candle_nn::VarMap`] plus two
//! linear heads:
//!
//! * `distill_proj` maps student hidden states into the teacher's hidden
//!   size; the distillation loss is a masked MSE in that space.
//! * `classifier` maps the hidden state at the polyphone position onto the
//!   label vocabulary; evaluation reads its logits.
//!
//! ## Construction modes
//!
//! | [`StudentInit`] | Config from | Weights from |
//! |---|---|---|
//! | `Pretrained` | pretrained model dir / hub | `--state-dir` when it exists, else the pretrained weights |
//! | `Explicit` | `--config-path` | `--state-dir` (non-strict) |
//! | `Random` | `--config-path` | random initialisation |
//! | `Resume` | checkpoint `config.json_<n>` | checkpoint `model.safetensors_<n>`, restored by the training loop |

use std::path::PathBuf;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Linear, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tracing::{info, warn};

use polyphone_core::loader::{apply_state, load_state_file};
use polyphone_core::{CoreError, CoreResult, ModelFiles, StudentModel};

use crate::error::{DistillError, DistillResult};

/// Where the student's config and initial weights come from.
#[derive(Debug, Clone)]
pub enum StudentInit {
    Pretrained { files: ModelFiles, state_override: Option<PathBuf> },
    Explicit { config: PathBuf, state: PathBuf },
    Random { config: PathBuf },
    /// Architecture from a checkpoint's config JSON; the training loop
    /// restores the weights when it resumes.
    Resume { config: serde_json::Value },
}

/// Head sizes and loss weighting shared by every construction mode.
#[derive(Debug, Clone, Copy)]
pub struct StudentHeads {
    pub teacher_hidden_size: usize,
    pub num_labels: usize,
    pub kd_ratio: f64,
}

pub struct BertStudent {
    varmap: VarMap,
    model: BertModel,
    distill_proj: Linear,
    classifier: Linear,
    raw_config: serde_json::Value,
    heads: StudentHeads,
    device: Device,
}

impl BertStudent {
    /// Build the student in F32 on `device`.
    pub fn build(init: StudentInit, heads: StudentHeads, device: &Device) -> DistillResult<Self> {
        match init {
            StudentInit::Pretrained { files, state_override } => {
                let raw = read_json(&files.config)?;
                let student = Self::from_raw_config(raw, heads, device)?;
                let weights = match state_override {
                    Some(path) if path.exists() => {
                        info!(path = %path.display(), "Using a custom BERT state dict");
                        Some(path)
                    }
                    Some(path) => {
                        warn!(
                            path = %path.display(),
                            "State dict does not exist, using the pretrained weights instead"
                        );
                        files.weights.clone()
                    }
                    None => files.weights.clone(),
                };
                match weights {
                    Some(path) => student.load_weights_file(&path)?,
                    None => warn!(dir = %files.dir.display(), "Pretrained model has no weights, keeping random init"),
                }
                Ok(student)
            }
            StudentInit::Explicit { config, state } => {
                let student = Self::from_raw_config(read_json(&config)?, heads, device)?;
                student.load_weights_file(&state)?;
                Ok(student)
            }
            StudentInit::Random { config } => {
                info!(config = %config.display(), "Initialising student with random weights");
                Self::from_raw_config(read_json(&config)?, heads, device)
            }
            StudentInit::Resume { config } => Self::from_raw_config(config, heads, device),
        }
    }

    fn from_raw_config(
        raw_config: serde_json::Value,
        heads: StudentHeads,
        device: &Device,
    ) -> DistillResult<Self> {
        let config: BertConfig = serde_json::from_value(raw_config.clone())
            .map_err(|e| DistillError::Configuration(format!("invalid BERT config: {e}")))?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = BertModel::load(vb.clone(), &config)?;
        let distill_proj = candle_nn::linear(config.hidden_size, heads.teacher_hidden_size, vb.pp("distill_proj"))?;
        let classifier = candle_nn::linear(config.hidden_size, heads.num_labels, vb.pp("classifier"))?;

        info!(
            hidden_size = config.hidden_size,
            layers = config.num_hidden_layers,
            teacher_hidden_size = heads.teacher_hidden_size,
            num_labels = heads.num_labels,
            "Student built"
        );
        Ok(Self {
            varmap,
            model,
            distill_proj,
            classifier,
            raw_config,
            heads,
            device: device.clone(),
        })
    }

    fn load_weights_file(&self, path: &std::path::Path) -> DistillResult<()> {
        let state = load_state_file(path, self.device())?;
        let missing = apply_state(&self.named_vars(), &state, false)?;
        info!(
            path = %path.display(),
            loaded = self.named_vars().len() - missing.len(),
            missing = missing.len(),
            "Student weights loaded"
        );
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn hidden(&self, input_ids: &Tensor, input_mask: &Tensor) -> CoreResult<Tensor> {
        let type_ids = input_ids.zeros_like()?;
        Ok(self.model.forward(input_ids, &type_ids, Some(input_mask))?)
    }
}

impl StudentModel for BertStudent {
    /// `kd_ratio × MSE(distill_proj(hidden), targets)` over real tokens.
    fn compute_loss(&self, input_ids: &Tensor, input_mask: &Tensor, targets: &Tensor) -> CoreResult<Tensor> {
        let projected = self.distill_proj.forward(&self.hidden(input_ids, input_mask)?)?;
        let projected = projected.to_dtype(DType::F32)?;
        let targets = targets.to_dtype(DType::F32)?;
        let (_, _, width) = targets.dims3()?;

        let mask = input_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let sq = (projected - targets)?.sqr()?.broadcast_mul(&mask)?;
        let denom = (mask.sum_all()?.maximum(1.0)? * width as f64)?;
        let mse = (sq.sum_all()? / denom)?;
        Ok((mse * self.heads.kd_ratio)?)
    }

    fn classify(
        &self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        label_pos: &Tensor,
        head_bias: Option<&Tensor>,
    ) -> CoreResult<Tensor> {
        if head_bias.is_some() {
            warn!("BERT student cannot apply per-head attention patterns, ignoring them");
        }
        let hidden = self.hidden(input_ids, input_mask)?;
        let (b, _, h) = hidden.dims3()?;
        let index = label_pos
            .to_dtype(DType::U32)?
            .reshape((b, 1, 1))?
            .broadcast_as((b, 1, h))?
            .contiguous()?;
        let at_pos = hidden.gather(&index, 1)?.squeeze(1)?;
        Ok(self.classifier.forward(&at_pos)?.to_dtype(DType::F32)?)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    fn config_json(&self) -> CoreResult<serde_json::Value> {
        let mut cfg = self.raw_config.clone();
        let obj = cfg.as_object_mut().ok_or_else(|| CoreError::Config {
            field: "config".to_string(),
            reason: "BERT config is not a JSON object".to_string(),
        })?;
        obj.insert("num_labels".to_string(), self.heads.num_labels.into());
        obj.insert("teacher_hidden_size".to_string(), self.heads.teacher_hidden_size.into());
        obj.insert("kd_ratio".to_string(), self.heads.kd_ratio.into());
        Ok(cfg)
    }
}

fn read_json(path: &std::path::Path) -> DistillResult<serde_json::Value> {
    if !path.is_file() {
        return Err(DistillError::Configuration(format!(
            "model config {} does not exist",
            path.display()
        )));
    }
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}
