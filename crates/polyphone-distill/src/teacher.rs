//! Frozen BERT teacher.
//!
//! Wraps a [`candle_transformers`] BERT encoder built straight from a state
//! dict (no `VarMap`, so nothing here is trainable) and exposes its final
//! hidden states as distillation targets.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tracing::info;

use polyphone_core::loader::load_state_file;
use polyphone_core::{CoreResult, TeacherModel};

use crate::error::{DistillError, DistillResult};

pub struct BertTeacher {
    model: BertModel,
    config: BertConfig,
    parameters: usize,
}

impl BertTeacher {
    /// Load a teacher from a weights file (`.safetensors` or PyTorch `.bin`)
    /// and its BERT JSON config.
    ///
    /// Extra keys in the state dict (pooler, task heads) are ignored; missing
    /// encoder weights are an error. Weights are held in F32 whatever their
    /// stored dtype.
    pub fn load(weights: &Path, config_path: &Path, device: &Device) -> DistillResult<Self> {
        let config = read_bert_config(config_path)?;
        let state = load_state_file(weights, device)?;
        let parameters = state
            .iter()
            .filter(|(k, _)| k.starts_with("embeddings.") || k.starts_with("encoder."))
            .map(|(_, t)| t.elem_count())
            .sum();

        let vb = VarBuilder::from_tensors(state, DType::F32, device);
        let model = BertModel::load(vb, &config)?;

        info!(
            weights = %weights.display(),
            hidden_size = config.hidden_size,
            layers = config.num_hidden_layers,
            parameters,
            "Teacher loaded"
        );
        Ok(Self { model, config, parameters })
    }
}

impl TeacherModel for BertTeacher {
    fn forward(&self, input_ids: &Tensor, input_mask: &Tensor) -> CoreResult<Tensor> {
        let type_ids = input_ids.zeros_like()?;
        let hidden = self.model.forward(input_ids, &type_ids, Some(input_mask))?;
        Ok(hidden.detach().to_dtype(DType::F32)?)
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn parameter_count(&self) -> usize {
        self.parameters
    }
}

/// Parse a BERT `config.json`, keeping the raw JSON alongside.
pub fn read_bert_config(path: &Path) -> DistillResult<BertConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        DistillError::Configuration(format!("cannot read BERT config {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        DistillError::Configuration(format!("cannot parse BERT config {}: {e}", path.display()))
    })
}
