use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, Var};
use hf_hub::api::sync::ApiBuilder;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::model::ModelState;

/// Weight file names tried in order, for both local dirs and hub repos.
const WEIGHT_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];
const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILES: [&str; 2] = ["tokenizer.json", "vocab.txt"];

/// Files making up one pretrained BERT checkpoint.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Directory holding the files (the snapshot dir for hub downloads).
    pub dir: PathBuf,
    pub config: PathBuf,
    /// `None` when the directory only carries a config and vocabulary.
    pub weights: Option<PathBuf>,
}

impl ModelFiles {
    /// Resolve a local directory or a Hugging Face Hub model id.
    ///
    /// Local paths win; anything that does not exist on disk is treated as a
    /// hub id and downloaded into `cache_dir` (or the default hub cache).
    pub fn resolve(model: &str, cache_dir: Option<&Path>) -> CoreResult<Self> {
        let local = Path::new(model);
        if local.is_dir() {
            return Self::from_local(local);
        }
        Self::from_hub(model, cache_dir)
    }

    pub fn from_local(dir: &Path) -> CoreResult<Self> {
        let config = dir.join(CONFIG_FILE);
        if !config.exists() {
            return Err(CoreError::MissingFile(config.display().to_string()));
        }
        let weights = WEIGHT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists());
        debug!(dir = %dir.display(), has_weights = weights.is_some(), "Resolved local model");
        Ok(Self { dir: dir.to_path_buf(), config, weights })
    }

    fn from_hub(model_id: &str, cache_dir: Option<&Path>) -> CoreResult<Self> {
        info!(model_id, "Fetching model from Hugging Face Hub");
        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder.build()?;
        let repo = api.model(model_id.to_string());

        let config = repo.get(CONFIG_FILE)?;
        let weights = WEIGHT_FILES.iter().find_map(|name| match repo.get(name) {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(file = name, error = %e, "Weight file not available");
                None
            }
        });
        if weights.is_none() {
            warn!(model_id, "No weights found on the hub (tried {:?})", WEIGHT_FILES);
        }
        let mut have_tokenizer = false;
        for name in TOKENIZER_FILES {
            if repo.get(name).is_ok() {
                have_tokenizer = true;
            }
        }
        if !have_tokenizer {
            warn!(model_id, "Hub repo has no tokenizer.json or vocab.txt");
        }

        let dir = config
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| CoreError::MissingFile(config.display().to_string()))?;
        Ok(Self { dir, config, weights })
    }
}

// ── State dict I/O ───────────────────────────────────────────────────────────

/// Load a weights file into a name → tensor map on `device`.
///
/// Safetensors files (including epoch-tagged names such as
/// `model.safetensors_3`) are read directly; anything else is treated as a
/// PyTorch pickle. Keys are normalised with [`normalize_key`].
pub fn load_state_file(path: &Path, device: &Device) -> CoreResult<ModelState> {
    if !path.exists() {
        return Err(CoreError::MissingFile(path.display().to_string()));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let raw: Vec<(String, Tensor)> = if name.contains(".safetensors") {
        candle_core::safetensors::load(path, device)?.into_iter().collect()
    } else {
        let mut pairs = candle_core::pickle::read_all_with_key(path, None)?;
        if pairs.is_empty() {
            // Some trainers wrap the state dict as {"model": {...}}.
            pairs = candle_core::pickle::read_all_with_key(path, Some("model"))?;
        }
        pairs
            .into_iter()
            .map(|(k, t)| Ok((k, t.to_device(device)?)))
            .collect::<CoreResult<_>>()?
    };

    let state: ModelState = raw
        .into_iter()
        .map(|(k, t)| (normalize_key(&k), t))
        .collect();
    debug!(path = %path.display(), tensors = state.len(), "Loaded state dict");
    Ok(state)
}

/// Write a state map as safetensors.
pub fn save_state_file(path: &Path, state: &ModelState) -> CoreResult<()> {
    candle_core::safetensors::save(state, path)?;
    Ok(())
}

/// Canonical parameter name for a stored key.
///
/// Strips the `bert.` / `module.` wrappers and renames the legacy
/// `LayerNorm.gamma` / `LayerNorm.beta` to `weight` / `bias`.
pub fn normalize_key(key: &str) -> String {
    let mut k = key;
    for prefix in ["module.", "bert."] {
        if let Some(rest) = k.strip_prefix(prefix) {
            k = rest;
        }
    }
    if let Some(stem) = k.strip_suffix(".gamma") {
        format!("{stem}.weight")
    } else if let Some(stem) = k.strip_suffix(".beta") {
        format!("{stem}.bias")
    } else {
        k.to_string()
    }
}

/// Copy matching tensors from `state` into `vars`.
///
/// Returns the names of vars the state did not provide. Shape mismatches are
/// always an error; missing keys are an error only when `strict`.
pub fn apply_state(
    vars: &[(String, Var)],
    state: &ModelState,
    strict: bool,
) -> CoreResult<Vec<String>> {
    let mut missing = Vec::new();
    for (name, var) in vars {
        let Some(src) = state.get(name) else {
            missing.push(name.clone());
            continue;
        };
        if src.dims() != var.dims() {
            return Err(CoreError::StateMismatch(format!(
                "{name}: stored {:?}, expected {:?}",
                src.dims(),
                var.dims()
            )));
        }
        let src = src.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&src)?;
    }

    let unexpected = state
        .keys()
        .filter(|k| !vars.iter().any(|(n, _)| n == *k))
        .count();
    if unexpected > 0 {
        debug!(unexpected, "State dict carries keys the model does not use");
    }
    if !missing.is_empty() {
        if strict {
            return Err(CoreError::StateMismatch(format!(
                "missing keys: {}",
                missing.join(", ")
            )));
        }
        warn!(count = missing.len(), keys = ?missing, "Weights not initialized from state dict");
    }
    Ok(missing)
}
