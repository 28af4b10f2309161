//! Epoch-tagged checkpoints in the output directory.
//!
//! ```text
//! output/
//!   model.safetensors_0      optimizer.safetensors_0      config.json_0
//!   model.safetensors_1      optimizer.safetensors_1      config.json_1
//!   model.safetensors        optimizer.safetensors        config.json     (final)
//! ```
//!
//! Saving the same tag twice overwrites it; older epochs are never removed.

use std::fs;
use std::path::PathBuf;

use candle_core::Device;
use tracing::{info, warn};

use polyphone_core::loader::{load_state_file, save_state_file};
use polyphone_core::ModelState;

use crate::error::{DistillError, DistillResult};

pub const WEIGHTS_NAME: &str = "model.safetensors";
pub const OPTIMIZER_NAME: &str = "optimizer.safetensors";
pub const CONFIG_NAME: &str = "config.json";

/// Contents of one checkpoint tag.
#[derive(Debug)]
pub struct Checkpoint {
    pub model: ModelState,
    /// `None` when the optimizer file was absent.
    pub optimizer: Option<ModelState>,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of `name` for `epoch`; `None` is the untagged final checkpoint.
    pub fn path(&self, name: &str, epoch: Option<usize>) -> PathBuf {
        match epoch {
            Some(e) => self.dir.join(format!("{name}_{e}")),
            None => self.dir.join(name),
        }
    }

    /// Highest epoch with a weights file, if any.
    pub fn latest_epoch(&self) -> DistillResult<Option<usize>> {
        if !self.dir.is_dir() {
            return Ok(None);
        }
        let prefix = format!("{WEIGHTS_NAME}_");
        let mut latest = None;
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(epoch) = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|suffix| suffix.parse::<usize>().ok())
            else {
                continue;
            };
            latest = latest.max(Some(epoch));
        }
        Ok(latest)
    }

    /// Where training should pick up.
    ///
    /// `Ok(None)` for a fresh run (missing or empty directory). A non-empty
    /// directory without any epoch checkpoint is a [`DistillError::Resume`].
    pub fn resume_epoch(&self) -> DistillResult<Option<usize>> {
        let non_empty = self.dir.is_dir() && fs::read_dir(&self.dir)?.next().is_some();
        if !non_empty {
            return Ok(None);
        }
        match self.latest_epoch()? {
            Some(epoch) => Ok(Some(epoch)),
            None => Err(DistillError::Resume {
                dir: self.dir.clone(),
                reason: format!("directory is not empty but holds no {WEIGHTS_NAME}_<epoch> file"),
            }),
        }
    }

    pub fn save(
        &self,
        epoch: Option<usize>,
        model: &ModelState,
        optimizer: &ModelState,
        config: &serde_json::Value,
    ) -> DistillResult<()> {
        fs::create_dir_all(&self.dir)?;
        save_state_file(&self.path(WEIGHTS_NAME, epoch), model)?;
        save_state_file(&self.path(OPTIMIZER_NAME, epoch), optimizer)?;
        fs::write(self.path(CONFIG_NAME, epoch), serde_json::to_string_pretty(config)?)?;
        info!(dir = %self.dir.display(), epoch = ?epoch, tensors = model.len(), "Checkpoint saved");
        Ok(())
    }

    pub fn load(&self, epoch: Option<usize>, device: &Device) -> DistillResult<Checkpoint> {
        let weights = self.path(WEIGHTS_NAME, epoch);
        let config = self.path(CONFIG_NAME, epoch);
        for required in [&weights, &config] {
            if !required.is_file() {
                return Err(DistillError::Resume {
                    dir: self.dir.clone(),
                    reason: format!("missing {}", required.display()),
                });
            }
        }
        let model = load_state_file(&weights, device)?;
        let config: serde_json::Value = serde_json::from_str(&fs::read_to_string(&config)?)?;

        let opt_path = self.path(OPTIMIZER_NAME, epoch);
        let optimizer = if opt_path.is_file() {
            Some(load_state_file(&opt_path, device)?)
        } else {
            warn!(path = %opt_path.display(), "Optimizer state missing, starting with a fresh optimizer");
            None
        };
        info!(dir = %self.dir.display(), epoch = ?epoch, "Checkpoint loaded");
        Ok(Checkpoint { model, optimizer, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use tempfile::TempDir;

    fn state(v: f32) -> ModelState {
        let mut s = ModelState::new();
        s.insert("w".to_string(), Tensor::new(&[v, v], &Device::Cpu).unwrap());
        s
    }

    #[test]
    fn latest_epoch_picks_highest_tag() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path());
        assert_eq!(mgr.latest_epoch().unwrap(), None);
        for e in [0, 1, 2] {
            mgr.save(Some(e), &state(e as f32), &state(0.), &serde_json::json!({})).unwrap();
        }
        fs::write(dir.path().join("model.safetensors_x"), b"").unwrap();
        fs::write(dir.path().join("model.safetensors_10.tmp"), b"").unwrap();
        assert_eq!(mgr.latest_epoch().unwrap(), Some(2));
        assert_eq!(mgr.resume_epoch().unwrap(), Some(2));

        let ckpt = mgr.load(Some(2), &Device::Cpu).unwrap();
        assert_eq!(ckpt.model["w"].to_vec1::<f32>().unwrap(), vec![2., 2.]);
        assert!(ckpt.optimizer.is_some());
    }

    #[test]
    fn untagged_final_is_not_an_epoch() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path());
        mgr.save(None, &state(1.), &state(0.), &serde_json::json!({"hidden_size": 8})).unwrap();
        assert_eq!(mgr.latest_epoch().unwrap(), None);
        let ckpt = mgr.load(None, &Device::Cpu).unwrap();
        assert_eq!(ckpt.config["hidden_size"], 8);
    }

    #[test]
    fn overwrite_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path());
        mgr.save(Some(0), &state(1.), &state(0.), &serde_json::json!({})).unwrap();
        mgr.save(Some(0), &state(3.), &state(0.), &serde_json::json!({})).unwrap();
        let ckpt = mgr.load(Some(0), &Device::Cpu).unwrap();
        assert_eq!(ckpt.model["w"].to_vec1::<f32>().unwrap(), vec![3., 3.]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn non_empty_dir_without_checkpoint_is_resume_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        let mgr = CheckpointManager::new(dir.path());
        assert!(matches!(mgr.resume_epoch(), Err(DistillError::Resume { .. })));
    }

    #[test]
    fn missing_dir_is_fresh_run() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().join("new"));
        assert_eq!(mgr.resume_epoch().unwrap(), None);
    }

    #[test]
    fn missing_optimizer_only_warns() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path());
        mgr.save(Some(1), &state(1.), &state(0.), &serde_json::json!({})).unwrap();
        fs::remove_file(mgr.path(OPTIMIZER_NAME, Some(1))).unwrap();
        let ckpt = mgr.load(Some(1), &Device::Cpu).unwrap();
        assert!(ckpt.optimizer.is_none());

        fs::remove_file(mgr.path(WEIGHTS_NAME, Some(1))).unwrap();
        assert!(matches!(mgr.load(Some(1), &Device::Cpu), Err(DistillError::Resume { .. })));
    }
}
