use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub training: TrainingConfig,
    pub model: ModelCacheConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    /// Total batch size per optimizer step, before the accumulation split.
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub learning_rate: f64,
    pub num_train_epochs: usize,
    pub warmup_proportion: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub gradient_accumulation_steps: usize,
    pub seed: u64,
    pub max_seq_length: usize,
    pub test_set: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelCacheConfig {
    /// Hugging Face Hub download cache; empty means the hub default.
    pub cache_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            training: TrainingConfig {
                train_batch_size: 32,
                eval_batch_size: 32,
                learning_rate: 5e-5,
                num_train_epochs: 3,
                warmup_proportion: 0.1,
                weight_decay: 0.01,
                max_grad_norm: 1.0,
                gradient_accumulation_steps: 1,
                seed: 42,
                max_seq_length: 512,
                test_set: "story".to_string(),
            },
            model: ModelCacheConfig {
                cache_dir: "~/.cache/polyphone".to_string(),
            },
            device: DeviceConfig {
                prefer_gpu: true,
                cuda_device_id: 0,
            },
        }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `POLYPHONE_`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("training.train_batch_size", 32_i64)?
        .set_default("training.eval_batch_size", 32_i64)?
        .set_default("training.learning_rate", 5e-5)?
        .set_default("training.num_train_epochs", 3_i64)?
        .set_default("training.warmup_proportion", 0.1)?
        .set_default("training.weight_decay", 0.01)?
        .set_default("training.max_grad_norm", 1.0)?
        .set_default("training.gradient_accumulation_steps", 1_i64)?
        .set_default("training.seed", 42_i64)?
        .set_default("training.max_seq_length", 512_i64)?
        .set_default("training.test_set", "story")?
        .set_default("model.cache_dir", "~/.cache/polyphone")?
        .set_default("device.prefer_gpu", true)?
        .set_default("device.cuda_device_id", 0_i64)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (POLYPHONE_TRAINING__SEED, etc.)
    builder = builder.add_source(
        Environment::with_prefix("POLYPHONE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand `~` in cache_dir to the actual home directory.
pub fn expand_cache_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}
