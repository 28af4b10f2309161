//! Corpus loading.
//!
//! A data directory holds three JSON documents:
//!
//! ```text
//! data/
//!   train.json          [{"text": "...", "phone": [[pos, "弹\tdan4"], ...], "position": 3, "char": "弹"}, ...]
//!   test_<variant>.json same shape as train.json
//!   info.json           {"phones": ["弹\tdan4", "弹\ttan2", ...], ...}
//! ```
//!
//! `text` may be either a string (split into characters) or an array of
//! pre-split tokens. Example order is preserved and each example gets a
//! sequential `0-<index>` guid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::{DistillError, DistillResult};

/// One annotated sentence, immutable after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub guid: String,
    pub tokens: Vec<String>,
    /// The polyphonic character this example is about.
    pub char: String,
    /// `(token position, label)` pairs; labels are `char<TAB>pronunciation`.
    pub annotations: Vec<(i64, String)>,
    /// Token position of the polyphone, before the `[CLS]` offset.
    pub position: i64,
}

// ── Deserialization helpers ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawText {
    Chars(String),
    Tokens(Vec<String>),
}

impl RawText {
    fn into_tokens(self) -> Vec<String> {
        match self {
            RawText::Chars(s) => s.chars().map(String::from).collect(),
            RawText::Tokens(t) => t,
        }
    }
}

#[derive(Deserialize)]
struct RawExample {
    text: RawText,
    phone: Vec<(i64, String)>,
    position: i64,
    char: String,
}

#[derive(Deserialize)]
struct RawInfo {
    phones: Vec<String>,
}

// ── CorpusLoader ──────────────────────────────────────────────────────────────

/// Reads the train/test/info documents of one data directory.
#[derive(Debug, Clone)]
pub struct CorpusLoader {
    data_dir: PathBuf,
    test_set: String,
}

impl CorpusLoader {
    pub fn new(data_dir: impl Into<PathBuf>, test_set: impl Into<String>) -> Self {
        Self { data_dir: data_dir.into(), test_set: test_set.into() }
    }

    pub fn train_path(&self) -> PathBuf {
        self.data_dir.join("train.json")
    }

    pub fn test_path(&self) -> PathBuf {
        self.data_dir.join(format!("test_{}.json", self.test_set))
    }

    pub fn info_path(&self) -> PathBuf {
        self.data_dir.join("info.json")
    }

    pub fn train_examples(&self) -> DistillResult<Vec<Example>> {
        load_examples(&self.train_path())
    }

    pub fn test_examples(&self) -> DistillResult<Vec<Example>> {
        load_examples(&self.test_path())
    }

    /// The full ordered label vocabulary from `info.json`.
    pub fn labels(&self) -> DistillResult<Vec<String>> {
        let path = self.info_path();
        let info: RawInfo = read_json(&path)?;
        info!(path = %path.display(), labels = info.phones.len(), "Loaded label vocabulary");
        Ok(info.phones)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> DistillResult<T> {
    if !path.is_file() {
        return Err(DistillError::DataNotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| DistillError::DataFormat {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn load_examples(path: &Path) -> DistillResult<Vec<Example>> {
    info!(path = %path.display(), "Loading examples");
    let raw: Vec<RawExample> = read_json(path)?;
    let examples: Vec<Example> = raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| Example {
            guid: format!("0-{i}"),
            tokens: r.text.into_tokens(),
            char: r.char,
            annotations: r.phone,
            position: r.position,
        })
        .collect();
    info!(path = %path.display(), count = examples.len(), "Examples loaded");
    Ok(examples)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
