use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use tokenizers::models::wordpiece::WordPiece;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Structural marker prepended to every sequence.
pub const CLS_TOKEN: &str = "[CLS]";
/// Structural marker appended to every sequence.
pub const SEP_TOKEN: &str = "[SEP]";
/// Replacement for tokens missing from the vocabulary.
pub const UNK_TOKEN: &str = "[UNK]";
/// Padding token; BERT vocabularies place it at id 0.
pub const PAD_TOKEN: &str = "[PAD]";

/// Thin wrapper around the Hugging Face `tokenizers` crate.
///
/// The encoder feeds already-split tokens (one per character), so the only
/// capability needed from the tokenizer is a token → id lookup with an
/// `[UNK]` fallback. Loading still goes through the real WordPiece model so a
/// stock BERT `vocab.txt` or `tokenizer.json` works unchanged.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    unk_token_id: u32,
    pad_token_id: u32,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Self::wrap(inner)
    }

    /// Load a WordPiece tokenizer from a BERT `vocab.txt` (one token per line).
    pub fn from_vocab_file(path: &Path) -> CoreResult<Self> {
        let path_str = path.to_str().ok_or_else(|| CoreError::Config {
            field: "vocab".to_string(),
            reason: format!("non UTF-8 path: {}", path.display()),
        })?;
        let wordpiece = WordPiece::from_file(path_str)
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(|e| CoreError::Tokenizer(format!("WordPiece build error: {e}")))?;
        Self::wrap(HfTokenizer::new(wordpiece))
    }

    /// Build a tokenizer from an in-memory vocabulary, ids assigned in order.
    pub fn from_vocab(tokens: &[&str]) -> CoreResult<Self> {
        let vocab: HashMap<&str, u32> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (*t, i as u32))
            .collect();
        let definition = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "BertPreTokenizer" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordPiece",
                "unk_token": UNK_TOKEN,
                "continuing_subword_prefix": "##",
                "max_input_chars_per_word": 100,
                "vocab": vocab,
            }
        });
        let inner = HfTokenizer::from_str(&definition.to_string())
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Self::wrap(inner)
    }

    /// Load whichever tokenizer file a model directory provides.
    ///
    /// `tokenizer.json` wins over `vocab.txt` when both exist.
    pub fn from_model_dir(dir: &Path) -> CoreResult<Self> {
        let json = dir.join("tokenizer.json");
        if json.exists() {
            return Self::from_file(&json);
        }
        let vocab = dir.join("vocab.txt");
        if vocab.exists() {
            return Self::from_vocab_file(&vocab);
        }
        Err(CoreError::MissingFile(format!(
            "no tokenizer.json or vocab.txt in {}",
            dir.display()
        )))
    }

    fn wrap(inner: HfTokenizer) -> CoreResult<Self> {
        let unk_token_id = inner.token_to_id(UNK_TOKEN).ok_or_else(|| {
            CoreError::Tokenizer(format!("vocabulary has no {UNK_TOKEN} token"))
        })?;
        let pad_token_id = match inner.token_to_id(PAD_TOKEN) {
            Some(id) => id,
            None => {
                warn!("vocabulary has no {PAD_TOKEN} token, padding with id 0");
                0
            }
        };
        debug!(
            unk_token_id,
            pad_token_id,
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded"
        );
        Ok(Self { inner, unk_token_id, pad_token_id })
    }

    /// Map pre-split tokens to ids; unknown tokens become `[UNK]`.
    pub fn convert_tokens_to_ids<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<u32> {
        tokens
            .iter()
            .map(|t| self.inner.token_to_id(t.as_ref()).unwrap_or(self.unk_token_id))
            .collect()
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }
}
