//! Feature encoding: examples → fixed-length id / mask / label rows.
//!
//! Each example becomes `[CLS] tokens… [SEP]` right-padded to
//! `max_seq_length`. Only annotated positions whose token matches the label's
//! character receive a label id; everything else stays `-1`.
//!
//! ```text
//! tokens:     [CLS] 子  弹  [SEP] [PAD] …
//! input_mask:   1   1   1    1     0    …
//! label_ids:   -1  -1   0   -1    -1    …
//! label_pos:            2
//! ```

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use polyphone_core::tokenizer::{CLS_TOKEN, SEP_TOKEN};
use polyphone_core::Tokenizer;

use crate::corpus::Example;
use crate::error::{DistillError, DistillResult};
use crate::masks::TaskMasks;

/// Separator between the character and the pronunciation in a label.
pub const LABEL_SEPARATOR: char = '\t';
/// Key of the synthetic no-label entry.
pub const NO_LABEL: &str = "_";
/// Label id for positions that carry no annotation.
pub const NO_LABEL_ID: i64 = -1;

const PROGRESS_EVERY: usize = 100_000;
const LOGGED_EXAMPLES: usize = 5;

// ── LabelVocab ────────────────────────────────────────────────────────────────

/// Ordered label vocabulary with its index map, built once per run.
#[derive(Debug, Clone)]
pub struct LabelVocab {
    labels: Vec<String>,
    index: HashMap<String, i64>,
}

impl LabelVocab {
    /// Normalises every label and indexes it by position.
    pub fn new(raw: Vec<String>) -> Self {
        let labels: Vec<String> = raw.iter().map(|l| normalize_label(l)).collect();
        let mut index: HashMap<String, i64> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i as i64))
            .collect();
        index.insert(NO_LABEL.to_string(), NO_LABEL_ID);
        Self { labels, index }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Index of a (normalised) label; `_` maps to `-1`.
    pub fn id(&self, label: &str) -> Option<i64> {
        self.index.get(label).copied()
    }

    /// The character component of a normalised label.
    pub fn char_of(label: &str) -> &str {
        label.split(LABEL_SEPARATOR).next().unwrap_or(label)
    }
}

/// Insert the separator after the first character when it is missing.
pub fn normalize_label(label: &str) -> String {
    if label.contains(LABEL_SEPARATOR) {
        return label.to_string();
    }
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => format!("{first}{LABEL_SEPARATOR}{}", chars.as_str()),
        None => LABEL_SEPARATOR.to_string(),
    }
}

// ── Encoded output ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFeature {
    pub input_ids: Vec<u32>,
    pub input_mask: Vec<u32>,
    pub label_ids: Vec<i64>,
    /// Index of the polyphone token, counting the leading `[CLS]`.
    pub label_pos: usize,
    pub char: String,
}

impl EncodedFeature {
    /// The gold label at the polyphone position (`-1` when unannotated).
    pub fn target(&self) -> i64 {
        self.label_ids[self.label_pos]
    }
}

/// Everything one encoding pass produces.
#[derive(Debug, Clone)]
pub struct EncodedCorpus {
    pub features: Vec<EncodedFeature>,
    pub masks: TaskMasks,
    /// Accepted annotations per label, in vocabulary order.
    pub label_counts: Vec<usize>,
    pub max_seq_length: usize,
}

/// A batch of features stacked into tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, seq]` u32
    pub input_ids: Tensor,
    /// `[batch, seq]` u32
    pub input_mask: Tensor,
    /// `[batch]` u32
    pub label_pos: Tensor,
    /// Gold label at each row's `label_pos`.
    pub targets: Vec<i64>,
}

impl EncodedCorpus {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Stack the features at `indices` into a [`Batch`] on `device`.
    pub fn batch(&self, indices: &[usize], device: &Device) -> DistillResult<Batch> {
        let seq = self.max_seq_length;
        let b = indices.len();
        let mut ids = Vec::with_capacity(b * seq);
        let mut mask = Vec::with_capacity(b * seq);
        let mut pos = Vec::with_capacity(b);
        let mut targets = Vec::with_capacity(b);
        for &i in indices {
            let f = self.features.get(i).ok_or_else(|| {
                DistillError::Configuration(format!("batch index {i} out of range ({})", self.len()))
            })?;
            ids.extend_from_slice(&f.input_ids);
            mask.extend_from_slice(&f.input_mask);
            pos.push(f.label_pos as u32);
            targets.push(f.target());
        }
        Ok(Batch {
            input_ids: Tensor::from_vec(ids, (b, seq), device)?,
            input_mask: Tensor::from_vec(mask, (b, seq), device)?,
            label_pos: Tensor::from_vec(pos, b, device)?,
            targets,
        })
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Options for one encoding pass.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub max_seq_length: usize,
    pub hybrid_attention: bool,
}

/// Encode `examples` against `vocab`.
///
/// Mismatched annotations are logged and skipped. A polyphone position that
/// falls outside the window is a hard [`DistillError::Encoding`].
pub fn encode(
    examples: &[Example],
    vocab: &LabelVocab,
    tokenizer: &Tokenizer,
    opts: EncodeOptions,
    device: &Device,
) -> DistillResult<EncodedCorpus> {
    let max_seq_length = opts.max_seq_length;
    if max_seq_length < 3 {
        return Err(DistillError::Configuration(format!(
            "max_seq_length must be at least 3, got {max_seq_length}"
        )));
    }
    let pad_id = tokenizer.pad_token_id();
    let mut label_counts = vec![0usize; vocab.len()];
    let mut features = Vec::with_capacity(examples.len());
    let mut skipped = 0usize;

    for (ex_index, example) in examples.iter().enumerate() {
        if ex_index % PROGRESS_EVERY == 0 {
            info!(processed = ex_index, total = examples.len(), "Encoding examples");
        }

        let body = example.tokens.len().min(max_seq_length - 2);
        let mut tokens: Vec<&str> = Vec::with_capacity(body + 2);
        tokens.push(CLS_TOKEN);
        tokens.extend(example.tokens[..body].iter().map(String::as_str));
        tokens.push(SEP_TOKEN);

        let mut input_ids = tokenizer.convert_tokens_to_ids(&tokens);
        let mut input_mask = vec![1u32; input_ids.len()];
        let mut label_ids = vec![NO_LABEL_ID; max_seq_length];

        for (position, raw_label) in &example.annotations {
            match align(example, &tokens, vocab, *position, raw_label) {
                Ok((slot, id)) => {
                    label_ids[slot] = id;
                    label_counts[id as usize] += 1;
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, tokens = ?tokens, "Skipping annotation");
                }
            }
        }

        input_ids.resize(max_seq_length, pad_id);
        input_mask.resize(max_seq_length, 0);

        let label_pos = example.position + 1;
        if label_pos < 0 || label_pos as usize >= max_seq_length {
            return Err(DistillError::Encoding {
                guid: example.guid.clone(),
                label_pos,
                max_seq_length,
            });
        }
        let label_pos = label_pos as usize;

        if ex_index < LOGGED_EXAMPLES {
            debug!(
                guid = %example.guid,
                tokens = %tokens.join(" "),
                input_ids = ?input_ids,
                input_mask = ?input_mask,
                label_ids = ?label_ids,
                label_pos,
                char = %example.char,
                "Encoded example"
            );
        }

        features.push(EncodedFeature {
            input_ids,
            input_mask,
            label_ids,
            label_pos,
            char: example.char.clone(),
        });
    }

    let masks = TaskMasks::build(vocab, &label_counts, max_seq_length, opts.hybrid_attention, device)?;
    info!(
        features = features.len(),
        skipped_annotations = skipped,
        labels = vocab.len(),
        "Encoding finished"
    );
    debug!(class_weight = ?masks.class_weight.to_vec1::<f32>()?, "Class weights");

    Ok(EncodedCorpus { features, masks, label_counts, max_seq_length })
}

/// Check one annotation against the tokenised text; returns `(slot, label id)`.
fn align(
    example: &Example,
    tokens: &[&str],
    vocab: &LabelVocab,
    position: i64,
    raw_label: &str,
) -> DistillResult<(usize, i64)> {
    let mismatch = |reason: String| DistillError::LabelAlignment {
        guid: example.guid.clone(),
        position,
        label: raw_label.to_string(),
        reason,
    };
    let label = normalize_label(raw_label);
    let expected = LabelVocab::char_of(&label);

    // Slot must be a body token, not [CLS] / [SEP] or beyond truncation.
    let slot = position + 1;
    if slot < 1 || slot as usize >= tokens.len() - 1 {
        return Err(mismatch(format!("slot {slot} is outside the token window")));
    }
    let slot = slot as usize;
    if tokens[slot] != expected {
        return Err(mismatch(format!("token is {:?}, label expects {expected:?}", tokens[slot])));
    }
    match vocab.id(&label) {
        Some(id) if id >= 0 => Ok((slot, id)),
        _ => Err(mismatch("label is not in the vocabulary".to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::from_vocab(&["[PAD]", "[UNK]", "[CLS]", "[SEP]", "弹", "琴", "子", "他", "会"])
            .unwrap()
    }

    fn vocab() -> LabelVocab {
        LabelVocab::new(vec!["弹\tdan4".into(), "弹\ttan2".into()])
    }

    fn example(i: usize, text: &str, annotations: &[(i64, &str)], position: i64) -> Example {
        Example {
            guid: format!("0-{i}"),
            tokens: text.chars().map(String::from).collect(),
            char: "弹".to_string(),
            annotations: annotations.iter().map(|(p, l)| (*p, l.to_string())).collect(),
            position,
        }
    }

    fn opts(max_seq_length: usize) -> EncodeOptions {
        EncodeOptions { max_seq_length, hybrid_attention: false }
    }

    #[test]
    fn normalize_inserts_separator_after_first_char() {
        assert_eq!(normalize_label("弹dan4"), "弹\tdan4");
        assert_eq!(normalize_label("弹\tdan4"), "弹\tdan4");
        assert_eq!(normalize_label(""), "\t");
    }

    #[test]
    fn vocab_normalizes_and_maps_no_label() {
        let v = LabelVocab::new(vec!["弹dan4".into(), "长\tchang2".into()]);
        assert_eq!(v.labels(), &["弹\tdan4".to_string(), "长\tchang2".to_string()]);
        assert_eq!(v.id("弹\tdan4"), Some(0));
        assert_eq!(v.id(NO_LABEL), Some(-1));
        assert_eq!(v.id("长\tchang2"), Some(1));
        assert_eq!(LabelVocab::char_of(&v.labels()[1]), "长");
    }

    #[test]
    fn three_example_scenario() {
        let examples = vec![
            example(0, "弹琴", &[(0, "弹\ttan2")], 0),
            example(1, "子弹", &[(1, "弹\tdan4")], 1),
            example(2, "他会弹琴", &[(2, "弹tan2")], 2),
        ];
        let enc = encode(&examples, &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap();
        assert_eq!(enc.len(), 3);
        for f in &enc.features {
            assert!(f.label_pos < 8);
        }
        assert_eq!(enc.masks.candidate_mask.dims(), &[2, 2]);
        let mask = enc.masks.candidate_mask.flatten_all().unwrap().to_vec1::<u8>().unwrap();
        assert_eq!(mask, vec![0, 0, 0, 0]);
        assert_eq!(enc.label_counts, vec![1, 2]);
    }

    #[test]
    fn lengths_are_fixed_for_short_exact_and_long_text() {
        let max = 6;
        for text in ["弹", "弹琴子弹", "弹琴子弹他会弹琴"] {
            let ex = example(0, text, &[], 0);
            let enc = encode(&[ex], &vocab(), &tokenizer(), opts(max), &Device::Cpu).unwrap();
            let f = &enc.features[0];
            assert_eq!(f.input_ids.len(), max);
            assert_eq!(f.input_mask.len(), max);
            assert_eq!(f.label_ids.len(), max);
            let real = text.chars().count().min(max - 2) + 2;
            assert_eq!(f.input_mask.iter().filter(|&&m| m == 1).count(), real);
            assert_eq!(f.input_ids[0], 2);
            assert_eq!(f.input_ids[real - 1], 3);
        }
    }

    #[test]
    fn matching_annotation_sets_exactly_one_label() {
        let ex = example(0, "子弹", &[(1, "弹\tdan4")], 1);
        let enc = encode(&[ex], &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap();
        let f = &enc.features[0];
        let set: Vec<_> = f.label_ids.iter().enumerate().filter(|(_, &l)| l != -1).collect();
        assert_eq!(set, vec![(2, &0)]);
        assert_eq!(f.label_pos, 2);
        assert_eq!(f.target(), 0);
    }

    #[test]
    fn mismatched_annotation_is_skipped_not_raised() {
        let ex = example(0, "子弹", &[(0, "弹\tdan4"), (9, "弹\ttan2"), (1, "长\tchang2")], 1);
        let enc = encode(&[ex], &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap();
        assert!(enc.features[0].label_ids.iter().all(|&l| l == -1));
        assert_eq!(enc.label_counts, vec![0, 0]);
    }

    #[test]
    fn truncated_annotation_is_skipped() {
        // "弹" at index 3 falls off once the body is cut to 2 tokens.
        let ex = example(0, "子弹琴弹", &[(3, "弹\tdan4")], 1);
        let enc = encode(&[ex], &vocab(), &tokenizer(), opts(4), &Device::Cpu).unwrap();
        assert!(enc.features[0].label_ids.iter().all(|&l| l == -1));
    }

    #[test]
    fn position_outside_window_is_fatal() {
        let ex = example(0, "子弹琴弹", &[], 7);
        let err = encode(&[ex], &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap_err();
        assert!(matches!(err, DistillError::Encoding { label_pos: 8, .. }));
    }

    #[test]
    fn encoding_is_deterministic() {
        let examples = vec![example(0, "他会弹琴", &[(2, "弹\ttan2")], 2)];
        let a = encode(&examples, &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap();
        let b = encode(&examples, &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap();
        assert_eq!(a.features, b.features);
    }

    #[test]
    fn batch_stacks_rows() {
        let examples = vec![
            example(0, "弹琴", &[(0, "弹\ttan2")], 0),
            example(1, "子弹", &[(1, "弹\tdan4")], 1),
        ];
        let enc = encode(&examples, &vocab(), &tokenizer(), opts(8), &Device::Cpu).unwrap();
        let batch = enc.batch(&[1, 0], &Device::Cpu).unwrap();
        assert_eq!(batch.input_ids.dims(), &[2, 8]);
        assert_eq!(batch.label_pos.to_vec1::<u32>().unwrap(), vec![2, 1]);
        assert_eq!(batch.targets, vec![0, 1]);
        assert!(enc.batch(&[5], &Device::Cpu).is_err());
    }
}
