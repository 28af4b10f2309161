//! `polyphone encode`: dry run of the feature encoder.
//!
//! Loads a data directory, encodes the train split (and the test split with
//! `--with-test`) and reports feature counts, per-label occurrence counts and
//! the resulting class weights. Nothing is written.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Args;
use tracing::info;

use polyphone_core::{ModelFiles, Tokenizer};
use polyphone_distill::{encode, CorpusLoader, EncodeOptions, EncodedCorpus, LabelVocab};

use crate::config::{expand_cache_dir, AppConfig};

#[derive(Debug, Clone, Args)]
pub struct EncodeArgs {
    /// Directory holding train.json, test_<set>.json and info.json.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Model whose vocabulary tokenizes the text: a Hugging Face id or a local directory.
    #[arg(long)]
    pub bert_model: String,

    #[arg(long)]
    pub max_seq_length: Option<usize>,

    #[arg(long)]
    pub test_set: Option<String>,

    /// Also encode test_<set>.json.
    #[arg(long)]
    pub with_test: bool,

    #[arg(long)]
    pub hybrid_attention: bool,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

pub fn run(args: &EncodeArgs, config: &AppConfig) -> Result<()> {
    let test_set = args.test_set.clone().unwrap_or_else(|| config.training.test_set.clone());
    let loader = CorpusLoader::new(&args.data_dir, test_set);
    let vocab = LabelVocab::new(loader.labels()?);

    let cache_dir = args
        .cache_dir
        .clone()
        .or_else(|| (!config.model.cache_dir.is_empty()).then(|| expand_cache_dir(&config.model.cache_dir)));
    let files = ModelFiles::resolve(&args.bert_model, cache_dir.as_deref())
        .with_context(|| format!("Failed to resolve model '{}'", args.bert_model))?;
    let tokenizer = Tokenizer::from_model_dir(&files.dir)?;

    let opts = EncodeOptions {
        max_seq_length: args.max_seq_length.unwrap_or(config.training.max_seq_length),
        hybrid_attention: args.hybrid_attention,
    };
    let device = Device::Cpu;

    let train = encode(&loader.train_examples()?, &vocab, &tokenizer, opts, &device)?;
    report("train", &train, &vocab)?;

    if args.with_test {
        let test = encode(&loader.test_examples()?, &vocab, &tokenizer, opts, &device)?;
        report("test", &test, &vocab)?;
    }
    Ok(())
}

fn report(split: &str, corpus: &EncodedCorpus, vocab: &LabelVocab) -> Result<()> {
    let labelled = corpus.features.iter().filter(|f| f.target() >= 0).count();
    let weights = corpus.masks.class_weight.to_vec1::<f32>()?;
    info!(
        split,
        features = corpus.len(),
        labelled,
        annotations = corpus.label_counts.iter().sum::<usize>(),
        hybrid_attention = corpus.masks.hybrid_attention.is_some(),
        "Encoded split"
    );

    println!("\n{split}: {} features ({labelled} with a label at the polyphone)", corpus.len());
    println!("  {:<16} {:>8} {:>10}", "label", "count", "weight");
    for ((label, count), weight) in vocab.labels().iter().zip(&corpus.label_counts).zip(&weights) {
        println!("  {:<16} {:>8} {:>10.4}", label.replace('\t', " "), count, weight);
    }
    Ok(())
}
