//! # polyphone-distill
//!
//! Polyphone disambiguation data pipeline and teacher-guided distillation.
//!
//! A large BERT *teacher* is frozen and a smaller BERT *student* is trained
//! to reproduce its hidden states on polyphone sentences:
//!
//! 1. [`corpus`] reads `train.json`, `test_<variant>.json` and `info.json`.
//! 2. [`features`] turns examples into fixed-length rows and builds the
//!    task masks in [`masks`].
//! 3. [`distiller`] runs the epoch loop with [`optimizer`] and
//!    [`precision`], ordering batches with [`sampler`] and writing epoch
//!    checkpoints through [`checkpoint`].
//! 4. [`evaluation`] scores the student's label logits on a held-out split.
//!
//! ```text
//! polyphone distill \
//!   --data-dir        ./data \
//!   --bert-model      bert-base-chinese \
//!   --teacher-model   ./teacher/pytorch_model.bin \
//!   --teacher-config  ./teacher/config.json \
//!   --output-dir      ./output \
//!   --do-train --do-eval
//! ```

pub mod checkpoint;
pub mod corpus;
pub mod distiller;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod masks;
pub mod optimizer;
pub mod precision;
pub mod sampler;
pub mod student;
pub mod teacher;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use corpus::{CorpusLoader, Example};
pub use distiller::{DistillConfig, Distiller, LoopState, TrainingStats};
pub use error::{DistillError, DistillResult};
pub use evaluation::{evaluate, EvalOptions, EvalReport};
pub use features::{encode, EncodeOptions, EncodedCorpus, EncodedFeature, LabelVocab};
pub use masks::TaskMasks;
pub use precision::{LossScaler, Precision};
pub use sampler::{ExecutionMode, Sampler};
pub use student::{BertStudent, StudentHeads, StudentInit};
pub use teacher::BertTeacher;
