//! # polyphone-core
//!
//! Shared plumbing for the polyphone disambiguation trainer: the error
//! taxonomy, compute-device selection, the BERT tokenizer wrapper,
//! pretrained-model resolution and state-dict I/O, and the adapter traits the
//! training loop drives.
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod device;
pub mod error;
pub mod loader;
pub mod model;
pub mod tokenizer;

pub use device::select_device;
pub use error::{CoreError, CoreResult};
pub use loader::ModelFiles;
pub use model::{ModelState, StudentModel, TeacherModel};
pub use tokenizer::Tokenizer;
