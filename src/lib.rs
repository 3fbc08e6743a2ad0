// Library exports for use in scripts and other binaries

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod datasets;
pub mod error;
pub mod launch;
pub mod model;
pub mod programs;
pub mod training;
pub mod utils;
pub mod vocab;

// Re-export commonly used types
pub use config::TrainConfig;
pub use error::VrError;
pub use model::{AnswerModel, MacNetwork, ModuleNet};
pub use training::{run_evaluation, run_training, VqaTrainer};
pub use vocab::Vocab;
