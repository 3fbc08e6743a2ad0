//! Tools that build training splits from raw datasets.
//!
//! Each split `part` is written as `{part}_features.bin` and `{part}_questions.bin`
//! next to a shared `vocab.json`.

pub mod flatqa;
mod render;
pub mod shapes;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::data::{FeatureStore, QuestionStore};

pub const VOCAB_FILE: &str = "vocab.json";

pub fn features_file(dir: &Path, part: &str) -> PathBuf {
    dir.join(format!("{}_features.bin", part))
}

pub fn questions_file(dir: &Path, part: &str) -> PathBuf {
    dir.join(format!("{}_questions.bin", part))
}

/// Validate and write one split.
pub fn write_split(dir: &Path, part: &str, features: &FeatureStore, questions: &QuestionStore) -> Result<()> {
    questions.validate(features.num_images())?;
    features.save(&features_file(dir, part))?;
    questions.save(&questions_file(dir, part))?;
    info!(
        "Wrote {} split: {} questions over {} images",
        part,
        questions.len(),
        features.num_images()
    );
    Ok(())
}
