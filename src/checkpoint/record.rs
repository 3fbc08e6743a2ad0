use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::TrainConfig;
use crate::training::TrainingStats;

/// Checkpoint metadata: progress, configuration and the weight files next to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub iteration: usize,
    pub config: TrainConfig,
    pub latest_model_file: String,
    pub best_model_file: Option<String>,
    pub timestamp: u64,
    pub stats: TrainingStats,
}

impl CheckpointData {
    /// Weights with the best validation accuracy, falling back to the latest ones.
    pub fn best_or_latest(&self) -> &str {
        self.best_model_file.as_deref().unwrap_or(&self.latest_model_file)
    }
}

/// Save model weights and write the metadata file at `metadata_path`.
///
/// The latest weights are always written; `is_best` also refreshes the best weights.
pub fn save_checkpoint<B: Backend, M: Module<B>>(
    model: &M,
    is_best: bool,
    iteration: usize,
    config: &TrainConfig,
    stats: &TrainingStats,
    metadata_path: &Path,
) -> Result<PathBuf> {
    let checkpoint_dir = checkpoint_dir(metadata_path);
    fs::create_dir_all(&checkpoint_dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", checkpoint_dir))?;

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let stem = metadata_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("checkpoint");
    let latest_model_file = format!("{}_latest", stem);
    write_weights(model, &checkpoint_dir.join(&latest_model_file))?;

    let previous_best = if metadata_path.exists() {
        load_checkpoint(metadata_path).ok().and_then(|c| c.best_model_file)
    } else {
        None
    };
    let best_model_file = if is_best {
        let best = format!("{}_best", stem);
        write_weights(model, &checkpoint_dir.join(&best))?;
        Some(best)
    } else {
        previous_best
    };

    let checkpoint_data = CheckpointData {
        iteration,
        config: config.clone(),
        latest_model_file,
        best_model_file,
        timestamp,
        stats: stats.clone(),
    };

    let metadata_json = serde_json::to_string_pretty(&checkpoint_data)
        .with_context(|| "Failed to serialize checkpoint metadata")?;
    fs::write(metadata_path, metadata_json)
        .with_context(|| format!("Failed to write checkpoint metadata: {:?}", metadata_path))?;

    info!("Checkpoint saved at iteration {}: {:?}", iteration, metadata_path);

    Ok(metadata_path.to_path_buf())
}

fn write_weights<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<()> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), path.to_path_buf())
        .with_context(|| format!("Failed to save model weights to {:?}", path))?;
    info!("Model weights saved to: {:?}", path);
    Ok(())
}

/// Read checkpoint metadata
pub fn load_checkpoint(metadata_path: &Path) -> Result<CheckpointData> {
    let metadata_json = fs::read_to_string(metadata_path)
        .with_context(|| format!("Failed to read checkpoint file: {:?}", metadata_path))?;

    serde_json::from_str(&metadata_json).with_context(|| "Failed to parse checkpoint metadata")
}

/// Load weights named in a checkpoint into `model`, which must have the same architecture.
pub fn load_weights<B: Backend, M: Module<B>>(
    model: M,
    metadata_path: &Path,
    model_file: &str,
    device: &B::Device,
) -> Result<M> {
    let model_path = checkpoint_dir(metadata_path).join(model_file);

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(model_path.clone(), device)
        .with_context(|| format!("Failed to load model weights from: {:?}", model_path))?;

    info!("Model weights loaded from {:?}", model_path);
    Ok(model.load_record(record))
}

fn checkpoint_dir(metadata_path: &Path) -> PathBuf {
    match metadata_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// List checkpoint metadata files in a directory as `(path, iteration, best_val_acc)`
pub fn list_checkpoints(checkpoint_dir: &Path) -> Result<Vec<(PathBuf, usize, f64)>> {
    if !checkpoint_dir.exists() {
        warn!("Checkpoint directory does not exist: {:?}", checkpoint_dir);
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();

    for entry in WalkDir::new(checkpoint_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            if let Ok(checkpoint_data) = load_checkpoint(path) {
                checkpoints.push((
                    path.to_path_buf(),
                    checkpoint_data.iteration,
                    checkpoint_data.stats.best_val_acc,
                ));
            }
        }
    }

    // Sort by iteration
    checkpoints.sort_by_key(|(_, iteration, _)| *iteration);

    Ok(checkpoints)
}
