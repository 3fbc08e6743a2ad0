use anyhow::{ensure, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Downsample, EncoderType, ModelType, OptimizerKind, TrainConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Visual reasoning model training CLI")]
#[command(args_override_self = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Train a SimpleNMN or MAC model
    Train(TrainArgs),
    /// Report the accuracy of a checkpoint on one split
    Eval(EvalArgs),
    /// List checkpoints in a directory
    List(ListArgs),
}

/// Accepts `0|1|true|false`.
fn parse_flag(s: &str) -> Result<bool, String> {
    match s {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(format!("expected 0, 1, true or false, got '{}'", other)),
    }
}

/// Training flags. Every flag is optional and overrides the value from `--config`
/// (or the built-in default).
#[derive(Debug, Default, Args)]
pub struct TrainArgs {
    /// Base configuration JSON
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long = "model_type")]
    pub model_type: Option<ModelType>,

    // Data
    #[arg(long = "train_question_h5")]
    pub train_question_h5: Option<PathBuf>,
    #[arg(long = "train_features_h5")]
    pub train_features_h5: Option<PathBuf>,
    #[arg(long = "val_question_h5")]
    pub val_question_h5: Option<PathBuf>,
    #[arg(long = "val_features_h5")]
    pub val_features_h5: Option<PathBuf>,
    #[arg(long = "vocab_json")]
    pub vocab_json: Option<PathBuf>,
    /// Image feature shape as C,H,W
    #[arg(long = "feature_dim", value_delimiter = ',', action = ArgAction::Set)]
    pub feature_dim: Option<Vec<usize>>,
    #[arg(long = "shuffle_train_data", value_parser = parse_flag)]
    pub shuffle_train_data: Option<bool>,
    #[arg(long = "num_train_samples")]
    pub num_train_samples: Option<usize>,
    #[arg(long = "num_val_samples")]
    pub num_val_samples: Option<usize>,
    #[arg(long = "loader_seed")]
    pub loader_seed: Option<u64>,

    // Architecture
    #[arg(long = "module_dim")]
    pub module_dim: Option<usize>,
    #[arg(long = "module_kernel_size")]
    pub module_kernel_size: Option<usize>,
    #[arg(long = "module_residual", value_parser = parse_flag)]
    pub module_residual: Option<bool>,
    #[arg(long = "module_batchnorm", value_parser = parse_flag)]
    pub module_batchnorm: Option<bool>,
    #[arg(long = "num_modules")]
    pub num_modules: Option<usize>,
    #[arg(long = "use_coords", value_parser = parse_flag)]
    pub use_coords: Option<bool>,
    #[arg(long = "module_stem_num_layers")]
    pub module_stem_num_layers: Option<usize>,
    #[arg(long = "module_stem_batchnorm", value_parser = parse_flag)]
    pub module_stem_batchnorm: Option<bool>,
    #[arg(long = "module_stem_kernel_size")]
    pub module_stem_kernel_size: Option<usize>,
    #[arg(long = "module_stem_stride")]
    pub module_stem_stride: Option<usize>,
    #[arg(long = "module_stem_padding")]
    pub module_stem_padding: Option<usize>,
    #[arg(long = "module_stem_subsample_layers", value_delimiter = ',', action = ArgAction::Set)]
    pub module_stem_subsample_layers: Option<Vec<usize>>,
    #[arg(long = "classifier_proj_dim")]
    pub classifier_proj_dim: Option<usize>,
    #[arg(long = "classifier_downsample")]
    pub classifier_downsample: Option<Downsample>,
    #[arg(long = "classifier_fc_dims", value_delimiter = ',', action = ArgAction::Set)]
    pub classifier_fc_dims: Option<Vec<usize>>,
    #[arg(long = "classifier_batchnorm", value_parser = parse_flag)]
    pub classifier_batchnorm: Option<bool>,
    #[arg(long = "classifier_dropout")]
    pub classifier_dropout: Option<f64>,
    #[arg(long = "encoder_type")]
    pub encoder_type: Option<EncoderType>,
    #[arg(long = "rnn_wordvec_dim")]
    pub rnn_wordvec_dim: Option<usize>,
    #[arg(long = "rnn_hidden_dim")]
    pub rnn_hidden_dim: Option<usize>,
    #[arg(long = "rnn_num_layers")]
    pub rnn_num_layers: Option<usize>,
    #[arg(long = "rnn_dropout")]
    pub rnn_dropout: Option<f64>,
    #[arg(long = "bidirectional", value_parser = parse_flag)]
    pub bidirectional: Option<bool>,
    #[arg(long = "mac_question_embedding_dropout")]
    pub mac_question_embedding_dropout: Option<f64>,
    #[arg(long = "mac_stem_dropout")]
    pub mac_stem_dropout: Option<f64>,
    #[arg(long = "mac_memory_dropout")]
    pub mac_memory_dropout: Option<f64>,
    #[arg(long = "mac_read_dropout")]
    pub mac_read_dropout: Option<f64>,
    #[arg(long = "mac_use_memory_gate", value_parser = parse_flag)]
    pub mac_use_memory_gate: Option<bool>,
    #[arg(long = "mac_question2output", value_parser = parse_flag)]
    pub mac_question2output: Option<bool>,

    // Training control
    #[arg(long = "num_iterations")]
    pub num_iterations: Option<usize>,
    #[arg(long = "checkpoint_every")]
    pub checkpoint_every: Option<usize>,
    #[arg(long = "record_loss_every")]
    pub record_loss_every: Option<usize>,
    #[arg(long = "print_verbose_every")]
    pub print_verbose_every: Option<usize>,
    #[arg(long = "optimizer")]
    pub optimizer: Option<OptimizerKind>,
    #[arg(long = "learning_rate")]
    pub learning_rate: Option<f64>,
    #[arg(long = "batch_size")]
    pub batch_size: Option<usize>,
    #[arg(long = "weight_decay")]
    pub weight_decay: Option<f64>,
    #[arg(long = "checkpoint_path")]
    pub checkpoint_path: Option<PathBuf>,
    #[arg(long = "allow_resume", value_parser = parse_flag)]
    pub allow_resume: Option<bool>,
    #[arg(long = "seed")]
    pub seed: Option<u64>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl TrainArgs {
    /// Resolve the final configuration: `--config` (or defaults) overlaid by the flags.
    pub fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };

        let model = &mut config.model;
        set(&mut model.model_type, self.model_type);
        if let Some(dims) = self.feature_dim {
            ensure!(dims.len() == 3, "--feature_dim expects C,H,W, got {:?}", dims);
            model.feature_dim = [dims[0], dims[1], dims[2]];
        }
        set(&mut model.module_dim, self.module_dim);
        set(&mut model.module_kernel_size, self.module_kernel_size);
        set(&mut model.module_residual, self.module_residual);
        set(&mut model.module_batchnorm, self.module_batchnorm);
        set(&mut model.num_modules, self.num_modules);
        set(&mut model.use_coords, self.use_coords);

        let stem = &mut model.stem;
        set(&mut stem.num_layers, self.module_stem_num_layers);
        set(&mut stem.batchnorm, self.module_stem_batchnorm);
        set(&mut stem.kernel_size, self.module_stem_kernel_size);
        set(&mut stem.stride, self.module_stem_stride);
        if self.module_stem_padding.is_some() {
            stem.padding = self.module_stem_padding;
        }
        set(&mut stem.subsample_layers, self.module_stem_subsample_layers);

        let classifier = &mut model.classifier;
        set(&mut classifier.proj_dim, self.classifier_proj_dim);
        set(&mut classifier.downsample, self.classifier_downsample);
        set(&mut classifier.fc_dims, self.classifier_fc_dims);
        set(&mut classifier.batchnorm, self.classifier_batchnorm);
        set(&mut classifier.dropout, self.classifier_dropout);

        let mac = &mut model.mac;
        set(&mut mac.encoder_type, self.encoder_type);
        set(&mut mac.rnn_wordvec_dim, self.rnn_wordvec_dim);
        set(&mut mac.rnn_hidden_dim, self.rnn_hidden_dim);
        set(&mut mac.rnn_num_layers, self.rnn_num_layers);
        set(&mut mac.rnn_dropout, self.rnn_dropout);
        set(&mut mac.bidirectional, self.bidirectional);
        set(&mut mac.question_embedding_dropout, self.mac_question_embedding_dropout);
        set(&mut mac.stem_dropout, self.mac_stem_dropout);
        set(&mut mac.memory_dropout, self.mac_memory_dropout);
        set(&mut mac.read_dropout, self.mac_read_dropout);
        set(&mut mac.use_memory_gate, self.mac_use_memory_gate);
        set(&mut mac.question2output, self.mac_question2output);

        let data = &mut config.data;
        set(&mut data.train_question_h5, self.train_question_h5);
        set(&mut data.train_features_h5, self.train_features_h5);
        set(&mut data.val_question_h5, self.val_question_h5);
        set(&mut data.val_features_h5, self.val_features_h5);
        set(&mut data.vocab_json, self.vocab_json);
        set(&mut data.shuffle_train_data, self.shuffle_train_data);
        if self.num_train_samples.is_some() {
            data.num_train_samples = self.num_train_samples;
        }
        if self.num_val_samples.is_some() {
            data.num_val_samples = self.num_val_samples;
        }
        set(&mut data.loader_seed, self.loader_seed);

        let training = &mut config.training;
        set(&mut training.num_iterations, self.num_iterations);
        set(&mut training.checkpoint_every, self.checkpoint_every);
        set(&mut training.record_loss_every, self.record_loss_every);
        set(&mut training.print_verbose_every, self.print_verbose_every);
        set(&mut training.optimizer, self.optimizer);
        set(&mut training.learning_rate, self.learning_rate);
        set(&mut training.batch_size, self.batch_size);
        set(&mut training.weight_decay, self.weight_decay);
        set(&mut training.checkpoint_path, self.checkpoint_path);
        set(&mut training.allow_resume, self.allow_resume);
        set(&mut training.seed, self.seed);

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct EvalArgs {
    /// Checkpoint metadata JSON
    #[arg(long)]
    pub checkpoint: PathBuf,
    #[arg(long = "question_h5")]
    pub question_h5: PathBuf,
    #[arg(long = "features_h5")]
    pub features_h5: PathBuf,
    /// Evaluate at most this many questions
    #[arg(long = "num_samples")]
    pub num_samples: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value = "checkpoints")]
    pub dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn train_args(args: &[&str]) -> TrainArgs {
        let cli = Cli::try_parse_from(["vr-train", "train"].iter().chain(args)).unwrap();
        match cli.command {
            Commands::Train(args) => args,
            other => panic!("expected train, got {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = train_args(&[
            "--model_type",
            "MAC",
            "--feature_dim",
            "3,64,64",
            "--classifier_fc_dims",
            "256,128",
            "--mac_use_memory_gate",
            "1",
            "--optimizer",
            "SGD",
            "--learning_rate",
            "0.01",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.model.model_type, ModelType::Mac);
        assert_eq!(config.model.feature_dim, [3, 64, 64]);
        assert_eq!(config.model.classifier.fc_dims, vec![256, 128]);
        assert!(config.model.mac.use_memory_gate);
        assert_eq!(config.training.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.training.batch_size, 64);
    }

    #[test]
    fn test_repeated_flag_last_wins() {
        let config = train_args(&[
            "--batch_size",
            "32",
            "--batch_size",
            "8",
            "--classifier_fc_dims",
            "1024",
            "--classifier_fc_dims",
            "16,16",
            "--allow_resume",
            "true",
            "--allow_resume",
            "0",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.model.classifier.fc_dims, vec![16, 16]);
        assert!(!config.training.allow_resume);
    }

    #[test]
    fn test_flags_overlay_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("base.json");
        fs::write(&path, r#"{"training": {"batch_size": 16, "num_iterations": 50}}"#).unwrap();

        let config = train_args(&["--config", path.to_str().unwrap(), "--num_iterations", "7"])
            .into_config()
            .unwrap();
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.num_iterations, 7);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(Cli::try_parse_from(["vr-train", "train", "--use_coords", "yes"]).is_err());
        let args = train_args(&["--feature_dim", "3,64"]);
        assert!(args.into_config().is_err());
    }
}
