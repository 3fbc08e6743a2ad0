//! Preset invocations of the `vr-train` binary.
//!
//! A preset expands to a fixed list of training flags. Extra arguments are
//! appended after the defaults; the trainer keeps the last value of a repeated
//! flag, so they override the preset.

use clap::ValueEnum;
use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};

/// Name of the trainer binary the launcher runs.
pub const TRAINER_BIN: &str = "vr-train";

/// Environment variable holding the dataset directory.
pub const DATA_DIR_ENV: &str = "VR_DATA_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// SimpleNMN on SHAPES-style 64x64 images
    #[value(name = "simple-nmn-shapes")]
    SimpleNmnShapes,
    /// MAC on SHAPES-style 64x64 images
    #[value(name = "mac-shapes")]
    MacShapes,
}

fn data_args(data_dir: &Path) -> Vec<String> {
    let path = |name: &str| data_dir.join(name).display().to_string();
    vec![
        "--train_question_h5".into(),
        path("train_questions.bin"),
        "--train_features_h5".into(),
        path("train_features.bin"),
        "--val_question_h5".into(),
        path("val_questions.bin"),
        "--val_features_h5".into(),
        path("val_features.bin"),
        "--vocab_json".into(),
        path("vocab.json"),
    ]
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl Preset {
    /// The flags passed to the trainer when no extra arguments are given.
    pub fn default_args(self, data_dir: &Path) -> Vec<String> {
        let (model, arch): (&str, &[&str]) = match self {
            Preset::SimpleNmnShapes => (
                "SimpleNMN",
                &[
                    "--module_dim", "64",
                    "--module_batchnorm", "1",
                    "--module_residual", "1",
                    "--use_coords", "1",
                    "--module_stem_num_layers", "6",
                    "--module_stem_batchnorm", "1",
                    "--module_stem_kernel_size", "3",
                    "--module_stem_stride", "1",
                    "--module_stem_padding", "1",
                    "--module_stem_subsample_layers", "1,3",
                    "--classifier_proj_dim", "512",
                    "--classifier_downsample", "maxpoolfull",
                    "--classifier_fc_dims", "1024",
                    "--classifier_batchnorm", "1",
                    "--learning_rate", "1e-4",
                ],
            ),
            Preset::MacShapes => (
                "MAC",
                &[
                    "--module_dim", "128",
                    "--num_modules", "12",
                    "--use_coords", "1",
                    "--module_stem_num_layers", "6",
                    "--module_stem_batchnorm", "1",
                    "--module_stem_kernel_size", "3",
                    "--module_stem_stride", "1",
                    "--module_stem_padding", "1",
                    "--module_stem_subsample_layers", "1,3",
                    "--classifier_fc_dims", "1024",
                    "--encoder_type", "lstm",
                    "--bidirectional", "1",
                    "--rnn_wordvec_dim", "64",
                    "--rnn_hidden_dim", "64",
                    "--rnn_num_layers", "1",
                    "--mac_question_embedding_dropout", "0",
                    "--mac_stem_dropout", "0",
                    "--mac_memory_dropout", "0",
                    "--mac_read_dropout", "0",
                    "--mac_use_memory_gate", "1",
                    "--mac_question2output", "1",
                    "--learning_rate", "1e-4",
                ],
            ),
        };

        let mut args = strings(&["--model_type", model]);
        args.extend(data_args(data_dir));
        args.extend(strings(&["--feature_dim", "3,64,64"]));
        args.extend(strings(arch));
        args.extend(strings(&[
            "--num_iterations", "50000",
            "--checkpoint_every", "1000",
            "--record_loss_every", "10",
            "--print_verbose_every", "100",
            "--num_val_samples", "1000",
            "--optimizer", "Adam",
            "--batch_size", "128",
            "--weight_decay", "0",
        ]));
        args
    }
}

/// Full trainer argument list: `train`, the preset defaults, then `forwarded` unchanged.
pub fn compose_args<S: AsRef<str>>(preset: Preset, data_dir: &Path, forwarded: &[S]) -> Vec<String> {
    let mut args = vec!["train".to_string()];
    args.extend(preset.default_args(data_dir));
    args.extend(forwarded.iter().map(|a| a.as_ref().to_string()));
    args
}

/// The trainer binary that sits next to the launcher executable.
pub fn trainer_path(launcher_exe: &Path) -> PathBuf {
    let name = format!("{}{}", TRAINER_BIN, EXE_SUFFIX);
    match launcher_exe.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}
