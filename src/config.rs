use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ModelType {
    #[serde(rename = "SimpleNMN")]
    #[value(name = "SimpleNMN")]
    SimpleNmn,
    #[serde(rename = "MAC")]
    #[value(name = "MAC")]
    Mac,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::SimpleNmn => write!(f, "SimpleNMN"),
            ModelType::Mac => write!(f, "MAC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum OptimizerKind {
    #[value(name = "Adam")]
    Adam,
    #[serde(rename = "SGD")]
    #[value(name = "SGD")]
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    Lstm,
    Gru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Downsample {
    Maxpool2,
    Maxpoolfull,
    Avgpoolfull,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StemConfig {
    pub num_layers: usize,
    pub batchnorm: bool,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: Option<usize>,
    pub subsample_layers: Vec<usize>,
}

impl Default for StemConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            batchnorm: false,
            kernel_size: 3,
            stride: 1,
            padding: None,
            subsample_layers: Vec::new(),
        }
    }
}

impl StemConfig {
    /// Same-padding unless set explicitly.
    pub fn padding(&self) -> usize {
        self.padding.unwrap_or(self.kernel_size / 2)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_layers > 0, "module_stem_num_layers must be > 0");
        ensure!(self.kernel_size > 0, "module_stem_kernel_size must be > 0");
        ensure!(self.stride > 0, "module_stem_stride must be > 0");
        ensure!(
            self.subsample_layers.iter().all(|&l| l < self.num_layers),
            "module_stem_subsample_layers must index existing stem layers"
        );
        Ok(())
    }

    /// Spatial size of the stem output for `[h, w]` input.
    ///
    /// Fails when a convolution kernel no longer fits or a 2x2 pool would
    /// leave an empty map.
    pub fn output_hw(&self, input_hw: [usize; 2]) -> Result<[usize; 2]> {
        let padding = self.padding();
        let mut hw = input_hw;
        for layer in 0..self.num_layers {
            ensure!(
                hw.iter().all(|&d| d + 2 * padding >= self.kernel_size),
                "stem layer {} gets a {:?} map, smaller than module_stem_kernel_size {}",
                layer,
                hw,
                self.kernel_size
            );
            hw = hw.map(|d| (d + 2 * padding - self.kernel_size) / self.stride + 1);
            if self.subsample_layers.contains(&layer) {
                ensure!(
                    hw.iter().all(|&d| d >= 2),
                    "stem layer {} cannot subsample a {:?} map",
                    layer,
                    hw
                );
                hw = hw.map(|d| d / 2);
            }
        }
        Ok(hw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub proj_dim: usize,
    pub downsample: Downsample,
    pub fc_dims: Vec<usize>,
    pub batchnorm: bool,
    pub dropout: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            proj_dim: 512,
            downsample: Downsample::Maxpool2,
            fc_dims: vec![1024],
            batchnorm: false,
            dropout: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    pub encoder_type: EncoderType,
    pub rnn_wordvec_dim: usize,
    pub rnn_hidden_dim: usize,
    pub rnn_num_layers: usize,
    pub rnn_dropout: f64,
    pub bidirectional: bool,
    pub question_embedding_dropout: f64,
    pub stem_dropout: f64,
    pub memory_dropout: f64,
    pub read_dropout: f64,
    pub use_memory_gate: bool,
    pub question2output: bool,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            encoder_type: EncoderType::Lstm,
            rnn_wordvec_dim: 300,
            rnn_hidden_dim: 256,
            rnn_num_layers: 1,
            rnn_dropout: 0.0,
            bidirectional: true,
            question_embedding_dropout: 0.08,
            stem_dropout: 0.18,
            memory_dropout: 0.15,
            read_dropout: 0.15,
            use_memory_gate: false,
            question2output: true,
        }
    }
}

impl MacConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.rnn_wordvec_dim > 0, "rnn_wordvec_dim must be > 0");
        ensure!(self.rnn_hidden_dim > 0, "rnn_hidden_dim must be > 0");
        ensure!(self.rnn_num_layers > 0, "rnn_num_layers must be > 0");
        ensure!(
            !(self.bidirectional && self.encoder_type == EncoderType::Gru),
            "bidirectional encoding requires encoder_type lstm"
        );
        for (name, p) in [
            ("rnn_dropout", self.rnn_dropout),
            ("mac_question_embedding_dropout", self.question_embedding_dropout),
            ("mac_stem_dropout", self.stem_dropout),
            ("mac_memory_dropout", self.memory_dropout),
            ("mac_read_dropout", self.read_dropout),
        ] {
            ensure!((0.0..1.0).contains(&p), "{} must be within [0,1)", name);
        }
        Ok(())
    }

    pub fn encoder_output_dim(&self) -> usize {
        if self.bidirectional {
            2 * self.rnn_hidden_dim
        } else {
            self.rnn_hidden_dim
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub feature_dim: [usize; 3],
    pub module_dim: usize,
    pub module_kernel_size: usize,
    pub module_residual: bool,
    pub module_batchnorm: bool,
    /// Reasoning steps of the MAC cell.
    pub num_modules: usize,
    pub use_coords: bool,
    pub stem: StemConfig,
    pub classifier: ClassifierConfig,
    pub mac: MacConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::SimpleNmn,
            feature_dim: [1024, 14, 14],
            module_dim: 128,
            module_kernel_size: 3,
            module_residual: true,
            module_batchnorm: false,
            num_modules: 12,
            use_coords: false,
            stem: StemConfig::default(),
            classifier: ClassifierConfig::default(),
            mac: MacConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.feature_dim.iter().all(|&d| d > 0), "feature_dim entries must be > 0");
        ensure!(self.module_dim > 0, "module_dim must be > 0");
        ensure!(self.module_kernel_size % 2 == 1, "module_kernel_size must be odd");
        ensure!((0.0..1.0).contains(&self.classifier.dropout), "classifier_dropout must be within [0,1)");
        self.stem.validate()?;
        let [_, h, w] = self.feature_dim;
        let stem_hw = self.stem.output_hw([h, w])?;
        if self.model_type == ModelType::SimpleNmn && self.classifier.downsample == Downsample::Maxpool2 {
            ensure!(
                stem_hw.iter().all(|&d| d >= 2),
                "classifier_downsample maxpool2 needs a stem output of at least 2x2, got {:?}",
                stem_hw
            );
        }
        if self.model_type == ModelType::Mac {
            ensure!(self.num_modules > 0, "num_modules must be > 0 for MAC");
            self.mac.validate()?;
        }
        Ok(())
    }

    /// Channels entering the stem, including coordinate maps.
    pub fn stem_input_dim(&self) -> usize {
        self.feature_dim[0] + if self.use_coords { 2 } else { 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_question_h5: PathBuf,
    pub train_features_h5: PathBuf,
    pub val_question_h5: PathBuf,
    pub val_features_h5: PathBuf,
    pub vocab_json: PathBuf,
    pub shuffle_train_data: bool,
    pub num_train_samples: Option<usize>,
    pub num_val_samples: Option<usize>,
    pub loader_seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_question_h5: PathBuf::from("data/train_questions.bin"),
            train_features_h5: PathBuf::from("data/train_features.bin"),
            val_question_h5: PathBuf::from("data/val_questions.bin"),
            val_features_h5: PathBuf::from("data/val_features.bin"),
            vocab_json: PathBuf::from("data/vocab.json"),
            shuffle_train_data: true,
            num_train_samples: None,
            num_val_samples: Some(10000),
            loader_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub num_iterations: usize,
    pub batch_size: usize,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub checkpoint_every: usize,
    pub record_loss_every: usize,
    pub print_verbose_every: usize,
    pub checkpoint_path: PathBuf,
    pub allow_resume: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_iterations: 100_000,
            batch_size: 64,
            optimizer: OptimizerKind::Adam,
            learning_rate: 5e-4,
            weight_decay: 0.0,
            checkpoint_every: 10_000,
            record_loss_every: 1,
            print_verbose_every: 1000,
            checkpoint_path: PathBuf::from("checkpoints/model.json"),
            allow_resume: true,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_iterations > 0, "num_iterations must be > 0");
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(self.learning_rate > 0.0, "learning_rate must be > 0");
        ensure!(self.weight_decay >= 0.0, "weight_decay must be >= 0");
        ensure!(self.checkpoint_every > 0, "checkpoint_every must be > 0");
        ensure!(self.record_loss_every > 0, "record_loss_every must be > 0");
        ensure!(self.print_verbose_every > 0, "print_verbose_every must be > 0");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub training: TrainingConfig,
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&config_str).with_context(|| "Failed to parse config JSON")
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()
    }
}

impl fmt::Display for TrainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model={} module_dim={} feature_dim={:?} optimizer={:?} lr={} batch_size={} iterations={}",
            self.model.model_type,
            self.model.module_dim,
            self.model.feature_dim,
            self.training.optimizer,
            self.training.learning_rate,
            self.training.batch_size,
            self.training.num_iterations,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"model": {"model_type": "MAC", "module_dim": 64}, "training": {"optimizer": "SGD"}}"#;
        let config: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model.model_type, ModelType::Mac);
        assert_eq!(config.model.module_dim, 64);
        assert_eq!(config.model.module_kernel_size, 3);
        assert_eq!(config.training.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.training.batch_size, 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_bidirectional_gru_rejected() {
        let mut config = TrainConfig::default();
        config.model.model_type = ModelType::Mac;
        config.model.mac.encoder_type = EncoderType::Gru;
        config.model.mac.bidirectional = true;
        assert!(config.validate().is_err());

        config.model.mac.bidirectional = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_subsample_layer_out_of_range() {
        let mut config = TrainConfig::default();
        config.model.stem.subsample_layers = vec![config.model.stem.num_layers];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stem_output_must_stay_non_empty() {
        let mut config = TrainConfig::default();
        config.model.feature_dim = [3, 2, 2];
        config.model.stem.subsample_layers = vec![0, 1];
        assert!(config.validate().is_err());

        config.model.stem.subsample_layers = vec![0];
        assert_eq!(config.model.stem.output_hw([2, 2]).unwrap(), [1, 1]);
        // maxpool2 in the classifier would halve the 1x1 map again
        assert!(config.validate().is_err());
        config.model.classifier.downsample = Downsample::Avgpoolfull;
        config.validate().unwrap();

        config.model.stem.kernel_size = 7;
        config.model.stem.padding = Some(0);
        assert!(config.model.stem.output_hw([4, 4]).is_err());
    }
}
