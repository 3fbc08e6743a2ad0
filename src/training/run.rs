use anyhow::{bail, ensure, Context, Result};
use burn::module::{AutodiffModule, Module};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, Optimizer, SgdConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::path::Path;
use tracing::{info, warn};

use super::stats::{LossWindow, TrainingStats};
use super::trainer::{check_accuracy, VqaTrainer};
use crate::checkpoint::{load_checkpoint, load_weights, save_checkpoint};
use crate::config::{ModelType, OptimizerKind, TrainConfig};
use crate::data::{DataLoader, VqaDataLoader, VqaDataset};
use crate::model::{AnswerModel, MacNetwork, ModuleNet};
use crate::vocab::Vocab;

/// Everything a training run needs besides the model and optimizer.
struct RunContext<B: AutodiffBackend> {
    config: TrainConfig,
    train: VqaDataset,
    val: VqaDataset,
    device: B::Device,
}

/// Train the configured model; returns the final statistics.
pub fn run_training<B: AutodiffBackend>(config: TrainConfig, device: &B::Device) -> Result<TrainingStats> {
    config.validate()?;
    info!("Training configuration: {}", config);
    B::seed(device, config.training.seed);

    let vocab = Vocab::load(&config.data.vocab_json)?;
    let train = VqaDataset::load(&config.data.train_question_h5, &config.data.train_features_h5)?;
    let val = VqaDataset::load(&config.data.val_question_h5, &config.data.val_features_h5)?;
    ensure!(!train.is_empty(), "training set is empty");
    check_feature_dim(&config, &train)?;
    check_feature_dim(&config, &val)?;
    train.check_vocab(&vocab)?;
    val.check_vocab(&vocab)?;

    let ctx = RunContext::<B> {
        config,
        train,
        val,
        device: device.clone(),
    };

    match ctx.config.model.model_type {
        ModelType::SimpleNmn => {
            ensure!(
                ctx.train.has_programs() && ctx.val.has_programs(),
                "SimpleNMN needs programs in both question files"
            );
            let model = ModuleNet::<B>::new(&ctx.config.model, &vocab, device)?;
            with_optimizer(model, ctx)
        }
        ModelType::Mac => {
            let model = MacNetwork::<B>::new(
                &ctx.config.model,
                vocab.num_question_tokens(),
                vocab.num_answers(),
                device,
            );
            with_optimizer(model, ctx)
        }
    }
}

fn check_feature_dim(config: &TrainConfig, dataset: &VqaDataset) -> Result<()> {
    let found = dataset.features.image_dim();
    if found != config.model.feature_dim {
        bail!(
            "feature_dim is {:?} but the feature file holds {:?}",
            config.model.feature_dim,
            found
        );
    }
    Ok(())
}

fn with_optimizer<B, M>(model: M, ctx: RunContext<B>) -> Result<TrainingStats>
where
    B: AutodiffBackend,
    M: AnswerModel<B> + AutodiffModule<B>,
    M::InnerModule: AnswerModel<B::InnerBackend>,
{
    let training = &ctx.config.training;
    let weight_decay =
        (training.weight_decay > 0.0).then(|| WeightDecayConfig::new(training.weight_decay as f32));
    match training.optimizer {
        OptimizerKind::Adam => {
            let optimizer = AdamConfig::new().with_weight_decay(weight_decay).init::<B, M>();
            fit(model, optimizer, ctx)
        }
        OptimizerKind::Sgd => {
            let optimizer = SgdConfig::new().with_weight_decay(weight_decay).init::<B, M>();
            fit(model, optimizer, ctx)
        }
    }
}

fn fit<B, M, O>(model: M, optimizer: O, ctx: RunContext<B>) -> Result<TrainingStats>
where
    B: AutodiffBackend,
    M: AnswerModel<B> + AutodiffModule<B>,
    M::InnerModule: AnswerModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let RunContext {
        config,
        train,
        val,
        device,
    } = ctx;
    let data = &config.data;
    let training = &config.training;
    let checkpoint_path = training.checkpoint_path.as_path();

    let (model, mut stats, start) = resume(model, &config, &device)?;
    info!(
        "Model has {} parameters; starting at iteration {}",
        model.num_params(),
        start
    );

    let shuffle = data.shuffle_train_data.then_some(data.loader_seed);
    let mut train_loader = VqaDataLoader::<B>::new(train.clone(), training.batch_size, None, shuffle, device.clone());
    let mut train_eval_loader = VqaDataLoader::<B::InnerBackend>::new(
        train,
        training.batch_size,
        data.num_train_samples,
        None,
        device.clone(),
    );
    let mut val_loader =
        VqaDataLoader::<B::InnerBackend>::new(val, training.batch_size, data.num_val_samples, None, device.clone());

    let mut trainer = VqaTrainer::new(model, optimizer, training.learning_rate, &device);
    let mut window = LossWindow::default();
    let mut t = start;

    while t < training.num_iterations {
        let batch = match train_loader.next_batch()? {
            Some(batch) => batch,
            None => {
                stats.epoch += 1;
                info!("Starting epoch {}", stats.epoch + 1);
                train_loader.reset();
                continue;
            }
        };

        let output = trainer.train_step(&batch)?;
        t += 1;
        window.push(output.loss);

        if t % training.record_loss_every == 0 {
            if let Some(mean) = window.take_mean() {
                stats.record_loss(t, mean);
            }
        }
        if t % training.print_verbose_every == 0 {
            info!(
                "Iteration {}/{}: loss = {:.6}",
                t, training.num_iterations, output.loss
            );
        }

        if t % training.checkpoint_every == 0 || t == training.num_iterations {
            let valid = trainer.model().valid();
            let train_acc = check_accuracy(&valid, &mut train_eval_loader)?;
            let val_acc = check_accuracy(&valid, &mut val_loader)?;
            let improved = stats.record_accuracy(t, train_acc, val_acc);
            info!(
                "Iteration {}: train accuracy {:.4}, val accuracy {:.4}{}",
                t,
                train_acc,
                val_acc,
                if improved { " (best)" } else { "" }
            );
            save_checkpoint(trainer.model(), improved, t, &config, &stats, checkpoint_path)?;
        }
    }

    info!(
        "Training completed: best val accuracy {:.4} at iteration {}",
        stats.best_val_acc, stats.best_model_t
    );
    Ok(stats)
}

fn resume<B: Backend, M: Module<B>>(
    model: M,
    config: &TrainConfig,
    device: &B::Device,
) -> Result<(M, TrainingStats, usize)> {
    let path = config.training.checkpoint_path.as_path();
    if !config.training.allow_resume || !path.exists() {
        return Ok((model, TrainingStats::default(), 0));
    }

    let checkpoint = load_checkpoint(path)?;
    if checkpoint.config.model.model_type != config.model.model_type {
        warn!(
            "Not resuming from {:?}: it holds a {} model",
            path, checkpoint.config.model.model_type
        );
        return Ok((model, TrainingStats::default(), 0));
    }
    let model = load_weights(model, path, &checkpoint.latest_model_file, device)
        .with_context(|| format!("Failed to resume from {:?}", path))?;
    info!("Resuming from iteration {}", checkpoint.iteration);
    Ok((model, checkpoint.stats, checkpoint.iteration))
}

/// Accuracy of a checkpoint's best weights on one split.
pub fn run_evaluation<B: Backend>(
    checkpoint_path: &Path,
    question_path: &Path,
    feature_path: &Path,
    num_samples: Option<usize>,
    device: &B::Device,
) -> Result<f64> {
    let checkpoint = load_checkpoint(checkpoint_path)?;
    let config = &checkpoint.config;
    let vocab = Vocab::load(&config.data.vocab_json)?;
    let dataset = VqaDataset::load(question_path, feature_path)?;
    check_feature_dim(config, &dataset)?;
    dataset.check_vocab(&vocab)?;
    let weights = checkpoint.best_or_latest();
    let mut loader = VqaDataLoader::<B>::new(
        dataset,
        config.training.batch_size,
        num_samples,
        None,
        device.clone(),
    );

    let accuracy = match config.model.model_type {
        ModelType::SimpleNmn => {
            let model = ModuleNet::<B>::new(&config.model, &vocab, device)?;
            let model = load_weights(model, checkpoint_path, weights, device)?;
            check_accuracy(&model, &mut loader)?
        }
        ModelType::Mac => {
            let model = MacNetwork::<B>::new(
                &config.model,
                vocab.num_question_tokens(),
                vocab.num_answers(),
                device,
            );
            let model = load_weights(model, checkpoint_path, weights, device)?;
            check_accuracy(&model, &mut loader)?
        }
    };
    info!(
        "Accuracy of {:?} ({}) on {} questions: {:.4}",
        checkpoint_path,
        weights,
        loader.num_samples(),
        accuracy
    );
    Ok(accuracy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, ModelConfig, StemConfig};
    use crate::data::{tiny_dataset, QuestionStore};
    use crate::datasets::{features_file, questions_file, write_split, VOCAB_FILE};
    use crate::vocab::tests::flat_vocab;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Writes the tiny dataset as both splits and returns a config that trains on it.
    fn small_run(dir: &Path) -> TrainConfig {
        let dataset = tiny_dataset();
        for part in ["train", "val"] {
            write_split(dir, part, &dataset.features, &dataset.questions).unwrap();
        }
        flat_vocab().save(&dir.join(VOCAB_FILE)).unwrap();

        let mut config = TrainConfig::default();
        config.model = ModelConfig {
            feature_dim: [3, 4, 4],
            module_dim: 4,
            stem: StemConfig {
                num_layers: 1,
                ..Default::default()
            },
            classifier: ClassifierConfig {
                proj_dim: 4,
                fc_dims: vec![8],
                ..Default::default()
            },
            ..Default::default()
        };
        config.data.train_question_h5 = questions_file(dir, "train");
        config.data.train_features_h5 = features_file(dir, "train");
        config.data.val_question_h5 = questions_file(dir, "val");
        config.data.val_features_h5 = features_file(dir, "val");
        config.data.vocab_json = dir.join(VOCAB_FILE);
        config.data.shuffle_train_data = false;
        config.training.num_iterations = 5;
        config.training.batch_size = 2;
        config.training.checkpoint_every = 2;
        config.training.print_verbose_every = 1;
        config.training.checkpoint_path = dir.join("checkpoints").join("model.json");
        config
    }

    #[test]
    fn test_train_resume_and_evaluate() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let mut config = small_run(dir.path());

        // three batches per epoch, so iteration 4 starts the second pass
        let stats = run_training::<TestBackend>(config.clone(), &device).unwrap();
        assert_eq!(stats.val_accs_ts, vec![2, 4, 5]);
        assert_eq!(stats.train_losses.len(), 5);
        assert_eq!(stats.epoch, 1);
        assert!(stats.train_losses.iter().all(|l| l.is_finite()));

        let checkpoint_path = config.training.checkpoint_path.clone();
        let checkpoint = load_checkpoint(&checkpoint_path).unwrap();
        assert_eq!(checkpoint.iteration, 5);
        assert_eq!(checkpoint.latest_model_file, "model_latest");
        assert_eq!(checkpoint.best_model_file.as_deref(), Some("model_best"));

        config.training.num_iterations = 7;
        let stats = run_training::<TestBackend>(config.clone(), &device).unwrap();
        assert_eq!(stats.val_accs_ts, vec![2, 4, 5, 6, 7]);
        assert_eq!(stats.train_losses_ts, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(load_checkpoint(&checkpoint_path).unwrap().iteration, 7);

        let acc = run_evaluation::<NdArray<f32>>(
            &checkpoint_path,
            &config.data.val_question_h5,
            &config.data.val_features_h5,
            None,
            &device,
        )
        .unwrap();
        assert!((0.0..=1.0).contains(&acc));
        assert!(((acc * 5.0).round() - acc * 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_resume_disabled_starts_over() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let mut config = small_run(dir.path());
        config.training.num_iterations = 2;
        run_training::<TestBackend>(config.clone(), &device).unwrap();

        config.training.allow_resume = false;
        let stats = run_training::<TestBackend>(config, &device).unwrap();
        assert_eq!(stats.val_accs_ts, vec![2]);
        assert_eq!(stats.train_losses.len(), 2);
    }

    #[test]
    fn test_answers_outside_vocab_rejected() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = small_run(dir.path());

        let path = questions_file(dir.path(), "val");
        let mut questions = QuestionStore::load(&path).unwrap();
        questions.answers[0] = 5;
        questions.save(&path).unwrap();

        let err = run_training::<TestBackend>(config.clone(), &device).unwrap_err();
        assert!(format!("{:#}", err).contains("answer value 5"), "{:#}", err);
        assert!(!config.training.checkpoint_path.exists());
    }
}
