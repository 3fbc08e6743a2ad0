use anyhow::Result;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLoss;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{backend::{AutodiffBackend, Backend}, ElementConversion};

use crate::data::{DataLoader, VqaBatch};
use crate::model::AnswerModel;

#[derive(Clone, Debug)]
pub struct TrainOutput {
    pub loss: f32,
    pub batch_size: usize,
}

impl TrainOutput {
    pub fn new(loss: f32, batch_size: usize) -> Self {
        Self { loss, batch_size }
    }
}

/// Owns a model and its optimizer and performs single optimization steps.
pub struct VqaTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AnswerModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    model: M,
    optimizer: O,
    loss_fn: CrossEntropyLoss<B>,
    learning_rate: f64,
}

impl<B, M, O> VqaTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AnswerModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    pub fn new(model: M, optimizer: O, learning_rate: f64, device: &B::Device) -> Self {
        let loss_fn = CrossEntropyLoss::new(None, device);

        Self {
            model,
            optimizer,
            loss_fn,
            learning_rate,
        }
    }

    pub fn train_step(&mut self, batch: &VqaBatch<B>) -> Result<TrainOutput> {
        let logits = self.model.answer_logits(batch)?;
        let loss = self.loss_fn.forward(logits, batch.answers.clone());

        // Backward pass
        let grads = GradientsParams::from_grads(loss.backward(), &self.model);

        // Optimizer step
        self.model = self.optimizer.step(self.learning_rate, self.model.clone(), grads);

        Ok(TrainOutput::new(loss.into_scalar().elem::<f32>(), batch.len()))
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }
}

/// Fraction of questions in one pass of `loader` that `model` answers correctly.
pub fn check_accuracy<B, M, L>(model: &M, loader: &mut L) -> Result<f64>
where
    B: Backend,
    M: AnswerModel<B>,
    L: DataLoader<B>,
{
    loader.reset();
    let mut correct = 0i64;
    let mut total = 0usize;
    while let Some(batch) = loader.next_batch()? {
        let n = batch.len();
        let predictions = model.answer_logits(&batch)?.argmax(1).reshape([n]);
        correct += predictions
            .equal(batch.answers)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        total += n;
    }
    loader.reset();
    Ok(if total == 0 { 0.0 } else { correct as f64 / total as f64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, ModelConfig, StemConfig};
    use crate::data::{tiny_dataset, VqaDataLoader};
    use crate::model::ModuleNet;
    use crate::vocab::tests::flat_vocab;
    use burn::backend::Autodiff;
    use burn::optim::AdamConfig;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> ModelConfig {
        ModelConfig {
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
        }
    }

    #[test]
    fn test_train_step_gives_finite_loss() {
        let device = Default::default();
        let model = ModuleNet::<TestBackend>::new(&small_config(), &flat_vocab(), &device).unwrap();
        let optimizer = AdamConfig::new().init::<TestBackend, ModuleNet<TestBackend>>();
        let mut trainer = VqaTrainer::new(model, optimizer, 1e-3, &device);

        let mut loader = VqaDataLoader::<TestBackend>::new(tiny_dataset(), 5, None, None, device);
        let batch = loader.next_batch().unwrap().unwrap();
        let output = trainer.train_step(&batch).unwrap();
        assert!(output.loss.is_finite());
        assert_eq!(output.batch_size, 5);
    }

    #[test]
    fn test_accuracy_is_a_fraction() {
        let device = Default::default();
        let model = ModuleNet::<NdArray<f32>>::new(&small_config(), &flat_vocab(), &device).unwrap();
        let mut loader = VqaDataLoader::<NdArray<f32>>::new(tiny_dataset(), 2, None, None, device);

        let acc = check_accuracy(&model, &mut loader).unwrap();
        assert!((0.0..=1.0).contains(&acc));
        // accuracy over 5 questions is a multiple of 0.2
        assert!(((acc * 5.0).round() - acc * 5.0).abs() < 1e-9);
    }
}
