use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::store::{FeatureStore, QuestionStore};
use crate::vocab::Vocab;

/// One minibatch of image/question pairs.
#[derive(Clone, Debug)]
pub struct VqaBatch<B: Backend> {
    /// `[batch, C, H, W]`
    pub features: Tensor<B, 4>,
    /// `[batch, question_len]`
    pub questions: Tensor<B, 2, Int>,
    /// Prefix-encoded programs, empty when the store has none.
    pub programs: Vec<Vec<i64>>,
    /// `[batch]`
    pub answers: Tensor<B, 1, Int>,
}

impl<B: Backend> VqaBatch<B> {
    pub fn len(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait for data loading
pub trait DataLoader<B: Backend> {
    /// Get the next batch of data
    fn next_batch(&mut self) -> Result<Option<VqaBatch<B>>>;

    /// Start a new pass over the data
    fn reset(&mut self);

    /// Get the total number of batches (if known)
    fn num_batches(&self) -> Option<usize>;
}

/// Questions and features held in memory; shared between loaders of one split.
#[derive(Debug, Clone)]
pub struct VqaDataset {
    pub questions: Arc<QuestionStore>,
    pub features: Arc<FeatureStore>,
}

impl VqaDataset {
    pub fn new(questions: QuestionStore, features: FeatureStore) -> Result<Self> {
        questions
            .validate(features.num_images())
            .with_context(|| "Question store does not match feature store")?;
        Ok(Self {
            questions: Arc::new(questions),
            features: Arc::new(features),
        })
    }

    /// Reject questions, programs or answers the vocabulary cannot index.
    pub fn check_vocab(&self, vocab: &Vocab) -> Result<()> {
        self.questions
            .check_vocab(vocab)
            .with_context(|| "Question store does not match the vocabulary")
    }

    pub fn load(question_path: &Path, feature_path: &Path) -> Result<Self> {
        let questions = QuestionStore::load(question_path)?;
        let features = FeatureStore::load(feature_path)?;
        info!(
            "Loaded {} questions from {:?} and {} images {:?} from {:?}",
            questions.len(),
            question_path,
            features.num_images(),
            features.image_dim(),
            feature_path
        );
        Self::new(questions, features)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn has_programs(&self) -> bool {
        self.questions.programs.is_some()
    }
}

/// Batches questions in (optionally shuffled) order, gathering image features by index.
pub struct VqaDataLoader<B: Backend> {
    dataset: VqaDataset,
    batch_size: usize,
    order: Vec<usize>,
    rng: Option<StdRng>,
    current_pos: usize,
    device: B::Device,
}

impl<B: Backend> VqaDataLoader<B> {
    pub fn new(
        dataset: VqaDataset,
        batch_size: usize,
        max_samples: Option<usize>,
        shuffle_seed: Option<u64>,
        device: B::Device,
    ) -> Self {
        let count = max_samples.map_or(dataset.len(), |m| m.min(dataset.len()));
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            order: (0..count).collect(),
            rng: shuffle_seed.map(StdRng::seed_from_u64),
            current_pos: 0,
            device,
        };
        loader.reset();
        loader
    }

    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    fn build_batch(&self, indices: &[usize]) -> VqaBatch<B> {
        let store = &self.dataset.questions;
        let features = &self.dataset.features;
        let [c, h, w] = features.image_dim();
        let n = indices.len();

        let mut feature_values = Vec::with_capacity(n * c * h * w);
        let mut question_values = Vec::with_capacity(n * store.questions.cols);
        let mut answers = Vec::with_capacity(n);
        let mut programs = Vec::new();
        for &i in indices {
            feature_values.extend_from_slice(features.image(store.image_idxs[i] as usize));
            question_values.extend_from_slice(store.questions.row(i));
            answers.push(store.answers[i]);
            if let Some(p) = &store.programs {
                programs.push(p.row(i).to_vec());
            }
        }

        VqaBatch {
            features: Tensor::from_data(TensorData::new(feature_values, [n, c, h, w]), &self.device),
            questions: Tensor::from_data(
                TensorData::new(question_values, [n, store.questions.cols]),
                &self.device,
            ),
            programs,
            answers: Tensor::from_data(TensorData::new(answers, [n]), &self.device),
        }
    }
}

impl<B: Backend> DataLoader<B> for VqaDataLoader<B> {
    fn next_batch(&mut self) -> Result<Option<VqaBatch<B>>> {
        if self.current_pos >= self.order.len() {
            return Ok(None);
        }
        let end = (self.current_pos + self.batch_size).min(self.order.len());
        let batch = self.build_batch(&self.order[self.current_pos..end]);
        self.current_pos = end;
        Ok(Some(batch))
    }

    fn reset(&mut self) {
        self.current_pos = 0;
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.order.len().div_ceil(self.batch_size))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::store::IntMatrix;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Five questions over three 3x4x4 images; image `i` is filled with `i`.
    pub fn tiny_dataset() -> VqaDataset {
        let features = FeatureStore::new(
            [3, 3, 4, 4],
            (0..3).flat_map(|i| std::iter::repeat(i as f32).take(48)).collect(),
        )
        .unwrap();
        let questions = QuestionStore {
            questions: IntMatrix::from_rows(&[vec![3, 4, 5, 6, 8], vec![3, 4, 5, 7, 9], vec![3, 4, 5], vec![3, 4, 5, 6, 9], vec![3]]),
            programs: Some(IntMatrix::from_rows(&[
                vec![1, 4, 8, 3, 6, 3, 2],
                vec![1, 4, 7, 3, 5, 3, 2],
                vec![1, 6, 3, 2],
                vec![1, 4, 7, 3, 6, 3, 2],
                vec![1, 3, 2],
            ])),
            answers: vec![1, 0, 1, 0, 1],
            image_idxs: vec![0, 1, 2, 2, 0],
        };
        VqaDataset::new(questions, features).unwrap()
    }

    #[test]
    fn test_sequential_batches() {
        let device = Default::default();
        let mut loader = VqaDataLoader::<TestBackend>::new(tiny_dataset(), 2, None, None, device);
        assert_eq!(loader.num_batches(), Some(3));

        let first = loader.next_batch().unwrap().unwrap();
        assert_eq!(first.features.dims(), [2, 3, 4, 4]);
        assert_eq!(first.questions.dims(), [2, 5]);
        assert_eq!(first.programs.len(), 2);
        assert_eq!(first.answers.into_data().to_vec::<i64>().unwrap(), vec![1, 0]);

        loader.next_batch().unwrap().unwrap();
        let last = loader.next_batch().unwrap().unwrap();
        assert_eq!(last.len(), 1);
        // question 4 looks at image 0
        let pixels = last.features.into_data().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|&v| v == 0.0));
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_max_samples_and_shuffle() {
        let device = Default::default();
        let mut loader = VqaDataLoader::<TestBackend>::new(tiny_dataset(), 10, Some(4), Some(7), device);
        assert_eq!(loader.num_samples(), 4);

        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 4);
        let mut seen: Vec<Vec<i64>> = batch.programs.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);

        loader.reset();
        assert!(loader.next_batch().unwrap().is_some());
    }
}
