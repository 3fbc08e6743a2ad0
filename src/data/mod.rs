mod loader;
mod store;

pub use loader::{DataLoader, VqaBatch, VqaDataLoader, VqaDataset};
pub use store::{FeatureStore, IntMatrix, QuestionStore};

#[cfg(test)]
pub(crate) use loader::tests::tiny_dataset;
