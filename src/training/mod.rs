mod run;
mod stats;
mod trainer;

pub use run::{run_evaluation, run_training};
pub use stats::{LossWindow, TrainingStats};
pub use trainer::{check_accuracy, TrainOutput, VqaTrainer};
