pub mod encoder;
pub mod layers;
pub mod mac;
pub mod module_net;

pub use encoder::{EncodedQuestion, QuestionEncoder};
pub use mac::{MacNetwork, MacState};
pub use module_net::{ModuleNet, ModuleSlot};

use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};

use crate::data::VqaBatch;
use crate::error::VrError;

/// A model that maps a batch of image/question pairs to answer logits.
pub trait AnswerModel<B: Backend>: Module<B> {
    /// `[batch, num_answers]` unnormalized scores.
    fn answer_logits(&self, batch: &VqaBatch<B>) -> Result<Tensor<B, 2>, VrError>;
}

impl<B: Backend> AnswerModel<B> for ModuleNet<B> {
    fn answer_logits(&self, batch: &VqaBatch<B>) -> Result<Tensor<B, 2>, VrError> {
        if batch.programs.is_empty() {
            return Err(VrError::MissingPrograms);
        }
        self.forward(batch.features.clone(), &batch.programs)
    }
}

impl<B: Backend> AnswerModel<B> for MacNetwork<B> {
    fn answer_logits(&self, batch: &VqaBatch<B>) -> Result<Tensor<B, 2>, VrError> {
        Ok(self.forward(batch.features.clone(), batch.questions.clone()))
    }
}
