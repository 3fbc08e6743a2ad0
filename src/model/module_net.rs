use burn::module::{Ignored, Module};
use burn::tensor::{backend::Backend, Tensor};
use tracing::debug;

use super::layers::{coord_map, Classifier, ConcatBlock, ResidualBlock, Stem};
use crate::config::ModelConfig;
use crate::error::VrError;
use crate::programs::{FunctionTable, ProgramNode};
use crate::vocab::Vocab;

/// Which learned module a program token runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSlot {
    None,
    Unary(usize),
    Binary(usize),
}

/// Neural module network executing ground-truth programs.
#[derive(Module, Debug)]
pub struct ModuleNet<B: Backend> {
    stem: Stem<B>,
    unary: Vec<ResidualBlock<B>>,
    binary: Vec<ConcatBlock<B>>,
    classifier: Classifier<B>,
    functions: Ignored<FunctionTable>,
    dispatch: Ignored<Vec<ModuleSlot>>,
    #[module(skip)]
    use_coords: bool,
}

impl<B: Backend> ModuleNet<B> {
    pub fn new(config: &ModelConfig, vocab: &Vocab, device: &B::Device) -> Result<Self, VrError> {
        let functions = FunctionTable::from_vocab(vocab)?;
        let [_, h, w] = config.feature_dim;
        let stem = Stem::new(config.stem_input_dim(), config.module_dim, [h, w], &config.stem, device);

        let mut unary = Vec::new();
        let mut binary = Vec::new();
        let mut dispatch = Vec::with_capacity(functions.len());
        for function in 0..functions.len() {
            let slot = if functions.is_special(function) {
                ModuleSlot::None
            } else if function == functions.scene() || functions.arity(function) == 1 {
                unary.push(ResidualBlock::new(
                    config.module_dim,
                    config.module_kernel_size,
                    config.module_residual,
                    config.module_batchnorm,
                    device,
                ));
                ModuleSlot::Unary(unary.len() - 1)
            } else if functions.arity(function) == 2 {
                binary.push(ConcatBlock::new(
                    config.module_dim,
                    config.module_kernel_size,
                    config.module_residual,
                    config.module_batchnorm,
                    device,
                ));
                ModuleSlot::Binary(binary.len() - 1)
            } else {
                ModuleSlot::None
            };
            dispatch.push(slot);
        }
        debug!(
            "Module network: {} unary modules, {} binary modules, stem output {:?}",
            unary.len(),
            binary.len(),
            stem.output_hw()
        );

        let classifier = Classifier::new(
            config.module_dim,
            stem.output_hw(),
            vocab.num_answers(),
            &config.classifier,
            device,
        );

        Ok(Self {
            stem,
            unary,
            binary,
            classifier,
            functions: Ignored(functions),
            dispatch: Ignored(dispatch),
            use_coords: config.use_coords,
        })
    }

    /// `features`: `[batch, C, H, W]`; `programs`: one prefix-encoded program per sample.
    pub fn forward(&self, features: Tensor<B, 4>, programs: &[Vec<i64>]) -> Result<Tensor<B, 2>, VrError> {
        let [batch, _, h, w] = features.dims();
        if programs.len() != batch {
            return Err(VrError::ProgramCountMismatch {
                questions: batch,
                programs: programs.len(),
            });
        }

        let features = if self.use_coords {
            let coords = coord_map(batch, h, w, &features.device());
            Tensor::cat(vec![features, coords], 1)
        } else {
            features
        };
        let feats = self.stem.forward(features);

        // Programs differ per sample, so modules run one sample at a time.
        let mut outputs = Vec::with_capacity(batch);
        for (i, program) in programs.iter().enumerate() {
            let tree = self.functions.parse_prefix(program)?;
            let scene = feats.clone().narrow(0, i, 1);
            outputs.push(self.run_node(&tree, &scene)?);
        }
        let final_outputs = Tensor::cat(outputs, 0);

        Ok(self.classifier.forward(final_outputs))
    }

    fn run_node(&self, node: &ProgramNode, scene: &Tensor<B, 4>) -> Result<Tensor<B, 4>, VrError> {
        let mut inputs = node
            .inputs
            .iter()
            .map(|input| self.run_node(input, scene))
            .collect::<Result<Vec<_>, _>>()?;

        match (self.dispatch.0[node.function], inputs.len()) {
            (ModuleSlot::Unary(idx), 0) if node.function == self.functions.scene() => {
                Ok(self.unary[idx].forward(scene.clone()))
            }
            (ModuleSlot::Unary(idx), 1) => Ok(self.unary[idx].forward(inputs.remove(0))),
            (ModuleSlot::Binary(idx), 2) => {
                let rhs = inputs.remove(1);
                let lhs = inputs.remove(0);
                Ok(self.binary[idx].forward(lhs, rhs))
            }
            _ => Err(VrError::UnsupportedArity {
                token: self.functions.token(node.function).to_string(),
                arity: inputs.len(),
            }),
        }
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, StemConfig};
    use crate::vocab::tests::flat_vocab;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig {
            feature_dim: [3, 8, 8],
            module_dim: 4,
            use_coords: true,
            stem: StemConfig {
                num_layers: 1,
                subsample_layers: vec![0],
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
    fn test_module_slots() {
        let device = Default::default();
        let vocab = flat_vocab();
        let net = ModuleNet::<TestBackend>::new(&small_config(), &vocab, &device).unwrap();

        // scene, blue, red, circle, square are unary; And is binary
        assert_eq!(net.unary.len(), 5);
        assert_eq!(net.binary.len(), 1);
        assert_eq!(net.dispatch.0[0], ModuleSlot::None);
        assert_eq!(net.dispatch.0[4], ModuleSlot::Binary(0));
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let vocab = flat_vocab();
        let net = ModuleNet::<TestBackend>::new(&small_config(), &vocab, &device).unwrap();

        let programs = vec![vec![1, 4, 8, 3, 6, 3, 2], vec![1, 7, 3, 2, 0, 0, 0]];
        let logits = net.forward(Tensor::ones([2, 3, 8, 8], &device), &programs).unwrap();
        assert_eq!(logits.dims(), [2, 2]);
    }

    #[test]
    fn test_program_count_mismatch() {
        let device = Default::default();
        let vocab = flat_vocab();
        let net = ModuleNet::<TestBackend>::new(&small_config(), &vocab, &device).unwrap();

        let result = net.forward(Tensor::ones([2, 3, 8, 8], &device), &[vec![1, 3]]);
        assert!(matches!(result, Err(VrError::ProgramCountMismatch { .. })));
    }
}
