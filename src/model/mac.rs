use burn::module::{Module, Param};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Bool, Int, Tensor};

use super::encoder::QuestionEncoder;
use super::layers::{coord_map, Stem};
use crate::config::ModelConfig;

/// Memory, Attention and Composition network.
///
/// The image is turned into a knowledge base of `h * w` cells; a control
/// state attends over the question words, a read unit attends over the
/// knowledge base, and a write unit folds the result into the memory.
#[derive(Module, Debug)]
pub struct MacNetwork<B: Backend> {
    stem: Stem<B>,
    stem_dropout: Dropout,
    encoder: QuestionEncoder<B>,
    question_proj: Linear<B>,
    words_proj: Linear<B>,
    step_proj: Vec<Linear<B>>,
    control_input: Linear<B>,
    control_attn: Linear<B>,
    read_memory: Linear<B>,
    read_knowledge: Linear<B>,
    read_concat: Linear<B>,
    read_attn: Linear<B>,
    read_dropout: Dropout,
    memory_dropout: Dropout,
    write: Linear<B>,
    memory_gate: Option<Linear<B>>,
    initial_control: Param<Tensor<B, 2>>,
    initial_memory: Param<Tensor<B, 2>>,
    output_hidden: Vec<Linear<B>>,
    output_dropout: Dropout,
    output: Linear<B>,
    #[module(skip)]
    module_dim: usize,
    #[module(skip)]
    question2output: bool,
    #[module(skip)]
    use_coords: bool,
}

/// Recurrent state carried between reasoning steps.
#[derive(Clone, Debug)]
pub struct MacState<B: Backend> {
    pub control: Tensor<B, 2>,
    pub memory: Tensor<B, 2>,
}

impl<B: Backend> MacNetwork<B> {
    pub fn new(config: &ModelConfig, num_question_tokens: usize, num_answers: usize, device: &B::Device) -> Self {
        let d = config.module_dim;
        let mac = &config.mac;
        let [_, h, w] = config.feature_dim;
        let linear = |i: usize, o: usize| LinearConfig::new(i, o).init(device);

        let stem = Stem::new(config.stem_input_dim(), d, [h, w], &config.stem, device);
        let encoder = QuestionEncoder::new(mac, num_question_tokens, device);
        let enc_dim = mac.encoder_output_dim();

        let mut output_hidden = Vec::with_capacity(config.classifier.fc_dims.len());
        let mut prev = if mac.question2output { 2 * d } else { d };
        for &dim in &config.classifier.fc_dims {
            output_hidden.push(linear(prev, dim));
            prev = dim;
        }

        Self {
            stem,
            stem_dropout: DropoutConfig::new(mac.stem_dropout).init(),
            encoder,
            question_proj: linear(enc_dim, d),
            words_proj: linear(enc_dim, d),
            step_proj: (0..config.num_modules).map(|_| linear(d, d)).collect(),
            control_input: linear(2 * d, d),
            control_attn: linear(d, 1),
            read_memory: linear(d, d),
            read_knowledge: linear(d, d),
            read_concat: linear(2 * d, d),
            read_attn: linear(d, 1),
            read_dropout: DropoutConfig::new(mac.read_dropout).init(),
            memory_dropout: DropoutConfig::new(mac.memory_dropout).init(),
            write: linear(2 * d, d),
            memory_gate: mac.use_memory_gate.then(|| linear(d, 1)),
            initial_control: Param::from_tensor(Tensor::zeros([1, d], device)),
            initial_memory: Param::from_tensor(Tensor::zeros([1, d], device)),
            output_hidden,
            output_dropout: DropoutConfig::new(config.classifier.dropout).init(),
            output: linear(prev, num_answers),
            module_dim: d,
            question2output: mac.question2output,
            use_coords: config.use_coords,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.step_proj.len()
    }

    /// `features`: `[batch, C, H, W]`; `questions`: `[batch, len]` padded token ids.
    pub fn forward(&self, features: Tensor<B, 4>, questions: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let [batch, _, h, w] = features.dims();
        let d = self.module_dim;

        let features = if self.use_coords {
            let coords = coord_map(batch, h, w, &features.device());
            Tensor::cat(vec![features, coords], 1)
        } else {
            features
        };
        let kb = self.stem_dropout.forward(self.stem.forward(features));
        let [_, _, kh, kw] = kb.dims();
        let knowledge = kb.reshape([batch, d, kh * kw]).swap_dims(1, 2);

        let encoded = self.encoder.forward(questions);
        let words = self.words_proj.forward(encoded.words);
        let question = self.question_proj.forward(encoded.question);

        let mut state = MacState {
            control: self.initial_control.val().repeat_dim(0, batch),
            memory: self.initial_memory.val().repeat_dim(0, batch),
        };
        for step in 0..self.num_steps() {
            state = self.step(step, state, &question, &words, &encoded.padding, &knowledge);
        }

        let mut x = if self.question2output {
            Tensor::cat(vec![state.memory, question], 1)
        } else {
            state.memory
        };
        for layer in &self.output_hidden {
            x = self.output_dropout.forward(activation::relu(layer.forward(x)));
        }
        self.output.forward(x)
    }

    fn step(
        &self,
        step: usize,
        state: MacState<B>,
        question: &Tensor<B, 2>,
        words: &Tensor<B, 3>,
        padding: &Tensor<B, 2, Bool>,
        knowledge: &Tensor<B, 3>,
    ) -> MacState<B> {
        let control = self.control(step, &state.control, question, words, padding);
        let read = self.read(&state.memory, &control, knowledge);
        let memory = self.write(&state.memory, &control, read);
        MacState { control, memory }
    }

    fn control(
        &self,
        step: usize,
        prev_control: &Tensor<B, 2>,
        question: &Tensor<B, 2>,
        words: &Tensor<B, 3>,
        padding: &Tensor<B, 2, Bool>,
    ) -> Tensor<B, 2> {
        let [batch, len, d] = words.dims();
        let step_question = self.step_proj[step].forward(question.clone());
        let cq = self
            .control_input
            .forward(Tensor::cat(vec![prev_control.clone(), step_question], 1));

        let interactions = cq.unsqueeze_dim::<3>(1).repeat_dim(1, len) * words.clone();
        let logits = self
            .control_attn
            .forward(interactions)
            .reshape([batch, len])
            .mask_fill(padding.clone(), -1e9);
        let attn = activation::softmax(logits, 1);

        attend(attn, words.clone(), d)
    }

    fn read(&self, memory: &Tensor<B, 2>, control: &Tensor<B, 2>, knowledge: &Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, cells, d] = knowledge.dims();
        let memory = self.memory_dropout.forward(memory.clone());
        let mem_proj = self.read_memory.forward(memory).unsqueeze_dim::<3>(1).repeat_dim(1, cells);
        let kb_proj = self.read_knowledge.forward(knowledge.clone());

        let interactions = self
            .read_concat
            .forward(Tensor::cat(vec![mem_proj * kb_proj, knowledge.clone()], 2));
        let interactions = interactions * control.clone().unsqueeze_dim::<3>(1).repeat_dim(1, cells);
        let interactions = self.read_dropout.forward(interactions);
        let logits = self.read_attn.forward(interactions).reshape([batch, cells]);
        let attn = activation::softmax(logits, 1);

        attend(attn, knowledge.clone(), d)
    }

    fn write(&self, memory: &Tensor<B, 2>, control: &Tensor<B, 2>, read: Tensor<B, 2>) -> Tensor<B, 2> {
        let new_memory = self.write.forward(Tensor::cat(vec![read, memory.clone()], 1));
        match &self.memory_gate {
            Some(gate) => {
                let gate = activation::sigmoid(gate.forward(control.clone())).repeat_dim(1, self.module_dim);
                gate.clone() * memory.clone() + gate.neg().add_scalar(1.0) * new_memory
            }
            None => new_memory,
        }
    }
}

/// Weighted sum of `values` (`[batch, n, d]`) under `attn` (`[batch, n]`).
fn attend<B: Backend>(attn: Tensor<B, 2>, values: Tensor<B, 3>, d: usize) -> Tensor<B, 2> {
    let [batch, _] = attn.dims();
    (attn.unsqueeze_dim::<3>(2).repeat_dim(2, d) * values)
        .sum_dim(1)
        .reshape([batch, d])
}
