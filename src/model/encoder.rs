use burn::module::Module;
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, Lstm, LstmConfig};
use burn::tensor::{backend::Backend, Bool, Int, Tensor};

use crate::config::{EncoderType, MacConfig};

/// Contextual word states and a whole-question vector.
#[derive(Clone, Debug)]
pub struct EncodedQuestion<B: Backend> {
    /// `[batch, len, encoder_dim]`
    pub words: Tensor<B, 3>,
    /// `[batch, encoder_dim]`
    pub question: Tensor<B, 2>,
    /// `true` at padding positions, `[batch, len]`
    pub padding: Tensor<B, 2, Bool>,
}

/// Word embedding followed by a stacked recurrent encoder.
///
/// The backward direction of a bidirectional encoder reads each question
/// from its last real token, so padding never reaches the question vector.
#[derive(Module, Debug)]
pub struct QuestionEncoder<B: Backend> {
    embedding: Embedding<B>,
    embedding_dropout: Dropout,
    lstm: Vec<Lstm<B>>,
    lstm_backward: Vec<Lstm<B>>,
    gru: Vec<Gru<B>>,
    layer_dropout: Dropout,
    #[module(skip)]
    hidden_dim: usize,
    #[module(skip)]
    bidirectional: bool,
}

impl<B: Backend> QuestionEncoder<B> {
    pub fn new(config: &MacConfig, num_tokens: usize, device: &B::Device) -> Self {
        let embedding = EmbeddingConfig::new(num_tokens.max(1), config.rnn_wordvec_dim).init(device);
        let hidden = config.rnn_hidden_dim;

        let mut lstm = Vec::new();
        let mut lstm_backward = Vec::new();
        let mut gru = Vec::new();
        let mut input_dim = config.rnn_wordvec_dim;
        for _ in 0..config.rnn_num_layers {
            match config.encoder_type {
                EncoderType::Lstm => {
                    lstm.push(LstmConfig::new(input_dim, hidden, true).init(device));
                    if config.bidirectional {
                        lstm_backward.push(LstmConfig::new(input_dim, hidden, true).init(device));
                    }
                }
                EncoderType::Gru => {
                    gru.push(GruConfig::new(input_dim, hidden, true).init(device));
                }
            }
            input_dim = config.encoder_output_dim();
        }

        Self {
            embedding,
            embedding_dropout: DropoutConfig::new(config.question_embedding_dropout).init(),
            lstm,
            lstm_backward,
            gru,
            layer_dropout: DropoutConfig::new(config.rnn_dropout).init(),
            hidden_dim: hidden,
            bidirectional: config.bidirectional,
        }
    }

    /// `questions`: `[batch, len]` token ids, right-padded with `<NULL>` (0).
    pub fn forward(&self, questions: Tensor<B, 2, Int>) -> EncodedQuestion<B> {
        let [batch, len] = questions.dims();
        let device = questions.device();
        let padding = questions.clone().equal_elem(0);
        let lengths = padding.clone().bool_not().int().sum_dim(1);

        let reversed = self.bidirectional.then(|| reverse_index::<B>(lengths.clone(), len, &device));

        let mut x = self.embedding_dropout.forward(self.embedding.forward(questions));
        let num_layers = self.lstm.len() + self.gru.len();
        for layer in 0..num_layers {
            if layer > 0 {
                x = self.layer_dropout.forward(x);
            }
            x = match (self.lstm.get(layer), self.lstm_backward.get(layer), &reversed) {
                (Some(lstm), Some(backward), Some(index)) => {
                    let forward_states = lstm.forward(x.clone(), None).0;
                    let backward_states = reverse(backward.forward(reverse(x, index), None).0, index);
                    Tensor::cat(vec![forward_states, backward_states], 2)
                }
                (Some(lstm), _, _) => lstm.forward(x, None).0,
                _ => self.gru[layer].forward(x, None),
            };
        }

        // index of the last real token of every question
        let h = self.hidden_dim;
        let last = lengths
            .sub_scalar(1)
            .clamp_min(0)
            .reshape([batch, 1, 1])
            .repeat_dim(2, h);

        let forward_final = x.clone().narrow(2, 0, h).gather(1, last).reshape([batch, h]);
        let question = if self.bidirectional {
            let backward_final = x.clone().narrow(2, h, h).narrow(1, 0, 1).reshape([batch, h]);
            Tensor::cat(vec![forward_final, backward_final], 1)
        } else {
            forward_final
        };

        EncodedQuestion {
            words: x,
            question,
            padding,
        }
    }
}

/// Position map that reverses the first `lengths[b]` steps of each row and
/// leaves padding in place, `[batch, len]`.
fn reverse_index<B: Backend>(lengths: Tensor<B, 2, Int>, len: usize, device: &B::Device) -> Tensor<B, 2, Int> {
    let [batch, _] = lengths.dims();
    let positions = Tensor::<B, 1, Int>::arange(0..len as i64, device)
        .reshape([1, len])
        .repeat_dim(0, batch);
    let lengths = lengths.repeat_dim(1, len);
    let in_padding = positions.clone().greater_equal(lengths.clone());
    lengths
        .sub(positions.clone())
        .sub_scalar(1)
        .mask_where(in_padding, positions)
}

/// Permute the time axis of `x` (`[batch, len, dim]`) by `index`.
fn reverse<B: Backend>(x: Tensor<B, 3>, index: &Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let [batch, len, dim] = x.dims();
    let index = index.clone().reshape([batch, len, 1]).repeat_dim(2, dim);
    x.gather(1, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn questions(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 2, Int> {
        Tensor::from_data(TensorData::new(vec![3i64, 4, 5, 0, 6, 7, 0, 0], [2, 4]), device)
    }

    #[test]
    fn test_bidirectional_lstm_dims() {
        let device = Default::default();
        let config = MacConfig {
            rnn_wordvec_dim: 6,
            rnn_hidden_dim: 5,
            rnn_num_layers: 2,
            ..Default::default()
        };
        let encoder = QuestionEncoder::<TestBackend>::new(&config, 10, &device);
        let encoded = encoder.forward(questions(&device));

        assert_eq!(encoded.words.dims(), [2, 4, 10]);
        assert_eq!(encoded.question.dims(), [2, 10]);
        let padding = encoded.padding.into_data().to_vec::<bool>().unwrap();
        assert_eq!(padding, vec![false, false, false, true, false, false, true, true]);
    }

    #[test]
    fn test_gru_dims() {
        let device = Default::default();
        let config = MacConfig {
            encoder_type: EncoderType::Gru,
            bidirectional: false,
            rnn_wordvec_dim: 6,
            rnn_hidden_dim: 5,
            ..Default::default()
        };
        let encoder = QuestionEncoder::<TestBackend>::new(&config, 10, &device);
        let encoded = encoder.forward(questions(&device));

        assert_eq!(encoded.words.dims(), [2, 4, 5]);
        assert_eq!(encoded.question.dims(), [2, 5]);
    }

    #[test]
    fn test_reverse_index_keeps_padding_in_place() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 2, Int>::from_data(TensorData::new(vec![3i64, 1, 0], [3, 1]), &device);
        let index = reverse_index::<TestBackend>(lengths, 4, &device);
        let index = index.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(index, vec![2, 1, 0, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_question_vector_ignores_padding_width() {
        let device = Default::default();
        let config = MacConfig {
            rnn_wordvec_dim: 6,
            rnn_hidden_dim: 5,
            rnn_num_layers: 2,
            ..Default::default()
        };
        assert!(config.bidirectional);
        let encoder = QuestionEncoder::<TestBackend>::new(&config, 10, &device);

        let short = Tensor::from_data(TensorData::new(vec![3i64, 4, 5], [1, 3]), &device);
        let padded = Tensor::from_data(TensorData::new(vec![3i64, 4, 5, 0, 0, 0], [1, 6]), &device);
        let short = encoder.forward(short).question.into_data().to_vec::<f32>().unwrap();
        let padded = encoder.forward(padded).question.into_data().to_vec::<f32>().unwrap();

        assert_eq!(short.len(), 10);
        for (a, b) in short.iter().zip(&padded) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }
}
