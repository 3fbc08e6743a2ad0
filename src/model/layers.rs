use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
};
use burn::tensor::{activation, backend::Backend, Tensor, TensorData};

use crate::config::{ClassifierConfig, Downsample, StemConfig};

fn conv2d<B: Backend>(
    in_dim: usize,
    out_dim: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_dim, out_dim], [kernel_size, kernel_size])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}

/// Convolution followed by optional batchnorm and a ReLU.
#[derive(Module, Debug)]
pub struct ConvLayer<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B>>,
}

impl<B: Backend> ConvLayer<B> {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        with_batchnorm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: conv2d(in_dim, out_dim, kernel_size, stride, padding, device),
            norm: with_batchnorm.then(|| BatchNormConfig::new(out_dim).init(device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        activation::relu(x)
    }
}

/// Convolutional stem shared by every module network.
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    layers: Vec<ConvLayer<B>>,
    pool: MaxPool2d,
    #[module(skip)]
    subsample: Vec<bool>,
    #[module(skip)]
    output_hw: [usize; 2],
}

impl<B: Backend> Stem<B> {
    pub fn new(
        in_dim: usize,
        module_dim: usize,
        input_hw: [usize; 2],
        config: &StemConfig,
        device: &B::Device,
    ) -> Self {
        let padding = config.padding();
        let mut layers = Vec::with_capacity(config.num_layers);
        let mut subsample = Vec::with_capacity(config.num_layers);
        let [mut h, mut w] = input_hw;
        let mut dim = in_dim;
        for i in 0..config.num_layers {
            layers.push(ConvLayer::new(
                dim,
                module_dim,
                config.kernel_size,
                config.stride,
                padding,
                config.batchnorm,
                device,
            ));
            dim = module_dim;
            h = conv_output_size(h, config.kernel_size, config.stride, padding);
            w = conv_output_size(w, config.kernel_size, config.stride, padding);
            let pool_here = config.subsample_layers.contains(&i);
            if pool_here {
                h /= 2;
                w /= 2;
            }
            subsample.push(pool_here);
        }
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Self {
            layers,
            pool,
            subsample,
            output_hw: [h, w],
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for (layer, &pool_here) in self.layers.iter().zip(self.subsample.iter()) {
            x = layer.forward(x);
            if pool_here {
                x = self.pool.forward(x);
            }
        }
        x
    }

    /// Spatial size of the stem output.
    pub fn output_hw(&self) -> [usize; 2] {
        self.output_hw
    }
}

pub fn conv_output_size(size: usize, kernel_size: usize, stride: usize, padding: usize) -> usize {
    (size + 2 * padding).saturating_sub(kernel_size) / stride + 1
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: Option<BatchNorm<B>>,
    conv2: Conv2d<B>,
    norm2: Option<BatchNorm<B>>,
    #[module(skip)]
    with_residual: bool,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        dim: usize,
        kernel_size: usize,
        with_residual: bool,
        with_batchnorm: bool,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let norm = || with_batchnorm.then(|| BatchNormConfig::new(dim).init(device));
        Self {
            conv1: conv2d(dim, dim, kernel_size, 1, padding, device),
            norm1: norm(),
            conv2: conv2d(dim, dim, kernel_size, 1, padding, device),
            norm2: norm(),
            with_residual,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = self.conv1.forward(x.clone());
        if let Some(norm) = &self.norm1 {
            out = norm.forward(out);
        }
        out = self.conv2.forward(activation::relu(out));
        if let Some(norm) = &self.norm2 {
            out = norm.forward(out);
        }
        if self.with_residual {
            out = out + x;
        }
        activation::relu(out)
    }
}

/// Fuses two module outputs: channel concat, 1x1 projection, then a residual block.
#[derive(Module, Debug)]
pub struct ConcatBlock<B: Backend> {
    proj: Conv2d<B>,
    block: ResidualBlock<B>,
}

impl<B: Backend> ConcatBlock<B> {
    pub fn new(
        dim: usize,
        kernel_size: usize,
        with_residual: bool,
        with_batchnorm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            proj: conv2d(2 * dim, dim, 1, 1, 0, device),
            block: ResidualBlock::new(dim, kernel_size, with_residual, with_batchnorm, device),
        }
    }

    pub fn forward(&self, lhs: Tensor<B, 4>, rhs: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = Tensor::cat(vec![lhs, rhs], 1);
        let x = activation::relu(self.proj.forward(x));
        self.block.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct FcLayer<B: Backend> {
    linear: Linear<B>,
    norm: Option<BatchNorm<B>>,
    dropout: Dropout,
}

impl<B: Backend> FcLayer<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = match &self.norm {
            Some(norm) => {
                // batchnorm expects a trailing spatial dim
                let [n, d] = x.dims();
                norm.forward(x.reshape([n, d, 1])).reshape([n, d])
            }
            None => x,
        };
        self.dropout.forward(activation::relu(x))
    }
}

/// Answer classifier over a `[batch, channels, h, w]` feature map.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    proj: Option<ConvLayer<B>>,
    max_pool: Option<MaxPool2d>,
    avg_pool: Option<AdaptiveAvgPool2d>,
    hidden: Vec<FcLayer<B>>,
    output: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    pub fn new(
        module_dim: usize,
        input_hw: [usize; 2],
        num_answers: usize,
        config: &ClassifierConfig,
        device: &B::Device,
    ) -> Self {
        let (proj, mut channels) = if config.proj_dim > 0 {
            (
                Some(ConvLayer::new(module_dim, config.proj_dim, 1, 1, 0, config.batchnorm, device)),
                config.proj_dim,
            )
        } else {
            (None, module_dim)
        };

        let [h, w] = input_hw;
        let (max_pool, avg_pool, [h, w]) = match config.downsample {
            Downsample::Maxpool2 => (
                Some(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
                None,
                [h / 2, w / 2],
            ),
            Downsample::Maxpoolfull => (
                Some(MaxPool2dConfig::new([h, w]).with_strides([h, w]).init()),
                None,
                [1, 1],
            ),
            Downsample::Avgpoolfull => (None, Some(AdaptiveAvgPool2dConfig::new([1, 1]).init()), [1, 1]),
            Downsample::None => (None, None, [h, w]),
        };
        channels *= h.max(1) * w.max(1);

        let mut hidden = Vec::with_capacity(config.fc_dims.len());
        let mut prev = channels;
        for &dim in &config.fc_dims {
            hidden.push(FcLayer {
                linear: LinearConfig::new(prev, dim).init(device),
                norm: config.batchnorm.then(|| BatchNormConfig::new(dim).init(device)),
                dropout: DropoutConfig::new(config.dropout).init(),
            });
            prev = dim;
        }
        let output = LinearConfig::new(prev, num_answers).init(device);

        Self {
            proj,
            max_pool,
            avg_pool,
            hidden,
            output,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = match &self.proj {
            Some(proj) => proj.forward(x),
            None => x,
        };
        if let Some(pool) = &self.max_pool {
            x = pool.forward(x);
        }
        if let Some(pool) = &self.avg_pool {
            x = pool.forward(x);
        }
        let [n, c, h, w] = x.dims();
        let mut x = x.reshape([n, c * h * w]);
        for layer in &self.hidden {
            x = layer.forward(x);
        }
        self.output.forward(x)
    }
}

/// Two channels holding the x and y position of every cell, scaled to [-1, 1].
pub fn coord_map<B: Backend>(batch: usize, h: usize, w: usize, device: &B::Device) -> Tensor<B, 4> {
    let scale = |i: usize, n: usize| {
        if n <= 1 {
            0.0
        } else {
            2.0 * i as f32 / (n - 1) as f32 - 1.0
        }
    };
    let mut values = Vec::with_capacity(2 * h * w);
    for _y in 0..h {
        for x in 0..w {
            values.push(scale(x, w));
        }
    }
    for y in 0..h {
        for _x in 0..w {
            values.push(scale(y, h));
        }
    }
    Tensor::<B, 4>::from_data(TensorData::new(values, [1, 2, h, w]), device).repeat_dim(0, batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_stem_output_size() {
        let device = Default::default();
        let config = StemConfig {
            num_layers: 3,
            subsample_layers: vec![0, 2],
            ..Default::default()
        };
        let stem = Stem::<TestBackend>::new(3, 8, [30, 30], &config, &device);
        assert_eq!(stem.output_hw(), [7, 7]);

        let out = stem.forward(Tensor::zeros([2, 3, 30, 30], &device));
        assert_eq!(out.dims(), [2, 8, 7, 7]);
    }

    #[test]
    fn test_blocks_keep_shape() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 5, 5], &device);

        let residual = ResidualBlock::new(4, 3, true, true, &device);
        assert_eq!(residual.forward(x.clone()).dims(), [1, 4, 5, 5]);

        let concat = ConcatBlock::new(4, 3, false, false, &device);
        assert_eq!(concat.forward(x.clone(), x).dims(), [1, 4, 5, 5]);
    }

    #[test]
    fn test_classifier_downsampling() {
        let device = Default::default();
        for downsample in [Downsample::Maxpool2, Downsample::Maxpoolfull, Downsample::Avgpoolfull, Downsample::None] {
            let config = ClassifierConfig {
                proj_dim: 6,
                downsample,
                fc_dims: vec![10],
                batchnorm: true,
                dropout: 0.0,
            };
            let classifier = Classifier::<TestBackend>::new(4, [6, 6], 3, &config, &device);
            let logits = classifier.forward(Tensor::ones([2, 4, 6, 6], &device));
            assert_eq!(logits.dims(), [2, 3], "{:?}", downsample);
        }
    }

    #[test]
    fn test_coord_map_corners() {
        let device = Default::default();
        let coords = coord_map::<TestBackend>(1, 3, 2, &device);
        let values = coords.into_data().to_vec::<f32>().unwrap();
        // x channel, first row
        assert_eq!(&values[0..2], &[-1.0, 1.0]);
        // y channel, first and last row
        assert_eq!(values[6], -1.0);
        assert_eq!(values[11], 1.0);
    }
}
