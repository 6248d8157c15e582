use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Unit-gain Kaiming init shared by every convolution in the crate.
pub(crate) fn kaiming() -> Initializer {
    Initializer::KaimingUniform {
        gain: 1.0,
        fan_out_only: false,
    }
}

/// Same-size 3x3 convolution.
pub fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(kaiming())
        .init(device)
}

/// Pointwise convolution.
pub fn conv1x1<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [1, 1])
        .with_stride([1, 1])
        .with_initializer(kaiming())
        .init(device)
}

/// 3x3 convolution that halves an even spatial size.
pub fn downsample<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(kaiming())
        .init(device)
}

/// Transposed convolution that exactly doubles the spatial size.
pub fn upsample<B: Backend>(channels: [usize; 2], device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new(channels, [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_initializer(kaiming())
        .init(device)
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    bn2: BatchNorm<B, 2>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3([channels, channels], device),
            bn1: BatchNormConfig::new(channels).init(device),
            conv2: conv3x3([channels, channels], device),
            bn2: BatchNormConfig::new(channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.conv1.forward(x.clone());
        let h = self.bn1.forward(h);
        let h = activation::silu(h);

        let h = self.conv2.forward(h);
        let h = self.bn2.forward(h);
        activation::silu(h + x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn residual_block_keeps_shape() {
        let device = Default::default();
        let block = ResidualBlock::<TestBackend>::new(8, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 8, 6, 10], &device);
        assert_eq!(block.forward(x).dims(), [1, 8, 6, 10]);
    }

    #[test]
    fn pointwise_conv_keeps_activation_scale() {
        let device = Default::default();
        let conv = conv1x1::<TestBackend>([16, 16], &device);
        let x = Tensor::<TestBackend, 4>::random([4, 16, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let y = conv.forward(x);
        let mean = y.clone().mean().into_scalar();
        let std = (y.sub_scalar(mean).powf_scalar(2.0).mean().into_scalar()).sqrt();
        assert!(std > 0.3 && std < 3.0, "output std {std}");
    }

    #[test]
    fn down_then_up_restores_even_sizes() {
        let device = Default::default();
        let down = downsample::<TestBackend>([4, 4], &device);
        let up = upsample::<TestBackend>([4, 4], &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 4, 12, 8], &device);
        let h = down.forward(x);
        assert_eq!(h.dims(), [2, 4, 6, 4]);
        assert_eq!(up.forward(h).dims(), [2, 4, 12, 8]);
    }
}
