//! Autoregressive mixture noise model. Tensors are moved into a frame where
//! the causal axis is last; vertical models transpose on the way in and out.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::blocks::{conv1x1, kaiming};
use crate::config::{NoiseModelConfig, NoiseOrientation};
use crate::distributions::{gaussian_log_prob, log_sum_exp};
use crate::error::{Error, Result};
use crate::sampling::{tensor_to_vec, SampleStreams};

const ROW_AXIS: usize = 2;
const COLUMN_AXIS: usize = 3;

/// Per-pixel mixture parameters, each `[batch, n_gaussians, height, width]`.
#[derive(Debug, Clone)]
pub struct MixtureParams<B: Backend> {
    /// Log mixture weights; `exp` sums to one over the component axis.
    pub log_weights: Tensor<B, 4>,
    pub means: Tensor<B, 4>,
    /// Strictly positive component scales.
    pub scales: Tensor<B, 4>,
}

impl<B: Backend> MixtureParams<B> {
    fn swap_axes(self) -> Self {
        Self {
            log_weights: self.log_weights.swap_dims(ROW_AXIS, COLUMN_AXIS),
            means: self.means.swap_dims(ROW_AXIS, COLUMN_AXIS),
            scales: self.scales.swap_dims(ROW_AXIS, COLUMN_AXIS),
        }
    }

    /// Log-density of `x` (`[batch, 1, height, width]`) under each pixel's mixture.
    pub fn log_prob(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let component = gaussian_log_prob(x, self.means.clone(), self.scales.clone());
        log_sum_exp(self.log_weights.clone() + component, 1)
    }
}

/// Gated convolution along the causal axis, conditioned pointwise on the signal code.
#[derive(Module, Debug)]
pub struct CausalLayer<B: Backend> {
    conv: Conv2d<B>,
    condition: Conv2d<B>,
    output: Conv2d<B>,
    /// Zeros prepended along the causal axis. One more than `kernel - 1`
    /// excludes the current pixel.
    left_pad: usize,
    hidden: usize,
}

impl<B: Backend> CausalLayer<B> {
    fn new(
        in_channels: usize,
        config: &NoiseModelConfig,
        strict: bool,
        device: &B::Device,
    ) -> Self {
        let hidden = config.hidden_channels;
        let k = config.kernel_size;
        Self {
            conv: Conv2dConfig::new([in_channels, 2 * hidden], [1, k])
                .with_initializer(kaiming())
                .init(device),
            condition: conv1x1([config.s_code_channels, 2 * hidden], device),
            output: conv1x1([hidden, hidden], device),
            left_pad: if strict { k } else { k - 1 },
            hidden,
        }
    }

    /// `h` and `s` are in the causal frame and share batch and spatial size.
    fn forward(&self, h: Tensor<B, 4>, s: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, rows, cols] = h.dims();
        let h = if self.left_pad > 0 {
            let zeros = Tensor::zeros([batch, channels, rows, self.left_pad], &h.device());
            Tensor::cat(vec![zeros, h], COLUMN_AXIS)
        } else {
            h
        };
        // A strict layer produces one extra trailing column, which would see the current pixel.
        let a = self
            .conv
            .forward(h)
            .slice([0..batch, 0..2 * self.hidden, 0..rows, 0..cols])
            + self.condition.forward(s);

        let filter = a
            .clone()
            .slice([0..batch, 0..self.hidden, 0..rows, 0..cols]);
        let gate = a.slice([0..batch, self.hidden..2 * self.hidden, 0..rows, 0..cols]);
        self.output
            .forward(activation::tanh(filter) * activation::sigmoid(gate))
    }
}

#[derive(Module, Debug)]
pub struct NoiseModel<B: Backend> {
    input: CausalLayer<B>,
    layers: Vec<CausalLayer<B>>,
    head: Conv2d<B>,
    n_gaussians: usize,
    min_scale: f64,
    causal_axis: usize,
    receptive_field: usize,
}

impl<B: Backend> NoiseModel<B> {
    pub fn new(config: &NoiseModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_channels;
        Ok(Self {
            input: CausalLayer::new(1, config, true, device),
            layers: (1..config.n_layers)
                .map(|_| CausalLayer::new(hidden, config, false, device))
                .collect(),
            head: conv1x1([hidden, 3 * config.n_gaussians], device),
            n_gaussians: config.n_gaussians,
            min_scale: config.min_scale,
            causal_axis: match config.orientation {
                NoiseOrientation::Horizontal => COLUMN_AXIS,
                NoiseOrientation::Vertical => ROW_AXIS,
            },
            receptive_field: config.receptive_field(),
        })
    }

    /// Number of preceding pixels along the causal axis a prediction can see.
    pub fn receptive_field(&self) -> usize {
        self.receptive_field
    }

    pub fn n_gaussians(&self) -> usize {
        self.n_gaussians
    }

    /// Mixture parameters for every pixel of `x` given `signal_code`.
    pub fn forward(&self, x: Tensor<B, 4>, signal_code: Tensor<B, 4>) -> Result<MixtureParams<B>> {
        check_shapes(&x, &signal_code)?;
        let params = self.mixture_in_frame(self.to_frame(x), self.to_frame(signal_code));
        Ok(self.from_frame(params))
    }

    /// Per-pixel log-density of the observed image, `[batch, 1, height, width]`.
    pub fn log_likelihood(&self, x: Tensor<B, 4>, signal_code: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let params = self.forward(x.clone(), signal_code)?;
        Ok(params.log_prob(x))
    }

    /// Draws a noisy image pixel by pixel along the causal axis.
    ///
    /// Each step reruns the network on a window covering only the receptive
    /// field, so the cost grows with the image length along the causal axis
    /// times the receptive field rather than quadratically.
    pub fn sample(&self, signal_code: Tensor<B, 4>, streams: &mut SampleStreams) -> Result<Tensor<B, 4>> {
        let s = self.to_frame(signal_code);
        let [batch, s_channels, rows, cols] = s.dims();
        if batch != streams.len() {
            return Err(Error::shape(format!(
                "signal code batch {batch} does not match {} sample streams",
                streams.len()
            )));
        }
        let device = s.device();
        let k = self.n_gaussians;
        // Layout [batch][row][col].
        let mut image = vec![0.0f32; batch * rows * cols];

        for col in 0..cols {
            let start = col.saturating_sub(self.receptive_field);
            let width = col + 1 - start;

            let mut window = Vec::with_capacity(batch * rows * width);
            for b in 0..batch {
                for r in 0..rows {
                    let offset = (b * rows + r) * cols;
                    window.extend_from_slice(&image[offset + start..=offset + col]);
                }
            }
            let x = Tensor::<B, 4>::from_data(TensorData::new(window, [batch, 1, rows, width]), &device);
            let s_window = s
                .clone()
                .slice([0..batch, 0..s_channels, 0..rows, start..col + 1]);
            let params = self.mixture_in_frame(x, s_window);

            let last = |t: Tensor<B, 4>| t.slice([0..batch, 0..k, 0..rows, width - 1..width]);
            let log_weights = tensor_to_vec(last(params.log_weights))?;
            let means = tensor_to_vec(last(params.means))?;
            let scales = tensor_to_vec(last(params.scales))?;
            let uniforms = streams.uniform(rows);
            let normals = tensor_to_vec(streams.standard_normal::<B>([batch, 1, rows, 1], &device)?)?;

            for b in 0..batch {
                for r in 0..rows {
                    // Parameter layout [batch][component][row].
                    let at = |j: usize| (b * k + j) * rows + r;
                    let u = uniforms[b * rows + r];
                    let mut cumulative = 0.0;
                    let mut chosen = k - 1;
                    for j in 0..k {
                        cumulative += log_weights[at(j)].exp();
                        if u < cumulative {
                            chosen = j;
                            break;
                        }
                    }
                    image[(b * rows + r) * cols + col] =
                        means[at(chosen)] + scales[at(chosen)] * normals[b * rows + r];
                }
            }
        }

        let sampled = Tensor::<B, 4>::from_data(TensorData::new(image, [batch, 1, rows, cols]), &device);
        Ok(self.to_frame(sampled))
    }

    fn mixture_in_frame(&self, x: Tensor<B, 4>, s: Tensor<B, 4>) -> MixtureParams<B> {
        let mut h = self.input.forward(x, s.clone());
        for layer in &self.layers {
            h = h.clone() + layer.forward(h, s.clone());
        }

        let raw = self.head.forward(h);
        let [batch, _, rows, cols] = raw.dims();
        let k = self.n_gaussians;
        let part = |i: usize| raw.clone().slice([0..batch, i * k..(i + 1) * k, 0..rows, 0..cols]);

        MixtureParams {
            log_weights: activation::log_softmax(part(0), 1),
            means: part(1),
            scales: activation::softplus(part(2), 1.0).add_scalar(self.min_scale),
        }
    }

    /// Moves the causal axis last. The swap is its own inverse.
    fn to_frame(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.causal_axis == ROW_AXIS {
            x.swap_dims(ROW_AXIS, COLUMN_AXIS)
        } else {
            x
        }
    }

    fn from_frame(&self, params: MixtureParams<B>) -> MixtureParams<B> {
        if self.causal_axis == ROW_AXIS {
            params.swap_axes()
        } else {
            params
        }
    }
}

fn check_shapes<B: Backend>(x: &Tensor<B, 4>, signal_code: &Tensor<B, 4>) -> Result<()> {
    let [xb, xc, xh, xw] = x.dims();
    let [sb, _, sh, sw] = signal_code.dims();
    if xc != 1 || (xb, xh, xw) != (sb, sh, sw) {
        return Err(Error::shape(format!(
            "image {:?} does not match signal code {:?}",
            x.dims(),
            signal_code.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn config(orientation: NoiseOrientation) -> NoiseModelConfig {
        NoiseModelConfig::new()
            .with_s_code_channels(4)
            .with_hidden_channels(8)
            .with_kernel_size(3)
            .with_n_layers(3)
            .with_n_gaussians(3)
            .with_orientation(orientation)
    }

    fn inputs(device: &<TestBackend as Backend>::Device) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 4>) {
        let x = Tensor::random([1, 1, 6, 12], Distribution::Normal(0.0, 1.0), device);
        let s = Tensor::random([1, 4, 6, 12], Distribution::Normal(0.0, 1.0), device);
        (x, s)
    }

    fn perturbed(x: &Tensor<TestBackend, 4>, row: usize, col: usize) -> Tensor<TestBackend, 4> {
        let [_, _, h, w] = x.dims();
        let mut values = tensor_to_vec(x.clone()).unwrap();
        values[row * w + col] += 5.0;
        Tensor::from_data(TensorData::new(values, [1, 1, h, w]), &x.device())
    }

    /// Largest absolute change of any mixture parameter at each pixel, row-major.
    fn changed_pixels(a: MixtureParams<TestBackend>, b: MixtureParams<TestBackend>) -> Vec<f32> {
        let [_, k, h, w] = a.means.dims();
        let mut change = vec![0.0f32; h * w];
        for (ta, tb) in [
            (a.log_weights, b.log_weights),
            (a.means, b.means),
            (a.scales, b.scales),
        ] {
            let va = tensor_to_vec(ta).unwrap();
            let vb = tensor_to_vec(tb).unwrap();
            for j in 0..k {
                for p in 0..h * w {
                    let d = (va[j * h * w + p] - vb[j * h * w + p]).abs();
                    change[p] = change[p].max(d);
                }
            }
        }
        change
    }

    #[test]
    fn horizontal_model_only_sees_pixels_to_the_left() {
        let device = Default::default();
        let model = NoiseModel::<TestBackend>::new(&config(NoiseOrientation::Horizontal), &device).unwrap();
        let (x, s) = inputs(&device);
        let (row, col) = (2, 4);

        let base = model.forward(x.clone(), s.clone()).unwrap();
        let moved = model.forward(perturbed(&x, row, col), s).unwrap();
        let change = changed_pixels(base, moved);

        for r in 0..6 {
            for c in 0..12 {
                let d = change[r * 12 + c];
                if r == row && c > col && c <= col + model.receptive_field() {
                    continue;
                }
                assert!(d <= 1e-6, "pixel ({r}, {c}) changed by {d}");
            }
        }
        assert!(change[row * 12 + col + 1] > 0.0, "next pixel ignores its left neighbour");
    }

    #[test]
    fn vertical_model_only_sees_pixels_above() {
        let device = Default::default();
        let model = NoiseModel::<TestBackend>::new(&config(NoiseOrientation::Vertical), &device).unwrap();
        let (x, s) = inputs(&device);
        let (row, col) = (1, 7);

        let base = model.forward(x.clone(), s.clone()).unwrap();
        let moved = model.forward(perturbed(&x, row, col), s).unwrap();
        let change = changed_pixels(base, moved);

        for r in 0..6 {
            for c in 0..12 {
                let d = change[r * 12 + c];
                if c == col && r > row {
                    continue;
                }
                assert!(d <= 1e-6, "pixel ({r}, {c}) changed by {d}");
            }
        }
        assert!(change[(row + 1) * 12 + col] > 0.0);
    }

    #[test]
    fn mixture_weights_are_normalized_and_scales_floored() {
        let device = Default::default();
        let config = config(NoiseOrientation::Horizontal).with_min_scale(0.05);
        let model = NoiseModel::<TestBackend>::new(&config, &device).unwrap();
        let (x, s) = inputs(&device);
        let params = model.forward(x, s).unwrap();

        let weight_sums = tensor_to_vec(params.log_weights.exp().sum_dim(1)).unwrap();
        for w in weight_sums {
            assert_relative_eq!(w, 1.0, epsilon = 1e-5);
        }
        let scales = tensor_to_vec(params.scales).unwrap();
        assert!(scales.iter().all(|s| *s >= 0.05));
    }

    #[test]
    fn log_likelihood_is_per_pixel_and_finite() {
        let device = Default::default();
        let model = NoiseModel::<TestBackend>::new(&config(NoiseOrientation::Horizontal), &device).unwrap();
        let (x, s) = inputs(&device);
        let ll = model.log_likelihood(x, s).unwrap();
        assert_eq!(ll.dims(), [1, 1, 6, 12]);
        assert!(tensor_to_vec(ll).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn single_component_matches_gaussian_density() {
        let device = Default::default();
        let config = config(NoiseOrientation::Horizontal).with_n_gaussians(1);
        let model = NoiseModel::<TestBackend>::new(&config, &device).unwrap();
        let (x, s) = inputs(&device);

        let params = model.forward(x.clone(), s.clone()).unwrap();
        let expected = tensor_to_vec(gaussian_log_prob(x.clone(), params.means, params.scales)).unwrap();
        let actual = tensor_to_vec(model.log_likelihood(x, s).unwrap()).unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_relative_eq!(a, e, epsilon = 1e-5);
        }
    }

    #[test]
    fn mismatched_signal_code_is_rejected() {
        let device = Default::default();
        let model = NoiseModel::<TestBackend>::new(&config(NoiseOrientation::Horizontal), &device).unwrap();
        let x = Tensor::zeros([1, 1, 6, 12], &device);
        let s = Tensor::zeros([1, 4, 6, 10], &device);
        assert!(matches!(model.forward(x, s), Err(Error::Shape(_))));
    }

    #[test]
    fn sampling_is_deterministic_per_stream() {
        let device = Default::default();
        for orientation in [NoiseOrientation::Horizontal, NoiseOrientation::Vertical] {
            let model = NoiseModel::<TestBackend>::new(&config(orientation), &device).unwrap();
            let s = Tensor::<TestBackend, 4>::random([2, 4, 5, 7], Distribution::Normal(0.0, 1.0), &device);

            let a = model.sample(s.clone(), &mut SampleStreams::seeded(3, 2)).unwrap();
            let b = model.sample(s, &mut SampleStreams::seeded(3, 2)).unwrap();
            assert_eq!(a.dims(), [2, 1, 5, 7]);
            let a = tensor_to_vec(a).unwrap();
            assert!(a.iter().all(|v| v.is_finite()));
            assert_eq!(a, tensor_to_vec(b).unwrap());
        }
    }

    #[test]
    fn sampling_needs_one_stream_per_image() {
        let device = Default::default();
        let model = NoiseModel::<TestBackend>::new(&config(NoiseOrientation::Horizontal), &device).unwrap();
        let s = Tensor::<TestBackend, 4>::zeros([2, 4, 3, 3], &device);
        assert!(matches!(
            model.sample(s, &mut SampleStreams::seeded(0, 1)),
            Err(Error::Shape(_))
        ));
    }
}
