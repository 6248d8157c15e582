//! Ladder VAE. Levels are stored finest first in both encoder and decoder.

use burn::module::Module;
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::blocks::{conv1x1, conv3x3, downsample, upsample, ResidualBlock};
use crate::config::LadderConfig;
use crate::distributions::{gaussian_kl, standard_normal_kl};
use crate::error::{Error, Result};
use crate::sampling::SampleStreams;

/// Posterior parameters of one level, at that level's resolution.
#[derive(Debug, Clone)]
pub struct LevelPosterior<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub logvar: Tensor<B, 4>,
}

/// Output of [`LadderVae::encode`], finest level first.
#[derive(Debug, Clone)]
pub struct Posterior<B: Backend> {
    pub levels: Vec<LevelPosterior<B>>,
    /// Spatial size of the input before padding.
    pub height: usize,
    pub width: usize,
}

/// Output of a top-down pass.
#[derive(Debug, Clone)]
pub struct Decoded<B: Backend> {
    /// Full-resolution signal code, cropped to the input size.
    pub signal_code: Tensor<B, 4>,
    /// Per-level KL divergence summed over channels and pixels, shape `[batch]`, finest first.
    pub kl: Vec<Tensor<B, 1>>,
    /// The latent drawn at each level, finest first.
    pub latents: Vec<Tensor<B, 4>>,
}

#[derive(Module, Debug)]
pub struct EncoderLevel<B: Backend> {
    downsample: Option<Conv2d<B>>,
    block: ResidualBlock<B>,
    posterior: Conv2d<B>,
    z_dim: usize,
}

impl<B: Backend> EncoderLevel<B> {
    fn new(hidden: usize, z_dim: usize, halve: bool, device: &B::Device) -> Self {
        Self {
            downsample: halve.then(|| downsample([hidden, hidden], device)),
            block: ResidualBlock::new(hidden, device),
            posterior: conv1x1([hidden, 2 * z_dim], device),
            z_dim,
        }
    }

    fn forward(&self, h: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let h = match &self.downsample {
            Some(conv) => activation::silu(conv.forward(h)),
            None => h,
        };
        let h = self.block.forward(h);
        let (mean, logvar) = split_channels(self.posterior.forward(h.clone()), self.z_dim);
        (h, mean, logvar)
    }
}

#[derive(Module, Debug)]
pub struct DecoderLevel<B: Backend> {
    /// Predicts this level's prior from the coarser state. Absent at the top.
    prior: Option<Conv2d<B>>,
    merge: Conv2d<B>,
    block: ResidualBlock<B>,
    upsample: Option<ConvTranspose2d<B>>,
    z_dim: usize,
}

impl<B: Backend> DecoderLevel<B> {
    fn new(hidden: usize, z_dim: usize, halve: bool, top: bool, device: &B::Device) -> Self {
        let merge_in = if top { z_dim } else { hidden + z_dim };
        Self {
            prior: (!top).then(|| conv3x3([hidden, 2 * z_dim], device)),
            merge: conv3x3([merge_in, hidden], device),
            block: ResidualBlock::new(hidden, device),
            upsample: halve.then(|| upsample([hidden, hidden], device)),
            z_dim,
        }
    }

    fn prior(&self, state: &Tensor<B, 4>) -> Option<(Tensor<B, 4>, Tensor<B, 4>)> {
        self.prior
            .as_ref()
            .map(|conv| split_channels(conv.forward(state.clone()), self.z_dim))
    }

    fn forward(&self, state: Option<Tensor<B, 4>>, z: Tensor<B, 4>) -> Tensor<B, 4> {
        let input = match state {
            Some(state) => Tensor::cat(vec![state, z], 1),
            None => z,
        };
        let h = activation::silu(self.merge.forward(input));
        let h = self.block.forward(h);
        match &self.upsample {
            Some(up) => up.forward(h),
            None => h,
        }
    }
}

#[derive(Module, Debug)]
pub struct LadderVae<B: Backend> {
    stem: Conv2d<B>,
    encoder: Vec<EncoderLevel<B>>,
    decoder: Vec<DecoderLevel<B>>,
    output: Conv2d<B>,
    logvar_min: f64,
    logvar_max: f64,
    pad_multiple: usize,
}

enum Source<'a, B: Backend> {
    Posterior {
        posterior: &'a Posterior<B>,
        use_mean: bool,
    },
    Prior {
        batch: usize,
        height: usize,
        width: usize,
        device: B::Device,
    },
}

impl<B: Backend> LadderVae<B> {
    pub fn new(config: &LadderConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_channels;
        let top = config.n_levels - 1;

        let encoder = (0..config.n_levels)
            .map(|i| EncoderLevel::new(hidden, config.z_dims[i], config.downsampling[i] == 1, device))
            .collect();
        let decoder = (0..config.n_levels)
            .map(|i| {
                DecoderLevel::new(
                    hidden,
                    config.z_dims[i],
                    config.downsampling[i] == 1,
                    i == top,
                    device,
                )
            })
            .collect();

        Ok(Self {
            stem: conv3x3([config.in_channels, hidden], device),
            encoder,
            decoder,
            output: conv1x1([hidden, config.s_code_channels], device),
            logvar_min: config.logvar_min,
            logvar_max: config.logvar_max,
            pad_multiple: 1 << config.total_downsampling(),
        })
    }

    pub fn n_levels(&self) -> usize {
        self.decoder.len()
    }

    /// Bottom-up pass: per-level posterior parameters, finest first.
    pub fn encode(&self, x: Tensor<B, 4>) -> Posterior<B> {
        let [_, _, height, width] = x.dims();
        let x = pad_to_multiple(x, self.pad_multiple);
        let mut h = activation::silu(self.stem.forward(x));

        let mut levels = Vec::with_capacity(self.encoder.len());
        for level in &self.encoder {
            let (next, mean, logvar) = level.forward(h);
            levels.push(LevelPosterior {
                mean,
                logvar: self.clamp_logvar(logvar),
            });
            h = next;
        }

        Posterior {
            levels,
            height,
            width,
        }
    }

    /// Top-down pass drawing one reparameterized sample per level from the posterior.
    pub fn sample_and_decode(
        &self,
        posterior: &Posterior<B>,
        streams: &mut SampleStreams,
    ) -> Result<Decoded<B>> {
        self.top_down(
            Source::Posterior {
                posterior,
                use_mean: false,
            },
            Some(streams),
        )
    }

    /// Top-down pass using the posterior means instead of samples.
    pub fn decode_mean(&self, posterior: &Posterior<B>) -> Result<Decoded<B>> {
        self.top_down(
            Source::Posterior {
                posterior,
                use_mean: true,
            },
            None,
        )
    }

    /// Generates signal codes by sampling every level from its prior.
    pub fn sample_prior(
        &self,
        batch: usize,
        height: usize,
        width: usize,
        streams: &mut SampleStreams,
        device: &B::Device,
    ) -> Result<Tensor<B, 4>> {
        let decoded = self.top_down(
            Source::Prior {
                batch,
                height,
                width,
                device: device.clone(),
            },
            Some(streams),
        )?;
        Ok(decoded.signal_code)
    }

    fn top_down(
        &self,
        source: Source<'_, B>,
        mut streams: Option<&mut SampleStreams>,
    ) -> Result<Decoded<B>> {
        let n = self.decoder.len();
        let (height, width, device) = match &source {
            Source::Posterior { posterior, .. } => {
                if posterior.levels.len() != n {
                    return Err(Error::shape(format!(
                        "posterior has {} levels, ladder has {n}",
                        posterior.levels.len()
                    )));
                }
                let device = posterior.levels[0].mean.device();
                (posterior.height, posterior.width, device)
            }
            Source::Prior {
                height,
                width,
                device,
                ..
            } => (*height, *width, device.clone()),
        };

        let mut state: Option<Tensor<B, 4>> = None;
        let mut kl = Vec::with_capacity(n);
        let mut latents = Vec::with_capacity(n);

        for i in (0..n).rev() {
            let level = &self.decoder[i];
            let prior = state
                .as_ref()
                .and_then(|s| level.prior(s))
                .map(|(mean, logvar)| (mean, self.clamp_logvar(logvar)));

            let z = match &source {
                Source::Posterior {
                    posterior,
                    use_mean,
                } => {
                    let q = &posterior.levels[i];
                    let z = if *use_mean {
                        q.mean.clone()
                    } else {
                        let eps = draw(&mut streams, q.mean.dims(), &device)?;
                        q.mean.clone() + (q.logvar.clone() * 0.5).exp() * eps
                    };
                    let kl_map = match &prior {
                        Some((p_mean, p_logvar)) => gaussian_kl(
                            q.mean.clone(),
                            q.logvar.clone(),
                            p_mean.clone(),
                            p_logvar.clone(),
                        ),
                        None => standard_normal_kl(q.mean.clone(), q.logvar.clone()),
                    };
                    let batch = kl_map.dims()[0];
                    kl.push(kl_map.flatten::<2>(1, 3).sum_dim(1).reshape([batch]));
                    z
                }
                Source::Prior {
                    batch,
                    height,
                    width,
                    ..
                } => match &prior {
                    Some((p_mean, p_logvar)) => {
                        let eps = draw(&mut streams, p_mean.dims(), &device)?;
                        p_mean.clone() + (p_logvar.clone() * 0.5).exp() * eps
                    }
                    None => {
                        let scale = self.pad_multiple;
                        let shape = [
                            *batch,
                            level.z_dim,
                            height.div_ceil(scale),
                            width.div_ceil(scale),
                        ];
                        draw(&mut streams, shape, &device)?
                    }
                },
            };

            latents.push(z.clone());
            state = Some(level.forward(state, z));
        }

        let state = state.ok_or_else(|| Error::config("ladder has no levels"))?;
        let code = self.output.forward(state);
        let [batch, channels, _, _] = code.dims();
        let signal_code = code.slice([0..batch, 0..channels, 0..height, 0..width]);

        kl.reverse();
        latents.reverse();
        Ok(Decoded {
            signal_code,
            kl,
            latents,
        })
    }

    fn clamp_logvar(&self, logvar: Tensor<B, 4>) -> Tensor<B, 4> {
        logvar.clamp(self.logvar_min, self.logvar_max)
    }
}

fn draw<B: Backend>(
    streams: &mut Option<&mut SampleStreams>,
    shape: [usize; 4],
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    match streams {
        Some(streams) => streams.standard_normal(shape, device),
        None => Err(Error::config("stochastic decode requires sample streams")),
    }
}

fn split_channels<B: Backend>(params: Tensor<B, 4>, z_dim: usize) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [b, _, h, w] = params.dims();
    let mean = params.clone().slice([0..b, 0..z_dim, 0..h, 0..w]);
    let logvar = params.slice([0..b, z_dim..2 * z_dim, 0..h, 0..w]);
    (mean, logvar)
}

/// Zero-pads the bottom and right edges up to a multiple of `multiple`.
pub fn pad_to_multiple<B: Backend>(x: Tensor<B, 4>, multiple: usize) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    let device = x.device();
    let pad_h = h.div_ceil(multiple) * multiple - h;
    let pad_w = w.div_ceil(multiple) * multiple - w;

    let mut x = x;
    if pad_h > 0 {
        x = Tensor::cat(vec![x, Tensor::zeros([b, c, pad_h, w], &device)], 2);
    }
    if pad_w > 0 {
        x = Tensor::cat(vec![x, Tensor::zeros([b, c, h + pad_h, pad_w], &device)], 3);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn small_config(downsampling: Vec<usize>) -> LadderConfig {
        let n = downsampling.len();
        LadderConfig::new(n, vec![4; n], downsampling)
            .with_hidden_channels(8)
            .with_s_code_channels(6)
    }

    #[test]
    fn posterior_resolutions_follow_downsampling() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1, 0, 1]), &device).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 16, 16], &device);
        let posterior = ladder.encode(x);

        let dims: Vec<[usize; 4]> = posterior.levels.iter().map(|l| l.mean.dims()).collect();
        assert_eq!(dims, vec![[2, 4, 8, 8], [2, 4, 8, 8], [2, 4, 4, 4]]);
    }

    #[test]
    fn odd_sizes_are_padded_and_cropped() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1, 1]), &device).unwrap();
        let x = Tensor::<TestBackend, 4>::random([1, 1, 13, 10], Distribution::Default, &device);
        let posterior = ladder.encode(x);
        assert_eq!(posterior.levels[1].mean.dims(), [1, 4, 4, 3]);

        let decoded = ladder
            .sample_and_decode(&posterior, &mut SampleStreams::seeded(0, 1))
            .unwrap();
        assert_eq!(decoded.signal_code.dims(), [1, 6, 13, 10]);
    }

    #[test]
    fn kl_terms_are_per_level_and_non_negative() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1, 1, 0]), &device).unwrap();
        let x = Tensor::<TestBackend, 4>::random([3, 1, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let posterior = ladder.encode(x);
        let decoded = ladder
            .sample_and_decode(&posterior, &mut SampleStreams::seeded(1, 3))
            .unwrap();

        assert_eq!(decoded.kl.len(), 3);
        for kl in decoded.kl {
            assert_eq!(kl.dims(), [3]);
            let values: Vec<f32> = kl.into_data().to_vec().unwrap();
            assert!(values.iter().all(|v| *v >= -1e-3 && v.is_finite()), "{values:?}");
        }
    }

    #[test]
    fn identical_streams_give_identical_samples() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1, 0]), &device).unwrap();
        let x = Tensor::<TestBackend, 4>::random([2, 1, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let posterior = ladder.encode(x);

        let a = ladder
            .sample_and_decode(&posterior, &mut SampleStreams::seeded(9, 2))
            .unwrap();
        let b = ladder
            .sample_and_decode(&posterior, &mut SampleStreams::seeded(9, 2))
            .unwrap();
        for (za, zb) in a.latents.into_iter().zip(b.latents) {
            za.into_data().assert_eq(&zb.into_data(), true);
        }
        a.signal_code.into_data().assert_eq(&b.signal_code.into_data(), true);
    }

    #[test]
    fn different_streams_give_different_samples() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1]), &device).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        let posterior = ladder.encode(x);

        let a = ladder
            .sample_and_decode(&posterior, &mut SampleStreams::seeded(1, 1))
            .unwrap();
        let b = ladder
            .sample_and_decode(&posterior, &mut SampleStreams::seeded(2, 1))
            .unwrap();
        let a: Vec<f32> = a.latents[0].clone().into_data().to_vec().unwrap();
        let b: Vec<f32> = b.latents[0].clone().into_data().to_vec().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mean_decode_needs_no_streams() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1, 1]), &device).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        let posterior = ladder.encode(x);
        let a = ladder.decode_mean(&posterior).unwrap();
        let b = ladder.decode_mean(&posterior).unwrap();
        a.signal_code.into_data().assert_eq(&b.signal_code.into_data(), true);
    }

    #[test]
    fn prior_samples_have_signal_code_shape() {
        let device = Default::default();
        let ladder = LadderVae::<TestBackend>::new(&small_config(vec![1, 1, 0]), &device).unwrap();
        let code = ladder
            .sample_prior(2, 12, 9, &mut SampleStreams::seeded(4, 2), &device)
            .unwrap();
        assert_eq!(code.dims(), [2, 6, 12, 9]);
    }

    #[test]
    fn logvar_is_clamped() {
        let device = Default::default();
        let config = small_config(vec![0]).with_logvar_min(-1.0).with_logvar_max(1.0);
        let ladder = LadderVae::<TestBackend>::new(&config, &device).unwrap();
        let x = Tensor::<TestBackend, 4>::random([1, 1, 4, 4], Distribution::Normal(0.0, 1e4), &device);
        let logvar: Vec<f32> = ladder.encode(x).levels[0].logvar.clone().into_data().to_vec().unwrap();
        assert!(logvar.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn mismatched_level_lists_fail_at_construction() {
        let device = Default::default();
        let config = LadderConfig::new(3, vec![4; 3], vec![1, 1]);
        assert!(matches!(
            LadderVae::<TestBackend>::new(&config, &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn padding_reaches_the_next_multiple() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 5, 7], &device);
        let padded = pad_to_multiple(x, 4);
        assert_eq!(padded.dims(), [1, 1, 8, 8]);
        let total: f32 = padded.sum().into_scalar();
        assert_eq!(total, 35.0);
    }
}
