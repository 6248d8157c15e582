//! Sampling-based denoising of raw frames.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis};
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::model::Denoiser;
use crate::normalization::Normalization;
use crate::sampling::{tensor_to_vec, SampleStreams};

/// Denoising results in raw intensity units.
#[derive(Debug, Clone)]
pub struct Denoised {
    /// Pixelwise mean of all samples, `[frames, height, width]`.
    pub mmse: Array3<f32>,
    /// Every sample, `[samples, frames, height, width]`, when requested.
    pub samples: Option<Array4<f32>>,
}

/// A trained model bound to its dataset normalization. Never mutates the weights.
#[derive(Debug)]
pub struct Predictor<B: Backend> {
    model: Denoiser<B>,
    normalization: Normalization,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: Denoiser<B>, normalization: Normalization, device: B::Device) -> Self {
        Self {
            model,
            normalization,
            device,
        }
    }

    pub fn from_checkpoint(checkpoint: Checkpoint<B>, device: B::Device) -> Self {
        Self::new(checkpoint.model, checkpoint.normalization, device)
    }

    pub fn model(&self) -> &Denoiser<B> {
        &self.model
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Draws `n_samples` denoised samples per frame and averages them.
    ///
    /// Sample `s` of frame `f` always comes from the stream for `(seed, f, s)`,
    /// so the result does not depend on `config.batch_size`.
    pub fn denoise(&self, frames: ArrayView3<'_, f32>, config: &InferenceConfig) -> Result<Denoised> {
        config.validate()?;
        let (n_frames, height, width) = frames.dim();
        if n_frames == 0 || height == 0 || width == 0 {
            return Err(Error::shape(format!("cannot denoise frames of shape {:?}", frames.shape())));
        }
        let n = config.n_samples;
        let pixels = height * width;
        info!(
            frames = n_frames,
            samples = n,
            batch_size = config.batch_size,
            "denoising"
        );

        let mut mmse = Array3::<f32>::zeros((n_frames, height, width));
        let mut samples = config
            .keep_samples
            .then(|| Array4::<f32>::zeros((n, n_frames, height, width)));

        for (f, frame) in frames.axis_iter(Axis(0)).enumerate() {
            let normalized: Vec<f32> = self.normalization.normalize(frame).iter().copied().collect();
            let mut sum = vec![0.0f64; pixels];

            let mut start = 0;
            while start < n {
                let end = (start + config.batch_size).min(n);
                let chunk = end - start;
                let x = self.repeat_frame(&normalized, chunk, height, width);
                let mut streams = SampleStreams::for_ensemble(config.seed, f, start..end);
                let out = self.model.denoise_sample(x, &mut streams)?;
                let out = self.normalization.denormalize_tensor(out);
                let values = tensor_to_vec(out)?;

                for (k, sample) in values.chunks_exact(pixels).enumerate() {
                    for (acc, v) in sum.iter_mut().zip(sample) {
                        *acc += *v as f64;
                    }
                    if let Some(samples) = samples.as_mut() {
                        let mut dst = samples.index_axis_mut(Axis(0), start + k);
                        let mut dst = dst.index_axis_mut(Axis(0), f);
                        for (d, v) in dst.iter_mut().zip(sample) {
                            *d = *v;
                        }
                    }
                }
                start = end;
            }

            for (d, s) in mmse.index_axis_mut(Axis(0), f).iter_mut().zip(&sum) {
                *d = (*s / n as f64) as f32;
            }
            debug!(frame = f, "frame denoised");
        }

        Ok(Denoised { mmse, samples })
    }

    /// Single deterministic estimate per frame from the posterior means.
    pub fn posterior_mean(&self, frames: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (n_frames, height, width) = frames.dim();
        let mut out = Array3::<f32>::zeros((n_frames, height, width));
        for (f, frame) in frames.axis_iter(Axis(0)).enumerate() {
            let values = self.denoise_view(frame)?;
            for (d, v) in out.index_axis_mut(Axis(0), f).iter_mut().zip(values) {
                *d = v;
            }
        }
        Ok(out)
    }

    fn denoise_view(&self, frame: ArrayView2<'_, f32>) -> Result<Vec<f32>> {
        let (height, width) = frame.dim();
        let normalized: Vec<f32> = self.normalization.normalize(frame).iter().copied().collect();
        let x = self.repeat_frame(&normalized, 1, height, width);
        let out = self.model.posterior_mean_signal(x)?;
        tensor_to_vec(self.normalization.denormalize_tensor(out))
    }

    fn repeat_frame(&self, frame: &[f32], copies: usize, height: usize, width: usize) -> Tensor<B, 4> {
        let mut values = Vec::with_capacity(copies * frame.len());
        for _ in 0..copies {
            values.extend_from_slice(frame);
        }
        Tensor::from_data(TensorData::new(values, [copies, 1, height, width]), &self.device)
    }
}
