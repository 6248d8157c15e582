use burn::module::Module;
use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use crate::config::DenoiserConfig;
use crate::error::{Error, Result};
use crate::ladder::LadderVae;
use crate::noise_model::NoiseModel;
use crate::sampling::SampleStreams;
use crate::signal_decoder::SignalDecoder;

#[derive(Module, Debug)]
pub struct Denoiser<B: Backend> {
    ladder: LadderVae<B>,
    noise_model: NoiseModel<B>,
    signal_decoder: SignalDecoder<B>,
    nll_weight: f64,
    signal_weight: f64,
}

impl DenoiserConfig {
    /// Validates the whole configuration, then builds all three networks.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Denoiser<B>> {
        self.validate()?;
        Ok(Denoiser {
            ladder: LadderVae::new(&self.ladder, device)?,
            noise_model: NoiseModel::new(&self.noise_model, device)?,
            signal_decoder: SignalDecoder::new(&self.signal_decoder, device)?,
            nll_weight: self.loss.nll_weight,
            signal_weight: self.loss.signal_weight,
        })
    }
}

/// Everything one stochastic forward pass produces.
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    pub signal_code: Tensor<B, 4>,
    /// Per-pixel log-density of the input under the noise model, `[batch, 1, height, width]`.
    pub log_likelihood: Tensor<B, 4>,
    /// Per-level KL, each `[batch]`, finest first.
    pub kl: Vec<Tensor<B, 1>>,
    /// Signal decoder output on the detached signal code.
    pub signal: Tensor<B, 4>,
}

/// The scalar objective plus its parts as plain numbers for logging.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub nll: f32,
    pub kl: f32,
    pub signal: f32,
    /// Per-pixel KL of each level, finest first.
    pub kl_per_level: Vec<f32>,
}

impl<B: Backend> Denoiser<B> {
    pub fn ladder(&self) -> &LadderVae<B> {
        &self.ladder
    }

    pub fn noise_model(&self) -> &NoiseModel<B> {
        &self.noise_model
    }

    pub fn signal_decoder(&self) -> &SignalDecoder<B> {
        &self.signal_decoder
    }

    /// Encode, draw one latent stack per image, and run both decoders.
    ///
    /// `x` is a normalized `[batch, 1, height, width]` batch; `streams` must hold one stream per image.
    pub fn forward(&self, x: Tensor<B, 4>, streams: &mut SampleStreams) -> Result<ForwardOutput<B>> {
        check_input(&x)?;
        let posterior = self.ladder.encode(x.clone());
        let decoded = self.ladder.sample_and_decode(&posterior, streams)?;
        let log_likelihood = self
            .noise_model
            .log_likelihood(x, decoded.signal_code.clone())?;
        let signal = self
            .signal_decoder
            .forward(decoded.signal_code.clone().detach());

        Ok(ForwardOutput {
            signal_code: decoded.signal_code,
            log_likelihood,
            kl: decoded.kl,
            signal,
        })
    }

    /// Weighted sum of noise-model NLL, per-pixel KL and signal-decoder MSE.
    ///
    /// Fails with [`Error::NonFiniteLoss`] instead of returning a NaN or infinite objective.
    pub fn loss(
        &self,
        x: Tensor<B, 4>,
        output: &ForwardOutput<B>,
        kl_weight: f64,
        step: usize,
    ) -> Result<LossBreakdown<B>> {
        let [_, _, height, width] = x.dims();
        let pixels = (height * width) as f64;

        let nll = output.log_likelihood.clone().mean().neg();
        let kl_levels: Vec<Tensor<B, 1>> = output
            .kl
            .iter()
            .map(|level| level.clone().mean().div_scalar(pixels))
            .collect();
        let kl = Tensor::cat(kl_levels.clone(), 0).sum();
        let signal = MseLoss::new().forward(output.signal.clone(), x, Reduction::Mean);

        let total = nll.clone().mul_scalar(self.nll_weight)
            + kl.clone().mul_scalar(kl_weight)
            + signal.clone().mul_scalar(self.signal_weight);

        let breakdown = LossBreakdown {
            nll: nll.into_scalar().elem::<f32>(),
            kl: kl.into_scalar().elem::<f32>(),
            signal: signal.into_scalar().elem::<f32>(),
            kl_per_level: kl_levels
                .into_iter()
                .map(|level| level.into_scalar().elem::<f32>())
                .collect(),
            total,
        };
        let total_value = breakdown.total.clone().into_scalar().elem::<f32>();
        if !total_value.is_finite() {
            return Err(Error::NonFiniteLoss {
                step,
                nll: breakdown.nll,
                kl: breakdown.kl,
                signal: breakdown.signal,
            });
        }
        Ok(breakdown)
    }

    /// One stochastic denoised estimate per image.
    pub fn denoise_sample(&self, x: Tensor<B, 4>, streams: &mut SampleStreams) -> Result<Tensor<B, 4>> {
        check_input(&x)?;
        let posterior = self.ladder.encode(x);
        let decoded = self.ladder.sample_and_decode(&posterior, streams)?;
        Ok(self.signal_decoder.forward(decoded.signal_code))
    }

    /// Deterministic estimate decoded from the posterior means of every level.
    pub fn posterior_mean_signal(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        check_input(&x)?;
        let posterior = self.ladder.encode(x);
        let decoded = self.ladder.decode_mean(&posterior)?;
        Ok(self.signal_decoder.forward(decoded.signal_code))
    }
}

fn check_input<B: Backend>(x: &Tensor<B, 4>) -> Result<()> {
    let [batch, channels, height, width] = x.dims();
    if channels != 1 || batch == 0 || height == 0 || width == 0 {
        return Err(Error::shape(format!(
            "expected a non-empty [batch, 1, height, width] input, got {:?}",
            x.dims()
        )));
    }
    Ok(())
}
