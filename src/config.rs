use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{self, Error};

/// Axis along which the noise model is causal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoiseOrientation {
    /// A pixel sees pixels strictly to its left in the same row.
    Horizontal,
    /// A pixel sees pixels strictly above it in the same column.
    Vertical,
}

/// Weight applied to the KL term as a function of the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum KlSchedule {
    Constant {
        weight: f64,
    },
    /// Linear ramp from `start` to `end` over `warmup_steps`, then held at `end`.
    LinearWarmup {
        start: f64,
        end: f64,
        warmup_steps: usize,
    },
}

impl KlSchedule {
    pub fn weight(&self, step: usize) -> f64 {
        match *self {
            KlSchedule::Constant { weight } => weight,
            KlSchedule::LinearWarmup {
                start,
                end,
                warmup_steps,
            } => {
                if warmup_steps == 0 || step >= warmup_steps {
                    end
                } else {
                    start + (end - start) * step as f64 / warmup_steps as f64
                }
            }
        }
    }

    /// Weight once any warm-up is over.
    pub fn final_weight(&self) -> f64 {
        match *self {
            KlSchedule::Constant { weight } => weight,
            KlSchedule::LinearWarmup { end, .. } => end,
        }
    }

    fn validate(&self) -> error::Result<()> {
        let weights = match *self {
            KlSchedule::Constant { weight } => vec![weight],
            KlSchedule::LinearWarmup { start, end, .. } => vec![start, end],
        };
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::config(format!(
                "KL weights must be finite and non-negative, got {self:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct LadderConfig {
    /// Number of stochastic levels.
    pub n_levels: usize,
    /// Latent channel width of each level, finest first.
    pub z_dims: Vec<usize>,
    /// Per-level downsampling flag, finest first: 0 keeps the resolution, 1 halves it.
    pub downsampling: Vec<usize>,
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 64)]
    pub hidden_channels: usize,
    #[config(default = 64)]
    pub s_code_channels: usize,
    #[config(default = "-8.0")]
    pub logvar_min: f64,
    #[config(default = 8.0)]
    pub logvar_max: f64,
}

impl LadderConfig {
    /// Total number of halvings between the input and the coarsest level.
    pub fn total_downsampling(&self) -> usize {
        self.downsampling.iter().sum()
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.n_levels == 0 {
            return Err(Error::config("ladder needs at least one level"));
        }
        if self.z_dims.len() != self.n_levels {
            return Err(Error::config(format!(
                "z_dims has {} entries but n_levels is {}",
                self.z_dims.len(),
                self.n_levels
            )));
        }
        if self.downsampling.len() != self.n_levels {
            return Err(Error::config(format!(
                "downsampling has {} entries but n_levels is {}",
                self.downsampling.len(),
                self.n_levels
            )));
        }
        if let Some(flag) = self.downsampling.iter().find(|&&d| d > 1) {
            return Err(Error::config(format!(
                "downsampling flags must be 0 or 1, got {flag}"
            )));
        }
        if self.z_dims.contains(&0) {
            return Err(Error::config("every z_dims entry must be non-zero"));
        }
        if self.in_channels == 0 || self.hidden_channels == 0 || self.s_code_channels == 0 {
            return Err(Error::config("ladder channel counts must be non-zero"));
        }
        if !(self.logvar_min < self.logvar_max) {
            return Err(Error::config(format!(
                "logvar_min ({}) must be below logvar_max ({})",
                self.logvar_min, self.logvar_max
            )));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct NoiseModelConfig {
    #[config(default = 64)]
    pub s_code_channels: usize,
    #[config(default = 64)]
    pub hidden_channels: usize,
    /// Width of every causal kernel along the causal axis.
    #[config(default = 5)]
    pub kernel_size: usize,
    #[config(default = 4)]
    pub n_layers: usize,
    #[config(default = 3)]
    pub n_gaussians: usize,
    #[config(default = "NoiseOrientation::Horizontal")]
    pub orientation: NoiseOrientation,
    /// Floor added to every component scale.
    #[config(default = 1e-3)]
    pub min_scale: f64,
}

impl NoiseModelConfig {
    /// Number of causally preceding pixels a prediction can depend on.
    pub fn receptive_field(&self) -> usize {
        self.kernel_size + self.n_layers.saturating_sub(1) * (self.kernel_size - 1)
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.kernel_size == 0 {
            return Err(Error::config("noise model kernel_size must be at least 1"));
        }
        if self.n_layers == 0 {
            return Err(Error::config("noise model needs at least one layer"));
        }
        if self.n_gaussians == 0 {
            return Err(Error::config("noise model needs at least one mixture component"));
        }
        if self.s_code_channels == 0 || self.hidden_channels == 0 {
            return Err(Error::config("noise model channel counts must be non-zero"));
        }
        if !(self.min_scale > 0.0) {
            return Err(Error::config("noise model min_scale must be positive"));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct SignalDecoderConfig {
    #[config(default = 64)]
    pub s_code_channels: usize,
    #[config(default = 64)]
    pub hidden_channels: usize,
    #[config(default = 2)]
    pub n_res_blocks: usize,
}

impl SignalDecoderConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.s_code_channels == 0 || self.hidden_channels == 0 {
            return Err(Error::config("signal decoder channel counts must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub nll_weight: f64,
    #[config(default = 1.0)]
    pub signal_weight: f64,
    #[config(default = "KlSchedule::Constant { weight: 1.0 }")]
    pub kl: KlSchedule,
}

impl LossConfig {
    pub fn validate(&self) -> error::Result<()> {
        for (name, w) in [("nll_weight", self.nll_weight), ("signal_weight", self.signal_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::config(format!("{name} must be finite and non-negative")));
            }
        }
        self.kl.validate()
    }
}

#[derive(Config, Debug)]
pub struct DenoiserConfig {
    pub ladder: LadderConfig,
    pub noise_model: NoiseModelConfig,
    pub signal_decoder: SignalDecoderConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
}

impl DenoiserConfig {
    /// A ladder of `n_levels` levels with 32 latent channels each, halving the
    /// resolution on even levels up to three times.
    pub fn standard(n_levels: usize) -> Self {
        let downsampling = (0..n_levels)
            .map(|i| usize::from(i % 2 == 0 && i < 6))
            .collect();
        Self::new(
            LadderConfig::new(n_levels, vec![32; n_levels], downsampling),
            NoiseModelConfig::new(),
            SignalDecoderConfig::new(),
        )
    }

    /// Sets the signal code width on all three components at once.
    pub fn with_s_code_channels(mut self, channels: usize) -> Self {
        self.ladder.s_code_channels = channels;
        self.noise_model.s_code_channels = channels;
        self.signal_decoder.s_code_channels = channels;
        self
    }

    pub fn validate(&self) -> error::Result<()> {
        self.ladder.validate()?;
        self.noise_model.validate()?;
        self.signal_decoder.validate()?;
        self.loss.validate()?;

        let s = self.ladder.s_code_channels;
        if self.noise_model.s_code_channels != s || self.signal_decoder.s_code_channels != s {
            return Err(Error::config(format!(
                "signal code width disagrees between components: ladder={s}, noise model={}, signal decoder={}",
                self.noise_model.s_code_channels, self.signal_decoder.s_code_channels
            )));
        }
        if self.ladder.in_channels != 1 {
            return Err(Error::config(format!(
                "only single-channel images are supported, got in_channels={}",
                self.ladder.in_channels
            )));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 64)]
    pub crop_size: usize,
    /// Number of batches whose gradients are summed before one optimizer step.
    #[config(default = 1)]
    pub grad_accumulation: usize,
    #[config(default = 1000)]
    pub max_epochs: usize,
    /// Epochs without validation improvement before training stops.
    #[config(default = 50)]
    pub patience: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 100)]
    pub steps_per_epoch: usize,
    #[config(default = 10)]
    pub val_batches: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.crop_size == 0 {
            return Err(Error::config("crop_size must be at least 1"));
        }
        if self.grad_accumulation == 0 {
            return Err(Error::config("grad_accumulation must be at least 1"));
        }
        if self.max_epochs == 0 || self.steps_per_epoch == 0 {
            return Err(Error::config("max_epochs and steps_per_epoch must be at least 1"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::config("learning_rate must be positive"));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct InferenceConfig {
    /// Stochastic samples drawn per frame.
    #[config(default = 100)]
    pub n_samples: usize,
    /// Frames-times-samples pushed through the network at once.
    #[config(default = 10)]
    pub batch_size: usize,
    #[config(default = 0)]
    pub seed: u64,
    /// Keep every individual sample next to the MMSE estimate.
    #[config(default = false)]
    pub keep_samples: bool,
}

impl InferenceConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.n_samples == 0 {
            return Err(Error::config("n_samples must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("inference batch_size must be at least 1"));
        }
        Ok(())
    }
}

/// Everything the command-line trainer reads from one JSON file.
#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub model: DenoiserConfig,
    #[config(default = "TrainingConfig::new()")]
    pub training: TrainingConfig,
    /// Share of the frames held out for validation.
    #[config(default = 0.15)]
    pub validation_fraction: f64,
}

impl ExperimentConfig {
    pub fn validate(&self) -> error::Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(Error::config(format!(
                "validation_fraction must lie in (0, 1), got {}",
                self.validation_fraction
            )));
        }
        Ok(())
    }
}
