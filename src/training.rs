use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use tracing::{debug, info};

use crate::config::{KlSchedule, TrainingConfig};
use crate::data::CropSampler;
use crate::error::{Error, Result};
use crate::model::Denoiser;
use crate::sampling::{stream_seed, SampleStreams};

const TRAIN_STREAM: u64 = 1;
const VALIDATION_STREAM: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationStep {
    /// Gradients were added to the pending window.
    Accumulate,
    /// The window is complete; apply the optimizer now.
    Apply,
}

/// Counts batches within one accumulation window.
#[derive(Debug, Clone)]
pub struct GradientAccumulation {
    window: usize,
    pending: usize,
}

impl GradientAccumulation {
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(Error::config("gradient accumulation window must be at least 1"));
        }
        Ok(Self { window, pending: 0 })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Batches accumulated since the last optimizer step.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Records one accumulated batch.
    pub fn record(&mut self) -> AccumulationStep {
        self.pending += 1;
        if self.pending == self.window {
            self.pending = 0;
            AccumulationStep::Apply
        } else {
            AccumulationStep::Accumulate
        }
    }

    /// Closes a partial window. Returns whether anything was pending.
    pub fn flush(&mut self) -> bool {
        let had_pending = self.pending > 0;
        self.pending = 0;
        had_pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `patience` epochs passed without a better validation loss.
    Patience,
    MaxEpochs,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochOutcome {
    pub epoch: usize,
    pub improved: bool,
    pub stop: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    max_epochs: usize,
    epoch: usize,
    best: Option<f32>,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, max_epochs: usize) -> Self {
        Self {
            patience,
            max_epochs,
            epoch: 0,
            best: None,
            epochs_without_improvement: 0,
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    /// Feeds one epoch's validation loss.
    pub fn observe(&mut self, validation_loss: f32) -> EpochOutcome {
        self.epoch += 1;
        let improved = self.best.map_or(true, |best| validation_loss < best);
        if improved {
            self.best = Some(validation_loss);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }

        let stop = if self.epochs_without_improvement >= self.patience && !improved {
            Some(StopReason::Patience)
        } else if self.epoch >= self.max_epochs {
            Some(StopReason::MaxEpochs)
        } else {
            None
        };
        EpochOutcome {
            epoch: self.epoch,
            improved,
            stop,
        }
    }
}

/// Loss parts of one training batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub total: f32,
    pub nll: f32,
    pub kl: f32,
    pub signal: f32,
    pub kl_weight: f64,
    /// Whether this batch completed a window and moved the weights.
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub optimizer_steps: usize,
    pub best_validation_loss: f32,
    pub stop_reason: StopReason,
}

pub struct Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Denoiser<B>, B>,
{
    model: Denoiser<B>,
    optimizer: O,
    accumulator: GradientsAccumulator<Denoiser<B>>,
    accumulation: GradientAccumulation,
    learning_rate: f64,
    kl_schedule: KlSchedule,
    seed: u64,
    optimizer_steps: usize,
    batches: usize,
    best_model: Option<Denoiser<B::InnerBackend>>,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Denoiser<B>, B>,
{
    pub fn new(model: Denoiser<B>, optimizer: O, config: &TrainingConfig, kl_schedule: KlSchedule) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            optimizer,
            accumulator: GradientsAccumulator::new(),
            accumulation: GradientAccumulation::new(config.grad_accumulation)?,
            learning_rate: config.learning_rate,
            kl_schedule,
            seed: config.seed,
            optimizer_steps: 0,
            batches: 0,
            best_model: None,
        })
    }

    pub fn model(&self) -> &Denoiser<B> {
        &self.model
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn pending_batches(&self) -> usize {
        self.accumulation.pending()
    }

    /// The model with the lowest validation loss so far, without autodiff.
    pub fn best_model(&self) -> Option<&Denoiser<B::InnerBackend>> {
        self.best_model.as_ref()
    }

    /// The best validated model, or the current weights if nothing was validated.
    pub fn into_best_model(self) -> Denoiser<B::InnerBackend> {
        match self.best_model {
            Some(model) => model,
            None => self.model.valid(),
        }
    }

    /// Forward, backward and accumulate one batch; steps the optimizer when a window completes.
    pub fn train_step(&mut self, x: Tensor<B, 4>) -> Result<StepReport> {
        let batch = x.dims()[0];
        let mut streams = SampleStreams::seeded(stream_seed(self.seed, TRAIN_STREAM, self.batches as u64), batch);
        self.batches += 1;

        let kl_weight = self.kl_schedule.weight(self.optimizer_steps);
        let output = self.model.forward(x.clone(), &mut streams)?;
        let loss = self.model.loss(x, &output, kl_weight, self.optimizer_steps)?;
        let total = loss.total.clone().into_scalar().elem::<f32>();

        // Each batch carries 1/window of the window's gradient.
        let scaled = loss.total.div_scalar(self.accumulation.window() as f64);
        let grads = GradientsParams::from_grads(scaled.backward(), &self.model);
        self.accumulator.accumulate(&self.model, grads);

        let applied = match self.accumulation.record() {
            AccumulationStep::Apply => {
                self.apply();
                true
            }
            AccumulationStep::Accumulate => false,
        };

        let report = StepReport {
            total,
            nll: loss.nll,
            kl: loss.kl,
            signal: loss.signal,
            kl_weight,
            applied,
        };
        debug!(
            batch = self.batches,
            step = self.optimizer_steps,
            total = report.total,
            nll = report.nll,
            kl = report.kl,
            signal = report.signal,
            kl_weight,
            "train step"
        );
        Ok(report)
    }

    /// Applies any partially filled accumulation window.
    pub fn flush(&mut self) -> bool {
        if self.accumulation.flush() {
            self.apply();
            true
        } else {
            false
        }
    }

    fn apply(&mut self) {
        let grads = self.accumulator.grads();
        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);
        self.optimizer_steps += 1;
    }

    /// Mean total loss over fixed validation batches, without gradients.
    ///
    /// Each batch uses the same streams and the post-warm-up KL weight on every
    /// call, so losses from different epochs measure the same objective.
    pub fn validate(&self, batches: &[Tensor<B::InnerBackend, 4>]) -> Result<f32> {
        if batches.is_empty() {
            return Err(Error::config("validation needs at least one batch"));
        }
        let model = self.model.valid();
        let kl_weight = self.kl_schedule.final_weight();

        let mut total = 0.0f32;
        for (i, x) in batches.iter().enumerate() {
            let mut streams = SampleStreams::seeded(
                stream_seed(self.seed, VALIDATION_STREAM, i as u64),
                x.dims()[0],
            );
            let output = model.forward(x.clone(), &mut streams)?;
            let loss = model.loss(x.clone(), &output, kl_weight, self.optimizer_steps)?;
            total += loss.total.into_scalar().elem::<f32>();
        }
        Ok(total / batches.len() as f32)
    }

    /// Trains until early stopping or `max_epochs`, keeping the best validated weights.
    pub fn fit(
        &mut self,
        train: &mut CropSampler,
        validation: &mut CropSampler,
        config: &TrainingConfig,
        device: &B::Device,
    ) -> Result<TrainingSummary> {
        config.validate()?;
        let validation_batches: Vec<Tensor<B::InnerBackend, 4>> = (0..config.val_batches.max(1))
            .map(|_| validation.sample_batch::<B::InnerBackend>(config.batch_size, device))
            .collect();
        let mut stopping = EarlyStopping::new(config.patience, config.max_epochs);

        info!(
            batch_size = config.batch_size,
            crop_size = config.crop_size,
            grad_accumulation = config.grad_accumulation,
            steps_per_epoch = config.steps_per_epoch,
            "starting training"
        );

        loop {
            let mut epoch_loss = 0.0f32;
            for _ in 0..config.steps_per_epoch {
                let x = train.sample_batch::<B>(config.batch_size, device);
                epoch_loss += self.train_step(x)?.total;
            }
            self.flush();

            let validation_loss = self.validate(&validation_batches)?;
            let outcome = stopping.observe(validation_loss);
            if outcome.improved {
                self.best_model = Some(self.model.valid());
            }
            info!(
                epoch = outcome.epoch,
                train_loss = epoch_loss / config.steps_per_epoch as f32,
                validation_loss,
                best = stopping.best(),
                epochs_without_improvement = stopping.epochs_without_improvement(),
                "epoch finished"
            );

            if let Some(reason) = outcome.stop {
                let best_validation_loss = stopping.best().unwrap_or(validation_loss);
                info!(?reason, epochs = outcome.epoch, best_validation_loss, "training stopped");
                return Ok(TrainingSummary {
                    epochs: outcome.epoch,
                    optimizer_steps: self.optimizer_steps,
                    best_validation_loss,
                    stop_reason: reason,
                });
            }
        }
    }
}
