use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::optim::AdamConfig;
use clap::{Parser, Subcommand};
use ndarray::Axis;
use tracing::info;

use ladder_denoise::{
    load_checkpoint, save_checkpoint, save_frames_f32, save_frames_u16, CropSampler, Denoiser, DenoiserConfig,
    ExperimentConfig, FrameStack, InferenceConfig, NoiseOrientation, Predictor, Trainer,
};

type TrainBackend = Autodiff<Wgpu>;
type InferBackend = Wgpu;

/// Ladder VAE denoiser for structured microscopy noise
#[derive(Parser, Debug)]
#[command(name = "ladder-denoise")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default experiment configuration
    InitConfig {
        #[arg(short, long, default_value = "experiment.json")]
        output: PathBuf,

        /// Number of latent levels
        #[arg(long, default_value_t = 6)]
        levels: usize,

        /// Noise correlated along columns instead of rows
        #[arg(long)]
        vertical: bool,

        /// Mixture components per pixel in the noise model
        #[arg(long, default_value_t = 3)]
        gaussians: usize,
    },

    /// Train on a directory of noisy frames and save a checkpoint
    Train {
        /// Experiment configuration written by `init-config`
        #[arg(short, long)]
        config: PathBuf,

        /// Directory of noisy frames
        #[arg(short, long)]
        data: PathBuf,

        /// Checkpoint directory to write
        #[arg(long, default_value = "checkpoint")]
        checkpoint: PathBuf,
    },

    /// Denoise a directory of frames with a trained checkpoint
    Denoise {
        #[arg(long, default_value = "checkpoint")]
        checkpoint: PathBuf,

        /// Directory of noisy frames
        #[arg(short, long)]
        data: PathBuf,

        /// Output directory; frames are written as float TIFF, plus a 16-bit PNG preview of the MMSE
        #[arg(short, long, default_value = "denoised")]
        output: PathBuf,

        /// Samples averaged per frame
        #[arg(short = 'n', long, default_value_t = 100)]
        samples: usize,

        /// Samples pushed through the network at once
        #[arg(long, default_value_t = 10)]
        batch_size: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Also write every individual sample
        #[arg(long)]
        keep_samples: bool,

        /// Also write the posterior-mean decode
        #[arg(long)]
        posterior_mean: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Command::InitConfig {
            output,
            levels,
            vertical,
            gaussians,
        } => cmd_init_config(&output, levels, vertical, gaussians),
        Command::Train {
            config,
            data,
            checkpoint,
        } => cmd_train(&config, &data, &checkpoint),
        Command::Denoise {
            checkpoint,
            data,
            output,
            samples,
            batch_size,
            seed,
            keep_samples,
            posterior_mean,
        } => {
            let config = InferenceConfig::new()
                .with_n_samples(samples)
                .with_batch_size(batch_size)
                .with_seed(seed)
                .with_keep_samples(keep_samples);
            cmd_denoise(&checkpoint, &data, &output, &config, posterior_mean)
        }
    }
}

fn cmd_init_config(output: &Path, levels: usize, vertical: bool, gaussians: usize) -> Result<()> {
    let mut model = DenoiserConfig::standard(levels);
    model.noise_model.n_gaussians = gaussians;
    if vertical {
        model.noise_model.orientation = NoiseOrientation::Vertical;
    }
    let experiment = ExperimentConfig::new(model);
    experiment.validate()?;

    let json = serde_json::to_string_pretty(&experiment)?;
    fs::write(output, json).with_context(|| format!("writing {}", output.display()))?;
    info!("wrote default configuration to {}", output.display());
    Ok(())
}

fn cmd_train(config_path: &Path, data: &Path, checkpoint: &Path) -> Result<()> {
    let json = fs::read_to_string(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let experiment: ExperimentConfig =
        serde_json::from_str(&json).with_context(|| format!("parsing {}", config_path.display()))?;
    experiment.validate()?;
    let training = &experiment.training;

    let device = WgpuDevice::default();
    let stack = FrameStack::from_dir(data)?;
    let normalization = stack.normalization()?;
    info!(mean = normalization.mean, std = normalization.std, "dataset statistics");

    let (train_frames, validation_frames) = stack.split(experiment.validation_fraction)?;
    let mut train = CropSampler::new(&train_frames, normalization, training.crop_size, training.seed)?;
    let mut validation = CropSampler::new(
        &validation_frames,
        normalization,
        training.crop_size,
        training.seed.wrapping_add(1),
    )?;

    let model = experiment.model.init::<TrainBackend>(&device)?;
    let optimizer = AdamConfig::new().init::<TrainBackend, Denoiser<TrainBackend>>();
    let mut trainer = Trainer::new(model, optimizer, training, experiment.model.loss.kl)?;
    let summary = trainer.fit(&mut train, &mut validation, training, &device)?;
    info!(
        epochs = summary.epochs,
        optimizer_steps = summary.optimizer_steps,
        best_validation_loss = summary.best_validation_loss,
        reason = ?summary.stop_reason,
        "training finished"
    );

    let best = trainer.into_best_model();
    save_checkpoint(checkpoint, &best, &experiment.model, normalization)?;
    Ok(())
}

fn cmd_denoise(
    checkpoint: &Path,
    data: &Path,
    output: &Path,
    config: &InferenceConfig,
    posterior_mean: bool,
) -> Result<()> {
    let device = WgpuDevice::default();
    let checkpoint = load_checkpoint::<InferBackend>(checkpoint, &device)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let predictor = Predictor::from_checkpoint(checkpoint, device);
    let stack = FrameStack::from_dir(data)?;

    let denoised = predictor.denoise(stack.frames(), config)?;
    save_frames_f32(denoised.mmse.view(), output.join("mmse"), "mmse")?;
    save_frames_u16(denoised.mmse.view(), output.join("preview"), "mmse")?;

    if let Some(samples) = &denoised.samples {
        for (s, sample) in samples.axis_iter(Axis(0)).enumerate() {
            save_frames_f32(sample, output.join("samples"), &format!("sample{s:03}"))?;
        }
    }
    if posterior_mean {
        let estimate = predictor.posterior_mean(stack.frames())?;
        save_frames_f32(estimate.view(), output.join("posterior_mean"), "posterior_mean")?;
    }
    info!("denoised {} frames into {}", stack.len(), output.display());
    Ok(())
}
