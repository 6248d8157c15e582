//! Unsupervised removal of axis-correlated noise from microscopy frames.

pub mod blocks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributions;
pub mod error;
pub mod inference;
pub mod ladder;
pub mod model;
pub mod noise_model;
pub mod normalization;
pub mod sampling;
pub mod signal_decoder;
pub mod training;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointError};
pub use config::{
    DenoiserConfig, ExperimentConfig, InferenceConfig, KlSchedule, LadderConfig, LossConfig,
    NoiseModelConfig, NoiseOrientation, SignalDecoderConfig, TrainingConfig,
};
pub use data::{save_frames_f32, save_frames_u16, CropSampler, FrameStack};
pub use error::{Error, Result};
pub use inference::{Denoised, Predictor};
pub use model::{Denoiser, ForwardOutput, LossBreakdown};
pub use normalization::Normalization;
pub use sampling::SampleStreams;
pub use training::{Trainer, TrainingSummary};
