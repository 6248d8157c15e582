//! Checkpoints: `meta.json` plus full-precision `model.mpk` in one directory.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder, RecorderError};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DenoiserConfig;
use crate::model::Denoiser;
use crate::normalization::Normalization;

pub const META_FILE: &str = "meta.json";
/// Weights file stem; the recorder appends `.mpk`.
pub const WEIGHTS_STEM: &str = "model";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or unreadable metadata, or a configuration that no longer validates.
    #[error("invalid checkpoint metadata: {0}")]
    Metadata(String),

    /// The weights record is missing keys or cannot be decoded.
    #[error("invalid weights record: {0}")]
    Record(String),

    #[error("parameter {parameter} has shape {expected:?} in the configuration but {actual:?} in the checkpoint")]
    ShapeMismatch {
        parameter: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("configuration has {expected} parameter tensors, checkpoint has {actual}")]
    ParameterCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub config: DenoiserConfig,
    pub normalization: Normalization,
    /// Shape of every parameter tensor in visiting order.
    pub parameter_shapes: Vec<Vec<usize>>,
}

/// A restored model with everything needed to run it on raw data.
#[derive(Debug)]
pub struct Checkpoint<B: Backend> {
    pub model: Denoiser<B>,
    pub config: DenoiserConfig,
    pub normalization: Normalization,
}

#[derive(Default)]
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

fn parameter_shapes<B: Backend>(model: &Denoiser<B>) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector::default();
    model.visit(&mut collector);
    collector.shapes
}

fn compare_shapes(expected: &[Vec<usize>], actual: &[Vec<usize>]) -> Result<(), CheckpointError> {
    if expected.len() != actual.len() {
        return Err(CheckpointError::ParameterCount {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e != a {
            return Err(CheckpointError::ShapeMismatch {
                parameter: format!("#{i}"),
                expected: e.clone(),
                actual: a.clone(),
            });
        }
    }
    Ok(())
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

fn record_error(err: RecorderError) -> CheckpointError {
    match err {
        RecorderError::FileNotFound(path) => CheckpointError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("weights file not found: {path}"),
        )),
        other => CheckpointError::Record(format!("{other:?}")),
    }
}

/// Writes `model` with its configuration and normalization into `dir`.
pub fn save_checkpoint<B: Backend>(
    dir: impl AsRef<Path>,
    model: &Denoiser<B>,
    config: &DenoiserConfig,
    normalization: Normalization,
) -> Result<PathBuf, CheckpointError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let meta = CheckpointMeta {
        format_version: FORMAT_VERSION,
        config: config.clone(),
        normalization,
        parameter_shapes: parameter_shapes(model),
    };
    let json = serde_json::to_string_pretty(&meta).map_err(|e| CheckpointError::Metadata(e.to_string()))?;
    fs::write(dir.join(META_FILE), json)?;

    recorder()
        .record(model.clone().into_record(), dir.join(WEIGHTS_STEM))
        .map_err(record_error)?;

    info!(
        parameters = model.num_params(),
        "saved checkpoint to {}",
        dir.display()
    );
    Ok(dir.to_path_buf())
}

/// Reads only the metadata of a checkpoint.
pub fn load_meta(dir: impl AsRef<Path>) -> Result<CheckpointMeta, CheckpointError> {
    let path = dir.as_ref().join(META_FILE);
    let json = fs::read_to_string(&path)?;
    let meta: CheckpointMeta =
        serde_json::from_str(&json).map_err(|e| CheckpointError::Metadata(format!("{}: {e}", path.display())))?;
    if meta.format_version != FORMAT_VERSION {
        return Err(CheckpointError::Metadata(format!(
            "unsupported checkpoint format version {}",
            meta.format_version
        )));
    }
    Ok(meta)
}

/// Rebuilds the model described by the checkpoint's configuration and loads its weights.
pub fn load_checkpoint<B: Backend>(
    dir: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Checkpoint<B>, CheckpointError> {
    let dir = dir.as_ref();
    let meta = load_meta(dir)?;

    let fresh = meta
        .config
        .init::<B>(device)
        .map_err(|e| CheckpointError::Metadata(e.to_string()))?;
    let expected = parameter_shapes(&fresh);
    compare_shapes(&expected, &meta.parameter_shapes)?;

    let record = recorder()
        .load(dir.join(WEIGHTS_STEM), device)
        .map_err(record_error)?;
    let model = fresh.load_record(record);
    compare_shapes(&expected, &parameter_shapes(&model))?;

    info!(
        parameters = model.num_params(),
        "loaded checkpoint from {}",
        dir.display()
    );
    Ok(Checkpoint {
        model,
        config: meta.config,
        normalization: meta.normalization,
    })
}
