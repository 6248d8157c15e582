use burn::tensor::{backend::Backend, Tensor};
use ndarray::{Array, ArrayView, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed per-dataset intensity statistics. Every model sees `(x - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    pub fn new(mean: f32, std: f32) -> Result<Self> {
        if !mean.is_finite() || !std.is_finite() || std <= 0.0 {
            return Err(Error::config(format!(
                "normalization needs a finite mean and a positive std, got mean={mean}, std={std}"
            )));
        }
        Ok(Self { mean, std })
    }

    /// Mean and standard deviation of every value in `data`.
    pub fn from_data<D: Dimension>(data: ArrayView<'_, f32, D>) -> Result<Self> {
        let n = data.len();
        if n == 0 {
            return Err(Error::shape("cannot compute statistics of an empty array"));
        }
        let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let var = data
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        Self::new(mean as f32, var.sqrt().max(f32::EPSILON as f64) as f32)
    }

    pub fn normalize<D: Dimension>(&self, data: ArrayView<'_, f32, D>) -> Array<f32, D> {
        data.mapv(|v| (v - self.mean) / self.std)
    }

    pub fn denormalize<D: Dimension>(&self, data: ArrayView<'_, f32, D>) -> Array<f32, D> {
        data.mapv(|v| v * self.std + self.mean)
    }

    pub fn normalize_tensor<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        x.sub_scalar(self.mean).div_scalar(self.std)
    }

    pub fn denormalize_tensor<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        x.mul_scalar(self.std).add_scalar(self.mean)
    }
}
