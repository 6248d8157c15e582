//! Frame stacks on the host: loading, statistics, cropping and export.

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{DynamicImage, ImageBuffer, Luma, Rgb};
use ndarray::{s, Array3, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::normalization::Normalization;

/// A stack of equally sized single-channel frames, `[frames, height, width]`.
#[derive(Debug, Clone)]
pub struct FrameStack {
    frames: Array3<f32>,
}

impl FrameStack {
    pub fn from_array(frames: Array3<f32>) -> Result<Self> {
        if frames.is_empty() {
            return Err(Error::shape(format!("empty frame stack {:?}", frames.shape())));
        }
        if frames.iter().any(|v| !v.is_finite()) {
            return Err(Error::shape("frame stack contains non-finite values"));
        }
        Ok(Self { frames })
    }

    /// Loads every image in `dir`, sorted by file name, as grayscale.
    ///
    /// Integer files are read as 16 bit, so 8-bit files are widened to that range.
    /// 32-bit float files keep their values.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("directory does not exist: {}", dir.display()),
            )));
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(ext) = path.extension() {
                let ext = ext.to_str().unwrap_or("").to_lowercase();
                if matches!(ext.as_str(), "png" | "tif" | "tiff" | "jpg" | "jpeg" | "bmp") {
                    paths.push(path);
                }
            }
        }
        if paths.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no images found in {}", dir.display()),
            )));
        }
        paths.sort();

        let mut frames: Option<Array3<f32>> = None;
        for (i, path) in paths.iter().enumerate() {
            let (height, width, values) = gray_values(image::open(path)?);
            let stack = frames.get_or_insert_with(|| Array3::zeros((paths.len(), height, width)));
            if stack.shape()[1..] != [height, width] {
                return Err(Error::shape(format!(
                    "{} is {height}x{width}, expected {}x{}",
                    path.display(),
                    stack.shape()[1],
                    stack.shape()[2]
                )));
            }
            for (dst, src) in stack.index_axis_mut(Axis(0), i).iter_mut().zip(values) {
                *dst = src;
            }
        }

        let frames = frames.ok_or_else(|| Error::shape("no frames decoded"))?;
        info!(
            frames = frames.shape()[0],
            height = frames.shape()[1],
            width = frames.shape()[2],
            "loaded frame stack from {}",
            dir.display()
        );
        Self::from_array(frames)
    }

    pub fn frames(&self) -> ArrayView3<'_, f32> {
        self.frames.view()
    }

    pub fn into_array(self) -> Array3<f32> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.frames.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.frames.shape()[2]
    }

    pub fn normalization(&self) -> Result<Normalization> {
        Normalization::from_data(self.frames.view())
    }

    /// Holds out the last `validation_fraction` of the frames, at least one.
    ///
    /// A single frame is split along its rows instead, top part for training.
    pub fn split(self, validation_fraction: f64) -> Result<(FrameStack, FrameStack)> {
        if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
            return Err(Error::config(format!(
                "validation fraction must lie in (0, 1), got {validation_fraction}"
            )));
        }
        let n = self.len();
        if n == 1 {
            let height = self.height();
            if height < 2 {
                return Err(Error::shape("cannot split a single one-row frame"));
            }
            let held_out = ((height as f64 * validation_fraction).round() as usize).clamp(1, height - 1);
            let cut = height - held_out;
            warn!(cut, "single frame, splitting validation data off along rows");
            let train = self.frames.slice(s![.., ..cut, ..]).to_owned();
            let validation = self.frames.slice(s![.., cut.., ..]).to_owned();
            return Ok((Self::from_array(train)?, Self::from_array(validation)?));
        }

        let held_out = ((n as f64 * validation_fraction).round() as usize).clamp(1, n - 1);
        let cut = n - held_out;
        let train = self.frames.slice(s![..cut, .., ..]).to_owned();
        let validation = self.frames.slice(s![cut.., .., ..]).to_owned();
        Ok((Self::from_array(train)?, Self::from_array(validation)?))
    }
}

/// Draws random square crops from a normalized frame stack.
#[derive(Debug, Clone)]
pub struct CropSampler {
    frames: Array3<f32>,
    crop_size: usize,
    rng: StdRng,
}

impl CropSampler {
    pub fn new(
        stack: &FrameStack,
        normalization: Normalization,
        crop_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if crop_size == 0 || crop_size > stack.height() || crop_size > stack.width() {
            return Err(Error::config(format!(
                "crop size {crop_size} does not fit frames of {}x{}",
                stack.height(),
                stack.width()
            )));
        }
        Ok(Self {
            frames: normalization.normalize(stack.frames()),
            crop_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn crop_size(&self) -> usize {
        self.crop_size
    }

    /// `[batch, 1, crop, crop]` tensor of crops at random frames and offsets.
    pub fn sample_batch<B: Backend>(&mut self, batch: usize, device: &B::Device) -> Tensor<B, 4> {
        let (n, height, width) = self.frames.dim();
        let c = self.crop_size;
        let mut values = Vec::with_capacity(batch * c * c);
        for _ in 0..batch {
            let frame = self.rng.gen_range(0..n);
            let top = self.rng.gen_range(0..=height - c);
            let left = self.rng.gen_range(0..=width - c);
            let crop = self.frames.slice(s![frame, top..top + c, left..left + c]);
            values.extend(crop.iter().copied());
        }
        Tensor::from_data(TensorData::new(values, [batch, 1, c, c]), device)
    }
}

fn gray_values(image: DynamicImage) -> (usize, usize, Vec<f32>) {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let luma = |p: &Rgb<f32>| 0.2126 * p[0] + 0.7152 * p[1] + 0.0722 * p[2];
    let values = match image {
        DynamicImage::ImageRgb32F(buffer) => buffer.pixels().map(luma).collect(),
        DynamicImage::ImageRgba32F(buffer) => buffer
            .pixels()
            .map(|p| luma(&Rgb([p[0], p[1], p[2]])))
            .collect(),
        other => other.to_luma16().pixels().map(|p| p[0] as f32).collect(),
    };
    (height, width, values)
}

/// Writes each frame as a 32-bit float TIFF named `{prefix}_{index:04}.tif`.
///
/// The TIFF encoder has no single-channel float layout, so the value is stored
/// in all three channels. [`FrameStack::from_dir`] reads it back unchanged.
pub fn save_frames_f32(frames: ArrayView3<'_, f32>, dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let (_, height, width) = frames.dim();

    let mut written = Vec::with_capacity(frames.shape()[0]);
    for (i, frame) in frames.axis_iter(Axis(0)).enumerate() {
        let pixels: Vec<f32> = frame.iter().flat_map(|&v| [v, v, v]).collect();
        let buffer = ImageBuffer::<Rgb<f32>, Vec<f32>>::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| Error::shape(format!("frame {i} does not fill a {height}x{width} image")))?;
        let path = dir.join(format!("{prefix}_{i:04}.tif"));
        buffer.save(&path)?;
        written.push(path);
    }
    info!(count = written.len(), "wrote float frames to {}", dir.display());
    Ok(written)
}

/// Writes each frame as a 16-bit grayscale PNG named `{prefix}_{index:04}.png`.
///
/// Values are rounded and clamped to the 16-bit range, so sub-count detail is
/// lost; use [`save_frames_f32`] to keep it.
pub fn save_frames_u16(frames: ArrayView3<'_, f32>, dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let (_, height, width) = frames.dim();

    let mut written = Vec::with_capacity(frames.shape()[0]);
    for (i, frame) in frames.axis_iter(Axis(0)).enumerate() {
        let pixels: Vec<u16> = frame
            .iter()
            .map(|v| v.round().clamp(0.0, u16::MAX as f32) as u16)
            .collect();
        let buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| Error::shape(format!("frame {i} does not fill a {height}x{width} image")))?;
        let path = dir.join(format!("{prefix}_{i:04}.png"));
        buffer.save(&path)?;
        written.push(path);
    }
    info!(count = written.len(), "wrote frames to {}", dir.display());
    Ok(written)
}
