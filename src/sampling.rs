//! One RNG stream per batch element, so draws never depend on batch composition.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Mixes a base seed with two indices into a stream seed (splitmix64 finalizer).
pub fn stream_seed(seed: u64, major: u64, minor: u64) -> u64 {
    let mut z = seed
        .wrapping_add(major.wrapping_mul(GOLDEN_GAMMA))
        .wrapping_add(minor.wrapping_add(1).wrapping_mul(GOLDEN_GAMMA.rotate_left(17)));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// One independent random stream per batch element.
#[derive(Debug, Clone)]
pub struct SampleStreams {
    rngs: Vec<StdRng>,
}

impl SampleStreams {
    /// `batch` streams derived from a single seed.
    pub fn seeded(seed: u64, batch: usize) -> Self {
        let rngs = (0..batch)
            .map(|i| StdRng::seed_from_u64(stream_seed(seed, 0, i as u64)))
            .collect();
        Self { rngs }
    }

    /// Streams for samples `samples` of image `image` in an inference ensemble.
    pub fn for_ensemble(seed: u64, image: usize, samples: std::ops::Range<usize>) -> Self {
        let rngs = samples
            .map(|s| StdRng::seed_from_u64(stream_seed(seed, image as u64 + 1, s as u64)))
            .collect();
        Self { rngs }
    }

    pub fn from_rngs(rngs: Vec<StdRng>) -> Self {
        Self { rngs }
    }

    pub fn len(&self) -> usize {
        self.rngs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rngs.is_empty()
    }

    /// Standard-normal tensor whose `i`-th batch slice comes from stream `i`.
    pub fn standard_normal<B: Backend>(
        &mut self,
        shape: [usize; 4],
        device: &B::Device,
    ) -> Result<Tensor<B, 4>> {
        let [batch, channels, height, width] = shape;
        if batch != self.rngs.len() {
            return Err(Error::shape(format!(
                "requested {batch} batch elements from {} streams",
                self.rngs.len()
            )));
        }
        let per_element = channels * height * width;
        let mut values = Vec::with_capacity(batch * per_element);
        for rng in self.rngs.iter_mut() {
            values.extend((0..per_element).map(|_| rng.sample::<f32, _>(StandardNormal)));
        }
        Ok(Tensor::from_data(TensorData::new(values, shape), device))
    }

    /// `per_stream` uniform draws in `[0, 1)` from each stream, stream-major.
    pub fn uniform(&mut self, per_stream: usize) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.rngs.len() * per_stream);
        for rng in self.rngs.iter_mut() {
            values.extend((0..per_stream).map(|_| rng.gen::<f32>()));
        }
        values
    }
}

/// Copies a tensor to the host as `f32`, whatever the backend's float type.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::shape(format!("cannot read tensor data: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn draw(streams: &mut SampleStreams, shape: [usize; 4]) -> Vec<f32> {
        let device = Default::default();
        streams
            .standard_normal::<TestBackend>(shape, &device)
            .unwrap()
            .into_data()
            .to_vec()
            .unwrap()
    }

    #[test]
    fn same_seed_same_draws() {
        let a = draw(&mut SampleStreams::seeded(7, 3), [3, 2, 4, 4]);
        let b = draw(&mut SampleStreams::seeded(7, 3), [3, 2, 4, 4]);
        assert_eq!(a, b);
    }

    #[test]
    fn consecutive_draws_differ() {
        let mut streams = SampleStreams::seeded(7, 1);
        let first = draw(&mut streams, [1, 1, 4, 4]);
        let second = draw(&mut streams, [1, 1, 4, 4]);
        assert_ne!(first, second);
    }

    #[test]
    fn ensemble_streams_ignore_chunking() {
        let whole = draw(&mut SampleStreams::for_ensemble(3, 5, 0..4), [4, 1, 3, 3]);
        let mut chunked = draw(&mut SampleStreams::for_ensemble(3, 5, 0..2), [2, 1, 3, 3]);
        chunked.extend(draw(&mut SampleStreams::for_ensemble(3, 5, 2..4), [2, 1, 3, 3]));
        assert_eq!(whole, chunked);
    }

    #[test]
    fn different_images_get_different_streams() {
        let a = draw(&mut SampleStreams::for_ensemble(3, 0, 0..1), [1, 1, 4, 4]);
        let b = draw(&mut SampleStreams::for_ensemble(3, 1, 0..1), [1, 1, 4, 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn batch_must_match_stream_count() {
        let device = Default::default();
        let mut streams = SampleStreams::seeded(0, 2);
        let result = streams.standard_normal::<TestBackend>([3, 1, 2, 2], &device);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn uniform_draws_are_stream_major() {
        let mut whole = SampleStreams::seeded(5, 2);
        let both = whole.uniform(3);
        assert_eq!(both.len(), 6);
        assert!(both.iter().all(|u| (0.0..1.0).contains(u)));

        let mut first = SampleStreams::from_rngs(vec![StdRng::seed_from_u64(stream_seed(5, 0, 0))]);
        assert_eq!(first.uniform(3), both[..3].to_vec());
    }

    #[test]
    fn draws_look_standard_normal() {
        let values = draw(&mut SampleStreams::seeded(11, 1), [1, 1, 100, 100]);
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }
}
