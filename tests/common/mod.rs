#![allow(dead_code)]

use ladder_denoise::{DenoiserConfig, LadderConfig, NoiseModelConfig, SignalDecoderConfig};
use ndarray::Array3;

/// A ladder small enough for CPU tests.
pub fn small_config(downsampling: Vec<usize>) -> DenoiserConfig {
    let n = downsampling.len();
    DenoiserConfig::new(
        LadderConfig::new(n, vec![4; n], downsampling).with_hidden_channels(8),
        NoiseModelConfig::new()
            .with_hidden_channels(8)
            .with_kernel_size(3)
            .with_n_layers(2),
        SignalDecoderConfig::new()
            .with_hidden_channels(8)
            .with_n_res_blocks(1),
    )
    .with_s_code_channels(4)
}

/// Raw frames with a smooth signal plus row-constant offsets.
pub fn striped_frames(n: usize, height: usize, width: usize) -> Array3<f32> {
    Array3::from_shape_fn((n, height, width), |(f, r, c)| {
        let signal = 400.0 + 50.0 * ((r as f32 * 0.4).sin() + (c as f32 * 0.3).cos());
        let stripe = ((r * 7 + f * 3) % 5) as f32 * 8.0;
        signal + stripe
    })
}
