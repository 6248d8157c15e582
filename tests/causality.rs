//! Exhaustive leak check of the noise model on a small image.

use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor, TensorData};
use ladder_denoise::noise_model::{MixtureParams, NoiseModel};
use ladder_denoise::sampling::tensor_to_vec;
use ladder_denoise::{NoiseModelConfig, NoiseOrientation};

type TestBackend = NdArray<f32>;

const H: usize = 5;
const W: usize = 6;

fn flatten(params: MixtureParams<TestBackend>) -> Vec<Vec<f32>> {
    [params.log_weights, params.means, params.scales]
        .into_iter()
        .map(|t| tensor_to_vec(t).unwrap())
        .collect()
}

/// Pixels (row, col) whose parameters differ between two evaluations.
fn changed(a: &[Vec<f32>], b: &[Vec<f32>], k: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for r in 0..H {
        for c in 0..W {
            let differs = a.iter().zip(b).any(|(ta, tb)| {
                (0..k).any(|j| {
                    let i = (j * H + r) * W + c;
                    (ta[i] - tb[i]).abs() > 1e-6
                })
            });
            if differs {
                out.push((r, c));
            }
        }
    }
    out
}

fn config(orientation: NoiseOrientation) -> NoiseModelConfig {
    NoiseModelConfig::new()
        .with_s_code_channels(3)
        .with_hidden_channels(6)
        .with_kernel_size(2)
        .with_n_layers(3)
        .with_n_gaussians(2)
        .with_orientation(orientation)
}

fn check(orientation: NoiseOrientation, allowed: impl Fn((usize, usize), (usize, usize)) -> bool) {
    let device = Default::default();
    let config = config(orientation);
    let model = NoiseModel::<TestBackend>::new(&config, &device).unwrap();

    let x = Tensor::<TestBackend, 4>::random([1, 1, H, W], Distribution::Normal(0.0, 1.0), &device);
    let s = Tensor::<TestBackend, 4>::random([1, 3, H, W], Distribution::Normal(0.0, 1.0), &device);
    let base = flatten(model.forward(x.clone(), s.clone()).unwrap());
    let values = tensor_to_vec(x).unwrap();

    for r in 0..H {
        for c in 0..W {
            let mut moved = values.clone();
            moved[r * W + c] -= 3.0;
            let x = Tensor::from_data(TensorData::new(moved, [1, 1, H, W]), &device);
            let params = flatten(model.forward(x, s.clone()).unwrap());
            for pixel in changed(&base, &params, 2) {
                assert!(
                    allowed((r, c), pixel),
                    "{orientation:?}: perturbing {:?} changed {:?}",
                    (r, c),
                    pixel
                );
            }
        }
    }
}

#[test]
fn horizontal_predictions_never_see_the_current_or_later_pixels() {
    check(NoiseOrientation::Horizontal, |(r, c), (pr, pc)| pr == r && pc > c);
}

#[test]
fn vertical_predictions_never_see_the_current_or_lower_pixels() {
    check(NoiseOrientation::Vertical, |(r, c), (pr, pc)| pc == c && pr > r);
}

#[test]
fn receptive_field_bounds_the_influence() {
    let rf = config(NoiseOrientation::Horizontal).receptive_field();
    assert!(rf < W - 1);
    check(NoiseOrientation::Horizontal, move |(r, c), (pr, pc)| {
        pr == r && pc > c && pc - c <= rf
    });
}
