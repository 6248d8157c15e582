use burn::tensor::{backend::Backend, Tensor};

const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// Elementwise KL(N(mu_q, exp(logvar_q)) || N(mu_p, exp(logvar_p))).
pub fn gaussian_kl<B: Backend, const D: usize>(
    mu_q: Tensor<B, D>,
    logvar_q: Tensor<B, D>,
    mu_p: Tensor<B, D>,
    logvar_p: Tensor<B, D>,
) -> Tensor<B, D> {
    let var_ratio = (logvar_q.clone() - logvar_p.clone()).exp();
    let mean_term = (mu_q - mu_p).powf_scalar(2.0) * logvar_p.clone().neg().exp();
    (logvar_p - logvar_q + var_ratio + mean_term)
        .sub_scalar(1.0)
        .mul_scalar(0.5)
}

/// Elementwise KL(N(mu, exp(logvar)) || N(0, 1)).
pub fn standard_normal_kl<B: Backend, const D: usize>(
    mu: Tensor<B, D>,
    logvar: Tensor<B, D>,
) -> Tensor<B, D> {
    (mu.powf_scalar(2.0) + logvar.clone().exp() - logvar)
        .sub_scalar(1.0)
        .mul_scalar(0.5)
}

/// Elementwise log N(x; mean, scale^2).
pub fn gaussian_log_prob<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    mean: Tensor<B, D>,
    scale: Tensor<B, D>,
) -> Tensor<B, D> {
    let z = (x - mean) / scale.clone();
    z.powf_scalar(2.0).mul_scalar(-0.5) - scale.log() - HALF_LN_2PI
}

/// Numerically stable log(sum(exp(x))) along `dim`, keeping the dimension.
pub fn log_sum_exp<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let max = x.clone().max_dim(dim).detach();
    (x - max.clone()).exp().sum_dim(dim).log() + max
}
