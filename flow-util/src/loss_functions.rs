use candle_core::{Result, Tensor};

/// ln(2π)
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Standard normal log-density summed over the last dimension
///
/// log N(z; 0, I) = -0.5 * sum_d [ z(d)^2 + ln(2π) ]
///
/// * `z_nd` - (n, D)
///
pub fn std_normal_log_prob(z_nd: &Tensor) -> Result<Tensor> {
    let d = z_nd.dim(z_nd.rank() - 1)? as f64;
    (z_nd.sqr()?.sum(z_nd.rank() - 1)? * (-0.5))? - 0.5 * d * LN_2PI
}

/// softplus(x) = ln(1 + exp(x)), computed as relu(x) + ln(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

/// ln σ(x) = -softplus(-x)
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    softplus(&x.neg()?)?.neg()
}

/// Numerically stable `ln sum_j exp(x[.., j])` over the last dimension
pub fn log_sum_exp(x_nk: &Tensor) -> Result<Tensor> {
    let last = x_nk.rank() - 1;
    let max_n1 = x_nk.max_keepdim(last)?.detach();
    let shifted = x_nk.broadcast_sub(&max_n1)?;
    shifted.exp()?.sum_keepdim(last)?.log()?.add(&max_n1)?.squeeze(last)
}
