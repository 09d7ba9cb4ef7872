use candle_core::{Result, Tensor};

/// Columns with a smaller spread are left unscaled
const MIN_STD: f32 = 1e-6;

/// Column-wise z-scoring `z = (x - mean) / std` with statistics taken
/// from a training set.
#[derive(Clone, Debug)]
pub struct Standardizer {
    mean_1d: Tensor,
    std_1d: Tensor,
    log_std_sum: f64,
}

impl Standardizer {
    /// Estimate column means and standard deviations of `x_nd`
    pub fn fit(x_nd: &Tensor) -> Result<Self> {
        let (_, d) = x_nd.dims2()?;
        let mean_1d = x_nd.mean_keepdim(0)?;
        let var_1d = x_nd.broadcast_sub(&mean_1d)?.sqr()?.mean_keepdim(0)?;
        let std: Vec<f32> = var_1d
            .sqrt()?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|s| if s.is_finite() && s > MIN_STD { s } else { 1. })
            .collect();
        let log_std_sum = std.iter().map(|s| (*s as f64).ln()).sum();
        Ok(Self {
            mean_1d: mean_1d.detach(),
            std_1d: Tensor::from_vec(std, (1, d), x_nd.device())?,
            log_std_sum,
        })
    }

    pub fn transform(&self, x_nd: &Tensor) -> Result<Tensor> {
        x_nd.broadcast_sub(&self.mean_1d)?.broadcast_div(&self.std_1d)
    }

    pub fn inverse(&self, z_nd: &Tensor) -> Result<Tensor> {
        z_nd.broadcast_mul(&self.std_1d)?.broadcast_add(&self.mean_1d)
    }

    /// log|det dz/dx| = -sum_d ln std(d)
    pub fn log_abs_det(&self) -> f64 {
        -self.log_std_sum
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean_1d
    }

    pub fn std(&self) -> &Tensor {
        &self.std_1d
    }
}
