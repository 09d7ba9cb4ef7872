use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Mean-field Gaussian q(y) = N(μ, diag(σ²)) written as the affine map
/// `y = μ + σ ⊙ z` of a standard normal `z`.
///
/// Parameters are stored as mean μ and log standard deviation ln(σ).
pub struct GaussianVar {
    /// Variational mean μ: shape (1, d)
    mean: Tensor,
    /// Log standard deviation ln(σ): shape (1, d)
    ln_std: Tensor,
}

impl GaussianVar {
    /// Create a new Gaussian variational distribution.
    ///
    /// # Arguments
    /// * `vb` - VarBuilder for creating trainable parameters
    /// * `dim` - Number of parameters
    ///
    /// # Returns
    /// GaussianVar with μ = 0 and ln σ = 0 (σ = 1)
    pub fn new(vb: VarBuilder, dim: usize) -> Result<Self> {
        let mean = vb.get_with_hints((1, dim), "mean", candle_nn::Init::Const(0.0))?;
        let ln_std = vb.get_with_hints((1, dim), "ln_std", candle_nn::Init::Const(0.0))?;
        Ok(Self { mean, ln_std })
    }

    /// Get the variational mean μ.
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Get the variational standard deviation σ = exp(ln_std).
    pub fn std(&self) -> Result<Tensor> {
        self.ln_std.exp()
    }

    /// `z → y = μ + σ ⊙ z`; returns `(y, log|det dy/dz|)`
    pub fn forward(&self, z_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = z_nd.dim(0)?;
        let y = z_nd
            .broadcast_mul(&self.ln_std.exp()?)?
            .broadcast_add(&self.mean)?;
        let ld = self.ln_std.sum_all()?.broadcast_as(n)?;
        Ok((y, ld))
    }

    /// `y → z = (y - μ) / σ`; returns `(z, log|det dz/dy|)`
    pub fn inverse(&self, y_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = y_nd.dim(0)?;
        let z = y_nd
            .broadcast_sub(&self.mean)?
            .broadcast_mul(&self.ln_std.neg()?.exp()?)?;
        let ld = self.ln_std.sum_all()?.neg()?.broadcast_as(n)?;
        Ok((z, ld))
    }
}
