use crate::loss_functions::log_sigmoid;
use candle_core::{Device, Result, Tensor};

/// Smallest distance kept from a box boundary when mapping back to the
/// unconstrained space
const BOUNDARY_EPS: f64 = 1e-6;

/// Bijection between an unconstrained space and the support of a
/// parameter distribution.
pub trait Bijector: Send + Sync {
    /// unconstrained `y` (n, D) to constrained `θ`; returns `(θ, log|det dθ/dy|)`
    fn forward(&self, y_nd: &Tensor) -> Result<(Tensor, Tensor)>;

    /// constrained `θ` to unconstrained `y`; returns `(y, log|det dy/dθ|)`
    fn inverse(&self, theta_nd: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Unbounded support; the transform does nothing
pub struct IdentityBijector;

impl Bijector for IdentityBijector {
    fn forward(&self, y_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let ld = Tensor::zeros(y_nd.dim(0)?, y_nd.dtype(), y_nd.device())?;
        Ok((y_nd.clone(), ld))
    }

    fn inverse(&self, theta_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        self.forward(theta_nd)
    }
}

/// `θ = lo + (hi - lo) * σ(y)` onto the box `[lo, hi]`
pub struct SigmoidBoxBijector {
    lo_1d: Tensor,
    width_1d: Tensor,
    log_width_sum: f64,
}

impl SigmoidBoxBijector {
    pub fn new(lo: &[f32], hi: &[f32], device: &Device) -> Result<Self> {
        if lo.len() != hi.len() || lo.iter().zip(hi).any(|(l, h)| !(h > l)) {
            candle_core::bail!("box bounds must satisfy lo < hi in every dimension");
        }
        let d = lo.len();
        let width: Vec<f32> = lo.iter().zip(hi).map(|(l, h)| h - l).collect();
        let log_width_sum = width.iter().map(|w| (*w as f64).ln()).sum();
        Ok(Self {
            lo_1d: Tensor::from_slice(lo, (1, d), device)?,
            width_1d: Tensor::from_vec(width, (1, d), device)?,
            log_width_sum,
        })
    }
}

impl Bijector for SigmoidBoxBijector {
    fn forward(&self, y_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let log_s = log_sigmoid(y_nd)?;
        let log_1ms = log_sigmoid(&y_nd.neg()?)?;
        let theta = log_s
            .exp()?
            .broadcast_mul(&self.width_1d)?
            .broadcast_add(&self.lo_1d)?;
        // dθ/dy = width * σ(y) * (1 - σ(y))
        let ld = ((log_s + log_1ms)?.sum(1)? + self.log_width_sum)?;
        Ok((theta, ld))
    }

    fn inverse(&self, theta_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let u = theta_nd
            .broadcast_sub(&self.lo_1d)?
            .broadcast_div(&self.width_1d)?
            .clamp(BOUNDARY_EPS, 1. - BOUNDARY_EPS)?;
        let log_u = u.log()?;
        let log_1mu = u.neg()?.affine(1., 1.)?.log()?;
        let y = (&log_u - &log_1mu)?;
        let ld = ((log_u + log_1mu)?.sum(1)? + self.log_width_sum)?.neg()?;
        Ok((y, ld))
    }
}
