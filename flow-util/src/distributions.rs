use crate::bijector::{Bijector, IdentityBijector, SigmoidBoxBijector};
use crate::loss_functions::LN_2PI;
use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::sync::Arc;

/// Where a distribution puts its mass
#[derive(Clone, Debug, PartialEq)]
pub enum Support {
    Real,
    Box { lo: Vec<f32>, hi: Vec<f32> },
}

impl Support {
    pub fn contains(&self, theta: &[f32]) -> bool {
        match self {
            Support::Real => true,
            Support::Box { lo, hi } => {
                theta.len() == lo.len()
                    && theta
                        .iter()
                        .zip(lo.iter().zip(hi.iter()))
                        .all(|(t, (l, h))| *l <= *t && *t <= *h)
            }
        }
    }

    /// The bijection from unconstrained space onto this support
    pub fn bijector(&self, device: &Device) -> Result<Arc<dyn Bijector>> {
        Ok(match self {
            Support::Real => Arc::new(IdentityBijector),
            Support::Box { lo, hi } => Arc::new(SigmoidBoxBijector::new(lo, hi, device)?),
        })
    }
}

/// A distribution over parameter vectors that can be sampled and whose
/// density can be evaluated.
pub trait Distribution: Send + Sync {
    /// dimensionality of a draw
    fn dim(&self) -> usize;

    /// `n` i.i.d. draws, shape (n, dim)
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Result<Tensor>;

    /// log-density of each row of `theta_nd`, shape (n,)
    fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor>;

    fn support(&self) -> Support {
        Support::Real
    }
}

/// Standard normal draws as an (n, d) tensor
pub fn randn_tensor(n: usize, d: usize, rng: &mut impl Rng, device: &Device) -> Result<Tensor> {
    let vals: Vec<f32> = (0..n * d).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(vals, (n, d), device)
}

/// Uniform draws on [0, 1) as an (n, d) tensor
pub fn rand_tensor(n: usize, d: usize, rng: &mut impl Rng, device: &Device) -> Result<Tensor> {
    let vals: Vec<f32> = (0..n * d).map(|_| rng.random::<f32>()).collect();
    Tensor::from_vec(vals, (n, d), device)
}

/// Uniform distribution on the box `[lo, hi]`
pub struct BoxUniform {
    lo: Vec<f32>,
    hi: Vec<f32>,
    lo_1d: Tensor,
    hi_1d: Tensor,
    log_volume: f64,
    device: Device,
}

impl BoxUniform {
    pub fn new(lo: Vec<f32>, hi: Vec<f32>, device: &Device) -> Result<Self> {
        if lo.is_empty() || lo.len() != hi.len() {
            candle_core::bail!("box bounds need matching, non-empty dimensions");
        }
        if lo.iter().zip(&hi).any(|(l, h)| !(h > l)) {
            candle_core::bail!("box bounds must satisfy lo < hi in every dimension");
        }
        let d = lo.len();
        let log_volume = lo.iter().zip(&hi).map(|(l, h)| ((h - l) as f64).ln()).sum();
        Ok(Self {
            lo_1d: Tensor::from_slice(&lo, (1, d), device)?,
            hi_1d: Tensor::from_slice(&hi, (1, d), device)?,
            lo,
            hi,
            log_volume,
            device: device.clone(),
        })
    }

    /// `[lo, hi]^dim`
    pub fn cube(dim: usize, lo: f32, hi: f32, device: &Device) -> Result<Self> {
        Self::new(vec![lo; dim], vec![hi; dim], device)
    }
}

impl Distribution for BoxUniform {
    fn dim(&self) -> usize {
        self.lo.len()
    }

    fn sample(&self, n: usize, rng: &mut SmallRng) -> Result<Tensor> {
        let u = rand_tensor(n, self.dim(), rng, &self.device)?;
        u.broadcast_mul(&(&self.hi_1d - &self.lo_1d)?)?
            .broadcast_add(&self.lo_1d)
    }

    /// `-ln(volume)` inside the box, `-inf` outside
    fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor> {
        let n = theta_nd.dim(0)?;
        let below = self.lo_1d.broadcast_sub(theta_nd)?.relu()?;
        let above = theta_nd.broadcast_sub(&self.hi_1d)?.relu()?;
        let outside = (below + above)?.sum(1)?.gt(0.)?;
        let inside_val = Tensor::full(-self.log_volume as f32, n, theta_nd.device())?
            .to_dtype(theta_nd.dtype())?;
        let outside_val = Tensor::full(f32::NEG_INFINITY, n, theta_nd.device())?
            .to_dtype(theta_nd.dtype())?;
        outside.where_cond(&outside_val, &inside_val)
    }

    fn support(&self) -> Support {
        Support::Box {
            lo: self.lo.clone(),
            hi: self.hi.clone(),
        }
    }
}

/// Gaussian with diagonal covariance
pub struct DiagGaussian {
    mean_1d: Tensor,
    std_1d: Tensor,
    dim: usize,
    log_norm: f64,
    device: Device,
}

impl DiagGaussian {
    pub fn new(mean: Vec<f32>, std: Vec<f32>, device: &Device) -> Result<Self> {
        if mean.is_empty() || mean.len() != std.len() {
            candle_core::bail!("mean and std need matching, non-empty dimensions");
        }
        if std.iter().any(|s| !(*s > 0.)) {
            candle_core::bail!("standard deviations must be positive");
        }
        let d = mean.len();
        // -0.5 * D * ln(2π) - sum ln σ
        let log_norm =
            -0.5 * d as f64 * LN_2PI - std.iter().map(|s| (*s as f64).ln()).sum::<f64>();
        Ok(Self {
            mean_1d: Tensor::from_vec(mean, (1, d), device)?,
            std_1d: Tensor::from_vec(std, (1, d), device)?,
            dim: d,
            log_norm,
            device: device.clone(),
        })
    }

    pub fn standard(dim: usize, device: &Device) -> Result<Self> {
        Self::new(vec![0.; dim], vec![1.; dim], device)
    }
}

impl Distribution for DiagGaussian {
    fn dim(&self) -> usize {
        self.dim
    }

    fn sample(&self, n: usize, rng: &mut SmallRng) -> Result<Tensor> {
        randn_tensor(n, self.dim, rng, &self.device)?
            .broadcast_mul(&self.std_1d)?
            .broadcast_add(&self.mean_1d)
    }

    fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor> {
        let z = theta_nd
            .broadcast_sub(&self.mean_1d.to_dtype(theta_nd.dtype())?)?
            .broadcast_div(&self.std_1d.to_dtype(theta_nd.dtype())?)?;
        (z.sqr()?.sum(1)? * (-0.5))? + self.log_norm
    }
}

/// Convert an (n, d) f32 tensor to rows on the host
pub fn to_rows(x_nd: &Tensor) -> Result<Vec<Vec<f32>>> {
    x_nd.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec2::<f32>()
}
