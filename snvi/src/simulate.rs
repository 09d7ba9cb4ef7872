use crate::error::{Result, SbiError};
use candle_core::Tensor;
use flow_util::distributions::{to_rows, Distribution};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Forward model θ → x
///
/// The simulator may be stochastic; it gets its own RNG per draw so that
/// a batch is reproducible no matter how draws are scheduled.
pub trait Simulator: Sync {
    /// dimensionality of θ
    fn param_dim(&self) -> usize;

    /// whether the simulator accepts θ
    fn in_support(&self, _theta: &[f32]) -> bool {
        true
    }

    fn simulate(&self, theta: &[f32], rng: &mut SmallRng) -> anyhow::Result<Vec<f32>>;
}

/// Wrap a closure as a [`Simulator`]
pub struct FnSimulator<F> {
    param_dim: usize,
    func: F,
}

impl<F> FnSimulator<F>
where
    F: Fn(&[f32], &mut SmallRng) -> anyhow::Result<Vec<f32>> + Sync,
{
    pub fn new(param_dim: usize, func: F) -> Self {
        Self { param_dim, func }
    }
}

impl<F> Simulator for FnSimulator<F>
where
    F: Fn(&[f32], &mut SmallRng) -> anyhow::Result<Vec<f32>> + Sync,
{
    fn param_dim(&self) -> usize {
        self.param_dim
    }

    fn simulate(&self, theta: &[f32], rng: &mut SmallRng) -> anyhow::Result<Vec<f32>> {
        (self.func)(theta, rng)
    }
}

/// Paired parameter draws and simulated observations, row-aligned
#[derive(Clone, Debug)]
pub struct SimulationBatch {
    theta: Tensor,
    x: Tensor,
}

impl SimulationBatch {
    /// * `theta` - (n, d) parameters
    /// * `x` - (n, k) observations
    pub fn new(theta: Tensor, x: Tensor) -> Result<Self> {
        let (n_theta, _) = theta.dims2()?;
        let (n_x, _) = x.dims2()?;
        if n_theta != n_x {
            return Err(SbiError::DimensionMismatch {
                what: "batch row",
                expected: n_theta,
                got: n_x,
            });
        }
        Ok(Self { theta, x })
    }

    pub fn len(&self) -> usize {
        self.theta.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn param_dim(&self) -> usize {
        self.theta.dims()[1]
    }

    pub fn obs_dim(&self) -> usize {
        self.x.dims()[1]
    }

    pub fn theta(&self) -> &Tensor {
        &self.theta
    }

    pub fn x(&self) -> &Tensor {
        &self.x
    }
}

/// Draw `n` parameters from `proposal` and simulate each of them.
///
/// Fails as a whole: the first failing draw (in draw order) is reported
/// and no partial batch is returned. A draw whose observation holds NaN
/// or infinity counts as failed. Holds no state between calls.
pub fn run<S, P>(
    simulator: &S,
    proposal: &P,
    n: usize,
    rng: &mut SmallRng,
) -> Result<SimulationBatch>
where
    S: Simulator + ?Sized,
    P: Distribution + ?Sized,
{
    if n == 0 {
        return Err(SbiError::InvalidConfig(
            "number of simulations must be positive".into(),
        ));
    }

    let theta = proposal
        .sample(n, rng)
        .map_err(|e| SbiError::InvalidProposal(e.to_string()))?;

    let dims = theta.dims().to_vec();
    if dims != [n, simulator.param_dim()] {
        return Err(SbiError::InvalidProposal(format!(
            "expected draws of shape [{}, {}], got {:?}",
            n,
            simulator.param_dim(),
            dims
        )));
    }

    let theta_rows = to_rows(&theta)?;
    if let Some(i) = theta_rows
        .iter()
        .position(|t| t.iter().any(|v| !v.is_finite()) || !simulator.in_support(t))
    {
        return Err(SbiError::InvalidProposal(format!(
            "draw {} is outside the simulator's parameter support: {:?}",
            i, theta_rows[i]
        )));
    }

    let seeds: Vec<u64> = (0..n).map(|_| rng.random()).collect();

    let outputs: Vec<anyhow::Result<Vec<f32>>> = theta_rows
        .par_iter()
        .zip(seeds.par_iter())
        .map(|(theta_i, &seed)| {
            let mut draw_rng = SmallRng::seed_from_u64(seed);
            simulator.simulate(theta_i, &mut draw_rng)
        })
        .collect();

    let mut obs_dim: Option<usize> = None;
    let mut x_flat = Vec::with_capacity(n * 4);
    for (i, out) in outputs.into_iter().enumerate() {
        let x_i = out.map_err(|e| SbiError::Simulator {
            index: i,
            message: format!("{:#}", e),
        })?;
        match obs_dim {
            None if x_i.is_empty() => {
                return Err(SbiError::Simulator {
                    index: i,
                    message: "empty observation".into(),
                });
            }
            None => obs_dim = Some(x_i.len()),
            Some(k) if k != x_i.len() => {
                return Err(SbiError::Simulator {
                    index: i,
                    message: format!("observation of length {} after length {}", x_i.len(), k),
                });
            }
            _ => {}
        }
        if x_i.iter().any(|v| !v.is_finite()) {
            return Err(SbiError::Simulator {
                index: i,
                message: format!("non-finite observation {:?}", x_i),
            });
        }
        x_flat.extend(x_i);
    }

    let k = obs_dim.unwrap_or_default();
    let x = Tensor::from_vec(x_flat, (n, k), theta.device())?;
    SimulationBatch::new(theta, x)
}
