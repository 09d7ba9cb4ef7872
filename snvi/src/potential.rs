use crate::error::{Result, SbiError};
use crate::trainer::LikelihoodEstimator;
use candle_core::Tensor;
use flow_util::distributions::Distribution;

/// Unnormalized log-posterior at a fixed observation
pub trait Potential {
    fn dim(&self) -> usize;

    /// the observation this potential is conditioned on, shape (1, k)
    fn observation(&self) -> &Tensor;

    /// log-potential of each row of `theta_nd`, shape (n,); differentiable
    /// in `theta_nd`
    fn log_potential(&self, theta_nd: &Tensor) -> candle_core::Result<Tensor>;
}

/// `log q(x_o | θ) + log p(θ)` with a learned likelihood
pub struct LikelihoodPotential<'a> {
    estimator: &'a LikelihoodEstimator,
    prior: &'a dyn Distribution,
    x_o: Tensor,
}

impl<'a> LikelihoodPotential<'a> {
    pub fn new(
        estimator: &'a LikelihoodEstimator,
        prior: &'a dyn Distribution,
        x_o: &Tensor,
    ) -> Result<Self> {
        if prior.dim() != estimator.param_dim() {
            return Err(SbiError::DimensionMismatch {
                what: "prior",
                expected: estimator.param_dim(),
                got: prior.dim(),
            });
        }
        let x_o = x_o.flatten_all()?;
        if x_o.elem_count() != estimator.obs_dim() {
            return Err(SbiError::DimensionMismatch {
                what: "observation",
                expected: estimator.obs_dim(),
                got: x_o.elem_count(),
            });
        }
        let x_o = x_o.reshape((1, estimator.obs_dim()))?;
        Ok(Self {
            estimator,
            prior,
            x_o,
        })
    }
}

impl Potential for LikelihoodPotential<'_> {
    fn dim(&self) -> usize {
        self.prior.dim()
    }

    fn observation(&self) -> &Tensor {
        &self.x_o
    }

    fn log_potential(&self, theta_nd: &Tensor) -> candle_core::Result<Tensor> {
        let llik = self.estimator.log_prob(&self.x_o, theta_nd)?;
        llik + self.prior.log_prob(theta_nd)?
    }
}
