use crate::config::{Divergence, VariationalConfig, VariationalFamily};
use crate::diagnostics::psis_khat;
use crate::error::{Result, SbiError};
use crate::potential::Potential;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use flow_util::bijector::Bijector;
use flow_util::distributions::{randn_tensor, Distribution, Support};
use flow_util::flow::{AutoregressiveFlow, AutoregressiveFlowArgs};
use flow_util::loss_functions::{log_sum_exp, std_normal_log_prob};
use flow_util::params::reinit_varmap;
use flow_util::variational_gaussian::GaussianVar;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;

const INIT_OUT_SCALE: f64 = 0.1;
const KHAT_WARN: f64 = 0.7;
const OBSERVATION_RTOL: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PosteriorState {
    Unfit,
    Fitting,
    Fitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// the loss plateaued
    Converged,
    /// `max_iters` reached first
    BudgetExhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub iterations: usize,
    /// mean divergence estimate over the last plateau window
    pub final_loss: f32,
    pub termination: Termination,
    /// Pareto k̂ of `potential - log q`; lower is better
    pub quality_khat: Option<f64>,
    pub loss_trace: Vec<f32>,
}

/// Trainable layers mapping standard-normal noise to the unconstrained
/// space
enum FamilyModule {
    MeanField(GaussianVar),
    Flow(AutoregressiveFlow),
}

impl FamilyModule {
    fn new(family: &VariationalFamily, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match family {
            VariationalFamily::MeanField => FamilyModule::MeanField(GaussianVar::new(vb, dim)?),
            VariationalFamily::Autoregressive {
                num_transforms,
                hidden_features,
            } => {
                let args = AutoregressiveFlowArgs {
                    dim,
                    context_dim: 0,
                    hidden_features: *hidden_features,
                    num_transforms: *num_transforms,
                    num_blocks: 2,
                };
                FamilyModule::Flow(AutoregressiveFlow::new(&args, vb)?)
            }
        })
    }

    /// noise `z` to unconstrained `y`, with `log |dy/dz|`
    fn forward(&self, z_nd: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        match self {
            FamilyModule::MeanField(q) => q.forward(z_nd),
            FamilyModule::Flow(f) => f.forward(z_nd, None),
        }
    }

    /// unconstrained `y` to noise `z`, with `log |dz/dy|`
    fn inverse(&self, y_nd: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        match self {
            FamilyModule::MeanField(q) => q.inverse(y_nd),
            FamilyModule::Flow(f) => f.inverse(y_nd, None),
        }
    }
}

struct Fitted {
    module: FamilyModule,
    varmap: VarMap,
    x_o: Tensor,
    report: FitReport,
}

/// Parametric approximation `q(θ)` of the posterior at one observation.
///
/// Noise `z ~ N(0, I)` is pushed through the family's layers into the
/// unconstrained space and then through a bijection onto the prior's
/// support. `fit` never mutates the receiver; it returns a new, fitted
/// posterior.
pub struct VariationalPosterior {
    dim: usize,
    family: VariationalFamily,
    transform: Arc<dyn Bijector>,
    support: Support,
    device: Device,
    state: PosteriorState,
    fitted: Option<Fitted>,
}

impl VariationalPosterior {
    /// * `prior` - decides dimension and support
    /// * `transform` - unconstrained space to parameter space; derived from
    ///   the prior's support when `None`
    pub fn new(
        prior: &dyn Distribution,
        family: VariationalFamily,
        transform: Option<Arc<dyn Bijector>>,
        device: &Device,
    ) -> Result<Self> {
        let support = prior.support();
        let transform = match transform {
            Some(t) => t,
            None => support.bijector(device)?,
        };
        Ok(Self {
            dim: prior.dim(),
            family,
            transform,
            support,
            device: device.clone(),
            state: PosteriorState::Unfit,
            fitted: None,
        })
    }

    pub fn state(&self) -> PosteriorState {
        self.state
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn report(&self) -> Option<&FitReport> {
        self.fitted.as_ref().map(|f| &f.report)
    }

    pub fn observation(&self) -> Option<&Tensor> {
        self.fitted.as_ref().map(|f| &f.x_o)
    }

    /// number of trained variational parameters; 0 before fitting
    pub fn num_parameters(&self) -> usize {
        self.fitted.as_ref().map_or(0, |f| {
            f.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
        })
    }

    /// Minimize `divergence` between `q` and the normalized `potential`
    /// over fresh variational parameters.
    ///
    /// Stops at `max_iters` or when the mean loss of two consecutive
    /// windows differs by less than `plateau_tol` (relative), whichever
    /// comes first.
    pub fn fit(
        &self,
        potential: &dyn Potential,
        divergence: Divergence,
        config: &VariationalConfig,
    ) -> Result<VariationalPosterior> {
        config.validate()?;
        if potential.dim() != self.dim {
            return Err(SbiError::DimensionMismatch {
                what: "potential",
                expected: self.dim,
                got: potential.dim(),
            });
        }
        if let Divergence::ImportanceWeighted { k: 0 } = divergence {
            return Err(SbiError::InvalidConfig(
                "importance-weighted divergence needs k >= 1".into(),
            ));
        }

        let mut next = VariationalPosterior {
            dim: self.dim,
            family: self.family.clone(),
            transform: self.transform.clone(),
            support: self.support.clone(),
            device: self.device.clone(),
            state: PosteriorState::Fitting,
            fitted: None,
        };

        let mut rng = SmallRng::seed_from_u64(config.seed);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let module = FamilyModule::new(&self.family, self.dim, vb.pp("posterior"))?;
        reinit_varmap(&varmap, INIT_OUT_SCALE, &mut rng)?;

        let mut adam = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.,
                ..Default::default()
            },
        )?;

        let pb = ProgressBar::new(config.max_iters as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let window = config.plateau_window;
        let mut loss_trace: Vec<f32> = vec![];
        let mut termination = Termination::BudgetExhausted;

        for iteration in 1..=config.max_iters {
            let loss = next.divergence_loss(&module, potential, divergence, config, &mut rng)?;
            let loss_val = loss.to_scalar::<f32>()?;
            if !loss_val.is_finite() {
                pb.finish_and_clear();
                return Err(SbiError::OptimizationDivergence { iteration });
            }
            adam.backward_step(&loss)?;
            loss_trace.push(loss_val);
            pb.inc(1);

            if config.verbose && iteration % 50 == 0 {
                info!("[{}] divergence: {:.4}", iteration, loss_val);
            }

            if iteration >= config.min_iters && loss_trace.len() >= 2 * window {
                let len = loss_trace.len();
                let prev = window_mean(&loss_trace[len - 2 * window..len - window]);
                let last = window_mean(&loss_trace[len - window..]);
                if (last - prev).abs() <= config.plateau_tol * last.abs().max(1.) {
                    debug!(
                        "loss plateau at iteration {}: {:.5} -> {:.5}",
                        iteration, prev, last
                    );
                    termination = Termination::Converged;
                    break;
                }
            }
        }
        pb.finish_and_clear();

        let tail = &loss_trace[loss_trace.len().saturating_sub(window)..];
        let final_loss = window_mean(tail) as f32;

        let quality_khat = if config.quality_samples > 0 {
            let log_weights = next.log_importance_weights(
                &module,
                potential,
                config.quality_samples,
                &mut rng,
            )?;
            psis_khat(&log_weights)
        } else {
            None
        };

        if let Some(k) = quality_khat.filter(|k| *k > KHAT_WARN) {
            warn!(
                "variational posterior may be unreliable: Pareto k̂ = {:.2} > {}",
                k, KHAT_WARN
            );
        }

        let report = FitReport {
            iterations: loss_trace.len(),
            final_loss,
            termination,
            quality_khat,
            loss_trace,
        };
        next.fitted = Some(Fitted {
            module,
            varmap,
            x_o: potential.observation().detach(),
            report,
        });
        next.state = PosteriorState::Fitted;

        if let Some(report) = next.report() {
            info!(
                "variational posterior ({} parameters): {:?} after {} iterations, loss {:.4}, k̂ {:?}",
                next.num_parameters(),
                report.termination,
                report.iterations,
                report.final_loss,
                report.quality_khat
            );
        }
        Ok(next)
    }

    /// Reparameterized draws `θ = T(f(z))` with their log-density
    fn rsample(
        &self,
        module: &FamilyModule,
        n: usize,
        rng: &mut SmallRng,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let z = randn_tensor(n, self.dim, rng, &self.device)?;
        let (y, ld_module) = module.forward(&z)?;
        let (theta, ld_transform) = self.transform.forward(&y)?;
        let log_q = ((std_normal_log_prob(&z)? - ld_module)? - ld_transform)?;
        Ok((theta, log_q))
    }

    fn divergence_loss(
        &self,
        module: &FamilyModule,
        potential: &dyn Potential,
        divergence: Divergence,
        config: &VariationalConfig,
        rng: &mut SmallRng,
    ) -> Result<Tensor> {
        let m = config.num_particles;
        Ok(match divergence {
            Divergence::ReverseKl => {
                let (theta, log_q) = self.rsample(module, m, rng)?;
                let log_p = potential.log_potential(&theta)?;
                (log_q - log_p)?.mean_all()?
            }
            Divergence::ImportanceWeighted { k } => {
                let (theta, log_q) = self.rsample(module, m * k, rng)?;
                let log_p = potential.log_potential(&theta)?;
                let log_w = (log_p - log_q)?.reshape((m, k))?;
                let bound = (log_sum_exp(&log_w)? - (k as f64).ln())?;
                bound.mean_all()?.neg()?
            }
        })
    }

    fn log_importance_weights(
        &self,
        module: &FamilyModule,
        potential: &dyn Potential,
        n: usize,
        rng: &mut SmallRng,
    ) -> Result<Vec<f64>> {
        let (theta, log_q) = self.rsample(module, n, rng)?;
        let log_p = potential.log_potential(&theta.detach())?;
        let log_w = (log_p - log_q)?.detach().to_dtype(DType::F64)?;
        Ok(log_w.to_vec1::<f64>()?)
    }

    fn fitted(&self) -> Result<&Fitted> {
        match (self.state, self.fitted.as_ref()) {
            (PosteriorState::Fitted, Some(fitted)) => Ok(fitted),
            _ => Err(SbiError::UnfittedPosterior),
        }
    }

    /// `n` draws at the observation the posterior was fitted for, shape
    /// (n, dim). Any other observation is rejected.
    pub fn sample(&self, n: usize, x: Option<&Tensor>, rng: &mut SmallRng) -> Result<Tensor> {
        let fitted = self.fitted()?;
        if let Some(x) = x {
            if !same_observation(x, &fitted.x_o)? {
                return Err(SbiError::ObservationMismatch);
            }
        }
        let (theta, _) = self.rsample(&fitted.module, n, rng)?;
        Ok(theta.detach())
    }

    /// `log q(θ)` of each row, shape (n,); `-inf` off the support
    pub fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor> {
        let fitted = self.fitted()?;
        let (_, d) = theta_nd.dims2()?;
        if d != self.dim {
            return Err(SbiError::DimensionMismatch {
                what: "parameter",
                expected: self.dim,
                got: d,
            });
        }
        let (y, ld_transform) = self.transform.inverse(theta_nd)?;
        let (z, ld_module) = fitted.module.inverse(&y)?;
        let log_q = ((std_normal_log_prob(&z)? + ld_module)? + ld_transform)?.detach();

        match &self.support {
            Support::Real => Ok(log_q),
            Support::Box { lo, hi } => {
                let lo = Tensor::from_slice(lo, (1, d), theta_nd.device())?;
                let hi = Tensor::from_slice(hi, (1, d), theta_nd.device())?;
                let below = lo.broadcast_sub(theta_nd)?.relu()?;
                let above = theta_nd.broadcast_sub(&hi)?.relu()?;
                let outside = (below + above)?.sum(1)?.gt(0.)?;
                let neg_inf = Tensor::full(f32::NEG_INFINITY, log_q.dim(0)?, log_q.device())?;
                Ok(outside.where_cond(&neg_inf, &log_q)?)
            }
        }
    }
}

fn window_mean(xs: &[f32]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().map(|&x| x as f64).sum::<f64>() / xs.len() as f64
}

fn same_observation(a: &Tensor, b: &Tensor) -> Result<bool> {
    let a = a.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let b = b.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= OBSERVATION_RTOL * x.abs().max(y.abs()).max(1.)))
}

/// Build an unfit posterior for `prior` and fit it to `potential`
pub fn fit(
    potential: &dyn Potential,
    prior: &dyn Distribution,
    family: VariationalFamily,
    transform: Option<Arc<dyn Bijector>>,
    divergence: Divergence,
    config: &VariationalConfig,
) -> Result<VariationalPosterior> {
    let device = potential.observation().device().clone();
    VariationalPosterior::new(prior, family, transform, &device)?.fit(potential, divergence, config)
}

impl Distribution for VariationalPosterior {
    fn dim(&self) -> usize {
        self.dim
    }

    fn sample(&self, n: usize, rng: &mut SmallRng) -> candle_core::Result<Tensor> {
        Ok(VariationalPosterior::sample(self, n, None, rng)?)
    }

    fn log_prob(&self, theta_nd: &Tensor) -> candle_core::Result<Tensor> {
        Ok(VariationalPosterior::log_prob(self, theta_nd)?)
    }

    fn support(&self) -> Support {
        self.support.clone()
    }
}
