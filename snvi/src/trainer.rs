use crate::config::TrainConfig;
use crate::diagnostics::latent_calibration_score;
use crate::error::{Result, SbiError};
use crate::simulate::SimulationBatch;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use flow_util::distributions::{randn_tensor, to_rows};
use flow_util::flow::{AutoregressiveFlow, AutoregressiveFlowArgs};
use flow_util::minibatch::{select_rows, Minibatches};
use flow_util::params::{reinit_varmap, restore_vars, snapshot_vars};
use flow_util::standardize::Standardizer;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

/// scale of the initial output layers; near-identity flows at start
const INIT_OUT_SCALE: f64 = 0.1;

/// Summary of one call to [`SequentialTrainer::train`]
#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub epochs_trained: usize,
    /// 1-based epoch whose parameters were kept
    pub best_epoch: usize,
    /// negative log-likelihood per observation, in data units
    pub best_validation_loss: f32,
    pub train_losses: Vec<f32>,
    pub validation_losses: Vec<f32>,
    /// `|mean| + |std - 1|` of held-out latents, averaged over dimensions
    pub calibration_score: f32,
    pub num_train: usize,
    pub num_validation: usize,
    pub stopped_early: bool,
}

/// Owns the cumulative simulation set and trains a fresh conditional
/// density estimator of `p(x | θ)` on all of it.
///
/// Cloning is cheap: the accumulated tensors share storage.
#[derive(Clone)]
pub struct SequentialTrainer {
    config: TrainConfig,
    theta: Option<Tensor>,
    x: Option<Tensor>,
    num_batches: usize,
}

impl SequentialTrainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            theta: None,
            x: None,
            num_batches: 0,
        })
    }

    /// Concatenate `batch` to the cumulative set. Rows are kept in order
    /// and never filtered.
    pub fn append(&mut self, batch: &SimulationBatch) -> Result<()> {
        let (theta, x) = match (&self.theta, &self.x) {
            (Some(theta), Some(x)) => {
                check_dim("parameter", theta.dim(1)?, batch.param_dim())?;
                check_dim("observation", x.dim(1)?, batch.obs_dim())?;
                (
                    Tensor::cat(&[theta, batch.theta()], 0)?,
                    Tensor::cat(&[x, batch.x()], 0)?,
                )
            }
            _ => (batch.theta().clone(), batch.x().clone()),
        };
        self.theta = Some(theta);
        self.x = Some(x);
        self.num_batches += 1;
        Ok(())
    }

    /// number of accumulated simulations
    pub fn len(&self) -> usize {
        self.theta.as_ref().map_or(0, |t| t.dims()[0])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn theta(&self) -> Option<&Tensor> {
        self.theta.as_ref()
    }

    pub fn x(&self) -> Option<&Tensor> {
        self.x.as_ref()
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Replace the training configuration used by later calls to
    /// [`Self::train`]. The cumulative set is untouched.
    pub fn set_config(&mut self, config: TrainConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Train a conditional masked autoregressive flow from scratch on the
    /// whole cumulative set.
    ///
    /// Keeps the parameters of the epoch with the lowest validation loss.
    /// Stops after `patience` epochs without improvement or at
    /// `max_epochs`. Randomness derives from the configured seed and the
    /// number of appended batches only.
    pub fn train(&self) -> Result<LikelihoodEstimator> {
        let config = &self.config;
        let required = config.min_train_samples.max(2);
        let (theta, x) = match (&self.theta, &self.x) {
            (Some(theta), Some(x)) if self.len() >= required => (theta, x),
            _ => {
                return Err(SbiError::InsufficientData {
                    available: self.len(),
                    required,
                })
            }
        };

        let n = self.len();
        let device = theta.device().clone();
        let seed = config.seed ^ (self.num_batches as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = SmallRng::seed_from_u64(seed);

        // held-out split
        let n_val = ((n as f64 * config.validation_fraction).ceil() as usize).clamp(1, n - 1);
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rng);
        let (val_idx, train_idx) = order.split_at(n_val);

        let theta_train = select_rows(theta, train_idx)?;
        let x_train = select_rows(x, train_idx)?;
        let theta_std = Standardizer::fit(&theta_train)?;
        let x_std = Standardizer::fit(&x_train)?;

        let theta_train = theta_std.transform(&theta_train)?;
        let x_train = x_std.transform(&x_train)?;
        let theta_val = theta_std.transform(&select_rows(theta, val_idx)?)?;
        let x_val = x_std.transform(&select_rows(x, val_idx)?)?;

        // fresh parameters every call
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let args = AutoregressiveFlowArgs {
            dim: x.dim(1)?,
            context_dim: theta.dim(1)?,
            hidden_features: config.hidden_features,
            num_transforms: config.num_transforms,
            num_blocks: config.num_blocks,
        };
        let flow = AutoregressiveFlow::new(&args, vb.pp("likelihood"))?;
        reinit_varmap(&varmap, INIT_OUT_SCALE, &mut rng)?;

        let mut adam = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        let pb = ProgressBar::new(config.max_epochs as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let log_det_x = x_std.log_abs_det() as f32;
        let mut minibatches = Minibatches::new((0..train_idx.len()).collect());
        let mut train_losses = vec![];
        let mut validation_losses = vec![];
        let mut best = (0usize, f32::INFINITY, snapshot_vars(&varmap)?);
        let mut stopped_early = false;

        for epoch in 1..=config.max_epochs {
            minibatches.shuffle_minibatch(config.batch_size, &mut rng);

            let mut loss_tot = 0f32;
            for chunk in minibatches.chunks.iter() {
                let x_b = select_rows(&x_train, chunk)?;
                let theta_b = select_rows(&theta_train, chunk)?;
                let loss = flow.log_prob(&x_b, Some(&theta_b))?.mean_all()?.neg()?;
                let loss_val = loss.to_scalar::<f32>()?;
                if !loss_val.is_finite() {
                    pb.finish_and_clear();
                    return Err(SbiError::TrainingDivergence {
                        epoch,
                        stage: "training",
                    });
                }
                adam.backward_step(&loss)?;
                loss_tot += loss_val * chunk.len() as f32;
            }
            train_losses.push(loss_tot / minibatches.size() as f32 - log_det_x);

            let val_loss = negative_log_likelihood(&flow, &x_val, &theta_val)? - log_det_x;
            if !val_loss.is_finite() {
                pb.finish_and_clear();
                return Err(SbiError::TrainingDivergence {
                    epoch,
                    stage: "validation",
                });
            }
            validation_losses.push(val_loss);
            pb.inc(1);

            if config.verbose {
                info!(
                    "[{}] train NLL: {:.4}, validation NLL: {:.4}",
                    epoch,
                    train_losses[epoch - 1],
                    val_loss
                );
            }

            if val_loss < best.1 {
                best = (epoch, val_loss, snapshot_vars(&varmap)?);
            } else if epoch - best.0 >= config.patience {
                stopped_early = true;
                break;
            }
        }
        pb.finish_and_clear();

        let (best_epoch, best_validation_loss, best_vars) = best;
        restore_vars(&varmap, &best_vars)?;

        let (latent, _) = flow.forward(&x_val, Some(&theta_val))?;
        let calibration_score = latent_calibration_score(&to_rows(&latent)?);

        let report = TrainReport {
            epochs_trained: train_losses.len(),
            best_epoch,
            best_validation_loss,
            train_losses,
            validation_losses,
            calibration_score,
            num_train: train_idx.len(),
            num_validation: n_val,
            stopped_early,
        };

        let estimator = LikelihoodEstimator {
            flow,
            varmap,
            theta_std,
            x_std,
            report,
        };

        let report = estimator.report();
        info!(
            "likelihood ({} parameters) trained on {} simulations: {} epochs, best validation NLL {:.4} at epoch {}, calibration {:.3}",
            estimator.num_parameters(),
            n,
            report.epochs_trained,
            report.best_validation_loss,
            report.best_epoch,
            report.calibration_score
        );

        Ok(estimator)
    }
}

fn check_dim(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(SbiError::DimensionMismatch {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

fn negative_log_likelihood(
    flow: &AutoregressiveFlow,
    x_nk: &Tensor,
    theta_nd: &Tensor,
) -> Result<f32> {
    let llik = flow.log_prob(x_nk, Some(theta_nd))?.detach();
    Ok(-llik.mean_all()?.to_scalar::<f32>()?)
}

/// Conditional density `q(x | θ)` learned by [`SequentialTrainer::train`].
/// Immutable; each round trains a new one.
pub struct LikelihoodEstimator {
    flow: AutoregressiveFlow,
    varmap: VarMap,
    theta_std: Standardizer,
    x_std: Standardizer,
    report: TrainReport,
}

impl LikelihoodEstimator {
    /// `log q(x | θ)` for every row of `theta_nd`, shape (n,)
    ///
    /// * `x_nk` - one observation per row of `theta_nd`, or a single row
    ///   shared by all of them
    /// * `theta_nd` - parameters
    pub fn log_prob(&self, x_nk: &Tensor, theta_nd: &Tensor) -> Result<Tensor> {
        let (n, d) = theta_nd.dims2()?;
        let (n_x, k) = x_nk.dims2()?;
        check_dim("parameter", self.param_dim(), d)?;
        check_dim("observation", self.obs_dim(), k)?;

        let x_nk = if n_x == 1 && n > 1 {
            x_nk.broadcast_as((n, k))?.contiguous()?
        } else {
            check_dim("observation row", n, n_x)?;
            x_nk.clone()
        };

        let x_z = self.x_std.transform(&x_nk)?;
        let theta_z = self.theta_std.transform(theta_nd)?;
        Ok((self.flow.log_prob(&x_z, Some(&theta_z))? + self.x_std.log_abs_det())?)
    }

    /// Draw one synthetic observation per row of `theta_nd`
    pub fn sample(&self, theta_nd: &Tensor, rng: &mut SmallRng) -> Result<Tensor> {
        let (n, d) = theta_nd.dims2()?;
        check_dim("parameter", self.param_dim(), d)?;
        let theta_z = self.theta_std.transform(theta_nd)?;
        let z = randn_tensor(n, self.obs_dim(), rng, theta_nd.device())?;
        let (x_z, _) = self.flow.inverse(&z, Some(&theta_z))?;
        Ok(self.x_std.inverse(&x_z)?.detach())
    }

    pub fn report(&self) -> &TrainReport {
        &self.report
    }

    pub fn param_dim(&self) -> usize {
        self.theta_std.mean().dims()[1]
    }

    pub fn obs_dim(&self) -> usize {
        self.flow.dim()
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}
