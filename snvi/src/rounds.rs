use crate::config::RoundConfig;
use crate::error::{Result, SbiError};
use crate::potential::LikelihoodPotential;
use crate::simulate::{self, Simulator};
use crate::trainer::{SequentialTrainer, TrainReport};
use crate::variational::{FitReport, VariationalPosterior};

use candle_core::Tensor;
use flow_util::distributions::{Distribution, Support};
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::Arc;

/// Where the next round draws its parameters from
#[derive(Clone)]
pub enum Proposal {
    Prior(Arc<dyn Distribution>),
    Posterior(Arc<VariationalPosterior>),
}

impl Proposal {
    fn inner(&self) -> &dyn Distribution {
        match self {
            Proposal::Prior(p) => p.as_ref(),
            Proposal::Posterior(q) => q.as_ref(),
        }
    }

    pub fn is_prior(&self) -> bool {
        matches!(self, Proposal::Prior(_))
    }
}

impl Distribution for Proposal {
    fn dim(&self) -> usize {
        self.inner().dim()
    }

    fn sample(&self, n: usize, rng: &mut SmallRng) -> candle_core::Result<Tensor> {
        self.inner().sample(n, rng)
    }

    fn log_prob(&self, theta_nd: &Tensor) -> candle_core::Result<Tensor> {
        self.inner().log_prob(theta_nd)
    }

    fn support(&self) -> Support {
        self.inner().support()
    }
}

/// Handed from one round to the next
#[derive(Clone)]
pub struct RoundState {
    /// 0-based index of the round about to run
    pub round: usize,
    pub proposal: Proposal,
}

impl RoundState {
    pub fn initial(prior: Arc<dyn Distribution>) -> Self {
        Self {
            round: 0,
            proposal: Proposal::Prior(prior),
        }
    }
}

/// Everything one round produced
pub struct RoundOutput {
    pub round: usize,
    pub num_simulations: usize,
    pub cumulative_simulations: usize,
    pub train_report: TrainReport,
    pub fit_report: FitReport,
    pub posterior: Arc<VariationalPosterior>,
}

/// The round loop: simulate from the proposal, retrain the likelihood on
/// everything so far, fit a posterior at `x_o` and propose from it next.
pub struct SequentialInference<'s, S: Simulator + ?Sized> {
    simulator: &'s S,
    prior: Arc<dyn Distribution>,
    x_o: Tensor,
    trainer: SequentialTrainer,
    config: RoundConfig,
    rng: SmallRng,
}

impl<'s, S: Simulator + ?Sized> SequentialInference<'s, S> {
    /// * `x_o` - the observation, shape (1, k) or (k,)
    pub fn new(
        simulator: &'s S,
        prior: Arc<dyn Distribution>,
        x_o: Tensor,
        config: RoundConfig,
    ) -> Result<Self> {
        config.validate()?;
        if prior.dim() != simulator.param_dim() {
            return Err(SbiError::DimensionMismatch {
                what: "prior",
                expected: simulator.param_dim(),
                got: prior.dim(),
            });
        }
        let k = x_o.elem_count();
        let x_o = x_o.reshape((1, k))?;
        Ok(Self {
            simulator,
            prior,
            x_o,
            trainer: SequentialTrainer::new(config.train.clone())?,
            rng: SmallRng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn initial_state(&self) -> RoundState {
        RoundState::initial(self.prior.clone())
    }

    /// One round. Returns the state for the next round and what this one
    /// produced. An error aborts the round and leaves the cumulative set
    /// as it was, so the same state can be run again.
    pub fn run_round(&mut self, state: RoundState) -> Result<(RoundState, RoundOutput)> {
        self.config.validate()?;
        let round = state.round;
        let n = self.config.simulations_per_round;
        info!(
            "round {}: simulating {} draws from the {}",
            round + 1,
            n,
            if state.proposal.is_prior() { "prior" } else { "posterior" }
        );

        let batch = simulate::run(self.simulator, &state.proposal, n, &mut self.rng)?;
        if batch.obs_dim() != self.x_o.dim(1)? {
            return Err(SbiError::DimensionMismatch {
                what: "observation",
                expected: batch.obs_dim(),
                got: self.x_o.dim(1)?,
            });
        }

        // committed only once the posterior is fitted
        let mut trainer = self.trainer.clone();
        trainer.set_config(self.config.train.clone())?;
        trainer.append(&batch)?;

        let estimator = trainer.train()?;
        let potential = LikelihoodPotential::new(&estimator, self.prior.as_ref(), &self.x_o)?;

        let mut vi_config = self.config.variational.clone();
        vi_config.seed = vi_config.seed.wrapping_add(round as u64);
        let posterior = crate::variational::fit(
            &potential,
            self.prior.as_ref(),
            self.config.family.clone(),
            None,
            self.config.divergence,
            &vi_config,
        )?;
        let posterior = Arc::new(posterior);

        let output = RoundOutput {
            round,
            num_simulations: batch.len(),
            cumulative_simulations: trainer.len(),
            train_report: estimator.report().clone(),
            fit_report: posterior.report().cloned().ok_or(SbiError::UnfittedPosterior)?,
            posterior: posterior.clone(),
        };

        self.trainer = trainer;

        let next = RoundState {
            round: round + 1,
            proposal: Proposal::Posterior(posterior),
        };
        Ok((next, output))
    }

    /// All configured rounds, starting from the prior
    pub fn run(&mut self) -> Result<Vec<RoundOutput>> {
        let mut state = self.initial_state();
        let mut outputs = Vec::with_capacity(self.config.num_rounds);
        for _ in 0..self.config.num_rounds {
            let (next, output) = self.run_round(state)?;
            outputs.push(output);
            state = next;
        }
        Ok(outputs)
    }

    pub fn trainer(&self) -> &SequentialTrainer {
        &self.trainer
    }

    pub fn observation(&self) -> &Tensor {
        &self.x_o
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// Settings for the rounds still to run, e.g. before retrying a failed
    /// one. Checked when the next round starts.
    pub fn config_mut(&mut self) -> &mut RoundConfig {
        &mut self.config
    }
}
