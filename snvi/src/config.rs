use crate::error::{Result, SbiError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings of the likelihood estimator and its training loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f64,
    /// decoupled AdamW decay; each step scales weights by `1 - lr * decay`
    pub weight_decay: f64,
    pub batch_size: usize,
    /// fraction of the cumulative set held out to decide convergence
    pub validation_fraction: f64,
    /// stop after this many epochs without a better validation loss
    pub patience: usize,
    pub max_epochs: usize,
    pub min_train_samples: usize,
    pub num_transforms: usize,
    pub hidden_features: usize,
    pub num_blocks: usize,
    pub seed: u64,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            weight_decay: 0.,
            batch_size: 50,
            validation_fraction: 0.1,
            patience: 20,
            max_epochs: 1000,
            min_train_samples: 10,
            num_transforms: 5,
            hidden_features: 50,
            num_blocks: 2,
            seed: 42,
            show_progress: false,
            verbose: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.) {
            return invalid("learning_rate must be positive");
        }
        if !self.weight_decay.is_finite() {
            return invalid("weight_decay must be finite");
        }
        if self.batch_size == 0 || self.patience == 0 || self.max_epochs == 0 {
            return invalid("batch_size, patience and max_epochs must be positive");
        }
        if !(self.validation_fraction > 0. && self.validation_fraction < 1.) {
            return invalid("validation_fraction must lie in (0, 1)");
        }
        if self.num_transforms == 0 || self.hidden_features == 0 || self.num_blocks == 0 {
            return invalid("the flow needs at least one transform, block and hidden unit");
        }
        Ok(())
    }
}

/// Parametric family of the variational posterior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariationalFamily {
    /// diagonal Gaussian in the unconstrained space
    MeanField,
    /// inverse autoregressive flow in the unconstrained space
    Autoregressive {
        num_transforms: usize,
        hidden_features: usize,
    },
}

impl Default for VariationalFamily {
    fn default() -> Self {
        VariationalFamily::Autoregressive {
            num_transforms: 3,
            hidden_features: 32,
        }
    }
}

/// Objective minimized over the variational parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Divergence {
    /// KL(q || p) up to a constant: `E_q[log q(θ) - potential(θ)]`
    #[default]
    ReverseKl,
    /// importance-weighted bound with `k` inner samples per particle
    ImportanceWeighted { k: usize },
}

/// Settings of the variational optimization loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VariationalConfig {
    pub learning_rate: f64,
    pub max_iters: usize,
    /// Monte Carlo particles per divergence estimate
    pub num_particles: usize,
    /// no plateau check before this many iterations
    pub min_iters: usize,
    /// loss means of consecutive windows of this length are compared
    pub plateau_window: usize,
    /// relative change of the window mean that counts as a plateau
    pub plateau_tol: f64,
    /// draws used for the importance-sampling quality score
    pub quality_samples: usize,
    pub seed: u64,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for VariationalConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            max_iters: 2000,
            num_particles: 128,
            min_iters: 200,
            plateau_window: 50,
            plateau_tol: 1e-3,
            quality_samples: 1000,
            seed: 42,
            show_progress: false,
            verbose: false,
        }
    }
}

impl VariationalConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.) {
            return invalid("learning_rate must be positive");
        }
        if self.max_iters == 0 || self.num_particles == 0 || self.plateau_window == 0 {
            return invalid("max_iters, num_particles and plateau_window must be positive");
        }
        if !(self.plateau_tol >= 0.) {
            return invalid("plateau_tol must be non-negative");
        }
        Ok(())
    }
}

/// Settings of the whole round loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub num_rounds: usize,
    pub simulations_per_round: usize,
    /// seeds the simulation draws; training and fitting carry their own
    pub seed: u64,
    pub family: VariationalFamily,
    pub divergence: Divergence,
    pub train: TrainConfig,
    pub variational: VariationalConfig,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            num_rounds: 2,
            simulations_per_round: 500,
            seed: 42,
            family: VariationalFamily::default(),
            divergence: Divergence::default(),
            train: TrainConfig::default(),
            variational: VariationalConfig::default(),
        }
    }
}

impl RoundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_rounds == 0 || self.simulations_per_round == 0 {
            return invalid("num_rounds and simulations_per_round must be positive");
        }
        if let Divergence::ImportanceWeighted { k } = self.divergence {
            if k == 0 {
                return invalid("importance-weighted divergence needs k >= 1");
            }
        }
        if let VariationalFamily::Autoregressive {
            num_transforms,
            hidden_features,
        } = self.family
        {
            if num_transforms == 0 || hidden_features == 0 {
                return invalid("the variational flow needs transforms and hidden units");
            }
        }
        self.train.validate()?;
        self.variational.validate()
    }

    /// Read from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: RoundConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(SbiError::InvalidConfig(msg.to_string()))
}
