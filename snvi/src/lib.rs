//! Sequential neural likelihood estimation (SNLE) with variational
//! posteriors (SNVI).
//!
//! One round of inference is the pipeline
//!
//! ```text
//! proposal --simulate--> batch --append/train--> likelihood estimator
//!          --potential--> variational posterior --> next proposal
//! ```
//!
//! # Example
//!
//! ```ignore
//! use snvi::{rounds::SequentialInference, simulators::LinearGaussian, RoundConfig};
//!
//! let simulator = LinearGaussian::new(3, 1.0, 0.1);
//! let prior = Arc::new(BoxUniform::cube(3, -2., 2., &Device::Cpu)?);
//! let x_o = Tensor::zeros((1, 3), DType::F32, &Device::Cpu)?;
//!
//! let mut sbi = SequentialInference::new(&simulator, prior, x_o, RoundConfig::default())?;
//! let rounds = sbi.run()?;
//! let samples = rounds.last().unwrap().posterior.sample(10_000, None, &mut rng)?;
//! ```

pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod io;
pub mod potential;
pub mod rounds;
pub mod simulate;
pub mod simulators;
pub mod trainer;
pub mod variational;

pub use config::{RoundConfig, TrainConfig, VariationalConfig};
pub use error::{Result, SbiError};
