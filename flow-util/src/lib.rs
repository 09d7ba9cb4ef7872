//! Tensor-level building blocks for neural density estimation on `candle`.
//!
//! - masked autoregressive layers ([`made`]) and affine autoregressive
//!   flows ([`flow`]) used both as conditional likelihood models and as
//!   variational families
//! - distributions over parameter space ([`distributions`]) and the
//!   bijections onto their supports ([`bijector`])
//! - z-scoring, seeded parameter initialization, minibatch shuffling and
//!   numerically stable loss helpers

pub mod aux_layers;
pub mod bijector;
pub mod distributions;
pub mod flow;
pub mod loss_functions;
pub mod made;
pub mod minibatch;
pub mod params;
pub mod standardize;
pub mod variational_gaussian;

pub use candle_core;
pub use candle_nn;
