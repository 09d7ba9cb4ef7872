pub mod linear_gaussian;

use clap::{Parser, Subcommand};

pub use linear_gaussian::{DivergenceType, FamilyType, LinearGaussianArgs};

#[derive(Parser)]
#[command(name = "snvi")]
#[command(about = "Sequential neural likelihood estimation with variational posteriors")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Infer the parameters of a linear Gaussian simulator
    LinearGaussian(LinearGaussianArgs),
}
