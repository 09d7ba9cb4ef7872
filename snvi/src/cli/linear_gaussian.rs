use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::{Args, ValueEnum};
use flow_util::distributions::BoxUniform;
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Divergence, RoundConfig, VariationalFamily};
use crate::io::{mkdir, write_json, write_samples_tsv};
use crate::rounds::{RoundOutput, SequentialInference};
use crate::simulators::LinearGaussian;
use crate::trainer::TrainReport;
use crate::variational::FitReport;

#[derive(Clone, Debug, ValueEnum)]
pub enum FamilyType {
    /// inverse autoregressive flow
    Flow,
    /// diagonal Gaussian
    MeanField,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum DivergenceType {
    /// reverse KL (ELBO)
    Kl,
    /// importance-weighted bound
    Iw,
}

#[derive(Args, Debug)]
pub struct LinearGaussianArgs {
    #[arg(long, default_value = "3", help = "Number of parameters")]
    pub dim: usize,

    #[arg(long, default_value = "1.0", help = "x = θ + shift + noise")]
    pub shift: f32,

    #[arg(long, default_value = "0.1")]
    pub noise_std: f32,

    #[arg(long, default_value = "2.0", help = "Uniform prior on [-bound, bound]^dim")]
    pub bound: f32,

    #[arg(long, help = "Comma-separated observation (default: all zeros)")]
    pub observation: Option<String>,

    #[arg(long, help = "JSON file with a round configuration")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub rounds: Option<usize>,

    #[arg(long, help = "Simulations per round")]
    pub simulations: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, help = "Learning rate of the likelihood estimator")]
    pub lr: Option<f64>,

    #[arg(long, help = "Learning rate of the variational posterior")]
    pub vi_lr: Option<f64>,

    #[arg(short, long)]
    pub family: Option<FamilyType>,

    #[arg(short = 'k', long)]
    pub divergence: Option<DivergenceType>,

    #[arg(long, default_value = "8", help = "Inner samples of the importance-weighted bound")]
    pub iw_samples: usize,

    #[arg(short, long, default_value = "10000", help = "Posterior samples to write")]
    pub num_samples: usize,

    #[arg(
        short,
        long,
        help = "Output prefix (creates {output}.samples.tsv.gz and {output}.summary.json)"
    )]
    pub output: PathBuf,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Serialize)]
struct RoundSummary<'a> {
    round: usize,
    num_simulations: usize,
    cumulative_simulations: usize,
    train: &'a TrainReport,
    fit: &'a FitReport,
}

impl<'a> From<&'a RoundOutput> for RoundSummary<'a> {
    fn from(out: &'a RoundOutput) -> Self {
        Self {
            round: out.round,
            num_simulations: out.num_simulations,
            cumulative_simulations: out.cumulative_simulations,
            train: &out.train_report,
            fit: &out.fit_report,
        }
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    config: &'a RoundConfig,
    observation: Vec<f32>,
    posterior_mean: Vec<f32>,
    posterior_std: Vec<f32>,
    rounds: Vec<RoundSummary<'a>>,
}

fn parse_observation(text: Option<&str>, dim: usize) -> Result<Vec<f32>> {
    let Some(text) = text else {
        return Ok(vec![0.; dim]);
    };
    let x_o = text
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if x_o.len() != dim {
        anyhow::bail!("observation has {} values, expected {}", x_o.len(), dim);
    }
    Ok(x_o)
}

fn build_config(args: &LinearGaussianArgs) -> Result<RoundConfig> {
    let mut config = match &args.config {
        Some(path) => RoundConfig::from_json_file(path)?,
        None => RoundConfig::default(),
    };

    if let Some(rounds) = args.rounds {
        config.num_rounds = rounds;
    }
    if let Some(simulations) = args.simulations {
        config.simulations_per_round = simulations;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
        config.train.seed = seed;
        config.variational.seed = seed;
    }
    if let Some(lr) = args.lr {
        config.train.learning_rate = lr;
    }
    if let Some(lr) = args.vi_lr {
        config.variational.learning_rate = lr;
    }
    match args.family {
        Some(FamilyType::Flow) if config.family == VariationalFamily::MeanField => {
            config.family = VariationalFamily::default();
        }
        Some(FamilyType::MeanField) => config.family = VariationalFamily::MeanField,
        _ => {}
    }
    match args.divergence {
        Some(DivergenceType::Kl) => config.divergence = Divergence::ReverseKl,
        Some(DivergenceType::Iw) => {
            config.divergence = Divergence::ImportanceWeighted { k: args.iw_samples }
        }
        None => {}
    }

    config.train.show_progress = true;
    config.train.verbose = args.verbose;
    config.variational.show_progress = true;
    config.variational.verbose = args.verbose;

    config.validate()?;
    Ok(config)
}

pub fn run(args: &LinearGaussianArgs) -> Result<()> {
    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
        #[cfg(target_os = "linux")]
        {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Device::Cpu
        }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    if !(args.bound > 0.) {
        anyhow::bail!("prior bound must be positive");
    }
    let config = build_config(args)?;
    let observation = parse_observation(args.observation.as_deref(), args.dim)?;

    let simulator = LinearGaussian::new(args.dim, args.shift, args.noise_std);
    let prior = Arc::new(BoxUniform::cube(args.dim, -args.bound, args.bound, &device)?);
    let x_o = Tensor::from_slice(&observation, (1, args.dim), &device)?;

    info!(
        "{} rounds x {} simulations, noise std {}, flat-prior posterior mean {:?}",
        config.num_rounds,
        config.simulations_per_round,
        simulator.noise_std(),
        simulator.flat_prior_posterior_mean(&observation)
    );

    let mut sbi = SequentialInference::new(&simulator, prior, x_o.clone(), config.clone())?;
    let outputs = sbi.run()?;
    let last = outputs
        .last()
        .ok_or(anyhow::anyhow!("no round was run"))?;

    let mut rng = SmallRng::seed_from_u64(config.seed);
    let samples = last.posterior.sample(args.num_samples, Some(&x_o), &mut rng)?;
    let mean_1d = samples.mean_keepdim(0)?;
    let posterior_std = samples
        .broadcast_sub(&mean_1d)?
        .sqr()?
        .mean(0)?
        .sqrt()?
        .to_vec1::<f32>()?;
    let posterior_mean = mean_1d.flatten_all()?.to_vec1::<f32>()?;
    info!("posterior mean {:?}, std {:?}", posterior_mean, posterior_std);

    let prefix = args.output.to_string_lossy();
    let samples_file = format!("{}.samples.tsv.gz", prefix);
    mkdir(&samples_file)?;
    write_samples_tsv(&samples, &samples_file)?;
    info!("Saved posterior samples to {}", samples_file);

    let summary = RunSummary {
        config: &config,
        observation,
        posterior_mean,
        posterior_std,
        rounds: outputs.iter().map(RoundSummary::from).collect(),
    };
    let summary_file = format!("{}.summary.json", prefix);
    write_json(&summary, &summary_file)?;
    info!("Saved run summary to {}", summary_file);

    Ok(())
}
