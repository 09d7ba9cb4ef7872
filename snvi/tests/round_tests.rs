use candle_core::{DType, Device, Tensor};
use flow_util::distributions::{to_rows, BoxUniform, Distribution};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use snvi::config::{VariationalFamily, VariationalConfig};
use snvi::rounds::{Proposal, SequentialInference};
use snvi::simulate::FnSimulator;
use snvi::simulators::LinearGaussian;
use snvi::{RoundConfig, SbiError, TrainConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn config() -> RoundConfig {
    RoundConfig {
        num_rounds: 2,
        simulations_per_round: 500,
        seed: 11,
        family: VariationalFamily::Autoregressive {
            num_transforms: 2,
            hidden_features: 32,
        },
        train: TrainConfig {
            learning_rate: 1e-3,
            max_epochs: 200,
            patience: 10,
            num_transforms: 2,
            hidden_features: 32,
            ..Default::default()
        },
        variational: VariationalConfig {
            learning_rate: 5e-3,
            num_particles: 64,
            max_iters: 1500,
            min_iters: 300,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn two_rounds_concentrate_on_the_true_parameters() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let simulator = LinearGaussian::new(3, 1.0, 0.1);
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(3, -2., 2., &dev)?);
    let x_o = Tensor::zeros((1, 3), DType::F32, &dev)?;
    let config = config();

    let mut sbi = SequentialInference::new(&simulator, prior, x_o.clone(), config.clone())?;
    let outputs = sbi.run()?;

    assert_eq!(outputs.len(), 2);
    for (r, out) in outputs.iter().enumerate() {
        assert_eq!(out.round, r);
        assert_eq!(out.num_simulations, 500);
        assert_eq!(out.cumulative_simulations, 500 * (r + 1));
        assert!(out.train_report.epochs_trained <= config.train.max_epochs);
        assert!(out.fit_report.iterations <= config.variational.max_iters);
    }
    assert_eq!(sbi.trainer().len(), 1000);

    let posterior = &outputs[1].posterior;
    let mut rng = SmallRng::seed_from_u64(0);
    let samples = to_rows(&posterior.sample(10_000, Some(&x_o), &mut rng)?)?;
    assert_eq!(samples.len(), 10_000);

    let truth = simulator.flat_prior_posterior_mean(&[0., 0., 0.]);
    for (j, t) in truth.iter().enumerate() {
        let mean = samples.iter().map(|s| s[j]).sum::<f32>() / samples.len() as f32;
        approx::assert_abs_diff_eq!(mean, *t, epsilon = 0.3);
    }
    Ok(())
}

#[test]
fn rounds_thread_the_posterior_into_the_next_proposal() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let simulator = LinearGaussian::new(2, 0.5, 0.2);
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(2, -3., 3., &dev)?);
    let x_o = Tensor::new(&[0.5f32, 0.5], &dev)?;
    let mut config = config();
    config.simulations_per_round = 100;
    config.train.max_epochs = 20;
    config.variational.max_iters = 100;

    let mut sbi = SequentialInference::new(&simulator, prior, x_o, config)?;
    let state = sbi.initial_state();
    assert!(state.proposal.is_prior());

    let (next, first) = sbi.run_round(state)?;
    assert_eq!(next.round, 1);
    assert!(matches!(next.proposal, Proposal::Posterior(_)));
    assert_eq!(first.cumulative_simulations, 100);

    let (last, second) = sbi.run_round(next)?;
    assert_eq!(last.round, 2);
    assert_eq!(second.cumulative_simulations, 200);
    assert!(!Arc::ptr_eq(&first.posterior, &second.posterior));
    Ok(())
}

#[test]
fn a_failing_simulator_aborts_the_round() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let simulator = FnSimulator::new(1, |theta: &[f32], _: &mut SmallRng| {
        if theta[0] > 0.9 {
            anyhow::bail!("unstable at {}", theta[0]);
        }
        Ok(vec![theta[0]])
    });
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(1, -1., 1., &dev)?);
    let x_o = Tensor::zeros((1, 1), DType::F32, &dev)?;

    let mut sbi = SequentialInference::new(&simulator, prior, x_o, config())?;
    assert!(matches!(sbi.run(), Err(SbiError::Simulator { .. })));
    assert!(sbi.trainer().is_empty());
    Ok(())
}

fn quick_config(simulations: usize) -> RoundConfig {
    let mut config = config();
    config.simulations_per_round = simulations;
    config.train.max_epochs = 20;
    config.variational.max_iters = 100;
    config
}

#[test]
fn a_failed_round_can_be_retried_with_adjusted_settings() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let simulator = LinearGaussian::new(2, 0.5, 0.2);
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(2, -3., 3., &dev)?);
    let x_o = Tensor::new(&[0.5f32, 0.5], &dev)?;
    let mut config = quick_config(100);
    config.train.min_train_samples = 150;

    let mut sbi = SequentialInference::new(&simulator, prior, x_o, config)?;
    let state = sbi.initial_state();
    assert!(matches!(
        sbi.run_round(state.clone()),
        Err(SbiError::InsufficientData {
            available: 100,
            required: 150
        })
    ));
    assert!(sbi.trainer().is_empty());

    sbi.config_mut().train.min_train_samples = 10;
    let (next, first) = sbi.run_round(state)?;
    assert_eq!(first.cumulative_simulations, 100);
    assert_eq!(sbi.trainer().len(), 100);
    assert_eq!(sbi.trainer().num_batches(), 1);

    // the second round fails the same way and keeps round one's set
    sbi.config_mut().train.min_train_samples = 500;
    assert!(sbi.run_round(next.clone()).is_err());
    assert_eq!(sbi.trainer().len(), 100);

    sbi.config_mut().train.min_train_samples = 10;
    let (_, second) = sbi.run_round(next)?;
    assert_eq!(second.round, 1);
    assert_eq!(second.cumulative_simulations, 200);
    assert_eq!(sbi.trainer().num_batches(), 2);
    Ok(())
}

#[test]
fn invalid_settings_fail_the_round_before_simulating() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let simulator = LinearGaussian::new(2, 0.5, 0.2);
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(2, -3., 3., &dev)?);
    let x_o = Tensor::new(&[0.5f32, 0.5], &dev)?;

    let mut sbi = SequentialInference::new(&simulator, prior, x_o, quick_config(100))?;
    sbi.config_mut().variational.max_iters = 0;
    let state = sbi.initial_state();
    assert!(matches!(
        sbi.run_round(state),
        Err(SbiError::InvalidConfig(_))
    ));
    assert!(sbi.trainer().is_empty());
    Ok(())
}

#[test]
fn non_finite_simulations_leave_the_cumulative_set_unchanged() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let broken = AtomicBool::new(true);
    let simulator = FnSimulator::new(2, |theta: &[f32], _: &mut SmallRng| {
        if broken.load(Ordering::SeqCst) && theta[0] > 0. {
            return Ok(vec![f32::NAN, theta[1]]);
        }
        Ok(vec![theta[0] + 0.5, theta[1] + 0.5])
    });
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(2, -3., 3., &dev)?);
    let x_o = Tensor::new(&[0.5f32, 0.5], &dev)?;

    let mut sbi = SequentialInference::new(&simulator, prior, x_o, quick_config(100))?;
    let state = sbi.initial_state();
    assert!(matches!(
        sbi.run_round(state.clone()),
        Err(SbiError::Simulator { .. })
    ));
    assert!(sbi.trainer().is_empty());

    broken.store(false, Ordering::SeqCst);
    let (next, output) = sbi.run_round(state)?;
    assert_eq!(next.round, 1);
    assert_eq!(output.cumulative_simulations, 100);
    assert_eq!(sbi.trainer().len(), 100);
    Ok(())
}

#[test]
fn mismatched_prior_is_rejected_up_front() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let simulator = LinearGaussian::new(3, 1.0, 0.1);
    let prior: Arc<dyn Distribution> = Arc::new(BoxUniform::cube(2, -2., 2., &dev)?);
    let x_o = Tensor::zeros((1, 3), DType::F32, &dev)?;
    assert!(matches!(
        SequentialInference::new(&simulator, prior, x_o, config()),
        Err(SbiError::DimensionMismatch { .. })
    ));
    Ok(())
}
