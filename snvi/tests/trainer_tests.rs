use candle_core::{Device, Tensor};
use flow_util::distributions::BoxUniform;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use snvi::simulate::{run, SimulationBatch};
use snvi::simulators::LinearGaussian;
use snvi::trainer::SequentialTrainer;
use snvi::{SbiError, TrainConfig};

fn config() -> TrainConfig {
    TrainConfig {
        learning_rate: 1e-3,
        max_epochs: 60,
        patience: 10,
        num_transforms: 2,
        hidden_features: 32,
        ..Default::default()
    }
}

fn linear_gaussian_batch(n: usize, seed: u64) -> anyhow::Result<SimulationBatch> {
    let simulator = LinearGaussian::new(2, 1.0, 0.1);
    let prior = BoxUniform::cube(2, -2., 2., &Device::Cpu)?;
    Ok(run(&simulator, &prior, n, &mut SmallRng::seed_from_u64(seed))?)
}

#[test]
fn empty_or_small_sets_cannot_be_trained() -> anyhow::Result<()> {
    let mut trainer = SequentialTrainer::new(config())?;
    assert!(matches!(
        trainer.train(),
        Err(SbiError::InsufficientData { available: 0, .. })
    ));

    trainer.append(&linear_gaussian_batch(5, 0)?)?;
    assert!(matches!(
        trainer.train(),
        Err(SbiError::InsufficientData { available: 5, required: 10 })
    ));
    Ok(())
}

#[test]
fn non_finite_observations_abort_the_first_epoch() -> anyhow::Result<()> {
    let batch = linear_gaussian_batch(100, 1)?;
    let mut x = batch.x().to_vec2::<f32>()?;
    x[17][1] = f32::NAN;
    let x = Tensor::from_vec(x.concat(), (100, 2), &Device::Cpu)?;
    let poisoned = SimulationBatch::new(batch.theta().clone(), x)?;

    let mut trainer = SequentialTrainer::new(config())?;
    trainer.append(&poisoned)?;
    assert!(matches!(
        trainer.train(),
        Err(SbiError::TrainingDivergence { epoch: 1, .. })
    ));
    Ok(())
}

#[test]
fn exploding_parameters_abort_training_mid_run() -> anyhow::Result<()> {
    // one step per epoch; a decoupled decay of -1/lr doubles every weight
    // each step, so the loss overflows after a handful of finite epochs
    let mut trainer = SequentialTrainer::new(TrainConfig {
        learning_rate: 1e-2,
        weight_decay: -100.,
        batch_size: 128,
        max_epochs: 200,
        patience: 200,
        ..config()
    })?;
    trainer.append(&linear_gaussian_batch(100, 1)?)?;

    match trainer.train() {
        Err(SbiError::TrainingDivergence { epoch, .. }) => {
            assert!(epoch > 1 && epoch < 200, "diverged at epoch {}", epoch);
        }
        Err(e) => anyhow::bail!("unexpected error: {}", e),
        Ok(estimator) => anyhow::bail!(
            "training finished after {} epochs",
            estimator.report().epochs_trained
        ),
    }
    Ok(())
}

#[test]
fn retraining_an_unchanged_set_is_reproducible() -> anyhow::Result<()> {
    let mut trainer = SequentialTrainer::new(config())?;
    trainer.append(&linear_gaussian_batch(200, 2)?)?;

    let first = trainer.train()?;
    let second = trainer.train()?;
    let (a, b) = (first.report(), second.report());

    assert_eq!(a.epochs_trained, b.epochs_trained);
    assert_eq!(a.best_epoch, b.best_epoch);
    approx::assert_abs_diff_eq!(a.best_validation_loss, b.best_validation_loss, epsilon = 1e-4);
    Ok(())
}

#[test]
fn learned_likelihood_prefers_the_true_parameters() -> anyhow::Result<()> {
    let mut trainer = SequentialTrainer::new(TrainConfig {
        max_epochs: 150,
        ..config()
    })?;
    trainer.append(&linear_gaussian_batch(1000, 3)?)?;
    let estimator = trainer.train()?;
    assert!(estimator.report().epochs_trained <= 150);

    // x_o = θ* + 1 with θ* = (0.5, -0.5)
    let x_o = Tensor::new(&[[1.5f32, 0.5]], &Device::Cpu)?;
    let theta = Tensor::new(&[[0.5f32, -0.5], [1.0, 0.0], [-1.0, 1.0]], &Device::Cpu)?;
    let lp = estimator.log_prob(&x_o, &theta)?.to_vec1::<f32>()?;
    assert!(lp[0] > lp[1], "{:?}", lp);
    assert!(lp[0] > lp[2], "{:?}", lp);
    Ok(())
}
