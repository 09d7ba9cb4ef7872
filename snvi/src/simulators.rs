use crate::simulate::Simulator;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// `x = θ + shift + noise_std * ε` with `ε ~ N(0, I)`
#[derive(Clone, Debug)]
pub struct LinearGaussian {
    dim: usize,
    shift: f32,
    noise_std: f32,
}

impl LinearGaussian {
    pub fn new(dim: usize, shift: f32, noise_std: f32) -> Self {
        Self {
            dim,
            shift,
            noise_std,
        }
    }

    /// Posterior mean at `x_o` under a flat prior: `x_o - shift`
    pub fn flat_prior_posterior_mean(&self, x_o: &[f32]) -> Vec<f32> {
        x_o.iter().map(|x| x - self.shift).collect()
    }

    pub fn noise_std(&self) -> f32 {
        self.noise_std
    }
}

impl Simulator for LinearGaussian {
    fn param_dim(&self) -> usize {
        self.dim
    }

    fn simulate(&self, theta: &[f32], rng: &mut SmallRng) -> anyhow::Result<Vec<f32>> {
        if theta.len() != self.dim {
            anyhow::bail!("expected {} parameters, got {}", self.dim, theta.len());
        }
        Ok(theta
            .iter()
            .map(|t| {
                let eps: f32 = rng.sample(StandardNormal);
                t + self.shift + self.noise_std * eps
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn noise_free_simulation_is_a_shift() -> anyhow::Result<()> {
        let sim = LinearGaussian::new(3, 1.0, 0.0);
        let mut rng = SmallRng::seed_from_u64(0);
        assert_eq!(sim.simulate(&[0., -1., 2.], &mut rng)?, vec![1., 0., 3.]);
        assert!(sim.simulate(&[0.], &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn noise_has_the_requested_spread() -> anyhow::Result<()> {
        let sim = LinearGaussian::new(1, 0.0, 0.5);
        let mut rng = SmallRng::seed_from_u64(1);
        let xs: Vec<f32> = (0..20_000)
            .map(|_| sim.simulate(&[0.], &mut rng).map(|x| x[0]))
            .collect::<anyhow::Result<_>>()?;
        let mean = xs.iter().sum::<f32>() / xs.len() as f32;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / xs.len() as f32;
        approx::assert_abs_diff_eq!(mean, 0., epsilon = 0.02);
        approx::assert_abs_diff_eq!(var.sqrt(), sim.noise_std(), epsilon = 0.02);
        Ok(())
    }
}
