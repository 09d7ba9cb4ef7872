//! Advisory quality scores. Nothing here ever fails a round.

/// Fewer finite weights than this give no estimate
const MIN_PSIS_SAMPLES: usize = 20;

/// Shape estimate k̂ of the generalized Pareto distribution fitted to the
/// largest importance weights (Pareto-smoothed importance sampling).
///
/// * `log_weights` - `log p̃(θ) - log q(θ)` at draws `θ ~ q`
///
/// k̂ < 0.5 means q covers the target well, k̂ > 0.7 means importance
/// weights (and q itself) are unreliable. Returns `None` if there are too
/// few finite weights.
pub fn psis_khat(log_weights: &[f64]) -> Option<f64> {
    let mut lw: Vec<f64> = log_weights.iter().copied().filter(|w| w.is_finite()).collect();
    let n = lw.len();
    if n < MIN_PSIS_SAMPLES {
        return None;
    }

    let max = lw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    lw.iter_mut().for_each(|w| *w -= max);
    lw.sort_by(|a, b| a.total_cmp(b));

    let nf = n as f64;
    let tail_len = (0.2 * nf).min(3. * nf.sqrt()).ceil() as usize;
    if tail_len < 5 || tail_len + 1 > n {
        return None;
    }

    let cutoff = lw[n - tail_len - 1].max(f64::MIN_POSITIVE.ln());
    let exp_cutoff = cutoff.exp();
    let tail: Vec<f64> = lw[n - tail_len..]
        .iter()
        .map(|w| w.exp() - exp_cutoff)
        .collect();

    Some(gpd_shape(&tail))
}

/// Zhang & Stephens (2009) posterior-mean estimate of the generalized
/// Pareto shape, with a weak prior shrinking it towards 0.5.
///
/// * `x` - exceedances over a threshold, sorted ascending
fn gpd_shape(x: &[f64]) -> f64 {
    const PRIOR_BS: f64 = 3.;
    const PRIOR_K: f64 = 10.;

    let n = x.len();
    let nf = n as f64;
    let x_max = x[n - 1];
    if !(x_max > 0.) {
        // all tail weights tied with the threshold
        return 0.;
    }
    let quartile = x[((nf / 4. + 0.5) as usize).saturating_sub(1)].max(x_max * 1e-12);

    let m = 30 + nf.sqrt() as usize;
    let b: Vec<f64> = (1..=m)
        .map(|j| 1. / x_max + (1. - (m as f64 / (j as f64 - 0.5)).sqrt()) / (PRIOR_BS * quartile))
        .collect();

    let k: Vec<f64> = b
        .iter()
        .map(|&bj| x.iter().map(|&xi| (-bj * xi).ln_1p()).sum::<f64>() / nf)
        .collect();

    let len_scale: Vec<f64> = b
        .iter()
        .zip(k.iter())
        .map(|(&bj, &kj)| nf * ((-(bj / kj)).ln() - kj - 1.))
        .collect();

    let weights: Vec<f64> = len_scale
        .iter()
        .map(|li| 1. / len_scale.iter().map(|lj| (lj - li).exp()).sum::<f64>())
        .collect();

    let (mut b_post, mut w_tot) = (0., 0.);
    for (bj, wj) in b.iter().zip(weights.iter()) {
        if wj.is_finite() && *wj >= 10. * f64::EPSILON {
            b_post += bj * wj;
            w_tot += wj;
        }
    }
    if !(w_tot > 0.) {
        return f64::NAN;
    }
    b_post /= w_tot;

    let k_post = x.iter().map(|&xi| (-b_post * xi).ln_1p()).sum::<f64>() / nf;
    (nf * k_post + PRIOR_K * 0.5) / (nf + PRIOR_K)
}

/// Calibration of a normalizing flow on held-out data.
///
/// Held-out points pushed through the flow should look standard normal.
/// Returns the mean over dimensions of `|mean| + |std - 1|` of the
/// latent draws; 0 is perfect.
pub fn latent_calibration_score(latent: &[Vec<f32>]) -> f32 {
    let n = latent.len();
    if n < 2 {
        return f32::NAN;
    }
    let d = latent[0].len();
    if d == 0 {
        return f32::NAN;
    }
    let mut score = 0.;
    for j in 0..d {
        let mean = latent.iter().map(|u| u[j] as f64).sum::<f64>() / n as f64;
        let var = latent
            .iter()
            .map(|u| (u[j] as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        score += mean.abs() + (var.sqrt() - 1.).abs();
    }
    (score / d as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    #[test]
    fn nearly_uniform_weights_have_small_khat() {
        let mut rng = SmallRng::seed_from_u64(0);
        let lw: Vec<f64> = (0..2000)
            .map(|_| 0.01 * rng.sample::<f64, _>(StandardNormal))
            .collect();
        let k = psis_khat(&lw).unwrap();
        assert!(k < 0.5, "k̂ = {}", k);
    }

    #[test]
    fn heavy_tailed_weights_have_large_khat() {
        // Pareto(α = 0.5) weights: true shape 1/α = 2
        let mut rng = SmallRng::seed_from_u64(1);
        let lw: Vec<f64> = (0..2000)
            .map(|_| -2. * (1. - rng.random::<f64>()).ln())
            .collect();
        let k = psis_khat(&lw).unwrap();
        assert!(k > 0.7, "k̂ = {}", k);
    }

    #[test]
    fn too_few_weights_give_no_estimate() {
        assert!(psis_khat(&[0.; 5]).is_none());
        assert!(psis_khat(&[f64::NAN; 100]).is_none());
    }

    #[test]
    fn standard_normal_latents_are_calibrated() {
        let mut rng = SmallRng::seed_from_u64(2);
        let good: Vec<Vec<f32>> = (0..5000)
            .map(|_| vec![rng.sample(StandardNormal), rng.sample(StandardNormal)])
            .collect();
        let bad: Vec<Vec<f32>> = good.iter().map(|u| vec![u[0] * 3. + 1., u[1]]).collect();
        let s_good = latent_calibration_score(&good);
        let s_bad = latent_calibration_score(&bad);
        assert!(s_good < 0.1, "score {}", s_good);
        assert!(s_bad > s_good + 1.);
    }
}
