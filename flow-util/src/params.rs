//! Seeded initialization and snapshots of the variables in a `VarMap`.
//!
//! candle's CPU initializers draw from an unseeded generator, so models
//! are built with zero-initialized variables and then filled here from a
//! caller-provided RNG. Variables are visited in name order, so the same
//! seed always produces the same parameters.

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;
use rand::Rng;

/// Re-initialize every variable of `varmap`
///
/// * `*weight` of rank 2 (out, in): `U(-1/sqrt(in), 1/sqrt(in))`
/// * `*out.weight`: the same, scaled by `out_scale`
/// * everything else (biases, means, log-scales): zero
///
pub fn reinit_varmap(varmap: &VarMap, out_scale: f64, rng: &mut impl Rng) -> Result<()> {
    for (name, var) in sorted_vars(varmap)? {
        let dims = var.dims().to_vec();
        let value = match dims.as_slice() {
            [_, fan_in] if name.ends_with("weight") => {
                let bound = if name.ends_with("out.weight") {
                    out_scale / (*fan_in as f64).sqrt()
                } else {
                    1. / (*fan_in as f64).sqrt()
                };
                let numel: usize = dims.iter().product();
                let vals: Vec<f32> = (0..numel)
                    .map(|_| ((2. * rng.random::<f64>() - 1.) * bound) as f32)
                    .collect();
                Tensor::from_vec(vals, dims.as_slice(), var.device())?.to_dtype(var.dtype())?
            }
            _ => var.zeros_like()?,
        };
        var.set(&value)?;
    }
    Ok(())
}

/// Deep copy of every variable, keyed by name
pub fn snapshot_vars(varmap: &VarMap) -> Result<Vec<(String, Tensor)>> {
    sorted_vars(varmap)?
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
        .collect()
}

/// Write back values taken by [`snapshot_vars`]
pub fn restore_vars(varmap: &VarMap, snapshot: &[(String, Tensor)]) -> Result<()> {
    let vars = sorted_vars(varmap)?;
    if vars.len() != snapshot.len() {
        candle_core::bail!(
            "snapshot has {} variables, the model has {}",
            snapshot.len(),
            vars.len()
        );
    }
    for ((name, var), (saved_name, saved)) in vars.iter().zip(snapshot.iter()) {
        if name != saved_name {
            candle_core::bail!("snapshot variable {} does not match {}", saved_name, name);
        }
        var.set(saved)?;
    }
    Ok(())
}

fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn build(varmap: &VarMap) -> Result<()> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        vb.pp("a").get_with_hints((3, 4), "weight", candle_nn::init::ZERO)?;
        vb.pp("a").get_with_hints((1, 3), "bias", candle_nn::init::ZERO)?;
        vb.pp("out").get_with_hints((2, 3), "weight", candle_nn::init::ZERO)?;
        Ok(())
    }

    #[test]
    fn same_seed_same_parameters() -> Result<()> {
        let (m1, m2) = (VarMap::new(), VarMap::new());
        build(&m1)?;
        build(&m2)?;
        reinit_varmap(&m1, 0.01, &mut SmallRng::seed_from_u64(3))?;
        reinit_varmap(&m2, 0.01, &mut SmallRng::seed_from_u64(3))?;

        let s1 = snapshot_vars(&m1)?;
        let s2 = snapshot_vars(&m2)?;
        for ((n1, t1), (n2, t2)) in s1.iter().zip(s2.iter()) {
            assert_eq!(n1, n2);
            assert_eq!(t1.flatten_all()?.to_vec1::<f32>()?, t2.flatten_all()?.to_vec1::<f32>()?);
        }

        let bias = &s1.iter().find(|(n, _)| n == "a.bias").unwrap().1;
        assert!(bias.flatten_all()?.to_vec1::<f32>()?.iter().all(|&b| b == 0.));

        let out = &s1.iter().find(|(n, _)| n == "out.weight").unwrap().1;
        let bound = 0.01 / 3f32.sqrt();
        assert!(out.flatten_all()?.to_vec1::<f32>()?.iter().all(|w| w.abs() <= bound));
        Ok(())
    }

    #[test]
    fn restore_undoes_changes() -> Result<()> {
        let varmap = VarMap::new();
        build(&varmap)?;
        reinit_varmap(&varmap, 1.0, &mut SmallRng::seed_from_u64(11))?;
        let saved = snapshot_vars(&varmap)?;

        for var in varmap.all_vars() {
            var.set(&var.ones_like()?)?;
        }
        restore_vars(&varmap, &saved)?;

        let now = snapshot_vars(&varmap)?;
        for ((_, a), (_, b)) in saved.iter().zip(now.iter()) {
            assert_eq!(a.flatten_all()?.to_vec1::<f32>()?, b.flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(())
    }
}
