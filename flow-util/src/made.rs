use crate::aux_layers::*;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// Log-scales are squashed into (-BOUND, BOUND) by `BOUND * tanh(s / BOUND)`
pub const LOG_SCALE_BOUND: f64 = 5.0;

/// Masked autoencoder for distribution estimation (MADE).
///
/// Maps `v` (n, D) and an optional context `c` (n, C) to a shift and
/// a log-scale (n, D) each, such that output `d` depends only on
/// `v[.., 0..d]` and on the context.
pub struct Made {
    dim: usize,
    input: MaskedLinear,
    context: Option<Linear>,
    hidden: StackLayers<MaskedLinear>,
    output: MaskedLinear,
}

pub struct MadeArgs {
    pub dim: usize,
    pub context_dim: usize,
    pub hidden_features: usize,
    pub num_blocks: usize,
}

impl Made {
    pub fn new(args: &MadeArgs, vb: VarBuilder) -> Result<Self> {
        let d = args.dim;
        let h = args.hidden_features;
        debug_assert!(d > 0 && h > 0 && args.num_blocks > 0);

        let in_deg = input_degrees(d);
        let hid_deg = hidden_degrees(d, h);
        let out_deg: Vec<usize> = in_deg.iter().chain(in_deg.iter()).copied().collect();

        let input = masked_linear(d, h, degree_mask(&hid_deg, &in_deg, false), vb.pp("input"))?;

        let context = if args.context_dim > 0 {
            let ws = vb.pp("context").get_with_hints(
                (h, args.context_dim),
                "weight",
                candle_nn::init::ZERO,
            )?;
            Some(Linear::new(ws, None))
        } else {
            None
        };

        let mut hidden = StackLayers::new();
        for b in 1..args.num_blocks {
            hidden.push_with_act(
                masked_linear(
                    h,
                    h,
                    degree_mask(&hid_deg, &hid_deg, false),
                    vb.pp(format!("hidden.{}", b)),
                )?,
                Activation::Relu,
            );
        }

        let output = masked_linear(h, 2 * d, degree_mask(&out_deg, &hid_deg, true), vb.pp("out"))?;

        Ok(Self {
            dim: d,
            input,
            context,
            hidden,
            output,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns `(shift, log_scale)`, each (n, D)
    pub fn forward(&self, v_nd: &Tensor, c_nc: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let mut h_nh = self.input.forward(v_nd)?;
        match (&self.context, c_nc) {
            (Some(layer), Some(c)) => {
                h_nh = (h_nh + layer.forward(c)?)?;
            }
            (Some(_), None) => candle_core::bail!("this MADE needs a context tensor"),
            _ => {}
        }
        let h_nh = self.hidden.forward(&h_nh.relu()?)?;
        let out = self.output.forward(&h_nh)?;

        let shift = out.narrow(1, 0, self.dim)?;
        let raw = out.narrow(1, self.dim, self.dim)?;
        let log_scale = ((raw / LOG_SCALE_BOUND)?.tanh()? * LOG_SCALE_BOUND)?;
        Ok((shift, log_scale))
    }
}

/// degrees 1..=D of the autoregressive inputs
pub fn input_degrees(dim: usize) -> Vec<usize> {
    (1..=dim).collect()
}

/// Hidden unit degrees cycle through 1..D-1. With D = 1 every hidden
/// unit gets degree 0 and only sees the context.
pub fn hidden_degrees(dim: usize, hidden: usize) -> Vec<usize> {
    if dim <= 1 {
        vec![0; hidden]
    } else {
        (0..hidden).map(|k| k % (dim - 1) + 1).collect()
    }
}

/// Row-major (out x in) mask. Unit `o` sees unit `i` iff
/// `deg(o) >= deg(i)`, or `deg(o) > deg(i)` when `strict`.
pub fn degree_mask(out_deg: &[usize], in_deg: &[usize], strict: bool) -> Vec<f32> {
    out_deg
        .iter()
        .flat_map(|&o| {
            in_deg.iter().map(move |&i| {
                let connected = if strict { o > i } else { o >= i };
                if connected {
                    1.
                } else {
                    0.
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::reinit_varmap;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn outputs_only_depend_on_preceding_inputs() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let args = MadeArgs {
            dim: 4,
            context_dim: 0,
            hidden_features: 16,
            num_blocks: 2,
        };
        let made = Made::new(&args, vb)?;
        let mut rng = SmallRng::seed_from_u64(7);
        reinit_varmap(&varmap, 1.0, &mut rng)?;

        let base = Tensor::new(&[[0.3f32, -0.2, 0.5, 1.0]], &dev)?;
        let (s0, l0) = made.forward(&base, None)?;
        let s0 = s0.to_vec2::<f32>()?;
        let l0 = l0.to_vec2::<f32>()?;

        for j in 0..4 {
            let mut v = vec![0.3f32, -0.2, 0.5, 1.0];
            v[j] += 1.0;
            let x = Tensor::from_vec(v, (1, 4), &dev)?;
            let (s1, l1) = made.forward(&x, None)?;
            let s1 = s1.to_vec2::<f32>()?;
            let l1 = l1.to_vec2::<f32>()?;
            for d in 0..=j {
                assert_eq!(s0[0][d], s1[0][d], "shift {} moved with input {}", d, j);
                assert_eq!(l0[0][d], l1[0][d], "log-scale {} moved with input {}", d, j);
            }
        }
        Ok(())
    }

    #[test]
    fn one_dimensional_made_sees_only_context() -> Result<()> {
        let out = degree_mask(&[1, 1], &hidden_degrees(1, 3), true);
        assert!(out.iter().all(|&m| m == 1.));
        let inp = degree_mask(&hidden_degrees(1, 3), &input_degrees(1), false);
        assert!(inp.iter().all(|&m| m == 0.));
        Ok(())
    }
}
