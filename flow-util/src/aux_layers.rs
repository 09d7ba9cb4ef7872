use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// Linear layer whose weight is multiplied elementwise by a fixed
/// binary mask before use. The mask is not a parameter.
#[derive(Clone, Debug)]
pub struct MaskedLinear {
    weight: Tensor,
    bias: Tensor,
    mask: Tensor,
}

impl MaskedLinear {
    pub fn new(weight: Tensor, bias: Tensor, mask: Tensor) -> Self {
        Self { weight, bias, mask }
    }

    /// effective weight `W ⊙ M`, shape (out, in)
    pub fn weight(&self) -> Result<Tensor> {
        &self.weight * &self.mask
    }
}

impl Module for MaskedLinear {
    fn forward(&self, x_nd: &Tensor) -> Result<Tensor> {
        x_nd.matmul(&self.weight()?.t()?)?
            .broadcast_add(&self.bias)
    }
}

/// Create a masked linear layer
///
/// * `mask` - flattened (out_dim x in_dim) 0/1 mask, row major
/// * `vb` - variable builder; creates `weight` and `bias`
///
pub fn masked_linear(
    in_dim: usize,
    out_dim: usize,
    mask: Vec<f32>,
    vb: candle_nn::VarBuilder,
) -> Result<MaskedLinear> {
    debug_assert_eq!(mask.len(), in_dim * out_dim);
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", candle_nn::init::ZERO)?;
    let bs = vb.get_with_hints((1, out_dim), "bias", candle_nn::init::ZERO)?;
    let mask = Tensor::from_vec(mask, (out_dim, in_dim), vb.device())?.to_dtype(vb.dtype())?;
    Ok(MaskedLinear::new(ws, bs, mask))
}

/// A stack of modules, each optionally followed by an activation
pub struct StackLayers<M>
where
    M: Module,
{
    layers: Vec<(M, Option<Activation>)>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.layers.iter() {
            x = module.forward(&x)?;
            if let Some(act) = activation {
                x = act.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { layers: vec![] }
    }

    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.layers.push((layer, Some(activation)));
    }

    pub fn push(&mut self, layer: M) {
        self.layers.push((layer, None));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn masked_weight_zeroes_blocked_connections() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = masked_linear(2, 2, vec![1., 0., 1., 1.], vb.pp("m"))?;

        for var in varmap.all_vars() {
            var.set(&var.ones_like()?)?;
        }

        let w = layer.weight()?.to_vec2::<f32>()?;
        assert_eq!(w, vec![vec![1., 0.], vec![1., 1.]]);

        let x = Tensor::new(&[[2f32, 3.]], &Device::Cpu)?;
        let y = layer.forward(&x)?.to_vec2::<f32>()?;
        assert_eq!(y, vec![vec![3., 6.]]);
        Ok(())
    }

    #[test]
    fn empty_stack_is_identity() -> Result<()> {
        let stack: StackLayers<MaskedLinear> = StackLayers::new();
        let x = Tensor::new(&[[1f32, -1.]], &Device::Cpu)?;
        assert_eq!(stack.forward(&x)?.to_vec2::<f32>()?, x.to_vec2::<f32>()?);
        Ok(())
    }
}
