use crate::candle_aux_linear::xavier_linear;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Linear, Module, ModuleT, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
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
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut M> {
        self.module_layers.iter_mut()
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

pub fn bn_config() -> candle_nn::BatchNormConfig {
    candle_nn::BatchNormConfig {
        eps: 1e-5,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    }
}

/// `(linear -> relu -> batchnorm)*` followed by a final linear layer
pub struct BatchNormStack {
    blocks: Vec<(Linear, BatchNorm)>,
    out: Linear,
}

impl ModuleT for BatchNormStack {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (linear, bn) in self.blocks.iter() {
            x = linear.forward(&x)?.relu()?;
            x = bn.forward_t(&x, train)?;
        }
        self.out.forward(&x)
    }
}

/// Will create a batch-normalized feed-forward stack with these variables:
///
/// * `fc.{}.weight`, `fc.{}.bias` where {} is the layer index
/// * `bn.{}` batch norm statistics and affine terms
/// * `out.weight`, `out.bias`
///
/// # Arguments
/// * `in_dim` - input dimension
/// * `layers` - hidden widths
/// * `out_dim` - output dimension
/// * `vb` - variable builder
pub fn stack_relu_bn_linear(
    in_dim: usize,
    layers: &[usize],
    out_dim: usize,
    vb: VarBuilder,
) -> Result<BatchNormStack> {
    let mut blocks = Vec::with_capacity(layers.len());
    let mut prev_dim = in_dim;
    for (j, &next_dim) in layers.iter().enumerate() {
        let linear = xavier_linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?;
        let bn = candle_nn::batch_norm(next_dim, bn_config(), vb.pp(format!("bn.{}", j)))?;
        blocks.push((linear, bn));
        prev_dim = next_dim;
    }
    let out = xavier_linear(prev_dim, out_dim, vb.pp("out"))?;
    Ok(BatchNormStack { blocks, out })
}
