use crate::candle_aux_linear::xavier_linear;
use crate::candle_model_traits::SequenceDecoderT;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Init, Linear, Module, VarBuilder};

//////////////////////////
// Gated recurrent unit //
//////////////////////////

pub struct GruCell {
    hidden_dim: usize,
    input_gates: Linear,
    hidden_gates: Linear,
}

impl GruCell {
    /// Will create a GRU cell with these variables:
    /// * `ih.weight` (3h x in_dim), `ih.bias`
    /// * `hh.weight` (3h x h), `hh.bias`
    ///
    /// gates are stacked as (reset, update, new)
    pub fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (hidden_dim as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gates = 3 * hidden_dim;

        let w_ih = vb.pp("ih").get_with_hints((gates, in_dim), "weight", init)?;
        let b_ih = vb.pp("ih").get_with_hints(gates, "bias", init)?;
        let w_hh = vb.pp("hh").get_with_hints((gates, hidden_dim), "weight", init)?;
        let b_hh = vb.pp("hh").get_with_hints(gates, "bias", init)?;

        Ok(Self {
            hidden_dim,
            input_gates: Linear::new(w_ih, Some(b_ih)),
            hidden_gates: Linear::new(w_hh, Some(b_hh)),
        })
    }

    /// One recurrent step
    ///
    /// r = σ(W_ir x + W_hr h)
    /// u = σ(W_iu x + W_hu h)
    /// n = tanh(W_in x + r ⊙ (W_hn h))
    /// h' = n + u ⊙ (h - n)
    ///
    /// * `x_ni` - input (n x in_dim)
    /// * `h_nh` - previous state (n x h)
    pub fn step(&self, x_ni: &Tensor, h_nh: &Tensor) -> Result<Tensor> {
        let hd = self.hidden_dim;
        let gi = self.input_gates.forward(x_ni)?;
        let gh = self.hidden_gates.forward(h_nh)?;

        let reset = ops::sigmoid(&(gi.narrow(1, 0, hd)? + gh.narrow(1, 0, hd)?)?)?;
        let update = ops::sigmoid(&(gi.narrow(1, hd, hd)? + gh.narrow(1, hd, hd)?)?)?;
        let new = (gi.narrow(1, 2 * hd, hd)? + reset.mul(&gh.narrow(1, 2 * hd, hd)?)?)?.tanh()?;

        &new + update.mul(&h_nh.sub(&new)?)?
    }
}

///////////////////////////////////
// Autoregressive count decoder //
///////////////////////////////////

/// Teacher-forced recurrent decoder.  Every channel of every sequence
/// is decoded as its own row, all rows starting from the user's latent
/// code in each recurrent layer.
pub struct GruSequenceDecoder {
    latent_dim: usize,
    num_heads: usize,
    layers: Vec<GruCell>,
    head: Linear,
}

impl GruSequenceDecoder {
    /// Will create a decoder with these variables:
    /// * `gru.{}.ih`, `gru.{}.hh` where {} is the recurrent layer index
    /// * `head.weight`, `head.bias`
    ///
    /// # Arguments
    /// * `latent_dim` - latent code size, also the recurrent state size
    /// * `num_layers` - number of stacked recurrent layers
    /// * `num_heads` - outputs per step (2 for ZIP, 1 for Poisson)
    /// * `vb` - variable builder
    pub fn new(
        latent_dim: usize,
        num_layers: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 || latent_dim == 0 {
            return Err(candle_core::Error::Msg(
                "decoder needs at least one layer and a non-empty latent code".to_string(),
            ));
        }
        let layers = (0..num_layers)
            .map(|l| {
                let in_dim = if l == 0 { 1 } else { latent_dim };
                GruCell::new(in_dim, latent_dim, vb.pp(format!("gru.{}", l)))
            })
            .collect::<Result<Vec<_>>>()?;
        let head = xavier_linear(latent_dim, num_heads, vb.pp("head"))?;

        Ok(Self {
            latent_dim,
            num_heads,
            layers,
            head,
        })
    }
}

impl SequenceDecoderT for GruSequenceDecoder {
    fn decode(&self, x_nct: &Tensor, z_nh: &Tensor) -> Result<Tensor> {
        let (n, c, t) = x_nct.dims3()?;
        if t < 2 {
            return Err(candle_core::Error::Msg(format!(
                "need at least two time points to decode, got {}",
                t
            )));
        }
        let (nz, h) = z_nh.dims2()?;
        if nz != n || h != self.latent_dim {
            return Err(candle_core::Error::Msg(format!(
                "latent code {} x {} does not match batch {} / latent {}",
                nz, h, n, self.latent_dim
            )));
        }

        let x_rt = x_nct.to_dtype(z_nh.dtype())?.reshape((n * c, t))?;
        let z_rh = z_nh
            .unsqueeze(1)?
            .broadcast_as((n, c, h))?
            .reshape((n * c, h))?;

        let mut states = vec![z_rh; self.layers.len()];
        let mut steps = Vec::with_capacity(t - 1);

        for s in 0..(t - 1) {
            let mut input = x_rt.narrow(1, s, 1)?.contiguous()?;
            for (cell, state) in self.layers.iter().zip(states.iter_mut()) {
                *state = cell.step(&input, state)?;
                input = state.clone();
            }
            steps.push(self.head.forward(&input.relu()?)?);
        }

        Tensor::stack(&steps, 2)?.reshape((n, c, self.num_heads, t - 1))
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn dim_latent(&self) -> usize {
        self.latent_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn decoded_shape_drops_one_step() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let decoder = GruSequenceDecoder::new(8, 2, 2, vb)?;

        let x = Tensor::ones((3, 2, 11), DType::F32, &dev)?;
        let z = Tensor::randn(0f32, 1., (3, 8), &dev)?;
        let out = decoder.decode(&x, &z)?;
        assert_eq!(out.dims(), &[3, 2, 2, 10]);
        Ok(())
    }

    #[test]
    fn step_depends_only_on_the_past() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let decoder = GruSequenceDecoder::new(4, 1, 2, vb)?;
        let z = Tensor::randn(0f32, 1., (1, 4), &dev)?;

        let a = Tensor::new(&[[[1f32, 0., 2., 3., 0.]]], &dev)?;
        let b = Tensor::new(&[[[1f32, 0., 2., 9., 5.]]], &dev)?;
        let out_a = decoder.decode(&a, &z)?.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        let out_b = decoder.decode(&b, &z)?.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;

        for head in 0..2 {
            assert_eq!(out_a[head][..3], out_b[head][..3]);
            assert_ne!(out_a[head][3], out_b[head][3]);
        }
        Ok(())
    }
}
