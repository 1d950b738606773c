use crate::candle_made::MaskMatrix;
use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// Bias initialization shared by every affine layer of the model
pub const BIAS_INIT: f64 = 0.01;

fn xavier_uniform(in_dim: usize, out_dim: usize) -> Init {
    let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// A plain linear layer with Xavier-uniform weights and a small
/// constant bias.
///
/// * `weight` - (out_dim x in_dim)
/// * `bias` - (out_dim)
pub fn xavier_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", xavier_uniform(in_dim, out_dim))?;
    let bs = vb.get_with_hints(out_dim, "bias", Init::Const(BIAS_INIT))?;
    Ok(Linear::new(ws, Some(bs)))
}

////////////////////////////////////////////
// Linear module with a binary weight mask //
////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct MaskedLinear {
    in_dim: usize,
    out_dim: usize,
    weight_oi: Tensor,
    bias_o: Option<Tensor>,
    mask_oi: Tensor,
}

impl MaskedLinear {
    /// The mask starts fully connected (all ones).
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        weight_oi: Tensor,
        bias_o: Option<Tensor>,
    ) -> Result<Self> {
        let mask_oi = Tensor::ones((out_dim, in_dim), weight_oi.dtype(), weight_oi.device())?;
        Ok(Self {
            in_dim,
            out_dim,
            weight_oi,
            bias_o,
            mask_oi,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask_oi
    }

    /// Replace the stored connectivity mask.  The mask is a constant
    /// tensor, so no gradient flows through it.
    pub fn set_mask(&mut self, mask: &MaskMatrix) -> Result<()> {
        if mask.rows() != self.out_dim || mask.cols() != self.in_dim {
            return Err(candle_core::Error::Msg(format!(
                "mask {} x {} does not match weight {} x {}",
                mask.rows(),
                mask.cols(),
                self.out_dim,
                self.in_dim
            )));
        }
        let data = mask.data().iter().map(|&m| m as f32).collect::<Vec<_>>();
        self.mask_oi = Tensor::from_vec(data, (self.out_dim, self.in_dim), self.weight_oi.device())?
            .to_dtype(self.weight_oi.dtype())?;
        Ok(())
    }

    /// effective weights `M ⊙ W`
    pub fn weight(&self) -> Result<Tensor> {
        self.weight_oi.mul(&self.mask_oi)
    }
}

impl Module for MaskedLinear {
    fn forward(&self, x_ni: &Tensor) -> Result<Tensor> {
        let w_oi = self.weight()?;

        let w_io = match *x_ni.dims() {
            [b1, b2, _, _] => w_oi.broadcast_left((b1, b2))?.t()?,
            [bsize, _, _] => w_oi.broadcast_left(bsize)?.t()?,
            _ => w_oi.t()?,
        };

        let h_no = x_ni.matmul(&w_io)?;

        match &self.bias_o {
            None => Ok(h_no),
            Some(bias) => h_no.broadcast_add(bias),
        }
    }
}

/// Create a masked linear layer with these variables:
/// * `weight` (out_dim x in_dim), Xavier-uniform
/// * `bias` (out_dim)
pub fn masked_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<MaskedLinear> {
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", xavier_uniform(in_dim, out_dim))?;
    let bs = vb.get_with_hints(out_dim, "bias", Init::Const(BIAS_INIT))?;
    MaskedLinear::new(in_dim, out_dim, ws, Some(bs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn masked_weights_are_zeroed() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &dev)?;
        let b = Tensor::zeros(3, DType::F32, &dev)?;
        let mut layer = MaskedLinear::new(2, 3, w, Some(b))?;

        layer.set_mask(&MaskMatrix::from_fn(3, 2, |o, i| o == i))?;

        let x = Tensor::new(&[[1f32, 1.]], &dev)?;
        let y = layer.forward(&x)?.to_vec2::<f32>()?;
        assert_eq!(y, vec![vec![1., 4., 0.]]);
        Ok(())
    }

    #[test]
    fn mask_shape_mismatch_fails() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::zeros((3, 2), DType::F32, &dev)?;
        let mut layer = MaskedLinear::new(2, 3, w, None)?;
        assert!(layer.set_mask(&MaskMatrix::from_fn(2, 3, |_, _| true)).is_err());
        Ok(())
    }
}
