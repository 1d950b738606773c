use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use candle_core::{DType, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};

/// Flatten the first `len` time points of every channel:
/// (n x c x t) -> (n x c*len)
fn flatten_prefix(x_nct: &Tensor, len: usize) -> Result<Tensor> {
    let (n, c, t) = x_nct.dims3()?;
    if t < len {
        return Err(candle_core::Error::Msg(format!(
            "sequence of length {} is shorter than the encoder context {}",
            t, len
        )));
    }
    x_nct.narrow(2, 0, len)?.contiguous()?.reshape((n, c * len))
}

/// Encodes the pre-horizon context of each sequence into a Gaussian.
pub struct PrefixEncoder {
    n_channels: usize,
    input_lim: usize,
    latent_dim: usize,
    dtype: DType,
    fc: BatchNormStack,
}

impl PrefixEncoder {
    /// Will create a prefix encoder with these variables:
    /// * `nn.enc.fc.{}`, `nn.enc.bn.{}` hidden blocks
    /// * `nn.enc.out` producing `[mean, lnvar]`
    ///
    /// # Arguments
    /// * `n_channels` - activity channels
    /// * `input_lim` - number of leading time points seen by the encoder
    /// * `latent_dim` - latent code size
    /// * `layers` - hidden widths
    /// * `vb` - variable builder
    pub fn new(
        n_channels: usize,
        input_lim: usize,
        latent_dim: usize,
        layers: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let dtype = vb.dtype();
        let fc = stack_relu_bn_linear(
            n_channels * input_lim,
            layers,
            2 * latent_dim,
            vb.pp("nn.enc"),
        )?;
        Ok(Self {
            n_channels,
            input_lim,
            latent_dim,
            dtype,
            fc,
        })
    }

    ///
    /// Evaluate latent Gaussian parameters: mu and log_var
    /// z ~ (mu(x), log_var(x))
    fn latent_gaussian_params(&self, x_nct: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let x_nd = flatten_prefix(&x_nct.to_dtype(self.dtype)?, self.input_lim)?;
        let h_n2k = self.fc.forward_t(&x_nd, train)?;
        let z_mean = h_n2k.narrow(1, 0, self.latent_dim)?;
        let z_lnvar = h_n2k.narrow(1, self.latent_dim, self.latent_dim)?;
        Ok((z_mean, z_lnvar))
    }

    pub fn dim_obs(&self) -> usize {
        self.n_channels * self.input_lim
    }
}

impl SequenceEncoderT for PrefixEncoder {
    fn encode(&self, x_nct: &Tensor, train: bool) -> Result<EncodedSequence> {
        let (z_mean, z_lnvar) = self.latent_gaussian_params(x_nct, train)?;
        Ok(EncodedSequence {
            z_mean,
            z_lnvar,
            cluster_logits: None,
        })
    }

    fn dim_latent(&self) -> usize {
        self.latent_dim
    }

    fn num_clusters(&self) -> Option<usize> {
        None
    }
}

/// Prefix encoder plus a cluster classifier over the whole sequence.
pub struct ClusterPrefixEncoder {
    prefix: PrefixEncoder,
    seq_len: usize,
    n_clusters: usize,
    cluster_fc: BatchNormStack,
}

impl ClusterPrefixEncoder {
    /// Will create the encoder with the variables of [`PrefixEncoder`] and
    /// * `nn.cluster.fc.{}`, `nn.cluster.bn.{}`, `nn.cluster.out`
    ///
    /// # Arguments
    /// * `seq_len` - full sequence length fed to the classifier
    /// * `n_clusters` - number of behavioral clusters
    /// * `cluster_layers` - classifier hidden widths
    pub fn new(
        prefix: PrefixEncoder,
        seq_len: usize,
        n_clusters: usize,
        cluster_layers: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let cluster_fc = stack_relu_bn_linear(
            prefix.n_channels * seq_len,
            cluster_layers,
            n_clusters,
            vb.pp("nn.cluster"),
        )?;
        Ok(Self {
            prefix,
            seq_len,
            n_clusters,
            cluster_fc,
        })
    }
}

impl SequenceEncoderT for ClusterPrefixEncoder {
    fn encode(&self, x_nct: &Tensor, train: bool) -> Result<EncodedSequence> {
        let (n, c, t) = x_nct.dims3()?;
        if t != self.seq_len {
            return Err(candle_core::Error::Msg(format!(
                "cluster head expects {} time points, got {}",
                self.seq_len, t
            )));
        }
        let (z_mean, z_lnvar) = self.prefix.latent_gaussian_params(x_nct, train)?;
        let x_nd = x_nct.to_dtype(self.prefix.dtype)?.reshape((n, c * t))?;
        let cluster_logits = self.cluster_fc.forward_t(&x_nd, train)?;
        Ok(EncodedSequence {
            z_mean,
            z_lnvar,
            cluster_logits: Some(cluster_logits),
        })
    }

    fn dim_latent(&self) -> usize {
        self.prefix.latent_dim
    }

    fn num_clusters(&self) -> Option<usize> {
        Some(self.n_clusters)
    }
}
