use candle_core::{Result, Tensor};

/// Gaussian latent parameters, plus cluster logits when the encoder
/// predicts a behavioral cluster
pub struct EncodedSequence {
    /// mean (n x h)
    pub z_mean: Tensor,
    /// log variance (n x h)
    pub z_lnvar: Tensor,
    /// unnormalized cluster scores (n x K)
    pub cluster_logits: Option<Tensor>,
}

pub trait SequenceEncoderT {
    /// Encode activity sequences
    ///
    /// # Arguments
    /// * `x_nct` - counts (n x channels x time)
    /// * `train` - whether batch norm uses batch statistics
    fn encode(&self, x_nct: &Tensor, train: bool) -> Result<EncodedSequence>;

    fn dim_latent(&self) -> usize;

    /// `None` for encoders without a cluster head
    fn num_clusters(&self) -> Option<usize>;
}

pub trait SequenceDecoderT {
    /// Teacher-forced decoding
    ///
    /// # Arguments
    /// * `x_nct` - observed counts (n x channels x time)
    /// * `z_nh` - latent code (n x h)
    ///
    /// # Returns raw outputs (n x channels x heads x (time - 1))
    fn decode(&self, x_nct: &Tensor, z_nh: &Tensor) -> Result<Tensor>;

    fn num_heads(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait EffectModuleT {
    /// Additive effects of every cluster option
    /// (K x channels x heads x horizon)
    fn effect_options(&self) -> Result<Tensor>;

    fn num_clusters(&self) -> usize;

    fn num_heads(&self) -> usize;
}
