use crate::candle_effect_window::EffectWindow;
use crate::candle_loss_functions::{poisson_loss, zip_loss};
use crate::candle_model_config::*;
use crate::candle_model_traits::*;
use crate::candle_sequence_decoder::GruSequenceDecoder;
use crate::candle_sequence_encoder::{ClusterPrefixEncoder, PrefixEncoder};
use crate::candle_variational::latent_loss;

use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};
use log::info;
use rand::Rng;

/// Everything one forward pass produces
pub struct ModelOutput {
    /// raw outputs with effects added (n x K*C x heads x L), cluster-major
    pub predictions: Tensor,
    /// cluster log posterior (n x K), if the variant has a cluster head
    pub log_cluster: Option<Tensor>,
    /// scalar latent KL
    pub kl: Tensor,
    /// latent sample (n x h)
    pub z: Tensor,
}

/// Activity sequence VAE assembled from the strategies of a
/// [`ModelVariant`]
pub struct ActivityVae {
    config: ModelConfig,
    encoder: Box<dyn SequenceEncoderT>,
    decoder: GruSequenceDecoder,
    effect: Option<EffectWindow>,
}

impl ActivityVae {
    /// Will create the model under `vb` with these sub-modules:
    /// * `nn.enc`, `nn.cluster` - encoder(s)
    /// * `dec` - recurrent decoder
    /// * `effect` - effect magnitudes, if the variant has any
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let prefix = PrefixEncoder::new(
            config.in_channels,
            config.input_lim,
            config.latent_dim,
            &config.encoder_layers,
            vb.clone(),
        )?;

        let encoder: Box<dyn SequenceEncoderT> = match config.variant.encoder_strategy() {
            EncoderStrategy::PrefixOnly => Box::new(prefix),
            EncoderStrategy::PrefixWithClusterLogits => Box::new(ClusterPrefixEncoder::new(
                prefix,
                config.seq_len(),
                config.num_clusters(),
                &config.cluster_layers,
                vb.clone(),
            )?),
        };

        let decoder = GruSequenceDecoder::new(
            config.latent_dim,
            config.decoder_layers(),
            config.variant.likelihood().num_heads(),
            vb.pp("dec"),
        )?;

        let effect = match config.variant.weight_strategy() {
            WeightOptionStrategy::None => None,
            _ => Some(EffectWindow::new(&config, vb.pp("effect"))?),
        };

        info!(
            "{}: {} channel(s), input_lim {}, horizon {}, latent {}, \
             {} cluster(s), {} decoder layer(s)",
            config.variant.name(),
            config.in_channels,
            config.input_lim,
            config.output_len,
            config.latent_dim,
            config.num_clusters(),
            config.decoder_layers()
        );

        Ok(Self {
            config,
            encoder,
            decoder,
            effect,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_clusters(&self) -> usize {
        self.config.num_clusters()
    }

    /// Additive effects of every cluster option (K x C x heads x L)
    pub fn effect_options(&self) -> Result<Option<Tensor>> {
        self.effect.as_ref().map(|e| e.effect_options()).transpose()
    }

    /// Encode, sample, decode and add effects
    ///
    /// # Arguments
    /// * `x_nct` - counts (n x C x T)
    /// * `rng` - noise source of the latent sample
    /// * `train` - batch statistics in batch norm
    pub fn forward_t<R: Rng>(
        &self,
        x_nct: &Tensor,
        rng: &mut R,
        train: bool,
    ) -> Result<ModelOutput> {
        let (n, c, t) = x_nct.dims3()?;
        if c != self.config.in_channels {
            return Err(candle_core::Error::Msg(format!(
                "{} channels observed, {} expected",
                c, self.config.in_channels
            )));
        }

        let enc = self.encoder.encode(x_nct, train)?;
        let (z, kl) = latent_loss(&enc.z_mean, &enc.z_lnvar, rng)?;
        let recon_nchl = self.decoder.decode(x_nct, &z)?;

        let predictions = match &self.effect {
            None => recon_nchl,
            Some(effect) => {
                if t - 1 != self.config.output_len {
                    return Err(candle_core::Error::Msg(format!(
                        "effects span {} steps, sequences of length {} decode {}",
                        self.config.output_len,
                        t,
                        t - 1
                    )));
                }
                let effect_kchl = effect.effect_options()?;
                match self.config.variant.decode_strategy() {
                    DecodeStrategy::SingleHead => recon_nchl.broadcast_add(&effect_kchl)?,
                    DecodeStrategy::ClusterRepeated => {
                        let (k, _, heads, len) = effect_kchl.dims4()?;
                        recon_nchl
                            .unsqueeze(1)?
                            .broadcast_add(&effect_kchl.unsqueeze(0)?)?
                            .reshape((n, k * c, heads, len))?
                    }
                }
            }
        };

        let log_cluster = enc
            .cluster_logits
            .map(|logits| ops::log_softmax(&logits, 1))
            .transpose()?;

        Ok(ModelOutput {
            predictions,
            log_cluster,
            kl,
            z,
        })
    }

    /// Negative ELBO of the configured likelihood against `x[.., 1..]`,
    /// mixed over the encoder's cluster posterior when there is one
    pub fn loss(&self, output: &ModelOutput, x_nct: &Tensor) -> Result<Tensor> {
        self.objective(output, x_nct, output.log_cluster.as_ref())
    }

    /// Same as [`ActivityVae::loss`] with externally supplied cluster
    /// log-probabilities (n x K) in place of the encoder's posterior
    pub fn loss_with_cluster_prior(
        &self,
        output: &ModelOutput,
        x_nct: &Tensor,
        log_cluster_nk: &Tensor,
    ) -> Result<Tensor> {
        let (n, k) = log_cluster_nk.dims2()?;
        if n != x_nct.dim(0)? || k != self.num_clusters() {
            return Err(candle_core::Error::Msg(format!(
                "cluster log-probabilities {} x {} do not match batch {} / {} clusters",
                n,
                k,
                x_nct.dim(0)?,
                self.num_clusters()
            )));
        }
        self.objective(output, x_nct, Some(log_cluster_nk))
    }

    fn objective(
        &self,
        output: &ModelOutput,
        x_nct: &Tensor,
        log_cluster_nk: Option<&Tensor>,
    ) -> Result<Tensor> {
        let t = x_nct.dim(2)?;
        if t < 2 {
            return Err(candle_core::Error::Msg(format!(
                "need at least two time points to score, got {}",
                t
            )));
        }
        let target = x_nct.narrow(2, 1, t - 1)?;
        let null_mass = self.config.null_cluster_prior;

        match self.config.variant.likelihood() {
            Likelihood::ZeroInflatedPoisson => zip_loss(
                &output.predictions,
                &target,
                &output.kl,
                log_cluster_nk,
                null_mass,
            ),
            Likelihood::Poisson => poisson_loss(
                &output.predictions,
                &target,
                &output.kl,
                log_cluster_nk,
                null_mass,
            ),
        }
    }
}
