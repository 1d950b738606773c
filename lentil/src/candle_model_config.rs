use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Signed effect directions of one behavioral cluster: before/after the
/// threshold crossing, for the binary and the count head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i8>", into = "Vec<i8>")]
pub struct ClusterWeights {
    pub bin_before: i8,
    pub bin_after: i8,
    pub cnt_before: i8,
    pub cnt_after: i8,
}

impl ClusterWeights {
    pub const fn new(bin_before: i8, bin_after: i8, cnt_before: i8, cnt_after: i8) -> Self {
        Self {
            bin_before,
            bin_after,
            cnt_before,
            cnt_after,
        }
    }

    pub fn is_null(&self) -> bool {
        self.bin_before == 0 && self.bin_after == 0 && self.cnt_before == 0 && self.cnt_after == 0
    }
}

impl TryFrom<&[i8]> for ClusterWeights {
    type Error = candle_core::Error;

    fn try_from(w: &[i8]) -> candle_core::Result<Self> {
        match *w {
            [bin_before, bin_after, cnt_before, cnt_after] => {
                Ok(Self::new(bin_before, bin_after, cnt_before, cnt_after))
            }
            _ => Err(candle_core::Error::Msg(format!(
                "cluster weights need 4 entries (bin before/after, count before/after), got {}",
                w.len()
            ))),
        }
    }
}

impl TryFrom<Vec<i8>> for ClusterWeights {
    type Error = candle_core::Error;

    fn try_from(w: Vec<i8>) -> candle_core::Result<Self> {
        Self::try_from(w.as_slice())
    }
}

impl From<ClusterWeights> for Vec<i8> {
    fn from(w: ClusterWeights) -> Self {
        vec![w.bin_before, w.bin_after, w.cnt_before, w.cnt_after]
    }
}

/// How the encoder reads a sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderStrategy {
    /// Gaussian code from the leading `input_lim` steps
    PrefixOnly,
    /// Gaussian code from the prefix, cluster logits from the full sequence
    PrefixWithClusterLogits,
}

/// How learned effect magnitudes map onto the horizon
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightOptionStrategy {
    /// no additive effect
    None,
    /// one magnitude per horizon step, sign flipped after the crossing
    TimeIndexed,
    /// four (before/after x positive/negative) slots shared by all clusters
    SharedSlots,
    /// four slots per cluster
    PerClusterSlots,
    /// four shared slots for the count head only
    CountSlots,
}

/// How decoder output is laid out against the clusters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// one output per channel
    SingleHead,
    /// the decoder output repeated for every cluster option
    ClusterRepeated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Likelihood {
    ZeroInflatedPoisson,
    Poisson,
}

impl Likelihood {
    /// decoder outputs per step
    pub fn num_heads(&self) -> usize {
        match self {
            Likelihood::ZeroInflatedPoisson => 2,
            Likelihood::Poisson => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Baseline,
    TimeEffect,
    SharedClusterEffect,
    PerClusterEffect,
    ActivityFeed,
}

impl ModelVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::Baseline => "Model0",
            ModelVariant::TimeEffect => "Model1",
            ModelVariant::SharedClusterEffect => "Model2",
            ModelVariant::PerClusterEffect => "Model3",
            ModelVariant::ActivityFeed => "Model4",
        }
    }

    pub fn encoder_strategy(&self) -> EncoderStrategy {
        match self {
            ModelVariant::Baseline | ModelVariant::TimeEffect => EncoderStrategy::PrefixOnly,
            _ => EncoderStrategy::PrefixWithClusterLogits,
        }
    }

    pub fn weight_strategy(&self) -> WeightOptionStrategy {
        match self {
            ModelVariant::Baseline => WeightOptionStrategy::None,
            ModelVariant::TimeEffect => WeightOptionStrategy::TimeIndexed,
            ModelVariant::SharedClusterEffect => WeightOptionStrategy::SharedSlots,
            ModelVariant::PerClusterEffect => WeightOptionStrategy::PerClusterSlots,
            ModelVariant::ActivityFeed => WeightOptionStrategy::CountSlots,
        }
    }

    pub fn decode_strategy(&self) -> DecodeStrategy {
        match self {
            ModelVariant::Baseline | ModelVariant::TimeEffect => DecodeStrategy::SingleHead,
            _ => DecodeStrategy::ClusterRepeated,
        }
    }

    pub fn likelihood(&self) -> Likelihood {
        match self {
            ModelVariant::ActivityFeed => Likelihood::Poisson,
            _ => Likelihood::ZeroInflatedPoisson,
        }
    }
}

fn default_variant() -> ModelVariant {
    ModelVariant::Baseline
}
fn default_latent_dim() -> usize {
    20
}
fn default_threshold_cross() -> usize {
    20
}
fn default_threshold_amount() -> f64 {
    1000.
}
fn default_input_lim() -> usize {
    20
}
fn default_output_len() -> usize {
    51
}
fn default_in_channels() -> usize {
    1
}
fn default_encoder_layers() -> Vec<usize> {
    vec![100, 100]
}
fn default_cluster_layers() -> Vec<usize> {
    vec![50, 50]
}
fn default_cluster_weights() -> Vec<ClusterWeights> {
    vec![ClusterWeights::new(0, 0, 0, 0), ClusterWeights::new(1, 0, 1, 0)]
}
fn default_null_cluster_prior() -> f64 {
    0.9
}

/// Model hyperparameters, immutable once the model is built
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_variant")]
    pub variant: ModelVariant,
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    /// time index separating the before/after regimes
    #[serde(default = "default_threshold_cross")]
    pub date_of_threshold_cross: usize,
    /// size of the threshold that defines the event (bookkeeping only)
    #[serde(default = "default_threshold_amount")]
    pub threshold_amount: f64,
    /// leading time points seen by the Gaussian encoder
    #[serde(default = "default_input_lim")]
    pub input_lim: usize,
    /// decoded horizon; sequences carry `output_len + 1` time points
    #[serde(default = "default_output_len")]
    pub output_len: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// hold the effect constant across the crossing boundary
    #[serde(default)]
    pub block: bool,
    #[serde(default = "default_encoder_layers")]
    pub encoder_layers: Vec<usize>,
    #[serde(default = "default_cluster_layers")]
    pub cluster_layers: Vec<usize>,
    #[serde(default = "default_cluster_weights")]
    pub cluster_weights: Vec<ClusterWeights>,
    /// prior mass of cluster 0 in the mixture objective
    #[serde(default = "default_null_cluster_prior")]
    pub null_cluster_prior: f64,
    /// recurrent layers, `in_channels` when unset
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::for_variant(ModelVariant::Baseline)
    }
}

impl ModelConfig {
    /// Preset of a named variant
    pub fn for_variant(variant: ModelVariant) -> Self {
        let (encoder_layers, cluster_weights) = match variant {
            ModelVariant::Baseline | ModelVariant::TimeEffect => {
                (default_encoder_layers(), default_cluster_weights())
            }
            ModelVariant::SharedClusterEffect | ModelVariant::PerClusterEffect => {
                (vec![50, 50], default_cluster_weights())
            }
            ModelVariant::ActivityFeed => (
                vec![50, 50],
                vec![ClusterWeights::new(0, 0, 0, 0), ClusterWeights::new(0, 0, 1, -1)],
            ),
        };

        Self {
            variant,
            latent_dim: default_latent_dim(),
            date_of_threshold_cross: default_threshold_cross(),
            threshold_amount: default_threshold_amount(),
            input_lim: default_input_lim(),
            output_len: default_output_len(),
            in_channels: default_in_channels(),
            block: false,
            encoder_layers,
            cluster_layers: default_cluster_layers(),
            cluster_weights,
            null_cluster_prior: default_null_cluster_prior(),
            num_decoder_layers: None,
        }
    }

    /// Named options override the preset of the chosen `variant`
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let overrides: serde_json::Value =
            serde_json::from_str(json).context("parsing model config")?;
        let serde_json::Value::Object(overrides) = overrides else {
            anyhow::bail!("model config must be a JSON object");
        };

        let variant = match overrides.get("variant") {
            Some(v) => serde_json::from_value(v.clone()).context("unknown model variant")?,
            None => default_variant(),
        };

        let mut merged = serde_json::to_value(Self::for_variant(variant))?;
        if let serde_json::Value::Object(fields) = &mut merged {
            fields.extend(overrides);
        }

        let config: Self = serde_json::from_value(merged).context("parsing model config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading model config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sequence length the model expects: the horizon plus one step to
    /// predict the first horizon point from
    pub fn seq_len(&self) -> usize {
        self.output_len + 1
    }

    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.in_channels)
    }

    pub fn num_clusters(&self) -> usize {
        match self.variant.weight_strategy() {
            WeightOptionStrategy::None | WeightOptionStrategy::TimeIndexed => 1,
            _ => self.cluster_weights.len(),
        }
    }

    pub fn validate(&self) -> candle_core::Result<()> {
        let fail = |msg: String| Err(candle_core::Error::Msg(msg));

        if self.latent_dim == 0 {
            return fail("latent_dim must be positive".into());
        }
        if self.in_channels == 0 {
            return fail("in_channels must be positive".into());
        }
        if self.decoder_layers() == 0 {
            return fail("the decoder needs at least one recurrent layer".into());
        }
        if self.input_lim == 0 || self.input_lim > self.seq_len() {
            return fail(format!(
                "input_lim {} must lie in 1..={}",
                self.input_lim,
                self.seq_len()
            ));
        }
        if self.output_len < 2 {
            return fail(format!("output_len {} is too short", self.output_len));
        }
        if self.date_of_threshold_cross == 0 || self.date_of_threshold_cross > self.output_len {
            return fail(format!(
                "date_of_threshold_cross {} must lie in 1..={}",
                self.date_of_threshold_cross, self.output_len
            ));
        }
        if !(self.null_cluster_prior > 0. && self.null_cluster_prior < 1.) {
            return fail(format!(
                "null_cluster_prior {} must lie in (0, 1)",
                self.null_cluster_prior
            ));
        }
        if self.block && self.output_len < 6 {
            return fail("block smoothing needs output_len >= 6".into());
        }

        let strategy = self.variant.weight_strategy();
        let uses_weights = !matches!(
            strategy,
            WeightOptionStrategy::None | WeightOptionStrategy::TimeIndexed
        );
        if uses_weights && self.cluster_weights.len() < 2 {
            return fail(format!(
                "{} needs at least two cluster weight options",
                self.variant.name()
            ));
        }
        if strategy == WeightOptionStrategy::CountSlots
            && self
                .cluster_weights
                .iter()
                .any(|w| w.bin_before != 0 || w.bin_after != 0)
        {
            return fail("the activity-feed variant has no binary effects".into());
        }
        if self.encoder_layers.iter().chain(self.cluster_layers.iter()).any(|&w| w == 0) {
            return fail("hidden layers must be non-empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_baseline() {
        let c = ModelConfig::default();
        assert_eq!(c.variant.name(), "Model0");
        assert_eq!(c.latent_dim, 20);
        assert_eq!(c.output_len, 51);
        assert_eq!(c.seq_len(), 52);
        assert_eq!(c.decoder_layers(), 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn json_overrides_and_weight_tuples() -> anyhow::Result<()> {
        let c = ModelConfig::from_json_str(
            r#"{ "variant": "per_cluster_effect",
                 "latent_dim": 8,
                 "cluster_weights": [[0, 0, 0, 0], [1, -1, 1, -1], [0, 1, 0, 1]] }"#,
        )?;
        assert_eq!(c.variant, ModelVariant::PerClusterEffect);
        assert_eq!(c.latent_dim, 8);
        assert_eq!(c.num_clusters(), 3);
        assert_eq!(c.cluster_weights[1], ClusterWeights::new(1, -1, 1, -1));

        let again = ModelConfig::from_json_str(&c.to_json_string()?)?;
        assert_eq!(again, c);
        Ok(())
    }

    #[test]
    fn json_starts_from_the_variant_preset() -> anyhow::Result<()> {
        let c = ModelConfig::from_json_str(r#"{ "variant": "activity_feed", "in_channels": 2 }"#)?;
        assert_eq!(c.encoder_layers, vec![50, 50]);
        assert_eq!(c.cluster_weights[1], ClusterWeights::new(0, 0, 1, -1));
        assert_eq!(c.decoder_layers(), 2);

        assert!(ModelConfig::from_json_str("[1, 2]").is_err());
        Ok(())
    }

    #[test]
    fn malformed_weight_arity_is_rejected() {
        let err = ModelConfig::from_json_str(
            r#"{ "variant": "shared_cluster_effect",
                 "cluster_weights": [[0, 0, 0], [1, 0, 1, 0]] }"#,
        );
        assert!(err.is_err());
        assert!(ClusterWeights::try_from(&[1i8, 0][..]).is_err());
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        let mut c = ModelConfig::for_variant(ModelVariant::TimeEffect);
        c.date_of_threshold_cross = 0;
        assert!(c.validate().is_err());

        let mut c = ModelConfig::for_variant(ModelVariant::ActivityFeed);
        c.cluster_weights = vec![ClusterWeights::new(0, 0, 0, 0), ClusterWeights::new(1, 0, 1, 0)];
        assert!(c.validate().is_err());
    }
}
