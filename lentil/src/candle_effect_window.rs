use crate::candle_aux_ops::{gaussian_window, softplus};
use crate::candle_model_config::{ClusterWeights, ModelConfig, WeightOptionStrategy};
use crate::candle_model_traits::EffectModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// structural offset of "positive-effect" (even) and "negative-effect"
/// (odd) slots
const POSITIVE_OFFSET: f32 = 0.5;
const NEGATIVE_OFFSET: f32 = 0.2;

/// Time-windowed additive effects around the threshold crossing.
///
/// Raw magnitudes `k_binomial` and `k_activity` are made positive by
/// softplus and shifted by a Gaussian-windowed structural offset.
/// Slots `4i, 4i+1` are "before" magnitudes (window centered at
/// `t_cross - 1`), slots `4i+2, 4i+3` are "after" magnitudes (window
/// centered at 0); even slots are positive effects, odd slots negative.
pub struct EffectWindow {
    strategy: WeightOptionStrategy,
    n_channels: usize,
    output_len: usize,
    t_cross: usize,
    block: bool,
    weights: Vec<ClusterWeights>,
    k_binomial: Option<Tensor>,
    k_activity: Tensor,
    offset: Tensor,
}

impl EffectWindow {
    /// Will create the effect module with these variables:
    /// * `effect.k_binomial` (binary head, absent for the count-only layout)
    /// * `effect.k_activity` (count head)
    ///
    /// shaped `[C, L]` (time-indexed) or `[C, slots, L - L/2]`
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let strategy = config.variant.weight_strategy();
        let shape = Self::param_shape(strategy, config)?;
        let init = Init::Randn {
            mean: 0.,
            stdev: 0.1,
        };

        let k_binomial = match strategy {
            WeightOptionStrategy::CountSlots => None,
            _ => Some(vb.get_with_hints(shape.as_slice(), "k_binomial", init)?),
        };
        let k_activity = vb.get_with_hints(shape.as_slice(), "k_activity", init)?;

        Self::from_parts(config, k_binomial, k_activity)
    }

    /// Assemble the module around existing magnitude tensors
    pub fn from_parts(
        config: &ModelConfig,
        k_binomial: Option<Tensor>,
        k_activity: Tensor,
    ) -> Result<Self> {
        let strategy = config.variant.weight_strategy();
        let shape = Self::param_shape(strategy, config)?;
        if k_activity.dims() != shape.as_slice() {
            return Err(candle_core::Error::Msg(format!(
                "k_activity {:?} should be {:?}",
                k_activity.dims(),
                shape
            )));
        }
        let needs_binomial = strategy != WeightOptionStrategy::CountSlots;
        match &k_binomial {
            Some(k) if !needs_binomial || k.dims() != shape.as_slice() => {
                return Err(candle_core::Error::Msg(format!(
                    "unexpected k_binomial {:?}",
                    k.dims()
                )));
            }
            None if needs_binomial => {
                return Err(candle_core::Error::Msg("missing k_binomial".to_string()));
            }
            _ => {}
        }

        let offset = Tensor::from_vec(
            structural_offset(&shape, config.date_of_threshold_cross),
            shape.as_slice(),
            k_activity.device(),
        )?
        .to_dtype(k_activity.dtype())?;

        Ok(Self {
            strategy,
            n_channels: config.in_channels,
            output_len: config.output_len,
            t_cross: config.date_of_threshold_cross,
            block: config.block,
            weights: config.cluster_weights.clone(),
            k_binomial,
            k_activity,
            offset,
        })
    }

    fn param_shape(strategy: WeightOptionStrategy, config: &ModelConfig) -> Result<Vec<usize>> {
        let c = config.in_channels;
        let l = config.output_len;
        let after_len = l - l / 2;
        match strategy {
            WeightOptionStrategy::None => Err(candle_core::Error::Msg(
                "this variant has no effect window".to_string(),
            )),
            WeightOptionStrategy::TimeIndexed => Ok(vec![c, l]),
            WeightOptionStrategy::SharedSlots | WeightOptionStrategy::CountSlots => {
                Ok(vec![c, 4, after_len])
            }
            WeightOptionStrategy::PerClusterSlots => {
                Ok(vec![c, 4 * config.cluster_weights.len(), after_len])
            }
        }
    }

    /// softplus(k_binomial) + windowed offset
    pub fn k_bin_pos(&self) -> Result<Option<Tensor>> {
        match &self.k_binomial {
            Some(k) => Ok(Some((softplus(k)? + &self.offset)?)),
            None => Ok(None),
        }
    }

    /// softplus(k_activity) + windowed offset
    pub fn k_act_pos(&self) -> Result<Tensor> {
        softplus(&self.k_activity)? + &self.offset
    }

    /// +1 before the threshold crossing, -1 from the crossing on
    pub fn effect_weight(&self) -> Vec<f32> {
        (0..self.output_len)
            .map(|t| if t < self.t_cross { 1. } else { -1. })
            .collect()
    }

    fn time_indexed_options(&self) -> Result<Tensor> {
        let ew = Tensor::from_vec(
            self.effect_weight(),
            (1, self.output_len),
            self.k_activity.device(),
        )?
        .to_dtype(self.k_activity.dtype())?;
        let act = self.k_act_pos()?.broadcast_mul(&ew)?;
        let bin = match self.k_bin_pos()? {
            Some(k) => k.broadcast_mul(&ew)?,
            None => act.zeros_like()?,
        };
        // 1 x C x 2 x L
        Tensor::stack(&[bin, act], 1)?.unsqueeze(0)
    }

    /// One head's effect over the whole horizon for one cluster
    ///
    /// * `pos_csp` - positive magnitudes (C x slots x P)
    /// * `base` - first slot of this cluster
    /// * `before`, `after` - signed effect directions
    fn half_split_effect(
        &self,
        pos_csp: &Tensor,
        base: usize,
        before: i8,
        after: i8,
    ) -> Result<Tensor> {
        let half = self.output_len / 2;
        let rest = self.output_len - half;

        let pick = |slot: usize, len: usize, sign: i8| -> Result<Tensor> {
            if sign == 0 {
                Tensor::zeros((self.n_channels, len), pos_csp.dtype(), pos_csp.device())
            } else {
                pos_csp.narrow(1, slot, 1)?.squeeze(1)?.narrow(1, 0, len)? * (sign as f64)
            }
        };

        let before_ch = pick(base + if before > 0 { 0 } else { 1 }, half, before)?;
        let after_ch = pick(base + if after > 0 { 2 } else { 3 }, rest, after)?;
        let effect_cl = Tensor::cat(&[before_ch, after_ch], 1)?;

        if self.block {
            self.smooth_boundary(&effect_cl)
        } else {
            Ok(effect_cl)
        }
    }

    /// Hold `[L/2 - 2, L/2]` at the value of step `L/2 - 3`
    fn smooth_boundary(&self, effect_cl: &Tensor) -> Result<Tensor> {
        let half = self.output_len / 2;
        let tail = self.output_len - (half + 1);
        let held = effect_cl
            .narrow(1, half - 3, 1)?
            .broadcast_as((self.n_channels, 3))?
            .contiguous()?;
        Tensor::cat(
            &[
                effect_cl.narrow(1, 0, half - 2)?,
                held,
                effect_cl.narrow(1, half + 1, tail)?,
            ],
            1,
        )
    }

    fn slot_options(&self) -> Result<Tensor> {
        let act_pos = self.k_act_pos()?;
        let bin_pos = self.k_bin_pos()?;

        let options = self
            .weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let base = match self.strategy {
                    WeightOptionStrategy::PerClusterSlots => 4 * i,
                    _ => 0,
                };
                let act = self.half_split_effect(&act_pos, base, w.cnt_before, w.cnt_after)?;
                match &bin_pos {
                    Some(bin_pos) => {
                        let bin = self.half_split_effect(bin_pos, base, w.bin_before, w.bin_after)?;
                        Tensor::stack(&[bin, act], 1)
                    }
                    None => act.unsqueeze(1),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        // K x C x heads x L
        Tensor::stack(&options, 0)
    }
}

impl EffectModuleT for EffectWindow {
    fn effect_options(&self) -> Result<Tensor> {
        match self.strategy {
            WeightOptionStrategy::TimeIndexed => self.time_indexed_options(),
            WeightOptionStrategy::None => Err(candle_core::Error::Msg(
                "this variant has no effect window".to_string(),
            )),
            _ => self.slot_options(),
        }
    }

    fn num_clusters(&self) -> usize {
        match self.strategy {
            WeightOptionStrategy::None | WeightOptionStrategy::TimeIndexed => 1,
            _ => self.weights.len(),
        }
    }

    fn num_heads(&self) -> usize {
        match self.strategy {
            WeightOptionStrategy::CountSlots => 1,
            _ => 2,
        }
    }
}

/// Offsets for magnitudes shaped `[C, L]` or `[C, slots, P]`.
///
/// In the time-indexed layout, slot and time are the same axis and the
/// window index is the position within the stride-4 sub-sequence.
fn structural_offset(shape: &[usize], t_cross: usize) -> Vec<f32> {
    let spread = t_cross as f64 / 5.;
    let horizon = *shape.last().unwrap_or(&0);
    let before = gaussian_window(horizon, t_cross as f64 - 1., spread);
    let after = gaussian_window(horizon, 0., spread);

    let value = |slot: usize, t: usize| -> f32 {
        let base = if slot % 2 == 0 {
            POSITIVE_OFFSET
        } else {
            NEGATIVE_OFFSET
        };
        let window = if slot % 4 < 2 { &before } else { &after };
        base * window[t]
    };

    match *shape {
        [c, l] => (0..c)
            .flat_map(|_| (0..l).map(|t| value(t, t / 4)))
            .collect(),
        [c, s, p] => (0..c)
            .flat_map(|_| (0..s).flat_map(move |slot| (0..p).map(move |t| (slot, t))))
            .map(|(slot, t)| value(slot, t))
            .collect(),
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_model_config::ModelVariant;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(variant: ModelVariant) -> ModelConfig {
        let mut c = ModelConfig::for_variant(variant);
        c.date_of_threshold_cross = 20;
        c.output_len = 51;
        c
    }

    #[test]
    fn null_cluster_has_no_effect_and_before_only_stays_before() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let c = config(ModelVariant::SharedClusterEffect);
        let effect = EffectWindow::new(&c, vb)?;

        let options = effect.effect_options()?;
        assert_eq!(options.dims(), &[2, 1, 2, 51]);
        let options = options.squeeze(1)?.to_vec3::<f32>()?;

        for head in 0..2 {
            assert!(options[0][head].iter().all(|&v| v == 0.));
            for t in 0..51 {
                if t < 25 {
                    assert!(options[1][head][t] > 0.);
                } else {
                    assert_eq!(options[1][head][t], 0.);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn offsets_follow_the_windows() -> Result<()> {
        let dev = Device::Cpu;
        let c = config(ModelVariant::SharedClusterEffect);
        // softplus(-100) == 0, leaving the offset
        let k = Tensor::full(-100f32, (1, 4, 26), &dev)?;
        let effect = EffectWindow::from_parts(&c, Some(k.clone()), k)?;
        let pos = effect.k_act_pos()?.squeeze(0)?.to_vec2::<f32>()?;

        assert_abs_diff_eq!(pos[0][19], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(pos[1][19], 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(pos[2][0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(pos[3][0], 0.2, epsilon = 1e-6);
        let l2 = 2. * 4f64 * 4.;
        assert_abs_diff_eq!(pos[0][15] as f64, 0.5 * (-16. / l2).exp(), epsilon = 1e-6);
        assert_abs_diff_eq!(pos[2][4] as f64, 0.5 * (-16. / l2).exp(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn per_cluster_slots_are_independent() -> Result<()> {
        let dev = Device::Cpu;
        let mut c = config(ModelVariant::PerClusterEffect);
        c.cluster_weights = vec![ClusterWeights::new(1, 1, 1, 1), ClusterWeights::new(1, 1, 1, 1)];

        let mut vals = vec![-100f32; 8 * 26];
        // cluster 1 positive-before slot
        for t in 0..26 {
            vals[4 * 26 + t] = 3.;
        }
        let k = Tensor::from_vec(vals, (1, 8, 26), &dev)?;
        let effect = EffectWindow::from_parts(&c, Some(k.clone()), k)?;
        let options = effect.effect_options()?.squeeze(1)?.to_vec3::<f32>()?;

        assert!(options[1][1][0] > options[0][1][0] + 3.);
        assert_abs_diff_eq!(options[0][1][30], options[1][1][30]);
        Ok(())
    }

    #[test]
    fn negative_direction_uses_negative_slot() -> Result<()> {
        let dev = Device::Cpu;
        let mut c = config(ModelVariant::SharedClusterEffect);
        c.cluster_weights = vec![
            ClusterWeights::new(0, 0, 0, 0),
            ClusterWeights::new(-1, 0, -1, 0),
        ];
        let k = Tensor::full(-100f32, (1, 4, 26), &dev)?;
        let effect = EffectWindow::from_parts(&c, Some(k.clone()), k)?;
        let options = effect.effect_options()?.squeeze(1)?.to_vec3::<f32>()?;
        assert_abs_diff_eq!(options[1][0][19], -0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(options[1][1][19], -0.2, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn block_holds_the_boundary() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let mut c = config(ModelVariant::SharedClusterEffect);
        c.block = true;
        c.cluster_weights = vec![
            ClusterWeights::new(0, 0, 0, 0),
            ClusterWeights::new(1, -1, 1, -1),
        ];
        let effect = EffectWindow::new(&c, vb)?;
        let options = effect.effect_options()?.squeeze(1)?.to_vec3::<f32>()?;

        for head in 0..2 {
            let held = options[1][head][22];
            for t in 23..=25 {
                assert_eq!(options[1][head][t], held);
            }
            assert_ne!(options[1][head][26], held);
        }
        Ok(())
    }

    #[test]
    fn time_indexed_effect_flips_sign_at_the_crossing() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let c = config(ModelVariant::TimeEffect);
        let effect = EffectWindow::new(&c, vb)?;
        assert_eq!(effect.num_clusters(), 1);

        let options = effect.effect_options()?;
        assert_eq!(options.dims(), &[1, 1, 2, 51]);
        let options = options.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        for head in options.iter() {
            assert!(head[..20].iter().all(|&v| v > 0.));
            assert!(head[20..].iter().all(|&v| v < 0.));
        }
        Ok(())
    }

    #[test]
    fn count_slots_have_one_head() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let c = config(ModelVariant::ActivityFeed);
        let effect = EffectWindow::new(&c, vb)?;
        let options = effect.effect_options()?;
        assert_eq!(options.dims(), &[2, 1, 1, 51]);

        let options = options.squeeze(2)?.squeeze(1)?.to_vec2::<f32>()?;
        assert!(options[1][..25].iter().all(|&v| v > 0.));
        assert!(options[1][25..].iter().all(|&v| v < 0.));
        Ok(())
    }
}
