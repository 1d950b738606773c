use crate::candle_aux_layers::StackLayers;
use crate::candle_aux_linear::{masked_linear, MaskedLinear};
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module, VarBuilder};
use log::debug;
use rand::prelude::SliceRandom;
use rand::{Rng, SeedableRng};

/// A dense 0/1 connectivity matrix laid out like a weight matrix:
/// `rows` consumers (outputs) by `cols` producers (inputs).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskMatrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl MaskMatrix {
    pub fn from_fn<F>(rows: usize, cols: usize, connected: F) -> Self
    where
        F: Fn(usize, usize) -> bool,
    {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(connected(r, c) as u8);
            }
        }
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// row-major entries
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    /// Stack `k` copies of this matrix along the consumer axis
    fn replicate_rows(&self, k: usize) -> Self {
        let mut data = Vec::with_capacity(self.data.len() * k);
        for _ in 0..k {
            data.extend_from_slice(&self.data);
        }
        Self {
            rows: self.rows * k,
            cols: self.cols,
            data,
        }
    }

    /// Append `extra` always-connected producer columns
    fn append_ones_cols(&self, extra: usize) -> Self {
        let cols = self.cols + extra;
        let mut data = Vec::with_capacity(self.rows * cols);
        for r in 0..self.rows {
            data.extend_from_slice(&self.data[r * self.cols..(r + 1) * self.cols]);
            data.extend(std::iter::repeat(1u8).take(extra));
        }
        Self {
            rows: self.rows,
            cols,
            data,
        }
    }
}

/// Layer sizes of an autoregressive masked network
#[derive(Clone, Debug)]
pub struct MadeDims {
    /// number of ordered (visible) inputs
    pub nin: usize,
    /// width of each hidden layer
    pub hidden: Vec<usize>,
    /// unmasked conditioning inputs appended after the visible ones
    pub latent_dim: usize,
    /// number of outputs, a multiple of `nin`
    pub nout: usize,
}

impl MadeDims {
    pub fn validate(&self) -> Result<()> {
        if self.nin == 0 || self.nout % self.nin != 0 || self.nout == 0 {
            return Err(candle_core::Error::Msg(format!(
                "nout ({}) must be a positive integer multiple of nin ({})",
                self.nout, self.nin
            )));
        }
        if !self.hidden.is_empty() && self.nin < 2 {
            return Err(candle_core::Error::Msg(
                "hidden layers need at least two ordered inputs".to_string(),
            ));
        }
        if self.hidden.iter().any(|&h| h == 0) {
            return Err(candle_core::Error::Msg("empty hidden layer".to_string()));
        }
        Ok(())
    }

    /// number of output blocks, each one distributional head per input
    pub fn num_blocks(&self) -> usize {
        self.nout / self.nin
    }
}

/// Order labels and masks of one sampled connectivity.
///
/// `labels[0]` is the input ordering, `labels[l + 1]` the labels of
/// hidden layer `l`.  `masks[l]` feeds layer `l + 1` from layer `l`; the
/// first mask carries the extra latent columns.
#[derive(Clone, Debug)]
pub struct MaskSet {
    seed: u64,
    labels: Vec<Vec<usize>>,
    masks: Vec<MaskMatrix>,
}

impl MaskSet {
    /// Sample the input ordering and hidden-unit labels from `seed` and
    /// derive every layer's mask.
    ///
    /// * hidden `u -> v` is connected iff `label(u) <= label(v)`
    /// * last hidden `u -> output o` is connected iff
    ///   `label(u) < order(o mod nin)`
    ///
    /// # Arguments
    /// * `dims` - layer sizes
    /// * `natural_ordering` - use the identity input ordering
    /// * `seed` - seed of the random stream
    pub fn generate(dims: &MadeDims, natural_ordering: bool, seed: u64) -> Result<Self> {
        dims.validate()?;

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let nin = dims.nin;

        let mut order: Vec<usize> = (0..nin).collect();
        if !natural_ordering {
            order.shuffle(&mut rng);
        }

        let mut labels = vec![order];
        for &h in dims.hidden.iter() {
            let lo = labels
                .last()
                .and_then(|prev| prev.iter().copied().min())
                .unwrap_or(0);
            let layer = (0..h)
                .map(|_| rng.random_range(lo..(nin - 1)))
                .collect::<Vec<_>>();
            labels.push(layer);
        }

        let nlayers = labels.len();
        let mut masks = (1..nlayers)
            .map(|l| {
                let (prev, next) = (&labels[l - 1], &labels[l]);
                MaskMatrix::from_fn(next.len(), prev.len(), |v, u| prev[u] <= next[v])
            })
            .collect::<Vec<_>>();

        let last = &labels[nlayers - 1];
        let input_order = &labels[0];
        let out_mask = MaskMatrix::from_fn(nin, last.len(), |o, u| last[u] < input_order[o]);
        masks.push(out_mask.replicate_rows(dims.num_blocks()));

        masks[0] = masks[0].append_ones_cols(dims.latent_dim);

        Ok(Self {
            seed,
            labels,
            masks,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn input_order(&self) -> &[usize] {
        &self.labels[0]
    }

    pub fn hidden_labels(&self, layer: usize) -> &[usize] {
        &self.labels[layer + 1]
    }

    pub fn masks(&self) -> &[MaskMatrix] {
        &self.masks
    }
}

/// Masked autoencoder for distribution estimation.  Output `o` only
/// sees visible inputs ordered strictly before input `o mod nin`, plus
/// every latent input.
pub struct Made {
    dims: MadeDims,
    num_masks: usize,
    natural_ordering: bool,
    net: StackLayers<MaskedLinear>,
    mask_set: Option<MaskSet>,
}

impl Made {
    /// Will create a MADE network with these variables:
    /// * `made.{}.weight` and `made.{}.bias` where {} is the layer index
    ///
    /// # Arguments
    /// * `dims` - layer sizes
    /// * `num_masks` - number of orderings to cycle through
    /// * `natural_ordering` - skip the input permutation
    /// * `vb` - variable builder
    pub fn new(
        dims: MadeDims,
        num_masks: usize,
        natural_ordering: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        dims.validate()?;
        if num_masks == 0 {
            return Err(candle_core::Error::Msg(
                "at least one ordering is required".to_string(),
            ));
        }

        let mut sizes = vec![dims.nin + dims.latent_dim];
        sizes.extend(dims.hidden.iter().copied());
        sizes.push(dims.nout);

        let mut net = StackLayers::<MaskedLinear>::new();
        let nlayers = sizes.len() - 1;
        for j in 0..nlayers {
            let layer = masked_linear(sizes[j], sizes[j + 1], vb.pp(format!("made.{}", j)))?;
            if j + 1 < nlayers {
                net.push_with_act(layer, Activation::Relu);
            } else {
                net.push(layer);
            }
        }

        let mut made = Self {
            dims,
            num_masks,
            natural_ordering,
            net,
            mask_set: None,
        };
        made.update_masks(0)?;
        Ok(made)
    }

    pub fn dims(&self) -> &MadeDims {
        &self.dims
    }

    pub fn num_masks(&self) -> usize {
        self.num_masks
    }

    pub fn mask_set(&self) -> Option<&MaskSet> {
        self.mask_set.as_ref()
    }

    /// Masks currently installed, input layer first
    pub fn masks(&self) -> &[MaskMatrix] {
        self.mask_set.as_ref().map(|m| m.masks()).unwrap_or(&[])
    }

    /// Install the connectivity of ordering `ordering % num_masks`.
    /// With a single ordering the first generated masks are kept.
    pub fn update_masks(&mut self, ordering: usize) -> Result<()> {
        if self.mask_set.is_some() && self.num_masks == 1 {
            return Ok(());
        }
        let seed = (ordering % self.num_masks) as u64;
        let mask_set = MaskSet::generate(&self.dims, self.natural_ordering, seed)?;
        self.set_mask_set(mask_set)
    }

    /// Install an externally generated connectivity
    pub fn set_mask_set(&mut self, mask_set: MaskSet) -> Result<()> {
        for (layer, mask) in self.net.layers_mut().zip(mask_set.masks().iter()) {
            layer.set_mask(mask)?;
        }
        debug!("MADE masks from ordering seed {}", mask_set.seed());
        self.mask_set = Some(mask_set);
        Ok(())
    }
}

impl Module for Made {
    /// `x_ni` is `[visible, latent]` along the last axis
    fn forward(&self, x_ni: &Tensor) -> Result<Tensor> {
        self.net.forward(x_ni)
    }
}
