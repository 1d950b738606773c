use crate::candle_loss_functions::gaussian_kl_loss;
use candle_core::{Result, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Independent N(0, 1) noise with the shape, dtype and device of `like`
pub fn standard_normal_like<R: Rng>(like: &Tensor, rng: &mut R) -> Result<Tensor> {
    let n = like.elem_count();
    let eps = (0..n)
        .map(|_| StandardNormal.sample(rng))
        .collect::<Vec<f32>>();
    Tensor::from_vec(eps, like.shape(), like.device())?.to_dtype(like.dtype())
}

///
/// z = mu + sigma * eps
/// where eps ~ N(0, 1)
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
/// * `eps` - standard normal noise, same shape as `z_mean`
pub fn reparameterize(z_mean: &Tensor, z_lnvar: &Tensor, eps: &Tensor) -> Result<Tensor> {
    z_mean + (z_lnvar * 0.5)?.exp()?.mul(eps)?
}

/// Sample the latent code and evaluate its KL divergence to N(0, I)
///
/// # Arguments
/// * `z_mean_nh` - mean (n x h)
/// * `z_lnvar_nh` - log variance (n x h)
/// * `rng` - the only source of sampling noise
///
/// # Returns `(z_nh, kl)`
/// * `z_nh` - reparameterized sample (n x h)
/// * `kl` - scalar, KL summed over latent dims and averaged over the batch
pub fn latent_loss<R: Rng>(
    z_mean_nh: &Tensor,
    z_lnvar_nh: &Tensor,
    rng: &mut R,
) -> Result<(Tensor, Tensor)> {
    let eps_nh = standard_normal_like(z_mean_nh, rng)?;
    let z_nh = reparameterize(z_mean_nh, z_lnvar_nh, &eps_nh)?;
    let kl = gaussian_kl_loss(z_mean_nh, z_lnvar_nh)?.mean_all()?;
    Ok((z_nh, kl))
}
