use crate::candle_aux_ops::*;
use candle_core::{DType, Result, Tensor};

/// KL divergence loss between two Gaussian distributions
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Poisson log-probability of counts
///
/// log Pois(x | rate) = x * log(rate) - rate - log(x!)
///
/// * `x` - observed counts
/// * `rate` - positive rate, same shape as `x`
pub fn poisson_log_prob(x: &Tensor, rate: &Tensor) -> Result<Tensor> {
    x.mul(&rate.log()?)?.sub(rate)?.sub(&log_factorial(x)?)
}

/// Elementwise zero-inflated Poisson log-likelihood
///
/// θ = sigmoid(logit), λ = softplus(raw_rate)
///
/// llik = log(θ + (1 - θ) Pois(0 | λ))      if x = 0
///        log(1 - θ) + log Pois(x | λ)      if x > 0
///
/// * `x` - observed counts
/// * `logit` - zero-inflation logit
/// * `raw_rate` - unconstrained rate
pub fn zip_log_likelihood(x: &Tensor, logit: &Tensor, raw_rate: &Tensor) -> Result<Tensor> {
    let log_theta = log_sigmoid(logit)?;
    let log_1m_theta = log_sigmoid(&logit.neg()?)?;
    let rate = softplus(raw_rate)?;

    let count_term = (&log_1m_theta + poisson_log_prob(x, &rate)?)?;
    let zero_term = log_add_exp(&log_theta, &(&log_1m_theta - &rate)?)?;

    x.eq(0.0)?.where_cond(&zero_term, &count_term)
}

/// Time points excluded from the likelihood: the three steps up to and
/// including `len / 2`, where the threshold crossing sits.
pub fn excluded_time_points(len: usize) -> Vec<usize> {
    let half_way = len / 2;
    (half_way.saturating_sub(2)..=half_way)
        .filter(|&t| t < len)
        .collect()
}

/// Zero out the threshold-crossing time points along the last axis
pub fn exclude_midpoint(llik: &Tensor) -> Result<Tensor> {
    let len = llik.dim(llik.rank() - 1)?;
    let excluded = excluded_time_points(len);
    let keep = (0..len)
        .map(|t| (!excluded.contains(&t)) as u8)
        .collect::<Vec<_>>();
    let keep = Tensor::from_vec(keep, len, llik.device())?.broadcast_as(llik.shape())?;
    keep.where_cond(llik, &llik.zeros_like()?)
}

/// log prior over clusters: `null_mass` on cluster 0, the rest split
/// evenly among the others
pub fn cluster_log_prior(num_clusters: usize, null_mass: f64) -> Vec<f32> {
    let rest = num_clusters.saturating_sub(1);
    let mut prior = vec![null_mass.ln() as f32];
    prior.extend((0..rest).map(|_| ((1.0 - null_mass) / rest as f64).ln() as f32));
    prior
}

/// Combine per-(user, cluster) log-likelihoods with the cluster
/// posterior and the latent KL.
///
/// loss = -mean_n Σ_k q(k|n) (llik(n,k) - log q(k|n) + log p(k)) + kl
///
/// * `llik_nk` - log-likelihood summed over the horizon (n x K)
/// * `log_q_nk` - cluster log posterior (n x K)
/// * `kl` - scalar latent loss
/// * `null_mass` - prior mass of cluster 0
pub fn cluster_mixture_loss(
    llik_nk: &Tensor,
    log_q_nk: &Tensor,
    kl: &Tensor,
    null_mass: f64,
) -> Result<Tensor> {
    let (_, k) = log_q_nk.dims2()?;
    if llik_nk.dims2()?.1 != k {
        return Err(candle_core::Error::Msg(format!(
            "{} clusters in the likelihood, {} in the posterior",
            llik_nk.dims2()?.1,
            k
        )));
    }
    let log_prior_k = Tensor::from_vec(cluster_log_prior(k, null_mass), (1, k), log_q_nk.device())?
        .to_dtype(log_q_nk.dtype())?;

    let q_nk = log_q_nk.exp()?;
    let elbo_n = q_nk
        .mul(&llik_nk.sub(log_q_nk)?.broadcast_add(&log_prior_k)?)?
        .sum(1)?;
    kl - elbo_n.mean_all()?
}

/// `[n, K*C, L]` -> `[n, K]` by summing the channels of each cluster and
/// the horizon
fn sum_per_cluster(llik: &Tensor, num_clusters: usize) -> Result<Tensor> {
    let (n, kc, len) = llik.dims3()?;
    if num_clusters == 0 || kc % num_clusters != 0 {
        return Err(candle_core::Error::Msg(format!(
            "{} output rows cannot be split into {} clusters",
            kc, num_clusters
        )));
    }
    llik.reshape((n, num_clusters, (kc / num_clusters) * len))?
        .sum(2)
}

fn reduce_objective(
    llik: &Tensor,
    kl: &Tensor,
    log_cluster_nk: Option<&Tensor>,
    null_mass: f64,
) -> Result<Tensor> {
    let llik = exclude_midpoint(llik)?;
    match log_cluster_nk {
        None => kl - llik.sum(llik.rank() - 1)?.mean_all()?,
        Some(log_q_nk) => {
            let llik_nk = sum_per_cluster(&llik, log_q_nk.dim(1)?)?;
            cluster_mixture_loss(&llik_nk, log_q_nk, kl, null_mass)
        }
    }
}

/// Zero-inflated Poisson negative log-likelihood plus KL
///
/// # Arguments
/// * `recon` - decoder output `[n, K*C, 2, L]`; head 0 is the
///   zero-inflation logit, head 1 the raw rate
/// * `x` - observed counts `[n, C, L]`
/// * `kl` - scalar latent loss
/// * `log_cluster_nk` - cluster log posterior `[n, K]`, if any
/// * `null_mass` - prior mass of cluster 0
pub fn zip_loss(
    recon: &Tensor,
    x: &Tensor,
    kl: &Tensor,
    log_cluster_nk: Option<&Tensor>,
    null_mass: f64,
) -> Result<Tensor> {
    let (_, rows, heads, _) = recon.dims4()?;
    if heads != 2 {
        return Err(candle_core::Error::Msg(format!(
            "zero-inflated Poisson needs 2 heads, got {}",
            heads
        )));
    }
    let x = broadcast_observed(x, rows, recon.dtype())?;
    let logit = recon.narrow(2, 0, 1)?.squeeze(2)?;
    let raw_rate = recon.narrow(2, 1, 1)?.squeeze(2)?;
    let llik = zip_log_likelihood(&x, &logit, &raw_rate)?;
    reduce_objective(&llik, kl, log_cluster_nk, null_mass)
}

/// Poisson negative log-likelihood plus KL
///
/// # Arguments
/// * `recon` - decoder output `[n, K*C, 1, L]` of raw rates
/// * `x` - observed counts `[n, C, L]`
/// * `kl` - scalar latent loss
/// * `log_cluster_nk` - cluster log posterior `[n, K]`, if any
/// * `null_mass` - prior mass of cluster 0
pub fn poisson_loss(
    recon: &Tensor,
    x: &Tensor,
    kl: &Tensor,
    log_cluster_nk: Option<&Tensor>,
    null_mass: f64,
) -> Result<Tensor> {
    let (_, rows, heads, _) = recon.dims4()?;
    if heads != 1 {
        return Err(candle_core::Error::Msg(format!(
            "Poisson needs 1 head, got {}",
            heads
        )));
    }
    let x = broadcast_observed(x, rows, recon.dtype())?;
    let rate = softplus(&recon.squeeze(2)?)?;
    let llik = poisson_log_prob(&x, &rate)?;
    reduce_objective(&llik, kl, log_cluster_nk, null_mass)
}

/// Repeat `[n, C, L]` observations for every cluster block of `rows = K*C`
fn broadcast_observed(x: &Tensor, rows: usize, dtype: DType) -> Result<Tensor> {
    let (n, c, len) = x.dims3()?;
    if c == 0 || rows % c != 0 {
        return Err(candle_core::Error::Msg(format!(
            "{} output rows do not match {} observed channels",
            rows, c
        )));
    }
    x.to_dtype(dtype)?
        .unsqueeze(1)?
        .broadcast_as((n, rows / c, c, len))?
        .reshape((n, rows, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn certain_zero_has_zero_log_likelihood() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros(3, DType::F32, &dev)?;
        let logit = Tensor::new(&[40f32, 40., 40.], &dev)?;
        let raw = Tensor::new(&[-1f32, 0.5, 3.], &dev)?;
        let llik = zip_log_likelihood(&x, &logit, &raw)?.to_vec1::<f32>()?;
        for v in llik {
            assert_abs_diff_eq!(v, 0., epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn no_inflation_reduces_to_poisson_zero() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros(3, DType::F32, &dev)?;
        let logit = Tensor::new(&[-40f32, -40., -40.], &dev)?;
        let raw = Tensor::new(&[-1f32, 0.5, 3.], &dev)?;
        let llik = zip_log_likelihood(&x, &logit, &raw)?.to_vec1::<f32>()?;
        let rate = softplus(&raw)?.to_vec1::<f32>()?;
        for (v, r) in llik.iter().zip(rate.iter()) {
            assert_abs_diff_eq!(*v, -*r, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn positive_counts_use_poisson_branch() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[2f32], &dev)?;
        let logit = Tensor::new(&[0f32], &dev)?;
        let raw = Tensor::new(&[1f32], &dev)?;
        let llik = zip_log_likelihood(&x, &logit, &raw)?.to_vec1::<f32>()?[0] as f64;

        let rate = 1f64.exp().ln_1p();
        let expected = 0.5f64.ln() + 2. * rate.ln() - rate - 2f64.ln();
        assert_abs_diff_eq!(llik, expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn midpoint_is_excluded() -> Result<()> {
        assert_eq!(excluded_time_points(51), vec![23, 24, 25]);
        assert_eq!(excluded_time_points(50), vec![23, 24, 25]);

        let dev = Device::Cpu;
        let llik = Tensor::ones((2, 1, 51), DType::F32, &dev)?;
        let kept = exclude_midpoint(&llik)?.to_vec3::<f32>()?;
        for t in 0..51 {
            let expected = if (23..=25).contains(&t) { 0. } else { 1. };
            assert_eq!(kept[1][0][t], expected);
        }
        Ok(())
    }

    #[test]
    fn midpoint_ignores_values() -> Result<()> {
        let dev = Device::Cpu;
        let n = 2;
        let len = 51;
        let x = Tensor::ones((n, 1, len), DType::F32, &dev)?;
        let kl = Tensor::new(0f32, &dev)?;
        let recon_a = Tensor::zeros((n, 1, 1, len), DType::F32, &dev)?;

        let mut wild = vec![0f32; n * len];
        for row in 0..n {
            for t in [23, 24, 25] {
                wild[row * len + t] = 25.0 * (row as f32 + 1.);
            }
        }
        let recon_b = Tensor::from_vec(wild, (n, 1, 1, len), &dev)?;

        let a = poisson_loss(&recon_a, &x, &kl, None, 0.9)?.to_scalar::<f32>()?;
        let b = poisson_loss(&recon_b, &x, &kl, None, 0.9)?.to_scalar::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn midpoint_ignores_values_under_the_mixture() -> Result<()> {
        let dev = Device::Cpu;
        let (n, k, len) = (3, 2, 51);
        let x = Tensor::ones((n, 1, len), DType::F32, &dev)?;
        let kl = Tensor::new(0.25f32, &dev)?;
        let log_q = Tensor::new(&[[0.5f32, 0.5], [0.1, 0.9], [0.7, 0.3]], &dev)?.log()?;
        let recon_a = Tensor::zeros((n, k, 1, len), DType::F32, &dev)?;

        let mut wild = vec![0f32; n * k * len];
        for row in 0..(n * k) {
            for t in [23, 24, 25] {
                wild[row * len + t] = -15.0 + 7.0 * row as f32;
            }
        }
        let recon_b = Tensor::from_vec(wild, (n, k, 1, len), &dev)?;

        let a = poisson_loss(&recon_a, &x, &kl, Some(&log_q), 0.9)?.to_scalar::<f32>()?;
        let b = poisson_loss(&recon_b, &x, &kl, Some(&log_q), 0.9)?.to_scalar::<f32>()?;
        assert!(a.is_finite());
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn tiny_rates_stay_finite() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[1f32], &dev)?;
        let logit = Tensor::new(&[0f32], &dev)?;
        let raw = Tensor::new(&[-20f32], &dev)?;
        let llik = zip_log_likelihood(&x, &logit, &raw)?.to_vec1::<f32>()?[0] as f64;
        let rate = (-20f64).exp().ln_1p();
        assert_abs_diff_eq!(llik, 0.5f64.ln() + rate.ln() - rate, epsilon = 1e-3);

        let ones = Tensor::ones((2, 1, 9), DType::F32, &dev)?;
        let recon = Tensor::full(-20f32, (2, 1, 1, 9), &dev)?;
        let kl = Tensor::new(0f32, &dev)?;
        let loss = poisson_loss(&recon, &ones, &kl, None, 0.9)?.to_scalar::<f32>()?;
        assert!(loss.is_finite());
        Ok(())
    }

    #[test]
    fn tiny_rates_have_finite_gradients() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[0f32, 1.], &dev)?;
        let logit = Tensor::new(&[0f32, 0.], &dev)?;
        let raw = candle_core::Var::new(&[-20f32, -20.], &dev)?;
        let llik = zip_log_likelihood(&x, &logit, raw.as_tensor())?.sum_all()?;
        assert!(llik.to_scalar::<f32>()?.is_finite());

        let grads = llik.backward()?;
        let d_raw = grads.get(raw.as_tensor()).expect("gradient").to_vec1::<f32>()?;
        assert!(d_raw.iter().all(|g| g.is_finite()));
        Ok(())
    }

    #[test]
    fn prior_puts_ninety_percent_on_null() {
        let p = cluster_log_prior(4, 0.9);
        assert_eq!(p.len(), 4);
        assert_abs_diff_eq!(p[0].exp(), 0.9, epsilon = 1e-6);
        for v in &p[1..] {
            assert_abs_diff_eq!(v.exp(), 0.1 / 3., epsilon = 1e-6);
        }
    }

    #[test]
    fn mixture_loss_matches_formula() -> Result<()> {
        let dev = Device::Cpu;
        let llik = Tensor::new(&[[-3f32, -5.]], &dev)?;
        let log_q = Tensor::new(&[[0.25f32.ln(), 0.75f32.ln()]], &dev)?;
        let kl = Tensor::new(0.5f32, &dev)?;
        let loss = cluster_mixture_loss(&llik, &log_q, &kl, 0.9)?.to_scalar::<f32>()? as f64;

        let term0 = 0.25 * (-3. - 0.25f64.ln() + 0.9f64.ln());
        let term1 = 0.75 * (-5. - 0.75f64.ln() + 0.1f64.ln());
        assert_abs_diff_eq!(loss, 0.5 - (term0 + term1), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn zip_loss_is_non_negative_without_clusters() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[[0f32, 1., 0., 4., 2., 0., 0.]]], &dev)?;
        let recon = Tensor::randn(0f32, 1., (1, 1, 2, 7), &dev)?;
        let kl = Tensor::new(0f32, &dev)?;
        let loss = zip_loss(&recon, &x, &kl, None, 0.9)?.to_scalar::<f32>()?;
        assert!(loss >= 0.);
        Ok(())
    }
}
