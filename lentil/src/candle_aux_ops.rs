use candle_core::{Result, Tensor, D};

/// below this, log(1 + e) is taken from its series e - e^2/2 + e^3/3
const LOG1P_SERIES_CUTOFF: f64 = 1e-2;

/// softplus(x) = log(1 + exp(x)), evaluated as
/// max(x, 0) + log(1 + exp(-|x|))
///
/// stays strictly positive for large negative `x`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let e = x.abs()?.neg()?.exp()?;
    let series = e.mul(&(e.affine(-0.5, 1.0)? + (e.sqr()? / 3.0)?)?)?;
    let direct = (&e + 1.0)?.log()?;
    let tail = e.lt(LOG1P_SERIES_CUTOFF)?.where_cond(&series, &direct)?;
    x.relu()? + tail
}

/// log(sigmoid(x)) = -softplus(-x)
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    softplus(&x.neg()?)?.neg()
}

/// log(exp(a) + exp(b)) elementwise
pub fn log_add_exp(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Tensor::stack(&[a, b], D::Minus1)?.log_sum_exp(D::Minus1)
}

/// exp(-(t - mu)^2 / (2 l^2)) for t = 0..len
pub fn gaussian_window(len: usize, mu: f64, l: f64) -> Vec<f32> {
    (0..len)
        .map(|t| {
            let d = t as f64 - mu;
            (-(d * d) / (2.0 * l * l)).exp() as f32
        })
        .collect()
}

/// log(x!) of every (non-negative, integer-valued) data point
pub fn log_factorial(x: &Tensor) -> Result<Tensor> {
    use special::Gamma as SpecialGamma;

    let vals = x
        .flatten_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_vec1::<f64>()?
        .into_iter()
        .map(|v| SpecialGamma::ln_gamma(v + 1.0).0)
        .collect::<Vec<_>>();

    Tensor::from_vec(vals, x.shape(), x.device())?.to_dtype(x.dtype())
}
