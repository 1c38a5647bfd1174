//! Log-space arithmetic for numerically stable lattice computations.
//!
//! Probabilities are carried as natural logarithms so that products over long
//! observation sequences do not underflow. Values at or below [`LOG_ZERO`] are
//! treated as impossible and clamped to negative infinity so they cannot
//! contaminate later reductions.

/// Numeric floor for log-probabilities. Anything at or below this value is
/// considered `ln(0)`.
pub const LOG_ZERO: f64 = -1e200;

/// Compute `ln(exp(a) + exp(b))` without overflow.
///
/// This is the log-space equivalent of addition in probability space.
pub fn ln_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (max, min) = if a >= b { (a, b) } else { (b, a) };
    max + (min - max).exp().ln_1p()
}

/// Log-sum-exp over a collection of log values.
///
/// Returns negative infinity for an empty collection or one whose entries
/// are all negative infinity; never NaN for such inputs.
pub fn log_sum_exp<'a, I>(values: I) -> f64
where
    I: IntoIterator<Item = &'a f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let max = iter.clone().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = iter.map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Clamp a log value at or below [`LOG_ZERO`] to negative infinity.
///
/// NaN is also mapped to negative infinity.
#[inline]
pub fn clamp_log_zero(x: f64) -> f64 {
    if x.is_nan() || x <= LOG_ZERO {
        f64::NEG_INFINITY
    } else {
        x
    }
}

/// Normalise log values in place so that their exponentials sum to one.
///
/// Returns the normaliser that was subtracted. If every entry is negative
/// infinity the values are left untouched.
pub fn log_normalize(values: &mut [f64]) -> f64 {
    let norm = log_sum_exp(values.iter());
    if norm.is_finite() {
        for v in values.iter_mut() {
            *v -= norm;
        }
    }
    norm
}
