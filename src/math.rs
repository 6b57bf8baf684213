use rand::Rng;

/// Log of the sum of the exponentials of `values`.
///
/// Returns negative infinity for an empty slice or if every value is
/// negative infinity.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Draw an index with probability proportional to `weights`.
///
/// If the weights do not sum to a positive finite number every index is
/// equally likely.
pub(crate) fn multinomial_sample<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> usize {
    assert!(!weights.is_empty());
    let total: f64 = weights.iter().sum();
    if !(total > 0. && total.is_finite()) {
        return rng.random_range(0..weights.len());
    }
    let mut x = rng.random::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        if x < w {
            return i;
        }
        x -= w;
    }
    // Rounding can leave a little mass past the last bin.
    weights
        .iter()
        .rposition(|&w| w > 0.)
        .unwrap_or(weights.len() - 1)
}
