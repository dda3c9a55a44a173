//! Weighted summary statistics over particle populations.
//!
//! All helpers normalise the supplied weights before use, so callers may pass
//! raw importance weights. Inputs that carry no mass (empty slices, mismatched
//! lengths, non-positive or non-finite totals) yield `None`.

/// Normalises weights to unit mass, returning `None` for degenerate inputs.
pub fn normalize(weights: &[f64]) -> Option<Vec<f64>> {
    if weights.is_empty() || weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return None;
    }
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return None;
    }
    Some(weights.iter().map(|w| w / total).collect())
}

/// Weighted α-quantile.
///
/// Points are sorted and the quantile is linearly interpolated over the
/// centred cumulative weights `cumsum(w) - (1 - α) w`, clamping to the extreme
/// points outside that range.
pub fn weighted_quantile(points: &[f64], weights: &[f64], alpha: f64) -> Option<f64> {
    if points.len() != weights.len() || !(0.0..=1.0).contains(&alpha) {
        return None;
    }
    let weights = normalize(weights)?;
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| points[a].total_cmp(&points[b]));

    let mut knots = Vec::with_capacity(order.len());
    let mut cumulative = 0.0;
    for &index in &order {
        cumulative += weights[index];
        knots.push(cumulative - (1.0 - alpha) * weights[index]);
    }
    let sorted: Vec<f64> = order.iter().map(|&index| points[index]).collect();
    Some(interpolate(alpha, &knots, &sorted))
}

/// Weighted median (α = 0.5).
pub fn weighted_median(points: &[f64], weights: &[f64]) -> Option<f64> {
    weighted_quantile(points, weights, 0.5)
}

/// Weighted arithmetic mean.
pub fn weighted_mean(points: &[f64], weights: &[f64]) -> Option<f64> {
    if points.len() != weights.len() {
        return None;
    }
    let weights = normalize(weights)?;
    Some(points.iter().zip(&weights).map(|(p, w)| p * w).sum())
}

/// Weighted variance (population form, no bias correction).
pub fn weighted_variance(points: &[f64], weights: &[f64]) -> Option<f64> {
    let mean = weighted_mean(points, weights)?;
    let weights = normalize(weights)?;
    Some(
        points
            .iter()
            .zip(&weights)
            .map(|(p, w)| (p - mean).powi(2) * w)
            .sum(),
    )
}

/// Weighted standard deviation.
pub fn weighted_std(points: &[f64], weights: &[f64]) -> Option<f64> {
    weighted_variance(points, weights).map(f64::sqrt)
}

/// Kish effective sample size `1 / Σ w²` of normalised weights.
pub fn effective_sample_size(weights: &[f64]) -> Option<f64> {
    let weights = normalize(weights)?;
    let squares: f64 = weights.iter().map(|w| w * w).sum();
    Some(1.0 / squares)
}

fn interpolate(x: f64, knots: &[f64], values: &[f64]) -> f64 {
    let upper = knots.partition_point(|&knot| knot < x);
    if upper == 0 {
        return values[0];
    }
    if upper == knots.len() {
        return values[values.len() - 1];
    }
    let (x0, x1) = (knots[upper - 1], knots[upper]);
    let (y0, y1) = (values[upper - 1], values[upper]);
    if x1 <= x0 {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_median_of_odd_sample_is_middle_point() {
        let points = [3.0, 1.0, 2.0];
        let weights = [1.0, 1.0, 1.0];
        let median = weighted_median(&points, &weights).unwrap();
        assert!((median - 2.0).abs() < 1e-12);
    }

    #[test]
    fn mass_on_single_point_pins_quantiles() {
        let points = [1.0, 5.0, 9.0];
        let weights = [0.0, 1.0, 0.0];
        for alpha in [0.1, 0.5, 0.9] {
            let q = weighted_quantile(&points, &weights, alpha).unwrap();
            assert!((q - 5.0).abs() < 1e-12, "alpha {alpha} gave {q}");
        }
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(weighted_median(&[], &[]).is_none());
        assert!(weighted_median(&[1.0], &[0.0]).is_none());
        assert!(weighted_median(&[1.0, 2.0], &[1.0]).is_none());
        assert!(weighted_quantile(&[1.0], &[1.0], 1.5).is_none());
    }
}
