//! Distance functions between summary statistics.

use std::collections::BTreeMap;

use abc_core::{AbcError, Distance, ErrorInfo, SumStats};

/// Weighted p-norm over the observed statistics.
///
/// `p = f64::INFINITY` yields the maximum absolute (weighted) difference.
/// Statistics without an explicit weight get weight 1. A statistic present in
/// the observation but missing from the simulation is an error.
#[derive(Debug, Clone, PartialEq)]
pub struct PNormDistance {
    p: f64,
    weights: BTreeMap<String, f64>,
}

impl PNormDistance {
    /// Creates a distance with exponent `p >= 1`.
    pub fn new(p: f64) -> Result<Self, AbcError> {
        if !(p >= 1.0) {
            return Err(AbcError::Distance(
                ErrorInfo::new("p-norm", "p must be >= 1").with_context("p", p),
            ));
        }
        Ok(Self {
            p,
            weights: BTreeMap::new(),
        })
    }

    /// Euclidean distance.
    pub fn euclidean() -> Self {
        Self {
            p: 2.0,
            weights: BTreeMap::new(),
        }
    }

    /// Sets the weight of a statistic.
    pub fn with_weight(mut self, key: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(key.into(), weight);
        self
    }
}

impl Distance for PNormDistance {
    fn name(&self) -> &str {
        "p-norm"
    }

    fn distance(&self, simulated: &SumStats, observed: &SumStats) -> Result<f64, AbcError> {
        let mut accumulated = 0.0f64;
        for (key, target) in observed.iter() {
            let value = simulated.get(key).ok_or_else(|| {
                AbcError::Distance(
                    ErrorInfo::new("missing-statistic", "simulation lacks an observed statistic")
                        .with_context("statistic", key),
                )
            })?;
            let weight = self.weights.get(key).copied().unwrap_or(1.0);
            let term = (weight * (value - target)).abs();
            if self.p.is_infinite() {
                accumulated = accumulated.max(term);
            } else {
                accumulated += term.powf(self.p);
            }
        }
        if self.p.is_infinite() {
            Ok(accumulated)
        } else {
            Ok(accumulated.powf(1.0 / self.p))
        }
    }
}

/// Adapts a closure into a [`Distance`].
pub struct FnDistance<F> {
    name: String,
    function: F,
}

impl<F> FnDistance<F>
where
    F: Fn(&SumStats, &SumStats) -> f64 + Send + Sync,
{
    /// Wraps `function` under `name`.
    pub fn new(name: impl Into<String>, function: F) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }
}

impl<F> Distance for FnDistance<F>
where
    F: Fn(&SumStats, &SumStats) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn distance(&self, simulated: &SumStats, observed: &SumStats) -> Result<f64, AbcError> {
        Ok((self.function)(simulated, observed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_norms_match_hand_computation() {
        let observed = SumStats::new().with("x", 0.0).with("y", 0.0);
        let simulated = SumStats::new().with("x", 3.0).with("y", -4.0);
        let euclid = PNormDistance::euclidean();
        assert!((euclid.distance(&simulated, &observed).unwrap() - 5.0).abs() < 1e-12);
        let manhattan = PNormDistance::new(1.0).unwrap();
        assert!((manhattan.distance(&simulated, &observed).unwrap() - 7.0).abs() < 1e-12);
        let max = PNormDistance::new(f64::INFINITY).unwrap().with_weight("x", 2.0);
        assert!((max.distance(&simulated, &observed).unwrap() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn missing_statistic_is_an_error() {
        let observed = SumStats::new().with("x", 0.0);
        let err = PNormDistance::euclidean()
            .distance(&SumStats::new(), &observed)
            .unwrap_err();
        assert_eq!(err.info().code, "missing-statistic");
        assert!(PNormDistance::new(0.5).is_err());
    }
}
