//! Default priors: independent scalar random variables and the model prior.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use abc_core::{AbcError, Distribution, ErrorInfo, Parameter, RngHandle};
use rand::Rng;
use rand_distr::{Distribution as _, Normal as NormalSampler};
use serde::{Deserialize, Serialize};

/// Serialized, unvalidated form of an [`RV`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RvSpec {
    /// Uniform on `[low, high]`.
    Uniform {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
    },
    /// Normal with the given mean and standard deviation.
    Normal {
        /// Mean.
        mean: f64,
        /// Standard deviation.
        std: f64,
    },
    /// Point mass.
    Constant {
        /// The only value of the variable.
        value: f64,
    },
}

/// Scalar random variable used as a component of [`IndependentPrior`].
///
/// Only validated variables exist: build one through [`RV::uniform`],
/// [`RV::normal`] or [`RV::constant`], or deserialize an [`RvSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RvSpec", into = "RvSpec")]
pub struct RV {
    spec: RvSpec,
}

impl RV {
    /// Uniform variable after validating `low < high`.
    pub fn uniform(low: f64, high: f64) -> Result<Self, AbcError> {
        if !(low < high) || !low.is_finite() || !high.is_finite() {
            return Err(AbcError::Distribution(
                ErrorInfo::new("rv-uniform", "uniform bounds must satisfy low < high")
                    .with_context("low", low)
                    .with_context("high", high),
            ));
        }
        Ok(Self {
            spec: RvSpec::Uniform { low, high },
        })
    }

    /// Normal variable after validating `std > 0`.
    pub fn normal(mean: f64, std: f64) -> Result<Self, AbcError> {
        if !(std > 0.0) || !std.is_finite() || !mean.is_finite() {
            return Err(AbcError::Distribution(
                ErrorInfo::new("rv-normal", "normal requires finite mean and std > 0")
                    .with_context("mean", mean)
                    .with_context("std", std),
            ));
        }
        Ok(Self {
            spec: RvSpec::Normal { mean, std },
        })
    }

    /// Point mass at a finite `value`.
    pub fn constant(value: f64) -> Result<Self, AbcError> {
        if !value.is_finite() {
            return Err(AbcError::Distribution(
                ErrorInfo::new("rv-constant", "constant value must be finite")
                    .with_context("value", value),
            ));
        }
        Ok(Self {
            spec: RvSpec::Constant { value },
        })
    }

    /// The validated parameters of this variable.
    pub fn spec(&self) -> &RvSpec {
        &self.spec
    }

    /// Draws a value.
    pub fn sample(&self, rng: &mut RngHandle) -> f64 {
        match self.spec {
            RvSpec::Uniform { low, high } => rng.inner_mut().gen_range(low..=high),
            RvSpec::Normal { mean, std } => match NormalSampler::new(mean, std) {
                Ok(normal) => normal.sample(rng.inner_mut()),
                Err(_) => mean,
            },
            RvSpec::Constant { value } => value,
        }
    }

    /// Density at `x`; a point mass reports 1 at its value.
    pub fn pdf(&self, x: f64) -> f64 {
        match self.spec {
            RvSpec::Uniform { low, high } => {
                if (low..=high).contains(&x) {
                    1.0 / (high - low)
                } else {
                    0.0
                }
            }
            RvSpec::Normal { mean, std } => normal_pdf(x, mean, std),
            RvSpec::Constant { value } => {
                if x == value {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl TryFrom<RvSpec> for RV {
    type Error = AbcError;

    fn try_from(spec: RvSpec) -> Result<Self, Self::Error> {
        match spec {
            RvSpec::Uniform { low, high } => RV::uniform(low, high),
            RvSpec::Normal { mean, std } => RV::normal(mean, std),
            RvSpec::Constant { value } => RV::constant(value),
        }
    }
}

impl From<RV> for RvSpec {
    fn from(rv: RV) -> Self {
        rv.spec
    }
}

/// Density of a normal distribution.
pub fn normal_pdf(x: f64, mean: f64, std: f64) -> f64 {
    let z = (x - mean) / std;
    (-0.5 * z * z).exp() / (std * (2.0 * PI).sqrt())
}

/// Product of independent named scalar priors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndependentPrior {
    components: BTreeMap<String, RV>,
}

impl IndependentPrior {
    /// Creates an empty prior (a model without parameters).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named component.
    pub fn with(mut self, name: impl Into<String>, rv: RV) -> Self {
        self.components.insert(name.into(), rv);
        self
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.components.keys().map(String::as_str)
    }
}

impl Distribution for IndependentPrior {
    fn sample(&self, rng: &mut RngHandle) -> Parameter {
        self.components
            .iter()
            .map(|(name, rv)| (name.clone(), rv.sample(rng)))
            .collect()
    }

    fn pdf(&self, parameter: &Parameter) -> f64 {
        if parameter.len() != self.components.len() {
            return 0.0;
        }
        let mut density = 1.0;
        for (name, rv) in &self.components {
            match parameter.get(name) {
                Some(value) => density *= rv.pdf(value),
                None => return 0.0,
            }
        }
        density
    }
}

/// Categorical prior over model indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrior {
    probabilities: Vec<f64>,
}

impl ModelPrior {
    /// Uniform prior over `nr_models` models.
    pub fn uniform(nr_models: usize) -> Self {
        let mass = if nr_models == 0 {
            0.0
        } else {
            1.0 / nr_models as f64
        };
        Self {
            probabilities: vec![mass; nr_models],
        }
    }

    /// Prior proportional to `weights`.
    pub fn from_weights(weights: &[f64]) -> Result<Self, AbcError> {
        let probabilities = abc_core::weighted::normalize(weights).ok_or_else(|| {
            AbcError::Distribution(ErrorInfo::new(
                "model-prior",
                "model prior weights must be non-negative with positive finite total",
            ))
        })?;
        Ok(Self { probabilities })
    }

    /// Mass of model `index` (0 outside the prior).
    pub fn pmf(&self, index: usize) -> f64 {
        self.probabilities.get(index).copied().unwrap_or(0.0)
    }

    /// Number of models covered by the prior.
    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    /// Whether the prior covers no model.
    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// Probabilities indexed by model.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialized_variables_are_validated() {
        let rv: RV = serde_json::from_str(r#"{"type":"uniform","low":-1.0,"high":1.0}"#).unwrap();
        assert_eq!(rv, RV::uniform(-1.0, 1.0).unwrap());
        assert!(serde_json::from_str::<RV>(r#"{"type":"uniform","low":2.0,"high":1.0}"#).is_err());
        assert!(serde_json::from_str::<RV>(r#"{"type":"normal","mean":0.0,"std":-1.0}"#).is_err());
        let prior: Result<IndependentPrior, _> =
            serde_json::from_str(r#"{"theta":{"type":"uniform","low":1.0,"high":1.0}}"#);
        assert!(prior.is_err());
    }

    #[test]
    fn serialized_form_keeps_the_tag() {
        let text = serde_json::to_string(&RV::constant(2.0).unwrap()).unwrap();
        assert_eq!(text, r#"{"type":"constant","value":2.0}"#);
        assert!(RV::constant(f64::NAN).is_err());
    }
}
