//! Tolerance schedules mapping a finished population to the next threshold.

use abc_core::weighted::weighted_quantile;
use abc_core::{AbcError, ErrorInfo};

use crate::config::EpsilonConfig;
use crate::population::Population;

/// Computes the acceptance threshold of the generation following `previous`.
pub trait ToleranceScheduler: Send + Sync {
    /// Stable policy name.
    fn name(&self) -> &str;

    /// Threshold for generation `previous.generation() + 1`.
    fn next_epsilon(&self, previous: &Population) -> Result<f64, AbcError>;
}

fn schedule_error(code: &str, message: &str, generation: usize) -> AbcError {
    AbcError::Schedule(ErrorInfo::new(code, message).with_context("generation", generation))
}

/// Rejects NaN, infinite and negative thresholds.
pub fn validate_epsilon(epsilon: f64, generation: usize) -> Result<f64, AbcError> {
    if epsilon.is_nan() {
        return Err(schedule_error("epsilon-nan", "scheduled epsilon is NaN", generation));
    }
    if epsilon < 0.0 {
        return Err(AbcError::Schedule(
            ErrorInfo::new("epsilon-negative", "scheduled epsilon is negative")
                .with_context("generation", generation)
                .with_context("epsilon", epsilon),
        ));
    }
    if epsilon.is_infinite() {
        return Err(schedule_error(
            "epsilon-infinite",
            "scheduled epsilon is infinite",
            generation,
        ));
    }
    Ok(epsilon)
}

fn population_quantile(previous: &Population, alpha: f64) -> Result<f64, AbcError> {
    weighted_quantile(&previous.distances(), &previous.weights(), alpha).ok_or_else(|| {
        schedule_error(
            "epsilon-quantile",
            "distance quantile undefined for this population",
            previous.generation(),
        )
    })
}

/// Weighted median of the previous distances.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianEpsilon;

impl ToleranceScheduler for MedianEpsilon {
    fn name(&self) -> &str {
        "median"
    }

    fn next_epsilon(&self, previous: &Population) -> Result<f64, AbcError> {
        population_quantile(previous, 0.5)
    }
}

/// Weighted α-quantile of the previous distances, times a multiplier.
#[derive(Debug, Clone, Copy)]
pub struct QuantileEpsilon {
    alpha: f64,
    multiplier: f64,
}

impl QuantileEpsilon {
    /// Quantile `alpha` scaled by `multiplier`.
    pub fn new(alpha: f64, multiplier: f64) -> Self {
        Self { alpha, multiplier }
    }
}

impl ToleranceScheduler for QuantileEpsilon {
    fn name(&self) -> &str {
        "quantile"
    }

    fn next_epsilon(&self, previous: &Population) -> Result<f64, AbcError> {
        Ok(population_quantile(previous, self.alpha)? * self.multiplier)
    }
}

/// Predefined thresholds, indexed by generation.
///
/// Generations past the end of the list reuse the last entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEpsilon {
    values: Vec<f64>,
}

impl ListEpsilon {
    /// Schedule where `values[t]` is the threshold of generation `t`.
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl ToleranceScheduler for ListEpsilon {
    fn name(&self) -> &str {
        "list"
    }

    fn next_epsilon(&self, previous: &Population) -> Result<f64, AbcError> {
        let next = previous.generation() + 1;
        self.values
            .get(next)
            .or_else(|| self.values.last())
            .copied()
            .ok_or_else(|| schedule_error("epsilon-list-empty", "epsilon list is empty", next))
    }
}

/// The same threshold for every generation.
#[derive(Debug, Clone, Copy)]
pub struct ConstantEpsilon {
    value: f64,
}

impl ConstantEpsilon {
    /// Constant threshold `value`.
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl ToleranceScheduler for ConstantEpsilon {
    fn name(&self) -> &str {
        "constant"
    }

    fn next_epsilon(&self, _previous: &Population) -> Result<f64, AbcError> {
        Ok(self.value)
    }
}

/// Quantile level driven by the previous generation's acceptance rate.
///
/// A population accepted more easily than `target_rate` tightens quickly (the
/// lower quantile); a harder one tightens slowly.
#[derive(Debug, Clone, Copy)]
pub struct AcceptanceRateEpsilon {
    target_rate: f64,
    alpha_low: f64,
    alpha_high: f64,
}

impl AcceptanceRateEpsilon {
    /// Creates the policy.
    pub fn new(target_rate: f64, alpha_low: f64, alpha_high: f64) -> Self {
        Self {
            target_rate,
            alpha_low,
            alpha_high,
        }
    }
}

impl ToleranceScheduler for AcceptanceRateEpsilon {
    fn name(&self) -> &str {
        "acceptance-rate"
    }

    fn next_epsilon(&self, previous: &Population) -> Result<f64, AbcError> {
        let alpha = if previous.acceptance_rate() > self.target_rate {
            self.alpha_low
        } else {
            self.alpha_high
        };
        population_quantile(previous, alpha)
    }
}

/// Builds the scheduler selected in the configuration.
pub fn from_config(config: &EpsilonConfig) -> Box<dyn ToleranceScheduler> {
    match config {
        EpsilonConfig::Median => Box::new(MedianEpsilon),
        EpsilonConfig::Quantile { alpha, multiplier } => {
            Box::new(QuantileEpsilon::new(*alpha, *multiplier))
        }
        EpsilonConfig::List { values } => Box::new(ListEpsilon::new(values.clone())),
        EpsilonConfig::Constant { value } => Box::new(ConstantEpsilon::new(*value)),
        EpsilonConfig::AcceptanceRate {
            target_rate,
            alpha_low,
            alpha_high,
        } => Box::new(AcceptanceRateEpsilon::new(
            *target_rate,
            *alpha_low,
            *alpha_high,
        )),
    }
}
