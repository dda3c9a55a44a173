//! Importance weight policies for generations after the first.

use abc_core::{AbcError, ErrorInfo};

use crate::config::WeightConfig;
use crate::distributions::ModelPrior;
use crate::sampler::AcceptedTrial;

/// Everything a policy may use to weight the accepted trials of a generation.
#[derive(Debug, Clone, Copy)]
pub struct WeightInputs<'a> {
    /// Accepted trials with their prior and importance densities.
    pub accepted: &'a [AcceptedTrial],
    /// Prior over model indices.
    pub model_prior: &'a ModelPrior,
    /// Model probabilities of the previous generation (the model proposal).
    pub previous_model_probabilities: &'a [f64],
    /// Accepted over proposed trials per model in this generation (0 for a
    /// model that was never proposed).
    pub model_acceptance_rates: &'a [f64],
}

/// Maps accepted trials to raw (unnormalised) importance weights.
pub trait WeightPolicy: Send + Sync {
    /// Stable policy name.
    fn name(&self) -> &str;

    /// One raw weight per accepted trial, in the same order.
    fn raw_weights(&self, inputs: &WeightInputs<'_>) -> Result<Vec<f64>, AbcError>;
}

/// Joint importance ratio `π(m) π(θ|m) / (p̂(m) q_m(θ))`.
///
/// `p̂` is the previous generation's model probability (the distribution the
/// sampler drew the model from) and `q_m` the fitted transition mixture of
/// that model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceWeights;

impl WeightPolicy for ImportanceWeights {
    fn name(&self) -> &str {
        "importance"
    }

    fn raw_weights(&self, inputs: &WeightInputs<'_>) -> Result<Vec<f64>, AbcError> {
        inputs
            .accepted
            .iter()
            .map(|trial| {
                let proposal = inputs
                    .previous_model_probabilities
                    .get(trial.particle.model)
                    .copied()
                    .unwrap_or(0.0)
                    * trial.importance_density;
                let target = inputs.model_prior.pmf(trial.particle.model) * trial.prior_density;
                checked_ratio(target, proposal, trial.particle.model)
            })
            .collect()
    }
}

/// Within-model ratio `π(θ|m) / q_m(θ)`, normalised per model and scaled by
/// the model's share of the accepted particles.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptanceShareWeights;

impl WeightPolicy for AcceptanceShareWeights {
    fn name(&self) -> &str {
        "acceptance-share"
    }

    fn raw_weights(&self, inputs: &WeightInputs<'_>) -> Result<Vec<f64>, AbcError> {
        let ratios = WithinModelRatios::new(inputs)?;
        let total = inputs.accepted.len() as f64;
        Ok(ratios.scaled(inputs, |model| {
            ratios.count.get(model).copied().unwrap_or(0) as f64 / total
        }))
    }
}

/// Within-model ratio `π(θ|m) / q_m(θ)`, normalised per model and scaled by
/// `π(m) · α̂_m`, the model prior times its marginal acceptance rate in the
/// current generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarginalAcceptanceWeights;

impl WeightPolicy for MarginalAcceptanceWeights {
    fn name(&self) -> &str {
        "marginal-acceptance"
    }

    fn raw_weights(&self, inputs: &WeightInputs<'_>) -> Result<Vec<f64>, AbcError> {
        let ratios = WithinModelRatios::new(inputs)?;
        Ok(ratios.scaled(inputs, |model| {
            let rate = inputs.model_acceptance_rates.get(model).copied().unwrap_or(0.0);
            inputs.model_prior.pmf(model) * rate
        }))
    }
}

struct WithinModelRatios {
    ratios: Vec<f64>,
    mass: Vec<f64>,
    count: Vec<usize>,
}

impl WithinModelRatios {
    fn new(inputs: &WeightInputs<'_>) -> Result<Self, AbcError> {
        let nr_models = inputs.previous_model_probabilities.len();
        let mut ratios = Vec::with_capacity(inputs.accepted.len());
        let mut mass = vec![0.0f64; nr_models];
        let mut count = vec![0usize; nr_models];
        for trial in inputs.accepted {
            let ratio = checked_ratio(
                trial.prior_density,
                trial.importance_density,
                trial.particle.model,
            )?;
            if let Some(model_mass) = mass.get_mut(trial.particle.model) {
                *model_mass += ratio;
                count[trial.particle.model] += 1;
            }
            ratios.push(ratio);
        }
        Ok(Self {
            ratios,
            mass,
            count,
        })
    }

    /// Normalises each ratio within its model and multiplies by `model_mass(m)`.
    fn scaled(&self, inputs: &WeightInputs<'_>, model_mass: impl Fn(usize) -> f64) -> Vec<f64> {
        inputs
            .accepted
            .iter()
            .zip(&self.ratios)
            .map(|(trial, ratio)| {
                let model = trial.particle.model;
                let mass = self.mass.get(model).copied().unwrap_or(0.0);
                if mass > 0.0 {
                    ratio / mass * model_mass(model)
                } else {
                    0.0
                }
            })
            .collect()
    }
}

fn checked_ratio(numerator: f64, denominator: f64, model: usize) -> Result<f64, AbcError> {
    let ratio = numerator / denominator;
    if !ratio.is_finite() || ratio < 0.0 {
        return Err(AbcError::Acceptance(
            ErrorInfo::new("importance-weight", "importance weight is not a finite number")
                .with_context("model", model)
                .with_context("numerator", numerator)
                .with_context("denominator", denominator),
        ));
    }
    Ok(ratio)
}

/// Builds the policy selected in the configuration.
pub fn from_config(config: WeightConfig) -> Box<dyn WeightPolicy> {
    match config {
        WeightConfig::Importance => Box::new(ImportanceWeights),
        WeightConfig::AcceptanceShare => Box::new(AcceptanceShareWeights),
        WeightConfig::MarginalAcceptance => Box::new(MarginalAcceptanceWeights),
    }
}
