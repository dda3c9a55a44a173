//! Model probabilities of a population.

use std::collections::BTreeMap;

use abc_core::{AbcError, ErrorInfo};
use tracing::info;

use crate::population::{Particle, Population};

/// Tolerance on the unit sum of model probabilities.
pub const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Posterior model probabilities as per-model sums of normalised weights.
///
/// Every model in `0..nr_models` receives an entry; models without particles
/// get probability 0.
pub fn model_probabilities(particles: &[Particle], nr_models: usize) -> BTreeMap<usize, f64> {
    let mut sums = vec![0.0f64; nr_models];
    for particle in particles {
        if let Some(slot) = sums.get_mut(particle.model) {
            *slot += particle.weight;
        }
    }
    let total: f64 = sums.iter().sum();
    sums.into_iter()
        .enumerate()
        .map(|(model, mass)| {
            let probability = if total > 0.0 { mass / total } else { 0.0 };
            (model, probability)
        })
        .collect()
}

/// Tracks model probabilities across generations.
///
/// A model whose probability drops to zero is absorbed: the sampler draws
/// models proportionally to these probabilities, so it can never regain weight.
/// The selector reports the transition once and checks the invariant.
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    previous: Option<BTreeMap<usize, f64>>,
    absorbed: Vec<usize>,
}

impl ModelSelector {
    /// Creates a selector without history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the selector with a population loaded on resume.
    pub fn resume_from(population: &Population) -> Self {
        let absorbed = zero_models(population.model_probabilities());
        Self {
            previous: Some(population.model_probabilities().clone()),
            absorbed,
        }
    }

    /// Validates a new generation's probabilities and records absorbed models.
    ///
    /// Returns the models absorbed in this generation.
    pub fn observe(&mut self, population: &Population) -> Result<Vec<usize>, AbcError> {
        let probabilities = population.model_probabilities();
        let total: f64 = probabilities.values().sum();
        if (total - 1.0).abs() > PROBABILITY_TOLERANCE
            || probabilities.values().any(|p| !(*p >= 0.0))
        {
            return Err(AbcError::Acceptance(
                ErrorInfo::new("model-probabilities", "model probabilities do not sum to one")
                    .with_context("generation", population.generation())
                    .with_context("total", total),
            ));
        }
        let mut newly_absorbed = Vec::new();
        for model in zero_models(probabilities) {
            if !self.absorbed.contains(&model) {
                info!(
                    generation = population.generation(),
                    model, "model absorbed at probability zero"
                );
                self.absorbed.push(model);
                newly_absorbed.push(model);
            }
        }
        if let Some(previous) = &self.previous {
            for (model, probability) in probabilities {
                let was_absorbed = previous.get(model).is_some_and(|p| *p == 0.0);
                if was_absorbed && *probability > 0.0 {
                    return Err(AbcError::Acceptance(
                        ErrorInfo::new("absorbed-model-revived", "absorbed model regained weight")
                            .with_context("generation", population.generation())
                            .with_context("model", model),
                    ));
                }
            }
        }
        self.previous = Some(probabilities.clone());
        Ok(newly_absorbed)
    }

    /// Models absorbed so far, in order of absorption.
    pub fn absorbed(&self) -> &[usize] {
        &self.absorbed
    }
}

fn zero_models(probabilities: &BTreeMap<usize, f64>) -> Vec<usize> {
    probabilities
        .iter()
        .filter(|(_, p)| **p == 0.0)
        .map(|(model, _)| *model)
        .collect()
}
