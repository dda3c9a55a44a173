//! Weighted particle populations.

use std::collections::BTreeMap;

use abc_core::weighted::effective_sample_size;
use abc_core::{AbcError, ErrorInfo, Parameter, SumStats};
use serde::{Deserialize, Serialize};

use crate::selection;

/// One accepted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Index of the model that produced the particle.
    pub model: usize,
    /// Parameter values.
    pub parameter: Parameter,
    /// Simulated summary statistics.
    pub sum_stats: SumStats,
    /// Distance of the simulation to the observation.
    pub distance: f64,
    /// Importance weight, normalised over the whole population.
    pub weight: f64,
}

impl Particle {
    /// Whether every parameter value, statistic and the distance are finite.
    pub fn is_finite(&self) -> bool {
        self.distance.is_finite()
            && self.parameter.values().all(f64::is_finite)
            && self.sum_stats.values().all(f64::is_finite)
    }
}

/// Particles accepted in one generation, grouped by model.
///
/// A population is validated and normalised on construction and never changes
/// afterwards: weights sum to one across all models and the model
/// probabilities are the per-model weight sums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    generation: usize,
    epsilon: Option<f64>,
    particles: Vec<Particle>,
    acceptance_count: usize,
    proposal_count: u64,
    model_probabilities: BTreeMap<usize, f64>,
}

fn acceptance_error(generation: usize, message: &str) -> AbcError {
    AbcError::Acceptance(
        ErrorInfo::new("insufficient-acceptance", message).with_context("generation", generation),
    )
}

impl Population {
    /// Builds a population from accepted particles carrying raw weights.
    pub fn new(
        generation: usize,
        epsilon: Option<f64>,
        mut particles: Vec<Particle>,
        proposal_count: u64,
        nr_models: usize,
    ) -> Result<Self, AbcError> {
        if particles.is_empty() {
            return Err(acceptance_error(
                generation,
                "a population needs at least one accepted particle",
            ));
        }
        if (particles.len() as u64) > proposal_count {
            return Err(AbcError::Acceptance(
                ErrorInfo::new(
                    "proposal-count",
                    "more accepted particles than proposals",
                )
                .with_context("accepted", particles.len())
                .with_context("proposals", proposal_count),
            ));
        }
        if let Some(particle) = particles.iter().find(|p| p.model >= nr_models) {
            return Err(AbcError::Acceptance(
                ErrorInfo::new("unknown-model", "particle refers to a model outside the run")
                    .with_context("model", particle.model)
                    .with_context("nr_models", nr_models),
            ));
        }
        if let Some(particle) = particles.iter().find(|p| !p.is_finite()) {
            return Err(AbcError::Acceptance(
                ErrorInfo::new("non-finite-particle", "particle values must be finite")
                    .with_context("generation", generation)
                    .with_context("model", particle.model)
                    .with_context("distance", particle.distance),
            ));
        }
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        if !(total > 0.0)
            || !total.is_finite()
            || particles.iter().any(|p| !(p.weight >= 0.0))
        {
            return Err(acceptance_error(
                generation,
                "accepted particles carry no usable importance weight",
            ));
        }
        for particle in &mut particles {
            particle.weight /= total;
        }
        particles.sort_by_key(|particle| particle.model);
        let model_probabilities = selection::model_probabilities(&particles, nr_models);
        Ok(Self {
            generation,
            epsilon,
            acceptance_count: particles.len(),
            particles,
            proposal_count,
            model_probabilities,
        })
    }

    /// Reassembles a population read back from a history store.
    ///
    /// Weights are taken as stored (they were normalised when the population was
    /// first built), so a restored population compares equal to the original.
    pub fn restore(
        generation: usize,
        epsilon: Option<f64>,
        particles: Vec<Particle>,
        proposal_count: u64,
        model_probabilities: BTreeMap<usize, f64>,
    ) -> Result<Self, AbcError> {
        if particles.is_empty() || (particles.len() as u64) > proposal_count {
            return Err(AbcError::Persistence(
                ErrorInfo::new("population-restore", "stored population is inconsistent")
                    .with_context("generation", generation)
                    .with_context("particles", particles.len())
                    .with_context("proposals", proposal_count),
            ));
        }
        Ok(Self {
            generation,
            epsilon,
            acceptance_count: particles.len(),
            particles,
            proposal_count,
            model_probabilities,
        })
    }

    /// Generation index, starting at 0.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Threshold used to produce the population (`None` if unconditional).
    pub fn epsilon(&self) -> Option<f64> {
        self.epsilon
    }

    /// All particles, ordered by model.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Particles of one model.
    pub fn particles_of(&self, model: usize) -> impl Iterator<Item = &Particle> + '_ {
        self.particles.iter().filter(move |p| p.model == model)
    }

    /// Number of accepted particles.
    pub fn acceptance_count(&self) -> usize {
        self.acceptance_count
    }

    /// Number of trials spent, including rejections and failed simulations.
    pub fn proposal_count(&self) -> u64 {
        self.proposal_count
    }

    /// Accepted over proposed trials.
    pub fn acceptance_rate(&self) -> f64 {
        self.acceptance_count as f64 / self.proposal_count as f64
    }

    /// Number of models the run compares.
    pub fn nr_models(&self) -> usize {
        self.model_probabilities.len()
    }

    /// Particle count of one model.
    pub fn size_of(&self, model: usize) -> usize {
        self.particles_of(model).count()
    }

    /// Particle counts for every model.
    pub fn sizes(&self) -> BTreeMap<usize, usize> {
        let mut sizes: BTreeMap<usize, usize> =
            self.model_probabilities.keys().map(|&m| (m, 0)).collect();
        for particle in &self.particles {
            *sizes.entry(particle.model).or_insert(0) += 1;
        }
        sizes
    }

    /// Distances of one model's particles, in particle order.
    pub fn distances_of(&self, model: usize) -> Vec<f64> {
        self.particles_of(model).map(|p| p.distance).collect()
    }

    /// Distances of all particles.
    pub fn distances(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.distance).collect()
    }

    /// Weights of all particles.
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }

    /// Sum of all particle weights (one, up to rounding).
    pub fn total_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }

    /// Estimated posterior probability of every model.
    pub fn model_probabilities(&self) -> &BTreeMap<usize, f64> {
        &self.model_probabilities
    }

    /// Probability of one model (0 for unknown indices).
    pub fn model_probability(&self, model: usize) -> f64 {
        self.model_probabilities.get(&model).copied().unwrap_or(0.0)
    }

    /// Parameters of one model with weights renormalised within the model.
    pub fn distribution(&self, model: usize) -> (Vec<Parameter>, Vec<f64>) {
        let mass = self.model_probability(model);
        self.particles_of(model)
            .map(|p| {
                let weight = if mass > 0.0 { p.weight / mass } else { 0.0 };
                (p.parameter.clone(), weight)
            })
            .unzip()
    }

    /// Kish effective sample size of the population weights.
    pub fn effective_sample_size(&self) -> f64 {
        effective_sample_size(&self.weights()).unwrap_or(0.0)
    }
}
