//! Rejection sampling of one generation on a worker pool.

use abc_core::{AbcError, Distance, ErrorInfo, Parameter, RngHandle, SumStats};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::determinism;
use crate::distributions::ModelPrior;
use crate::model::ModelSpec;
use crate::population::{Particle, Population};

/// Accepted trial with the densities needed to weight it.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedTrial {
    /// Accepted particle; its weight is a placeholder until the population is built.
    pub particle: Particle,
    /// Prior density of the parameter under its model's prior.
    pub prior_density: f64,
    /// Transition mixture density of the parameter (1 for prior draws).
    pub importance_density: f64,
}

#[derive(Debug)]
enum TrialOutcome {
    Accepted(AcceptedTrial),
    Rejected { model: usize },
    Failed { model: usize, error: AbcError },
}

/// Trials of one generation, consumed in trial order up to the target size.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSample {
    /// Exactly `population_size` accepted trials.
    pub accepted: Vec<AcceptedTrial>,
    /// Trials consumed, including rejections and failures.
    pub proposal_count: u64,
    /// Trials rejected by the threshold or the prior support.
    pub rejected: u64,
    /// Trials whose simulation or distance evaluation failed.
    pub failed: u64,
    /// Trials consumed per model.
    pub model_proposals: Vec<u64>,
    /// Acceptances per model.
    pub model_acceptances: Vec<u64>,
}

impl GenerationSample {
    fn new(nr_models: usize, capacity: usize) -> Self {
        Self {
            accepted: Vec::with_capacity(capacity),
            proposal_count: 0,
            rejected: 0,
            failed: 0,
            model_proposals: vec![0; nr_models],
            model_acceptances: vec![0; nr_models],
        }
    }
}

/// Where trial parameters come from.
#[derive(Debug, Clone, Copy)]
pub enum Proposal<'a> {
    /// Generation 0: model and parameters drawn from the priors.
    Prior {
        /// Prior over model indices.
        model_prior: &'a ModelPrior,
    },
    /// Later generations: weighted parents perturbed by the fitted kernels.
    Perturbation {
        /// Population of the previous generation.
        previous: &'a Population,
    },
}

/// Sampler limits derived from the run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Accepted particles per generation.
    pub population_size: usize,
    /// Per-generation cap on consumed trials.
    pub max_total_proposals: Option<usize>,
    /// Consecutive failures of one model before aborting.
    pub max_consecutive_failures: Option<usize>,
    /// Re-perturbations while a proposal leaves the prior support.
    pub max_perturbation_attempts: usize,
    /// Worker threads.
    pub workers: usize,
    /// Largest batch of trials evaluated at once.
    pub max_batch_size: usize,
}

impl EngineSettings {
    /// Extracts the sampler settings from a run configuration.
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            population_size: config.population_size,
            max_total_proposals: config.max_total_proposals,
            max_consecutive_failures: config.max_consecutive_simulation_failures,
            max_perturbation_attempts: config.max_perturbation_attempts.max(1),
            workers: config.concurrency.workers.max(1),
            max_batch_size: config.concurrency.max_batch_size.max(1),
        }
    }
}

struct ParentTable {
    indices: Vec<usize>,
    cumulative: Vec<f64>,
}

struct ProposalPlan<'a> {
    model_cumulative: Vec<f64>,
    previous: Option<&'a Population>,
    parents: Vec<ParentTable>,
}

fn cumulative(masses: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut total = 0.0;
    masses
        .map(|mass| {
            total += mass;
            total
        })
        .collect()
}

impl<'a> ProposalPlan<'a> {
    fn build(proposal: Proposal<'a>, nr_models: usize) -> Result<Self, AbcError> {
        let plan = match proposal {
            Proposal::Prior { model_prior } => {
                let model_probabilities: Vec<f64> =
                    (0..nr_models).map(|model| model_prior.pmf(model)).collect();
                ProposalPlan {
                    model_cumulative: cumulative(model_probabilities.into_iter()),
                    previous: None,
                    parents: Vec::new(),
                }
            }
            Proposal::Perturbation { previous } => {
                let model_probabilities: Vec<f64> = (0..nr_models)
                    .map(|model| previous.model_probability(model))
                    .collect();
                let mut parents: Vec<ParentTable> = (0..nr_models)
                    .map(|_| ParentTable {
                        indices: Vec::new(),
                        cumulative: Vec::new(),
                    })
                    .collect();
                for (index, particle) in previous.particles().iter().enumerate() {
                    if let Some(table) = parents.get_mut(particle.model) {
                        let running = table.cumulative.last().copied().unwrap_or(0.0);
                        table.indices.push(index);
                        table.cumulative.push(running + particle.weight);
                    }
                }
                ProposalPlan {
                    model_cumulative: cumulative(model_probabilities.into_iter()),
                    previous: Some(previous),
                    parents,
                }
            }
        };
        if plan.model_cumulative.last().map_or(true, |total| !(*total > 0.0)) {
            return Err(AbcError::Acceptance(ErrorInfo::new(
                "no-model-mass",
                "no model carries probability mass to propose from",
            )));
        }
        Ok(plan)
    }
}

/// Worker pool evaluating trials, built once per run.
pub fn build_pool(workers: usize) -> Result<rayon::ThreadPool, AbcError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|err| {
            AbcError::Config(
                ErrorInfo::new("thread-pool", err.to_string()).with_context("workers", workers),
            )
        })
}

/// Produces the accepted particles of one generation.
pub struct SamplingEngine<'a> {
    models: &'a [ModelSpec],
    distance: &'a dyn Distance,
    observed: &'a SumStats,
    settings: EngineSettings,
    run_key: u64,
    pool: &'a rayon::ThreadPool,
}

impl<'a> SamplingEngine<'a> {
    /// Creates an engine evaluating trials on `pool`.
    pub fn new(
        models: &'a [ModelSpec],
        distance: &'a dyn Distance,
        observed: &'a SumStats,
        settings: EngineSettings,
        run_key: u64,
        pool: &'a rayon::ThreadPool,
    ) -> Self {
        Self {
            models,
            distance,
            observed,
            settings,
            run_key,
            pool,
        }
    }

    /// Engine limits.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Samples trials until `population_size` are accepted.
    ///
    /// Trials are evaluated in parallel batches but consumed strictly in trial
    /// order, so the accepted set and `proposal_count` do not depend on the
    /// number of workers. Surplus results of the last batch are discarded.
    pub fn sample_generation(
        &self,
        generation: usize,
        epsilon: Option<f64>,
        proposal: Proposal<'_>,
    ) -> Result<GenerationSample, AbcError> {
        let nr_models = self.models.len();
        let plan = ProposalPlan::build(proposal, nr_models)?;
        let target = self.settings.population_size;
        let mut sample = GenerationSample::new(nr_models, target);
        let mut consecutive_failures = vec![0usize; nr_models];
        let mut next_trial = 0u64;
        let mut batch = self.settings.workers.max(target.min(self.settings.max_batch_size));

        while sample.accepted.len() < target {
            if let Some(cap) = self.settings.max_total_proposals {
                let remaining = (cap as u64).saturating_sub(sample.proposal_count);
                if remaining == 0 {
                    return Err(AbcError::Acceptance(
                        ErrorInfo::new(
                            "proposal-cap",
                            "proposal cap reached before the population was complete",
                        )
                        .with_context("generation", generation)
                        .with_context("accepted", sample.accepted.len())
                        .with_context("target", target)
                        .with_context("proposals", sample.proposal_count)
                        .with_hint("raise max_total_proposals or relax the tolerance schedule"),
                    ));
                }
                batch = batch.min(remaining as usize);
            }

            let start = next_trial;
            let end = start + batch as u64;
            let outcomes: Vec<TrialOutcome> = self.pool.install(|| {
                (start..end)
                    .into_par_iter()
                    .map(|trial_index| self.run_trial(generation, trial_index, epsilon, &plan))
                    .collect()
            });
            next_trial = end;

            for outcome in outcomes {
                sample.proposal_count += 1;
                match outcome {
                    TrialOutcome::Accepted(trial) => {
                        let model = trial.particle.model;
                        consecutive_failures[model] = 0;
                        sample.model_proposals[model] += 1;
                        sample.model_acceptances[model] += 1;
                        sample.accepted.push(trial);
                        if sample.accepted.len() == target {
                            break;
                        }
                    }
                    TrialOutcome::Rejected { model } => {
                        consecutive_failures[model] = 0;
                        sample.model_proposals[model] += 1;
                        sample.rejected += 1;
                    }
                    TrialOutcome::Failed { model, error } => {
                        sample.model_proposals[model] += 1;
                        sample.failed += 1;
                        consecutive_failures[model] += 1;
                        if let Some(limit) = self.settings.max_consecutive_failures {
                            if consecutive_failures[model] > limit {
                                warn!(
                                    generation,
                                    model,
                                    failures = consecutive_failures[model],
                                    "consecutive simulation failures exceeded the limit"
                                );
                                return Err(AbcError::Simulation(
                                    ErrorInfo::new(
                                        "consecutive-failures",
                                        "too many consecutive simulation failures",
                                    )
                                    .with_context("generation", generation)
                                    .with_context("model", self.models[model].name())
                                    .with_context("failures", consecutive_failures[model])
                                    .with_context("last_error", error),
                                ));
                            }
                        }
                    }
                }
            }

            debug!(
                generation,
                batch,
                accepted = sample.accepted.len(),
                proposals = sample.proposal_count,
                "trial batch consumed"
            );
            batch = self.next_batch_size(&sample, batch);
        }
        Ok(sample)
    }

    fn next_batch_size(&self, sample: &GenerationSample, previous: usize) -> usize {
        let target = self.settings.population_size;
        let remaining = target - sample.accepted.len().min(target);
        let estimate = if sample.accepted.is_empty() {
            previous.saturating_mul(2)
        } else {
            let rate = sample.accepted.len() as f64 / sample.proposal_count as f64;
            (remaining as f64 / rate).ceil() as usize
        };
        let workers = self.settings.workers;
        estimate.clamp(workers, self.settings.max_batch_size.max(workers))
    }

    fn run_trial(
        &self,
        generation: usize,
        trial_index: u64,
        epsilon: Option<f64>,
        plan: &ProposalPlan<'_>,
    ) -> TrialOutcome {
        let mut rng =
            RngHandle::from_seed(determinism::trial_seed(self.run_key, generation, trial_index));
        let model = rng.categorical(&plan.model_cumulative).unwrap_or(0);
        let spec = &self.models[model];

        let (parameter, prior_density, importance_density) = match plan.previous {
            None => {
                let parameter = spec.prior.sample(&mut rng);
                let density = spec.prior.pdf(&parameter);
                (parameter, density, 1.0)
            }
            Some(previous) => {
                let Some(parameter) = self.perturb(model, previous, plan, &mut rng) else {
                    return TrialOutcome::Rejected { model };
                };
                let prior_density = spec.prior.pdf(&parameter);
                let importance_density = spec.transition.pdf(&parameter);
                if !(importance_density > 0.0) || !importance_density.is_finite() {
                    return TrialOutcome::Rejected { model };
                }
                (parameter, prior_density, importance_density)
            }
        };

        if let Some((name, value)) = parameter.iter().find(|(_, value)| !value.is_finite()) {
            let error = AbcError::Distribution(
                ErrorInfo::new("non-finite-parameter", "proposed parameter is not finite")
                    .with_context("name", name)
                    .with_context("value", value),
            );
            return TrialOutcome::Failed { model, error };
        }

        let sum_stats = match spec.model.simulate(&parameter, &mut rng) {
            Ok(stats) => stats,
            Err(error) => return TrialOutcome::Failed { model, error },
        };
        if let Some((name, value)) = sum_stats.iter().find(|(_, value)| !value.is_finite()) {
            let error = AbcError::Simulation(
                ErrorInfo::new("non-finite-statistic", "simulated statistic is not finite")
                    .with_context("name", name)
                    .with_context("value", value),
            );
            return TrialOutcome::Failed { model, error };
        }
        let distance = match self.distance.distance(&sum_stats, self.observed) {
            Ok(distance) if distance.is_finite() => distance,
            Ok(distance) => {
                let error = AbcError::Distance(
                    ErrorInfo::new("non-finite-distance", "distance is not a finite number")
                        .with_context("distance", distance),
                );
                return TrialOutcome::Failed { model, error };
            }
            Err(error) => return TrialOutcome::Failed { model, error },
        };
        let accepted = match epsilon {
            None => true,
            Some(threshold) => distance <= threshold,
        };
        if !accepted {
            return TrialOutcome::Rejected { model };
        }
        TrialOutcome::Accepted(AcceptedTrial {
            particle: Particle {
                model,
                parameter,
                sum_stats,
                distance,
                weight: 1.0,
            },
            prior_density,
            importance_density,
        })
    }

    fn perturb(
        &self,
        model: usize,
        previous: &Population,
        plan: &ProposalPlan<'_>,
        rng: &mut RngHandle,
    ) -> Option<Parameter> {
        let table = plan.parents.get(model)?;
        let spec = &self.models[model];
        for _ in 0..self.settings.max_perturbation_attempts {
            let slot = rng.categorical(&table.cumulative)?;
            let parent = &previous.particles()[table.indices[slot]].parameter;
            let candidate = spec.transition.perturb(parent, rng);
            if spec.prior.pdf(&candidate) > 0.0 {
                return Some(candidate);
            }
        }
        None
    }
}
