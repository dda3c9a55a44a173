//! Generation loop tying sampler, weights, schedules and history together.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use abc_core::{AbcError, Distance, ErrorInfo, Parameter, RngHandle, SumStats};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::config::{EpsilonConfig, RunConfig};
use crate::determinism;
use crate::distributions::ModelPrior;
use crate::epsilon::{self, validate_epsilon, ToleranceScheduler};
use crate::history::{CompletionReason, HistoryStore, RunId, RunRecord};
use crate::metrics::{GenerationReport, MetricsRecorder};
use crate::model::ModelSpec;
use crate::population::{Particle, Population};
use crate::sampler::{self, EngineSettings, GenerationSample, Proposal, SamplingEngine};
use crate::selection::ModelSelector;
use crate::weights::{self, WeightInputs, WeightPolicy};

/// Position of a run in the generation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "generation", rename_all = "kebab-case")]
pub enum Phase {
    /// Generation 0 is sampled next, from the priors.
    Calibrating,
    /// Generation `t` is sampled next.
    Sampling(usize),
    /// Population `t` is sampled; its successor threshold is computed next.
    Scheduling(usize),
    /// Population `t` is persisted; termination is checked next.
    Persisted(usize),
    /// The run finished.
    Done(CompletionReason),
}

/// Serialisable progress of a run between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Run identifier.
    pub run_id: RunId,
    /// Generation sampled by the next sampling phase.
    pub next_generation: usize,
    /// Threshold of the next generation (`None` for an unconditional generation 0).
    pub epsilon: Option<f64>,
    /// Trials spent over all persisted generations.
    pub total_proposals: u64,
    /// Current phase.
    pub phase: Phase,
}

/// How `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Completion {
    /// The run reached a termination rule and was marked done.
    Completed(CompletionReason),
    /// Cancelled at a generation boundary; the run can be resumed.
    Cancelled,
}

/// Outcome of [`Abc::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: RunId,
    /// How the call returned.
    pub completion: Completion,
    /// Latest generation found in the store when the call started.
    pub resumed_from: Option<usize>,
    /// Reports of the generations sampled by this call.
    pub generations: Vec<GenerationReport>,
    /// Thresholds scheduled by this call, in order.
    pub scheduled_epsilons: Vec<f64>,
    /// Trials spent by the run, including earlier calls.
    pub total_proposals: u64,
}

impl RunSummary {
    /// Writes the generation reports of this call as CSV.
    pub fn write_metrics_csv(&self, path: &std::path::Path) -> Result<(), AbcError> {
        let mut recorder = MetricsRecorder::new();
        for report in &self.generations {
            recorder.push(report.clone());
        }
        recorder.write_csv(path).map_err(|err| {
            AbcError::Persistence(
                ErrorInfo::new("metrics-write", err.to_string())
                    .with_context("path", path.display()),
            )
        })
    }
}

/// Cooperative cancellation flag, checked at generation boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Working data of one `run` call that is not part of [`RunState`].
#[derive(Debug)]
pub struct Session {
    observed: SumStats,
    run_key: u64,
    pool: rayon::ThreadPool,
    previous: Option<Population>,
    pending: Option<(Population, GenerationSample)>,
    selector: ModelSelector,
    recorder: MetricsRecorder,
    resumed_from: Option<usize>,
    scheduled_epsilons: Vec<f64>,
}

impl Session {
    /// Most recent completed population.
    pub fn previous(&self) -> Option<&Population> {
        self.previous.as_ref()
    }

    /// Reports recorded so far.
    pub fn reports(&self) -> &[GenerationReport] {
        self.recorder.reports()
    }

    fn summary(self, state: &RunState, completion: Completion) -> RunSummary {
        RunSummary {
            run_id: state.run_id.clone(),
            completion,
            resumed_from: self.resumed_from,
            generations: self.recorder.into_reports(),
            scheduled_epsilons: self.scheduled_epsilons,
            total_proposals: state.total_proposals,
        }
    }
}

/// ABC-SMC model selection over a fixed list of candidate models.
pub struct Abc {
    config: RunConfig,
    models: Vec<ModelSpec>,
    distance: Box<dyn Distance>,
    model_prior: ModelPrior,
    scheduler: Box<dyn ToleranceScheduler>,
    weight_policy: Box<dyn WeightPolicy>,
    cancellation: CancellationToken,
}

impl Abc {
    /// Validates the configuration and prepares the candidate models.
    pub fn new(
        config: RunConfig,
        mut models: Vec<ModelSpec>,
        distance: impl Distance + 'static,
    ) -> Result<Self, AbcError> {
        config.validate()?;
        if models.is_empty() {
            return Err(AbcError::Config(ErrorInfo::new(
                "models",
                "at least one model is required",
            )));
        }
        let mut names = BTreeSet::new();
        for spec in &models {
            if !names.insert(spec.name().to_string()) {
                return Err(AbcError::Config(
                    ErrorInfo::new("models", "model names must be unique")
                        .with_context("name", spec.name()),
                ));
            }
        }
        for spec in &mut models {
            spec.configure_default_transition(&config.transition);
        }
        let model_prior = ModelPrior::uniform(models.len());
        let scheduler = epsilon::from_config(&config.epsilon);
        let weight_policy = weights::from_config(config.weights);
        Ok(Self {
            config,
            models,
            distance: Box::new(distance),
            model_prior,
            scheduler,
            weight_policy,
            cancellation: CancellationToken::default(),
        })
    }

    /// Replaces the uniform model prior.
    pub fn with_model_prior(mut self, model_prior: ModelPrior) -> Result<Self, AbcError> {
        if model_prior.len() != self.models.len() {
            return Err(AbcError::Config(
                ErrorInfo::new("model-prior", "model prior size differs from the model list")
                    .with_context("prior", model_prior.len())
                    .with_context("models", self.models.len()),
            ));
        }
        self.model_prior = model_prior;
        Ok(self)
    }

    /// Replaces the configured tolerance scheduler.
    pub fn with_scheduler(mut self, scheduler: impl ToleranceScheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Replaces the configured weight policy.
    pub fn with_weight_policy(mut self, policy: impl WeightPolicy + 'static) -> Self {
        self.weight_policy = Box::new(policy);
        self
    }

    /// Token that cancels `run` at the next generation boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Candidate models in index order.
    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    /// Identifier of the run conditioned on `observed`.
    ///
    /// The configured `run_id` if set, otherwise a digest of the models,
    /// distance, observation, population size and seed. Termination settings
    /// do not take part, so a run can be resumed with a larger budget.
    pub fn run_id(&self, observed: &SumStats) -> RunId {
        if let Some(run_id) = &self.config.run_id {
            return run_id.clone();
        }
        let identity = serde_json::json!({
            "models": self.model_names(),
            "distance": self.distance.name(),
            "observed": observed,
            "population_size": self.config.population_size,
            "master_seed": self.config.seed_policy.master_seed,
            "label": self.config.seed_policy.label,
        });
        let digest = Sha256::digest(identity.to_string().as_bytes());
        format!("abc-{}", &hex::encode(digest)[..16])
    }

    /// Digest of everything that changes what the sampler produces.
    pub fn config_hash(&self) -> String {
        let mut sampling = self.config.clone();
        sampling.minimum_epsilon = 0.0;
        sampling.max_nr_populations = 1;
        sampling.max_total_simulations = None;
        sampling.concurrency = Default::default();
        sampling.run_id = None;
        let identity = serde_json::json!({
            "models": self.model_names(),
            "distance": self.distance.name(),
            "model_prior": self.model_prior.probabilities(),
            "scheduler": self.scheduler.name(),
            "weights": self.weight_policy.name(),
            "config": sampling,
        });
        hex::encode(Sha256::digest(identity.to_string().as_bytes()))
    }

    fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|spec| spec.name().to_string()).collect()
    }

    fn initial_epsilon(&self) -> Option<f64> {
        self.config.initial_epsilon.or_else(|| match &self.config.epsilon {
            EpsilonConfig::List { values } => values.first().copied(),
            _ => None,
        })
    }

    /// Runs (or resumes) the inference until a termination rule fires or the
    /// run is cancelled.
    pub fn run(
        &mut self,
        observed: &SumStats,
        store: &mut dyn HistoryStore,
    ) -> Result<RunSummary, AbcError> {
        let (mut state, mut session) = self.begin(observed, store)?;
        loop {
            if let Phase::Done(reason) = state.phase {
                info!(
                    run_id = %state.run_id,
                    reason = reason.as_str(),
                    total_proposals = state.total_proposals,
                    "run complete"
                );
                return Ok(session.summary(&state, Completion::Completed(reason)));
            }
            let at_boundary = matches!(state.phase, Phase::Calibrating | Phase::Sampling(_));
            if at_boundary && self.cancellation.is_cancelled() {
                info!(
                    run_id = %state.run_id,
                    next_generation = state.next_generation,
                    "run cancelled"
                );
                return Ok(session.summary(&state, Completion::Cancelled));
            }
            state = match self.step(state, &mut session, store) {
                Ok(next) => next,
                Err(err) => {
                    error!(error = %err, "run aborted");
                    return Err(err);
                }
            };
        }
    }

    /// Registers the run and derives the state to continue from.
    ///
    /// A store without populations for the run starts at
    /// [`Phase::Calibrating`]. Otherwise the latest generation is loaded, its
    /// successor threshold recomputed, and the state placed at
    /// [`Phase::Persisted`] so the next step re-evaluates termination.
    pub fn begin(
        &self,
        observed: &SumStats,
        store: &mut dyn HistoryStore,
    ) -> Result<(RunState, Session), AbcError> {
        let run_id = self.run_id(observed);
        let record = RunRecord {
            run_id: run_id.clone(),
            start_time: Utc::now().to_rfc3339(),
            observed: observed.clone(),
            model_names: self.model_names(),
            distance_name: self.distance.name().to_string(),
            population_size: self.config.population_size,
            master_seed: self.config.seed_policy.master_seed,
            seed_label: self.config.seed_policy.label.clone(),
            config_hash: self.config_hash(),
        };
        let run_id = store.create_run(&record)?;
        let metadata = store.run_metadata(&run_id)?;
        let latest = store.latest_generation(&run_id)?;
        let mut session = Session {
            observed: observed.clone(),
            run_key: determinism::run_key(self.config.seed_policy.master_seed, &run_id),
            pool: sampler::build_pool(self.config.concurrency.workers)?,
            previous: None,
            pending: None,
            selector: ModelSelector::new(),
            recorder: MetricsRecorder::new(),
            resumed_from: latest,
            scheduled_epsilons: Vec::new(),
        };

        let Some(generation) = latest else {
            info!(run_id = %run_id, models = self.models.len(), "starting run");
            let state = RunState {
                run_id,
                next_generation: 0,
                epsilon: self.initial_epsilon(),
                total_proposals: 0,
                phase: Phase::Calibrating,
            };
            return Ok((state, session));
        };

        let population = store.load_population(&run_id, generation)?;
        let total_proposals = store.total_proposals(&run_id)?;
        let phase = match metadata.completion_reason {
            Some(reason) => Phase::Done(reason),
            None => Phase::Persisted(generation),
        };
        let epsilon = if metadata.is_done() {
            None
        } else {
            let next = validate_epsilon(self.scheduler.next_epsilon(&population)?, generation + 1)?;
            session.scheduled_epsilons.push(next);
            Some(next)
        };
        info!(
            run_id = %run_id,
            generation,
            total_proposals,
            done = metadata.is_done(),
            "resuming run"
        );
        session.selector = ModelSelector::resume_from(&population);
        session.previous = Some(population);
        let state = RunState {
            run_id,
            next_generation: generation + 1,
            epsilon,
            total_proposals,
            phase,
        };
        Ok((state, session))
    }

    /// Advances the state machine by one phase.
    pub fn step(
        &mut self,
        state: RunState,
        session: &mut Session,
        store: &mut dyn HistoryStore,
    ) -> Result<RunState, AbcError> {
        debug!(run_id = %state.run_id, phase = ?state.phase, "step");
        match state.phase {
            Phase::Calibrating => self.sample(state, 0, session),
            Phase::Sampling(generation) => self.sample(state, generation, session),
            Phase::Scheduling(generation) => self.schedule(state, generation, session, store),
            Phase::Persisted(generation) => self.terminate(state, generation, store),
            Phase::Done(_) => Ok(state),
        }
    }

    fn sample(
        &mut self,
        state: RunState,
        generation: usize,
        session: &mut Session,
    ) -> Result<RunState, AbcError> {
        let nr_models = self.models.len();
        let sampled = match session.previous.as_ref() {
            None => {
                let engine = self.engine(session, self.config.population_size);
                let sample = engine.sample_generation(
                    generation,
                    state.epsilon,
                    Proposal::Prior {
                        model_prior: &self.model_prior,
                    },
                )?;
                let particles: Vec<Particle> = sample
                    .accepted
                    .iter()
                    .map(|trial| trial.particle.clone())
                    .collect();
                let population = Population::new(
                    generation,
                    state.epsilon,
                    particles,
                    sample.proposal_count,
                    nr_models,
                )?;
                (population, sample)
            }
            Some(previous) => {
                let previous = previous.clone();
                self.fit_transitions(&previous)?;
                let population_size = self.population_size(generation, &previous, session);
                let engine = self.engine(session, population_size);
                let sample = engine.sample_generation(
                    generation,
                    state.epsilon,
                    Proposal::Perturbation {
                        previous: &previous,
                    },
                )?;
                let previous_model_probabilities: Vec<f64> = (0..nr_models)
                    .map(|model| previous.model_probability(model))
                    .collect();
                let model_acceptance_rates: Vec<f64> = sample
                    .model_acceptances
                    .iter()
                    .zip(&sample.model_proposals)
                    .map(|(&accepted, &proposed)| {
                        if proposed == 0 {
                            0.0
                        } else {
                            accepted as f64 / proposed as f64
                        }
                    })
                    .collect();
                let raw = self.weight_policy.raw_weights(&WeightInputs {
                    accepted: &sample.accepted,
                    model_prior: &self.model_prior,
                    previous_model_probabilities: &previous_model_probabilities,
                    model_acceptance_rates: &model_acceptance_rates,
                })?;
                let particles: Vec<Particle> = sample
                    .accepted
                    .iter()
                    .zip(raw)
                    .map(|(trial, weight)| Particle {
                        weight,
                        ..trial.particle.clone()
                    })
                    .collect();
                let population = Population::new(
                    generation,
                    state.epsilon,
                    particles,
                    sample.proposal_count,
                    nr_models,
                )?;
                (population, sample)
            }
        };
        session.pending = Some(sampled);
        Ok(RunState {
            phase: Phase::Scheduling(generation),
            ..state
        })
    }

    fn engine<'a>(&'a self, session: &'a Session, population_size: usize) -> SamplingEngine<'a> {
        let settings = EngineSettings {
            population_size,
            ..EngineSettings::from_config(&self.config)
        };
        SamplingEngine::new(
            &self.models,
            self.distance.as_ref(),
            &session.observed,
            settings,
            session.run_key,
            &session.pool,
        )
    }

    /// Target size of `generation`: fixed, or the summed particle counts the
    /// fitted kernels need to reach the configured coefficient of variation.
    ///
    /// A kernel that cannot estimate its variation keeps its model's previous
    /// particle count.
    fn population_size(
        &self,
        generation: usize,
        previous: &Population,
        session: &Session,
    ) -> usize {
        let Some(adaptive) = &self.config.adaptive_population else {
            return self.config.population_size;
        };
        let mut rng = RngHandle::from_seed(determinism::population_size_seed(
            session.run_key,
            generation,
        ));
        let sizes = previous.sizes();
        let mut requested = 0usize;
        for (model, spec) in self.models.iter().enumerate() {
            if previous.model_probability(model) <= 0.0 {
                continue;
            }
            let needed = match spec.transition.required_nr_samples(adaptive.mean_cv, &mut rng) {
                Ok(needed) => needed,
                Err(err) => {
                    debug!(generation, model, error = %err, "keeping previous model size");
                    sizes.get(&model).copied().unwrap_or(0)
                }
            };
            requested = requested.saturating_add(needed);
        }
        let size = adaptive.clamp(requested);
        info!(generation, requested, population_size = size, "adapted population size");
        size
    }

    fn fit_transitions(&mut self, previous: &Population) -> Result<(), AbcError> {
        for (model, spec) in self.models.iter_mut().enumerate() {
            if previous.model_probability(model) <= 0.0 {
                continue;
            }
            let (parameters, weights): (Vec<Parameter>, Vec<f64>) = previous.distribution(model);
            spec.transition.fit(&parameters, &weights)?;
        }
        Ok(())
    }

    fn schedule(
        &mut self,
        state: RunState,
        generation: usize,
        session: &mut Session,
        store: &mut dyn HistoryStore,
    ) -> Result<RunState, AbcError> {
        let (population, sample) = session.pending.take().ok_or_else(|| {
            AbcError::Persistence(
                ErrorInfo::new("missing-population", "no sampled population to schedule from")
                    .with_context("generation", generation),
            )
        })?;
        let next = validate_epsilon(self.scheduler.next_epsilon(&population)?, generation + 1)?;
        let stalled = population.epsilon().is_some_and(|current| next >= current);
        if stalled {
            warn!(
                generation,
                epsilon = ?population.epsilon(),
                next_epsilon = next,
                "tolerance did not decrease"
            );
        }
        let absorbed = session.selector.observe(&population)?;
        store.append_population(&state.run_id, &population)?;

        let report = GenerationReport {
            generation,
            epsilon: population.epsilon(),
            next_epsilon: next,
            acceptance_count: population.acceptance_count(),
            proposal_count: population.proposal_count(),
            rejected: sample.rejected,
            failed: sample.failed,
            acceptance_rate: population.acceptance_rate(),
            effective_sample_size: population.effective_sample_size(),
            model_probabilities: population.model_probabilities().clone(),
            absorbed,
            stalled,
        };
        info!(
            generation,
            epsilon = ?report.epsilon,
            next_epsilon = next,
            acceptance_rate = report.acceptance_rate,
            proposals = report.proposal_count,
            ess = report.effective_sample_size,
            "generation persisted"
        );
        session.recorder.push(report);
        session.scheduled_epsilons.push(next);
        session.previous = Some(population);
        Ok(RunState {
            next_generation: generation + 1,
            epsilon: Some(next),
            total_proposals: state.total_proposals + sample.proposal_count,
            phase: Phase::Persisted(generation),
            ..state
        })
    }

    fn terminate(
        &self,
        state: RunState,
        generation: usize,
        store: &mut dyn HistoryStore,
    ) -> Result<RunState, AbcError> {
        let reason = if state
            .epsilon
            .is_some_and(|next| next <= self.config.minimum_epsilon)
        {
            Some(CompletionReason::EpsilonReached)
        } else if generation + 1 >= self.config.max_nr_populations {
            Some(CompletionReason::MaxPopulations)
        } else if self
            .config
            .max_total_simulations
            .is_some_and(|budget| state.total_proposals >= budget)
        {
            Some(CompletionReason::SimulationBudget)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                store.mark_done(&state.run_id, &Utc::now().to_rfc3339(), reason)?;
                Ok(RunState {
                    phase: Phase::Done(reason),
                    ..state
                })
            }
            None => Ok(RunState {
                phase: Phase::Sampling(generation + 1),
                ..state
            }),
        }
    }
}

impl std::fmt::Debug for Abc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Abc")
            .field("config", &self.config)
            .field("models", &self.models)
            .field("distance", &self.distance.name())
            .field("scheduler", &self.scheduler.name())
            .field("weights", &self.weight_policy.name())
            .finish()
    }
}
