//! Durable record of runs and their populations.
//!
//! A store keeps, per run, the static run record, the contiguous sequence of
//! populations starting at generation 0 and the completion marker. Appends are
//! at-most-once: a generation that was persisted is never written again, which
//! is what makes resuming an interrupted run safe.

use std::collections::BTreeMap;

use abc_core::{AbcError, ErrorInfo, Parameter, SumStats};
use serde::{Deserialize, Serialize};

use crate::population::Population;

mod directory;
mod memory;

pub use directory::{population_file, DirectoryHistory};
pub use memory::MemoryHistory;

/// Identifier of a run inside a store.
pub type RunId = String;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    /// The next scheduled epsilon fell to or below `minimum_epsilon`.
    EpsilonReached,
    /// `max_nr_populations` generations were produced.
    MaxPopulations,
    /// The run-wide simulation budget was spent.
    SimulationBudget,
}

impl CompletionReason {
    /// Stable string form used by stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::EpsilonReached => "epsilon-reached",
            CompletionReason::MaxPopulations => "max-populations",
            CompletionReason::SimulationBudget => "simulation-budget",
        }
    }

    /// Parses the string form produced by [`CompletionReason::as_str`].
    pub fn parse(value: &str) -> Result<Self, AbcError> {
        match value {
            "epsilon-reached" => Ok(CompletionReason::EpsilonReached),
            "max-populations" => Ok(CompletionReason::MaxPopulations),
            "simulation-budget" => Ok(CompletionReason::SimulationBudget),
            other => Err(AbcError::Serde(
                ErrorInfo::new("completion-reason", "unknown completion reason")
                    .with_context("value", other),
            )),
        }
    }
}

/// Static description of a run, written once when the run is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// RFC 3339 creation time.
    pub start_time: String,
    /// Observed summary statistics the run conditions on.
    pub observed: SumStats,
    /// Model names in index order.
    pub model_names: Vec<String>,
    /// Name of the distance function.
    pub distance_name: String,
    /// Accepted particles per generation.
    pub population_size: usize,
    /// Master seed of the run.
    pub master_seed: u64,
    /// Optional seed label.
    pub seed_label: Option<String>,
    /// Digest of the sampling-relevant configuration.
    pub config_hash: String,
}

/// Run record plus its mutable completion state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Static run description.
    pub record: RunRecord,
    /// RFC 3339 completion time, if the run is done.
    pub end_time: Option<String>,
    /// Completion reason, if the run is done.
    pub completion_reason: Option<CompletionReason>,
    /// Number of persisted generations.
    pub generations: usize,
}

impl RunMetadata {
    /// Whether the run was marked done.
    pub fn is_done(&self) -> bool {
        self.completion_reason.is_some()
    }
}

/// Per-generation overview used by reports and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationSummary {
    /// Generation index.
    pub generation: usize,
    /// Threshold of the generation.
    pub epsilon: Option<f64>,
    /// Accepted particles.
    pub acceptance_count: usize,
    /// Trials spent.
    pub proposal_count: u64,
    /// Effective sample size of the weights.
    pub effective_sample_size: f64,
    /// Model probabilities of the generation.
    pub model_probabilities: BTreeMap<usize, f64>,
}

impl PopulationSummary {
    /// Summarises a population.
    pub fn of(population: &Population) -> Self {
        Self {
            generation: population.generation(),
            epsilon: population.epsilon(),
            acceptance_count: population.acceptance_count(),
            proposal_count: population.proposal_count(),
            effective_sample_size: population.effective_sample_size(),
            model_probabilities: population.model_probabilities().clone(),
        }
    }
}

/// Persistence contract used by the orchestrator.
///
/// Query methods have default implementations in terms of
/// [`HistoryStore::load_population`]; stores backed by a query engine may
/// override them.
pub trait HistoryStore {
    /// Registers a run. Creating an existing run with the same configuration
    /// hash returns its id; a different hash is a persistence error.
    fn create_run(&mut self, record: &RunRecord) -> Result<RunId, AbcError>;

    /// Appends the next generation of a run atomically.
    fn append_population(&mut self, run_id: &str, population: &Population) -> Result<(), AbcError>;

    /// Loads one generation.
    fn load_population(&self, run_id: &str, generation: usize) -> Result<Population, AbcError>;

    /// Highest persisted generation, `None` for a run without populations.
    fn latest_generation(&self, run_id: &str) -> Result<Option<usize>, AbcError>;

    /// Records the completion time and reason.
    fn mark_done(
        &mut self,
        run_id: &str,
        end_time: &str,
        reason: CompletionReason,
    ) -> Result<(), AbcError>;

    /// Run record and completion state.
    fn run_metadata(&self, run_id: &str) -> Result<RunMetadata, AbcError>;

    /// Trials spent over all persisted generations.
    fn total_proposals(&self, run_id: &str) -> Result<u64, AbcError> {
        let mut total = 0u64;
        for generation in self.generations(run_id)? {
            total += self.load_population(run_id, generation)?.proposal_count();
        }
        Ok(total)
    }

    /// Model probabilities indexed by generation.
    fn model_probability_table(
        &self,
        run_id: &str,
    ) -> Result<Vec<BTreeMap<usize, f64>>, AbcError> {
        self.generations(run_id)?
            .map(|generation| {
                self.load_population(run_id, generation)
                    .map(|population| population.model_probabilities().clone())
            })
            .collect()
    }

    /// Parameters and within-model weights of `model` at `generation`
    /// (the latest generation when `None`).
    fn distribution(
        &self,
        run_id: &str,
        model: usize,
        generation: Option<usize>,
    ) -> Result<(Vec<Parameter>, Vec<f64>), AbcError> {
        let generation = match generation {
            Some(generation) => generation,
            None => self
                .latest_generation(run_id)?
                .ok_or_else(|| no_populations(run_id))?,
        };
        Ok(self.load_population(run_id, generation)?.distribution(model))
    }

    /// Thresholds of all persisted generations.
    fn epsilon_trajectory(&self, run_id: &str) -> Result<Vec<Option<f64>>, AbcError> {
        self.generations(run_id)?
            .map(|generation| {
                self.load_population(run_id, generation)
                    .map(|population| population.epsilon())
            })
            .collect()
    }

    /// Summary of every persisted generation.
    fn population_summaries(&self, run_id: &str) -> Result<Vec<PopulationSummary>, AbcError> {
        self.generations(run_id)?
            .map(|generation| {
                self.load_population(run_id, generation)
                    .map(|population| PopulationSummary::of(&population))
            })
            .collect()
    }

    /// Range of persisted generation indices.
    fn generations(&self, run_id: &str) -> Result<std::ops::Range<usize>, AbcError> {
        Ok(0..self.latest_generation(run_id)?.map_or(0, |latest| latest + 1))
    }
}

/// Error for an id the store does not know.
pub fn unknown_run(run_id: &str) -> AbcError {
    AbcError::Persistence(
        ErrorInfo::new("unknown-run", "run not found").with_context("run_id", run_id),
    )
}

fn no_populations(run_id: &str) -> AbcError {
    AbcError::Persistence(
        ErrorInfo::new("no-populations", "run has no persisted populations")
            .with_context("run_id", run_id),
    )
}

/// Error for a generation that is not persisted.
pub fn missing_generation(run_id: &str, generation: usize) -> AbcError {
    AbcError::Persistence(
        ErrorInfo::new("missing-generation", "generation not persisted")
            .with_context("run_id", run_id)
            .with_context("generation", generation),
    )
}

/// Checks a repeated `create_run` against the stored record.
pub fn check_existing_run(existing: &RunRecord, record: &RunRecord) -> Result<RunId, AbcError> {
    if existing.config_hash != record.config_hash {
        return Err(AbcError::Persistence(
            ErrorInfo::new("config-mismatch", "run exists with a different configuration")
                .with_context("run_id", &record.run_id)
                .with_context("stored_hash", &existing.config_hash)
                .with_context("requested_hash", &record.config_hash)
                .with_hint("use a different run_id or the original configuration"),
        ));
    }
    Ok(existing.run_id.clone())
}

/// Checks that `generation` is the next generation after `latest`.
pub fn check_next_generation(
    run_id: &str,
    latest: Option<usize>,
    generation: usize,
) -> Result<(), AbcError> {
    let expected = latest.map_or(0, |latest| latest + 1);
    if generation != expected {
        let code = if latest.is_some_and(|latest| generation <= latest) {
            "generation-exists"
        } else {
            "generation-gap"
        };
        return Err(AbcError::Persistence(
            ErrorInfo::new(code, "populations must be appended in generation order")
                .with_context("run_id", run_id)
                .with_context("generation", generation)
                .with_context("expected", expected),
        ));
    }
    Ok(())
}
