//! In-memory history store.

use std::collections::BTreeMap;

use abc_core::AbcError;

use super::{
    check_existing_run, check_next_generation, missing_generation, unknown_run, CompletionReason,
    HistoryStore, RunId, RunMetadata, RunRecord,
};
use crate::population::Population;

#[derive(Debug, Clone)]
struct StoredRun {
    record: RunRecord,
    end_time: Option<String>,
    completion_reason: Option<CompletionReason>,
    populations: Vec<Population>,
}

/// In-process store; cloning takes a snapshot of every run.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    runs: BTreeMap<RunId, StoredRun>,
}

impl MemoryHistory {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifiers of all runs.
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.keys().cloned().collect()
    }

    fn run(&self, run_id: &str) -> Result<&StoredRun, AbcError> {
        self.runs.get(run_id).ok_or_else(|| unknown_run(run_id))
    }

    fn run_mut(&mut self, run_id: &str) -> Result<&mut StoredRun, AbcError> {
        self.runs.get_mut(run_id).ok_or_else(|| unknown_run(run_id))
    }
}

impl HistoryStore for MemoryHistory {
    fn create_run(&mut self, record: &RunRecord) -> Result<RunId, AbcError> {
        if let Some(existing) = self.runs.get(&record.run_id) {
            return check_existing_run(&existing.record, record);
        }
        self.runs.insert(
            record.run_id.clone(),
            StoredRun {
                record: record.clone(),
                end_time: None,
                completion_reason: None,
                populations: Vec::new(),
            },
        );
        Ok(record.run_id.clone())
    }

    fn append_population(&mut self, run_id: &str, population: &Population) -> Result<(), AbcError> {
        let run = self.run_mut(run_id)?;
        let latest = run.populations.len().checked_sub(1);
        check_next_generation(run_id, latest, population.generation())?;
        run.populations.push(population.clone());
        Ok(())
    }

    fn load_population(&self, run_id: &str, generation: usize) -> Result<Population, AbcError> {
        self.run(run_id)?
            .populations
            .get(generation)
            .cloned()
            .ok_or_else(|| missing_generation(run_id, generation))
    }

    fn latest_generation(&self, run_id: &str) -> Result<Option<usize>, AbcError> {
        Ok(self.run(run_id)?.populations.len().checked_sub(1))
    }

    fn mark_done(
        &mut self,
        run_id: &str,
        end_time: &str,
        reason: CompletionReason,
    ) -> Result<(), AbcError> {
        let run = self.run_mut(run_id)?;
        run.end_time = Some(end_time.to_string());
        run.completion_reason = Some(reason);
        Ok(())
    }

    fn run_metadata(&self, run_id: &str) -> Result<RunMetadata, AbcError> {
        let run = self.run(run_id)?;
        Ok(RunMetadata {
            record: run.record.clone(),
            end_time: run.end_time.clone(),
            completion_reason: run.completion_reason,
            generations: run.populations.len(),
        })
    }

    fn total_proposals(&self, run_id: &str) -> Result<u64, AbcError> {
        Ok(self
            .run(run_id)?
            .populations
            .iter()
            .map(Population::proposal_count)
            .sum())
    }
}
