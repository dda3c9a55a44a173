//! File-backed history store: one JSON document per population.

use std::fs;
use std::path::{Path, PathBuf};

use abc_core::{AbcError, ErrorInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    check_existing_run, check_next_generation, missing_generation, unknown_run, CompletionReason,
    HistoryStore, RunId, RunMetadata, RunRecord,
};
use crate::population::Population;

const MANIFEST_FILE: &str = "run.json";

/// Manifest describing a run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunManifest {
    record: RunRecord,
    end_time: Option<String>,
    completion_reason: Option<CompletionReason>,
    /// Population files relative to the run directory, in generation order.
    populations: Vec<PathBuf>,
}

/// File-backed store: one directory per run holding a JSON manifest and one
/// JSON file per generation.
///
/// Every file is written to a temporary sibling and renamed into place. The
/// manifest is rewritten after the population file, so a generation only
/// counts as persisted once the manifest lists it.
#[derive(Debug, Clone)]
pub struct DirectoryHistory {
    root: PathBuf,
}

impl DirectoryHistory {
    /// Opens (creating if necessary) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, AbcError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            AbcError::Persistence(
                ErrorInfo::new("history-mkdir", err.to_string())
                    .with_context("path", root.display()),
            )
        })?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one run.
    pub fn run_directory(&self, run_id: &str) -> Result<PathBuf, AbcError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && run_id != "."
            && run_id != "..";
        if !valid {
            return Err(AbcError::Persistence(
                ErrorInfo::new("run-id", "run id cannot be used as a directory name")
                    .with_context("run_id", run_id)
                    .with_hint("use ASCII letters, digits, '-', '_' or '.'"),
            ));
        }
        Ok(self.root.join(run_id))
    }

    fn manifest_path(&self, run_id: &str) -> Result<PathBuf, AbcError> {
        Ok(self.run_directory(run_id)?.join(MANIFEST_FILE))
    }

    fn load_manifest(&self, run_id: &str) -> Result<RunManifest, AbcError> {
        let path = self.manifest_path(run_id)?;
        if !path.exists() {
            return Err(unknown_run(run_id));
        }
        read_json(&path, "manifest")
    }

    fn store_manifest(&self, run_id: &str, manifest: &RunManifest) -> Result<(), AbcError> {
        write_json(&self.manifest_path(run_id)?, manifest, "manifest")
    }
}

/// File name of a generation inside its run directory.
pub fn population_file(generation: usize) -> PathBuf {
    PathBuf::from(format!("population_{generation:05}.json"))
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, AbcError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        AbcError::Persistence(
            ErrorInfo::new(format!("{what}-read"), err.to_string())
                .with_context("path", path.display()),
        )
    })?;
    serde_json::from_str(&contents).map_err(|err| {
        AbcError::Serde(
            ErrorInfo::new(format!("{what}-parse"), err.to_string())
                .with_context("path", path.display()),
        )
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<(), AbcError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AbcError::Persistence(
                ErrorInfo::new(format!("{what}-mkdir"), err.to_string())
                    .with_context("path", parent.display()),
            )
        })?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|err| {
        AbcError::Serde(
            ErrorInfo::new(format!("{what}-serialize"), err.to_string())
                .with_context("path", path.display()),
        )
    })?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json).map_err(|err| {
        AbcError::Persistence(
            ErrorInfo::new(format!("{what}-write"), err.to_string())
                .with_context("path", staging.display()),
        )
    })?;
    fs::rename(&staging, path).map_err(|err| {
        AbcError::Persistence(
            ErrorInfo::new(format!("{what}-rename"), err.to_string())
                .with_context("path", path.display()),
        )
    })
}

impl HistoryStore for DirectoryHistory {
    fn create_run(&mut self, record: &RunRecord) -> Result<RunId, AbcError> {
        let path = self.manifest_path(&record.run_id)?;
        if path.exists() {
            let existing: RunManifest = read_json(&path, "manifest")?;
            return check_existing_run(&existing.record, record);
        }
        let manifest = RunManifest {
            record: record.clone(),
            end_time: None,
            completion_reason: None,
            populations: Vec::new(),
        };
        self.store_manifest(&record.run_id, &manifest)?;
        Ok(record.run_id.clone())
    }

    fn append_population(&mut self, run_id: &str, population: &Population) -> Result<(), AbcError> {
        let mut manifest = self.load_manifest(run_id)?;
        let latest = manifest.populations.len().checked_sub(1);
        check_next_generation(run_id, latest, population.generation())?;
        let relative = population_file(population.generation());
        write_json(
            &self.run_directory(run_id)?.join(&relative),
            population,
            "population",
        )?;
        manifest.populations.push(relative);
        self.store_manifest(run_id, &manifest)
    }

    fn load_population(&self, run_id: &str, generation: usize) -> Result<Population, AbcError> {
        let manifest = self.load_manifest(run_id)?;
        let relative = manifest
            .populations
            .get(generation)
            .ok_or_else(|| missing_generation(run_id, generation))?;
        read_json(&self.run_directory(run_id)?.join(relative), "population")
    }

    fn latest_generation(&self, run_id: &str) -> Result<Option<usize>, AbcError> {
        Ok(self.load_manifest(run_id)?.populations.len().checked_sub(1))
    }

    fn mark_done(
        &mut self,
        run_id: &str,
        end_time: &str,
        reason: CompletionReason,
    ) -> Result<(), AbcError> {
        let mut manifest = self.load_manifest(run_id)?;
        manifest.end_time = Some(end_time.to_string());
        manifest.completion_reason = Some(reason);
        self.store_manifest(run_id, &manifest)
    }

    fn run_metadata(&self, run_id: &str) -> Result<RunMetadata, AbcError> {
        let manifest = self.load_manifest(run_id)?;
        Ok(RunMetadata {
            generations: manifest.populations.len(),
            record: manifest.record,
            end_time: manifest.end_time,
            completion_reason: manifest.completion_reason,
        })
    }
}
