use std::fs;
use std::path::Path;

use abc_core::{AbcError, ErrorInfo};
use abc_smc::HistoryStore;
use rusqlite::Connection;

use crate::query::RunListing;

fn export_error(path: &Path) -> impl Fn(String) -> AbcError + '_ {
    move |message| {
        AbcError::Persistence(
            ErrorInfo::new("abc_history.export", message).with_context("path", path.display()),
        )
    }
}

/// Writes the run listing of a database as pretty JSON.
pub fn export_json(conn: &Connection, out_path: &Path) -> Result<(), AbcError> {
    let listing = RunListing::load(conn)?;
    let bytes = serde_json::to_vec_pretty(&listing)
        .map_err(|err| AbcError::Serde(ErrorInfo::new("abc_history.export", err.to_string())))?;
    fs::write(out_path, bytes).map_err(|err| export_error(out_path)(err.to_string()))
}

/// Writes one row per generation of a run: threshold, counts and the
/// probability of every model.
pub fn export_csv(
    store: &dyn HistoryStore,
    run_id: &str,
    out_path: &Path,
) -> Result<(), AbcError> {
    let fail = export_error(out_path);
    let summaries = store.population_summaries(run_id)?;
    let nr_models = store.run_metadata(run_id)?.record.model_names.len();
    let mut wtr = csv::Writer::from_path(out_path).map_err(|err| fail(err.to_string()))?;

    let mut header = vec![
        "generation".to_string(),
        "epsilon".to_string(),
        "acceptance_count".to_string(),
        "proposal_count".to_string(),
        "ess".to_string(),
    ];
    header.extend((0..nr_models).map(|model| format!("p_model_{model}")));
    wtr.write_record(&header).map_err(|err| fail(err.to_string()))?;

    for summary in summaries {
        let mut record = vec![
            summary.generation.to_string(),
            summary.epsilon.map(|e| e.to_string()).unwrap_or_default(),
            summary.acceptance_count.to_string(),
            summary.proposal_count.to_string(),
            format!("{:.3}", summary.effective_sample_size),
        ];
        record.extend((0..nr_models).map(|model| {
            summary
                .model_probabilities
                .get(&model)
                .copied()
                .unwrap_or(0.0)
                .to_string()
        }));
        wtr.write_record(&record).map_err(|err| fail(err.to_string()))?;
    }
    wtr.flush().map_err(|err| fail(err.to_string()))
}
