use std::collections::BTreeMap;

use abc_core::AbcError;
use abc_smc::CompletionReason;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::schema::db_error;

pub fn total_proposals(conn: &Connection, run_id: &str) -> Result<u64, AbcError> {
    let total: Option<i64> = conn
        .query_row(
            "SELECT SUM(proposal_count) FROM populations WHERE run_id = ?",
            [run_id],
            |row| row.get(0),
        )
        .map_err(db_error("abc_history.query"))?;
    Ok(total.unwrap_or(0) as u64)
}

pub fn model_probability_table(
    conn: &Connection,
    run_id: &str,
) -> Result<Vec<BTreeMap<usize, f64>>, AbcError> {
    let mut stmt = conn
        .prepare(
            "SELECT generation, model, probability FROM model_probabilities
             WHERE run_id = ? ORDER BY generation, model",
        )
        .map_err(db_error("abc_history.query"))?;
    let rows = stmt
        .query_map([run_id], |row| {
            let generation: i64 = row.get(0)?;
            let model: i64 = row.get(1)?;
            Ok((generation as usize, model as usize, row.get::<_, f64>(2)?))
        })
        .map_err(db_error("abc_history.query"))?;
    let mut table: Vec<BTreeMap<usize, f64>> = Vec::new();
    for row in rows {
        let (generation, model, probability) = row.map_err(db_error("abc_history.query"))?;
        if table.len() <= generation {
            table.resize_with(generation + 1, BTreeMap::new);
        }
        table[generation].insert(model, probability);
    }
    Ok(table)
}

pub fn epsilon_trajectory(conn: &Connection, run_id: &str) -> Result<Vec<Option<f64>>, AbcError> {
    let mut stmt = conn
        .prepare("SELECT epsilon FROM populations WHERE run_id = ? ORDER BY generation")
        .map_err(db_error("abc_history.query"))?;
    let rows = stmt
        .query_map([run_id], |row| row.get::<_, Option<f64>>(0))
        .map_err(db_error("abc_history.query"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(db_error("abc_history.query"))
}

/// Filters for [`RunListing::execute`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default)]
    pub distance_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub run_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub completion_reason: Option<CompletionReason>,
    pub distance_name: String,
    pub generations: usize,
    pub total_proposals: u64,
}

/// Overview of the runs stored in a database, ordered by start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunListing {
    pub runs: Vec<RunEntry>,
}

impl RunListing {
    pub fn load(conn: &Connection) -> Result<Self, AbcError> {
        Self::execute(conn, &RunFilter::default())
    }

    pub fn execute(conn: &Connection, filter: &RunFilter) -> Result<Self, AbcError> {
        let mut stmt = conn
            .prepare(
                "SELECT r.run_id, r.start_time, r.end_time, r.completion_reason, r.distance_name,
                        COUNT(p.generation), COALESCE(SUM(p.proposal_count), 0)
                 FROM runs r LEFT JOIN populations p ON p.run_id = r.run_id
                 GROUP BY r.run_id
                 ORDER BY r.start_time, r.run_id",
            )
            .map_err(db_error("abc_history.query"))?;
        let rows = stmt
            .query_map(params![], |row| {
                let generations: i64 = row.get(5)?;
                let total: i64 = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    generations as usize,
                    total as u64,
                ))
            })
            .map_err(db_error("abc_history.query"))?;
        let mut runs = Vec::new();
        for row in rows {
            let (run_id, start_time, end_time, reason, distance_name, generations, proposals) =
                row.map_err(db_error("abc_history.query"))?;
            let completion_reason = reason.as_deref().map(CompletionReason::parse).transpose()?;
            if let Some(completed) = filter.completed {
                if completion_reason.is_some() != completed {
                    continue;
                }
            }
            if let Some(name) = &filter.distance_name {
                if &distance_name != name {
                    continue;
                }
            }
            runs.push(RunEntry {
                run_id,
                start_time,
                end_time,
                completion_reason,
                distance_name,
                generations,
                total_proposals: proposals,
            });
        }
        Ok(Self { runs })
    }
}
