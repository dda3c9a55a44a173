use std::collections::BTreeMap;
use std::path::Path;

use abc_core::{AbcError, ErrorInfo};
use abc_smc::history::{
    check_existing_run, check_next_generation, missing_generation, unknown_run,
};
use abc_smc::{CompletionReason, HistoryStore, Population, RunId, RunMetadata, RunRecord};
use rusqlite::Connection;
use tracing::debug;

use crate::query;
use crate::schema::{self, db_error};

/// [`HistoryStore`] backed by a SQLite database.
///
/// Each population is written inside one transaction, so a crash leaves either
/// the whole generation or none of it.
#[derive(Debug)]
pub struct SqliteHistory {
    conn: Connection,
}

impl SqliteHistory {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, AbcError> {
        let conn = Connection::open(path).map_err(|err| {
            AbcError::Persistence(
                ErrorInfo::new("abc_history.open", err.to_string())
                    .with_context("path", path.display()),
            )
        })?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, AbcError> {
        let conn = Connection::open_in_memory().map_err(db_error("abc_history.open"))?;
        Self::from_connection(conn)
    }

    /// Wraps an existing connection, creating the schema if necessary.
    pub fn from_connection(conn: Connection) -> Result<Self, AbcError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_error("abc_history.open"))?;
        schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Underlying connection, for ad-hoc queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn require_run(&self, run_id: &str) -> Result<RunMetadata, AbcError> {
        schema::load_run(&self.conn, run_id)?.ok_or_else(|| unknown_run(run_id))
    }
}

impl HistoryStore for SqliteHistory {
    fn create_run(&mut self, record: &RunRecord) -> Result<RunId, AbcError> {
        if let Some(existing) = schema::load_run(&self.conn, &record.run_id)? {
            return check_existing_run(&existing.record, record);
        }
        schema::insert_run(&self.conn, record)?;
        debug!(run_id = %record.run_id, "run registered");
        Ok(record.run_id.clone())
    }

    fn append_population(&mut self, run_id: &str, population: &Population) -> Result<(), AbcError> {
        let tx = self
            .conn
            .transaction()
            .map_err(db_error("abc_history.transaction"))?;
        if schema::load_run(&tx, run_id)?.is_none() {
            return Err(unknown_run(run_id));
        }
        let latest = schema::latest_generation(&tx, run_id)?;
        check_next_generation(run_id, latest, population.generation())?;
        schema::insert_population(&tx, run_id, population)?;
        tx.commit().map_err(db_error("abc_history.transaction"))?;
        debug!(
            run_id,
            generation = population.generation(),
            particles = population.acceptance_count(),
            "population committed"
        );
        Ok(())
    }

    fn load_population(&self, run_id: &str, generation: usize) -> Result<Population, AbcError> {
        self.require_run(run_id)?;
        schema::load_population(&self.conn, run_id, generation)?
            .ok_or_else(|| missing_generation(run_id, generation))
    }

    fn latest_generation(&self, run_id: &str) -> Result<Option<usize>, AbcError> {
        self.require_run(run_id)?;
        schema::latest_generation(&self.conn, run_id)
    }

    fn mark_done(
        &mut self,
        run_id: &str,
        end_time: &str,
        reason: CompletionReason,
    ) -> Result<(), AbcError> {
        match schema::update_completion(&self.conn, run_id, end_time, reason)? {
            0 => Err(unknown_run(run_id)),
            _ => Ok(()),
        }
    }

    fn run_metadata(&self, run_id: &str) -> Result<RunMetadata, AbcError> {
        self.require_run(run_id)
    }

    fn total_proposals(&self, run_id: &str) -> Result<u64, AbcError> {
        self.require_run(run_id)?;
        query::total_proposals(&self.conn, run_id)
    }

    fn model_probability_table(
        &self,
        run_id: &str,
    ) -> Result<Vec<BTreeMap<usize, f64>>, AbcError> {
        self.require_run(run_id)?;
        query::model_probability_table(&self.conn, run_id)
    }

    fn epsilon_trajectory(&self, run_id: &str) -> Result<Vec<Option<f64>>, AbcError> {
        self.require_run(run_id)?;
        query::epsilon_trajectory(&self.conn, run_id)
    }
}
