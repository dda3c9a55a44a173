use std::collections::BTreeMap;

use abc_core::{AbcError, ErrorInfo, Parameter, SumStats};
use abc_smc::{CompletionReason, Particle, Population, RunMetadata, RunRecord};
use rusqlite::{params, Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 1;

pub(crate) fn db_error(code: &'static str) -> impl Fn(rusqlite::Error) -> AbcError {
    move |err| AbcError::Persistence(ErrorInfo::new(code, err.to_string()))
}

fn json_error(code: &'static str) -> impl Fn(serde_json::Error) -> AbcError {
    move |err| AbcError::Serde(ErrorInfo::new(code, err.to_string()))
}

pub fn init_schema(conn: &Connection) -> Result<(), AbcError> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS meta(version INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS runs(
            run_id TEXT PRIMARY KEY,
            start_time TEXT NOT NULL,
            end_time TEXT,
            completion_reason TEXT,
            observed TEXT NOT NULL,
            model_names TEXT NOT NULL,
            distance_name TEXT NOT NULL,
            population_size INTEGER NOT NULL,
            master_seed INTEGER NOT NULL,
            seed_label TEXT,
            config_hash TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS populations(
            run_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            epsilon REAL,
            acceptance_count INTEGER NOT NULL,
            proposal_count INTEGER NOT NULL,
            PRIMARY KEY(run_id, generation),
            FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );
        CREATE TABLE IF NOT EXISTS model_probabilities(
            run_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            model INTEGER NOT NULL,
            probability REAL NOT NULL,
            PRIMARY KEY(run_id, generation, model),
            FOREIGN KEY(run_id, generation) REFERENCES populations(run_id, generation)
        );
        CREATE TABLE IF NOT EXISTS particles(
            run_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            position INTEGER NOT NULL,
            model INTEGER NOT NULL,
            distance REAL NOT NULL,
            weight REAL NOT NULL,
            parameter TEXT NOT NULL,
            sum_stats TEXT NOT NULL,
            PRIMARY KEY(run_id, generation, position),
            FOREIGN KEY(run_id, generation) REFERENCES populations(run_id, generation)
        );
        COMMIT;",
    )
    .map_err(db_error("abc_history.schema"))?;
    set_version(conn, SCHEMA_VERSION)
}

fn set_version(conn: &Connection, version: i64) -> Result<(), AbcError> {
    let existing: Option<i64> = conn
        .query_row("SELECT version FROM meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(db_error("abc_history.schema"))?;
    match existing {
        Some(current) if current == version => Ok(()),
        Some(current) => Err(AbcError::Persistence(
            ErrorInfo::new(
                "abc_history.schema_version",
                format!("history schema {current} incompatible with expected {version}"),
            )
            .with_hint("open the database with a matching abc-history release"),
        )),
        None => {
            conn.execute("INSERT INTO meta(version) VALUES (?)", params![version])
                .map_err(db_error("abc_history.schema"))?;
            Ok(())
        }
    }
}

pub fn schema_version(conn: &Connection) -> Result<Option<i64>, AbcError> {
    conn.query_row("SELECT version FROM meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(db_error("abc_history.schema"))
}

pub fn insert_run(conn: &Connection, record: &RunRecord) -> Result<(), AbcError> {
    let observed =
        serde_json::to_string(&record.observed).map_err(json_error("abc_history.encode"))?;
    let model_names =
        serde_json::to_string(&record.model_names).map_err(json_error("abc_history.encode"))?;
    conn.execute(
        "INSERT INTO runs(run_id, start_time, observed, model_names, distance_name,
                          population_size, master_seed, seed_label, config_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.run_id,
            record.start_time,
            observed,
            model_names,
            record.distance_name,
            record.population_size as i64,
            record.master_seed as i64,
            record.seed_label,
            record.config_hash
        ],
    )
    .map_err(db_error("abc_history.insert_run"))?;
    Ok(())
}

struct RunRow {
    record: RunRecord,
    end_time: Option<String>,
    completion_reason: Option<String>,
}

pub fn load_run(conn: &Connection, run_id: &str) -> Result<Option<RunMetadata>, AbcError> {
    let row = conn
        .query_row(
            "SELECT run_id, start_time, end_time, completion_reason, observed, model_names,
                    distance_name, population_size, master_seed, seed_label, config_hash
             FROM runs WHERE run_id = ?",
            [run_id],
            |row| {
                let observed: String = row.get(4)?;
                let model_names: String = row.get(5)?;
                let population_size: i64 = row.get(7)?;
                let master_seed: i64 = row.get(8)?;
                Ok((
                    RunRow {
                        record: RunRecord {
                            run_id: row.get(0)?,
                            start_time: row.get(1)?,
                            observed: SumStats::new(),
                            model_names: Vec::new(),
                            distance_name: row.get(6)?,
                            population_size: population_size as usize,
                            master_seed: master_seed as u64,
                            seed_label: row.get(9)?,
                            config_hash: row.get(10)?,
                        },
                        end_time: row.get(2)?,
                        completion_reason: row.get(3)?,
                    },
                    observed,
                    model_names,
                ))
            },
        )
        .optional()
        .map_err(db_error("abc_history.query"))?;
    let Some((mut run, observed, model_names)) = row else {
        return Ok(None);
    };
    run.record.observed =
        serde_json::from_str(&observed).map_err(json_error("abc_history.decode"))?;
    run.record.model_names =
        serde_json::from_str(&model_names).map_err(json_error("abc_history.decode"))?;
    let completion_reason = run
        .completion_reason
        .as_deref()
        .map(CompletionReason::parse)
        .transpose()?;
    let generations: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM populations WHERE run_id = ?",
            [run_id],
            |row| row.get(0),
        )
        .map_err(db_error("abc_history.query"))?;
    Ok(Some(RunMetadata {
        record: run.record,
        end_time: run.end_time,
        completion_reason,
        generations: generations as usize,
    }))
}

pub fn update_completion(
    conn: &Connection,
    run_id: &str,
    end_time: &str,
    reason: CompletionReason,
) -> Result<usize, AbcError> {
    conn.execute(
        "UPDATE runs SET end_time = ?, completion_reason = ? WHERE run_id = ?",
        params![end_time, reason.as_str(), run_id],
    )
    .map_err(db_error("abc_history.mark_done"))
}

pub fn latest_generation(conn: &Connection, run_id: &str) -> Result<Option<usize>, AbcError> {
    let latest: Option<i64> = conn
        .query_row(
            "SELECT MAX(generation) FROM populations WHERE run_id = ?",
            [run_id],
            |row| row.get(0),
        )
        .map_err(db_error("abc_history.query"))?;
    Ok(latest.map(|generation| generation as usize))
}

/// Writes one population; the caller owns the transaction.
pub fn insert_population(
    conn: &Connection,
    run_id: &str,
    population: &Population,
) -> Result<(), AbcError> {
    let generation = population.generation() as i64;
    conn.execute(
        "INSERT INTO populations(run_id, generation, epsilon, acceptance_count, proposal_count)
         VALUES (?, ?, ?, ?, ?)",
        params![
            run_id,
            generation,
            population.epsilon(),
            population.acceptance_count() as i64,
            population.proposal_count() as i64
        ],
    )
    .map_err(db_error("abc_history.insert_population"))?;
    for (model, probability) in population.model_probabilities() {
        conn.execute(
            "INSERT INTO model_probabilities(run_id, generation, model, probability)
             VALUES (?, ?, ?, ?)",
            params![run_id, generation, *model as i64, probability],
        )
        .map_err(db_error("abc_history.insert_population"))?;
    }
    let mut stmt = conn
        .prepare(
            "INSERT INTO particles(run_id, generation, position, model, distance, weight,
                                   parameter, sum_stats)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .map_err(db_error("abc_history.insert_population"))?;
    for (position, particle) in population.particles().iter().enumerate() {
        let parameter =
            serde_json::to_string(&particle.parameter).map_err(json_error("abc_history.encode"))?;
        let sum_stats =
            serde_json::to_string(&particle.sum_stats).map_err(json_error("abc_history.encode"))?;
        stmt.execute(params![
            run_id,
            generation,
            position as i64,
            particle.model as i64,
            particle.distance,
            particle.weight,
            parameter,
            sum_stats
        ])
        .map_err(db_error("abc_history.insert_population"))?;
    }
    Ok(())
}

pub fn load_population(
    conn: &Connection,
    run_id: &str,
    generation: usize,
) -> Result<Option<Population>, AbcError> {
    let header: Option<(Option<f64>, i64)> = conn
        .query_row(
            "SELECT epsilon, proposal_count FROM populations WHERE run_id = ? AND generation = ?",
            params![run_id, generation as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_error("abc_history.query"))?;
    let Some((epsilon, proposal_count)) = header else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT model, distance, weight, parameter, sum_stats FROM particles
             WHERE run_id = ? AND generation = ? ORDER BY position",
        )
        .map_err(db_error("abc_history.query"))?;
    let rows = stmt
        .query_map(params![run_id, generation as i64], |row| {
            let model: i64 = row.get(0)?;
            Ok((
                model as usize,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(db_error("abc_history.query"))?;
    let mut particles = Vec::new();
    for row in rows {
        let (model, distance, weight, parameter, sum_stats) =
            row.map_err(db_error("abc_history.query"))?;
        let parameter: Parameter =
            serde_json::from_str(&parameter).map_err(json_error("abc_history.decode"))?;
        let sum_stats: SumStats =
            serde_json::from_str(&sum_stats).map_err(json_error("abc_history.decode"))?;
        particles.push(Particle {
            model,
            parameter,
            sum_stats,
            distance,
            weight,
        });
    }

    let probabilities = load_model_probabilities(conn, run_id, generation)?;
    Population::restore(
        generation,
        epsilon,
        particles,
        proposal_count as u64,
        probabilities,
    )
    .map(Some)
}

pub fn load_model_probabilities(
    conn: &Connection,
    run_id: &str,
    generation: usize,
) -> Result<BTreeMap<usize, f64>, AbcError> {
    let mut stmt = conn
        .prepare(
            "SELECT model, probability FROM model_probabilities
             WHERE run_id = ? AND generation = ? ORDER BY model",
        )
        .map_err(db_error("abc_history.query"))?;
    let rows = stmt
        .query_map(params![run_id, generation as i64], |row| {
            let model: i64 = row.get(0)?;
            Ok((model as usize, row.get::<_, f64>(1)?))
        })
        .map_err(db_error("abc_history.query"))?;
    rows.collect::<Result<BTreeMap<_, _>, _>>()
        .map_err(db_error("abc_history.query"))
}
