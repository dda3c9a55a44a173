//! SQLite run history for the ABC-SMC engine.

pub mod export;
pub mod query;
pub mod schema;
pub mod store;

pub use export::{export_csv, export_json};
pub use query::{RunEntry, RunFilter, RunListing};
pub use schema::{init_schema, schema_version, SCHEMA_VERSION};
pub use store::SqliteHistory;
