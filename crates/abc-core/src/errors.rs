//! Structured error types shared across the ABC-SMC crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`AbcError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (generation, model index, counters, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the ABC-SMC engine.
///
/// The variants follow the failure families of a run: recoverable per-trial
/// simulation failures only surface here once they become fatal, everything
/// else terminates the current run and leaves the persisted history intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum AbcError {
    /// Invalid run configuration.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Simulator failures (raised by models, fatal past the consecutive-failure threshold).
    #[error("simulation error: {0}")]
    Simulation(ErrorInfo),
    /// Not enough accepted particles to form a population.
    #[error("insufficient acceptance: {0}")]
    Acceptance(ErrorInfo),
    /// Tolerance scheduler could not produce a valid threshold.
    #[error("degenerate schedule: {0}")]
    Schedule(ErrorInfo),
    /// History store reads or writes failed.
    #[error("persistence error: {0}")]
    Persistence(ErrorInfo),
    /// Prior or transition kernel misuse.
    #[error("distribution error: {0}")]
    Distribution(ErrorInfo),
    /// Distance evaluation errors.
    #[error("distance error: {0}")]
    Distance(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl AbcError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            AbcError::Config(info)
            | AbcError::Simulation(info)
            | AbcError::Acceptance(info)
            | AbcError::Schedule(info)
            | AbcError::Persistence(info)
            | AbcError::Distribution(info)
            | AbcError::Distance(info)
            | AbcError::Serde(info) => info,
        }
    }

    /// Short, stable name of the error family.
    pub fn family(&self) -> &'static str {
        match self {
            AbcError::Config(_) => "config",
            AbcError::Simulation(_) => "simulation",
            AbcError::Acceptance(_) => "acceptance",
            AbcError::Schedule(_) => "schedule",
            AbcError::Persistence(_) => "persistence",
            AbcError::Distribution(_) => "distribution",
            AbcError::Distance(_) => "distance",
            AbcError::Serde(_) => "serde",
        }
    }

    /// Convenience constructor for simulator failures raised by models.
    pub fn simulation(code: &str, message: impl Into<String>) -> Self {
        AbcError::Simulation(ErrorInfo::new(code, message))
    }
}
