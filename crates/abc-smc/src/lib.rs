#![deny(missing_docs)]

//! Sequential Monte Carlo ABC with model selection and a resumable run history.
//!
//! [`Abc`] drives generations of particles through ever tighter tolerances:
//! each generation is sampled by the [`sampler`], weighted by a
//! [`WeightPolicy`], handed to a [`ToleranceScheduler`] for the next threshold
//! and appended to a [`HistoryStore`] before the next one starts.

pub mod config;
pub mod determinism;
pub mod distance;
pub mod distributions;
pub mod epsilon;
pub mod history;
pub mod metrics;
pub mod model;
pub mod population;
pub mod sampler;
pub mod selection;
pub mod smc;
pub mod transition;
pub mod weights;

pub use config::{
    AdaptivePopulationConfig, ConcurrencyConfig, EpsilonConfig, RunConfig, SeedPolicy,
    TransitionConfig, TransitionKind, WeightConfig,
};
pub use distance::{FnDistance, PNormDistance};
pub use distributions::{IndependentPrior, ModelPrior, RvSpec, RV};
pub use epsilon::ToleranceScheduler;
pub use history::{
    CompletionReason, DirectoryHistory, HistoryStore, MemoryHistory, PopulationSummary, RunId,
    RunMetadata, RunRecord,
};
pub use metrics::{GenerationReport, MetricsRecorder};
pub use model::{FnModel, ModelSpec};
pub use population::{Particle, Population};
pub use smc::{Abc, CancellationToken, Completion, Phase, RunState, RunSummary, Session};
pub use transition::{LocalTransition, MultivariateNormalTransition};
pub use weights::WeightPolicy;

pub use abc_core::{
    AbcError, Distance, Distribution, ErrorInfo, Model, Parameter, RngHandle, SumStats, Transition,
};
