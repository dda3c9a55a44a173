//! YAML run configuration with defaults and validation.

use std::fs;
use std::path::Path;

use abc_core::{AbcError, ErrorInfo};
use serde::{Deserialize, Serialize};

/// YAML-configurable parameters governing an ABC-SMC run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of accepted particles per generation.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// The run stops once the next scheduled epsilon is at or below this value.
    #[serde(default)]
    pub minimum_epsilon: f64,
    /// Maximum number of generations (populations) in the run.
    #[serde(default = "default_max_nr_populations")]
    pub max_nr_populations: usize,
    /// Per-generation cap on trials; reaching it before the population is full is fatal.
    #[serde(default)]
    pub max_total_proposals: Option<usize>,
    /// Run-wide simulation budget, checked after each generation.
    #[serde(default)]
    pub max_total_simulations: Option<u64>,
    /// Consecutive simulation failures of one model tolerated before the run aborts.
    #[serde(default)]
    pub max_consecutive_simulation_failures: Option<usize>,
    /// Optional acceptance threshold for generation 0 (unconditional acceptance otherwise).
    #[serde(default)]
    pub initial_epsilon: Option<f64>,
    /// Re-perturbation attempts while a proposal falls outside the prior support.
    #[serde(default = "default_max_perturbation_attempts")]
    pub max_perturbation_attempts: usize,
    /// Tolerance schedule policy.
    #[serde(default)]
    pub epsilon: EpsilonConfig,
    /// Default transition kernel settings.
    #[serde(default)]
    pub transition: TransitionConfig,
    /// Importance weight policy.
    #[serde(default)]
    pub weights: WeightConfig,
    /// Per-generation population size derived from the kernels' density
    /// variation; a fixed `population_size` is used when absent.
    #[serde(default)]
    pub adaptive_population: Option<AdaptivePopulationConfig>,
    /// Parallel trial execution settings.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Master seed and substream policy.
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    /// Explicit run identifier; derived from the run identity when absent.
    #[serde(default)]
    pub run_id: Option<String>,
}

fn default_population_size() -> usize {
    100
}

fn default_max_nr_populations() -> usize {
    10
}

fn default_max_perturbation_attempts() -> usize {
    1000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            minimum_epsilon: 0.0,
            max_nr_populations: default_max_nr_populations(),
            max_total_proposals: None,
            max_total_simulations: None,
            max_consecutive_simulation_failures: None,
            initial_epsilon: None,
            max_perturbation_attempts: default_max_perturbation_attempts(),
            epsilon: EpsilonConfig::default(),
            transition: TransitionConfig::default(),
            weights: WeightConfig::default(),
            adaptive_population: None,
            concurrency: ConcurrencyConfig::default(),
            seed_policy: SeedPolicy::default(),
            run_id: None,
        }
    }
}

fn config_error(code: &str, message: impl Into<String>) -> AbcError {
    AbcError::Config(ErrorInfo::new(code, message))
}

impl RunConfig {
    /// Parses a configuration from YAML and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AbcError> {
        let config: RunConfig = serde_yaml::from_str(yaml)
            .map_err(|err| AbcError::Serde(ErrorInfo::new("config-parse", err.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, AbcError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AbcError::Serde(
                ErrorInfo::new("config-read", err.to_string())
                    .with_context("path", path.display()),
            )
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Checks the documented value ranges.
    pub fn validate(&self) -> Result<(), AbcError> {
        if self.population_size == 0 {
            return Err(config_error("population_size", "population_size must be > 0"));
        }
        if self.max_nr_populations == 0 {
            return Err(config_error(
                "max_nr_populations",
                "max_nr_populations must be > 0",
            ));
        }
        if !(self.minimum_epsilon >= 0.0) {
            return Err(AbcError::Config(
                ErrorInfo::new("minimum_epsilon", "minimum_epsilon must be >= 0")
                    .with_context("value", self.minimum_epsilon),
            ));
        }
        if self.max_total_proposals == Some(0) {
            return Err(config_error(
                "max_total_proposals",
                "max_total_proposals must be > 0 when set",
            ));
        }
        if self.max_total_simulations == Some(0) {
            return Err(config_error(
                "max_total_simulations",
                "max_total_simulations must be > 0 when set",
            ));
        }
        if let Some(epsilon) = self.initial_epsilon {
            if !(epsilon >= 0.0) {
                return Err(AbcError::Config(
                    ErrorInfo::new("initial_epsilon", "initial_epsilon must be >= 0")
                        .with_context("value", epsilon),
                ));
            }
        }
        if !(self.transition.scaling > 0.0) || !self.transition.scaling.is_finite() {
            return Err(config_error(
                "transition.scaling",
                "transition scaling must be positive and finite",
            ));
        }
        if !(self.transition.k_fraction > 0.0 && self.transition.k_fraction <= 1.0) {
            return Err(AbcError::Config(
                ErrorInfo::new("transition.k_fraction", "k_fraction must lie in (0, 1]")
                    .with_context("value", self.transition.k_fraction),
            ));
        }
        if let Some(adaptive) = &self.adaptive_population {
            adaptive.validate()?;
        }
        if self.concurrency.max_batch_size == 0 {
            return Err(config_error(
                "concurrency.max_batch_size",
                "max_batch_size must be > 0",
            ));
        }
        self.epsilon.validate()
    }
}

/// Supported tolerance schedule policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EpsilonConfig {
    /// Weighted median of the previous population's distances.
    Median,
    /// Weighted α-quantile times a multiplier.
    Quantile {
        /// Quantile level in `[0, 1]`.
        alpha: f64,
        /// Factor applied to the quantile.
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
    /// Fixed schedule; entry `t` is the threshold of generation `t`, the last entry repeats.
    List {
        /// Thresholds indexed by generation.
        values: Vec<f64>,
    },
    /// The same threshold for every generation after the first.
    Constant {
        /// Threshold value.
        value: f64,
    },
    /// Quantile level chosen from the previous generation's acceptance rate.
    AcceptanceRate {
        /// Acceptance rate separating the two quantile levels.
        target_rate: f64,
        /// Quantile used when the last acceptance rate exceeded the target.
        #[serde(default = "default_alpha_low")]
        alpha_low: f64,
        /// Quantile used otherwise.
        #[serde(default = "default_alpha_high")]
        alpha_high: f64,
    },
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_alpha_low() -> f64 {
    0.3
}

fn default_alpha_high() -> f64 {
    0.7
}

impl Default for EpsilonConfig {
    fn default() -> Self {
        EpsilonConfig::Median
    }
}

impl EpsilonConfig {
    fn validate(&self) -> Result<(), AbcError> {
        let in_unit = |value: f64| (0.0..=1.0).contains(&value);
        match self {
            EpsilonConfig::Median => Ok(()),
            EpsilonConfig::Quantile { alpha, multiplier } => {
                if !in_unit(*alpha) || !(*multiplier > 0.0) {
                    return Err(config_error(
                        "epsilon.quantile",
                        "quantile alpha must lie in [0, 1] and multiplier be positive",
                    ));
                }
                Ok(())
            }
            EpsilonConfig::List { values } => {
                if values.is_empty() || values.iter().any(|value| !(*value >= 0.0)) {
                    return Err(config_error(
                        "epsilon.list",
                        "scheduled epsilons must be a non-empty list of non-negative numbers",
                    ));
                }
                Ok(())
            }
            EpsilonConfig::Constant { value } => {
                if !(*value >= 0.0) {
                    return Err(config_error(
                        "epsilon.constant",
                        "constant epsilon must be non-negative",
                    ));
                }
                Ok(())
            }
            EpsilonConfig::AcceptanceRate {
                target_rate,
                alpha_low,
                alpha_high,
            } => {
                if !in_unit(*target_rate) || !in_unit(*alpha_low) || !in_unit(*alpha_high) {
                    return Err(config_error(
                        "epsilon.acceptance-rate",
                        "target rate and quantile levels must lie in [0, 1]",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Kernel fitted for models that keep the default transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    /// Gaussian KDE with a diagonal Silverman bandwidth.
    #[default]
    MultivariateNormal,
    /// Per-particle Gaussians shaped by nearest-neighbour covariances.
    Local,
}

/// Settings of the default transition kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Kernel family.
    #[serde(default)]
    pub kind: TransitionKind,
    /// Multiplier applied to the kernel covariance.
    #[serde(default = "default_scaling")]
    pub scaling: f64,
    /// Share of the particles forming each local neighbourhood (local kernel only).
    #[serde(default = "default_k_fraction")]
    pub k_fraction: f64,
}

fn default_scaling() -> f64 {
    1.0
}

fn default_k_fraction() -> f64 {
    0.25
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            kind: TransitionKind::default(),
            scaling: default_scaling(),
            k_fraction: default_k_fraction(),
        }
    }
}

/// Population size chosen per generation so that the fitted kernels reach a
/// target coefficient of variation of their density estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptivePopulationConfig {
    /// Target mean coefficient of variation.
    #[serde(default = "default_mean_cv")]
    pub mean_cv: f64,
    /// Lower bound on the chosen population size.
    #[serde(default = "default_min_population_size")]
    pub min_population_size: usize,
    /// Upper bound on the chosen population size.
    #[serde(default = "default_max_population_size")]
    pub max_population_size: usize,
}

fn default_mean_cv() -> f64 {
    0.05
}

fn default_min_population_size() -> usize {
    10
}

fn default_max_population_size() -> usize {
    usize::MAX
}

impl Default for AdaptivePopulationConfig {
    fn default() -> Self {
        Self {
            mean_cv: default_mean_cv(),
            min_population_size: default_min_population_size(),
            max_population_size: default_max_population_size(),
        }
    }
}

impl AdaptivePopulationConfig {
    /// Clamps a requested size into the configured bounds.
    pub fn clamp(&self, requested: usize) -> usize {
        requested.clamp(self.min_population_size, self.max_population_size)
    }

    fn validate(&self) -> Result<(), AbcError> {
        if !(self.mean_cv > 0.0) || !self.mean_cv.is_finite() {
            return Err(config_error(
                "adaptive_population.mean_cv",
                "mean_cv must be positive and finite",
            ));
        }
        if self.min_population_size == 0 || self.min_population_size > self.max_population_size {
            return Err(AbcError::Config(
                ErrorInfo::new(
                    "adaptive_population.bounds",
                    "population bounds must satisfy 0 < min <= max",
                )
                .with_context("min", self.min_population_size)
                .with_context("max", self.max_population_size),
            ));
        }
        Ok(())
    }
}

/// Importance weight policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WeightConfig {
    /// Joint model/parameter importance ratio.
    #[default]
    Importance,
    /// Per-model importance ratio rescaled to each model's accepted share.
    AcceptanceShare,
    /// Per-model importance ratio rescaled to the model prior times the
    /// model's marginal acceptance rate.
    MarginalAcceptance,
}

/// Parallel execution of sampling trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Worker threads evaluating trials (1 runs trials on a single thread).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on trials evaluated per batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_workers() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    4096
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// Deterministic seeding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPolicy {
    /// Master seed used for the run.
    #[serde(default = "default_master_seed")]
    pub master_seed: u64,
    /// Optional label recorded with the run metadata.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_master_seed() -> u64 {
    0xABC5_3C00_5EED_0001_u64
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            master_seed: default_master_seed(),
            label: None,
        }
    }
}
