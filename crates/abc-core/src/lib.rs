#![deny(missing_docs)]
//! Core traits and data types for the ABC-SMC engine: the capability
//! interfaces of models, priors, transition kernels and distances, plus the
//! shared error, RNG and weighted-statistics helpers.

pub mod errors;
pub mod rng;
mod values;
pub mod weighted;

pub use errors::{AbcError, ErrorInfo};
pub use rng::{derive_substream_seed, label_key, RngHandle};
pub use values::{Parameter, SumStats};

/// Stochastic simulator mapping parameters to summary statistics.
///
/// Any error returned from [`Model::simulate`] is treated by the sampler as a
/// failed trial, not as a fatal condition.
pub trait Model: Send + Sync {
    /// Stable human readable name, captured in the run metadata.
    fn name(&self) -> &str;

    /// Simulates the model for `parameter`, drawing randomness from `rng` only.
    fn simulate(&self, parameter: &Parameter, rng: &mut RngHandle) -> Result<SumStats, AbcError>;
}

/// Probability distribution over a model's parameter space.
pub trait Distribution: Send + Sync {
    /// Draws a parameter.
    fn sample(&self, rng: &mut RngHandle) -> Parameter;

    /// Density (or mass) of `parameter`, never negative.
    fn pdf(&self, parameter: &Parameter) -> f64;
}

/// Perturbation kernel fitted on the weighted particles of one model.
pub trait Transition: Send + Sync {
    /// Fits the kernel to the previous generation's particles of a model.
    ///
    /// `weights` need not be normalised.
    fn fit(&mut self, particles: &[Parameter], weights: &[f64]) -> Result<(), AbcError>;

    /// Perturbs a parent particle.
    fn perturb(&self, parent: &Parameter, rng: &mut RngHandle) -> Parameter;

    /// Importance density of `parameter` under the fitted mixture.
    fn pdf(&self, parameter: &Parameter) -> f64;

    /// Mean coefficient of variation of the fitted density under bootstrap
    /// resampling of the fitted particles.
    fn mean_coefficient_of_variation(&self, rng: &mut RngHandle) -> Result<f64, AbcError> {
        let _ = rng;
        Err(AbcError::Distribution(ErrorInfo::new(
            "kernel-variation",
            "kernel does not estimate its own variation",
        )))
    }

    /// Particles needed for the density estimate to reach
    /// `coefficient_of_variation`.
    fn required_nr_samples(
        &self,
        coefficient_of_variation: f64,
        rng: &mut RngHandle,
    ) -> Result<usize, AbcError> {
        let _ = (coefficient_of_variation, rng);
        Err(AbcError::Distribution(ErrorInfo::new(
            "kernel-variation",
            "kernel does not estimate its own variation",
        )))
    }
}

/// Distance between simulated and observed summary statistics.
pub trait Distance: Send + Sync {
    /// Stable name, captured in the run metadata.
    fn name(&self) -> &str;

    /// Non-negative distance; must be defined for every reachable statistic.
    fn distance(&self, simulated: &SumStats, observed: &SumStats) -> Result<f64, AbcError>;
}
