//! Model adapters and the per-model specification.

use abc_core::{AbcError, Distribution, Model, Parameter, RngHandle, SumStats, Transition};

use crate::config::{TransitionConfig, TransitionKind};
use crate::transition::{LocalTransition, MultivariateNormalTransition};

/// Adapts a closure into a [`Model`].
pub struct FnModel<F> {
    name: String,
    simulator: F,
}

impl<F> FnModel<F>
where
    F: Fn(&Parameter, &mut RngHandle) -> Result<SumStats, AbcError> + Send + Sync,
{
    /// Wraps `simulator` under `name`.
    pub fn new(name: impl Into<String>, simulator: F) -> Self {
        Self {
            name: name.into(),
            simulator,
        }
    }
}

impl<F> Model for FnModel<F>
where
    F: Fn(&Parameter, &mut RngHandle) -> Result<SumStats, AbcError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn simulate(&self, parameter: &Parameter, rng: &mut RngHandle) -> Result<SumStats, AbcError> {
        (self.simulator)(parameter, rng)
    }
}

/// A candidate model together with its parameter prior and perturbation kernel.
pub struct ModelSpec {
    pub(crate) model: Box<dyn Model>,
    pub(crate) prior: Box<dyn Distribution>,
    pub(crate) transition: Box<dyn Transition>,
    default_transition: bool,
}

impl ModelSpec {
    /// Pairs a model with its prior, using the default kernel.
    pub fn new(model: impl Model + 'static, prior: impl Distribution + 'static) -> Self {
        Self {
            model: Box::new(model),
            prior: Box::new(prior),
            transition: Box::new(MultivariateNormalTransition::default()),
            default_transition: true,
        }
    }

    /// Replaces the perturbation kernel.
    pub fn with_transition(mut self, transition: impl Transition + 'static) -> Self {
        self.transition = Box::new(transition);
        self.default_transition = false;
        self
    }

    /// Installs the configured kernel unless a custom one was set.
    pub(crate) fn configure_default_transition(&mut self, config: &TransitionConfig) {
        if !self.default_transition {
            return;
        }
        self.transition = match config.kind {
            TransitionKind::MultivariateNormal => {
                Box::new(MultivariateNormalTransition::new(config.scaling))
            }
            TransitionKind::Local => {
                Box::new(LocalTransition::new(config.scaling, config.k_fraction))
            }
        };
    }

    /// Name of the wrapped model.
    pub fn name(&self) -> &str {
        self.model.name()
    }

    /// Prior over the model's parameters.
    pub fn prior(&self) -> &dyn Distribution {
        self.prior.as_ref()
    }

    /// Current perturbation kernel.
    pub fn transition(&self) -> &dyn Transition {
        self.transition.as_ref()
    }
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("name", &self.model.name())
            .finish_non_exhaustive()
    }
}
