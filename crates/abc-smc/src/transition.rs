//! Perturbation kernels: a global Gaussian KDE with diagonal bandwidth and a
//! local kernel whose covariance follows each particle's nearest neighbours.
//!
//! Dimensions whose fitted values are all identical (a constant prior
//! component, or a collapsed posterior) are held fixed: perturbation leaves
//! them untouched and the density is a point mass on them.

use abc_core::weighted::{effective_sample_size, normalize, weighted_variance};
use abc_core::{AbcError, ErrorInfo, Parameter, RngHandle, Transition};
use rand_distr::{Distribution as _, StandardNormal};

use crate::distributions::normal_pdf;

/// Floor applied to kernel standard deviations of nearly collapsed dimensions.
const MIN_STD: f64 = 1e-8;

/// Bootstrap replicates behind the coefficient-of-variation estimate.
const BOOTSTRAP_REPLICATES: usize = 10;

/// Regularisation attempts before a local covariance is rejected.
const MAX_JITTER_ATTEMPTS: usize = 12;

fn not_enough_particles(message: &str) -> AbcError {
    AbcError::Distribution(ErrorInfo::new("not-enough-particles", message))
}

fn kernel_fit_error(message: &str) -> AbcError {
    AbcError::Distribution(ErrorInfo::new("kernel-fit", message))
}

/// Weighted particles of one model as dense rows in parameter-name order.
#[derive(Debug, Clone)]
struct FittedParticles {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
    weights: Vec<f64>,
    fixed: Vec<bool>,
}

impl FittedParticles {
    fn new(particles: &[Parameter], weights: &[f64]) -> Result<Self, AbcError> {
        if particles.is_empty() {
            return Err(not_enough_particles("cannot fit a kernel on zero particles"));
        }
        if particles.len() != weights.len() {
            return Err(AbcError::Distribution(
                ErrorInfo::new("kernel-fit", "particle and weight counts differ")
                    .with_context("particles", particles.len())
                    .with_context("weights", weights.len()),
            ));
        }
        let weights = normalize(weights)
            .ok_or_else(|| not_enough_particles("fitted particles carry no weight"))?;
        let names: Vec<String> = particles[0].keys().map(str::to_string).collect();
        let mut rows = Vec::with_capacity(particles.len());
        for particle in particles {
            let row: Option<Vec<f64>> = if particle.len() == names.len() {
                names.iter().map(|name| particle.get(name)).collect()
            } else {
                None
            };
            let row = row.ok_or_else(|| {
                kernel_fit_error("particles of one model must share parameter names")
            })?;
            if row.iter().any(|value| !value.is_finite()) {
                return Err(kernel_fit_error("particle values must be finite"));
            }
            rows.push(row);
        }
        let fixed = (0..names.len())
            .map(|dim| rows.iter().all(|row| row[dim] == rows[0][dim]))
            .collect();
        Ok(Self {
            names,
            rows,
            weights,
            fixed,
        })
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn free_dims(&self) -> Vec<usize> {
        (0..self.names.len()).filter(|dim| !self.fixed[*dim]).collect()
    }

    fn coordinates(&self, parameter: &Parameter) -> Option<Vec<f64>> {
        if parameter.len() != self.names.len() {
            return None;
        }
        self.names.iter().map(|name| parameter.get(name)).collect()
    }

    /// Whether `x` carries the exact value of every fixed dimension.
    fn matches_fixed(&self, x: &[f64]) -> bool {
        self.fixed
            .iter()
            .zip(x)
            .zip(&self.rows[0])
            .all(|((fixed, value), held)| !fixed || value == held)
    }

    fn parameter(&self, row: &[f64]) -> Parameter {
        self.names.iter().cloned().zip(row.iter().copied()).collect()
    }

    fn column(&self, dim: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[dim]).collect()
    }

    /// Density of a parameterless particle set: a point mass on the empty parameter.
    fn parameterless_pdf(parameter: &Parameter) -> f64 {
        if parameter.is_empty() {
            1.0
        } else {
            0.0
        }
    }
}

/// Bootstrap estimate of the weighted mean coefficient of variation of a
/// kernel's density at its own fitted points.
fn bootstrap_variation<T>(
    kernel: &T,
    fitted: Option<&FittedParticles>,
    rng: &mut RngHandle,
) -> Result<f64, AbcError>
where
    T: Transition + Clone,
{
    let fitted = fitted.ok_or_else(|| not_enough_particles("kernel is not fitted"))?;
    if fitted.names.is_empty() {
        return Err(not_enough_particles("particles have no parameters"));
    }
    let points: Vec<Parameter> = fitted.rows.iter().map(|row| fitted.parameter(row)).collect();
    let cumulative: Vec<f64> = fitted
        .weights
        .iter()
        .scan(0.0, |total, weight| {
            *total += weight;
            Some(*total)
        })
        .collect();
    let n = fitted.len();
    let equal = vec![1.0; n];
    let mut densities = vec![Vec::with_capacity(BOOTSTRAP_REPLICATES); n];
    for _ in 0..BOOTSTRAP_REPLICATES {
        let resampled: Vec<Parameter> = (0..n)
            .map(|_| points[rng.categorical(&cumulative).unwrap_or(0)].clone())
            .collect();
        let mut replicate = kernel.clone();
        replicate.fit(&resampled, &equal)?;
        for (slot, point) in densities.iter_mut().zip(&points) {
            slot.push(replicate.pdf(point));
        }
    }

    let replicates = BOOTSTRAP_REPLICATES as f64;
    let mut total = 0.0;
    let mut mass = 0.0;
    for (values, weight) in densities.iter().zip(&fitted.weights) {
        let mean = values.iter().sum::<f64>() / replicates;
        if !(mean > 0.0) || !mean.is_finite() {
            continue;
        }
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / replicates;
        total += weight * variance.sqrt() / mean;
        mass += weight;
    }
    Ok(if mass > 0.0 { total / mass } else { 0.0 })
}

/// `max(1, ceil(n · (cv / target)²))`.
fn required_samples(current: usize, variation: f64, target: f64) -> Result<usize, AbcError> {
    if !(target > 0.0) || !target.is_finite() {
        return Err(AbcError::Distribution(
            ErrorInfo::new("kernel-variation", "target coefficient of variation must be positive")
                .with_context("target", target),
        ));
    }
    let scaled = (current as f64 * (variation / target).powi(2)).ceil();
    Ok(if scaled.is_finite() {
        (scaled as usize).max(1)
    } else {
        usize::MAX
    })
}

/// Gaussian kernel density with a diagonal bandwidth.
///
/// The bandwidth of each free dimension is `scaling · h² · Var_w[θ_k]` with the
/// Silverman factor `h = (4 / (d + 2))^(1 / (d + 4)) · n_eff^(-1 / (d + 4))`
/// computed from the effective sample size of the fitted weights.
#[derive(Debug, Clone)]
pub struct MultivariateNormalTransition {
    scaling: f64,
    fitted: Option<FittedParticles>,
    stds: Vec<f64>,
}

impl MultivariateNormalTransition {
    /// Creates an unfitted kernel.
    pub fn new(scaling: f64) -> Self {
        Self {
            scaling,
            fitted: None,
            stds: Vec::new(),
        }
    }

    /// Per-dimension kernel standard deviations, in parameter-name order.
    /// Fixed dimensions report 0.
    pub fn bandwidths(&self) -> &[f64] {
        &self.stds
    }
}

impl Default for MultivariateNormalTransition {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Transition for MultivariateNormalTransition {
    fn fit(&mut self, particles: &[Parameter], weights: &[f64]) -> Result<(), AbcError> {
        let fitted = FittedParticles::new(particles, weights)?;
        let dims = fitted.free_dims().len().max(1) as f64;
        let n_eff = effective_sample_size(&fitted.weights).unwrap_or(1.0);
        let silverman =
            (4.0 / (dims + 2.0)).powf(1.0 / (dims + 4.0)) * n_eff.powf(-1.0 / (dims + 4.0));
        let mut stds = Vec::with_capacity(fitted.names.len());
        for dim in 0..fitted.names.len() {
            if fitted.fixed[dim] {
                stds.push(0.0);
                continue;
            }
            let column = fitted.column(dim);
            let variance = weighted_variance(&column, &fitted.weights).unwrap_or(0.0);
            let std = (self.scaling * silverman * silverman * variance).sqrt();
            let floor = MIN_STD * column.iter().fold(1.0f64, |acc, v| acc.max(v.abs()));
            stds.push(if std.is_finite() { std.max(floor) } else { floor });
        }
        self.fitted = Some(fitted);
        self.stds = stds;
        Ok(())
    }

    fn perturb(&self, parent: &Parameter, rng: &mut RngHandle) -> Parameter {
        let mut perturbed = parent.clone();
        let Some(fitted) = &self.fitted else {
            return perturbed;
        };
        for (name, std) in fitted.names.iter().zip(&self.stds) {
            if *std == 0.0 {
                continue;
            }
            if let Some(value) = parent.get(name) {
                let noise: f64 = StandardNormal.sample(rng.inner_mut());
                perturbed.insert(name.clone(), value + std * noise);
            }
        }
        perturbed
    }

    fn pdf(&self, parameter: &Parameter) -> f64 {
        let Some(fitted) = &self.fitted else {
            return 0.0;
        };
        if fitted.names.is_empty() {
            return FittedParticles::parameterless_pdf(parameter);
        }
        let Some(x) = fitted.coordinates(parameter) else {
            return 0.0;
        };
        if !fitted.matches_fixed(&x) {
            return 0.0;
        }
        fitted
            .rows
            .iter()
            .zip(&fitted.weights)
            .map(|(row, weight)| {
                let kernel: f64 = row
                    .iter()
                    .zip(&x)
                    .zip(&self.stds)
                    .filter(|(_, std)| **std > 0.0)
                    .map(|((center, value), std)| normal_pdf(*value, *center, *std))
                    .product();
                weight * kernel
            })
            .sum()
    }

    fn mean_coefficient_of_variation(&self, rng: &mut RngHandle) -> Result<f64, AbcError> {
        bootstrap_variation(self, self.fitted.as_ref(), rng)
    }

    fn required_nr_samples(
        &self,
        coefficient_of_variation: f64,
        rng: &mut RngHandle,
    ) -> Result<usize, AbcError> {
        let variation = self.mean_coefficient_of_variation(rng)?;
        let current = self.fitted.as_ref().map_or(0, FittedParticles::len);
        required_samples(current, variation, coefficient_of_variation)
    }
}

/// Full-covariance Gaussian attached to one fitted particle.
#[derive(Debug, Clone)]
struct LocalKernel {
    /// Lower Cholesky factor, row-major `d × d`.
    cholesky: Vec<f64>,
    log_normalizer: f64,
}

impl LocalKernel {
    fn new(covariance: &[f64], diagonal_floor: &[f64]) -> Result<Self, AbcError> {
        let d = diagonal_floor.len();
        let mut matrix = covariance.to_vec();
        let mut jitter = 1e-10;
        for _ in 0..MAX_JITTER_ATTEMPTS {
            if let Some(cholesky) = cholesky(&matrix, d) {
                let log_det_half: f64 = (0..d).map(|i| cholesky[i * d + i].ln()).sum();
                return Ok(Self {
                    log_normalizer: 0.5 * d as f64 * (2.0 * std::f64::consts::PI).ln()
                        + log_det_half,
                    cholesky,
                });
            }
            for (i, floor) in diagonal_floor.iter().enumerate() {
                matrix[i * d + i] = covariance[i * d + i] + jitter * floor;
            }
            jitter *= 10.0;
        }
        Err(kernel_fit_error("local covariance is not positive definite"))
    }

    fn log_density(&self, offset: &[f64]) -> f64 {
        let d = offset.len();
        let mut solved = vec![0.0; d];
        for i in 0..d {
            let partial: f64 = (0..i).map(|k| self.cholesky[i * d + k] * solved[k]).sum();
            solved[i] = (offset[i] - partial) / self.cholesky[i * d + i];
        }
        -0.5 * solved.iter().map(|v| v * v).sum::<f64>() - self.log_normalizer
    }
}

fn cholesky(matrix: &[f64], d: usize) -> Option<Vec<f64>> {
    let mut lower = vec![0.0; d * d];
    for i in 0..d {
        for j in 0..=i {
            let mut sum = matrix[i * d + j];
            for k in 0..j {
                sum -= lower[i * d + k] * lower[j * d + k];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return None;
                }
                lower[i * d + i] = sum.sqrt();
            } else {
                lower[i * d + j] = sum / lower[j * d + j];
            }
        }
    }
    Some(lower)
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn project(row: &[f64], dims: &[usize]) -> Vec<f64> {
    dims.iter().map(|dim| row[*dim]).collect()
}

/// Mixture of full-covariance Gaussians, one per fitted particle, each with
/// the scaled covariance of that particle's `k` nearest neighbours.
///
/// `k = min(n, max(2, ceil(k_fraction · n)))`. Neighbourhoods use the
/// Euclidean distance over the free dimensions.
#[derive(Debug, Clone)]
pub struct LocalTransition {
    scaling: f64,
    k_fraction: f64,
    fitted: Option<FittedParticles>,
    free: Vec<usize>,
    centers: Vec<Vec<f64>>,
    kernels: Vec<LocalKernel>,
}

impl LocalTransition {
    /// Creates an unfitted kernel.
    pub fn new(scaling: f64, k_fraction: f64) -> Self {
        Self {
            scaling,
            k_fraction,
            fitted: None,
            free: Vec::new(),
            centers: Vec::new(),
            kernels: Vec::new(),
        }
    }

    /// Neighbourhood size used for `n` fitted particles.
    pub fn neighbours(&self, n: usize) -> usize {
        let k = (n as f64 * self.k_fraction).ceil();
        let k = if k.is_finite() { k as usize } else { n };
        k.max(2).min(n)
    }

    fn nearest(&self, x: &[f64]) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (index, center) in self.centers.iter().enumerate() {
            let distance = squared_distance(center, x);
            if distance < best_distance {
                best = index;
                best_distance = distance;
            }
        }
        best
    }
}

impl Default for LocalTransition {
    fn default() -> Self {
        Self::new(1.0, 0.25)
    }
}

impl Transition for LocalTransition {
    fn fit(&mut self, particles: &[Parameter], weights: &[f64]) -> Result<(), AbcError> {
        let fitted = FittedParticles::new(particles, weights)?;
        let free = fitted.free_dims();
        let d = free.len();
        let centers: Vec<Vec<f64>> = fitted.rows.iter().map(|row| project(row, &free)).collect();
        let floors: Vec<f64> = free
            .iter()
            .map(|dim| {
                let variance = weighted_variance(&fitted.column(*dim), &fitted.weights);
                variance.unwrap_or(0.0).max(MIN_STD * MIN_STD)
            })
            .collect();

        let mut kernels = Vec::with_capacity(if d > 0 { centers.len() } else { 0 });
        if d > 0 {
            let k = self.neighbours(centers.len());
            for center in &centers {
                let mut order: Vec<(f64, usize)> = centers
                    .iter()
                    .enumerate()
                    .map(|(index, other)| (squared_distance(center, other), index))
                    .collect();
                order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                let neighbourhood: Vec<&Vec<f64>> =
                    order.iter().take(k).map(|(_, index)| &centers[*index]).collect();

                let mean: Vec<f64> = (0..d)
                    .map(|a| neighbourhood.iter().map(|x| x[a]).sum::<f64>() / k as f64)
                    .collect();
                let mut covariance = vec![0.0; d * d];
                for x in &neighbourhood {
                    for a in 0..d {
                        for b in 0..d {
                            covariance[a * d + b] += (x[a] - mean[a]) * (x[b] - mean[b]);
                        }
                    }
                }
                for entry in &mut covariance {
                    *entry *= self.scaling / k as f64;
                }
                kernels.push(LocalKernel::new(&covariance, &floors)?);
            }
        }

        self.fitted = Some(fitted);
        self.free = free;
        self.centers = centers;
        self.kernels = kernels;
        Ok(())
    }

    fn perturb(&self, parent: &Parameter, rng: &mut RngHandle) -> Parameter {
        let mut perturbed = parent.clone();
        let Some(fitted) = &self.fitted else {
            return perturbed;
        };
        if self.free.is_empty() {
            return perturbed;
        }
        let Some(x) = fitted.coordinates(parent) else {
            return perturbed;
        };
        let center = project(&x, &self.free);
        let kernel = &self.kernels[self.nearest(&center)];
        let d = self.free.len();
        let mut noise = Vec::with_capacity(d);
        for _ in 0..d {
            let value: f64 = StandardNormal.sample(rng.inner_mut());
            noise.push(value);
        }
        for (a, dim) in self.free.iter().enumerate() {
            let shift: f64 = (0..=a).map(|b| kernel.cholesky[a * d + b] * noise[b]).sum();
            perturbed.insert(fitted.names[*dim].clone(), center[a] + shift);
        }
        perturbed
    }

    fn pdf(&self, parameter: &Parameter) -> f64 {
        let Some(fitted) = &self.fitted else {
            return 0.0;
        };
        if fitted.names.is_empty() {
            return FittedParticles::parameterless_pdf(parameter);
        }
        let Some(x) = fitted.coordinates(parameter) else {
            return 0.0;
        };
        if !fitted.matches_fixed(&x) {
            return 0.0;
        }
        if self.free.is_empty() {
            return 1.0;
        }
        let point = project(&x, &self.free);
        self.centers
            .iter()
            .zip(&self.kernels)
            .zip(&fitted.weights)
            .map(|((center, kernel), weight)| {
                let offset: Vec<f64> = point.iter().zip(center).map(|(p, c)| p - c).collect();
                weight * kernel.log_density(&offset).exp()
            })
            .sum()
    }

    fn mean_coefficient_of_variation(&self, rng: &mut RngHandle) -> Result<f64, AbcError> {
        bootstrap_variation(self, self.fitted.as_ref(), rng)
    }

    fn required_nr_samples(
        &self,
        coefficient_of_variation: f64,
        rng: &mut RngHandle,
    ) -> Result<usize, AbcError> {
        let variation = self.mean_coefficient_of_variation(rng)?;
        let current = self.fitted.as_ref().map_or(0, FittedParticles::len);
        required_samples(current, variation, coefficient_of_variation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particle(a: f64, b: f64) -> Parameter {
        Parameter::new().with("a", a).with("b", b)
    }

    fn grid(n: usize) -> Vec<Parameter> {
        (0..n)
            .map(|i| particle(i as f64 / n as f64, (i * 7 % n) as f64 / n as f64))
            .collect()
    }

    #[test]
    fn pdf_ignores_insertion_order() {
        let particles = grid(20);
        let weights = vec![1.0; particles.len()];
        let forward = Parameter::new().with("a", 0.3).with("b", 0.6);
        let reversed = Parameter::new().with("b", 0.6).with("a", 0.3);

        let mut kernel = MultivariateNormalTransition::default();
        kernel.fit(&particles, &weights).unwrap();
        assert_eq!(kernel.pdf(&forward), kernel.pdf(&reversed));
        assert!(kernel.pdf(&forward) > 0.0);

        let mut local = LocalTransition::default();
        local.fit(&particles, &weights).unwrap();
        assert_eq!(local.pdf(&forward), local.pdf(&reversed));
        assert!(local.pdf(&forward) > 0.0);
    }

    #[test]
    fn parameterless_particles_have_unit_density() {
        let particles = vec![Parameter::new(); 4];
        let mut kernel = MultivariateNormalTransition::default();
        kernel.fit(&particles, &[0.25; 4]).unwrap();
        assert_eq!(kernel.pdf(&Parameter::new()), 1.0);
        let mut rng = RngHandle::from_seed(3);
        assert!(kernel.perturb(&Parameter::new(), &mut rng).is_empty());
    }

    #[test]
    fn constant_dimension_stays_fixed() {
        let particles: Vec<Parameter> = (0..10)
            .map(|i| Parameter::new().with("k", 2.0).with("theta", i as f64 / 10.0))
            .collect();
        let weights = vec![1.0; particles.len()];
        let mut rng = RngHandle::from_seed(5);

        let mut kernel = MultivariateNormalTransition::default();
        kernel.fit(&particles, &weights).unwrap();
        assert_eq!(kernel.bandwidths()[0], 0.0);
        let moved = kernel.perturb(&particles[3], &mut rng);
        assert_eq!(moved.get("k"), Some(2.0));
        assert!(kernel.pdf(&moved) > 0.0);
        assert_eq!(kernel.pdf(&moved.clone().with("k", 2.5)), 0.0);

        let mut local = LocalTransition::default();
        local.fit(&particles, &weights).unwrap();
        let moved = local.perturb(&particles[3], &mut rng);
        assert_eq!(moved.get("k"), Some(2.0));
        assert!(local.pdf(&moved) > 0.0);
    }

    #[test]
    fn cholesky_recovers_factor() {
        let lower = cholesky(&[4.0, 2.0, 2.0, 5.0], 2).unwrap();
        assert_eq!(lower, vec![2.0, 0.0, 1.0, 2.0]);
        assert!(cholesky(&[1.0, 1.0, 1.0, 1.0], 2).is_none());
    }

    #[test]
    fn neighbourhood_size_is_clamped() {
        let kernel = LocalTransition::new(1.0, 0.25);
        assert_eq!(kernel.neighbours(1), 1);
        assert_eq!(kernel.neighbours(3), 2);
        assert_eq!(kernel.neighbours(20), 5);
        assert_eq!(LocalTransition::new(1.0, 1.0).neighbours(7), 7);
    }

    #[test]
    fn required_samples_scale_quadratically() {
        assert_eq!(required_samples(100, 0.2, 0.1).unwrap(), 400);
        assert_eq!(required_samples(100, 0.0, 0.1).unwrap(), 1);
        assert!(required_samples(100, 0.2, 0.0).is_err());
    }
}
