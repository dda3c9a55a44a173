use abc_smc::distributions::ModelPrior;
use abc_smc::epsilon::{
    validate_epsilon, AcceptanceRateEpsilon, ConstantEpsilon, ListEpsilon, MedianEpsilon,
    QuantileEpsilon,
};
use abc_smc::sampler::{AcceptedTrial, EngineSettings, Proposal, SamplingEngine};
use abc_smc::sampler::build_pool;
use abc_smc::weights::{
    AcceptanceShareWeights, ImportanceWeights, MarginalAcceptanceWeights, WeightInputs,
};
use abc_smc::{
    FnModel, IndependentPrior, ModelSpec, PNormDistance, Parameter, Particle, Population,
    RngHandle, RunConfig, SumStats, ToleranceScheduler, WeightPolicy, RV,
};

fn particle(model: usize, distance: f64) -> Particle {
    Particle {
        model,
        parameter: Parameter::new().with("theta", distance),
        sum_stats: SumStats::new().with("y", distance),
        distance,
        weight: 1.0,
    }
}

fn four_point_population() -> Population {
    let particles = [1.0, 2.0, 3.0, 4.0]
        .iter()
        .map(|&distance| particle(0, distance))
        .collect();
    Population::new(0, None, particles, 8, 1).unwrap()
}

#[test]
fn median_interpolates_between_centre_points() {
    let next = MedianEpsilon.next_epsilon(&four_point_population()).unwrap();
    assert!((next - 2.5).abs() < 1e-12);
}

#[test]
fn quantile_applies_multiplier() {
    let next = QuantileEpsilon::new(0.5, 2.0)
        .next_epsilon(&four_point_population())
        .unwrap();
    assert!((next - 5.0).abs() < 1e-12);
}

#[test]
fn acceptance_rate_picks_low_quantile_for_easy_generations() {
    let population = four_point_population();
    assert!((population.acceptance_rate() - 0.5).abs() < 1e-12);
    let easy = AcceptanceRateEpsilon::new(0.2, 0.3, 0.7)
        .next_epsilon(&population)
        .unwrap();
    let hard = AcceptanceRateEpsilon::new(0.9, 0.3, 0.7)
        .next_epsilon(&population)
        .unwrap();
    assert!((easy - 1.9).abs() < 1e-9);
    assert!((hard - 3.1).abs() < 1e-9);
    assert!(hard > easy);
}

#[test]
fn list_and_constant_schedules() {
    let population = four_point_population();
    let list = ListEpsilon::new(vec![3.0, 2.0]);
    assert_eq!(list.next_epsilon(&population).unwrap(), 2.0);
    let later = Population::new(5, Some(2.0), vec![particle(0, 1.0)], 1, 1).unwrap();
    assert_eq!(list.next_epsilon(&later).unwrap(), 2.0);
    assert_eq!(
        ListEpsilon::new(Vec::new())
            .next_epsilon(&population)
            .unwrap_err()
            .info()
            .code,
        "epsilon-list-empty"
    );
    assert_eq!(ConstantEpsilon::new(0.3).next_epsilon(&population).unwrap(), 0.3);
}

#[test]
fn degenerate_thresholds_are_schedule_errors() {
    assert_eq!(validate_epsilon(f64::NAN, 2).unwrap_err().info().code, "epsilon-nan");
    assert_eq!(validate_epsilon(-0.1, 2).unwrap_err().info().code, "epsilon-negative");
    assert_eq!(
        validate_epsilon(f64::INFINITY, 2).unwrap_err().family(),
        "schedule"
    );
    assert_eq!(validate_epsilon(0.0, 2).unwrap(), 0.0);
}

fn trial(model: usize, prior_density: f64, importance_density: f64) -> AcceptedTrial {
    AcceptedTrial {
        particle: particle(model, 0.5),
        prior_density,
        importance_density,
    }
}

#[test]
fn importance_weights_include_model_factor() {
    let accepted = vec![trial(0, 0.5, 0.25), trial(1, 0.5, 0.5)];
    let prior = ModelPrior::uniform(2);
    let previous = [0.25, 0.75];
    let weights = ImportanceWeights
        .raw_weights(&WeightInputs {
            accepted: &accepted,
            model_prior: &prior,
            previous_model_probabilities: &previous,
            model_acceptance_rates: &[0.5, 0.5],
        })
        .unwrap();
    assert!((weights[0] - 4.0).abs() < 1e-12);
    assert!((weights[1] - 2.0 / 3.0).abs() < 1e-12);
}

#[test]
fn zero_importance_density_is_rejected() {
    let accepted = vec![trial(0, 0.5, 0.0)];
    let prior = ModelPrior::uniform(1);
    let err = ImportanceWeights
        .raw_weights(&WeightInputs {
            accepted: &accepted,
            model_prior: &prior,
            previous_model_probabilities: &[1.0],
            model_acceptance_rates: &[1.0],
        })
        .unwrap_err();
    assert_eq!(err.info().code, "importance-weight");
}

#[test]
fn acceptance_share_weights_follow_accepted_counts() {
    let accepted = vec![trial(0, 0.5, 0.25), trial(0, 0.5, 0.25), trial(1, 0.5, 0.5)];
    let prior = ModelPrior::uniform(2);
    let weights = AcceptanceShareWeights
        .raw_weights(&WeightInputs {
            accepted: &accepted,
            model_prior: &prior,
            previous_model_probabilities: &[0.5, 0.5],
            model_acceptance_rates: &[0.5, 0.5],
        })
        .unwrap();
    for weight in weights {
        assert!((weight - 1.0 / 3.0).abs() < 1e-12);
    }
}

#[test]
fn marginal_acceptance_weights_scale_models_by_acceptance_rate() {
    let accepted = vec![trial(0, 0.5, 0.25), trial(0, 0.5, 0.5), trial(1, 0.5, 0.5)];
    let prior = ModelPrior::uniform(2);
    let weights = MarginalAcceptanceWeights
        .raw_weights(&WeightInputs {
            accepted: &accepted,
            model_prior: &prior,
            previous_model_probabilities: &[0.9, 0.1],
            model_acceptance_rates: &[0.5, 0.1],
        })
        .unwrap();
    assert!((weights[0] - 1.0 / 6.0).abs() < 1e-12);
    assert!((weights[1] - 1.0 / 12.0).abs() < 1e-12);
    assert!((weights[2] - 0.05).abs() < 1e-12);

    let particles: Vec<Particle> = accepted
        .iter()
        .zip(&weights)
        .map(|(trial, weight)| Particle {
            weight: *weight,
            ..trial.particle.clone()
        })
        .collect();
    let population = Population::new(1, Some(1.0), particles, 12, 2).unwrap();
    assert!((population.model_probability(1) - 1.0 / 6.0).abs() < 1e-12);
}

#[test]
fn unproposed_model_gets_no_marginal_mass() {
    let accepted = vec![trial(0, 0.5, 0.25)];
    let prior = ModelPrior::uniform(2);
    let weights = MarginalAcceptanceWeights
        .raw_weights(&WeightInputs {
            accepted: &accepted,
            model_prior: &prior,
            previous_model_probabilities: &[1.0, 0.0],
            model_acceptance_rates: &[0.25, 0.0],
        })
        .unwrap();
    assert!((weights[0] - 0.125).abs() < 1e-12);
}

fn line_model(name: &str, low: f64, high: f64) -> ModelSpec {
    let model = FnModel::new(name, |parameter: &Parameter, _rng: &mut RngHandle| {
        Ok(SumStats::new().with("y", parameter.get("theta").unwrap_or(0.0)))
    });
    ModelSpec::new(
        model,
        IndependentPrior::new().with("theta", RV::uniform(low, high).unwrap()),
    )
}

#[test]
fn engine_fills_population_within_threshold() {
    let models = vec![line_model("a", -2.0, 2.0), line_model("b", 0.0, 4.0)];
    let distance = PNormDistance::euclidean();
    let observed = SumStats::new().with("y", 0.0);
    let mut config = RunConfig::default();
    config.population_size = 30;
    config.concurrency.workers = 2;
    config.concurrency.max_batch_size = 16;
    let pool = build_pool(config.concurrency.workers).unwrap();
    let engine = SamplingEngine::new(
        &models,
        &distance,
        &observed,
        EngineSettings::from_config(&config),
        17,
        &pool,
    );
    let prior = ModelPrior::uniform(2);
    let sample = engine
        .sample_generation(0, Some(1.0), Proposal::Prior { model_prior: &prior })
        .unwrap();

    assert_eq!(sample.accepted.len(), 30);
    assert!(sample.proposal_count >= 30);
    assert_eq!(
        sample.proposal_count,
        30 + sample.rejected + sample.failed
    );
    assert_eq!(sample.model_proposals.iter().sum::<u64>(), sample.proposal_count);
    assert_eq!(sample.model_acceptances.iter().sum::<u64>(), 30);
    for trial in &sample.accepted {
        assert!(trial.particle.distance <= 1.0);
        assert!(trial.prior_density > 0.0);
        assert_eq!(trial.importance_density, 1.0);
    }
}

#[test]
fn non_finite_statistics_count_as_failed_trials() {
    let model = FnModel::new("edge", |parameter: &Parameter, _rng: &mut RngHandle| {
        let theta = parameter.get("theta").unwrap_or(0.0);
        let aux = if theta < 0.0 { f64::INFINITY } else { theta };
        Ok(SumStats::new().with("y", theta).with("aux", aux))
    });
    let models = vec![ModelSpec::new(
        model,
        IndependentPrior::new().with("theta", RV::uniform(-1.0, 1.0).unwrap()),
    )];
    let distance = PNormDistance::euclidean();
    let observed = SumStats::new().with("y", 0.0).with("aux", 0.0);
    let mut config = RunConfig::default();
    config.population_size = 20;
    let pool = build_pool(1).unwrap();
    let engine = SamplingEngine::new(
        &models,
        &distance,
        &observed,
        EngineSettings::from_config(&config),
        23,
        &pool,
    );
    let prior = ModelPrior::uniform(1);
    let sample = engine
        .sample_generation(0, None, Proposal::Prior { model_prior: &prior })
        .unwrap();

    assert_eq!(sample.accepted.len(), 20);
    assert!(sample.failed > 0);
    assert_eq!(sample.rejected, 0);
    for trial in &sample.accepted {
        assert!(trial.particle.is_finite());
        assert!(trial.particle.parameter.get("theta").unwrap() >= 0.0);
    }
}
