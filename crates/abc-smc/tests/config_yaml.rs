use std::fs;

use abc_smc::{AdaptivePopulationConfig, EpsilonConfig, RunConfig, TransitionKind, WeightConfig};
use tempfile::tempdir;

#[test]
fn empty_document_yields_defaults() {
    let config = RunConfig::from_yaml_str("{}").unwrap();
    assert_eq!(config, RunConfig::default());
    assert_eq!(config.population_size, 100);
    assert_eq!(config.epsilon, EpsilonConfig::Median);
    assert_eq!(config.weights, WeightConfig::Importance);
    assert_eq!(config.concurrency.workers, 1);
}

#[test]
fn full_document_parses() {
    let yaml = r#"
population_size: 250
minimum_epsilon: 0.05
max_nr_populations: 8
max_total_proposals: 100000
max_total_simulations: 2000000
max_consecutive_simulation_failures: 25
initial_epsilon: 4.0
epsilon:
  type: quantile
  alpha: 0.4
transition:
  scaling: 1.5
weights: acceptance-share
concurrency:
  workers: 8
  max_batch_size: 512
seed_policy:
  master_seed: 99
  label: nightly
run_id: experiment-7
"#;
    let config = RunConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.population_size, 250);
    assert_eq!(config.max_total_proposals, Some(100_000));
    assert_eq!(config.max_total_simulations, Some(2_000_000));
    assert_eq!(config.initial_epsilon, Some(4.0));
    assert_eq!(
        config.epsilon,
        EpsilonConfig::Quantile {
            alpha: 0.4,
            multiplier: 1.0
        }
    );
    assert_eq!(config.weights, WeightConfig::AcceptanceShare);
    assert_eq!(config.concurrency.max_batch_size, 512);
    assert_eq!(config.seed_policy.label.as_deref(), Some("nightly"));
    assert_eq!(config.run_id.as_deref(), Some("experiment-7"));
}

#[test]
fn acceptance_rate_schedule_uses_default_levels() {
    let yaml = "epsilon:\n  type: acceptance-rate\n  target_rate: 0.2\n";
    let config = RunConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(
        config.epsilon,
        EpsilonConfig::AcceptanceRate {
            target_rate: 0.2,
            alpha_low: 0.3,
            alpha_high: 0.7
        }
    );
}

#[test]
fn invalid_values_are_config_errors() {
    for yaml in [
        "population_size: 0",
        "max_nr_populations: 0",
        "minimum_epsilon: -1.0",
        "transition:\n  scaling: 0.0",
        "epsilon:\n  type: quantile\n  alpha: 1.5",
        "epsilon:\n  type: list\n  values: []",
        "concurrency:\n  max_batch_size: 0",
    ] {
        let err = RunConfig::from_yaml_str(yaml).unwrap_err();
        assert_eq!(err.family(), "config", "{yaml}");
    }
}

#[test]
fn malformed_yaml_is_a_serde_error() {
    let err = RunConfig::from_yaml_str("population_size: [").unwrap_err();
    assert_eq!(err.family(), "serde");
    assert_eq!(err.info().code, "config-parse");
}

#[test]
fn load_reads_file_and_reports_missing_paths() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.yaml");
    fs::write(&path, "population_size: 12\nepsilon:\n  type: constant\n  value: 0.5\n").unwrap();
    let config = RunConfig::load(&path).unwrap();
    assert_eq!(config.population_size, 12);
    assert_eq!(config.epsilon, EpsilonConfig::Constant { value: 0.5 });

    let err = RunConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.info().code, "config-read");
    assert!(err.info().context.contains_key("path"));
}

#[test]
fn local_kernel_and_adaptive_population_parse() {
    let yaml = r#"
transition:
  kind: local
  k_fraction: 0.5
weights: marginal-acceptance
adaptive_population:
  mean_cv: 0.1
  max_population_size: 400
"#;
    let config = RunConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.transition.kind, TransitionKind::Local);
    assert_eq!(config.transition.k_fraction, 0.5);
    assert_eq!(config.transition.scaling, 1.0);
    assert_eq!(config.weights, WeightConfig::MarginalAcceptance);
    assert_eq!(
        config.adaptive_population,
        Some(AdaptivePopulationConfig {
            mean_cv: 0.1,
            min_population_size: 10,
            max_population_size: 400,
        })
    );
}

#[test]
fn kernel_and_adaptive_ranges_are_checked() {
    for (yaml, code) in [
        ("transition:\n  k_fraction: 0.0\n", "transition.k_fraction"),
        ("transition:\n  k_fraction: 1.5\n", "transition.k_fraction"),
        ("adaptive_population:\n  mean_cv: 0.0\n", "adaptive_population.mean_cv"),
        (
            "adaptive_population:\n  min_population_size: 50\n  max_population_size: 20\n",
            "adaptive_population.bounds",
        ),
    ] {
        let err = RunConfig::from_yaml_str(yaml).unwrap_err();
        assert_eq!(err.info().code, code, "{yaml}");
    }
}

