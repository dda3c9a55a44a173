use std::fs;

use abc_smc::history::population_file;
use abc_smc::{
    CompletionReason, DirectoryHistory, HistoryStore, MemoryHistory, Parameter, Particle,
    Population, RunRecord, SumStats,
};
use tempfile::tempdir;

fn record(run_id: &str, config_hash: &str) -> RunRecord {
    RunRecord {
        run_id: run_id.to_string(),
        start_time: "2024-05-01T12:00:00+00:00".to_string(),
        observed: SumStats::new().with("y", 1.5),
        model_names: vec!["m0".to_string(), "m1".to_string()],
        distance_name: "p-norm".to_string(),
        population_size: 3,
        master_seed: 11,
        seed_label: Some("contract".to_string()),
        config_hash: config_hash.to_string(),
    }
}

fn particle(model: usize, theta: f64, weight: f64) -> Particle {
    Particle {
        model,
        parameter: Parameter::new().with("theta", theta),
        sum_stats: SumStats::new().with("y", theta + 0.25),
        distance: (theta - 1.5).abs(),
        weight,
    }
}

fn population(generation: usize, epsilon: Option<f64>) -> Population {
    Population::new(
        generation,
        epsilon,
        vec![
            particle(0, 1.0, 1.0),
            particle(1, 2.0, 2.0),
            particle(0, 1.25, 1.0),
        ],
        7 + generation as u64,
        2,
    )
    .unwrap()
}

fn exercise_contract(store: &mut dyn HistoryStore) {
    let run_id = store.create_run(&record("run-a", "hash-1")).unwrap();
    assert_eq!(run_id, "run-a");
    assert_eq!(store.latest_generation(&run_id).unwrap(), None);

    // Idempotent creation with the same configuration.
    assert_eq!(store.create_run(&record("run-a", "hash-1")).unwrap(), "run-a");
    let mismatch = store.create_run(&record("run-a", "hash-2")).unwrap_err();
    assert_eq!(mismatch.info().code, "config-mismatch");

    let gap = store.append_population(&run_id, &population(1, Some(1.0)));
    assert_eq!(gap.unwrap_err().info().code, "generation-gap");

    let first = population(0, None);
    let second = population(1, Some(0.8));
    store.append_population(&run_id, &first).unwrap();
    store.append_population(&run_id, &second).unwrap();
    let again = store.append_population(&run_id, &population(1, Some(0.8)));
    assert_eq!(again.unwrap_err().info().code, "generation-exists");

    assert_eq!(store.latest_generation(&run_id).unwrap(), Some(1));
    assert_eq!(store.load_population(&run_id, 0).unwrap(), first);
    assert_eq!(store.load_population(&run_id, 1).unwrap(), second);
    assert_eq!(
        store.load_population(&run_id, 2).unwrap_err().info().code,
        "missing-generation"
    );
    assert_eq!(store.total_proposals(&run_id).unwrap(), 15);

    let table = store.model_probability_table(&run_id).unwrap();
    assert_eq!(table.len(), 2);
    assert!((table[1][&0] - 0.5).abs() < 1e-12);
    assert!((table[1][&1] - 0.5).abs() < 1e-12);

    let (parameters, weights) = store.distribution(&run_id, 0, None).unwrap();
    assert_eq!(parameters.len(), 2);
    assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    assert_eq!(
        store.epsilon_trajectory(&run_id).unwrap(),
        vec![None, Some(0.8)]
    );
    let summaries = store.population_summaries(&run_id).unwrap();
    assert_eq!(summaries[1].proposal_count, 8);
    assert_eq!(summaries[1].acceptance_count, 3);

    let metadata = store.run_metadata(&run_id).unwrap();
    assert!(!metadata.is_done());
    assert_eq!(metadata.generations, 2);
    assert_eq!(metadata.record, record("run-a", "hash-1"));

    store
        .mark_done(&run_id, "2024-05-01T13:00:00+00:00", CompletionReason::EpsilonReached)
        .unwrap();
    let metadata = store.run_metadata(&run_id).unwrap();
    assert_eq!(
        metadata.completion_reason,
        Some(CompletionReason::EpsilonReached)
    );
    assert_eq!(
        metadata.end_time.as_deref(),
        Some("2024-05-01T13:00:00+00:00")
    );

    let unknown = store.run_metadata("missing").unwrap_err();
    assert_eq!(unknown.family(), "persistence");
    assert_eq!(unknown.info().code, "unknown-run");
}

#[test]
fn memory_store_honours_contract() {
    let mut store = MemoryHistory::new();
    exercise_contract(&mut store);
    assert_eq!(store.run_ids(), vec!["run-a".to_string()]);
}

#[test]
fn directory_store_honours_contract() {
    let dir = tempdir().unwrap();
    let mut store = DirectoryHistory::open(dir.path()).unwrap();
    exercise_contract(&mut store);
}

#[test]
fn directory_store_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let mut store = DirectoryHistory::open(dir.path()).unwrap();
        store.create_run(&record("run-b", "hash")).unwrap();
        store
            .append_population("run-b", &population(0, None))
            .unwrap();
    }
    let store = DirectoryHistory::open(dir.path()).unwrap();
    assert_eq!(store.latest_generation("run-b").unwrap(), Some(0));
    assert_eq!(
        store.load_population("run-b", 0).unwrap(),
        population(0, None)
    );
    let run_dir = store.run_directory("run-b").unwrap();
    assert!(run_dir.join(population_file(0)).exists());
    assert!(run_dir.join("run.json").exists());
    let leftovers: Vec<_> = fs::read_dir(&run_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn directory_store_rejects_path_like_run_ids() {
    let dir = tempdir().unwrap();
    let mut store = DirectoryHistory::open(dir.path()).unwrap();
    let err = store.create_run(&record("../escape", "hash")).unwrap_err();
    assert_eq!(err.info().code, "run-id");
}

#[test]
fn unlisted_population_file_is_not_a_generation() {
    let dir = tempdir().unwrap();
    let mut store = DirectoryHistory::open(dir.path()).unwrap();
    store.create_run(&record("run-c", "hash")).unwrap();
    let run_dir = store.run_directory("run-c").unwrap();
    fs::write(run_dir.join(population_file(0)), "{}").unwrap();
    assert_eq!(store.latest_generation("run-c").unwrap(), None);
    store
        .append_population("run-c", &population(0, None))
        .unwrap();
    assert_eq!(
        store.load_population("run-c", 0).unwrap(),
        population(0, None)
    );
}
