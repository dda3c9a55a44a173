use abc_smc::epsilon::MedianEpsilon;
use abc_smc::{
    Abc, AbcError, CancellationToken, Completion, CompletionReason, DirectoryHistory, FnModel,
    HistoryStore, IndependentPrior, MemoryHistory, ModelSpec, PNormDistance, Parameter,
    Population, RngHandle, RunConfig, SumStats, ToleranceScheduler, RV,
};
use rand_distr::{Distribution as _, Normal};
use tempfile::tempdir;

fn gaussian(name: &str, low: f64, high: f64) -> ModelSpec {
    let model = FnModel::new(name, |parameter: &Parameter, rng: &mut RngHandle| {
        let theta = parameter.get("theta").unwrap_or(0.0);
        let normal =
            Normal::new(0.0, 0.5).map_err(|err| AbcError::simulation("noise", err.to_string()))?;
        Ok(SumStats::new().with("y", theta + normal.sample(rng)))
    });
    ModelSpec::new(
        model,
        IndependentPrior::new().with("theta", RV::uniform(low, high).unwrap()),
    )
}

fn models() -> Vec<ModelSpec> {
    vec![gaussian("left", -3.0, 1.0), gaussian("right", -1.0, 4.0)]
}

fn observed() -> SumStats {
    SumStats::new().with("y", 0.3)
}

fn config(max_nr_populations: usize, workers: usize, max_batch_size: usize) -> RunConfig {
    let mut config = RunConfig::default();
    config.population_size = 60;
    config.max_nr_populations = max_nr_populations;
    config.seed_policy.master_seed = 2024;
    config.concurrency.workers = workers;
    config.concurrency.max_batch_size = max_batch_size;
    config
}

struct CancelAfter {
    inner: MedianEpsilon,
    token: CancellationToken,
    generation: usize,
}

impl ToleranceScheduler for CancelAfter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn next_epsilon(&self, previous: &Population) -> Result<f64, AbcError> {
        if previous.generation() == self.generation {
            self.token.cancel();
        }
        self.inner.next_epsilon(previous)
    }
}

fn interrupted_after(generation: usize, config: RunConfig, store: &mut dyn HistoryStore) -> String {
    let abc = Abc::new(config, models(), PNormDistance::euclidean()).unwrap();
    let token = abc.cancellation_token();
    let mut abc = abc.with_scheduler(CancelAfter {
        inner: MedianEpsilon,
        token,
        generation,
    });
    let summary = abc.run(&observed(), store).unwrap();
    assert_eq!(summary.completion, Completion::Cancelled);
    summary.run_id
}

fn all_populations(store: &dyn HistoryStore, run_id: &str) -> Vec<Population> {
    let latest = store.latest_generation(run_id).unwrap().unwrap();
    (0..=latest)
        .map(|generation| store.load_population(run_id, generation).unwrap())
        .collect()
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let mut uninterrupted = MemoryHistory::new();
    let mut abc = Abc::new(config(4, 1, 4096), models(), PNormDistance::euclidean()).unwrap();
    let full = abc.run(&observed(), &mut uninterrupted).unwrap();
    assert_eq!(
        full.completion,
        Completion::Completed(CompletionReason::MaxPopulations)
    );

    let mut interrupted = MemoryHistory::new();
    let run_id = interrupted_after(1, config(4, 1, 4096), &mut interrupted);
    assert_eq!(run_id, full.run_id);
    assert_eq!(interrupted.latest_generation(&run_id).unwrap(), Some(1));

    let mut resumed = Abc::new(config(4, 1, 4096), models(), PNormDistance::euclidean()).unwrap();
    let summary = resumed.run(&observed(), &mut interrupted).unwrap();
    assert_eq!(summary.resumed_from, Some(1));
    assert_eq!(summary.generations.len(), 2);
    assert_eq!(summary.generations[0].generation, 2);
    assert_eq!(summary.total_proposals, full.total_proposals);

    assert_eq!(
        all_populations(&uninterrupted, &run_id),
        all_populations(&interrupted, &run_id)
    );
}

#[test]
fn resume_from_directory_store_matches_memory_run() {
    let dir = tempdir().unwrap();
    let mut reference = MemoryHistory::new();
    let mut abc = Abc::new(config(3, 1, 4096), models(), PNormDistance::euclidean()).unwrap();
    let full = abc.run(&observed(), &mut reference).unwrap();

    let mut on_disk = DirectoryHistory::open(dir.path()).unwrap();
    interrupted_after(0, config(3, 1, 4096), &mut on_disk);

    let mut reopened = DirectoryHistory::open(dir.path()).unwrap();
    let mut resumed = Abc::new(config(3, 1, 4096), models(), PNormDistance::euclidean()).unwrap();
    let summary = resumed.run(&observed(), &mut reopened).unwrap();
    assert_eq!(summary.resumed_from, Some(0));
    assert_eq!(
        all_populations(&reference, &full.run_id),
        all_populations(&reopened, &full.run_id)
    );
    let metadata = reopened.run_metadata(&full.run_id).unwrap();
    assert_eq!(
        metadata.completion_reason,
        Some(CompletionReason::MaxPopulations)
    );
}

#[test]
fn worker_count_and_batch_size_do_not_change_results() {
    let mut single = MemoryHistory::new();
    let mut abc = Abc::new(config(3, 1, 4096), models(), PNormDistance::euclidean()).unwrap();
    let reference = abc.run(&observed(), &mut single).unwrap();

    let mut pooled = MemoryHistory::new();
    let mut abc = Abc::new(config(3, 4, 7), models(), PNormDistance::euclidean()).unwrap();
    let parallel = abc.run(&observed(), &mut pooled).unwrap();

    assert_eq!(reference.run_id, parallel.run_id);
    assert_eq!(reference.scheduled_epsilons, parallel.scheduled_epsilons);
    assert_eq!(
        all_populations(&single, &reference.run_id),
        all_populations(&pooled, &parallel.run_id)
    );
}

#[test]
fn different_seeds_give_different_runs() {
    let mut first = MemoryHistory::new();
    let mut abc = Abc::new(config(1, 1, 4096), models(), PNormDistance::euclidean()).unwrap();
    let a = abc.run(&observed(), &mut first).unwrap();

    let mut other_config = config(1, 1, 4096);
    other_config.seed_policy.master_seed = 2025;
    let mut second = MemoryHistory::new();
    let mut abc = Abc::new(other_config, models(), PNormDistance::euclidean()).unwrap();
    let b = abc.run(&observed(), &mut second).unwrap();

    assert_ne!(a.run_id, b.run_id);
    assert_ne!(
        first.load_population(&a.run_id, 0).unwrap(),
        second.load_population(&b.run_id, 0).unwrap()
    );
}

#[test]
fn changed_sampling_configuration_is_rejected_on_resume() {
    let mut store = MemoryHistory::new();
    let run_id = interrupted_after(0, config(3, 1, 4096), &mut store);

    let mut changed = config(3, 1, 4096);
    changed.transition.scaling = 2.0;
    let mut abc = Abc::new(changed, models(), PNormDistance::euclidean()).unwrap();
    let err = abc.run(&observed(), &mut store).unwrap_err();
    assert_eq!(err.family(), "persistence");
    assert_eq!(err.info().code, "config-mismatch");
    assert_eq!(store.latest_generation(&run_id).unwrap(), Some(0));
}
