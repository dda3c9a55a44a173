//! Deterministic seed derivation for runs, generations and trials.

use abc_core::{derive_substream_seed, label_key};

/// Derives the key that ties every substream of a run to its identifier.
pub fn run_key(master_seed: u64, run_id: &str) -> u64 {
    derive_substream_seed(master_seed, label_key(run_id))
}

/// Derives the deterministic seed for one sampling trial.
///
/// The seed depends only on `(run, generation, trial_index)`, so a trial draws
/// the same randomness regardless of the worker that evaluates it or the batch
/// it was scheduled in.
pub fn trial_seed(run_key: u64, generation: usize, trial_index: u64) -> u64 {
    let intermediate = derive_substream_seed(run_key, generation as u64);
    derive_substream_seed(intermediate, trial_index)
}

/// Seed of the bootstrap that sizes an adaptive `generation`.
pub fn population_size_seed(run_key: u64, generation: usize) -> u64 {
    derive_substream_seed(
        derive_substream_seed(run_key, label_key("population-size")),
        generation as u64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_seeds_separate_generations_and_trials() {
        let key = run_key(42, "run");
        assert_eq!(trial_seed(key, 1, 5), trial_seed(key, 1, 5));
        assert_ne!(trial_seed(key, 1, 5), trial_seed(key, 2, 5));
        assert_ne!(trial_seed(key, 1, 5), trial_seed(key, 1, 6));
        assert_ne!(run_key(42, "run"), run_key(42, "other"));
        assert_ne!(population_size_seed(key, 1), trial_seed(key, 1, 0));
        assert_eq!(population_size_seed(key, 3), population_size_seed(key, 3));
    }
}
