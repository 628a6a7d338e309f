//! Chunker / Array Batcher — groups staged experiments into Slurm array
//! jobs.
//!
//! Grounded on `original_source/src/seml/start.py`'s `chunk_list` and
//! `batch_chunks`, which group experiments by `batch_id` and then slice
//! each group into fixed-size chunks (one Slurm array task per chunk) using
//! `numpy.array_split`. Rust has no numpy dependency to reach for, so the
//! grouping is plain, order-preserving accumulation — the distilled spec
//! never requires numpy's particular split-size balancing, only that every
//! chunk of a given batch shares the same `experiments_per_job` ceiling.

use std::collections::BTreeMap;

use crate::storage::Experiment;

/// One Slurm array task's worth of experiments, all drawn from the same
/// `batch_id`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch_id: i64,
    pub experiments: Vec<Experiment>,
}

/// Group `experiments` by `batch_id` (insertion order preserved within each
/// group) and slice each group into chunks of at most `experiments_per_job`
/// since that is the unit one Slurm array task executes serially.
pub fn chunk_experiments(experiments: Vec<Experiment>, experiments_per_job: usize) -> Vec<Chunk> {
    let experiments_per_job = experiments_per_job.max(1);

    let mut batches: BTreeMap<i64, Vec<Experiment>> = BTreeMap::new();
    let mut order: Vec<i64> = Vec::new();
    for exp in experiments {
        if !batches.contains_key(&exp.batch_id) {
            order.push(exp.batch_id);
        }
        batches.entry(exp.batch_id).or_default().push(exp);
    }

    let mut chunks = Vec::new();
    for batch_id in order {
        let group = batches.remove(&batch_id).expect("batch_id recorded in order");
        for slice in group.chunks(experiments_per_job) {
            chunks.push(Chunk {
                batch_id,
                experiments: slice.to_vec(),
            });
        }
    }
    chunks
}

/// Group consecutive chunks that share a `batch_id` into arrays — one array
/// per batch, matching the invariant that one array is exactly one `sbatch`
/// submission. Relies on `chunk_experiments` emitting a batch's chunks
/// consecutively.
pub fn group_into_arrays(chunks: Vec<Chunk>) -> Vec<Vec<Chunk>> {
    let mut arrays: Vec<Vec<Chunk>> = Vec::new();
    for chunk in chunks {
        match arrays.last_mut() {
            Some(last) if last.last().map(|c: &Chunk| c.batch_id) == Some(chunk.batch_id) => {
                last.push(chunk);
            }
            _ => arrays.push(vec![chunk]),
        }
    }
    arrays
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SemlInfo, SlurmInfo, Status};
    use serial_test::parallel;

    fn exp(id: i64, batch_id: i64) -> Experiment {
        Experiment {
            id,
            batch_id,
            status: Status::Staged,
            config: serde_json::json!({}),
            config_unresolved: None,
            seml: SemlInfo::default(),
            slurm: SlurmInfo::default(),
        }
    }

    #[test]
    #[parallel]
    fn groups_by_batch_and_preserves_order() {
        let experiments = vec![exp(1, 10), exp(2, 20), exp(3, 10), exp(4, 20)];
        let chunks = chunk_experiments(experiments, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].batch_id, 10);
        assert_eq!(
            chunks[0].experiments.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(chunks[1].batch_id, 20);
        assert_eq!(
            chunks[1].experiments.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }

    #[test]
    #[parallel]
    fn splits_large_batches_into_multiple_chunks() {
        let experiments = (1..=5).map(|id| exp(id, 1)).collect::<Vec<_>>();
        let chunks = chunk_experiments(experiments, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].experiments.len(), 2);
        assert_eq!(chunks[1].experiments.len(), 2);
        assert_eq!(chunks[2].experiments.len(), 1);
    }

    #[test]
    #[parallel]
    fn zero_per_job_treated_as_one() {
        let experiments = vec![exp(1, 1), exp(2, 1)];
        let chunks = chunk_experiments(experiments, 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    #[parallel]
    fn groups_consecutive_chunks_into_arrays() {
        let experiments = vec![exp(1, 10), exp(2, 10), exp(3, 10), exp(4, 20)];
        let chunks = chunk_experiments(experiments, 2);
        let arrays = group_into_arrays(chunks);
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].len(), 2); // batch 10 split into two chunks of size 2, 1
        assert_eq!(arrays[1].len(), 1); // batch 20, one chunk
    }
}
