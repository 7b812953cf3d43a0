//! Strategies for sampling indices from a dataset.

use crate::distributed::CollectiveError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// A trait for determining the order of data access.
pub trait Sampler: Send + Sync {
    /// Returns the indices to visit, in order.
    ///
    /// # Arguments
    ///
    /// * `len`: The length of the dataset.
    fn sample(&self, len: usize) -> Vec<usize>;
}

/// Samples elements sequentially, always in the same order.
pub struct SequentialSampler;

impl Sampler for SequentialSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        (0..len).collect()
    }
}

/// Samples elements randomly (without replacement).
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = rand::rng();
        indices.shuffle(&mut rng);
        indices
    }
}

/// Restricts sampling to the shard of the dataset owned by one rank.
///
/// Every rank sees the same permutation (seeded by `seed + epoch`) and takes every
/// `num_replicas`-th index starting at its own rank. Unless `drop_last` is set, the permutation
/// is padded by wrapping around so all ranks receive the same number of samples; with
/// `drop_last` the tail that does not divide evenly is dropped instead.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    num_replicas: usize,
    rank: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub drop_last: bool,
    epoch: u64,
}

impl DistributedSampler {
    /// Creates a shuffling sampler with seed 0.
    ///
    /// # Errors
    ///
    /// Returns `CollectiveError::RankOutOfRange` if `rank >= num_replicas`.
    pub fn new(num_replicas: usize, rank: usize) -> Result<Self, CollectiveError> {
        if rank >= num_replicas {
            return Err(CollectiveError::RankOutOfRange {
                rank,
                world_size: num_replicas,
            });
        }
        Ok(Self {
            num_replicas,
            rank,
            shuffle: true,
            seed: 0,
            drop_last: false,
            epoch: 0,
        })
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Changes the shuffle for the next pass over the data. Call it at the start of every epoch.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of indices this rank receives for a dataset of `len` items.
    pub fn num_samples(&self, len: usize) -> usize {
        if self.drop_last {
            len / self.num_replicas
        } else {
            len.div_ceil(self.num_replicas)
        }
    }
}

impl Sampler for DistributedSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        let total = self.num_samples(len) * self.num_replicas;
        if total <= len {
            indices.truncate(total);
        } else {
            while indices.len() < total {
                let missing = (total - indices.len()).min(len);
                indices.extend_from_within(..missing);
            }
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}
