//! Batch ordering for single-process and distributed runs.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

use crate::error::{DistillError, DistillResult};

/// How the run is spread over devices and processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One process, one device.
    Single,
    /// One process replicating the student over several local devices.
    DataParallel { devices: usize },
    /// One process per device; `rank` indexes this process.
    Distributed { rank: usize, world_size: usize },
}

impl ExecutionMode {
    /// Derive the mode from the launcher's rank and the visible device count.
    ///
    /// `local_rank` is `None` outside a distributed launch.
    pub fn resolve(local_rank: Option<usize>, world_size: usize, visible_devices: usize) -> DistillResult<Self> {
        match local_rank {
            Some(rank) => {
                if rank >= world_size {
                    return Err(DistillError::Configuration(format!(
                        "local rank {rank} must be smaller than world size {world_size}"
                    )));
                }
                Ok(ExecutionMode::Distributed { rank, world_size })
            }
            None if visible_devices > 1 => Ok(ExecutionMode::DataParallel { devices: visible_devices }),
            None => Ok(ExecutionMode::Single),
        }
    }

    /// Processes sharing the optimisation; total steps are divided by this.
    pub fn world_size(&self) -> usize {
        match self {
            ExecutionMode::Distributed { world_size, .. } => *world_size,
            _ => 1,
        }
    }

    /// Device replicas inside this process.
    pub fn replicas(&self) -> usize {
        match self {
            ExecutionMode::DataParallel { devices } => *devices,
            _ => 1,
        }
    }

    /// Check the mode against a student's ability to average gradients.
    ///
    /// Sharding over several processes without averaging trains independent
    /// replicas and is rejected; local replication falls back to one device.
    pub fn settle(self, gradient_sync: bool) -> DistillResult<Self> {
        if gradient_sync {
            return Ok(self);
        }
        match self {
            ExecutionMode::Distributed { world_size, .. } if world_size > 1 => {
                Err(DistillError::Configuration(format!(
                    "distributed training over {world_size} processes needs a student that synchronises gradients"
                )))
            }
            ExecutionMode::DataParallel { .. } => {
                warn!(
                    replicas = self.replicas(),
                    "Student cannot synchronise gradients across devices, training on a single device"
                );
                Ok(ExecutionMode::Single)
            }
            other => Ok(other),
        }
    }

    /// Whether this process writes checkpoints and logs summaries.
    pub fn is_primary(&self) -> bool {
        match self {
            ExecutionMode::Distributed { rank, .. } => *rank == 0,
            _ => true,
        }
    }

    pub fn sampler(&self, seed: u64) -> Sampler {
        match *self {
            ExecutionMode::Distributed { rank, world_size } => Sampler::Distributed { rank, world_size, seed },
            _ => Sampler::Random { seed },
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Single => write!(f, "single"),
            ExecutionMode::DataParallel { devices } => write!(f, "data-parallel x{devices}"),
            ExecutionMode::Distributed { rank, world_size } => write!(f, "distributed {rank}/{world_size}"),
        }
    }
}

/// Produces the example order for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    Sequential,
    /// Fresh permutation per epoch, seeded by `seed + epoch`.
    Random { seed: u64 },
    /// Shared shuffle, padded to a multiple of `world_size`, strided by `rank`.
    Distributed { rank: usize, world_size: usize, seed: u64 },
}

impl Sampler {
    pub fn indices(&self, len: usize, epoch: usize) -> Vec<usize> {
        match *self {
            Sampler::Sequential => (0..len).collect(),
            Sampler::Random { seed } => shuffled(len, seed.wrapping_add(epoch as u64)),
            Sampler::Distributed { rank, world_size, seed } => {
                if len == 0 {
                    return Vec::new();
                }
                let mut order = shuffled(len, seed.wrapping_add(epoch as u64));
                let per_rank = len.div_ceil(world_size);
                let padded = per_rank * world_size;
                let mut i = 0;
                while order.len() < padded {
                    order.push(order[i]);
                    i += 1;
                }
                order.into_iter().skip(rank).step_by(world_size).collect()
            }
        }
    }

    /// Examples this process sees per epoch.
    pub fn epoch_len(&self, len: usize) -> usize {
        match *self {
            Sampler::Distributed { world_size, .. } => len.div_ceil(world_size),
            _ => len,
        }
    }
}

fn shuffled(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    order
}
