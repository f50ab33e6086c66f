//! Pool and pipeline configuration.

use crate::error::ConfigError;
use crate::format::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
use std::num::NonZeroUsize;
use std::thread;

/// Number of workers used when none is configured: the available parallelism
/// reported by the OS, or 1 if it cannot be determined.
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Prefix for worker thread names (`<name>-worker-<index>`).
    pub name: String,
    /// Workers spawned at construction.
    pub workers: usize,
    /// Spawn an extra worker when a task is queued and no worker is idle.
    pub grow_on_demand: bool,
    /// Upper bound on the worker count when growing. `None` means unbounded.
    pub max_workers: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "blockzip".to_owned(),
            workers: default_parallelism(),
            grow_on_demand: false,
            max_workers: None,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enables growth-on-demand, optionally capped at `max_workers`.
    pub fn grow_on_demand(mut self, max_workers: Option<usize>) -> Self {
        self.grow_on_demand = true;
        self.max_workers = max_workers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if let Some(max) = self.max_workers {
            if max < self.workers {
                return Err(ConfigError::WorkerCeiling {
                    initial: self.workers,
                    max,
                });
            }
        }
        Ok(())
    }
}

/// Configuration for a [`Pipeline`](crate::Pipeline) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Uncompressed bytes per block. Only used when compressing; decompression
    /// takes block boundaries from the stream itself.
    pub block_size: usize,
    /// Worker pool created for each run.
    pub pool: PoolConfig,
    /// Cap on blocks buffered in memory at once. Defaults to twice the
    /// initial worker count.
    pub max_in_flight: Option<usize>,
    /// Bytes of block input the run may buffer at once. Turned into an
    /// in-flight limit once the largest block of the stream is known; it
    /// replaces the default limit and tightens an explicit one.
    pub memory_budget: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            pool: PoolConfig::default(),
            max_in_flight: None,
            memory_budget: None,
        }
    }
}

impl PipelineConfig {
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    pub fn grow_on_demand(mut self, max_workers: Option<usize>) -> Self {
        self.pool = self.pool.grow_on_demand(max_workers);
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Admission limit for in-flight blocks, ignoring any memory budget.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight
            .unwrap_or_else(|| self.pool.workers.saturating_mul(2))
    }

    /// Admission limit for a stream whose largest block is `largest_block`
    /// bytes. Never below 1.
    pub fn in_flight_for(&self, largest_block: usize) -> usize {
        let Some(budget) = self.memory_budget else {
            return self.in_flight_limit();
        };
        let by_budget = (budget / largest_block.max(1)).max(1);
        match self.max_in_flight {
            Some(limit) => limit.min(by_budget),
            None => by_budget,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSize {
                got: self.block_size,
                max: MAX_BLOCK_SIZE,
            });
        }
        if self.in_flight_limit() == 0 {
            return Err(ConfigError::NoInFlight);
        }
        Ok(())
    }
}
