//! O3 engine - worker pool and dispatch
//!
//! Owns a bounded rayon pool. `execute` turns partition jobs into column
//! tasks, spawns them, and blocks the calling (committing) thread until the
//! completion signal is raised.

use std::sync::Arc;

use super::progress::{CommitProgress, PartitionProgress};
use super::task::{CopyTask, PartitionJob};
use crate::config::StoreConfig;
use crate::{Result, StoreError};

pub struct O3Engine {
    pool: rayon::ThreadPool,
    config: StoreConfig,
}

impl O3Engine {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("o3-worker-{}", i))
            .build()
            .map_err(|e| StoreError::WorkerPool(format!("failed to build O3 worker pool: {}", e)))?;
        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Spawn every column task of `jobs` and return the shared progress
    /// without waiting
    pub fn dispatch(&self, jobs: Vec<PartitionJob>) -> Arc<CommitProgress> {
        let commit = CommitProgress::new(jobs.len());
        for job in jobs {
            let columns = job.columns.len();
            log::debug!("dispatching partition {} ({} columns, {} rows)", job.name, columns, job.output_rows);
            let progress = PartitionProgress::new(columns, commit.clone());
            for task in CopyTask::for_partition(job, &self.config, progress) {
                self.pool.spawn(move || task.run());
            }
        }
        commit
    }

    /// Run `jobs` to completion. Fails with the first task error once every
    /// in-flight task has finished.
    pub fn execute(&self, jobs: Vec<PartitionJob>) -> Result<()> {
        let commit = self.dispatch(jobs);
        commit.wait()
    }
}
