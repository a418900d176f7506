use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, warn};

use crate::domain::SceneId;
use crate::error::TerraError;

/// Bounded pool for per-scene stage work. A single worker runs tasks inline
/// on the calling thread, in order.
pub struct WorkerPool {
    workers: usize,
    pool: Option<ThreadPool>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, TerraError> {
        let workers = workers.max(1);
        let pool = if workers == 1 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|idx| format!("terra-worker-{idx}"))
                    .build()
                    .map_err(|err| TerraError::ConfigInvalid(format!("worker pool: {err}")))?,
            )
        };
        Ok(Self { workers, pool })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Applies `task` to every item. Results come back in input order.
    pub fn run<T, R, F>(&self, items: Vec<T>, task: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        match &self.pool {
            None => items.into_iter().map(task).collect(),
            Some(pool) => pool.install(|| items.into_par_iter().map(task).collect()),
        }
    }

    /// Runs one stage task per scene. A task that panics is reported as a
    /// [`TerraError::WorkerPanic`] for its scene; the rest of the batch
    /// carries on.
    pub fn run_scenes<T, O, K, F>(
        &self,
        items: Vec<T>,
        key: K,
        task: F,
    ) -> Vec<(SceneId, Result<O, TerraError>)>
    where
        T: Send,
        O: Send,
        K: Fn(&T) -> SceneId + Send + Sync,
        F: Fn(T) -> Result<O, TerraError> + Send + Sync,
    {
        self.run(items, |item| {
            let scene = key(&item);
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(item))).unwrap_or_else(|payload| {
                Err(TerraError::WorkerPanic {
                    scene,
                    message: panic_message(payload.as_ref()),
                })
            });
            (scene, result)
        })
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Folds per-scene results into a report. Ordinary errors count as
    /// failures; the first invariant violation is returned instead, after
    /// every result has been logged.
    pub fn from_results<O, F>(
        stage: &str,
        results: Vec<(SceneId, Result<O, TerraError>)>,
        status: F,
    ) -> Result<Self, TerraError>
    where
        F: Fn(&O) -> ItemStatus,
    {
        let mut report = BatchReport::default();
        let mut fatal = None;
        for (id, result) in results {
            match result {
                Ok(outcome) => match status(&outcome) {
                    ItemStatus::Succeeded => report.record_success(),
                    ItemStatus::Failed => report.record_failure(),
                    ItemStatus::Skipped => report.record_skip(),
                },
                Err(err) if err.is_invariant() => {
                    error!(stage, scene = id, error = %err, "catalog invariant violated");
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    warn!(stage, scene = id, error = %err, "scene failed");
                    report.record_failure();
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}
