//src/filter/pool.rs

use crate::error::{CurateError, Result};

/// A unit of work handed to a pool. Jobs report back over a channel, so
/// they return nothing.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded set of workers. The scheduler never has more than `width()`
/// jobs outstanding.
pub trait JobPool {
    fn width(&self) -> usize;

    /// Runs `job` eventually, unless the pool has been shut down. A pool
    /// that drops a job unrun makes the scheduler fail with
    /// `DataIntegrity` once nothing else is left to submit.
    fn submit(&mut self, job: Job);

    /// Stops accepting work and returns without waiting for running jobs.
    fn shutdown(self)
    where
        Self: Sized;
}

/// Worker pool backed by a dedicated rayon thread pool.
pub struct RayonJobPool {
    pool: rayon::ThreadPool,
    width: usize,
}

impl RayonJobPool {
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(CurateError::Configuration("worker pool needs at least one thread".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("filter-worker-{i}"))
            .build()
            .map_err(|e| CurateError::Configuration(e.to_string()))?;
        Ok(Self { pool, width: threads })
    }
}

impl JobPool for RayonJobPool {
    fn width(&self) -> usize {
        self.width
    }

    fn submit(&mut self, job: Job) {
        self.pool.spawn(job);
    }

    fn shutdown(self) {
        // Dropping a rayon pool signals its threads to exit once idle; it
        // does not block the caller.
        drop(self.pool);
    }
}
