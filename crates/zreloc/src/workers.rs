//! Worker Pool - Relocation Worker Threads
//!
//! A fixed number of named worker threads run one task concurrently and are
//! joined before `run_concurrent` returns. Threads are scoped, so the task may
//! borrow the relocation set and the orchestrator directly.

use crate::error::{RelocError, Result};

/// WorkerPool - fixed-size pool of relocation workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    nworkers: usize,
}

impl WorkerPool {
    /// Create a pool; at least one worker is always used
    pub fn new(nworkers: usize) -> Self {
        Self {
            nworkers: nworkers.max(1),
        }
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    /// Run `task(worker_id)` on every worker and wait for all of them
    ///
    /// # Returns
    /// - `ResourceExhausted` if a thread could not be spawned
    /// - `Internal` if a worker panicked
    pub fn run_concurrent<F>(&self, task: F) -> Result<()>
    where
        F: Fn(usize) + Sync,
    {
        let task = &task;

        let scoped = crossbeam::thread::scope(|s| -> Result<()> {
            let mut handles = Vec::with_capacity(self.nworkers);

            for id in 0..self.nworkers {
                let handle = s
                    .builder()
                    .name(format!("reloc-worker-{}", id))
                    .spawn(move |_| task(id))
                    .map_err(|e| RelocError::ResourceExhausted {
                        resource: format!("relocation worker thread {}: {}", id, e),
                    })?;
                handles.push(handle);
            }

            for (id, handle) in handles.into_iter().enumerate() {
                handle
                    .join()
                    .map_err(|_| RelocError::Internal(format!("reloc-worker-{} panicked", id)))?;
            }

            Ok(())
        });

        match scoped {
            Ok(result) => result,
            Err(_) => Err(RelocError::Internal(
                "relocation worker panicked".to_string(),
            )),
        }
    }
}
