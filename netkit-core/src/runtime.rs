//! Worker pool running the I/O reactor.
//!
//! netkit components are plain async values: inside an existing tokio runtime
//! they spawn their tasks on it directly. [`WorkerPool`] exists for embedding
//! into synchronous programs: it owns a multi-thread runtime with configurable
//! parallelism and hands out a [`tokio::runtime::Handle`] for components to
//! run on.

use crate::error::{NetResult, NetworkError};

pub struct WorkerPool {
    runtime: tokio::runtime::Runtime,
}

impl WorkerPool {
    /// Builds a pool with `workers` reactor threads (0 selects the host's
    /// available parallelism).
    pub fn new(workers: usize) -> NetResult<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if workers > 0 {
            builder.worker_threads(workers);
        }
        let runtime = builder
            .enable_all()
            .thread_name("netkit-worker")
            .build()
            .map_err(|e| NetworkError::from_io("worker_pool", "build runtime", e))?;
        Ok(Self { runtime })
    }

    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Runs a future to completion on the pool from synchronous code.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Offloads a task onto the pool.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_runs_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        let out = pool.block_on(async {
            let h = pool.spawn(async { 21 * 2 });
            h.await.unwrap()
        });
        assert_eq!(out, 42);
    }
}
