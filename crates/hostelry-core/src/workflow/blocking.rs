//! Bounded pool for offloading blocking handler work.
//!
//! The engine's own loop never uses it. Step handlers that must call
//! blocking code reach it through `WorkflowEngine::run_blocking`.

use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum BlockingError {
    #[error("blocking pool is closed")]
    Closed,

    #[error("blocking task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// At most `workers` closures run on the blocking thread pool at once.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Permits not currently held by a running task.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on the blocking pool, waiting for a free worker first.
    pub async fn run<F, T>(&self, f: F) -> Result<T, BlockingError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BlockingError::Closed)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });
        Ok(handle.await?)
    }

    pub fn close(&self) {
        self.permits.close();
    }
}
