//! Worker pool
//!
//! A small tokio runtime used as the pool that runs blocking transport
//! calls and timers. Async events are completed from these threads.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::error::ClientError;

/// Pool of worker threads backed by a tokio runtime
pub struct Workers {
    runtime: Option<Runtime>,
}

impl Workers {
    /// Build a pool with at most `max_blocking` concurrent blocking calls
    pub fn new(max_blocking: usize) -> Result<Self, ClientError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_blocking.max(1))
            .thread_name("webim-worker")
            .enable_all()
            .build()
            .map_err(|e| ClientError::Runtime(e.to_string()))?;
        debug!("worker pool started (max {} blocking)", max_blocking);
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Run a blocking closure on a worker thread
    pub fn spawn_blocking<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(runtime) = &self.runtime {
            drop(runtime.spawn_blocking(f));
        }
    }

    /// Run `f` on a worker once `delay` has elapsed
    pub fn after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(runtime) = &self.runtime {
            drop(runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                f();
            }));
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        // The last handle may be released on one of our own threads.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
