//! Background worker that runs scheduled flushes.
//!
//! Flushes block on SQLite, so they go to the blocking pool of a small
//! tokio runtime the worker owns. The runtime lives exactly as long as the
//! worker, whatever runtime the storage was opened from.

use log::info;
use tokio::runtime::{Builder, Runtime};

use crate::error::Result;

pub struct FlushWorker {
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for FlushWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushWorker")
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

impl FlushWorker {
    /// Start the dedicated flush runtime.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("offline-storage-flush")
            .build()?;
        info!("Started dedicated flush worker runtime");

        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Run `job` on the worker without waiting for it.
    ///
    /// A job the runtime never gets to run is dropped, so anything it
    /// captures is dropped as well.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.runtime.as_ref() {
            Some(runtime) => drop(runtime.spawn_blocking(job)),
            None => drop(job),
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // A plain drop panics when it happens inside an async context
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_worker_runs_jobs() {
        let worker = FlushWorker::new().unwrap();
        let (tx, rx) = mpsc::channel();
        worker.spawn(move || {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("offline-storage-flush"));
    }

    #[test]
    fn test_worker_outlives_the_runtime_it_was_created_in() {
        let rt = Builder::new_current_thread().build().unwrap();
        let worker = rt.block_on(async { FlushWorker::new() }).unwrap();
        rt.shutdown_timeout(Duration::from_secs(1));

        let (tx, rx) = mpsc::channel();
        worker.spawn(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
