//! Bounded-concurrency execution of independent units with per-unit
//! timeouts and supervised teardown.
//!
//! Used from two sites: the loader orchestrator running multiple sources
//! concurrently, and each source running its own internal batches
//! concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::SourceError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// One independent unit of work submitted to the runner, keyed by an
/// identity the caller uses to recover which unit a result belongs to.
pub(crate) struct Unit<T> {
    pub key: String,
    pub timeout: Duration,
    pub future: BoxFuture<T>,
}

impl<T> Unit<T> {
    pub(crate) fn new(
        key: impl Into<String>,
        timeout: Duration,
        future: impl Future<Output = T> + Send + 'static,
    ) -> Self {
        Unit {
            key: key.into(),
            timeout,
            future: Box::pin(future),
        }
    }
}

/// Spawns every unit immediately (cooperative parallelism: each runs on its
/// own task), bounds how many may be concurrently *executing their future*
/// (not merely queued) via a semaphore, and enforces each unit's own
/// timeout. A single unit panicking, timing out, or being cancelled never
/// prevents the rest from completing and is reported as a `SourceError`
/// for that unit alone.
///
/// If this function's own future is dropped before completion (the caller
/// abandoned the run), every still-running unit is aborted promptly: the
/// join handles are held behind a guard whose `Drop` calls
/// [`JoinHandle::abort`] on anything not yet finished.
pub(crate) async fn run_units<T>(
    units: Vec<Unit<T>>,
    max_concurrency: usize,
) -> HashMap<String, Result<T, SourceError>>
where
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut guard = HandleGuard(Vec::with_capacity(units.len()));

    for unit in units {
        let semaphore = Arc::clone(&semaphore);
        let Unit {
            key,
            timeout,
            future,
        } = unit;

        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("runner semaphore is never closed");
            tokio::time::timeout(timeout, future).await
        });
        guard.0.push((key, handle));
    }

    let mut results = HashMap::with_capacity(guard.0.len());
    for (key, handle) in guard.0.drain(..) {
        let outcome = match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_elapsed)) => Err(SourceError::Timeout),
            Err(join_error) if join_error.is_cancelled() => Err(SourceError::Cancelled),
            Err(join_error) => Err(SourceError::failed(join_error)),
        };
        results.insert(key, outcome);
    }

    results
}

/// Runs a single unit under its own timeout, for the sequential
/// (`async? = false`) path, where the unit runs in the caller's own
/// context rather than a spawned task.
pub(crate) async fn run_one<T>(timeout: Duration, future: impl Future<Output = T>) -> Result<T, SourceError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_elapsed| SourceError::Timeout)
}

struct HandleGuard<T>(Vec<(String, JoinHandle<T>)>);

impl<T> Drop for HandleGuard<T> {
    fn drop(&mut self) {
        for (_, handle) in &self.0 {
            handle.abort();
        }
    }
}
