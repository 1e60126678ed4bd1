//! The source capability contract every backend implements: load/put/run/
//! fetch plus the bookkeeping a [`Loader`](crate::Loader) needs to schedule
//! and read from it. Made object-safe via [`DynKey`]/[`DynValue`] so one
//! loader can hold differently-typed sources side by side.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MisuseError, ResolveError};
use crate::key::{DynKey, DynValue};

/// A named backend adapter a [`Loader`](crate::Loader) can register.
///
/// Implementations keep their own `batches`/`results` state internally
/// (see [`crate::batch_table::BatchTable`] for a ready-made helper) and
/// expose it only through this trait. `run` must be safe to call when
/// [`pending_batches`](Source::pending_batches) is `false`: it is then a
/// no-op, equal to identity.
#[async_trait]
pub trait Source: Send + Sync {
    /// Queues `item` under `batch` unless it's already resolved `{ok, _}`.
    /// Idempotent and commutative with respect to the eventual item set
    /// per batch.
    ///
    /// Fails synchronously (not deferred to `run`) on call-site misuse: an
    /// unrecognized batch-key shape, a non-primary-key column without an
    /// explicit cardinality, or similar.
    fn load(&mut self, batch: DynKey, item: DynKey) -> Result<(), MisuseError>;

    /// Warms the cache directly, without queuing a fetch.
    fn put(&mut self, batch: DynKey, item: DynKey, value: DynValue) -> Result<(), MisuseError>;

    /// Drains every pending batch and executes the necessary bulk
    /// fetch(es), writing `results` and emptying `batches`. Per-batch (or
    /// per-item) failures are captured internally rather than returned:
    /// only a runner-level abort (timeout, cancellation, panic) escapes
    /// this call, and that's handled by whatever drives `run`, not by
    /// `run` itself.
    async fn run(&mut self);

    /// Reads a previously resolved item.
    fn fetch(&self, batch: &DynKey, item: &DynKey) -> Result<DynValue, ResolveError>;

    /// True if any batch has unresolved items.
    fn pending_batches(&self) -> bool;

    /// This source's own timeout, if set.
    fn timeout(&self) -> Option<Duration>;

    /// Whether this source may run concurrently with siblings during a
    /// `Loader::run`. Sources that need store-side transactional affinity
    /// should return `false` and run sequentially in the caller's context.
    fn is_async(&self) -> bool;
}
