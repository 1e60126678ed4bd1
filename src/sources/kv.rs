//! The key/value reference source: a generic batch-function backend with
//! per-batch-key deduplication, one fetch call per named batch key within
//! a single source.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::batch_table::BatchTable;
use crate::error::{LookupError, ResolveError, SourceError};
use crate::key::{DynKey, DynValue};
use crate::runner::{self, Unit};
use crate::source::Source;
use crate::telemetry::RunSpan;

/// What a [`FetchFn`] reports back for one invocation: either a per-item
/// breakdown (a value or a per-item failure reason), or a single reason
/// that's broadcast to every item queued in that batch.
pub enum FetchOutcome<I, V> {
    Items(HashMap<I, Result<V, String>>),
    BatchFailed(String),
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// `fetch_fn(batch_key, set_of_item_keys) -> mapping_of_item_key_to_value_or_error`.
/// The whole set of pending keys for a batch is handed over in one call.
pub type FetchFn<B, I, V> =
    Arc<dyn Fn(B, HashSet<I>) -> BoxFuture<FetchOutcome<I, V>> + Send + Sync>;

/// Per-source options recognized by both reference sources.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub timeout: Option<Duration>,
    pub max_concurrency: usize,
    pub is_async: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            timeout: None,
            max_concurrency: default_max_concurrency(),
            is_async: true,
        }
    }
}

pub(crate) fn default_max_concurrency() -> usize {
    2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// A key/value source: the generic batch-function backend.
pub struct KvSource<B, I, V> {
    fetch_fn: FetchFn<B, I, V>,
    table: BatchTable<B, I, V>,
    options: SourceOptions,
}

impl<B, I, V> KvSource<B, I, V>
where
    B: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(fetch_fn: FetchFn<B, I, V>) -> KvSourceBuilder<B, I, V> {
        KvSourceBuilder {
            fetch_fn,
            options: SourceOptions::default(),
        }
    }
}

pub struct KvSourceBuilder<B, I, V> {
    fetch_fn: FetchFn<B, I, V>,
    options: SourceOptions,
}

impl<B, I, V> KvSourceBuilder<B, I, V> {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.options.max_concurrency = max_concurrency;
        self
    }

    pub fn is_async(mut self, is_async: bool) -> Self {
        self.options.is_async = is_async;
        self
    }

    pub fn build(self) -> KvSource<B, I, V> {
        KvSource {
            fetch_fn: self.fetch_fn,
            table: BatchTable::default(),
            options: self.options,
        }
    }
}

#[async_trait]
impl<B, I, V> Source for KvSource<B, I, V>
where
    B: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn load(&mut self, batch: DynKey, item: DynKey) -> Result<(), crate::error::MisuseError> {
        let (Some(batch), Some(item)) = (batch.downcast_ref::<B>().cloned(), item.downcast_ref::<I>().cloned())
        else {
            return Err(crate::error::MisuseError::NotARecord {
                found: "a key of the wrong type for this source".into(),
            });
        };
        self.table.load(batch, item);
        Ok(())
    }

    fn put(&mut self, batch: DynKey, item: DynKey, value: DynValue) -> Result<(), crate::error::MisuseError> {
        let (Some(batch), Some(item), Some(value)) = (
            batch.downcast_ref::<B>().cloned(),
            item.downcast_ref::<I>().cloned(),
            value.downcast_ref::<V>().cloned(),
        ) else {
            return Err(crate::error::MisuseError::NotARecord {
                found: "a key or value of the wrong type for this source".into(),
            });
        };
        self.table.put(batch, item, value);
        Ok(())
    }

    async fn run(&mut self) {
        let drained = self.table.drain_batches();
        if drained.is_empty() {
            return;
        }

        let timeout = self
            .options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(15));

        let mut key_to_batch = HashMap::with_capacity(drained.len());
        let units = drained
            .into_iter()
            .map(|(batch, items)| {
                let fetch_fn = Arc::clone(&self.fetch_fn);
                let key = format!("{batch:?}");
                key_to_batch.insert(key.clone(), batch.clone());
                Unit::new(key, timeout, async move {
                    let _span = RunSpan::batch(&format!("{batch:?}"));
                    (items.clone(), fetch_fn(batch, items).await)
                })
            })
            .collect();

        let outcomes = runner::run_units(units, self.options.max_concurrency).await;

        for (key, outcome) in outcomes {
            let batch = match key_to_batch.remove(&key) {
                Some(batch) => batch,
                None => continue,
            };
            match outcome {
                Ok((requested, FetchOutcome::Items(mut returned))) => {
                    let mut resolved = HashMap::with_capacity(requested.len());
                    for item in requested {
                        let result = match returned.remove(&item) {
                            Some(Ok(value)) => Ok(value),
                            Some(Err(reason)) => {
                                Err(ResolveError::Source(SourceError::failed(reason)))
                            }
                            None => Err(ResolveError::Lookup(LookupError::ItemNotFound {
                                batch_key: format!("{batch:?}"),
                                item_key: format!("{item:?}"),
                            })),
                        };
                        resolved.insert(item, result);
                    }
                    self.table.store_items(batch, resolved);
                }
                Ok((_requested, FetchOutcome::BatchFailed(reason))) => {
                    self.table.store_failed(batch, SourceError::failed(reason));
                }
                Err(runner_error) => {
                    self.table.store_failed(batch, runner_error);
                }
            }
        }
    }

    fn fetch(&self, batch: &DynKey, item: &DynKey) -> Result<DynValue, ResolveError> {
        let batch = batch.downcast_ref::<B>().ok_or_else(|| {
            ResolveError::Lookup(LookupError::BatchNotFound {
                batch_key: "<type mismatch>".into(),
            })
        })?;
        let item = item.downcast_ref::<I>().ok_or_else(|| {
            ResolveError::Lookup(LookupError::ItemNotFound {
                batch_key: format!("{batch:?}"),
                item_key: "<type mismatch>".into(),
            })
        })?;
        self.table.fetch(batch, item).map(DynValue::new)
    }

    fn pending_batches(&self) -> bool {
        self.table.pending_batches()
    }

    fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    fn is_async(&self) -> bool {
        self.options.is_async
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn users_source(
        calls: Arc<AtomicUsize>,
    ) -> KvSource<&'static str, u32, String> {
        KvSource::new(Arc::new(move |batch: &'static str, items: HashSet<u32>| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut out = HashMap::with_capacity(items.len());
                for item in items {
                    out.insert(item, Ok(format!("{batch}-{item}")));
                }
                FetchOutcome::Items(out)
            })
        }))
        .build()
    }

    #[tokio::test]
    async fn a_single_run_serves_every_loaded_item_with_one_fetch_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut source = users_source(Arc::clone(&calls));

        source.load(DynKey::new("users"), DynKey::new(1u32)).unwrap();
        source.load(DynKey::new("users"), DynKey::new(2u32)).unwrap();
        source.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let value = source
            .fetch(&DynKey::new("users"), &DynKey::new(1u32))
            .unwrap();
        assert_eq!(value.downcast::<String>().unwrap(), "users-1");
    }

    #[tokio::test]
    async fn a_timed_out_batch_reports_timeout_for_every_queued_item() {
        let mut source = KvSource::new(Arc::new(|batch: &'static str, items: HashSet<u32>| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut out = HashMap::with_capacity(items.len());
                for item in items {
                    out.insert(item, Ok(format!("{batch}-{item}")));
                }
                FetchOutcome::Items(out)
            })
        }))
        .timeout(Duration::from_millis(1))
        .build();

        source.load(DynKey::new("users"), DynKey::new(1u32)).unwrap();
        source.run().await;

        let err = source
            .fetch(&DynKey::new("users"), &DynKey::new(1u32))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Source(SourceError::Timeout)));
    }

    #[tokio::test]
    async fn put_resolves_an_item_without_a_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut source = users_source(Arc::clone(&calls));

        source.put(DynKey::new("users"), DynKey::new(1u32), DynValue::new("cached".to_string())).unwrap();
        assert!(!source.pending_batches());

        let value = source
            .fetch(&DynKey::new("users"), &DynKey::new(1u32))
            .unwrap();
        assert_eq!(value.downcast::<String>().unwrap(), "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
