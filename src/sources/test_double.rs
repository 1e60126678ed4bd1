//! `ErrorSource`: a controllable stand-in source used to exercise batching
//! and caching properties without a real backend — it can be told in
//! advance to fail on a specific run, sleep before resolving, or simply
//! record which batches it was asked to run.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::batch_table::BatchTable;
use crate::error::{MisuseError, ResolveError, SourceError};
use crate::key::{DynKey, DynValue};
use crate::source::Source;
use crate::sources::kv::SourceOptions;
use crate::telemetry::RunSpan;

/// A source whose `run` can be told, in advance, exactly how to misbehave:
/// fail on a specific run number, sleep before resolving (for timeout
/// tests), or simply record which batches it was asked to run.
pub struct ErrorSource<B, I, V> {
    table: BatchTable<B, I, V>,
    resolve: Arc<dyn Fn(&B, &I) -> V + Send + Sync>,
    run_count: AtomicUsize,
    fail_on_run: Option<usize>,
    sleep_before_resolving: Option<Duration>,
    batches_seen: Mutex<Vec<B>>,
    options: SourceOptions,
}

impl<B, I, V> ErrorSource<B, I, V>
where
    B: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(resolve: impl Fn(&B, &I) -> V + Send + Sync + 'static) -> ErrorSourceBuilder<B, I, V> {
        ErrorSourceBuilder {
            resolve: Arc::new(resolve),
            fail_on_run: None,
            sleep_before_resolving: None,
            options: SourceOptions::default(),
        }
    }

    /// How many times `run` has executed so far (1-indexed after the first
    /// call returns).
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Every batch key this source has been asked to run, in call order.
    pub fn batches_seen(&self) -> Vec<B> {
        self.batches_seen.lock().expect("batches_seen mutex poisoned").clone()
    }
}

pub struct ErrorSourceBuilder<B, I, V> {
    resolve: Arc<dyn Fn(&B, &I) -> V + Send + Sync>,
    fail_on_run: Option<usize>,
    sleep_before_resolving: Option<Duration>,
    options: SourceOptions,
}

impl<B, I, V> ErrorSourceBuilder<B, I, V> {
    /// Make the `n`th call to `run` (1-indexed) fail as a whole, reporting
    /// `SourceError::Failed` for every batch drained in that call.
    pub fn fail_on_run(mut self, n: usize) -> Self {
        self.fail_on_run = Some(n);
        self
    }

    /// Sleep for `duration` before resolving any batch, useful for
    /// exercising a timeout against a real clock.
    pub fn sleep_before_resolving(mut self, duration: Duration) -> Self {
        self.sleep_before_resolving = Some(duration);
        self
    }

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

    pub fn build(self) -> ErrorSource<B, I, V> {
        ErrorSource {
            table: BatchTable::default(),
            resolve: self.resolve,
            run_count: AtomicUsize::new(0),
            fail_on_run: self.fail_on_run,
            sleep_before_resolving: self.sleep_before_resolving,
            batches_seen: Mutex::new(Vec::new()),
            options: self.options,
        }
    }
}

#[async_trait]
impl<B, I, V> Source for ErrorSource<B, I, V>
where
    B: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn load(&mut self, batch: DynKey, item: DynKey) -> Result<(), MisuseError> {
        let (Some(batch), Some(item)) = (batch.downcast_ref::<B>().cloned(), item.downcast_ref::<I>().cloned())
        else {
            return Err(MisuseError::NotARecord {
                found: "a key of the wrong type for this source".into(),
            });
        };
        self.table.load(batch, item);
        Ok(())
    }

    fn put(&mut self, batch: DynKey, item: DynKey, value: DynValue) -> Result<(), MisuseError> {
        let (Some(batch), Some(item), Some(value)) = (
            batch.downcast_ref::<B>().cloned(),
            item.downcast_ref::<I>().cloned(),
            value.downcast_ref::<V>().cloned(),
        ) else {
            return Err(MisuseError::NotARecord {
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

        let run_number = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        let should_fail = self.fail_on_run == Some(run_number);

        {
            let mut seen = self.batches_seen.lock().expect("batches_seen mutex poisoned");
            seen.extend(drained.keys().cloned());
        }

        if let Some(delay) = self.sleep_before_resolving {
            tokio::time::sleep(delay).await;
        }

        for (batch, items) in drained {
            let _span = RunSpan::batch(&format!("{batch:?}"));
            if should_fail {
                self.table
                    .store_failed(batch, SourceError::failed("error source configured to fail"));
                continue;
            }
            let resolved: HashMap<I, Result<V, ResolveError>> = items
                .into_iter()
                .map(|item| {
                    let value = (self.resolve)(&batch, &item);
                    (item, Ok(value))
                })
                .collect();
            self.table.store_items(batch, resolved);
        }
    }

    fn fetch(&self, batch: &DynKey, item: &DynKey) -> Result<DynValue, ResolveError> {
        let batch = batch.downcast_ref::<B>().ok_or_else(|| {
            crate::error::LookupError::BatchNotFound {
                batch_key: "<type mismatch>".into(),
            }
        })?;
        let item = item.downcast_ref::<I>().ok_or_else(|| {
            crate::error::LookupError::ItemNotFound {
                batch_key: format!("{batch:?}"),
                item_key: "<type mismatch>".into(),
            }
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
