//! The `batches`/`results` state machine shared by every reference source:
//! a per-batch-key set of pending items plus a per-batch-key outcome table,
//! rather than one flat key/value cache.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;

use crate::error::{LookupError, ResolveError, SourceError};

/// The outcome of running one batch: either a per-item breakdown, or a
/// single failure that applies to every item queued under that batch.
#[derive(Debug, Clone)]
enum BatchOutcome<I, V> {
    Items(HashMap<I, Result<V, ResolveError>>),
    Failed(SourceError),
}

/// `nothing -> queued -> resolved(ok|error)`, per `(batch_key, item_key)`.
pub(crate) struct BatchTable<K, I, V> {
    batches: HashMap<K, HashSet<I>>,
    results: HashMap<K, BatchOutcome<I, V>>,
}

impl<K, I, V> Default for BatchTable<K, I, V> {
    fn default() -> Self {
        BatchTable {
            batches: HashMap::new(),
            results: HashMap::new(),
        }
    }
}

impl<K, I, V> BatchTable<K, I, V>
where
    K: Eq + Hash + Clone + Debug,
    I: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// `load(k)`: queues the item unless it's already resolved `{ok, _}`.
    /// An item whose last result was an error is re-queued.
    pub(crate) fn load(&mut self, batch: K, item: I) {
        let already_ok = match self.results.get(&batch) {
            Some(BatchOutcome::Items(items)) => matches!(items.get(&item), Some(Ok(_))),
            Some(BatchOutcome::Failed(_)) => false,
            None => false,
        };
        if already_ok {
            return;
        }
        self.batches.entry(batch).or_default().insert(item);
    }

    /// `put(k, v)`: warms the cache directly, last-writer-wins against any
    /// later `run` for the same key.
    pub(crate) fn put(&mut self, batch: K, item: I, value: V) {
        match self.results.entry(batch).or_insert_with(|| BatchOutcome::Items(HashMap::new())) {
            BatchOutcome::Items(items) => {
                items.insert(item, Ok(value));
            }
            failed @ BatchOutcome::Failed(_) => {
                let mut items = HashMap::new();
                items.insert(item, Ok(value));
                *failed = BatchOutcome::Items(items);
            }
        }
    }

    pub(crate) fn pending_batches(&self) -> bool {
        self.batches.values().any(|items| !items.is_empty())
    }

    /// Drains every pending batch, handing ownership of the queued item
    /// sets to the caller so it can execute bulk fetches, and empties
    /// `batches`.
    pub(crate) fn drain_batches(&mut self) -> HashMap<K, HashSet<I>> {
        mem::take(&mut self.batches)
    }

    /// Records a full per-item breakdown for a batch, merging into any
    /// values already present (e.g. from a concurrent `put`).
    pub(crate) fn store_items(&mut self, batch: K, items: HashMap<I, Result<V, ResolveError>>) {
        match self.results.entry(batch).or_insert_with(|| BatchOutcome::Items(HashMap::new())) {
            BatchOutcome::Items(existing) => existing.extend(items),
            failed @ BatchOutcome::Failed(_) => *failed = BatchOutcome::Items(items),
        }
    }

    /// Records a whole-batch failure.
    pub(crate) fn store_failed(&mut self, batch: K, error: SourceError) {
        self.results.insert(batch, BatchOutcome::Failed(error));
    }

    /// Looks up a resolved item within a known batch.
    pub(crate) fn fetch(&self, batch: &K, item: &I) -> Result<V, ResolveError> {
        match self.results.get(batch) {
            None => Err(LookupError::BatchNotFound {
                batch_key: format!("{batch:?}"),
            }
            .into()),
            Some(BatchOutcome::Failed(error)) => Err(error.clone().into()),
            Some(BatchOutcome::Items(items)) => match items.get(item) {
                None => Err(LookupError::ItemNotFound {
                    batch_key: format!("{batch:?}"),
                    item_key: format!("{item:?}"),
                }
                .into()),
                Some(result) => result.clone(),
            },
        }
    }
}
