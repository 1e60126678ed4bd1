//! The `Loader` orchestrator: registers named sources, fans `load`/`put`
//! out to them, drives `run` across the whole registry, and shapes reads
//! through a [`GetPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{MisuseError, ResolveError, SourceError};
use crate::key::{DynKey, DynValue};
use crate::policy::{GetOutcome, GetPolicy};
use crate::runner::{self, Unit};
use crate::source::Source;
use crate::telemetry::RunSpan;

const DEFAULT_TIMEOUT_FLOOR: Duration = Duration::from_secs(15);

/// Recognized `Loader::new` options.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    pub timeout: Option<Duration>,
    pub get_policy: GetPolicy,
}

impl LoaderOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn get_policy(mut self, policy: GetPolicy) -> Self {
        self.get_policy = policy;
        self
    }
}

/// A registered source plus the sticky error a failed `run` leaves behind.
/// Wrapped in a mutex so a source can be handed to a spawned task during
/// `run` and handed back regardless of how that task exits; `Loader::run`
/// takes `&mut self`, so there is never real external contention on the
/// lock.
struct SourceEntry {
    source: Box<dyn Source>,
    last_run_error: Option<SourceError>,
}

/// Registers named sources and coalesces `load`/`put`/`run`/`get` across
/// them.
pub struct Loader {
    sources: HashMap<String, Arc<Mutex<SourceEntry>>>,
    options: LoaderOptions,
}

impl Loader {
    pub fn new(options: LoaderOptions) -> Self {
        Loader {
            sources: HashMap::new(),
            options,
        }
    }

    /// Registers `source` under `name`, overwriting any existing source of
    /// that name.
    pub fn add_source(&mut self, name: impl Into<String>, source: impl Source + 'static) {
        self.sources.insert(
            name.into(),
            Arc::new(Mutex::new(SourceEntry {
                source: Box::new(source),
                last_run_error: None,
            })),
        );
    }

    fn entry(&self, name: &str) -> Result<Arc<Mutex<SourceEntry>>, MisuseError> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| MisuseError::UnknownSource { name: name.to_string() })
    }

    /// Uncontended by construction: `load`/`put`/`get` only run while no
    /// `run()` call is in flight, since `run` holds `&mut self`.
    fn lock_now(entry: &Mutex<SourceEntry>) -> tokio::sync::MutexGuard<'_, SourceEntry> {
        entry
            .try_lock()
            .expect("a loader's sources are never locked outside of run()")
    }

    /// Returns the sticky error a failed `run` left behind, if the named
    /// source hasn't had a later successful `run` since.
    fn check_usable(name: &str, guard: &SourceEntry) -> Result<(), MisuseError> {
        match &guard.last_run_error {
            Some(error) => Err(MisuseError::SourceUnusable {
                name: name.to_string(),
                source: error.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Enqueues a single `(batch, item)` pair under the named source.
    pub fn load(&mut self, name: &str, batch: DynKey, item: DynKey) -> Result<(), MisuseError> {
        let entry = self.entry(name)?;
        let mut guard = Self::lock_now(&entry);
        Self::check_usable(name, &guard)?;
        guard.source.load(batch, item)
    }

    /// Enqueues `(batch, item)` for every item in `items`.
    pub fn load_many(
        &mut self,
        name: &str,
        batch: DynKey,
        items: impl IntoIterator<Item = DynKey>,
    ) -> Result<(), MisuseError> {
        let entry = self.entry(name)?;
        let mut guard = Self::lock_now(&entry);
        Self::check_usable(name, &guard)?;
        for item in items {
            guard.source.load(batch.clone(), item)?;
        }
        Ok(())
    }

    /// Warms the cache for `(batch, item)` under the named source without
    /// queuing a fetch.
    pub fn put(&mut self, name: &str, batch: DynKey, item: DynKey, value: DynValue) -> Result<(), MisuseError> {
        let entry = self.entry(name)?;
        let mut guard = Self::lock_now(&entry);
        Self::check_usable(name, &guard)?;
        guard.source.put(batch, item, value)
    }

    pub fn pending_batches(&self) -> bool {
        self.sources
            .values()
            .any(|entry| Self::lock_now(entry).source.pending_batches())
    }

    fn default_timeout(&self) -> Duration {
        self.options.timeout.unwrap_or_else(|| {
            self.sources
                .values()
                .filter_map(|entry| Self::lock_now(entry).source.timeout())
                .max()
                .map(|longest| longest + Duration::from_secs(1))
                .unwrap_or(DEFAULT_TIMEOUT_FLOOR)
        })
    }

    /// Runs every source with pending batches, partitioning them into an
    /// `async? = true` group driven concurrently by the runner and a
    /// sequential group run one at a time in this call's own context.
    pub async fn run(&mut self) {
        if !self.pending_batches() {
            return;
        }

        let timeout = self.default_timeout();
        let _span = RunSpan::run(self.sources.len());

        let mut async_names = Vec::new();
        let mut sequential_names = Vec::new();
        for (name, entry) in &self.sources {
            let guard = Self::lock_now(entry);
            if !guard.source.pending_batches() {
                continue;
            }
            if guard.source.is_async() {
                async_names.push(name.clone());
            } else {
                sequential_names.push(name.clone());
            }
        }

        if !async_names.is_empty() {
            let units = async_names
                .iter()
                .map(|name| {
                    let entry = Arc::clone(&self.sources[name]);
                    Unit::new(name.clone(), timeout, async move {
                        let mut guard = entry.lock().await;
                        guard.source.run().await;
                        guard.last_run_error = None;
                    })
                })
                .collect();

            let outcomes = runner::run_units(units, async_names.len()).await;
            for (name, outcome) in outcomes {
                if let Err(error) = outcome {
                    if let Some(entry) = self.sources.get(&name) {
                        Self::lock_now(entry).last_run_error = Some(error);
                    }
                }
            }
        }

        for name in sequential_names {
            let entry = Arc::clone(&self.sources[&name]);
            let mut guard = entry.lock().await;
            match runner::run_one(timeout, guard.source.run()).await {
                Ok(()) => guard.last_run_error = None,
                Err(error) => guard.last_run_error = Some(error),
            }
        }
    }

    /// Reads one previously resolved item, shaped by [`GetPolicy`].
    pub fn get(&self, name: &str, batch: &DynKey, item: &DynKey) -> Result<GetOutcome<DynValue>, MisuseError> {
        let entry = self.entry(name)?;
        let guard = Self::lock_now(&entry);

        let result: Result<DynValue, ResolveError> = match &guard.last_run_error {
            Some(error) => Err(error.clone().into()),
            None => guard.source.fetch(batch, item),
        };
        Ok(self.options.get_policy.apply(result))
    }

    /// `get` applied element-wise, preserving input order.
    pub fn get_many(
        &self,
        name: &str,
        batch: &DynKey,
        items: impl IntoIterator<Item = DynKey>,
    ) -> Result<Vec<GetOutcome<DynValue>>, MisuseError> {
        items.into_iter().map(|item| self.get(name, batch, &item)).collect()
    }
}
