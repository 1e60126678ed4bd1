//! The telemetry span contract: four event pairs, always emitted, with no
//! behavior contingent on whether anything is actually subscribed
//! (`tracing`'s whole point).

use std::time::{Instant, SystemTime};
use uuid::Uuid;

/// Emitted around a `Loader::run` call.
pub(crate) fn run_start(id: Uuid, source_count: usize) {
    tracing::debug!(
        name: "source.run.start",
        %id,
        system_time = ?SystemTime::now(),
        source_count,
        "starting loader run",
    );
}

pub(crate) fn run_stop(id: Uuid, duration: std::time::Duration) {
    tracing::debug!(
        name: "source.run.stop",
        %id,
        duration_monotonic = ?duration,
        "finished loader run",
    );
}

/// Emitted around a single per-batch execution inside a source's `run`.
pub(crate) fn batch_run_start(id: Uuid, batch_key: &str) {
    tracing::trace!(
        name: "source.batch.run.start",
        %id,
        system_time = ?SystemTime::now(),
        batch_key,
        "starting batch run",
    );
}

pub(crate) fn batch_run_stop(id: Uuid, duration: std::time::Duration) {
    tracing::trace!(
        name: "source.batch.run.stop",
        %id,
        duration_monotonic = ?duration,
        "finished batch run",
    );
}

/// RAII helper: starts a `source.run.*` or `source.batch.run.*` pair and
/// emits the matching stop event (with elapsed monotonic duration) on drop,
/// regardless of how the scope is exited.
pub(crate) struct RunSpan {
    id: Uuid,
    started: Instant,
    kind: SpanKind,
}

enum SpanKind {
    Run,
    Batch,
}

impl RunSpan {
    pub(crate) fn run(source_count: usize) -> Self {
        let id = Uuid::new_v4();
        run_start(id, source_count);
        RunSpan {
            id,
            started: Instant::now(),
            kind: SpanKind::Run,
        }
    }

    pub(crate) fn batch(batch_key: &str) -> Self {
        let id = Uuid::new_v4();
        batch_run_start(id, batch_key);
        RunSpan {
            id,
            started: Instant::now(),
            kind: SpanKind::Batch,
        }
    }
}

impl Drop for RunSpan {
    fn drop(&mut self) {
        let duration = self.started.elapsed();
        match self.kind {
            SpanKind::Run => run_stop(self.id, duration),
            SpanKind::Batch => batch_run_stop(self.id, duration),
        }
    }
}
