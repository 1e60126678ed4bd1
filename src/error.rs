//! Error taxonomy: lookup failures, source-level run failures, caller
//! misuse, and relational-source-specific failures, collapsed into the
//! caller-facing [`GetFailure`] shape.

use std::fmt;
use std::sync::Arc;

/// Reading an item that was never (successfully) loaded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LookupError {
    /// The batch was never loaded at all.
    #[error("unable to find batch {batch_key:?}")]
    BatchNotFound { batch_key: String },

    /// The batch was loaded, but this particular item wasn't part of it.
    #[error("unable to find item {item_key:?} in batch {batch_key:?}")]
    ItemNotFound { batch_key: String, item_key: String },
}

/// A source-level failure raised while running a batch (or the whole
/// source). Stored in place of a per-item result; every item under the
/// failed batch (or source) reads as this error until a later successful
/// `run` supersedes it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The source's `run` exceeded its deadline and was forcibly torn down.
    #[error("source run timed out")]
    Timeout,

    /// The source's `run` was cancelled by the caller abandoning the
    /// enclosing `Loader::run`.
    #[error("source run was cancelled")]
    Cancelled,

    /// The source's `run` failed (a backend error, a panic caught by the
    /// runner, or an explicit failure from user-supplied callbacks).
    #[error("source run failed: {0}")]
    Failed(Arc<str>),
}

impl SourceError {
    pub fn failed(message: impl fmt::Display) -> Self {
        SourceError::Failed(Arc::from(message.to_string()))
    }
}

/// Caller misuse detected synchronously, at the call site, rather than
/// deferred to `run`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MisuseError {
    #[error("no source registered under the name {name:?}")]
    UnknownSource { name: String },

    #[error(
        "batch key for column {column:?} is not the primary key; an explicit cardinality is required"
    )]
    CardinalityRequired { column: String },

    #[error("expected a parent record, got {found}")]
    NotARecord { found: String },

    #[error("queryable {queryable:?} is not backed by a schema")]
    NotASchema { queryable: String },

    /// The named source's last `run` failed and hasn't been superseded by a
    /// later successful one; `load`/`put`/`get` against it read as this
    /// sentinel instead of reaching the stale underlying source.
    #[error("source {name:?} is unusable after a failed run: {source}")]
    SourceUnusable { name: String, source: SourceError },
}

/// Relational-source-specific failures that don't fit the generic
/// taxonomy above.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelationalError {
    /// `cardinality = one` matched more than one row.
    #[error("expected at most one result for {batch_key:?}, got {count}")]
    MultipleResults { batch_key: String, count: usize },

    /// Coercing an input through the column's declared type failed.
    #[error("failed to coerce input {input:?} for column {column:?}: {reason}")]
    Coercion {
        column: String,
        input: String,
        reason: String,
    },

    #[error("unknown association {field:?} on schema {schema:?}")]
    UnknownAssociation { schema: String, field: String },
}

/// The caller-visible failure shape under [`GetPolicy::RaiseOnError`](crate::policy::GetPolicy::RaiseOnError).
#[derive(Debug, Clone, thiserror::Error)]
pub enum GetFailure {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Relational(#[from] RelationalError),

    #[error(transparent)]
    Misuse(#[from] MisuseError),
}

/// Internal representation of a resolved item: either a value or one of
/// the failure kinds above, collapsed to a single error type so sources
/// don't need to distinguish lookup vs. source-level failure in their
/// `results` table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Relational(#[from] RelationalError),

    #[error(transparent)]
    Misuse(#[from] MisuseError),
}

impl From<ResolveError> for GetFailure {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::Lookup(e) => GetFailure::Lookup(e),
            ResolveError::Source(e) => GetFailure::Source(e),
            ResolveError::Relational(e) => GetFailure::Relational(e),
            ResolveError::Misuse(e) => GetFailure::Misuse(e),
        }
    }
}
