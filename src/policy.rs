//! Read-time result shaping.

use crate::error::{GetFailure, ResolveError};

/// How [`Loader::get`](crate::Loader::get) shapes a resolved
/// `Result<DynValue, ResolveError>` into what the caller sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetPolicy {
    /// `Ok(v) -> v`, `Err(e) -> Err(GetFailure)`. The default.
    #[default]
    RaiseOnError,

    /// `Ok(v) -> Some(v)`, `Err(_) -> None`.
    ReturnNilOnError,

    /// Pass the `Result` through unchanged.
    Tuples,
}

/// The shape [`Loader::get`](crate::Loader::get) returns under a given
/// [`GetPolicy`]. Policies agree on successful reads and disagree only on
/// failure shape.
#[derive(Debug, Clone)]
pub enum GetOutcome<T> {
    Raised(Result<T, GetFailure>),
    Nilled(Option<T>),
    Tupled(Result<T, GetFailure>),
}

impl GetPolicy {
    pub(crate) fn apply<T>(self, result: Result<T, ResolveError>) -> GetOutcome<T> {
        match self {
            GetPolicy::RaiseOnError => GetOutcome::Raised(result.map_err(GetFailure::from)),
            GetPolicy::ReturnNilOnError => GetOutcome::Nilled(result.ok()),
            GetPolicy::Tuples => GetOutcome::Tupled(result.map_err(GetFailure::from)),
        }
    }
}

impl<T> GetOutcome<T> {
    /// Unwrap the outcome, panicking with the underlying error under
    /// [`GetPolicy::RaiseOnError`] or [`GetPolicy::Tuples`]. Intended for
    /// callers that already know which policy their loader uses.
    pub fn into_raised(self) -> Result<T, GetFailure> {
        match self {
            GetOutcome::Raised(r) | GetOutcome::Tupled(r) => r,
            GetOutcome::Nilled(v) => v.ok_or_else(|| {
                GetFailure::Lookup(crate::error::LookupError::ItemNotFound {
                    batch_key: "<nilled>".into(),
                    item_key: "<nilled>".into(),
                })
            }),
        }
    }

    pub fn into_nilled(self) -> Option<T> {
        match self {
            GetOutcome::Raised(r) | GetOutcome::Tupled(r) => r.ok(),
            GetOutcome::Nilled(v) => v,
        }
    }
}
