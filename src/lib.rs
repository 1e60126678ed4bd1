//! Batch and cache data lookups behind a request-coalescing loader. The
//! main motivation for this library is the "N + 1" query problem seen in
//! GraphQL and elsewhere. This library takes heavy influence from the
//! GraphQL Foundation's [DataLoader](https://github.com/graphql/dataloader)
//! and Elixir's [Dataloader](https://github.com/absinthe-graphql/dataloader).
//!
//! The entrypoint is [`Loader`]: register one or more named [`Source`]s,
//! queue `(batch, item)` keys with [`Loader::load`]/[`Loader::load_many`],
//! then call [`Loader::run`] to resolve every pending batch in one pass.
//! [`Loader::get`]/[`Loader::get_many`] read the materialized results,
//! shaped by the loader's configured [`GetPolicy`].
//!
//! Two reference sources ship with the crate: [`sources::kv::KvSource`]
//! wraps a plain async batch function, and
//! [`sources::relational::RelationalSource`] adds schema/association-aware
//! batching (cardinality mapping, `has_many … through …` traversal, a
//! lateral-join strategy for per-parent `limit`/`offset`) over a
//! caller-supplied [`sources::relational::Repo`].

pub(crate) mod batch_table;
pub mod error;
mod key;
pub mod loader;
pub mod policy;
pub(crate) mod runner;
pub mod source;
pub mod sources;
pub(crate) mod telemetry;

pub use error::{GetFailure, LookupError, MisuseError, RelationalError, ResolveError, SourceError};
pub use key::{DynKey, DynValue};
pub use loader::{Loader, LoaderOptions};
pub use policy::{GetOutcome, GetPolicy};
pub use source::Source;
