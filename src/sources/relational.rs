//! The relational reference source: schema-/association-aware batching with
//! cardinality mapping and a lateral-join strategy for per-parent
//! `limit`/`offset`. The concrete store is out of scope; this module only
//! defines the `Repo` boundary a caller's store adapter implements, keeping
//! query-planning logic separate from the concrete row source and
//! representing rows as a type-erased JSON value so this crate never has to
//! know the caller's schema types.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::batch_table::BatchTable;
use crate::error::{LookupError, MisuseError, RelationalError, ResolveError, SourceError};
use crate::key::{DynKey, DynValue};
use crate::runner::{self, Unit};
use crate::source::Source;
use crate::sources::kv::SourceOptions;
use crate::telemetry::RunSpan;

/// `one` expects at most a single matching row; `many` always returns a
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// The declared type of a schema column, used to coerce item-key inputs
/// before dispatching a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
    Uuid,
    Boolean,
}

impl ColumnKind {
    fn coerce(self, column: &str, input: &JsonValue) -> Result<JsonValue, RelationalError> {
        let fail = |reason: &str| RelationalError::Coercion {
            column: column.to_string(),
            input: input.to_string(),
            reason: reason.to_string(),
        };
        match self {
            ColumnKind::Integer => match input {
                JsonValue::Number(n) if n.is_i64() || n.is_u64() => Ok(input.clone()),
                JsonValue::String(s) => s
                    .parse::<i64>()
                    .map(|n| JsonValue::from(n))
                    .map_err(|_| fail("not a valid integer")),
                _ => Err(fail("expected an integer")),
            },
            ColumnKind::Text => match input {
                JsonValue::String(_) => Ok(input.clone()),
                JsonValue::Number(_) | JsonValue::Bool(_) => Ok(JsonValue::String(input.to_string())),
                _ => Err(fail("expected text")),
            },
            ColumnKind::Uuid => match input {
                JsonValue::String(s) if uuid::Uuid::parse_str(s).is_ok() => Ok(input.clone()),
                _ => Err(fail("expected a UUID string")),
            },
            ColumnKind::Boolean => match input {
                JsonValue::Bool(_) => Ok(input.clone()),
                _ => Err(fail("expected a boolean")),
            },
        }
    }
}

/// A declared association on a [`Schema`].
///
/// For a direct association (`through` empty), `target_schema`/`foreign_key`
/// describe the single hop from this schema to `target_schema` and
/// `preload_association` is called once.
///
/// For a `has_many … through …` chain, `through` names the *entire* chain of
/// association fields to walk, each looked up on the schema reached so far
/// (so the field's own `target_schema`/`cardinality` above describe the
/// overall owner-to-final-target relationship for documentation/validation
/// purposes only; they are not consulted during traversal — each hop's own
/// `AssociationDef` supplies its own `target_schema`/`foreign_key`).
#[derive(Debug, Clone)]
pub struct AssociationDef {
    pub field: String,
    pub target_schema: String,
    pub cardinality: Cardinality,
    /// The column on the *target* schema that references the parent's
    /// primary key.
    pub foreign_key: String,
    /// The full chain of association field names to traverse for a
    /// `has_many … through …` association, each resolved against the
    /// schema reached so far. Empty for a direct association.
    pub through: Vec<String>,
    /// Filters applied when this hop is used as a non-final link in a
    /// `through` chain (the final hop uses the caller's query params
    /// instead).
    pub join_where: Params,
    /// The column on a row returned by *this* hop that carries the key to
    /// look up the next hop, when this association is used as a
    /// non-final link in a `through` chain. Distinct from `foreign_key`
    /// (which always points back to this hop's own parent): for a
    /// many-to-many junction row this is typically the column pointing
    /// *forward* to the next schema (e.g. `tag_id` on a `post_tags` row).
    /// Defaults to the next schema's declared primary key when unset.
    pub through_key: Option<String>,
}

/// A relational schema: primary key, column types (for coercion), and
/// declared associations.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub primary_key: String,
    pub columns: HashMap<String, ColumnKind>,
    pub associations: HashMap<String, AssociationDef>,
}

impl Schema {
    pub fn is_primary_key(&self, column: &str) -> bool {
        column == self.primary_key
    }

    fn column_kind(&self, column: &str) -> ColumnKind {
        self.columns.get(column).copied().unwrap_or(ColumnKind::Text)
    }
}

/// Per-query parameters (`limit`, `offset`, `order_by`, filters, …), merged
/// with a source's `default_params` on ingress. Backed by a `BTreeMap` so
/// key order (and thus canonical serialization for `Eq`/`Hash`) is
/// deterministic; the concrete shape lives with the caller's store, not in
/// this crate.
#[derive(Debug, Clone, Default)]
pub struct Params(pub(crate) std::collections::BTreeMap<String, JsonValue>);

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// `self` wins on key collision: the call-site value takes priority
    /// over a source's `default_params`.
    pub fn merged_over(&self, defaults: &Params) -> Params {
        let mut merged = defaults.0.clone();
        merged.extend(self.0.clone());
        Params(merged)
    }

    pub fn limit(&self) -> Option<i64> {
        self.0.get("limit").and_then(JsonValue::as_i64)
    }

    pub fn offset(&self) -> Option<i64> {
        self.0.get("offset").and_then(JsonValue::as_i64)
    }

    /// Whether this query needs the per-input lateral strategy rather than
    /// a single `WHERE column IN (...)`.
    fn needs_lateral(&self) -> bool {
        self.limit().is_some() || self.offset().is_some()
    }

    fn canonical(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}
impl Eq for Params {}
impl std::hash::Hash for Params {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

/// A single row, type-erased as JSON.
#[derive(Debug, Clone)]
pub struct Record(pub JsonValue);

impl Record {
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }
}

/// A resolved relational value: shaped by the batch key's cardinality.
#[derive(Debug, Clone)]
pub enum RelValue {
    One(Option<Record>),
    Many(Vec<Record>),
}

impl RelValue {
    pub fn into_one(self) -> Option<Record> {
        match self {
            RelValue::One(record) => record,
            RelValue::Many(mut records) => records.pop(),
        }
    }

    pub fn into_many(self) -> Vec<Record> {
        match self {
            RelValue::One(record) => record.into_iter().collect(),
            RelValue::Many(records) => records,
        }
    }
}

/// The sentinel `put` rejects outright: callers use this to represent "this association was never
/// preloaded" without accidentally warming the cache with it.
pub fn not_loaded_sentinel() -> JsonValue {
    JsonValue::String("__not_loaded__".to_string())
}

/// Caller-facing batch key, normalized internally into [`NormalizedBatchKey`].
#[derive(Debug, Clone)]
pub enum BatchKey {
    Association { field: String, params: Params },
    SchemaQuery { cardinality: Cardinality, schema: String, params: Params },
    SchemaShorthand { schema: String, params: Params },
}

// `DynKey` requires `Eq + Hash`; `Params` holds a `JsonValue` map, which has
// no `Hash` impl, so these go through the same canonical-debug-string
// approach the rest of the crate uses for formatting batch keys.
impl PartialEq for BatchKey {
    fn eq(&self, other: &Self) -> bool {
        format!("{self:?}") == format!("{other:?}")
    }
}
impl Eq for BatchKey {}
impl std::hash::Hash for BatchKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        format!("{self:?}").hash(state);
    }
}

/// Caller-facing item key, normalized into a bare [`JsonValue`] (for schema
/// queries, the coerced column value) or a parent [`Record`] (for
/// associations) before being stored.
#[derive(Debug, Clone)]
pub enum RawItemKey {
    /// A single primitive, resolved against the schema's primary key.
    Value(JsonValue),
    /// An explicit `(column, value)` pair.
    Column(String, JsonValue),
    /// The full parent record, for association batch keys.
    Record(Record),
}

impl PartialEq for RawItemKey {
    fn eq(&self, other: &Self) -> bool {
        format!("{self:?}") == format!("{other:?}")
    }
}
impl Eq for RawItemKey {}
impl std::hash::Hash for RawItemKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        format!("{self:?}").hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NormalizedBatchKey {
    SchemaQuery {
        schema: String,
        cardinality: Cardinality,
        column: String,
        params: Params,
    },
    Association {
        schema: String,
        field: String,
        params: Params,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NormalizedItemKey {
    Column(String),
    RecordKey(String),
}

/// The external collaborator that actually talks to the store. The concrete
/// store implementation is out of scope for this crate; callers implement
/// this trait against their own schema and connection pool.
#[async_trait]
pub trait Repo: Send + Sync {
    /// `WHERE column IN (values)`, grouped by the coerced column value
    /// (canonical JSON string) — the non-lateral path.
    async fn query_by_column(
        &self,
        schema: &Schema,
        column: &str,
        values: &[JsonValue],
        params: &Params,
    ) -> Result<HashMap<String, Vec<Record>>, String>;

    /// Same shape as [`query_by_column`](Repo::query_by_column), but the
    /// repo applies `params.limit`/`params.offset` *per input* rather than
    /// globally — the lateral path.
    async fn query_by_column_lateral(
        &self,
        schema: &Schema,
        column: &str,
        values: &[JsonValue],
        params: &Params,
    ) -> Result<HashMap<String, Vec<Record>>, String>;

    /// Preloads one hop of an association for a set of parent primary
    /// keys, grouped by the coerced parent key (canonical JSON string).
    async fn preload_association(
        &self,
        parent_schema: &Schema,
        assoc: &AssociationDef,
        parent_keys: &[JsonValue],
        params: &Params,
        lateral: bool,
    ) -> Result<HashMap<String, Vec<Record>>, String>;
}

/// Per-schema runtime registry plus the `repo` collaborator this source
/// dispatches every query through.
pub struct RelationalSource<R> {
    repo: Arc<R>,
    schemas: HashMap<String, Schema>,
    default_params: Params,
    table: BatchTable<NormalizedBatchKey, NormalizedItemKey, RelValue>,
    /// Raw inputs per normalized `(batch, item)` pair, needed at `run` time
    /// to reconstruct the query (the table only tracks *that* an item is
    /// pending, not its original value).
    inputs: HashMap<NormalizedBatchKey, HashMap<NormalizedItemKey, JsonValue>>,
    options: SourceOptions,
}

impl<R: Repo> RelationalSource<R> {
    pub fn new(repo: R) -> RelationalSourceBuilder<R> {
        RelationalSourceBuilder {
            repo,
            schemas: HashMap::new(),
            default_params: Params::default(),
            options: SourceOptions::default(),
        }
    }

    fn schema(&self, name: &str) -> Result<&Schema, MisuseError> {
        self.schemas.get(name).ok_or_else(|| MisuseError::NotASchema {
            queryable: name.to_string(),
        })
    }

    /// Resolves a [`RawItemKey`] into `(column, value)` against `schema`.
    /// Cardinality validation for non-primary-key columns happens at the
    /// call sites in [`normalize`](Self::normalize), since `SchemaQuery`
    /// always carries an explicit cardinality while `SchemaShorthand` never
    /// does.
    fn normalize_item_for_schema_query(
        &self,
        schema: &Schema,
        item: RawItemKey,
    ) -> Result<(String, JsonValue), MisuseError> {
        match item {
            RawItemKey::Value(value) => Ok((schema.primary_key.clone(), value)),
            RawItemKey::Column(column, value) => Ok((column, value)),
            RawItemKey::Record(_) => Err(MisuseError::NotARecord {
                found: "a parent record where a column value was expected".into(),
            }),
        }
    }

    fn normalize(
        &self,
        batch: BatchKey,
        item: RawItemKey,
    ) -> Result<(NormalizedBatchKey, NormalizedItemKey, JsonValue), MisuseError> {
        match batch {
            BatchKey::Association { field, params } => {
                let record = match item {
                    RawItemKey::Record(record) => record,
                    _ => {
                        return Err(MisuseError::NotARecord {
                            found: "a column value where a parent record was expected".into(),
                        })
                    }
                };
                // The association's owning schema isn't named explicitly on
                // this variant; callers register associations under a
                // schema found via the record's own `__schema__` field.
                let owner_name = record
                    .get("__schema__")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| MisuseError::NotARecord {
                        found: "a record without a __schema__ tag".into(),
                    })?
                    .to_string();
                let owner = self.schema(&owner_name)?;
                let assoc = owner.associations.get(&field).ok_or_else(|| MisuseError::NotASchema {
                    queryable: format!("{owner_name}.{field}"),
                })?;
                let params = params.merged_over(&self.default_params);
                let parent_key = record
                    .get(&owner.primary_key)
                    .cloned()
                    .ok_or_else(|| MisuseError::NotARecord {
                        found: "a record missing its primary key".into(),
                    })?;
                let normalized_batch = NormalizedBatchKey::Association {
                    schema: owner_name,
                    field: assoc.field.clone(),
                    params,
                };
                let item_key = NormalizedItemKey::RecordKey(canonical_json(&parent_key));
                Ok((normalized_batch, item_key, parent_key))
            }
            BatchKey::SchemaQuery { cardinality, schema, params } => {
                let schema_def = self.schema(&schema)?;
                let (column, raw_value) = self.normalize_item_for_schema_query(schema_def, item)?;
                let params = params.merged_over(&self.default_params);
                let normalized_batch = NormalizedBatchKey::SchemaQuery {
                    schema,
                    cardinality,
                    column,
                    params,
                };
                // Coercion happens at `run` time, not here: a cast failure
                // there is fatal for the whole batch, not call-site misuse.
                let item_key = NormalizedItemKey::Column(canonical_json(&raw_value));
                Ok((normalized_batch, item_key, raw_value))
            }
            BatchKey::SchemaShorthand { schema, params } => {
                let schema_def = self.schema(&schema)?;
                let (column, raw_value) = self.normalize_item_for_schema_query(schema_def, item)?;
                if !schema_def.is_primary_key(&column) {
                    return Err(MisuseError::CardinalityRequired { column });
                }
                let params = params.merged_over(&self.default_params);
                let normalized_batch = NormalizedBatchKey::SchemaQuery {
                    schema,
                    cardinality: Cardinality::One,
                    column,
                    params,
                };
                let item_key = NormalizedItemKey::Column(canonical_json(&raw_value));
                Ok((normalized_batch, item_key, raw_value))
            }
        }
    }
}

fn canonical_json(value: &JsonValue) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

pub struct RelationalSourceBuilder<R> {
    repo: R,
    schemas: HashMap<String, Schema>,
    default_params: Params,
    options: SourceOptions,
}

impl<R: Repo> RelationalSourceBuilder<R> {
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schemas.insert(schema.name.clone(), schema);
        self
    }

    pub fn default_params(mut self, params: Params) -> Self {
        self.default_params = params;
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

    pub fn build(self) -> RelationalSource<R> {
        RelationalSource {
            repo: Arc::new(self.repo),
            schemas: self.schemas,
            default_params: self.default_params,
            table: BatchTable::default(),
            inputs: HashMap::new(),
            options: self.options,
        }
    }
}

#[async_trait]
impl<R> Source for RelationalSource<R>
where
    R: Repo + Send + Sync + 'static,
{
    fn load(&mut self, batch: DynKey, item: DynKey) -> Result<(), MisuseError> {
        let batch = batch
            .downcast_ref::<BatchKey>()
            .cloned()
            .ok_or_else(|| MisuseError::NotARecord {
                found: "a key of the wrong type for this source".into(),
            })?;
        let item = item
            .downcast_ref::<RawItemKey>()
            .cloned()
            .ok_or_else(|| MisuseError::NotARecord {
                found: "an item key of the wrong type for this source".into(),
            })?;
        let (normalized_batch, normalized_item, raw_value) = self.normalize(batch, item)?;
        self.inputs
            .entry(normalized_batch.clone())
            .or_default()
            .insert(normalized_item.clone(), raw_value);
        self.table.load(normalized_batch, normalized_item);
        Ok(())
    }

    fn put(&mut self, batch: DynKey, item: DynKey, value: DynValue) -> Result<(), MisuseError> {
        let batch = batch
            .downcast_ref::<BatchKey>()
            .cloned()
            .ok_or_else(|| MisuseError::NotARecord {
                found: "a key of the wrong type for this source".into(),
            })?;
        let item = item
            .downcast_ref::<RawItemKey>()
            .cloned()
            .ok_or_else(|| MisuseError::NotARecord {
                found: "an item key of the wrong type for this source".into(),
            })?;
        if let Some(sentinel) = value.downcast_ref::<JsonValue>() {
            if *sentinel == not_loaded_sentinel() {
                // Cache-warming rejection: silently refuse
                // to cache an explicit "not loaded" placeholder.
                return Ok(());
            }
        }
        let (normalized_batch, normalized_item, _raw_value) = self.normalize(batch, item)?;
        let value = value
            .downcast_ref::<RelValue>()
            .cloned()
            .ok_or_else(|| MisuseError::NotARecord {
                found: "a value of the wrong type for this source".into(),
            })?;
        self.table.put(normalized_batch, normalized_item, value);
        Ok(())
    }

    async fn run(&mut self) {
        let drained = self.table.drain_batches();
        if drained.is_empty() {
            return;
        }

        let timeout = self.options.timeout.unwrap_or_else(|| Duration::from_secs(15));
        let mut key_to_batch = HashMap::with_capacity(drained.len());

        let units = drained
            .into_iter()
            .map(|(batch, item_keys)| {
                let repo = Arc::clone(&self.repo);
                let schemas_for_batch = self.schemas.clone();
                let raw_inputs = self
                    .inputs
                    .get(&batch)
                    .cloned()
                    .unwrap_or_default();
                let key = format!("{batch:?}");
                key_to_batch.insert(key.clone(), batch.clone());
                Unit::new(key, timeout, async move {
                    let _span = RunSpan::batch(&format!("{batch:?}"));
                    let outcome =
                        run_one_batch(repo.as_ref(), &schemas_for_batch, &batch, &item_keys, &raw_inputs).await;
                    (item_keys, outcome)
                })
            })
            .collect();

        let outcomes = runner::run_units(units, self.options.max_concurrency).await;

        for (key, outcome) in outcomes {
            let Some(batch) = key_to_batch.remove(&key) else {
                continue;
            };
            self.inputs.remove(&batch);
            match outcome {
                Ok((_requested, Ok(resolved))) => self.table.store_items(batch, resolved),
                Ok((_requested, Err(reason))) => {
                    self.table.store_failed(batch, SourceError::failed(reason))
                }
                Err(runner_error) => self.table.store_failed(batch, runner_error),
            }
        }
    }

    fn fetch(&self, batch: &DynKey, item: &DynKey) -> Result<DynValue, ResolveError> {
        let batch = batch.downcast_ref::<BatchKey>().ok_or_else(|| {
            ResolveError::Lookup(LookupError::BatchNotFound {
                batch_key: "<type mismatch>".into(),
            })
        })?;
        let item = item.downcast_ref::<RawItemKey>().ok_or_else(|| {
            ResolveError::Lookup(LookupError::ItemNotFound {
                batch_key: format!("{batch:?}"),
                item_key: "<type mismatch>".into(),
            })
        })?;
        let (normalized_batch, normalized_item, _raw) = self.normalize(batch.clone(), item.clone())?;
        self.table
            .fetch(&normalized_batch, &normalized_item)
            .map(DynValue::new)
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

/// Runs one normalized batch: builds the query, picks lateral vs. flat
/// strategy, maps cardinality, and assembles the `(item -> result)`
/// mapping.
async fn run_one_batch<R: Repo>(
    repo: &R,
    schemas: &HashMap<String, Schema>,
    batch: &NormalizedBatchKey,
    item_keys: &std::collections::HashSet<NormalizedItemKey>,
    raw_inputs: &HashMap<NormalizedItemKey, JsonValue>,
) -> Result<HashMap<NormalizedItemKey, Result<RelValue, ResolveError>>, String> {
    match batch {
        NormalizedBatchKey::SchemaQuery { schema, cardinality, column, params } => {
            let Some(schema_def) = schemas.get(schema) else {
                return Err(format!("unknown schema {schema:?}"));
            };
            // Coercing here (rather than at `load` time) makes a cast
            // failure fatal for the whole batch.
            let kind = schema_def.column_kind(column);
            let mut coerced_by_key = HashMap::with_capacity(item_keys.len());
            for key in item_keys {
                let raw = raw_inputs.get(key).cloned().unwrap_or(JsonValue::Null);
                let coerced = kind.coerce(column, &raw).map_err(|err| err.to_string())?;
                coerced_by_key.insert(key.clone(), coerced);
            }
            let values: Vec<JsonValue> = coerced_by_key.values().cloned().collect();
            let grouped = if params.needs_lateral() {
                repo.query_by_column_lateral(schema_def, column, &values, params).await?
            } else {
                repo.query_by_column(schema_def, column, &values, params).await?
            };
            let mut out = HashMap::with_capacity(item_keys.len());
            for key in item_keys {
                let canonical = canonical_json(&coerced_by_key[key]);
                let rows = grouped.get(&canonical).cloned().unwrap_or_default();
                let mapped = map_cardinality(*cardinality, rows, &canonical);
                out.insert(key.clone(), mapped);
            }
            Ok(out)
        }
        NormalizedBatchKey::Association { schema, field, params } => {
            let Some(owner) = schemas.get(schema) else {
                return Err(format!("unknown schema {schema:?}"));
            };
            let Some(assoc) = owner.associations.get(field) else {
                return Err(format!("unknown association {field:?} on {schema:?}"));
            };
            let parent_keys: Vec<JsonValue> = item_keys
                .iter()
                .filter_map(|key| raw_inputs.get(key).cloned())
                .collect();
            let lateral = params.needs_lateral();

            let grouped = if assoc.through.is_empty() {
                repo.preload_association(owner, assoc, &parent_keys, params, lateral).await?
            } else {
                traverse_through(repo, schemas, owner, assoc, &parent_keys, params, lateral).await?
            };

            let mut out = HashMap::with_capacity(item_keys.len());
            for key in item_keys {
                let canonical = match key {
                    NormalizedItemKey::RecordKey(c) => c.clone(),
                    NormalizedItemKey::Column(c) => c.clone(),
                };
                let rows = grouped.get(&canonical).cloned().unwrap_or_default();
                let mapped = map_cardinality(assoc.cardinality, rows, &canonical);
                out.insert(key.clone(), mapped);
            }
            Ok(out)
        }
    }
}

/// Walks a `has_many … through …` chain one hop at a time, threading the
/// frontier of reachable keys forward per original parent and, on the last
/// hop, mapping the fetched rows back onto each original parent's canonical
/// key. `assoc.through` is the full chain of association field names, each
/// looked up on the schema reached so far; the caller's `params`/`lateral`
/// apply only to the last hop, matching the overall association's
/// cardinality and per-parent `limit`/`offset`.
async fn traverse_through<R: Repo>(
    repo: &R,
    schemas: &HashMap<String, Schema>,
    owner: &Schema,
    assoc: &AssociationDef,
    parent_keys: &[JsonValue],
    params: &Params,
    lateral: bool,
) -> Result<HashMap<String, Vec<Record>>, String> {
    // original parent canonical key -> current frontier of raw keys
    // reachable from it at this point in the chain.
    let mut frontier: HashMap<String, Vec<JsonValue>> = parent_keys
        .iter()
        .map(|k| (canonical_json(k), vec![k.clone()]))
        .collect();
    let mut current_schema = owner;
    let last_hop = assoc.through.len().saturating_sub(1);

    for (i, hop_field) in assoc.through.iter().enumerate() {
        let Some(hop) = current_schema.associations.get(hop_field) else {
            return Err(format!("unknown association {hop_field:?} on {:?}", current_schema.name));
        };
        let is_last_hop = i == last_hop;

        let mut all_keys: Vec<JsonValue> = Vec::new();
        for keys in frontier.values() {
            all_keys.extend(keys.iter().cloned());
        }

        let (hop_params, hop_lateral) = if is_last_hop {
            (params, lateral)
        } else {
            (&hop.join_where, false)
        };
        let grouped = repo
            .preload_association(current_schema, hop, &all_keys, hop_params, hop_lateral)
            .await?;

        if is_last_hop {
            let mut result = HashMap::with_capacity(frontier.len());
            for (original, keys) in &frontier {
                let mut rows = Vec::new();
                for key in keys {
                    if let Some(found) = grouped.get(&canonical_json(key)) {
                        rows.extend(found.iter().cloned());
                    }
                }
                result.insert(original.clone(), rows);
            }
            return Ok(result);
        }

        let target_schema = schemas.get(&hop.target_schema).unwrap_or(current_schema);
        let next_key_column = hop.through_key.as_deref().unwrap_or(target_schema.primary_key.as_str());
        let mut next_frontier: HashMap<String, Vec<JsonValue>> = HashMap::new();
        for (original, keys) in &frontier {
            let mut reached = Vec::new();
            for key in keys {
                if let Some(rows) = grouped.get(&canonical_json(key)) {
                    for row in rows {
                        if let Some(next_key) = row.get(next_key_column) {
                            reached.push(next_key.clone());
                        }
                    }
                }
            }
            next_frontier.insert(original.clone(), reached);
        }
        frontier = next_frontier;
        current_schema = target_schema;
    }

    // `assoc.through` is non-empty whenever this function is called (the
    // caller branches on `assoc.through.is_empty()`), so the loop above
    // always returns via the `is_last_hop` branch.
    Ok(HashMap::new())
}

fn map_cardinality(
    cardinality: Cardinality,
    rows: Vec<Record>,
    batch_key: &str,
) -> Result<RelValue, ResolveError> {
    match cardinality {
        Cardinality::One => match rows.len() {
            0 => Ok(RelValue::One(None)),
            1 => Ok(RelValue::One(rows.into_iter().next())),
            count => Err(ResolveError::Relational(RelationalError::MultipleResults {
                batch_key: batch_key.to_string(),
                count,
            })),
        },
        Cardinality::Many => Ok(RelValue::Many(rows)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeRepo {
        posts_by_user: HashMap<String, Vec<Record>>,
    }

    #[async_trait]
    impl Repo for FakeRepo {
        async fn query_by_column(
            &self,
            _schema: &Schema,
            _column: &str,
            values: &[JsonValue],
            _params: &Params,
        ) -> Result<HashMap<String, Vec<Record>>, String> {
            let mut out = HashMap::new();
            for value in values {
                let key = canonical_json(value);
                out.insert(key.clone(), self.posts_by_user.get(&key).cloned().unwrap_or_default());
            }
            Ok(out)
        }

        async fn query_by_column_lateral(
            &self,
            schema: &Schema,
            column: &str,
            values: &[JsonValue],
            params: &Params,
        ) -> Result<HashMap<String, Vec<Record>>, String> {
            let mut grouped = self.query_by_column(schema, column, values, params).await?;
            if let Some(limit) = params.limit() {
                for rows in grouped.values_mut() {
                    rows.truncate(limit as usize);
                }
            }
            Ok(grouped)
        }

        async fn preload_association(
            &self,
            _parent_schema: &Schema,
            _assoc: &AssociationDef,
            parent_keys: &[JsonValue],
            params: &Params,
            _lateral: bool,
        ) -> Result<HashMap<String, Vec<Record>>, String> {
            self.query_by_column(&users_schema(), "user_id", parent_keys, params).await
        }
    }

    fn users_schema() -> Schema {
        Schema {
            name: "users".into(),
            primary_key: "id".into(),
            columns: HashMap::from([("id".into(), ColumnKind::Integer)]),
            associations: HashMap::from([(
                "posts".into(),
                AssociationDef {
                    field: "posts".into(),
                    target_schema: "posts".into(),
                    cardinality: Cardinality::Many,
                    foreign_key: "user_id".into(),
                    through: Vec::new(),
                    join_where: Params::new(),
                    through_key: None,
                },
            )]),
        }
    }

    fn source_with_two_users_posts() -> RelationalSource<FakeRepo> {
        let mut posts_by_user = HashMap::new();
        posts_by_user.insert(
            canonical_json(&JsonValue::from(1)),
            vec![Record(serde_json::json!({"id": 10, "user_id": 1}))],
        );
        posts_by_user.insert(
            canonical_json(&JsonValue::from(2)),
            vec![
                Record(serde_json::json!({"id": 20, "user_id": 2})),
                Record(serde_json::json!({"id": 21, "user_id": 2})),
            ],
        );
        RelationalSource::new(FakeRepo { posts_by_user })
            .schema(users_schema())
            .build()
    }

    #[tokio::test]
    async fn association_preload_groups_rows_per_parent() {
        let mut source = source_with_two_users_posts();
        let p1 = serde_json::json!({"__schema__": "users", "id": 1});
        let p2 = serde_json::json!({"__schema__": "users", "id": 2});
        let batch = DynKey::new(BatchKey::Association {
            field: "posts".into(),
            params: Params::new(),
        });

        source.load(batch.clone(), DynKey::new(RawItemKey::Record(Record(p1.clone())))).unwrap();
        source.load(batch.clone(), DynKey::new(RawItemKey::Record(Record(p2.clone())))).unwrap();
        source.run().await;

        let v1 = source
            .fetch(&batch, &DynKey::new(RawItemKey::Record(Record(p1))))
            .unwrap()
            .downcast::<RelValue>()
            .unwrap();
        assert_eq!(v1.into_many().len(), 1);

        let v2 = source
            .fetch(&batch, &DynKey::new(RawItemKey::Record(Record(p2))))
            .unwrap()
            .downcast::<RelValue>()
            .unwrap();
        assert_eq!(v2.into_many().len(), 2);
    }

    #[tokio::test]
    async fn non_primary_key_schema_query_without_cardinality_is_a_misuse_error() {
        let mut source = source_with_two_users_posts();
        let batch = DynKey::new(BatchKey::SchemaShorthand {
            schema: "users".into(),
            params: Params::new(),
        });
        let err = source
            .load(batch, DynKey::new(RawItemKey::Column("email".into(), JsonValue::from("a@b.com"))))
            .unwrap_err();
        assert!(matches!(err, MisuseError::CardinalityRequired { .. }));
    }

    struct ThroughRepo {
        post_tags_by_post: HashMap<String, Vec<Record>>,
        tags_by_id: HashMap<String, Record>,
    }

    #[async_trait]
    impl Repo for ThroughRepo {
        async fn query_by_column(
            &self,
            _schema: &Schema,
            _column: &str,
            _values: &[JsonValue],
            _params: &Params,
        ) -> Result<HashMap<String, Vec<Record>>, String> {
            Ok(HashMap::new())
        }

        async fn query_by_column_lateral(
            &self,
            _schema: &Schema,
            _column: &str,
            _values: &[JsonValue],
            _params: &Params,
        ) -> Result<HashMap<String, Vec<Record>>, String> {
            Ok(HashMap::new())
        }

        async fn preload_association(
            &self,
            _parent_schema: &Schema,
            assoc: &AssociationDef,
            parent_keys: &[JsonValue],
            _params: &Params,
            _lateral: bool,
        ) -> Result<HashMap<String, Vec<Record>>, String> {
            match assoc.field.as_str() {
                "post_tags" => {
                    let mut out = HashMap::new();
                    for key in parent_keys {
                        let canonical = canonical_json(key);
                        let rows = self.post_tags_by_post.get(&canonical).cloned().unwrap_or_default();
                        out.insert(canonical, rows);
                    }
                    Ok(out)
                }
                "tag" => {
                    let mut out = HashMap::new();
                    for key in parent_keys {
                        let canonical = canonical_json(key);
                        let rows = self.tags_by_id.get(&canonical).cloned().into_iter().collect();
                        out.insert(canonical, rows);
                    }
                    Ok(out)
                }
                other => Err(format!("ThroughRepo doesn't know how to preload {other:?}")),
            }
        }
    }

    fn posts_with_tags_schema() -> Schema {
        let mut associations = HashMap::new();
        associations.insert(
            "post_tags".into(),
            AssociationDef {
                field: "post_tags".into(),
                target_schema: "post_tags".into(),
                cardinality: Cardinality::Many,
                foreign_key: "post_id".into(),
                through: Vec::new(),
                join_where: Params::new(),
                through_key: Some("tag_id".into()),
            },
        );
        associations.insert(
            "tags".into(),
            AssociationDef {
                field: "tags".into(),
                target_schema: "tags".into(),
                cardinality: Cardinality::Many,
                foreign_key: String::new(),
                through: vec!["post_tags".into(), "tag".into()],
                join_where: Params::new(),
                through_key: None,
            },
        );
        Schema {
            name: "posts".into(),
            primary_key: "id".into(),
            columns: HashMap::from([("id".into(), ColumnKind::Integer)]),
            associations,
        }
    }

    fn post_tags_schema() -> Schema {
        let mut associations = HashMap::new();
        associations.insert(
            "tag".into(),
            AssociationDef {
                field: "tag".into(),
                target_schema: "tags".into(),
                cardinality: Cardinality::One,
                foreign_key: "id".into(),
                through: Vec::new(),
                join_where: Params::new(),
                through_key: None,
            },
        );
        Schema {
            name: "post_tags".into(),
            primary_key: "id".into(),
            columns: HashMap::from([
                ("id".into(), ColumnKind::Integer),
                ("post_id".into(), ColumnKind::Integer),
                ("tag_id".into(), ColumnKind::Integer),
            ]),
            associations,
        }
    }

    fn tags_schema() -> Schema {
        Schema {
            name: "tags".into(),
            primary_key: "id".into(),
            columns: HashMap::from([("id".into(), ColumnKind::Integer)]),
            associations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn has_many_through_a_junction_walks_the_whole_chain() {
        let mut post_tags_by_post = HashMap::new();
        post_tags_by_post.insert(
            canonical_json(&JsonValue::from(1)),
            vec![
                Record(serde_json::json!({"id": 100, "post_id": 1, "tag_id": 1})),
                Record(serde_json::json!({"id": 101, "post_id": 1, "tag_id": 2})),
            ],
        );
        post_tags_by_post.insert(
            canonical_json(&JsonValue::from(2)),
            vec![Record(serde_json::json!({"id": 102, "post_id": 2, "tag_id": 2}))],
        );
        let mut tags_by_id = HashMap::new();
        tags_by_id.insert(
            canonical_json(&JsonValue::from(1)),
            Record(serde_json::json!({"id": 1, "name": "rust"})),
        );
        tags_by_id.insert(
            canonical_json(&JsonValue::from(2)),
            Record(serde_json::json!({"id": 2, "name": "async"})),
        );

        let repo = ThroughRepo { post_tags_by_post, tags_by_id };
        let schemas = HashMap::from([
            ("posts".into(), posts_with_tags_schema()),
            ("post_tags".into(), post_tags_schema()),
            ("tags".into(), tags_schema()),
        ]);

        let owner = schemas.get("posts").unwrap();
        let assoc = owner.associations.get("tags").unwrap();
        let result = traverse_through(
            &repo,
            &schemas,
            owner,
            assoc,
            &[JsonValue::from(1), JsonValue::from(2)],
            &Params::new(),
            false,
        )
        .await
        .unwrap();

        let mut post1_tag_ids: Vec<i64> = result[&canonical_json(&JsonValue::from(1))]
            .iter()
            .map(|r| r.get("id").unwrap().as_i64().unwrap())
            .collect();
        post1_tag_ids.sort();
        assert_eq!(post1_tag_ids, vec![1, 2]);

        let post2_tag_ids: Vec<i64> = result[&canonical_json(&JsonValue::from(2))]
            .iter()
            .map(|r| r.get("id").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(post2_tag_ids, vec![2]);
    }

    #[tokio::test]
    async fn cardinality_one_with_multiple_rows_is_an_error() {
        let schemas = HashMap::from([("users".into(), users_schema())]);
        let mut item_keys = HashSet::new();
        item_keys.insert(NormalizedItemKey::Column(canonical_json(&JsonValue::from(2))));
        let mut raw_inputs = HashMap::new();
        raw_inputs.insert(
            NormalizedItemKey::Column(canonical_json(&JsonValue::from(2))),
            JsonValue::from(2),
        );
        let mut posts_by_user = HashMap::new();
        posts_by_user.insert(
            canonical_json(&JsonValue::from(2)),
            vec![Record(serde_json::json!({"id": 1})), Record(serde_json::json!({"id": 2}))],
        );
        let repo = FakeRepo { posts_by_user };

        let batch = NormalizedBatchKey::SchemaQuery {
            schema: "users".into(),
            cardinality: Cardinality::One,
            column: "id".into(),
            params: Params::new(),
        };
        let result = run_one_batch(&repo, &schemas, &batch, &item_keys, &raw_inputs)
            .await
            .unwrap();
        let only = result.into_values().next().unwrap();
        assert!(matches!(
            only,
            Err(ResolveError::Relational(RelationalError::MultipleResults { count: 2, .. }))
        ));
    }
}
