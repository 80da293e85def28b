//! Query shapes as seen by the cache.
//!
//! The cache never interprets a filter beyond scoring and fingerprinting it;
//! the document store that executes the query owns its semantics.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Read operation families the cache handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Multi-document lookup.
    FetchMany,
    /// Single-document lookup.
    FetchOne,
    /// Aggregation pipeline.
    Aggregate,
    /// Document count.
    Count,
}

impl OperationKind {
    /// Stable string form, used in cache keys and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FetchMany => "fetch_many",
            Self::FetchOne => "fetch_one",
            Self::Aggregate => "aggregate",
            Self::Count => "count",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write operations reported by the data-access layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Create,
    Update,
    Delete,
}

impl WriteOperation {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query options.
///
/// Everything except `hints` changes the result and therefore takes part in
/// the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Sort specification, e.g. `{"createdAt": -1}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    /// Maximum number of documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Number of documents to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Field projection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    /// Related entity kinds to populate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    /// Caller hints that do not affect the result (debug flags, tracing ids).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hints: BTreeMap<String, Value>,
}

impl QueryOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sort specification.
    #[must_use]
    pub fn with_sort(mut self, sort: Value) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets the limit.
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets the field projection.
    #[must_use]
    pub fn with_projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Adds a related entity kind to populate.
    #[must_use]
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.includes.push(relation.into());
        self
    }

    /// Adds a non-result-affecting hint.
    #[must_use]
    pub fn with_hint(mut self, name: impl Into<String>, value: Value) -> Self {
        self.hints.insert(name.into(), value);
        self
    }

    /// True when a non-empty sort specification is present.
    #[must_use]
    pub fn has_sort(&self) -> bool {
        match &self.sort {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

/// The shape of one read: operation, filter and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryShape {
    pub operation: OperationKind,
    pub filter: Value,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryShape {
    /// Creates a shape with default options.
    #[must_use]
    pub fn new(operation: OperationKind, filter: Value) -> Self {
        Self {
            operation,
            filter,
            options: QueryOptions::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// A read submitted to the query cache.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Entity kind (collection / model name) being read.
    pub entity_kind: String,
    /// The query shape.
    pub shape: QueryShape,
    /// TTL for this result instead of the configured default.
    pub ttl_override: Option<Duration>,
    /// Additional entity kinds whose writes must invalidate this result,
    /// e.g. the kinds pulled in through `includes`.
    pub depends_on: Vec<String>,
}

impl QueryRequest {
    /// Creates a request.
    pub fn new(entity_kind: impl Into<String>, shape: QueryShape) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            shape,
            ttl_override: None,
            depends_on: Vec::new(),
        }
    }

    /// Multi-document read.
    pub fn fetch_many(entity_kind: impl Into<String>, filter: Value) -> Self {
        Self::new(entity_kind, QueryShape::new(OperationKind::FetchMany, filter))
    }

    /// Single-document read.
    pub fn fetch_one(entity_kind: impl Into<String>, filter: Value) -> Self {
        Self::new(entity_kind, QueryShape::new(OperationKind::FetchOne, filter))
    }

    /// Aggregation pipeline.
    pub fn aggregate(entity_kind: impl Into<String>, pipeline: Value) -> Self {
        Self::new(entity_kind, QueryShape::new(OperationKind::Aggregate, pipeline))
    }

    /// Document count.
    pub fn count(entity_kind: impl Into<String>, filter: Value) -> Self {
        Self::new(entity_kind, QueryShape::new(OperationKind::Count, filter))
    }

    /// Sets the query options.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.shape.options = options;
        self
    }

    /// Overrides the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    /// Declares an additional entity kind this result depends on.
    #[must_use]
    pub fn depends_on(mut self, entity_kind: impl Into<String>) -> Self {
        self.depends_on.push(entity_kind.into());
        self
    }

    /// The operation family.
    #[must_use]
    pub fn operation(&self) -> OperationKind {
        self.shape.operation
    }

    /// Every entity kind this result depends on, the queried kind first,
    /// without duplicates.
    #[must_use]
    pub fn dependency_kinds(&self) -> Vec<String> {
        let mut kinds = vec![self.entity_kind.clone()];
        for kind in &self.depends_on {
            if !kinds.contains(kind) {
                kinds.push(kind.clone());
            }
        }
        kinds
    }
}
