//! Cache key generation for consistent key naming.
//!
//! Keys look like `{namespace}:{entity_kind}:{sha256}`. The digest covers a
//! canonical serialization of the query, so logically identical queries map
//! to the same key regardless of object key order.

use super::pattern::escape;
use crate::query::QueryShape;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Tag prefix for entity-kind dependency tags.
const MODEL_TAG_PREFIX: &str = "model:";

/// Generates cache keys and invalidation patterns under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenerator {
    namespace: String,
}

impl KeyGenerator {
    /// Creates a generator for `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The key namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Generates the cache key for a query.
    ///
    /// Only result-affecting options take part; hints are ignored.
    #[must_use]
    pub fn generate(&self, entity_kind: &str, shape: &QueryShape) -> String {
        let canonical = canonical_query(entity_kind, shape);
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{}:{}:{}", self.namespace, entity_kind, hex::encode(digest))
    }

    /// Pattern matching every key of an entity kind.
    #[must_use]
    pub fn entity_pattern(&self, entity_kind: &str) -> String {
        format!("{}:{}:*", escape(&self.namespace), escape(entity_kind))
    }

    /// Pattern matching keys that embed a document id.
    #[must_use]
    pub fn document_pattern(&self, document_id: &str) -> String {
        format!("{}:*:{}:*", escape(&self.namespace), escape(document_id))
    }

    /// Pattern matching keys of an entity kind that embed a field name.
    #[must_use]
    pub fn field_pattern(&self, entity_kind: &str, field: &str) -> String {
        format!(
            "{}:{}:*:{}:*",
            escape(&self.namespace),
            escape(entity_kind),
            escape(field)
        )
    }

    /// Pattern matching every key in the namespace.
    #[must_use]
    pub fn namespace_pattern(&self) -> String {
        format!("{}:*", escape(&self.namespace))
    }
}

/// Dependency tag for an entity kind.
#[must_use]
pub fn model_tag(entity_kind: &str) -> String {
    format!("{}{}", MODEL_TAG_PREFIX, entity_kind)
}

fn canonical_query(entity_kind: &str, shape: &QueryShape) -> String {
    let options = &shape.options;
    let mut relevant = Map::new();
    if let Some(sort) = &options.sort {
        relevant.insert("sort".to_string(), sort.clone());
    }
    if let Some(limit) = options.limit {
        relevant.insert("limit".to_string(), Value::from(limit));
    }
    if let Some(offset) = options.offset {
        relevant.insert("offset".to_string(), Value::from(offset));
    }
    if let Some(projection) = &options.projection {
        relevant.insert("projection".to_string(), projection.clone());
    }
    if !options.includes.is_empty() {
        relevant.insert(
            "includes".to_string(),
            Value::from(options.includes.clone()),
        );
    }

    let mut root = Map::new();
    root.insert("entity".to_string(), Value::from(entity_kind));
    root.insert("operation".to_string(), Value::from(shape.operation.as_str()));
    root.insert("filter".to_string(), shape.filter.clone());
    root.insert("options".to_string(), Value::Object(relevant));

    let mut out = String::new();
    write_canonical(&Value::Object(root), &mut out);
    out
}

/// Writes JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
