//! Query complexity scoring.
//!
//! A cheap heuristic over the serialized filter and the options bag that
//! decides whether a result is worth a cache round-trip.

use crate::query::QueryShape;
use memora_config::CacheConfig;
use serde::{Deserialize, Serialize};

/// Weight per 100 bytes of serialized filter.
const LENGTH_DIVISOR: f64 = 100.0;
/// Cap on the size term.
const LENGTH_CAP: f64 = 50.0;

const PATTERN_MATCH_WEIGHT: f64 = 30.0;
const FULL_TEXT_WEIGHT: f64 = 25.0;
const GEO_WEIGHT: f64 = 40.0;
const JOIN_WEIGHT: f64 = 35.0;
const GROUP_BY_WEIGHT: f64 = 30.0;
const SORT_WEIGHT: f64 = 10.0;
const INCLUDE_WEIGHT: f64 = 20.0;
const LARGE_LIMIT_WEIGHT: f64 = 15.0;

/// Limits above this count as large.
const LARGE_LIMIT: u64 = 1000;

/// Factor tags reported in [`ComplexityScore::factors`].
pub mod factors {
    pub const PATTERN_MATCH: &str = "pattern-match-predicate";
    pub const FULL_TEXT: &str = "full-text-predicate";
    pub const GEO: &str = "geo-predicate";
    pub const JOIN: &str = "join/include";
    pub const GROUP_BY: &str = "group-by";
    pub const SORT: &str = "sort";
    pub const INCLUDE_RELATIONS: &str = "include-relations";
    pub const LARGE_LIMIT: &str = "large-limit";
}

/// Filter tokens and the factor each one triggers. Each factor fires at most
/// once per query.
const FILTER_RULES: &[(&str, &[&str], f64)] = &[
    (factors::PATTERN_MATCH, &["$regex"], PATTERN_MATCH_WEIGHT),
    (factors::FULL_TEXT, &["$text", "$search"], FULL_TEXT_WEIGHT),
    (
        factors::GEO,
        &["$near", "$geoWithin", "$geoIntersects", "$nearSphere"],
        GEO_WEIGHT,
    ),
    (factors::JOIN, &["$lookup", "populate", "include"], JOIN_WEIGHT),
    (factors::GROUP_BY, &["$group"], GROUP_BY_WEIGHT),
];

/// Result of scoring one query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    /// Numeric complexity.
    pub score: f64,
    /// Contributing factor tags, in detection order.
    pub factors: Vec<String>,
    /// Whether the score falls inside the cacheable range.
    pub cacheable: bool,
}

impl ComplexityScore {
    fn unscoreable() -> Self {
        Self {
            score: 0.0,
            factors: Vec::new(),
            cacheable: false,
        }
    }
}

/// Scores query shapes against a cacheable range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexityAnalyzer {
    min_score: f64,
    max_score: f64,
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new(10.0, 200.0)
    }
}

impl ComplexityAnalyzer {
    /// Creates an analyzer with an inclusive cacheable range.
    #[must_use]
    pub const fn new(min_score: f64, max_score: f64) -> Self {
        Self {
            min_score,
            max_score,
        }
    }

    /// Creates an analyzer from the cache policy.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.min_complexity, config.max_complexity)
    }

    /// Scores a query shape. Never fails; input that cannot be serialized
    /// scores 0 and is not cacheable.
    #[must_use]
    pub fn score(&self, shape: &QueryShape) -> ComplexityScore {
        let Ok(serialized) = serde_json::to_string(&shape.filter) else {
            return ComplexityScore::unscoreable();
        };

        let mut score = (serialized.len() as f64 / LENGTH_DIVISOR).min(LENGTH_CAP);
        let mut found = Vec::new();

        for (factor, tokens, weight) in FILTER_RULES {
            if tokens.iter().any(|token| serialized.contains(token)) {
                score += weight;
                found.push((*factor).to_string());
            }
        }

        let options = &shape.options;
        if options.has_sort() {
            score += SORT_WEIGHT;
            found.push(factors::SORT.to_string());
        }
        if !options.includes.is_empty() {
            score += INCLUDE_WEIGHT;
            found.push(factors::INCLUDE_RELATIONS.to_string());
        }
        if options.limit.is_some_and(|limit| limit > LARGE_LIMIT) {
            score += LARGE_LIMIT_WEIGHT;
            found.push(factors::LARGE_LIMIT.to_string());
        }

        ComplexityScore {
            score,
            factors: found,
            cacheable: self.is_cacheable(score),
        }
    }

    /// Inclusive range check.
    #[must_use]
    pub fn is_cacheable(&self, score: f64) -> bool {
        score >= self.min_score && score <= self.max_score
    }
}
