//! Cache backend abstraction and implementations.
//!
//! The query cache only ever talks to [`CacheBackend`]. Redis is the
//! production backend; the in-memory backend serves local development and
//! tests.

mod cache_interface;
pub mod cache_keys;
mod memory_cache;
pub mod pattern;
mod redis_cache;

pub use cache_interface::{CacheBackend, CacheExt, InvalidationRequest, SetOptions};
pub use cache_keys::KeyGenerator;
pub use memory_cache::InMemoryCacheBackend;
pub use redis_cache::{RedisCacheBackend, RedisCacheBackendParameters, DEFAULT_TAG_PREFIX};
