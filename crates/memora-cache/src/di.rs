//! Dependency injection module using Shaku.
//!
//! `CacheModule` wires the Redis backend. The in-memory backend is built
//! directly by [`build_backend`] since it has no external resources.

use crate::cache::{CacheBackend, InMemoryCacheBackend, RedisCacheBackend, RedisCacheBackendParameters};
use crate::service::QueryCacheService;
use memora_config::{AppConfig, BackendKind, CacheConfig, RedisConfig};
use memora_core::{module, HasComponent, MemoraError, MemoraResult};
use std::sync::Arc;
use tracing::info;

// Query cache module.
// Contains the Redis cache backend; the pool is supplied as a parameter and
// is absent when Redis is disabled.
module! {
    pub CacheModule {
        components = [
            RedisCacheBackend,
        ],
        providers = [],
    }
}

/// Builds the cache module from Redis settings.
///
/// Pool creation does not connect; the first command does.
pub fn build_cache_module(redis_config: &RedisConfig) -> MemoraResult<Arc<CacheModule>> {
    let cache_pool = if redis_config.enabled {
        let mut redis_cfg = deadpool_redis::Config::from_url(&redis_config.url);
        redis_cfg.pool = Some(deadpool_redis::PoolConfig::new(redis_config.pool_size as usize));
        let pool = redis_cfg
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| MemoraError::Cache(format!("Failed to create Redis pool: {}", e)))?;
        Some(Arc::new(pool))
    } else {
        None
    };

    let module = CacheModule::builder()
        .with_component_parameters::<RedisCacheBackend>(RedisCacheBackendParameters {
            pool: cache_pool,
            tag_prefix: redis_config.tag_prefix.clone(),
        })
        .build();

    Ok(Arc::new(module))
}

/// Selects and builds the backend named in the cache policy.
pub fn build_backend(config: &AppConfig) -> MemoraResult<Arc<dyn CacheBackend>> {
    let backend: Arc<dyn CacheBackend> = match config.cache.backend {
        BackendKind::Memory => Arc::new(InMemoryCacheBackend::new()),
        BackendKind::Redis => {
            let module = build_cache_module(&config.redis)?;
            HasComponent::<dyn CacheBackend>::resolve(module.as_ref())
        }
    };

    info!(
        backend = backend.name(),
        enabled = backend.is_enabled(),
        "Cache backend ready"
    );
    Ok(backend)
}

impl QueryCacheService {
    /// Creates a service backed by the module's cache backend.
    pub fn from_module(module: &CacheModule, config: &CacheConfig) -> Self {
        let backend: Arc<dyn CacheBackend> = module.resolve();
        Self::new(backend, config)
    }
}
