//! TTL cache in front of a schema resolver.
//!
//! Found schemas are reused for the positive TTL. Unknown results are only
//! remembered when a negative TTL is configured; by default every message
//! of an unknown event type asks the backend again. Errors are never cached.

use super::{SchemaLookup, SchemaResolver};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached value with expiration tracking.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
    /// The cached value
    pub value: T,
    /// When the value was cached
    pub cached_at: Instant,
    /// Time-to-live for this value
    pub ttl: Duration,
}

impl<T> CachedValue<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if the cached value has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub negative_hits: AtomicU64,
}

type CacheKey = (String, String);

/// Caching wrapper around any [`SchemaResolver`].
pub struct CachingSchemaResolver {
    inner: Arc<dyn SchemaResolver>,
    ttl: Duration,
    negative_ttl: Option<Duration>,
    entries: RwLock<HashMap<CacheKey, CachedValue<SchemaLookup>>>,
    stats: CacheStats,
}

impl CachingSchemaResolver {
    pub fn new(inner: Arc<dyn SchemaResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            negative_ttl: None,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Remember unknown event types for `ttl`.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = Some(ttl);
        self
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    fn cached(&self, key: &CacheKey) -> Option<SchemaLookup> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }
}

#[async_trait]
impl SchemaResolver for CachingSchemaResolver {
    async fn resolve(&self, database: &str, event_type: &str) -> Result<SchemaLookup> {
        let key = (database.to_string(), event_type.to_string());

        if let Some(lookup) = self.cached(&key) {
            match lookup {
                SchemaLookup::Found(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
                SchemaLookup::Unknown => self.stats.negative_hits.fetch_add(1, Ordering::Relaxed),
            };
            return Ok(lookup);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let lookup = self.inner.resolve(database, event_type).await?;

        let ttl = match lookup {
            SchemaLookup::Found(_) => Some(self.ttl),
            SchemaLookup::Unknown => self.negative_ttl,
        };

        let mut entries = self.entries.write();
        match ttl {
            Some(ttl) => {
                entries.insert(key, CachedValue::new(lookup.clone(), ttl));
            }
            None => {
                entries.remove(&key);
            }
        }
        drop(entries);

        debug!(
            backend = self.inner.name(),
            database = %database,
            event_type = %event_type,
            found = lookup.is_found(),
            "Schema lookup"
        );

        Ok(lookup)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, EventSchema};
    use std::sync::atomic::AtomicUsize;

    /// Counts backend calls; `login` is known, anything else is unknown,
    /// `broken` fails.
    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SchemaResolver for CountingResolver {
        async fn resolve(&self, _database: &str, event_type: &str) -> Result<SchemaLookup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match event_type {
                "login" => Ok(SchemaLookup::Found(Arc::new(EventSchema::new(vec![
                    ColumnDef::new("event", ColumnType::String),
                ])))),
                "broken" => Err(crate::Error::Schema("metastore down".into())),
                _ => Ok(SchemaLookup::Unknown),
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn counting() -> Arc<CountingResolver> {
        Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_positive_results_are_cached() {
        let backend = counting();
        let cache = CachingSchemaResolver::new(backend.clone(), Duration::from_secs(60));

        assert!(cache.resolve("db", "login").await.unwrap().is_found());
        assert!(cache.resolve("db", "login").await.unwrap().is_found());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_not_cached_by_default() {
        let backend = counting();
        let cache = CachingSchemaResolver::new(backend.clone(), Duration::from_secs(60));

        assert!(!cache.resolve("db", "signup").await.unwrap().is_found());
        assert!(!cache.resolve("db", "signup").await.unwrap().is_found());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_cache() {
        let backend = counting();
        let cache = CachingSchemaResolver::new(backend.clone(), Duration::from_secs(60))
            .with_negative_ttl(Duration::from_secs(60));

        cache.resolve("db", "signup").await.unwrap();
        cache.resolve("db", "signup").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().negative_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_refetch() {
        let backend = counting();
        let cache = CachingSchemaResolver::new(backend.clone(), Duration::from_millis(10));

        cache.resolve("db", "login").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.resolve("db", "login").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let backend = counting();
        let cache = CachingSchemaResolver::new(backend.clone(), Duration::from_secs(60))
            .with_negative_ttl(Duration::from_secs(60));

        assert!(cache.resolve("db", "broken").await.is_err());
        assert!(cache.resolve("db", "broken").await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let backend = counting();
        let cache = CachingSchemaResolver::new(backend.clone(), Duration::from_secs(60));

        cache.resolve("db", "login").await.unwrap();
        cache.invalidate_all();
        cache.resolve("db", "login").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cached_value_expiry() {
        let value = CachedValue::new(1, Duration::from_secs(60));
        assert!(!value.is_expired());
        let expired = CachedValue {
            value: 1,
            cached_at: Instant::now() - Duration::from_secs(120),
            ttl: Duration::from_secs(60),
        };
        assert!(expired.is_expired());
    }
}
