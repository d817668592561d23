//! # Cache Tiers
//!
//! Two independent TTL caches in front of the search index.
//!
//! ## Local
//! - moka, process-private, small and short-lived
//! - `flush_all` is `invalidate_all`, constant time for the caller
//!
//! ## Shared
//! - Redis, visible to every search instance, larger TTL
//! - Keys live under a generation, `cache:{generation}:{key}`
//! - `flush_all` is a single `INCR` of the generation. Old generations are
//!   never read again and age out through their TTL, so a flush never scans
//!   or wipes a Redis database shared with the record store
//!
//! ## Read path
//! local, then shared (hit backfills local), then the index. A non-empty
//! index result populates every tier that missed. Cache errors count as misses
//! and never reach the caller.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{CacheError, SearchError},
    models::{Page, SearchDocument, SearchFilters},
    search::SearchIndex,
    utils::with_deadline,
};

const SHARED_PREFIX: &str = "cache";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_filters(filters: &SearchFilters) -> Self {
        let canonical = filters.canonical();
        let tuple = (
            &canonical.id,
            &canonical.title,
            &canonical.description,
            &canonical.day,
            canonical.page,
            canonical.count,
        );

        // JSON keeps the tuple unambiguous when values contain separators.
        Self(format!(
            "search:{}",
            serde_json::to_string(&tuple).unwrap_or_default()
        ))
    }

    pub fn for_activity(id: &str) -> Self {
        Self(format!("activity:{}", id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    Page(Page),
    Activity(SearchDocument),
}

#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError>;

    async fn set(&self, key: &CacheKey, value: &CacheValue) -> Result<(), CacheError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    async fn flush_all(&self) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct LocalTier {
    cache: Cache<CacheKey, CacheValue>,
}

impl LocalTier {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }
}

#[async_trait]
impl CacheTier for LocalTier {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        Ok(self.cache.get(key).await)
    }

    async fn set(&self, key: &CacheKey, value: &CacheValue) -> Result<(), CacheError> {
        self.cache.insert(key.clone(), value.clone()).await;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedTier {
    connection: ConnectionManager,
    ttl: Duration,
    deadline: Duration,
}

impl SharedTier {
    pub fn new(connection: ConnectionManager, ttl: Duration, deadline: Duration) -> Self {
        Self {
            connection,
            ttl,
            deadline,
        }
    }

    fn generation_key() -> String {
        format!("{SHARED_PREFIX}:generation")
    }

    async fn scoped_key(&self, key: &CacheKey) -> Result<String, CacheError> {
        let mut connection = self.connection.clone();

        let generation: Option<u64> = with_deadline(self.deadline, CacheError::Timeout, async {
            Ok::<_, CacheError>(connection.get(Self::generation_key()).await?)
        })
        .await?;

        Ok(format!(
            "{SHARED_PREFIX}:{}:{}",
            generation.unwrap_or_default(),
            key.as_str()
        ))
    }
}

#[async_trait]
impl CacheTier for SharedTier {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        let scoped = self.scoped_key(key).await?;
        let mut connection = self.connection.clone();

        let raw: Option<String> = with_deadline(self.deadline, CacheError::Timeout, async {
            Ok::<_, CacheError>(connection.get(&scoped).await?)
        })
        .await?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(CacheError::from))
            .transpose()
    }

    async fn set(&self, key: &CacheKey, value: &CacheValue) -> Result<(), CacheError> {
        let scoped = self.scoped_key(key).await?;
        let raw = serde_json::to_string(value)?;
        let mut connection = self.connection.clone();

        with_deadline(self.deadline, CacheError::Timeout, async {
            let () = connection
                .set_ex(&scoped, raw, self.ttl.as_secs().max(1))
                .await?;
            Ok::<_, CacheError>(())
        })
        .await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let scoped = self.scoped_key(key).await?;
        let mut connection = self.connection.clone();

        with_deadline(self.deadline, CacheError::Timeout, async {
            let _: i64 = connection.del(&scoped).await?;
            Ok::<_, CacheError>(())
        })
        .await
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();

        with_deadline(self.deadline, CacheError::Timeout, async {
            let _: u64 = connection.incr(Self::generation_key(), 1).await?;
            Ok::<_, CacheError>(())
        })
        .await
    }
}

/// Cache-aside reads over both tiers with the search index as the source.
#[derive(Clone)]
pub struct ReadPath {
    local: Arc<dyn CacheTier>,
    shared: Arc<dyn CacheTier>,
    index: Arc<dyn SearchIndex>,
}

impl ReadPath {
    pub fn new(
        local: Arc<dyn CacheTier>,
        shared: Arc<dyn CacheTier>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            local,
            shared,
            index,
        }
    }

    pub async fn list(&self, filters: &SearchFilters) -> Result<Page, SearchError> {
        let key = CacheKey::for_filters(filters);

        if let Some(CacheValue::Page(page)) = lookup(self.local.as_ref(), &key).await {
            return Ok(page);
        }

        if let Some(CacheValue::Page(page)) = lookup(self.shared.as_ref(), &key).await {
            store(self.local.as_ref(), &key, &CacheValue::Page(page.clone())).await;
            return Ok(page);
        }

        let page = self.index.list(&filters.normalized()).await?;

        if page.total != 0 {
            let value = CacheValue::Page(page.clone());
            store(self.local.as_ref(), &key, &value).await;
            store(self.shared.as_ref(), &key, &value).await;
        }

        Ok(page)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<SearchDocument>, SearchError> {
        let key = CacheKey::for_activity(id);

        if let Some(CacheValue::Activity(doc)) = lookup(self.local.as_ref(), &key).await {
            return Ok(Some(doc));
        }

        if let Some(CacheValue::Activity(doc)) = lookup(self.shared.as_ref(), &key).await {
            store(self.local.as_ref(), &key, &CacheValue::Activity(doc.clone())).await;
            return Ok(Some(doc));
        }

        let page = self.index.list(&SearchFilters::by_id(id)).await?;
        let Some(doc) = page.results.into_iter().next() else {
            return Ok(None);
        };

        self.populate(&doc).await;
        Ok(Some(doc))
    }

    /// Writes a document into both tiers under its point-lookup key.
    pub async fn populate(&self, doc: &SearchDocument) {
        let key = CacheKey::for_activity(&doc.id);
        let value = CacheValue::Activity(doc.clone());

        store(self.local.as_ref(), &key, &value).await;
        store(self.shared.as_ref(), &key, &value).await;
    }

    pub async fn evict(&self, id: &str) {
        let key = CacheKey::for_activity(id);

        for tier in [self.local.as_ref(), self.shared.as_ref()] {
            if let Err(e) = tier.delete(&key).await {
                warn!("Error evicting {} from {} cache: {e}", key.as_str(), tier.name());
            }
        }
    }
}

async fn lookup(tier: &dyn CacheTier, key: &CacheKey) -> Option<CacheValue> {
    match tier.get(key).await {
        Ok(Some(value)) => {
            debug!("Cache hit in {} for {}", tier.name(), key.as_str());
            Some(value)
        }
        Ok(None) => {
            debug!("Cache miss in {} for {}", tier.name(), key.as_str());
            None
        }
        Err(e) => {
            warn!("Error reading {} cache, treating as miss: {e}", tier.name());
            None
        }
    }
}

async fn store(tier: &dyn CacheTier, key: &CacheKey, value: &CacheValue) {
    if let Err(e) = tier.set(key, value).await {
        warn!("Error caching {} in {} cache: {e}", key.as_str(), tier.name());
    }
}
