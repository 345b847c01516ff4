use crate::config::CacheConfig;
use crate::models::{RecommendationOptions, RecommendationResponse};
use crate::utils::digest_u64;
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Minimal key-value surface the engine needs from a cache.
#[async_trait::async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Increments an integer counter, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Pushes to the head of a list, trims it to `cap` entries and refreshes its TTL.
    async fn list_push_capped(&self, key: &str, value: String, cap: usize, ttl_seconds: u64) -> Result<()>;

    /// Whole list, newest first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;
}

pub struct RedisCache {
    client: Arc<redis::Client>,
}

impl RedisCache {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(redis::Client::open(url)?)))
    }
}

#[async_trait::async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_async_connection().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.client.get_async_connection().await?;
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn list_push_capped(&self, key: &str, value: String, cap: usize, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let stop = cap.saturating_sub(1) as isize;
        let _: () = redis::pipe()
            .atomic()
            .cmd("LPUSH").arg(key).arg(value).ignore()
            .cmd("LTRIM").arg(key).arg(0).arg(stop).ignore()
            .cmd("EXPIRE").arg(key).arg(ttl_seconds).ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.client.get_async_connection().await?;
        Ok(conn.lrange(key, 0, -1).await?)
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local cache with per-key expiry.
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();
        let value = self.entries.get(key).and_then(|entry| entry.is_live(now).then(|| entry.value.clone()));
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        value
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            Some(CachedValue::Text(text)) => Ok(Some(text)),
            Some(CachedValue::List(_)) => anyhow::bail!("key {} holds a list", key),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::Text(value),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
            value: CachedValue::Text("0".to_string()),
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = CacheEntry {
                value: CachedValue::Text("0".to_string()),
                expires_at: None,
            };
        }
        let next = match &entry.value {
            CachedValue::Text(text) => text.parse::<i64>()? + 1,
            CachedValue::List(_) => anyhow::bail!("key {} holds a list", key),
        };
        entry.value = CachedValue::Text(next.to_string());
        Ok(next)
    }

    async fn list_push_capped(&self, key: &str, value: String, cap: usize, ttl_seconds: u64) -> Result<()> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
            value: CachedValue::List(VecDeque::new()),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.value = CachedValue::List(VecDeque::new());
        }
        match &mut entry.value {
            CachedValue::List(list) => {
                list.push_front(value);
                list.truncate(cap);
            }
            CachedValue::Text(_) => anyhow::bail!("key {} holds a string", key),
        }
        entry.expires_at = Some(now + Duration::from_secs(ttl_seconds));
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        match self.live(key) {
            Some(CachedValue::List(list)) => Ok(list.into_iter().collect()),
            Some(CachedValue::Text(_)) => anyhow::bail!("key {} holds a string", key),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentRating {
    pub item_id: Uuid,
    pub rating: f32,
    pub timestamp: DateTime<Utc>,
}

/// Memoized recommendation lists plus the transient per-user rating feed.
///
/// List keys embed a per-user generation, so invalidating every cached
/// option set of a user is one counter increment.
#[derive(Clone)]
pub struct RecommendationCache {
    store: Arc<dyn KeyValueCache>,
    prefix: String,
    config: CacheConfig,
}

impl RecommendationCache {
    pub fn new(store: Arc<dyn KeyValueCache>, prefix: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            config,
        }
    }

    fn generation_key(&self, user_id: Uuid) -> String {
        format!("{}:recs_gen:{}", self.prefix, user_id)
    }

    fn recent_key(&self, user_id: Uuid) -> String {
        format!("{}:recent_ratings:{}", self.prefix, user_id)
    }

    async fn list_key(&self, user_id: Uuid, options: &RecommendationOptions) -> Result<String> {
        let generation = self
            .store
            .get(&self.generation_key(user_id))
            .await?
            .and_then(|g| g.parse::<i64>().ok())
            .unwrap_or(0);
        let options_hash = digest_u64(&serde_json::to_vec(options)?);
        Ok(format!("{}:recs:{}:g{}:{:016x}", self.prefix, user_id, generation, options_hash))
    }

    pub async fn get(&self, user_id: Uuid, options: &RecommendationOptions) -> Result<Option<RecommendationResponse>> {
        let key = self.list_key(user_id, options).await?;
        match self.store.get(&key).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, response: &RecommendationResponse, options: &RecommendationOptions) -> Result<()> {
        let key = self.list_key(response.user_id, options).await?;
        let payload = serde_json::to_string(response)?;
        self.store
            .set_ex(&key, payload, self.config.recommendation_ttl_seconds)
            .await
    }

    /// Orphans every cached list of the user. Returns the new generation.
    pub async fn invalidate(&self, user_id: Uuid) -> Result<i64> {
        let generation = self.store.incr(&self.generation_key(user_id)).await?;
        debug!("Invalidated cached recommendations for user {} (generation {})", user_id, generation);
        Ok(generation)
    }

    pub fn is_high_signal(&self, rating: f32) -> bool {
        rating >= self.config.high_signal_rating || rating <= self.config.low_signal_rating
    }

    /// Pushes the rating onto the recent feed and invalidates cached lists
    /// when the rating is strong enough to move them. Returns whether it did.
    pub async fn record_rating(&self, user_id: Uuid, item_id: Uuid, rating: f32) -> Result<bool> {
        let entry = RecentRating {
            item_id,
            rating,
            timestamp: Utc::now(),
        };
        self.store
            .list_push_capped(
                &self.recent_key(user_id),
                serde_json::to_string(&entry)?,
                self.config.recent_ratings_cap,
                self.config.recent_ratings_ttl_seconds,
            )
            .await?;

        if self.is_high_signal(rating) {
            self.invalidate(user_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Newest first.
    pub async fn recent_ratings(&self, user_id: Uuid) -> Result<Vec<RecentRating>> {
        self.store
            .list_range(&self.recent_key(user_id))
            .await?
            .iter()
            .map(|raw| serde_json::from_str::<RecentRating>(raw).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::SourceWeights;

    fn cache() -> RecommendationCache {
        RecommendationCache::new(Arc::new(InMemoryCache::new()), "test", Config::default().cache)
    }

    fn response(user_id: Uuid) -> RecommendationResponse {
        RecommendationResponse {
            user_id,
            recommendations: Vec::new(),
            weights: SourceWeights {
                content: 0.5,
                collaborative: 0.1,
                popularity: 0.4,
            },
            from_cache: false,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_expiry() {
        let cache = InMemoryCache::new();
        cache.set_ex("short", "v".to_string(), 0).await.unwrap();
        cache.set_ex("long", "v".to_string(), 60).await.unwrap();

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.len(), 1);

        cache.delete("long").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_list_is_capped_newest_first() {
        let cache = InMemoryCache::new();
        for i in 0..5 {
            cache.list_push_capped("l", i.to_string(), 3, 60).await.unwrap();
        }
        assert_eq!(cache.list_range("l").await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(cache.incr("n").await.unwrap(), 1);
        assert_eq!(cache.incr("n").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cached_list_keyed_by_options() {
        let cache = cache();
        let user = Uuid::new_v4();
        let options = RecommendationOptions::default();
        cache.put(&response(user), &options).await.unwrap();

        assert!(cache.get(user, &options).await.unwrap().is_some());
        let other = RecommendationOptions::default().with_count(5);
        assert!(cache.get(user, &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_high_signal_rating_invalidates() {
        let cache = cache();
        let user = Uuid::new_v4();
        let options = RecommendationOptions::default();
        cache.put(&response(user), &options).await.unwrap();

        assert!(!cache.record_rating(user, Uuid::new_v4(), 6.0).await.unwrap());
        assert!(cache.get(user, &options).await.unwrap().is_some());

        assert!(cache.record_rating(user, Uuid::new_v4(), 9.0).await.unwrap());
        assert!(cache.get(user, &options).await.unwrap().is_none());

        let recent = cache.recent_ratings(user).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].rating, 9.0);
    }
}
