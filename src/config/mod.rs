use crate::algorithms::neighbors::SimilarityMetric;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub profile: ProfileConfig,
    pub recommendation: RecommendationConfig,
    pub training: TrainingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub recommendation_ttl_seconds: u64,
    pub recent_ratings_cap: usize,
    pub recent_ratings_ttl_seconds: u64,
    /// Ratings at or above this value invalidate cached lists.
    pub high_signal_rating: f32,
    /// Ratings at or below this value invalidate cached lists.
    pub low_signal_rating: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub max_events: usize,
    pub session_gap_minutes: i64,
    pub recency_half_life_days: f64,
    pub high_rating_threshold: f32,
    pub runtime_padding_minutes: u32,
    pub year_padding: i32,
    /// How long a built profile is reused before the log is read again.
    pub cache_ttl_seconds: u64,
    pub max_cached_profiles: usize,
}

impl ProfileConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub candidate_pool_size: usize,
    pub default_count: usize,
    pub max_count: usize,
    pub neighbor_count: usize,
    pub min_neighbor_overlap: usize,
    pub neighbor_similarity: SimilarityMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub factors: usize,
    pub user_capacity: usize,
    pub item_capacity: usize,
    pub learning_rate: f32,
    pub regularization: f32,
    pub init_std_dev: f32,
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f32,
    pub model_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub base_learning_rate: f32,
    pub decay_rate: f32,
    pub immediate_threshold: f32,
    pub batch_timeout_ms: u64,
    pub epochs_per_batch: usize,
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                key_prefix: "hybridrec".to_string(),
            },
            cache: CacheConfig {
                backend: CacheBackend::Memory,
                recommendation_ttl_seconds: 300,
                recent_ratings_cap: 50,
                recent_ratings_ttl_seconds: 86_400,
                high_signal_rating: 8.0,
                low_signal_rating: 3.0,
            },
            profile: ProfileConfig {
                max_events: 1000,
                session_gap_minutes: 30,
                recency_half_life_days: 30.0,
                high_rating_threshold: 7.0,
                runtime_padding_minutes: 15,
                year_padding: 3,
                cache_ttl_seconds: 300,
                max_cached_profiles: 10_000,
            },
            recommendation: RecommendationConfig {
                candidate_pool_size: 500,
                default_count: 20,
                max_count: 100,
                neighbor_count: 20,
                min_neighbor_overlap: 2,
                neighbor_similarity: SimilarityMetric::Cosine,
            },
            training: TrainingConfig {
                factors: 50,
                user_capacity: 10_000,
                item_capacity: 10_000,
                learning_rate: 0.01,
                regularization: 0.02,
                init_std_dev: 0.1,
                epochs: 10,
                batch_size: 256,
                validation_split: 0.1,
                model_dir: "models".to_string(),
            },
            pipeline: PipelineConfig {
                queue_capacity: 10_000,
                batch_size: 100,
                flush_interval_ms: 5_000,
                base_learning_rate: 0.01,
                decay_rate: 0.99,
                immediate_threshold: 0.8,
                batch_timeout_ms: 30_000,
                epochs_per_batch: 1,
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&Config::default())?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("HYBRIDREC").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
