pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::config::Config;
pub use crate::error::{EngineError, EngineResult};
pub use crate::models::*;

use anyhow::Result;
use crate::config::CacheBackend;
use crate::services::cache::{InMemoryCache, KeyValueCache, RedisCache};
use crate::services::learning::{OnlineLearningPipeline, PipelineWorker};
use crate::services::metrics::{InMemoryMetrics, MetricsSink};
use crate::services::recommendation::RecommendationService;
use crate::services::store::InMemoryStore;
use crate::services::training::store::FileModelStore;
use crate::services::training::ModelService;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<InMemoryStore>,
    pub metrics: Arc<InMemoryMetrics>,
    pub model_service: Arc<ModelService>,
    pub pipeline: Arc<OnlineLearningPipeline>,
    pub recommendation_service: Arc<RecommendationService>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(InMemoryStore::new());

        let kv: Arc<dyn KeyValueCache> = match config.cache.backend {
            CacheBackend::Memory => Arc::new(InMemoryCache::new()),
            CacheBackend::Redis => Arc::new(RedisCache::open(&config.redis.url)?),
        };

        let metrics = Arc::new(InMemoryMetrics::new());
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let model_service = Arc::new(
            ModelService::new(config.training.clone())
                .with_store(Arc::new(FileModelStore::new(&config.training.model_dir))),
        );
        match model_service.load_latest().await? {
            Some(version) => info!("Restored model version {}", version),
            None => {
                model_service.build_default()?;
                info!("No stored model found, built a fresh one");
            }
        }

        let pipeline = Arc::new(OnlineLearningPipeline::new(
            model_service.clone(),
            sink.clone(),
            config.pipeline.clone(),
        ));

        let recommendation_service = Arc::new(RecommendationService::new(
            config.clone(),
            store.clone(),
            store.clone(),
            kv,
            model_service.clone(),
            pipeline.clone(),
            sink,
        ));

        Ok(Self {
            config,
            store,
            metrics,
            model_service,
            pipeline,
            recommendation_service,
        })
    }

    /// Starts the timer-driven batch worker. Dropping the returned handle
    /// without `shutdown` leaves the worker running.
    pub fn start_pipeline(&self) -> PipelineWorker {
        self.pipeline.start()
    }
}

pub async fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
