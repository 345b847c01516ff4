pub mod store;

use crate::algorithms::{EmbeddingModel, ModelHyperParams, Prediction};
use crate::config::TrainingConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::ModelStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sole owner of the embedding model.
///
/// Readers clone an `Arc` snapshot and never wait on training. Every
/// mutation passes the writer gate first, so at most one gradient session
/// touches the parameters at a time.
pub struct ModelService {
    model: Arc<RwLock<Arc<EmbeddingModel>>>,
    writer: Arc<Mutex<()>>,
    store: Option<Arc<dyn ModelStore>>,
    config: TrainingConfig,
}

impl Clone for ModelService {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            writer: self.writer.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl ModelService {
    pub fn new(config: TrainingConfig) -> Self {
        let model = EmbeddingModel::new(ModelHyperParams::from(&config));
        Self {
            model: Arc::new(RwLock::new(Arc::new(model))),
            writer: Arc::new(Mutex::new(())),
            store: None,
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ModelStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Current published parameters. Stays valid while training publishes
    /// newer ones.
    pub fn snapshot(&self) -> Arc<EmbeddingModel> {
        self.model.read().clone()
    }

    pub fn stats(&self) -> ModelStats {
        self.snapshot().stats()
    }

    pub fn is_training(&self) -> bool {
        self.writer.try_lock().is_err()
    }

    fn publish(&self, model: EmbeddingModel) {
        *self.model.write() = Arc::new(model);
    }

    /// Replaces the model with freshly initialized parameters.
    pub fn build(&self, user_count: usize, item_count: usize, factors: usize) -> EngineResult<()> {
        let _gate = self.writer.try_lock().map_err(|_| EngineError::TrainingInProgress)?;
        let mut model = EmbeddingModel::new(ModelHyperParams::from(&self.config));
        model.build(user_count, item_count, factors)?;
        self.publish(model);
        Ok(())
    }

    /// `build` with the configured capacities and factor count.
    pub fn build_default(&self) -> EngineResult<()> {
        self.build(self.config.user_capacity, self.config.item_capacity, self.config.factors)
    }

    pub fn predict(&self, user_id: Uuid, items: &[Uuid]) -> EngineResult<Vec<Prediction>> {
        self.snapshot().predict(user_id, items)
    }

    /// One gradient step for one rating. Rejected while another session
    /// holds the model.
    pub fn incremental_train(&self, sample: &RatingSample, learning_rate: Option<f32>) -> EngineResult<f32> {
        let _gate = self.writer.try_lock().map_err(|_| EngineError::TrainingInProgress)?;
        let rate = learning_rate.unwrap_or(self.config.learning_rate);

        let mut current = self.model.write();
        Arc::make_mut(&mut current).incremental_train(sample, rate)
    }

    /// Full training session. Rejected while another session holds the model.
    pub async fn batch_train(&self, samples: Vec<RatingSample>, options: TrainOptions) -> EngineResult<TrainingReport> {
        let _gate = self.writer.try_lock().map_err(|_| EngineError::TrainingInProgress)?;
        self.train_copy(samples, options, None).await
    }

    /// Training session that waits for the model instead of rejecting, but
    /// gives up (and discards its work) once `limit` has elapsed.
    pub async fn batch_train_within(
        &self,
        samples: Vec<RatingSample>,
        options: TrainOptions,
        limit: Duration,
    ) -> EngineResult<TrainingReport> {
        let started = Instant::now();
        let _gate = tokio::time::timeout(limit, self.writer.lock())
            .await
            .map_err(|_| EngineError::TrainingTimeout(limit))?;

        let remaining = limit.saturating_sub(started.elapsed());
        self.train_copy(samples, options, Some(remaining)).await
    }

    /// Trains a private copy on the blocking pool and publishes it on
    /// success. Caller must hold the writer gate.
    async fn train_copy(
        &self,
        samples: Vec<RatingSample>,
        options: TrainOptions,
        limit: Option<Duration>,
    ) -> EngineResult<TrainingReport> {
        let mut working = (*self.snapshot()).clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let report = working.batch_train(&samples, &options, &flag)?;
            Ok::<_, EngineError>((working, report))
        });

        let joined = match limit {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.store(true, Ordering::Relaxed);
                    warn!("Training session exceeded {:?}, discarding its parameters", limit);
                    return Err(EngineError::TrainingTimeout(limit));
                }
            },
            None => handle.await,
        };

        let (trained, report) = joined
            .map_err(|e| EngineError::Collaborator(anyhow::anyhow!("training task failed: {}", e)))??;
        self.publish(trained);
        debug!("Published trained model ({} samples)", report.samples_used);
        Ok(report)
    }

    fn store(&self) -> EngineResult<&Arc<dyn ModelStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| EngineError::PreconditionViolation("no model store configured".to_string()))
    }

    /// Persists the current parameters. Returns the version written.
    pub async fn save(&self, version: Option<String>) -> EngineResult<String> {
        let store = self.store()?;
        let version = version.unwrap_or_else(|| format!("v{}", Utc::now().timestamp_millis()));
        let params = self.snapshot().to_parameters(&version)?;
        store.save(&params).await?;
        info!("Model saved as version {}", version);
        Ok(version)
    }

    /// Replaces the model with a stored version.
    pub async fn load(&self, version: &str) -> EngineResult<ModelStats> {
        let store = self.store()?.clone();
        let _gate = self.writer.try_lock().map_err(|_| EngineError::TrainingInProgress)?;

        let params = store.load(version).await?;
        let model = EmbeddingModel::from_parameters(&params, ModelHyperParams::from(&self.config))?;
        let stats = model.stats();
        self.publish(model);
        info!("Model version {} loaded: {} users, {} items", version, stats.users, stats.items);
        Ok(stats)
    }

    /// Loads the newest stored version, if any.
    pub async fn load_latest(&self) -> EngineResult<Option<String>> {
        let Some(version) = self.store()?.latest_version().await? else {
            return Ok(None);
        };
        self.load(&version).await?;
        Ok(Some(version))
    }
}
