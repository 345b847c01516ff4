pub mod queue;

use crate::algorithms::optimizer::ExponentialDecay;
use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::models::*;
use crate::services::metrics::{self, MetricsSink};
use crate::services::training::ModelService;
use crate::utils::{clamp_unit, vote_count_score};
use chrono::Utc;
use parking_lot::Mutex;
use queue::UpdateQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Average assumed for users with no ratings yet: the scale midpoint.
const DEFAULT_USER_AVERAGE: f32 = 5.5;

/// What is known about a rating when it arrives.
#[derive(Debug, Clone, Copy)]
pub struct PriorityInputs {
    pub user_rating_count: usize,
    pub user_average: Option<f32>,
    pub rating: f32,
    pub item_vote_count: u32,
    /// 1 for events that just happened.
    pub recency: f32,
}

pub fn priority_from_terms(activity: f32, deviation: f32, popularity: f32, recency: f32) -> f32 {
    clamp_unit(
        0.3 * clamp_unit(activity)
            + 0.3 * clamp_unit(deviation)
            + 0.2 * clamp_unit(popularity)
            + 0.2 * clamp_unit(recency),
    )
}

/// How urgently a rating should reach the model, on [0, 1].
pub fn compute_priority(inputs: &PriorityInputs) -> f32 {
    let activity = inputs.user_rating_count as f32 / 100.0;
    let average = inputs.user_average.unwrap_or(DEFAULT_USER_AVERAGE);
    let deviation = (inputs.rating - average).abs() / 5.0;
    priority_from_terms(activity, deviation, vote_count_score(inputs.item_vote_count), inputs.recency)
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub priority: f32,
    pub applied_immediately: bool,
    /// Sequence number of the update evicted to make room, if any.
    pub evicted: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Nothing was queued.
    Empty,
    /// Another batch held the in-flight guard; this trigger was collapsed into it.
    AlreadyRunning,
    Trained {
        size: usize,
        loss: Option<f64>,
        learning_rate: f32,
        duration: Duration,
    },
    Failed {
        size: usize,
        error: String,
    },
}

/// Clears the in-flight flag however the batch ends.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct PipelineCounters {
    batches_processed: u64,
    batches_failed: u64,
    updates_trained: u64,
    updates_dropped: u64,
    updates_evicted: u64,
    updates_cleared: u64,
    immediate_applied: u64,
    immediate_skipped: u64,
    last_batch_size: usize,
    last_batch_duration_ms: u64,
    last_batch_loss: Option<f64>,
    last_batch_at: Option<chrono::DateTime<Utc>>,
}

/// Folds rating feedback back into the embedding model without blocking
/// the caller: every rating is queued by priority and trained in batches,
/// and very high-priority ratings also get one immediate gradient step.
///
/// Ratings applied immediately are trained again when their batch runs.
/// The model state therefore depends on which ratings crossed the
/// immediate threshold, not only on the rating log.
pub struct OnlineLearningPipeline {
    queue: Arc<UpdateQueue>,
    model: Arc<ModelService>,
    metrics: Arc<dyn MetricsSink>,
    config: PipelineConfig,
    schedule: ExponentialDecay,
    next_seq: Arc<AtomicU64>,
    in_flight: Arc<AtomicBool>,
    counters: Arc<Mutex<PipelineCounters>>,
}

impl Clone for OnlineLearningPipeline {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            model: self.model.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            schedule: self.schedule,
            next_seq: self.next_seq.clone(),
            in_flight: self.in_flight.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl OnlineLearningPipeline {
    pub fn new(model: Arc<ModelService>, metrics: Arc<dyn MetricsSink>, config: PipelineConfig) -> Self {
        Self {
            queue: Arc::new(UpdateQueue::new(config.queue_capacity)),
            model,
            metrics,
            schedule: ExponentialDecay::new(config.base_learning_rate, config.decay_rate),
            config,
            next_seq: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Mutex::new(PipelineCounters::default())),
        }
    }

    pub fn current_learning_rate(&self) -> f32 {
        self.schedule.rate_at(self.counters.lock().batches_processed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queues one rating and returns without waiting for training.
    pub fn submit(&self, sample: RatingSample, priority: f32) -> Submission {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let update = PendingUpdate::new(seq, sample.user_id, sample.item_id, sample.rating, priority);
        let priority = update.priority;

        let evicted = self.queue.push(update).map(|dropped| {
            warn!(
                "Update queue full ({}), evicted update {} with priority {:.3}",
                self.queue.capacity(),
                dropped.seq,
                dropped.priority
            );
            self.counters.lock().updates_evicted += 1;
            self.metrics.incr_counter(metrics::PIPELINE_EVICTED, 1);
            dropped.seq
        });

        let applied_immediately = priority > self.config.immediate_threshold
            && evicted != Some(seq)
            && self.apply_immediately(&sample);

        if self.queue.len() >= self.config.batch_size && !self.in_flight.load(Ordering::Acquire) {
            self.trigger_batch();
        }

        Submission {
            priority,
            applied_immediately,
            evicted,
        }
    }

    fn apply_immediately(&self, sample: &RatingSample) -> bool {
        match self.model.incremental_train(sample, Some(self.current_learning_rate())) {
            Ok(loss) => {
                debug!(
                    "Applied rating {}/{} immediately (squared error {:.4})",
                    sample.user_id, sample.item_id, loss
                );
                self.counters.lock().immediate_applied += 1;
                true
            }
            Err(EngineError::TrainingInProgress) => {
                debug!("Immediate update skipped: training session in progress");
                self.counters.lock().immediate_skipped += 1;
                false
            }
            Err(e) => {
                warn!("Immediate update failed: {}", e);
                self.counters.lock().immediate_skipped += 1;
                false
            }
        }
    }

    fn trigger_batch(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; leaving batch to the next flush");
            return;
        };
        let pipeline = self.clone();
        runtime.spawn(async move {
            let outcome = pipeline.run_batch().await;
            debug!("Threshold-triggered batch: {:?}", outcome);
        });
    }

    /// Trains the highest-priority queued updates. Overlapping calls
    /// collapse: only one batch runs at a time.
    pub async fn run_batch(&self) -> BatchOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            return BatchOutcome::AlreadyRunning;
        };

        let batch = self.queue.pop_batch(self.config.batch_size);
        if batch.is_empty() {
            return BatchOutcome::Empty;
        }

        let size = batch.len();
        let learning_rate = self.current_learning_rate();
        let samples: Vec<RatingSample> = batch.iter().map(PendingUpdate::sample).collect();
        let options = TrainOptions {
            epochs: self.config.epochs_per_batch.max(1),
            batch_size: size,
            validation_split: 0.0,
            learning_rate: Some(learning_rate),
        };

        let started = Instant::now();
        let result = self
            .model
            .batch_train_within(samples, options, self.config.batch_timeout())
            .await;
        let duration = started.elapsed();

        match result {
            Ok(report) => {
                let loss = report.final_train_loss();
                {
                    let mut counters = self.counters.lock();
                    counters.batches_processed += 1;
                    counters.updates_trained += report.samples_used as u64;
                    counters.updates_dropped += report.samples_skipped as u64;
                    counters.last_batch_size = size;
                    counters.last_batch_duration_ms = duration.as_millis() as u64;
                    counters.last_batch_loss = loss;
                    counters.last_batch_at = Some(Utc::now());
                }
                self.metrics.record_value(metrics::PIPELINE_BATCH_SIZE, size as f64);
                self.metrics.record_timing(metrics::PIPELINE_BATCH_DURATION, duration);
                info!(
                    "Trained batch of {} updates in {:?} (lr {:.5}, loss {:?})",
                    size, duration, learning_rate, loss
                );
                BatchOutcome::Trained {
                    size,
                    loss,
                    learning_rate,
                    duration,
                }
            }
            Err(e) => {
                let failure = match e {
                    EngineError::TransientIngestionFailure(_) => e,
                    other => EngineError::TransientIngestionFailure(other.to_string()),
                };
                {
                    let mut counters = self.counters.lock();
                    counters.batches_failed += 1;
                    counters.updates_dropped += size as u64;
                }
                self.metrics.incr_counter(metrics::PIPELINE_BATCH_FAILED, 1);
                error!("Batch of {} updates failed and was dropped: {}", size, failure);
                BatchOutcome::Failed {
                    size,
                    error: failure.to_string(),
                }
            }
        }
    }

    /// Runs the normal batch path now. A no-op on an empty queue.
    pub async fn force_flush(&self) -> BatchOutcome {
        self.run_batch().await
    }

    /// Drops every queued update. A batch already training keeps its updates.
    pub fn clear(&self) -> usize {
        let removed = self.queue.clear();
        if removed > 0 {
            self.counters.lock().updates_cleared += removed as u64;
            info!("Cleared {} pending updates", removed);
        }
        removed
    }

    pub fn pending(&self, max: usize) -> Vec<PendingUpdate> {
        self.queue.peek(max)
    }

    pub fn health(&self) -> PipelineHealth {
        let counters = self.counters.lock();
        PipelineHealth {
            queue_len: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            batch_in_flight: self.in_flight.load(Ordering::Acquire),
            batches_processed: counters.batches_processed,
            batches_failed: counters.batches_failed,
            updates_trained: counters.updates_trained,
            updates_dropped: counters.updates_dropped,
            updates_evicted: counters.updates_evicted,
            updates_cleared: counters.updates_cleared,
            immediate_applied: counters.immediate_applied,
            immediate_skipped: counters.immediate_skipped,
            current_learning_rate: self.schedule.rate_at(counters.batches_processed),
            last_batch_size: counters.last_batch_size,
            last_batch_duration_ms: counters.last_batch_duration_ms,
            last_batch_loss: counters.last_batch_loss,
            last_batch_at: counters.last_batch_at,
        }
    }

    /// Starts the periodic flush worker.
    pub fn start(&self) -> PipelineWorker {
        let (shutdown, mut stop) = watch::channel(false);
        let pipeline = self.clone();
        let period = self.config.flush_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!("Online learning worker started (flush every {:?})", period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if pipeline.queue.is_empty() {
                            continue;
                        }
                        match pipeline.run_batch().await {
                            BatchOutcome::Failed { size, error } => {
                                warn!("Timer batch of {} failed: {}", size, error);
                            }
                            outcome => debug!("Timer batch: {:?}", outcome),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Online learning worker stopped");
        });

        PipelineWorker { shutdown, handle }
    }
}

pub struct PipelineWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PipelineWorker {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Online learning worker ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::metrics::InMemoryMetrics;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use uuid::Uuid;

    fn pipeline_with(configure: impl FnOnce(&mut Config)) -> (OnlineLearningPipeline, Arc<ModelService>, Arc<InMemoryMetrics>) {
        let mut config = Config::default();
        config.training.factors = 4;
        config.training.user_capacity = 64;
        config.training.item_capacity = 64;
        configure(&mut config);

        let model = Arc::new(ModelService::new(config.training.clone()));
        model.build_default().unwrap();
        let sink = Arc::new(InMemoryMetrics::new());
        let pipeline = OnlineLearningPipeline::new(model.clone(), sink.clone(), config.pipeline);
        (pipeline, model, sink)
    }

    fn sample(rating: f32) -> RatingSample {
        RatingSample::new(Uuid::new_v4(), Uuid::new_v4(), rating)
    }

    #[test]
    fn test_priority_example() {
        assert!((priority_from_terms(0.05, 0.6, 0.5, 1.0) - 0.495).abs() < 1e-6);

        let inputs = PriorityInputs {
            user_rating_count: 5,
            user_average: Some(5.0),
            rating: 8.0,
            item_vote_count: 99,
            recency: 1.0,
        };
        assert!((compute_priority(&inputs) - 0.495).abs() < 1e-4);
    }

    #[test]
    fn test_priority_stays_in_unit_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let inputs = PriorityInputs {
                user_rating_count: rng.gen_range(0..10_000),
                user_average: rng.gen_bool(0.8).then(|| rng.gen_range(1.0..=10.0)),
                rating: rng.gen_range(1.0..=10.0),
                item_vote_count: rng.gen_range(0..5_000_000),
                recency: rng.gen_range(0.0..=1.0),
            };
            let p = compute_priority(&inputs);
            assert!((0.0..=1.0).contains(&p), "priority {} out of range", p);
        }
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_noop() {
        let (pipeline, model, _) = pipeline_with(|_| {});
        let generation = model.stats().generation;

        assert_eq!(pipeline.force_flush().await, BatchOutcome::Empty);
        assert_eq!(pipeline.force_flush().await, BatchOutcome::Empty);
        assert_eq!(model.stats().generation, generation);
        assert_eq!(pipeline.health().batches_processed, 0);
    }

    #[tokio::test]
    async fn test_clear_twice_equals_once() {
        let (pipeline, _, _) = pipeline_with(|_| {});
        for _ in 0..3 {
            pipeline.submit(sample(6.0), 0.3);
        }

        assert_eq!(pipeline.clear(), 3);
        assert_eq!(pipeline.clear(), 0);
        let health = pipeline.health();
        assert_eq!(health.queue_len, 0);
        assert_eq!(health.updates_cleared, 3);
    }

    #[tokio::test]
    async fn test_batch_trains_and_decays_learning_rate() {
        let (pipeline, model, sink) = pipeline_with(|c| c.pipeline.decay_rate = 0.5);
        let base = pipeline.current_learning_rate();
        for rating in [2.0, 4.0, 9.0] {
            pipeline.submit(sample(rating), 0.4);
        }

        match pipeline.force_flush().await {
            BatchOutcome::Trained { size, learning_rate, .. } => {
                assert_eq!(size, 3);
                assert_eq!(learning_rate, base);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let health = pipeline.health();
        assert_eq!(health.updates_trained, 3);
        assert_eq!(health.queue_len, 0);
        assert!((health.current_learning_rate - base * 0.5).abs() < 1e-9);
        assert_eq!(model.stats().users, 3);
        assert_eq!(sink.snapshot().values[metrics::PIPELINE_BATCH_SIZE].last, 3.0);
    }

    #[tokio::test]
    async fn test_high_priority_applies_immediately() {
        let (pipeline, model, _) = pipeline_with(|_| {});

        let low = pipeline.submit(sample(5.0), 0.5);
        assert!(!low.applied_immediately);
        assert_eq!(model.stats().users, 0);

        let high = pipeline.submit(sample(10.0), 0.95);
        assert!(high.applied_immediately);
        assert_eq!(model.stats().users, 1);
        assert_eq!(pipeline.queue_len(), 2);
        assert_eq!(pipeline.health().immediate_applied, 1);
    }

    #[tokio::test]
    async fn test_overflow_reports_eviction() {
        let (pipeline, _, _) = pipeline_with(|c| {
            c.pipeline.queue_capacity = 2;
            c.pipeline.batch_size = 100;
        });
        pipeline.submit(sample(5.0), 0.5);
        pipeline.submit(sample(5.0), 0.2);
        let third = pipeline.submit(sample(5.0), 0.6);

        assert_eq!(third.evicted, Some(1));
        assert_eq!(pipeline.health().updates_evicted, 1);
        assert_eq!(pipeline.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_drops_updates() {
        let mut config = Config::default();
        config.training.factors = 4;
        let model = Arc::new(ModelService::new(config.training.clone()));
        let pipeline = OnlineLearningPipeline::new(model, Arc::new(InMemoryMetrics::new()), config.pipeline);

        pipeline.submit(sample(7.0), 0.5);
        match pipeline.force_flush().await {
            BatchOutcome::Failed { size, error } => {
                assert_eq!(size, 1);
                assert!(error.starts_with("transient ingestion failure"));
            }
            other => panic!("expected a failed batch, got {:?}", other),
        }

        let health = pipeline.health();
        assert_eq!(health.batches_failed, 1);
        assert_eq!(health.updates_dropped, 1);
        assert_eq!(health.queue_len, 0);

        pipeline.submit(sample(7.0), 0.5);
        assert_eq!(pipeline.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_batch_is_collapsed() {
        let (pipeline, _, _) = pipeline_with(|_| {});
        pipeline.submit(sample(6.0), 0.3);
        pipeline.submit(sample(3.0), 0.3);

        let guard = InFlight::acquire(&pipeline.in_flight).unwrap();
        assert_eq!(pipeline.run_batch().await, BatchOutcome::AlreadyRunning);
        assert_eq!(pipeline.queue_len(), 2);
        assert!(pipeline.health().batch_in_flight);

        drop(guard);
        assert!(matches!(pipeline.run_batch().await, BatchOutcome::Trained { size: 2, .. }));
        assert!(!pipeline.health().batch_in_flight);
    }

    #[tokio::test]
    async fn test_full_batch_triggers_training() {
        let (pipeline, model, _) = pipeline_with(|c| c.pipeline.batch_size = 4);
        for rating in [2.0, 5.0, 7.0] {
            pipeline.submit(sample(rating), 0.3);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.health().batches_processed, 0);
        assert_eq!(pipeline.queue_len(), 3);

        pipeline.submit(sample(9.0), 0.3);
        let mut trained = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if pipeline.health().batches_processed == 1 {
                trained = true;
                break;
            }
        }
        assert!(trained);
        assert_eq!(pipeline.queue_len(), 0);
        assert_eq!(model.stats().users, 4);
    }

    #[tokio::test]
    async fn test_batch_timeout_drops_updates() {
        let (pipeline, model, sink) = pipeline_with(|c| {
            c.pipeline.batch_timeout_ms = 1;
            c.pipeline.epochs_per_batch = 100_000;
        });
        let base = pipeline.current_learning_rate();
        let generation = model.stats().generation;
        for rating in [1.0, 3.0, 4.0, 6.0, 7.0, 8.0, 9.0, 10.0] {
            pipeline.submit(sample(rating), 0.3);
        }

        match pipeline.force_flush().await {
            BatchOutcome::Failed { size, error } => {
                assert_eq!(size, 8);
                assert!(error.contains("timeout"), "unexpected error {}", error);
            }
            other => panic!("expected a timed-out batch, got {:?}", other),
        }

        let health = pipeline.health();
        assert_eq!(health.batches_failed, 1);
        assert_eq!(health.batches_processed, 0);
        assert_eq!(health.updates_dropped, 8);
        assert_eq!(health.queue_len, 0);
        assert_eq!(pipeline.current_learning_rate(), base);
        assert_eq!(model.stats().generation, generation);
        assert_eq!(sink.snapshot().counter(metrics::PIPELINE_BATCH_FAILED), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_leaves_running_batch_alone() {
        let (pipeline, _, _) = pipeline_with(|c| c.pipeline.epochs_per_batch = 5_000);
        for i in 0..40 {
            pipeline.submit(sample(1.0 + (i % 10) as f32), 0.3);
        }

        let running = pipeline.clone();
        let batch = tokio::spawn(async move { running.run_batch().await });

        let mut started = false;
        for _ in 0..1_000 {
            let health = pipeline.health();
            if health.batch_in_flight && health.queue_len == 0 {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(started);

        pipeline.submit(sample(4.0), 0.3);
        pipeline.submit(sample(8.0), 0.3);
        assert_eq!(pipeline.clear(), 2);

        assert!(matches!(batch.await.unwrap(), BatchOutcome::Trained { size: 40, .. }));
        let health = pipeline.health();
        assert_eq!(health.updates_trained, 40);
        assert_eq!(health.updates_cleared, 2);
        assert_eq!(health.queue_len, 0);
    }

    #[tokio::test]
    async fn test_worker_flushes_on_timer() {
        let (pipeline, _, _) = pipeline_with(|c| c.pipeline.flush_interval_ms = 20);
        let worker = pipeline.start();
        pipeline.submit(sample(8.0), 0.4);

        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pipeline.health().batches_processed > 0 {
                flushed = true;
                break;
            }
        }
        worker.shutdown().await;
        assert!(flushed);
        assert_eq!(pipeline.queue_len(), 0);
    }
}
