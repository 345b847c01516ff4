use crate::config::Config;
use crate::error::EngineResult;
use crate::models::*;
use crate::services::cache::{KeyValueCache, RecentRating, RecommendationCache};
use crate::services::hybrid::{weights_for_rating_count, HybridCombiner, SourceScores};
use crate::services::learning::{compute_priority, BatchOutcome, OnlineLearningPipeline, PriorityInputs};
use crate::services::metrics::{self, MetricsSink, MetricsSnapshot};
use crate::services::profile::ProfileBuilder;
use crate::services::scoring::{CollaborativeScorer, ContentScorer, PopularityScorer, ScoreMap};
use crate::services::store::{InteractionLog, ItemCatalog};
use crate::services::training::ModelService;
use crate::utils::validation::{validate_interaction_event, validate_rating, validate_recommendation_options};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cached profile state of one user. `generation` changes on every
/// interaction so a build that read the log before the change can tell its
/// result is stale.
struct ProfileSlot {
    generation: u64,
    profile: Option<Arc<PreferenceProfile>>,
    touched: Instant,
}

pub struct RecommendationService {
    log: Arc<dyn InteractionLog>,
    catalog: Arc<dyn ItemCatalog>,
    cache: RecommendationCache,
    model: Arc<ModelService>,
    pipeline: Arc<OnlineLearningPipeline>,
    metrics: Arc<dyn MetricsSink>,
    profiles: ProfileBuilder,
    content: ContentScorer,
    collaborative: CollaborativeScorer,
    popularity: PopularityScorer,
    combiner: HybridCombiner,
    user_profiles_cache: DashMap<Uuid, ProfileSlot>,
    profile_clock: AtomicU64,
    config: Arc<Config>,
}

impl RecommendationService {
    pub fn new(
        config: Arc<Config>,
        log: Arc<dyn InteractionLog>,
        catalog: Arc<dyn ItemCatalog>,
        kv: Arc<dyn KeyValueCache>,
        model: Arc<ModelService>,
        pipeline: Arc<OnlineLearningPipeline>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            cache: RecommendationCache::new(kv, config.redis.key_prefix.clone(), config.cache.clone()),
            collaborative: CollaborativeScorer::new(model.clone(), log.clone(), config.recommendation.clone()),
            profiles: ProfileBuilder::new(config.profile.clone()),
            content: ContentScorer::new(),
            popularity: PopularityScorer::new(),
            combiner: HybridCombiner::new(),
            user_profiles_cache: DashMap::new(),
            profile_clock: AtomicU64::new(0),
            log,
            catalog,
            model,
            pipeline,
            metrics,
            config,
        }
    }

    /// Ranked recommendations for one user. Only malformed options and
    /// log/catalog failures are errors; a missing or untrained model just
    /// shifts the ranking onto content and popularity.
    pub async fn generate_recommendations(
        &self,
        user_id: Uuid,
        options: RecommendationOptions,
    ) -> EngineResult<RecommendationResponse> {
        let started = Instant::now();
        validate_recommendation_options(&options, self.config.recommendation.max_count)?;

        let cached = self.cache.get(user_id, &options).await.unwrap_or_else(|e| {
            warn!("Recommendation cache lookup failed for user {}: {}", user_id, e);
            None
        });

        // A rating below the invalidation threshold leaves the list cached,
        // so a hit is checked against the items rated since.
        let mut profile = None;
        if let Some(mut cached) = cached {
            let outdated = if options.exclude_rated {
                let current = self.get_or_build_profile(user_id).await?;
                let outdated = cached
                    .recommendations
                    .iter()
                    .any(|r| current.rated_items.contains_key(&r.item_id));
                profile = Some(current);
                outdated
            } else {
                false
            };
            if !outdated {
                self.metrics.incr_counter(metrics::CACHE_HIT, 1);
                cached.from_cache = true;
                return Ok(cached);
            }
            debug!("Cached recommendations for user {} include rated items, regenerating", user_id);
        }
        self.metrics.incr_counter(metrics::CACHE_MISS, 1);

        let profile = match profile {
            Some(profile) => profile,
            None => self.get_or_build_profile(user_id).await?,
        };
        let weights = weights_for_rating_count(profile.rating_count);

        let candidates: Arc<Vec<ItemFeatures>> = Arc::new(
            self.catalog
                .candidate_pool(self.config.recommendation.candidate_pool_size)
                .await?
                .into_iter()
                .filter(|item| options.admits(item))
                .filter(|item| !(options.exclude_rated && profile.rated_items.contains_key(&item.item_id)))
                .filter(|item| !(options.exclude_watchlisted && profile.watchlist.contains(&item.item_id)))
                .collect(),
        );

        // Content scoring fans out over rayon; keep it off the async workers.
        let content_task = {
            let (scorer, profile, candidates) = (self.content, profile.clone(), candidates.clone());
            tokio::task::spawn_blocking(move || scorer.score(&profile, &candidates))
        };
        let (content, collaborative) =
            tokio::join!(content_task, self.collaborative.score(&profile, &candidates));
        let content = content.unwrap_or_else(|e| {
            warn!("Content scoring task failed for user {}: {}", user_id, e);
            ScoreMap::new()
        });
        let collaborative = collaborative.unwrap_or_else(|e| {
            warn!("Collaborative scoring unavailable for user {}: {}", user_id, e);
            ScoreMap::new()
        });
        let popularity = self.popularity.score(&candidates);
        // Nothing to personalize on yet: popularity stands in for content.
        let content = if profile.is_cold_start() { popularity.clone() } else { content };

        let scores = SourceScores {
            content,
            collaborative,
            popularity,
        };
        let recommendations = self.combiner.rank(&profile, &candidates, &scores, weights, &options);

        let response = RecommendationResponse {
            user_id,
            recommendations,
            weights,
            from_cache: false,
            generated_at: Utc::now(),
        };

        self.metrics.incr_counter(metrics::RECOMMENDATIONS_SERVED, 1);
        if !response.recommendations.is_empty() {
            let avg = response.recommendations.iter().map(|r| r.score as f64).sum::<f64>()
                / response.recommendations.len() as f64;
            self.metrics.record_value(metrics::RECOMMENDATIONS_AVG_SCORE, avg);
        }
        self.metrics.record_timing(metrics::RECOMMENDATION_LATENCY, started.elapsed());

        if let Err(e) = self.cache.put(&response, &options).await {
            warn!("Failed to cache recommendations for user {}: {}", user_id, e);
        }

        debug!(
            "Generated {} recommendations for user {} from {} candidates",
            response.recommendations.len(),
            user_id,
            candidates.len()
        );
        Ok(response)
    }

    /// Persists a rating and hands it to the online learning pipeline.
    pub async fn record_rating(&self, user_id: Uuid, item_id: Uuid, rating: f32) -> EngineResult<RatingReceipt> {
        validate_rating(user_id, item_id, rating)?;

        // Priority is judged against the history before this rating.
        let profile = self.get_or_build_profile(user_id).await?;
        let vote_count = self.catalog.item(item_id).await?.map_or(0, |item| item.vote_count);

        self.log.append(InteractionEvent::rating(user_id, item_id, rating)).await?;
        self.invalidate_profile(user_id);

        let cache_invalidated = match self.cache.record_rating(user_id, item_id, rating).await {
            Ok(invalidated) => invalidated,
            Err(e) => {
                warn!("Failed to update rating cache for user {}: {}", user_id, e);
                false
            }
        };

        let priority = compute_priority(&PriorityInputs {
            user_rating_count: profile.rating_count,
            user_average: (!profile.is_cold_start()).then_some(profile.average_rating),
            rating,
            item_vote_count: vote_count,
            recency: 1.0,
        });
        let submission = self.pipeline.submit(RatingSample::new(user_id, item_id, rating), priority);
        self.metrics.incr_counter(metrics::RATINGS_RECORDED, 1);

        info!(
            "Recorded rating {} for user {} on item {} (priority {:.3})",
            rating, user_id, item_id, submission.priority
        );
        Ok(RatingReceipt {
            user_id,
            item_id,
            rating,
            priority: submission.priority,
            applied_immediately: submission.applied_immediately,
            evicted: submission.evicted,
            cache_invalidated,
        })
    }

    /// Persists a non-rating interaction. Ratings go through `record_rating`.
    pub async fn record_interaction(&self, event: InteractionEvent) -> EngineResult<()> {
        if event.action_type == ActionType::Rate {
            return self.record_rating(event.user_id, event.item_id, event.value).await.map(|_| ());
        }
        validate_interaction_event(&event)?;

        let user_id = event.user_id;
        let moves_watchlist = matches!(event.action_type, ActionType::AddWatchlist | ActionType::RemoveWatchlist);
        self.log.append(event).await?;
        self.invalidate_profile(user_id);

        if moves_watchlist {
            if let Err(e) = self.cache.invalidate(user_id).await {
                warn!("Failed to invalidate recommendations for user {}: {}", user_id, e);
            }
        }
        Ok(())
    }

    /// Request options with the configured default count.
    pub fn default_options(&self) -> RecommendationOptions {
        RecommendationOptions::default().with_count(self.config.recommendation.default_count)
    }

    async fn get_or_build_profile(&self, user_id: Uuid) -> EngineResult<Arc<PreferenceProfile>> {
        let ttl = self.config.profile.cache_ttl();
        let seen = match self.user_profiles_cache.get(&user_id) {
            Some(slot) => match &slot.profile {
                Some(profile) if slot.touched.elapsed() < ttl => return Ok(profile.clone()),
                _ => Some(slot.generation),
            },
            None => None,
        };

        let events = self.log.events_for_user(user_id, self.profiles.max_events()).await?;
        let item_ids: Vec<Uuid> = events
            .iter()
            .map(|e| e.item_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let items = self.catalog.items(&item_ids).await?;

        let profile = Arc::new(self.profiles.build(user_id, &events, &items, Utc::now()));
        if profile.is_cold_start() {
            debug!("User {} has no ratings, using cold-start weights", user_id);
        }
        self.store_profile(user_id, seen, profile.clone());
        Ok(profile)
    }

    /// Caches `profile` unless an interaction arrived after the build
    /// observed generation `seen`.
    fn store_profile(&self, user_id: Uuid, seen: Option<u64>, profile: Arc<PreferenceProfile>) {
        let stored = match self.user_profiles_cache.entry(user_id) {
            Entry::Occupied(mut slot) if Some(slot.get().generation) == seen => {
                let slot = slot.get_mut();
                slot.profile = Some(profile);
                slot.touched = Instant::now();
                true
            }
            Entry::Vacant(slot) if seen.is_none() => {
                slot.insert(ProfileSlot {
                    generation: self.next_generation(),
                    profile: Some(profile),
                    touched: Instant::now(),
                });
                true
            }
            _ => false,
        };
        if !stored {
            debug!("Profile of user {} changed while building, not caching it", user_id);
            return;
        }

        let ttl = self.config.profile.cache_ttl();
        if self.user_profiles_cache.len() > self.config.profile.max_cached_profiles {
            self.user_profiles_cache.retain(|_, slot| slot.touched.elapsed() < ttl);
            debug!("Pruned profile cache to {} users", self.user_profiles_cache.len());
        }
    }

    fn next_generation(&self) -> u64 {
        self.profile_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drops the cached profile and moves the user to a new generation.
    fn invalidate_profile(&self, user_id: Uuid) {
        let slot = ProfileSlot {
            generation: self.next_generation(),
            profile: None,
            touched: Instant::now(),
        };
        self.user_profiles_cache.insert(user_id, slot);
    }

    pub async fn user_profile(&self, user_id: Uuid) -> EngineResult<PreferenceProfile> {
        Ok(self.get_or_build_profile(user_id).await?.as_ref().clone())
    }

    pub async fn recent_ratings(&self, user_id: Uuid) -> EngineResult<Vec<RecentRating>> {
        Ok(self.cache.recent_ratings(user_id).await?)
    }

    pub async fn force_flush(&self) -> BatchOutcome {
        self.pipeline.force_flush().await
    }

    pub fn clear_queue(&self) -> usize {
        self.pipeline.clear()
    }

    pub fn pipeline_health(&self) -> PipelineHealth {
        self.pipeline.health()
    }

    pub fn model_stats(&self) -> ModelStats {
        self.model.stats()
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.report()
    }

    pub async fn save_model(&self, version: Option<String>) -> EngineResult<String> {
        self.model.save(version).await
    }

    /// Swaps in a stored model. Profiles stay valid; cached lists expire on
    /// their own TTL.
    pub async fn load_model(&self, version: &str) -> EngineResult<ModelStats> {
        self.model.load(version).await
    }
}
