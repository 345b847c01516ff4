use super::ScoreMap;
use crate::algorithms::neighbors::{find_neighbors, neighbor_rating, UserRatings};
use crate::algorithms::Prediction;
use crate::config::RecommendationConfig;
use crate::models::{ActionType, InteractionEvent, ItemFeatures, PreferenceProfile};
use crate::services::store::InteractionLog;
use crate::services::training::ModelService;
use crate::utils::normalize_rating;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Learned-model scores with a user-user neighborhood fallback for anything
/// the model cannot cover.
pub struct CollaborativeScorer {
    model: Arc<ModelService>,
    log: Arc<dyn InteractionLog>,
    config: RecommendationConfig,
}

impl CollaborativeScorer {
    pub fn new(model: Arc<ModelService>, log: Arc<dyn InteractionLog>, config: RecommendationConfig) -> Self {
        Self { model, log, config }
    }

    pub async fn score(&self, profile: &PreferenceProfile, candidates: &[ItemFeatures]) -> Result<ScoreMap> {
        let ids: Vec<Uuid> = candidates.iter().map(|c| c.item_id).collect();
        let mut scores = ScoreMap::new();

        let snapshot = self.model.snapshot();
        let uncovered: Vec<Uuid> = match snapshot.predict(profile.user_id, &ids) {
            Ok(predictions) => ids
                .iter()
                .zip(predictions)
                .filter_map(|(id, prediction)| match prediction {
                    Prediction::Rating(raw) => {
                        scores.insert(*id, normalize_rating(raw));
                        None
                    }
                    Prediction::NoCoverage => Some(*id),
                })
                .collect(),
            Err(e) => {
                debug!("Model unavailable for user {}: {}", profile.user_id, e);
                ids
            }
        };

        if !uncovered.is_empty() {
            scores.extend(self.neighbor_scores(profile, &uncovered).await?);
        }
        Ok(scores)
    }

    /// Scores from users whose ratings overlap the target's. Empty when the
    /// target has no ratings or no qualifying neighbors exist.
    pub async fn neighbor_scores(&self, profile: &PreferenceProfile, items: &[Uuid]) -> Result<ScoreMap> {
        if profile.rated_items.is_empty() || items.is_empty() {
            return Ok(ScoreMap::new());
        }

        let rated: Vec<Uuid> = profile.rated_items.keys().copied().collect();
        let mut table = ratings_by_user(
            self.log.events_for_items(&rated, Some(ActionType::Rate)).await?,
            profile.user_id,
        );

        let neighbors = find_neighbors(
            profile.user_id,
            &profile.rated_items,
            &table,
            self.config.neighbor_count,
            self.config.min_neighbor_overlap,
            self.config.neighbor_similarity,
        );
        if neighbors.is_empty() {
            debug!("No neighbors for user {}", profile.user_id);
            return Ok(ScoreMap::new());
        }

        let candidate_events = self.log.events_for_items(items, Some(ActionType::Rate)).await?;
        for (user, ratings) in ratings_by_user(candidate_events, profile.user_id) {
            table.entry(user).or_default().extend(ratings);
        }

        Ok(items
            .iter()
            .filter_map(|item| neighbor_rating(item, &neighbors, &table).map(|r| (*item, normalize_rating(r))))
            .collect())
    }
}

/// Latest rating per (user, item), excluding `skip_user`.
fn ratings_by_user(events: Vec<InteractionEvent>, skip_user: Uuid) -> HashMap<Uuid, UserRatings> {
    let mut table: HashMap<Uuid, UserRatings> = HashMap::new();
    for event in events {
        if event.user_id == skip_user || !event.value.is_finite() {
            continue;
        }
        table.entry(event.user_id).or_default().insert(event.item_id, event.value);
    }
    table
}
