use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    View,
    Click,
    Rate,
    WatchTime,
    AddWatchlist,
    RemoveWatchlist,
}

impl ActionType {
    /// How much an action of this kind counts toward genre preference.
    pub fn signal_weight(&self) -> f32 {
        match self {
            ActionType::View => 0.2,
            ActionType::Click => 0.3,
            ActionType::Rate => 1.0,
            ActionType::WatchTime => 0.6,
            ActionType::AddWatchlist => 0.5,
            ActionType::RemoveWatchlist => 0.5,
        }
    }
}

/// One recorded user action. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub action_type: ActionType,
    pub value: f32,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
}

impl InteractionEvent {
    pub fn new(user_id: Uuid, item_id: Uuid, action_type: ActionType, value: f32) -> Self {
        Self {
            user_id,
            item_id,
            action_type,
            value,
            timestamp: Utc::now(),
            session_id: None,
        }
    }

    pub fn rating(user_id: Uuid, item_id: Uuid, rating: f32) -> Self {
        Self::new(user_id, item_id, ActionType::Rate, rating)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Reference metadata for one item, supplied by the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemFeatures {
    pub item_id: Uuid,
    pub title: String,
    pub genres: Vec<String>,
    pub directors: Vec<String>,
    /// Cast in billing order.
    pub cast: Vec<String>,
    pub year: Option<i32>,
    pub runtime_minutes: Option<u32>,
    pub language: Option<String>,
    pub popularity: f32,
    pub vote_average: f32,
    pub vote_count: u32,
}

impl ItemFeatures {
    pub fn new(item_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            item_id,
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_genres(mut self, genres: &[&str]) -> Self {
        self.genres = genres.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_directors(mut self, directors: &[&str]) -> Self {
        self.directors = directors.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_cast(mut self, cast: &[&str]) -> Self {
        self.cast = cast.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_release(mut self, year: i32, runtime_minutes: u32) -> Self {
        self.year = Some(year);
        self.runtime_minutes = Some(runtime_minutes);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_stats(mut self, popularity: f32, vote_average: f32, vote_count: u32) -> Self {
        self.popularity = popularity;
        self.vote_average = vote_average;
        self.vote_count = vote_count;
        self
    }

    pub fn top_billed(&self, n: usize) -> &[String] {
        &self.cast[..self.cast.len().min(n)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeWindow {
    pub min: f32,
    pub ideal: f32,
    pub max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearWindow {
    pub min: i32,
    pub max: i32,
}

/// Preferences derived from a user's interaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceProfile {
    pub user_id: Uuid,
    pub rating_count: usize,
    pub average_rating: f32,
    pub rating_variance: f32,
    pub time_active_days: i64,
    pub session_count: usize,
    pub engagement_score: f32,
    pub genre_preferences: HashMap<String, f32>,
    pub director_preferences: HashMap<String, f32>,
    pub actor_preferences: HashMap<String, f32>,
    pub runtime_window: Option<RuntimeWindow>,
    pub year_window: Option<YearWindow>,
    pub rated_items: HashMap<Uuid, f32>,
    pub watchlist: HashSet<Uuid>,
    pub built_at: DateTime<Utc>,
}

impl PreferenceProfile {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            rating_count: 0,
            average_rating: 0.0,
            rating_variance: 0.0,
            time_active_days: 0,
            session_count: 0,
            engagement_score: 0.0,
            genre_preferences: HashMap::new(),
            director_preferences: HashMap::new(),
            actor_preferences: HashMap::new(),
            runtime_window: None,
            year_window: None,
            rated_items: HashMap::new(),
            watchlist: HashSet::new(),
            built_at: Utc::now(),
        }
    }

    pub fn is_cold_start(&self) -> bool {
        self.rating_count == 0
    }
}

/// One (user, item, rating) observation fed to the embedding model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingSample {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub rating: f32,
}

impl RatingSample {
    pub fn new(user_id: Uuid, item_id: Uuid, rating: f32) -> Self {
        Self { user_id, item_id, rating }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f32,
    /// Overrides the model's configured learning rate when set.
    pub learning_rate: Option<f32>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 256,
            validation_split: 0.1,
            learning_rate: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochLoss {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochLoss>,
    pub samples_used: usize,
    pub samples_skipped: usize,
}

impl TrainingReport {
    pub fn final_train_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.train_loss)
    }
}

/// A rating waiting in the online learning queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub seq: u64,
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub rating: f32,
    pub timestamp: DateTime<Utc>,
    pub priority: f32,
    pub processed: bool,
}

impl PendingUpdate {
    pub fn new(seq: u64, user_id: Uuid, item_id: Uuid, rating: f32, priority: f32) -> Self {
        Self {
            seq,
            user_id,
            item_id,
            rating,
            timestamp: Utc::now(),
            priority: priority.clamp(0.0, 1.0),
            processed: false,
        }
    }

    pub fn sample(&self) -> RatingSample {
        RatingSample::new(self.user_id, self.item_id, self.rating)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceWeights {
    pub content: f32,
    pub collaborative: f32,
    pub popularity: f32,
}

impl SourceWeights {
    pub fn sum(&self) -> f32 {
        self.content + self.collaborative + self.popularity
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub content: Option<f32>,
    pub collaborative: Option<f32>,
    pub popularity: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub item_id: Uuid,
    pub score: f32,
    pub components: ComponentScores,
    pub weights: SourceWeights,
    pub explanations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationOptions {
    pub count: usize,
    pub exclude_rated: bool,
    pub exclude_watchlisted: bool,
    pub min_score: f32,
    pub diversity_factor: f32,
    pub genres: Option<Vec<String>>,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    pub languages: Option<Vec<String>>,
}

impl Default for RecommendationOptions {
    fn default() -> Self {
        Self {
            count: 20,
            exclude_rated: true,
            exclude_watchlisted: false,
            min_score: 0.0,
            diversity_factor: 0.0,
            genres: None,
            min_year: None,
            max_year: None,
            languages: None,
        }
    }
}

impl RecommendationOptions {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_diversity(mut self, factor: f32) -> Self {
        self.diversity_factor = factor;
        self
    }

    pub fn with_genres(mut self, genres: &[&str]) -> Self {
        self.genres = Some(genres.iter().map(|g| g.to_string()).collect());
        self
    }

    /// Whether an item passes the genre, year and language filters.
    pub fn admits(&self, item: &ItemFeatures) -> bool {
        if let Some(ref genres) = self.genres {
            if !item.genres.iter().any(|g| genres.iter().any(|f| f.eq_ignore_ascii_case(g))) {
                return false;
            }
        }
        if let Some(min_year) = self.min_year {
            if item.year.map_or(true, |y| y < min_year) {
                return false;
            }
        }
        if let Some(max_year) = self.max_year {
            if item.year.map_or(true, |y| y > max_year) {
                return false;
            }
        }
        if let Some(ref languages) = self.languages {
            match item.language {
                Some(ref lang) if languages.iter().any(|l| l.eq_ignore_ascii_case(lang)) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub user_id: Uuid,
    pub recommendations: Vec<RecommendationItem>,
    pub weights: SourceWeights,
    pub from_cache: bool,
    pub generated_at: DateTime<Utc>,
}

/// Full persisted state of the embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    pub version: String,
    pub factors: usize,
    pub user_capacity: usize,
    pub item_capacity: usize,
    pub user_ids: Vec<Uuid>,
    pub item_ids: Vec<Uuid>,
    pub user_embedding_weights: Vec<Vec<f32>>,
    pub item_embedding_weights: Vec<Vec<f32>>,
    pub user_bias: Vec<f32>,
    pub item_bias: Vec<f32>,
    pub global_bias: f32,
    pub ratings_seen: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub built: bool,
    pub factors: usize,
    pub users: usize,
    pub items: usize,
    pub user_capacity: usize,
    pub item_capacity: usize,
    pub global_bias: f32,
    pub ratings_seen: u64,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingReceipt {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub rating: f32,
    pub priority: f32,
    pub applied_immediately: bool,
    pub evicted: Option<u64>,
    pub cache_invalidated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub batch_in_flight: bool,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub updates_trained: u64,
    pub updates_dropped: u64,
    pub updates_evicted: u64,
    pub updates_cleared: u64,
    pub immediate_applied: u64,
    pub immediate_skipped: u64,
    pub current_learning_rate: f32,
    pub last_batch_size: usize,
    pub last_batch_duration_ms: u64,
    pub last_batch_loss: Option<f64>,
    pub last_batch_at: Option<DateTime<Utc>>,
}
