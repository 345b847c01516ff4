use crate::config::ProfileConfig;
use crate::models::*;
use crate::utils::{clamp_unit, group_sessions, mean, normalize_rating, recency_weight, variance};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const TOP_BILLED: usize = 3;
const LIKED_WATCH_COMPLETION: f32 = 0.5;

/// How strongly one action says "the user likes this item", on [0, 1].
/// `None` for actions that carry no usable signal.
pub fn action_affinity(action: ActionType, value: f32) -> Option<f32> {
    if !value.is_finite() {
        return None;
    }
    match action {
        ActionType::Rate => Some(normalize_rating(value)),
        ActionType::WatchTime => Some(0.4 + 0.6 * clamp_unit(value)),
        ActionType::AddWatchlist => Some(0.8),
        ActionType::RemoveWatchlist => Some(0.2),
        ActionType::Click | ActionType::View => Some(0.6),
    }
}

#[derive(Default)]
struct WeightedMean {
    sum: f32,
    weight: f32,
}

impl WeightedMean {
    fn add(&mut self, value: f32, weight: f32) {
        self.sum += value * weight;
        self.weight += weight;
    }

    fn value(&self) -> Option<f32> {
        (self.weight > 0.0).then(|| self.sum / self.weight)
    }
}

/// Builds preference profiles from raw interaction history. Pure: the same
/// events, items and clock always give the same profile.
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    config: ProfileConfig,
}

impl ProfileBuilder {
    pub fn new(config: ProfileConfig) -> Self {
        Self { config }
    }

    pub fn max_events(&self) -> usize {
        self.config.max_events
    }

    pub fn build(
        &self,
        user_id: Uuid,
        events: &[InteractionEvent],
        items: &HashMap<Uuid, ItemFeatures>,
        now: DateTime<Utc>,
    ) -> PreferenceProfile {
        let mut profile = PreferenceProfile::empty(user_id);
        profile.built_at = now;

        let mut history: Vec<&InteractionEvent> = events.iter().filter(|e| e.user_id == user_id).collect();
        history.sort_by_key(|e| e.timestamp);
        let start = history.len().saturating_sub(self.config.max_events);
        let history = &history[start..];
        if history.is_empty() {
            return profile;
        }

        let timestamps: Vec<DateTime<Utc>> = history.iter().map(|e| e.timestamp).collect();
        let sessions = group_sessions(&timestamps, Duration::minutes(self.config.session_gap_minutes));
        profile.session_count = sessions.len();
        profile.engagement_score = history.len() as f32 / sessions.len().max(1) as f32;
        profile.time_active_days = (timestamps[timestamps.len() - 1] - timestamps[0]).num_days();

        let mut latest_ratings: HashMap<Uuid, (f32, DateTime<Utc>)> = HashMap::new();
        let mut liked: HashSet<Uuid> = HashSet::new();
        let mut genres: HashMap<String, WeightedMean> = HashMap::new();

        for event in history {
            match event.action_type {
                ActionType::Rate if event.value.is_finite() => {
                    latest_ratings.insert(event.item_id, (event.value, event.timestamp));
                }
                ActionType::AddWatchlist => {
                    profile.watchlist.insert(event.item_id);
                    liked.insert(event.item_id);
                }
                ActionType::RemoveWatchlist => {
                    profile.watchlist.remove(&event.item_id);
                }
                ActionType::WatchTime if event.value >= LIKED_WATCH_COMPLETION => {
                    liked.insert(event.item_id);
                }
                _ => {}
            }

            let (Some(item), Some(affinity)) = (items.get(&event.item_id), action_affinity(event.action_type, event.value))
            else {
                continue;
            };
            let weight = event.action_type.signal_weight()
                * recency_weight(event.timestamp, now, self.config.recency_half_life_days);
            for genre in &item.genres {
                genres.entry(genre.clone()).or_default().add(affinity, weight);
            }
        }

        profile.genre_preferences = genres
            .into_iter()
            .filter_map(|(genre, acc)| acc.value().map(|v| (genre, clamp_unit(v))))
            .collect();

        let ratings: Vec<f32> = latest_ratings.values().map(|(r, _)| *r).collect();
        profile.rating_count = ratings.len();
        profile.average_rating = mean(&ratings);
        profile.rating_variance = variance(&ratings);
        profile.rated_items = latest_ratings.iter().map(|(id, (r, _))| (*id, *r)).collect();

        let mut directors: HashMap<String, f32> = HashMap::new();
        let mut actors: HashMap<String, f32> = HashMap::new();
        for (item_id, (rating, at)) in &latest_ratings {
            if *rating < self.config.high_rating_threshold {
                continue;
            }
            liked.insert(*item_id);
            let Some(item) = items.get(item_id) else {
                continue;
            };
            let strength = recency_weight(*at, now, self.config.recency_half_life_days) * normalize_rating(*rating);
            for director in &item.directors {
                *directors.entry(director.clone()).or_insert(0.0) += strength;
            }
            for actor in item.top_billed(TOP_BILLED) {
                *actors.entry(actor.clone()).or_insert(0.0) += strength;
            }
        }
        profile.director_preferences = scale_to_unit_max(directors);
        profile.actor_preferences = scale_to_unit_max(actors);

        let liked_items: Vec<&ItemFeatures> = liked.iter().filter_map(|id| items.get(id)).collect();
        profile.runtime_window = self.runtime_window(&liked_items);
        profile.year_window = self.year_window(&liked_items);

        profile
    }

    fn runtime_window(&self, liked: &[&ItemFeatures]) -> Option<RuntimeWindow> {
        let runtimes: Vec<f32> = liked.iter().filter_map(|i| i.runtime_minutes).map(|r| r as f32).collect();
        if runtimes.is_empty() {
            return None;
        }
        let pad = self.config.runtime_padding_minutes as f32;
        let lo = runtimes.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = runtimes.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Some(RuntimeWindow {
            min: (lo - pad).max(0.0),
            ideal: mean(&runtimes),
            max: hi + pad,
        })
    }

    fn year_window(&self, liked: &[&ItemFeatures]) -> Option<YearWindow> {
        let years: Vec<i32> = liked.iter().filter_map(|i| i.year).collect();
        let (lo, hi) = (years.iter().min()?, years.iter().max()?);
        Some(YearWindow {
            min: lo - self.config.year_padding,
            max: hi + self.config.year_padding,
        })
    }
}

fn scale_to_unit_max(raw: HashMap<String, f32>) -> HashMap<String, f32> {
    let top = raw.values().copied().fold(0.0f32, f32::max);
    if top <= 0.0 {
        return HashMap::new();
    }
    raw.into_iter().map(|(k, v)| (k, v / top)).collect()
}
