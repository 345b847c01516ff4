use crate::models::*;
use crate::services::scoring::ScoreMap;
use std::cmp::Ordering;
use std::collections::HashSet;

const GENRE_OVERLAP_PENALTY: f32 = 0.3;
const DIRECTOR_OVERLAP_PENALTY: f32 = 0.2;
const STRONG_SIGNAL: f32 = 0.6;
const FAVOURITE_THRESHOLD: f32 = 0.6;

/// Source weights for a user with `rating_count` distinct ratings. The
/// collaborative share grows with history; popularity never drops below 0.05.
pub fn weights_for_rating_count(rating_count: usize) -> SourceWeights {
    match rating_count {
        0..=4 => SourceWeights {
            content: 0.5,
            collaborative: 0.1,
            popularity: 0.4,
        },
        5..=19 => SourceWeights {
            content: 0.6,
            collaborative: 0.3,
            popularity: 0.1,
        },
        20..=99 => SourceWeights {
            content: 0.4,
            collaborative: 0.5,
            popularity: 0.1,
        },
        n => {
            let collaborative = (0.6 + n as f32 / 500.0).min(0.8);
            SourceWeights {
                content: 0.95 - collaborative,
                collaborative,
                popularity: 0.05,
            }
        }
    }
}

/// Per-source scores for one ranking request.
#[derive(Debug, Clone, Default)]
pub struct SourceScores {
    pub content: ScoreMap,
    pub collaborative: ScoreMap,
    pub popularity: ScoreMap,
}

impl SourceScores {
    fn components(&self, item: &ItemFeatures) -> ComponentScores {
        ComponentScores {
            content: self.content.get(&item.item_id).copied(),
            collaborative: self.collaborative.get(&item.item_id).copied(),
            popularity: self.popularity.get(&item.item_id).copied(),
        }
    }
}

/// Weighted sum of the sources that have a score. Missing sources add 0 and
/// the remaining weights are not rescaled.
pub fn combine(components: &ComponentScores, weights: &SourceWeights) -> f32 {
    components.content.unwrap_or(0.0) * weights.content
        + components.collaborative.unwrap_or(0.0) * weights.collaborative
        + components.popularity.unwrap_or(0.0) * weights.popularity
}

struct Ranked<'a> {
    index: usize,
    item: &'a ItemFeatures,
    components: ComponentScores,
    score: f32,
}

fn by_score_then_input(a: &Ranked, b: &Ranked) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.index.cmp(&b.index))
}

/// Greedy, order-dependent: each item is penalized for sharing a genre or
/// director with any item ranked above it.
fn apply_diversity(ranked: &mut [Ranked], factor: f32) {
    if factor <= 0.0 {
        return;
    }
    ranked.sort_by(by_score_then_input);

    let mut seen_genres: HashSet<&str> = HashSet::new();
    let mut seen_directors: HashSet<&str> = HashSet::new();
    for entry in ranked.iter_mut() {
        let item = entry.item;
        let mut penalty = 0.0;
        if item.genres.iter().any(|g| seen_genres.contains(g.as_str())) {
            penalty += GENRE_OVERLAP_PENALTY * factor;
        }
        if item.directors.iter().any(|d| seen_directors.contains(d.as_str())) {
            penalty += DIRECTOR_OVERLAP_PENALTY * factor;
        }
        entry.score = (entry.score - penalty).max(0.0);

        seen_genres.extend(item.genres.iter().map(String::as_str));
        seen_directors.extend(item.directors.iter().map(String::as_str));
    }
}

fn explain(profile: &PreferenceProfile, item: &ItemFeatures, components: &ComponentScores, weights: &SourceWeights) -> Vec<String> {
    let mut tags = Vec::new();

    if !profile.is_cold_start() {
        let favourite_genre = item
            .genres
            .iter()
            .filter_map(|g| profile.genre_preferences.get(g).map(|p| (g, *p)))
            .filter(|(_, p)| *p >= FAVOURITE_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        if let Some((genre, _)) = favourite_genre {
            tags.push(format!("genre:{}", genre));
        }

        let favourite_director = item
            .directors
            .iter()
            .find(|d| profile.director_preferences.get(*d).map_or(false, |p| *p >= FAVOURITE_THRESHOLD));
        if let Some(director) = favourite_director {
            tags.push(format!("director:{}", director));
        }
    }

    if components.collaborative.map_or(false, |s| s >= STRONG_SIGNAL) && weights.collaborative >= 0.3 {
        tags.push("similar_users".to_string());
    }
    if components.popularity.map_or(false, |s| s >= STRONG_SIGNAL) || tags.is_empty() {
        tags.push("popular".to_string());
    }
    tags
}

/// Turns per-source scores into the final ranked list.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridCombiner;

impl HybridCombiner {
    pub fn new() -> Self {
        Self
    }

    pub fn rank(
        &self,
        profile: &PreferenceProfile,
        candidates: &[ItemFeatures],
        scores: &SourceScores,
        weights: SourceWeights,
        options: &RecommendationOptions,
    ) -> Vec<RecommendationItem> {
        let mut ranked: Vec<Ranked> = candidates
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let components = scores.components(item);
                Ranked {
                    index,
                    item,
                    components,
                    score: combine(&components, &weights),
                }
            })
            .collect();

        apply_diversity(&mut ranked, options.diversity_factor);

        ranked.retain(|r| r.score >= options.min_score);
        ranked.sort_by(by_score_then_input);
        ranked.truncate(options.count);

        ranked
            .into_iter()
            .map(|r| RecommendationItem {
                item_id: r.item.item_id,
                score: r.score,
                components: r.components,
                weights,
                explanations: explain(profile, r.item, &r.components, &weights),
            })
            .collect()
    }
}
