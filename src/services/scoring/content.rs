use super::ScoreMap;
use crate::models::{ItemFeatures, PreferenceProfile, RuntimeWindow, YearWindow};
use crate::utils::clamp_unit;
use rayon::prelude::*;

const GENRE_WEIGHT: f32 = 0.4;
const DIRECTOR_WEIGHT: f32 = 0.2;
const ACTOR_WEIGHT: f32 = 0.2;
const RUNTIME_WEIGHT: f32 = 0.1;
const YEAR_WEIGHT: f32 = 0.1;

const NEUTRAL: f32 = 0.5;
const RUNTIME_FLOOR: f32 = 0.2;
const YEAR_OUTSIDE: f32 = 0.3;
const TOP_BILLED: usize = 3;

/// Per-component breakdown, kept for explanations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentBreakdown {
    pub genre: f32,
    pub director: f32,
    pub actor: f32,
    pub runtime: f32,
    pub year: f32,
}

impl ContentBreakdown {
    pub fn total(&self) -> f32 {
        clamp_unit(
            GENRE_WEIGHT * self.genre
                + DIRECTOR_WEIGHT * self.director
                + ACTOR_WEIGHT * self.actor
                + RUNTIME_WEIGHT * self.runtime
                + YEAR_WEIGHT * self.year,
        )
    }
}

/// Scores items against what the user has shown they like.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentScorer;

impl ContentScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn breakdown(&self, profile: &PreferenceProfile, item: &ItemFeatures) -> ContentBreakdown {
        let genre_scores: Vec<f32> = item
            .genres
            .iter()
            .filter_map(|g| profile.genre_preferences.get(g).copied())
            .collect();
        let genre = if genre_scores.is_empty() {
            NEUTRAL
        } else {
            genre_scores.iter().sum::<f32>() / genre_scores.len() as f32
        };

        let director = item
            .directors
            .iter()
            .filter_map(|d| profile.director_preferences.get(d).copied())
            .fold(0.0f32, f32::max);

        let billed = item.top_billed(TOP_BILLED);
        let actor = if billed.is_empty() {
            0.0
        } else {
            billed
                .iter()
                .map(|a| profile.actor_preferences.get(a).copied().unwrap_or(0.0))
                .sum::<f32>()
                / billed.len() as f32
        };

        ContentBreakdown {
            genre,
            director,
            actor,
            runtime: runtime_fit(profile.runtime_window.as_ref(), item.runtime_minutes),
            year: year_fit(profile.year_window.as_ref(), item.year),
        }
    }

    pub fn score_item(&self, profile: &PreferenceProfile, item: &ItemFeatures) -> f32 {
        self.breakdown(profile, item).total()
    }

    pub fn score(&self, profile: &PreferenceProfile, candidates: &[ItemFeatures]) -> ScoreMap {
        candidates
            .par_iter()
            .map(|item| (item.item_id, self.score_item(profile, item)))
            .collect()
    }
}

/// 1 at the ideal runtime, falling linearly to the floor at either window
/// edge; the floor outside the window.
pub fn runtime_fit(window: Option<&RuntimeWindow>, runtime_minutes: Option<u32>) -> f32 {
    let (Some(w), Some(runtime)) = (window, runtime_minutes) else {
        return NEUTRAL;
    };
    let r = runtime as f32;
    if r < w.min || r > w.max {
        return RUNTIME_FLOOR;
    }
    let span = if r <= w.ideal { w.ideal - w.min } else { w.max - w.ideal };
    if span <= 0.0 {
        return 1.0;
    }
    let distance = (r - w.ideal).abs() / span;
    1.0 - (1.0 - RUNTIME_FLOOR) * distance.min(1.0)
}

pub fn year_fit(window: Option<&YearWindow>, year: Option<i32>) -> f32 {
    match (window, year) {
        (Some(w), Some(y)) if (w.min..=w.max).contains(&y) => 1.0,
        (Some(_), Some(_)) => YEAR_OUTSIDE,
        _ => NEUTRAL,
    }
}
