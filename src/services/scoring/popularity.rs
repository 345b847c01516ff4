use super::ScoreMap;
use crate::models::ItemFeatures;
use crate::utils::{clamp_unit, vote_count_score};

/// Non-personalized baseline: raw popularity, average vote and vote volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct PopularityScorer;

impl PopularityScorer {
    pub fn new() -> Self {
        Self
    }

    /// `max_popularity` normalizes raw popularity across the candidate set.
    pub fn score_item(&self, item: &ItemFeatures, max_popularity: f32) -> f32 {
        let popularity = if max_popularity > 0.0 {
            clamp_unit(item.popularity / max_popularity)
        } else {
            0.0
        };
        let average = clamp_unit(item.vote_average / 10.0);
        clamp_unit(0.4 * popularity + 0.4 * average + 0.2 * vote_count_score(item.vote_count))
    }

    pub fn score(&self, candidates: &[ItemFeatures]) -> ScoreMap {
        let max_popularity = candidates
            .iter()
            .map(|i| i.popularity)
            .filter(|p| p.is_finite())
            .fold(0.0f32, f32::max);

        candidates
            .iter()
            .map(|item| (item.item_id, self.score_item(item, max_popularity)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_popularity_components() {
        let top = ItemFeatures::new(Uuid::new_v4(), "top").with_stats(100.0, 8.0, 9_999);
        let half = ItemFeatures::new(Uuid::new_v4(), "half").with_stats(50.0, 5.0, 0);

        let scores = PopularityScorer::new().score(&[top.clone(), half.clone()]);
        assert!((scores[&top.item_id] - (0.4 + 0.32 + 0.2)).abs() < 1e-3);
        assert!((scores[&half.item_id] - (0.2 + 0.2)).abs() < 1e-6);
    }

    #[test]
    fn test_zero_popularity_pool() {
        let item = ItemFeatures::new(Uuid::new_v4(), "quiet");
        let scores = PopularityScorer::new().score(&[item.clone()]);
        assert_eq!(scores[&item.item_id], 0.0);
        assert!(PopularityScorer::new().score(&[]).is_empty());
    }
}
