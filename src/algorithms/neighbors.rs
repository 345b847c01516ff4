use crate::utils::{cosine_similarity, mean};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// item id → rating, for one user.
pub type UserRatings = HashMap<Uuid, f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine over raw ratings on co-rated items.
    #[default]
    Cosine,
    /// Cosine over ratings centered on each user's co-rated mean.
    Pearson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub user_id: Uuid,
    pub similarity: f32,
    pub overlap: usize,
}

pub fn similarity(a: &UserRatings, b: &UserRatings, metric: SimilarityMetric) -> (f32, usize) {
    let (mut xs, mut ys) = (Vec::new(), Vec::new());
    for (item, ra) in a {
        if let Some(rb) = b.get(item) {
            xs.push(*ra);
            ys.push(*rb);
        }
    }
    let overlap = xs.len();
    if overlap == 0 {
        return (0.0, 0);
    }

    if metric == SimilarityMetric::Pearson {
        let (mx, my) = (mean(&xs), mean(&ys));
        xs.iter_mut().for_each(|x| *x -= mx);
        ys.iter_mut().for_each(|y| *y -= my);
    }

    (cosine_similarity(&xs, &ys), overlap)
}

/// The `k` users most similar to `target`, strongest first. Only users with
/// at least `min_overlap` co-rated items and positive similarity qualify.
pub fn find_neighbors(
    target_user: Uuid,
    target: &UserRatings,
    others: &HashMap<Uuid, UserRatings>,
    k: usize,
    min_overlap: usize,
    metric: SimilarityMetric,
) -> Vec<Neighbor> {
    let mut neighbors: Vec<Neighbor> = others
        .par_iter()
        .filter(|(user_id, _)| **user_id != target_user)
        .filter_map(|(user_id, ratings)| {
            let (sim, overlap) = similarity(target, ratings, metric);
            (overlap >= min_overlap.max(1) && sim > 0.0).then(|| Neighbor {
                user_id: *user_id,
                similarity: sim,
                overlap,
            })
        })
        .collect();

    neighbors.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.overlap.cmp(&a.overlap))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    neighbors.truncate(k);
    neighbors
}

/// Similarity-weighted average rating of `item_id` among neighbors who
/// rated it. `None` if no neighbor did.
pub fn neighbor_rating(
    item_id: &Uuid,
    neighbors: &[Neighbor],
    ratings: &HashMap<Uuid, UserRatings>,
) -> Option<f32> {
    let (weighted, total) = neighbors
        .iter()
        .filter_map(|n| {
            ratings
                .get(&n.user_id)
                .and_then(|r| r.get(item_id))
                .map(|rating| (n.similarity * rating, n.similarity))
        })
        .fold((0.0f32, 0.0f32), |(w, t), (wr, s)| (w + wr, t + s));

    (total > 0.0).then(|| weighted / total)
}
