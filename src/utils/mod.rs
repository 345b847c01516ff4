use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

pub mod validation;

/// Lowest and highest rating on the explicit scale.
pub const RATING_MIN: f32 = 1.0;
pub const RATING_MAX: f32 = 10.0;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Maps a 1–10 rating onto [0, 1], clamping anything outside the scale.
pub fn normalize_rating(raw: f32) -> f32 {
    if !raw.is_finite() {
        return 0.0;
    }
    ((raw - RATING_MIN) / (RATING_MAX - RATING_MIN)).clamp(0.0, 1.0)
}

pub fn clamp_unit(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Population variance.
pub fn variance(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32
}

/// Splits chronologically ordered timestamps into sessions and returns the
/// size of each. A gap strictly larger than `max_gap` starts a new session.
pub fn group_sessions(timestamps: &[DateTime<Utc>], max_gap: Duration) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut previous: Option<DateTime<Utc>> = None;

    for &ts in timestamps {
        match previous {
            Some(prev) if ts.signed_duration_since(prev) <= max_gap => {
                if let Some(last) = sizes.last_mut() {
                    *last += 1;
                }
            }
            _ => sizes.push(1),
        }
        previous = Some(ts);
    }

    sizes
}

/// Half-life decay: an event `half_life_days` old weighs 0.5.
pub fn recency_weight(timestamp: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f32 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    let age_days = now.signed_duration_since(timestamp).num_seconds().max(0) as f64 / 86_400.0;
    0.5f64.powf(age_days / half_life_days) as f32
}

/// Log-scaled vote count on [0, 1], saturating at 10k votes.
pub fn vote_count_score(vote_count: u32) -> f32 {
    clamp_unit(((vote_count as f32) + 1.0).ln() / 10_000f32.ln())
}

/// First 8 bytes of the SHA-256 digest, big-endian. Identical across builds
/// and platforms, so it is safe inside shared cache keys.
pub fn digest_u64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);

        let a = vec![1.0, 1.0];
        let b = vec![1.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rating() {
        assert_eq!(normalize_rating(1.0), 0.0);
        assert_eq!(normalize_rating(10.0), 1.0);
        assert!((normalize_rating(5.5) - 0.5).abs() < 1e-6);
        assert_eq!(normalize_rating(0.0), 0.0);
        assert_eq!(normalize_rating(11.0), 1.0);
        assert_eq!(normalize_rating(f32::NAN), 0.0);
    }

    #[test]
    fn test_variance() {
        assert!((variance(&[5.0, 7.0, 3.0]) - 2.6667).abs() < 1e-3);
        assert_eq!(variance(&[4.0]), 0.0);
        assert_eq!(variance(&[]), 0.0);
    }

    #[test]
    fn test_group_sessions() {
        let t = Utc::now();
        let stamps = vec![t, t + Duration::minutes(15), t + Duration::minutes(60)];
        assert_eq!(group_sessions(&stamps, Duration::minutes(30)), vec![2, 1]);
        assert!(group_sessions(&[], Duration::minutes(30)).is_empty());

        let edge = vec![t, t + Duration::minutes(30)];
        assert_eq!(group_sessions(&edge, Duration::minutes(30)), vec![2]);
    }

    #[test]
    fn test_recency_weight() {
        let now = Utc::now();
        assert!((recency_weight(now, now, 30.0) - 1.0).abs() < 1e-6);
        let month_ago = now - Duration::days(30);
        assert!((recency_weight(month_ago, now, 30.0) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_digest_is_fixed() {
        // SHA-256("abc") begins ba7816bf8f01cfea.
        assert_eq!(digest_u64(b"abc"), 0xba78_16bf_8f01_cfea);
        assert_ne!(digest_u64(b"abc"), digest_u64(b"abd"));
    }

    #[test]
    fn test_vote_count_score() {
        assert_eq!(vote_count_score(0), 0.0);
        assert!((vote_count_score(9_999) - 1.0).abs() < 1e-4);
        assert_eq!(vote_count_score(1_000_000), 1.0);
    }
}
