use hybridrec::services::learning::BatchOutcome;
use hybridrec::services::metrics;
use hybridrec::*;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn test_config(model_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.training.factors = 8;
    config.training.user_capacity = 64;
    config.training.item_capacity = 64;
    config.training.model_dir = model_dir.to_string_lossy().into_owned();
    config.pipeline.batch_size = 50;
    config
}

fn catalog() -> Vec<ItemFeatures> {
    let genres = ["Drama", "Comedy", "Action", "Horror", "Documentary"];
    (0..20)
        .map(|i| {
            ItemFeatures::new(Uuid::new_v4(), format!("Film {}", i))
                .with_genres(&[genres[i % genres.len()]])
                .with_directors(&[&format!("Director {}", i % 7)])
                .with_release(1980 + i as i32 * 2, 90 + (i as u32 % 5) * 10)
                .with_stats(5.0 + i as f32 * 4.0, 5.0 + (i % 5) as f32 * 0.8, 100 * (i as u32 + 1))
        })
        .collect()
}

async fn seeded_state(dir: &std::path::Path) -> (AppState, Vec<ItemFeatures>) {
    let state = AppState::new(test_config(dir)).await.unwrap();
    let items = catalog();
    state.store.batch_insert_items(items.clone()).await;
    (state, items)
}

#[tokio::test]
async fn test_recommendation_flow() {
    let dir = tempfile::tempdir().unwrap();
    let (state, items) = seeded_state(dir.path()).await;
    let service = &state.recommendation_service;
    let user_id = Uuid::new_v4();

    let cold = assert_ok!(
        service
            .generate_recommendations(user_id, RecommendationOptions::default().with_count(5))
            .await
    );
    assert_eq!(cold.recommendations.len(), 5);
    assert_eq!(cold.weights.popularity, 0.4);
    assert!(cold.recommendations.windows(2).all(|w| w[0].score >= w[1].score));

    let dramas: Vec<&ItemFeatures> = items.iter().filter(|i| i.genres[0] == "Drama").collect();
    for item in &dramas[..3] {
        assert_ok!(service.record_rating(user_id, item.item_id, 9.0).await);
    }
    assert_ok!(service.record_rating(user_id, items[2].item_id, 2.0).await);

    let warm = assert_ok!(
        service
            .generate_recommendations(user_id, RecommendationOptions::default().with_count(5))
            .await
    );
    assert!(!warm.from_cache);
    assert_eq!(warm.weights.content, 0.5);
    for item in &dramas[..3] {
        assert!(warm.recommendations.iter().all(|r| r.item_id != item.item_id));
    }
    assert_eq!(warm.recommendations[0].item_id, dramas[3].item_id);

    let profile = assert_ok!(service.user_profile(user_id).await);
    assert_eq!(profile.rating_count, 4);
    assert!(profile.genre_preferences["Drama"] > profile.genre_preferences["Action"]);
}

#[tokio::test]
async fn test_cache_hits_and_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    let (state, items) = seeded_state(dir.path()).await;
    let service = &state.recommendation_service;
    let user_id = Uuid::new_v4();
    let options = RecommendationOptions::default().with_count(10);

    let first = service.generate_recommendations(user_id, options.clone()).await.unwrap();
    let second = service.generate_recommendations(user_id, options.clone()).await.unwrap();
    assert!(second.from_cache);
    let first_ids: Vec<Uuid> = first.recommendations.iter().map(|r| r.item_id).collect();
    let second_ids: Vec<Uuid> = second.recommendations.iter().map(|r| r.item_id).collect();
    assert_eq!(first_ids, second_ids);

    // A different filter set is a different cache entry.
    let filtered = service
        .generate_recommendations(user_id, options.clone().with_genres(&["Comedy"]))
        .await
        .unwrap();
    assert!(!filtered.from_cache);
    assert_eq!(filtered.recommendations.len(), 4);

    // A middling rating keeps the cached list unless it names the rated item.
    let receipt = service.record_rating(user_id, first_ids[0], 6.0).await.unwrap();
    assert!(!receipt.cache_invalidated);
    let refreshed = service.generate_recommendations(user_id, options.clone()).await.unwrap();
    assert!(!refreshed.from_cache);
    assert!(refreshed.recommendations.iter().all(|r| r.item_id != first_ids[0]));

    let unlisted = items
        .iter()
        .map(|i| i.item_id)
        .find(|id| *id != first_ids[0] && refreshed.recommendations.iter().all(|r| r.item_id != *id))
        .unwrap();
    let receipt = service.record_rating(user_id, unlisted, 5.0).await.unwrap();
    assert!(!receipt.cache_invalidated);
    assert!(service.generate_recommendations(user_id, options.clone()).await.unwrap().from_cache);

    // A strong rating drops every cached list of the user.
    let receipt = service.record_rating(user_id, items[1].item_id, 10.0).await.unwrap();
    assert!(receipt.cache_invalidated);
    assert!(!service.generate_recommendations(user_id, options).await.unwrap().from_cache);

    let snapshot = state.metrics.snapshot();
    assert_eq!(snapshot.counter(metrics::CACHE_HIT), 2);
    assert_eq!(snapshot.counter(metrics::CACHE_MISS), 4);
    assert_eq!(snapshot.counter(metrics::RATINGS_RECORDED), 3);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, items) = seeded_state(dir.path()).await;
    let service = &state.recommendation_service;
    let user_id = Uuid::new_v4();

    let too_many = RecommendationOptions::default().with_count(state.config.recommendation.max_count + 1);
    let err = assert_err!(service.generate_recommendations(user_id, too_many).await);
    assert!(matches!(err, EngineError::InvalidOptions(_)));
    assert!(!err.is_retryable());

    let bad_range = RecommendationOptions {
        min_year: Some(2000),
        max_year: Some(1990),
        ..Default::default()
    };
    assert_err!(service.generate_recommendations(user_id, bad_range).await);

    assert_err!(service.record_rating(user_id, items[0].item_id, 0.5).await);
    assert_err!(service.record_rating(user_id, Uuid::nil(), 5.0).await);
    assert_err!(service.record_rating(user_id, items[0].item_id, f32::NAN).await);
    assert_eq!(state.store.event_count().await, 0);
}

#[tokio::test]
async fn test_online_learning_updates_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let (state, items) = seeded_state(dir.path()).await;
    let service = &state.recommendation_service;

    let users: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    for (u, user_id) in users.iter().enumerate() {
        for item in items.iter().skip(u).step_by(3) {
            service.record_rating(*user_id, item.item_id, 6.0).await.unwrap();
        }
    }

    let queued = service.pipeline_health().queue_len;
    assert!(queued > 0);

    match service.force_flush().await {
        BatchOutcome::Trained { size, learning_rate, .. } => {
            assert_eq!(size, queued);
            assert!(learning_rate <= state.config.pipeline.base_learning_rate);
        }
        other => panic!("expected a trained batch, got {:?}", other),
    }
    assert_eq!(service.force_flush().await, BatchOutcome::Empty);

    let health = service.pipeline_health();
    assert_eq!(health.queue_len, 0);
    assert_eq!(health.batches_processed, 1);
    assert!(health.current_learning_rate < state.config.pipeline.base_learning_rate);

    let stats = service.model_stats();
    assert_eq!(stats.users, users.len());
    assert!(stats.ratings_seen >= queued as u64);

    // Users now covered by the model get collaborative scores.
    let response = service
        .generate_recommendations(users[0], RecommendationOptions::default())
        .await
        .unwrap();
    assert!(response.recommendations.iter().any(|r| r.components.collaborative.is_some()));
}

#[tokio::test]
async fn test_pipeline_worker_flushes_on_timer() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.pipeline.flush_interval_ms = 20;
    let state = AppState::new(config).await.unwrap();
    let items = catalog();
    state.store.batch_insert_items(items.clone()).await;

    let worker = state.start_pipeline();
    let user_id = Uuid::new_v4();
    for item in &items[..4] {
        state
            .recommendation_service
            .record_rating(user_id, item.item_id, 6.0)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.shutdown().await;

    let health = state.recommendation_service.pipeline_health();
    assert_eq!(health.queue_len, 0);
    assert!(health.batches_processed >= 1);
}

#[tokio::test]
async fn test_model_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (state, items) = seeded_state(dir.path()).await;
    let user_id = Uuid::new_v4();
    for item in &items[..6] {
        state
            .recommendation_service
            .record_rating(user_id, item.item_id, 7.0)
            .await
            .unwrap();
    }
    state.recommendation_service.force_flush().await;
    let before = state.recommendation_service.model_stats();

    let version = assert_ok!(state.recommendation_service.save_model(None).await);
    assert!(dir.path().join(format!("{}.json", version)).exists());

    let restarted = AppState::new(test_config(dir.path())).await.unwrap();
    let after = restarted.recommendation_service.model_stats();
    assert_eq!(after.users, before.users);
    assert_eq!(after.items, before.items);
    assert_eq!(after.ratings_seen, before.ratings_seen);

    assert_err!(restarted.recommendation_service.load_model("missing").await);
}

#[tokio::test]
async fn test_clear_queue_discards_pending_updates() {
    let dir = tempfile::tempdir().unwrap();
    let (state, items) = seeded_state(dir.path()).await;
    let service = &state.recommendation_service;
    let user_id = Uuid::new_v4();
    for item in &items[..3] {
        service.record_rating(user_id, item.item_id, 6.0).await.unwrap();
    }

    assert_eq!(service.clear_queue(), 3);
    assert_eq!(service.clear_queue(), 0);
    assert_eq!(service.force_flush().await, BatchOutcome::Empty);
    assert_eq!(service.pipeline_health().updates_cleared, 3);
}
