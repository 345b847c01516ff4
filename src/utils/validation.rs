use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::utils::{RATING_MAX, RATING_MIN};
use uuid::Uuid;

const MAX_FILTER_ENTRIES: usize = 100;
const MAX_FILTER_LEN: usize = 100;

pub fn validate_rating(user_id: Uuid, item_id: Uuid, rating: f32) -> EngineResult<()> {
    if user_id.is_nil() {
        return Err(EngineError::InvalidInteraction("User ID cannot be nil".to_string()));
    }

    if item_id.is_nil() {
        return Err(EngineError::InvalidInteraction("Item ID cannot be nil".to_string()));
    }

    if !rating.is_finite() {
        return Err(EngineError::InvalidInteraction(
            "Rating contains invalid value (NaN or Infinity)".to_string(),
        ));
    }

    if !(RATING_MIN..=RATING_MAX).contains(&rating) {
        return Err(EngineError::InvalidInteraction(format!(
            "Rating must be between {} and {}, got {}",
            RATING_MIN, RATING_MAX, rating
        )));
    }

    Ok(())
}

pub fn validate_interaction_event(event: &InteractionEvent) -> EngineResult<()> {
    if event.action_type == ActionType::Rate {
        return validate_rating(event.user_id, event.item_id, event.value);
    }

    if event.user_id.is_nil() || event.item_id.is_nil() {
        return Err(EngineError::InvalidInteraction("Event IDs cannot be nil".to_string()));
    }

    if !event.value.is_finite() || event.value < 0.0 {
        return Err(EngineError::InvalidInteraction(
            "Event value must be a finite, non-negative number".to_string(),
        ));
    }

    // Tolerate small clock skew from producers.
    let max_future = chrono::Utc::now() + chrono::Duration::hours(1);
    if event.timestamp > max_future {
        return Err(EngineError::InvalidInteraction(
            "Timestamp cannot be more than 1 hour in the future".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_recommendation_options(
    options: &RecommendationOptions,
    max_count: usize,
) -> EngineResult<()> {
    if options.count == 0 {
        return Err(EngineError::InvalidOptions(
            "Number of recommendations must be greater than 0".to_string(),
        ));
    }

    if options.count > max_count {
        return Err(EngineError::InvalidOptions(format!(
            "Number of recommendations too large (max {})",
            max_count
        )));
    }

    if !options.min_score.is_finite() || !(0.0..=1.0).contains(&options.min_score) {
        return Err(EngineError::InvalidOptions(
            "min_score must be between 0.0 and 1.0".to_string(),
        ));
    }

    if !options.diversity_factor.is_finite() || !(0.0..=1.0).contains(&options.diversity_factor) {
        return Err(EngineError::InvalidOptions(
            "diversity_factor must be between 0.0 and 1.0".to_string(),
        ));
    }

    if let (Some(min), Some(max)) = (options.min_year, options.max_year) {
        if min > max {
            return Err(EngineError::InvalidOptions(format!(
                "min_year {} is after max_year {}",
                min, max
            )));
        }
    }

    validate_filter("genres", options.genres.as_deref())?;
    validate_filter("languages", options.languages.as_deref())?;

    Ok(())
}

fn validate_filter(name: &str, values: Option<&[String]>) -> EngineResult<()> {
    let Some(values) = values else {
        return Ok(());
    };

    if values.is_empty() {
        return Err(EngineError::InvalidOptions(format!(
            "Filter {} cannot be empty if specified",
            name
        )));
    }

    if values.len() > MAX_FILTER_ENTRIES {
        return Err(EngineError::InvalidOptions(format!(
            "Too many {} (max {})",
            name, MAX_FILTER_ENTRIES
        )));
    }

    for value in values {
        if value.trim().is_empty() || value.len() > MAX_FILTER_LEN {
            return Err(EngineError::InvalidOptions(format!(
                "Invalid entry in {}: {:?}",
                name, value
            )));
        }
    }

    Ok(())
}

pub fn validate_model_parameters(params: &ModelParameters) -> EngineResult<()> {
    let invalid = |msg: String| -> EngineResult<()> { Err(EngineError::InvalidParameters(msg)) };

    if params.version.is_empty() || params.version.len() > 100 {
        return invalid("Model version must be 1-100 characters".to_string());
    }

    if params.factors == 0 {
        return invalid("Model must have at least one latent factor".to_string());
    }

    if params.user_ids.len() != params.user_embedding_weights.len()
        || params.user_ids.len() != params.user_bias.len()
    {
        return invalid("User ids, embeddings and biases differ in length".to_string());
    }

    if params.item_ids.len() != params.item_embedding_weights.len()
        || params.item_ids.len() != params.item_bias.len()
    {
        return invalid("Item ids, embeddings and biases differ in length".to_string());
    }

    if params.user_ids.len() > params.user_capacity || params.item_ids.len() > params.item_capacity {
        return invalid("More embeddings than model capacity".to_string());
    }

    for embedding in params
        .user_embedding_weights
        .iter()
        .chain(params.item_embedding_weights.iter())
    {
        validate_embedding_dimension(embedding, params.factors)?;
        if embedding.iter().any(|w| !w.is_finite()) {
            return invalid("Embedding weights contain invalid values".to_string());
        }
    }

    if params
        .user_bias
        .iter()
        .chain(params.item_bias.iter())
        .chain(std::iter::once(&params.global_bias))
        .any(|b| !b.is_finite())
    {
        return invalid("Bias weights contain invalid values".to_string());
    }

    Ok(())
}

pub fn validate_embedding_dimension(embedding: &[f32], expected_dim: usize) -> EngineResult<()> {
    if embedding.len() != expected_dim {
        return Err(EngineError::InvalidParameters(format!(
            "Embedding dimension mismatch: expected {}, got {}",
            expected_dim,
            embedding.len()
        )));
    }
    Ok(())
}

pub fn validate_batch_size(batch_size: usize, max_batch_size: usize) -> EngineResult<()> {
    if batch_size == 0 {
        return Err(EngineError::InvalidParameters("Batch size cannot be zero".to_string()));
    }

    if batch_size > max_batch_size {
        return Err(EngineError::InvalidParameters(format!(
            "Batch size too large: {} (max {})",
            batch_size, max_batch_size
        )));
    }

    Ok(())
}
