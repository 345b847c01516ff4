pub mod initializer;
pub mod neighbors;
pub mod optimizer;

use crate::config::TrainingConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::utils::validation::{validate_batch_size, validate_model_parameters};
use chrono::Utc;
use initializer::InitializationMethod;
use nalgebra::DVector;
use optimizer::{Optimizer, SGD};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

const MAX_BATCH_SIZE: usize = 1 << 20;

/// Raw model output for one (user, item) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    Rating(f32),
    NoCoverage,
}

impl Prediction {
    pub fn rating(&self) -> Option<f32> {
        match self {
            Prediction::Rating(r) => Some(*r),
            Prediction::NoCoverage => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelHyperParams {
    pub learning_rate: f32,
    pub regularization: f32,
    pub init: InitializationMethod,
}

impl Default for ModelHyperParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            regularization: 0.02,
            init: InitializationMethod::Normal { mean: 0.0, std_dev: 0.1 },
        }
    }
}

impl From<&TrainingConfig> for ModelHyperParams {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            regularization: config.regularization,
            init: InitializationMethod::Normal {
                mean: 0.0,
                std_dev: config.init_std_dev,
            },
        }
    }
}

/// Embeddings and biases for one side (users or items). Rows are
/// preallocated up to capacity and handed out to ids on first sight.
#[derive(Debug, Clone)]
struct FactorTable {
    index: HashMap<Uuid, usize>,
    ids: Vec<Uuid>,
    factors: Vec<DVector<f32>>,
    bias: Vec<f32>,
}

impl FactorTable {
    fn new(capacity: usize, dim: usize, init: &InitializationMethod) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            index: HashMap::new(),
            ids: Vec::new(),
            factors: init.initialize_rows(&mut rng, capacity, dim),
            bias: vec![0.0; capacity],
        }
    }

    fn row(&self, id: &Uuid) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn register(&mut self, id: Uuid) -> Option<usize> {
        if let Some(row) = self.index.get(&id) {
            return Some(*row);
        }
        if self.ids.len() >= self.factors.len() {
            return None;
        }
        let row = self.ids.len();
        self.ids.push(id);
        self.index.insert(id, row);
        Some(row)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn capacity(&self) -> usize {
        self.factors.len()
    }
}

#[derive(Debug, Clone)]
struct ModelState {
    factors: usize,
    users: FactorTable,
    items: FactorTable,
    global_bias: f32,
    ratings_seen: u64,
    generation: u64,
}

impl ModelState {
    fn predict_rows(&self, u: usize, i: usize) -> f32 {
        self.global_bias
            + self.users.bias[u]
            + self.items.bias[i]
            + self.users.factors[u].dot(&self.items.factors[i])
    }

    fn observe_rating(&mut self, rating: f32) {
        self.ratings_seen += 1;
        self.global_bias += (rating - self.global_bias) / self.ratings_seen as f32;
    }

    fn mse(&self, triples: &[(usize, usize, f32)]) -> f64 {
        if triples.is_empty() {
            return 0.0;
        }
        let total: f64 = triples
            .iter()
            .map(|&(u, i, r)| {
                let err = (r - self.predict_rows(u, i)) as f64;
                err * err
            })
            .sum();
        total / triples.len() as f64
    }

    /// One gradient step over a mini-batch. Gradients are computed against
    /// the parameters as they were at the start of the batch and averaged
    /// per touched row.
    fn apply_minibatch(&mut self, batch: &[(usize, usize, f32)], learning_rate: f32, reg: f32) {
        let dim = self.factors;
        let mut user_grads: HashMap<usize, (DVector<f32>, f32, u32)> = HashMap::new();
        let mut item_grads: HashMap<usize, (DVector<f32>, f32, u32)> = HashMap::new();

        for &(u, i, r) in batch {
            let pu = &self.users.factors[u];
            let qi = &self.items.factors[i];
            let err = r - self.predict_rows(u, i);

            let grad_u = qi * (-err) + pu * reg;
            let grad_i = pu * (-err) + qi * reg;
            let grad_bu = -err + reg * self.users.bias[u];
            let grad_bi = -err + reg * self.items.bias[i];

            let entry = user_grads
                .entry(u)
                .or_insert_with(|| (DVector::zeros(dim), 0.0, 0));
            entry.0 += grad_u;
            entry.1 += grad_bu;
            entry.2 += 1;

            let entry = item_grads
                .entry(i)
                .or_insert_with(|| (DVector::zeros(dim), 0.0, 0));
            entry.0 += grad_i;
            entry.1 += grad_bi;
            entry.2 += 1;
        }

        let mut sgd = SGD::new(learning_rate);
        for (u, (grad, grad_bias, n)) in user_grads {
            let scale = 1.0 / n as f32;
            sgd.update(&mut self.users.factors[u], &(grad * scale));
            sgd.update_scalar(&mut self.users.bias[u], grad_bias * scale);
        }
        for (i, (grad, grad_bias, n)) in item_grads {
            let scale = 1.0 / n as f32;
            sgd.update(&mut self.items.factors[i], &(grad * scale));
            sgd.update_scalar(&mut self.items.bias[i], grad_bias * scale);
        }
    }
}

/// Low-rank (user, item) → rating predictor with user/item/global biases.
#[derive(Debug, Clone)]
pub struct EmbeddingModel {
    hyper: ModelHyperParams,
    state: Option<ModelState>,
}

impl EmbeddingModel {
    pub fn new(hyper: ModelHyperParams) -> Self {
        Self { hyper, state: None }
    }

    /// (Re)initializes all parameters. Prior trained state is discarded.
    pub fn build(&mut self, user_count: usize, item_count: usize, factors: usize) -> EngineResult<()> {
        if factors == 0 {
            return Err(EngineError::InvalidParameters(
                "Model must have at least one latent factor".to_string(),
            ));
        }

        self.state = Some(ModelState {
            factors,
            users: FactorTable::new(user_count, factors, &self.hyper.init),
            items: FactorTable::new(item_count, factors, &self.hyper.init),
            global_bias: 0.0,
            ratings_seen: 0,
            generation: 0,
        });

        info!(
            "Built embedding model: {} users x {} items, {} factors",
            user_count, item_count, factors
        );
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> EngineResult<&ModelState> {
        self.state
            .as_ref()
            .ok_or_else(|| EngineError::PreconditionViolation("embedding model has not been built".to_string()))
    }

    fn state_mut(&mut self) -> EngineResult<&mut ModelState> {
        self.state
            .as_mut()
            .ok_or_else(|| EngineError::PreconditionViolation("embedding model has not been built".to_string()))
    }

    pub fn has_user(&self, user_id: Uuid) -> bool {
        self.state
            .as_ref()
            .map_or(false, |s| s.users.row(&user_id).is_some())
    }

    pub fn has_item(&self, item_id: Uuid) -> bool {
        self.state
            .as_ref()
            .map_or(false, |s| s.items.row(&item_id).is_some())
    }

    /// Raw rating predictions for `items`, in order. Users or items the
    /// model has never trained on yield `Prediction::NoCoverage`.
    pub fn predict(&self, user_id: Uuid, items: &[Uuid]) -> EngineResult<Vec<Prediction>> {
        let state = self.state()?;

        let Some(u) = state.users.row(&user_id) else {
            return Ok(vec![Prediction::NoCoverage; items.len()]);
        };

        Ok(items
            .iter()
            .map(|item_id| match state.items.row(item_id) {
                Some(i) => Prediction::Rating(state.predict_rows(u, i)),
                None => Prediction::NoCoverage,
            })
            .collect())
    }

    /// Applies a single gradient step for one new rating and returns the
    /// squared error observed before the step.
    pub fn incremental_train(&mut self, sample: &RatingSample, learning_rate: f32) -> EngineResult<f32> {
        let reg = self.hyper.regularization;
        let state = self.state_mut()?;

        let u = state.users.register(sample.user_id).ok_or_else(|| {
            EngineError::CapacityExhausted(format!("no free user row for {}", sample.user_id))
        })?;
        let i = state.items.register(sample.item_id).ok_or_else(|| {
            EngineError::CapacityExhausted(format!("no free item row for {}", sample.item_id))
        })?;

        state.observe_rating(sample.rating);
        let err = sample.rating - state.predict_rows(u, i);
        state.apply_minibatch(&[(u, i, sample.rating)], learning_rate, reg);
        state.generation += 1;

        Ok(err * err)
    }

    /// Mini-batch gradient descent on MSE with L2 regularization. The
    /// `cancel` flag is polled between mini-batches.
    pub fn batch_train(
        &mut self,
        samples: &[RatingSample],
        options: &TrainOptions,
        cancel: &AtomicBool,
    ) -> EngineResult<TrainingReport> {
        let learning_rate = options.learning_rate.unwrap_or(self.hyper.learning_rate);
        let reg = self.hyper.regularization;
        let state = self.state_mut()?;
        validate_batch_size(options.batch_size, MAX_BATCH_SIZE)?;

        let mut report = TrainingReport::default();
        let mut triples = Vec::with_capacity(samples.len());
        for sample in samples {
            if !sample.rating.is_finite() {
                report.samples_skipped += 1;
                continue;
            }
            match (state.users.register(sample.user_id), state.items.register(sample.item_id)) {
                (Some(u), Some(i)) => {
                    state.observe_rating(sample.rating);
                    triples.push((u, i, sample.rating));
                }
                _ => report.samples_skipped += 1,
            }
        }
        report.samples_used = triples.len();

        if triples.is_empty() {
            debug!("Batch training called with no usable samples");
            return Ok(report);
        }

        let mut rng = rand::thread_rng();
        triples.shuffle(&mut rng);

        let split = options.validation_split.clamp(0.0, 0.9);
        let val_len = if triples.len() >= 2 {
            ((triples.len() as f32) * split).floor() as usize
        } else {
            0
        };
        let (validation, train) = triples.split_at_mut(val_len);
        let validation: &[(usize, usize, f32)] = validation;

        for epoch in 1..=options.epochs {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::TrainingCancelled);
            }

            train.shuffle(&mut rng);
            for batch in train.chunks(options.batch_size) {
                if cancel.load(Ordering::Relaxed) {
                    return Err(EngineError::TrainingCancelled);
                }
                state.apply_minibatch(batch, learning_rate, reg);
            }

            let train_loss = state.mse(train);
            let validation_loss = (!validation.is_empty()).then(|| state.mse(validation));
            debug!(
                "Epoch {}/{}: train_loss={:.4} validation_loss={:?}",
                epoch, options.epochs, train_loss, validation_loss
            );
            report.epochs.push(EpochLoss {
                epoch,
                train_loss,
                validation_loss,
            });
        }

        state.generation += 1;
        info!(
            "Batch training finished: {} samples ({} skipped), final loss {:?}",
            report.samples_used,
            report.samples_skipped,
            report.final_train_loss()
        );
        Ok(report)
    }

    pub fn stats(&self) -> ModelStats {
        match &self.state {
            Some(state) => ModelStats {
                built: true,
                factors: state.factors,
                users: state.users.len(),
                items: state.items.len(),
                user_capacity: state.users.capacity(),
                item_capacity: state.items.capacity(),
                global_bias: state.global_bias,
                ratings_seen: state.ratings_seen,
                generation: state.generation,
            },
            None => ModelStats {
                built: false,
                factors: 0,
                users: 0,
                items: 0,
                user_capacity: 0,
                item_capacity: 0,
                global_bias: 0.0,
                ratings_seen: 0,
                generation: 0,
            },
        }
    }

    pub fn to_parameters(&self, version: &str) -> EngineResult<ModelParameters> {
        let state = self.state()?;
        let registered = |table: &FactorTable| -> Vec<Vec<f32>> {
            table.factors[..table.len()]
                .iter()
                .map(|v| v.as_slice().to_vec())
                .collect()
        };

        Ok(ModelParameters {
            version: version.to_string(),
            factors: state.factors,
            user_capacity: state.users.capacity(),
            item_capacity: state.items.capacity(),
            user_ids: state.users.ids.clone(),
            item_ids: state.items.ids.clone(),
            user_embedding_weights: registered(&state.users),
            item_embedding_weights: registered(&state.items),
            user_bias: state.users.bias[..state.users.len()].to_vec(),
            item_bias: state.items.bias[..state.items.len()].to_vec(),
            global_bias: state.global_bias,
            ratings_seen: state.ratings_seen,
            updated_at: Utc::now(),
        })
    }

    pub fn from_parameters(params: &ModelParameters, hyper: ModelHyperParams) -> EngineResult<Self> {
        validate_model_parameters(params)?;

        let mut model = Self::new(hyper);
        model.build(params.user_capacity, params.item_capacity, params.factors)?;
        let state = model.state_mut()?;

        for (row, id) in params.user_ids.iter().enumerate() {
            let u = state.users.register(*id).ok_or_else(|| {
                EngineError::InvalidParameters(format!("duplicate or excess user id {}", id))
            })?;
            state.users.factors[u] = DVector::from_column_slice(&params.user_embedding_weights[row]);
            state.users.bias[u] = params.user_bias[row];
        }
        for (row, id) in params.item_ids.iter().enumerate() {
            let i = state.items.register(*id).ok_or_else(|| {
                EngineError::InvalidParameters(format!("duplicate or excess item id {}", id))
            })?;
            state.items.factors[i] = DVector::from_column_slice(&params.item_embedding_weights[row]);
            state.items.bias[i] = params.item_bias[row];
        }
        state.global_bias = params.global_bias;
        state.ratings_seen = params.ratings_seen;

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_ratings(users: &[Uuid], items: &[Uuid]) -> Vec<RatingSample> {
        // Two taste groups: even users like even items, odd users like odd items.
        let mut samples = Vec::new();
        for (ui, user) in users.iter().enumerate() {
            for (ii, item) in items.iter().enumerate() {
                let rating = if ui % 2 == ii % 2 { 9.0 } else { 3.0 };
                samples.push(RatingSample::new(*user, *item, rating));
            }
        }
        samples
    }

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_operations_before_build_are_precondition_violations() {
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        let sample = RatingSample::new(Uuid::new_v4(), Uuid::new_v4(), 7.0);
        let cancel = AtomicBool::new(false);

        assert!(matches!(
            model.predict(sample.user_id, &[sample.item_id]),
            Err(EngineError::PreconditionViolation(_))
        ));
        assert!(matches!(
            model.incremental_train(&sample, 0.01),
            Err(EngineError::PreconditionViolation(_))
        ));
        assert!(matches!(
            model.batch_train(&[sample], &TrainOptions::default(), &cancel),
            Err(EngineError::PreconditionViolation(_))
        ));
        assert!(model.to_parameters("v1").is_err());
    }

    #[test]
    fn test_unseen_user_or_item_has_no_coverage() {
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(10, 10, 8).unwrap();

        let user = Uuid::new_v4();
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        model
            .incremental_train(&RatingSample::new(user, known, 8.0), 0.01)
            .unwrap();

        assert!(model.has_user(user));
        assert!(model.has_item(known));
        assert!(!model.has_item(unknown));

        let predictions = model.predict(user, &[known, unknown]).unwrap();
        assert!(matches!(predictions[0], Prediction::Rating(_)));
        assert_eq!(predictions[1], Prediction::NoCoverage);

        let stranger = model.predict(Uuid::new_v4(), &[known]).unwrap();
        assert_eq!(stranger, vec![Prediction::NoCoverage]);
    }

    #[test]
    fn test_batch_train_reduces_loss() {
        let users = ids(12);
        let items = ids(12);
        let samples = synthetic_ratings(&users, &items);

        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(20, 20, 8).unwrap();

        let options = TrainOptions {
            epochs: 40,
            batch_size: 16,
            validation_split: 0.1,
            learning_rate: Some(0.05),
        };
        let report = model
            .batch_train(&samples, &options, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(report.epochs.len(), 40);
        assert_eq!(report.samples_used, samples.len());
        assert!(report.epochs.iter().all(|e| e.validation_loss.is_some()));

        let first = report.epochs.first().unwrap().train_loss;
        let last = report.final_train_loss().unwrap();
        assert!(last < first, "loss did not decrease: {} -> {}", first, last);
    }

    #[test]
    fn test_batch_train_honours_cancellation() {
        let users = ids(4);
        let items = ids(4);
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(4, 4, 4).unwrap();

        let result = model.batch_train(
            &synthetic_ratings(&users, &items),
            &TrainOptions::default(),
            &AtomicBool::new(true),
        );
        assert!(matches!(result, Err(EngineError::TrainingCancelled)));
    }

    #[test]
    fn test_capacity_exhaustion_skips_samples() {
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(1, 5, 4).unwrap();

        let item = Uuid::new_v4();
        let samples = vec![
            RatingSample::new(Uuid::new_v4(), item, 7.0),
            RatingSample::new(Uuid::new_v4(), item, 6.0),
        ];
        let report = model
            .batch_train(&samples, &TrainOptions::default(), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(report.samples_used, 1);
        assert_eq!(report.samples_skipped, 1);

        let overflow = model.incremental_train(&RatingSample::new(Uuid::new_v4(), item, 5.0), 0.01);
        assert!(matches!(overflow, Err(EngineError::CapacityExhausted(_))));
    }

    #[test]
    fn test_incremental_train_moves_prediction_toward_rating() {
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(4, 4, 4).unwrap();

        let user = Uuid::new_v4();
        model
            .incremental_train(&RatingSample::new(user, Uuid::new_v4(), 2.0), 0.1)
            .unwrap();

        let sample = RatingSample::new(user, Uuid::new_v4(), 9.0);
        let first_error = model.incremental_train(&sample, 0.1).unwrap();
        let mut last_error = first_error;
        for _ in 0..50 {
            last_error = model.incremental_train(&sample, 0.1).unwrap();
        }
        assert!(last_error < first_error);
    }

    #[test]
    fn test_parameters_round_trip_preserves_predictions() {
        let users = ids(6);
        let items = ids(6);
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(10, 10, 6).unwrap();
        model
            .batch_train(&synthetic_ratings(&users, &items), &TrainOptions::default(), &AtomicBool::new(false))
            .unwrap();

        let params = model.to_parameters("v-test").unwrap();
        assert_eq!(params.user_ids.len(), 6);
        assert_eq!(params.user_capacity, 10);

        let restored = EmbeddingModel::from_parameters(&params, ModelHyperParams::default()).unwrap();
        let before = model.predict(users[0], &items).unwrap();
        let after = restored.predict(users[0], &items).unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a.rating().unwrap() - b.rating().unwrap()).abs() < 1e-5);
        }
        assert_eq!(restored.stats().ratings_seen, model.stats().ratings_seen);
    }

    #[test]
    fn test_from_parameters_rejects_dimension_mismatch() {
        let mut model = EmbeddingModel::new(ModelHyperParams::default());
        model.build(4, 4, 4).unwrap();
        model
            .incremental_train(&RatingSample::new(Uuid::new_v4(), Uuid::new_v4(), 6.0), 0.01)
            .unwrap();

        let mut params = model.to_parameters("v1").unwrap();
        params.user_embedding_weights[0].push(0.5);
        assert!(matches!(
            EmbeddingModel::from_parameters(&params, ModelHyperParams::default()),
            Err(EngineError::InvalidParameters(_))
        ));
    }
}
