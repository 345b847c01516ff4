use nalgebra::DVector;

pub trait Optimizer: Send + Sync {
    fn update(&mut self, params: &mut DVector<f32>, gradients: &DVector<f32>);
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f32,
}

impl SGD {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    /// Scalar form of `update`, used for bias terms.
    pub fn update_scalar(&self, param: &mut f32, gradient: f32) {
        *param -= gradient * self.learning_rate;
    }
}

impl Optimizer for SGD {
    fn update(&mut self, params: &mut DVector<f32>, gradients: &DVector<f32>) {
        params.axpy(-self.learning_rate, gradients, 1.0);
    }
}

/// `base * decay^step`, non-increasing in `step` for decay in (0, 1].
#[derive(Debug, Clone, Copy)]
pub struct ExponentialDecay {
    pub base_rate: f32,
    pub decay_rate: f32,
}

impl ExponentialDecay {
    pub fn new(base_rate: f32, decay_rate: f32) -> Self {
        Self {
            base_rate,
            decay_rate: decay_rate.clamp(0.0, 1.0),
        }
    }

    pub fn rate_at(&self, step: u64) -> f32 {
        let exponent = step.min(i32::MAX as u64) as i32;
        self.base_rate * self.decay_rate.powi(exponent)
    }
}
