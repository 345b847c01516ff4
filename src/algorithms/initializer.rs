use nalgebra::DVector;
use rand::Rng;
use std::f32::consts::PI;

pub fn normal<R: Rng + ?Sized>(rng: &mut R, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size)
        .map(|_| {
            // Box-Muller; shift u1 off zero so ln stays finite.
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen();
            let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            z0 * std_dev + mean
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitializationMethod {
    Normal { mean: f32, std_dev: f32 },
}

impl InitializationMethod {
    pub fn initialize<R: Rng + ?Sized>(&self, rng: &mut R, size: usize) -> Vec<f32> {
        match self {
            InitializationMethod::Normal { mean, std_dev } => normal(rng, size, *mean, *std_dev),
        }
    }

    /// One embedding row per entry, all of dimension `dim`.
    pub fn initialize_rows<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rows: usize,
        dim: usize,
    ) -> Vec<DVector<f32>> {
        (0..rows)
            .map(|_| DVector::from_vec(self.initialize(rng, dim)))
            .collect()
    }
}
