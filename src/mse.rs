use crate::error::CrossValidationError;
use crate::folds::{HeldOutSample, HeldOutSamples};
use crate::types::{GridConfig, ImageArray};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Visibilities implied by an image under the gridding convention of a store.
///
/// The model is the centred, orthonormally scaled 2-D DFT: the image pixel
/// `(nv / 2, nu / 2)` sits at the phase centre and grid cell
/// `(offsetv, offsetu)` is zero spatial frequency.
#[derive(Debug, Clone, Copy)]
pub struct FourierForwardModel {
    grid: GridConfig,
}

impl FourierForwardModel {
    pub fn new(grid: GridConfig) -> Self {
        Self { grid }
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub fn check_image(&self, image: &ImageArray) -> Result<(), CrossValidationError> {
        let expected = self.grid.image_shape();
        let found = image.dim();
        if found != expected {
            return Err(CrossValidationError::ImageShapeMismatch { expected, found });
        }
        Ok(())
    }

    /// Model visibility `(re, im)` at grid cell `(iv, iu)`.
    ///
    /// The image shape must already have been checked against the grid.
    pub fn visibility_at(&self, image: &ImageArray, iu: usize, iv: usize) -> (f64, f64) {
        let ku = iu as f64 - self.grid.offsetu as f64;
        let kv = iv as f64 - self.grid.offsetv as f64;
        self.visibility_at_frequency(image, ku, kv)
    }

    /// Model visibility at the physical uv coordinate `(u, v)`, i.e. at the
    /// fractional grid position `(u / cellu + offsetu, v / cellv + offsetv)`.
    pub fn visibility_at_uv(&self, image: &ImageArray, u: f64, v: f64) -> (f64, f64) {
        self.visibility_at_frequency(image, u / self.grid.cellu, v / self.grid.cellv)
    }

    /// `ku`, `kv` count cells from the zero-frequency cell.
    fn visibility_at_frequency(&self, image: &ImageArray, ku: f64, kv: f64) -> (f64, f64) {
        let GridConfig { nu, nv, .. } = self.grid;
        let cx = (nu / 2) as f64;
        let cy = (nv / 2) as f64;
        let norm = 1.0 / ((nu * nv) as f64).sqrt();

        let (sin_u, cos_u): (Vec<f64>, Vec<f64>) = (0..nu)
            .map(|x| (2.0 * PI * ku * (x as f64 - cx) / nu as f64).sin_cos())
            .unzip();

        let mut re = 0.0f64;
        let mut im = 0.0f64;
        for (y, row) in image.rows().into_iter().enumerate() {
            // Row sum of img * exp(-i phase_u).
            let mut a = 0.0f64;
            let mut b = 0.0f64;
            for (x, &pix) in row.iter().enumerate() {
                a = pix.mul_add(cos_u[x], a);
                b = (-pix).mul_add(sin_u[x], b);
            }
            let (s, c) = (2.0 * PI * kv * (y as f64 - cy) / nv as f64).sin_cos();
            // (a + ib) * (c - is)
            re += a * c + b * s;
            im += b * c - a * s;
        }
        (norm * re, norm * im)
    }

    fn squared_error(&self, image: &ImageArray, sample: &HeldOutSample) -> f64 {
        let (re, im) = self.visibility_at_uv(image, sample.u, sample.v);
        let dr = sample.real - re;
        let di = sample.imag - im;
        dr * dr + di * di
    }

    /// Mean squared error between held-out samples and the model visibilities.
    pub fn mean_squared_error(
        &self,
        heldout: &HeldOutSamples,
        image: &ImageArray,
    ) -> Result<f64, CrossValidationError> {
        if heldout.is_empty() {
            return Err(CrossValidationError::State(
                "cannot evaluate MSE on an empty held-out subset".to_string(),
            ));
        }
        self.check_image(image)?;
        // Collect in sample order so the sum does not depend on scheduling.
        let errors: Vec<f64> = heldout
            .as_slice()
            .par_iter()
            .map(|s| self.squared_error(image, s))
            .collect();
        Ok(errors.iter().sum::<f64>() / errors.len() as f64)
    }
}

/// Running, sample-count weighted mean of per-fold MSE for one trial.
///
/// One accumulator belongs to one in-flight trial; folds evaluated elsewhere
/// are combined with [`ErrorAccumulator::merge`].
#[derive(Debug, Clone)]
pub struct ErrorAccumulator {
    model: FourierForwardModel,
    weighted_sum: f64,
    sample_count: usize,
    num_folds: usize,
}

impl ErrorAccumulator {
    pub fn new(grid: GridConfig) -> Self {
        Self {
            model: FourierForwardModel::new(grid),
            weighted_sum: 0.0,
            sample_count: 0,
            num_folds: 0,
        }
    }

    pub fn reset(&mut self) {
        self.weighted_sum = 0.0;
        self.sample_count = 0;
        self.num_folds = 0;
    }

    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Score one fold's reconstruction against its held-out samples and add it
    /// to the running statistic. Returns the fold's own MSE.
    pub fn evaluate_and_accumulate(
        &mut self,
        heldout: &HeldOutSamples,
        image: &ImageArray,
    ) -> Result<f64, CrossValidationError> {
        let mse = self.model.mean_squared_error(heldout, image)?;
        self.accumulate(mse, heldout.len())?;
        Ok(mse)
    }

    pub fn accumulate(&mut self, fold_mse: f64, samples: usize) -> Result<(), CrossValidationError> {
        if samples == 0 {
            return Err(CrossValidationError::State(
                "a fold contributes at least one held-out sample".to_string(),
            ));
        }
        if !fold_mse.is_finite() {
            log::warn!("[CV] non-finite fold MSE {fold_mse} over {samples} samples");
        }
        self.weighted_sum += fold_mse * samples as f64;
        self.sample_count += samples;
        self.num_folds += 1;
        Ok(())
    }

    pub fn merge(&mut self, other: &ErrorAccumulator) {
        self.weighted_sum += other.weighted_sum;
        self.sample_count += other.sample_count;
        self.num_folds += other.num_folds;
    }

    pub fn get_mean_mse(&self) -> Result<f64, CrossValidationError> {
        if self.num_folds == 0 {
            return Err(CrossValidationError::State(
                "mean MSE requested before any fold was accumulated".to_string(),
            ));
        }
        Ok(self.weighted_sum / self.sample_count as f64)
    }
}
