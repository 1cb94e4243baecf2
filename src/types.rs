use crate::error::CrossValidationError;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// Layout of the regular uv grid the visibilities were accumulated onto.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub cellu: f64,
    pub cellv: f64,
    pub nu: usize,
    pub nv: usize,
    pub offsetu: usize,
    pub offsetv: usize,
}

impl GridConfig {
    /// Grid centred on `(nu / 2, nv / 2)`.
    pub fn new(cellu: f64, cellv: f64, nu: usize, nv: usize) -> Self {
        Self {
            cellu,
            cellv,
            nu,
            nv,
            offsetu: nu / 2,
            offsetv: nv / 2,
        }
    }

    pub fn with_offsets(mut self, offsetu: usize, offsetv: usize) -> Self {
        self.offsetu = offsetu;
        self.offsetv = offsetv;
        self
    }

    /// Shape `(nv, nu)` of both the grid planes and the reconstructed image.
    pub fn image_shape(&self) -> (usize, usize) {
        (self.nv, self.nu)
    }

    /// Physical uv coordinate of a grid cell.
    pub fn uv_of(&self, iu: usize, iv: usize) -> (f64, f64) {
        let u = (iu as f64 - self.offsetu as f64) * self.cellu;
        let v = (iv as f64 - self.offsetv as f64) * self.cellv;
        (u, v)
    }

    pub fn validate(&self) -> Result<(), CrossValidationError> {
        if self.nu == 0 || self.nv == 0 {
            return Err(CrossValidationError::Configuration(format!(
                "grid dimensions must be positive (nu={}, nv={})",
                self.nu, self.nv
            )));
        }
        if !(self.cellu.is_finite() && self.cellu > 0.0)
            || !(self.cellv.is_finite() && self.cellv > 0.0)
        {
            return Err(CrossValidationError::Configuration(format!(
                "grid cell sizes must be finite and positive (cellu={}, cellv={})",
                self.cellu, self.cellv
            )));
        }
        Ok(())
    }
}

/// Reconstructed sky image, indexed `[y, x]` with shape `(nv, nu)`.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageArray(pub Array2<f64>);

impl ImageArray {
    pub fn new(values: Array2<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(shape: (usize, usize)) -> Self {
        Self(Array2::zeros(shape))
    }
}

impl Deref for ImageArray {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ImageArray {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array2<f64>> for ImageArray {
    fn from(values: Array2<f64>) -> Self {
        Self(values)
    }
}

/// Solver configuration for a single (L1, Ltsv) trial.
///
/// Only constructible through [`RegularizationParameters::new`], which rejects
/// negative or non-finite weights and non-positive iteration budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationParameters {
    l1: f64,
    ltsv: f64,
    max_iterations: usize,
    epsilon: f64,
    clean_box: Option<Array2<bool>>,
}

impl RegularizationParameters {
    pub fn new(
        l1: f64,
        ltsv: f64,
        max_iterations: usize,
        epsilon: f64,
        clean_box: Option<Array2<bool>>,
    ) -> Result<Self, CrossValidationError> {
        check_weight("L1", l1)?;
        check_weight("Ltsv", ltsv)?;
        if max_iterations == 0 {
            return Err(CrossValidationError::Configuration(
                "max_iterations must be positive".to_string(),
            ));
        }
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(CrossValidationError::Configuration(format!(
                "convergence epsilon must be finite and positive, got {epsilon}"
            )));
        }
        Ok(Self {
            l1,
            ltsv,
            max_iterations,
            epsilon,
            clean_box,
        })
    }

    pub fn l1(&self) -> f64 {
        self.l1
    }

    pub fn ltsv(&self) -> f64 {
        self.ltsv
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn clean_box(&self) -> Option<ArrayView2<'_, bool>> {
        self.clean_box.as_ref().map(|b| b.view())
    }

    /// The support mask, if any, must cover the output image exactly.
    pub fn check_image_shape(&self, shape: (usize, usize)) -> Result<(), CrossValidationError> {
        match &self.clean_box {
            Some(mask) if mask.dim() != shape => Err(CrossValidationError::Configuration(format!(
                "clean box shape {:?} does not match image shape {:?}",
                mask.dim(),
                shape
            ))),
            _ => Ok(()),
        }
    }
}

fn check_weight(name: &str, value: f64) -> Result<(), CrossValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CrossValidationError::Configuration(format!(
            "{name} weight must be finite and non-negative, got {value}"
        )))
    }
}

pub fn default_max_iterations() -> usize {
    50_000
}

pub fn default_epsilon() -> f64 {
    1.0e-5
}

pub fn default_num_fold() -> usize {
    10
}

pub fn default_image_prefix() -> String {
    "image".to_string()
}

pub fn default_warm_start() -> bool {
    true
}

/// Per-search solver settings shared by every trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub clean_box: Option<Array2<bool>>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            epsilon: default_epsilon(),
            clean_box: None,
        }
    }
}

impl SolverConfig {
    /// Fresh parameters for one trial, checked against the output image shape.
    pub fn parameters(
        &self,
        l1: f64,
        ltsv: f64,
        image_shape: (usize, usize),
    ) -> Result<RegularizationParameters, CrossValidationError> {
        let params = RegularizationParameters::new(
            l1,
            ltsv,
            self.max_iterations,
            self.epsilon,
            self.clean_box.clone(),
        )?;
        params.check_image_shape(image_shape)?;
        Ok(params)
    }
}

/// What happens to per-trial images once the best trial is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialArtifactPolicy {
    /// Keep every trial image and add a copy of the winner under the canonical name.
    #[default]
    #[serde(alias = "full")]
    RetainAll,
    /// Keep only the canonical copy of the winner.
    #[serde(alias = "best")]
    RetainBestOnly,
}

/// Complete description of one cross-validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossValidationConfig {
    pub l1_candidates: Vec<f64>,
    pub ltsv_candidates: Vec<f64>,
    #[serde(default = "default_num_fold")]
    pub num_fold: usize,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    #[serde(default)]
    pub image_policy: TrialArtifactPolicy,
    #[serde(default)]
    pub data_file: Option<PathBuf>,
    #[serde(default)]
    pub fold_seed: u64,
    #[serde(default = "default_warm_start")]
    pub warm_start: bool,
    #[serde(default)]
    pub solver: SolverConfig,
}

impl CrossValidationConfig {
    pub fn new(l1_candidates: Vec<f64>, ltsv_candidates: Vec<f64>) -> Self {
        Self {
            l1_candidates,
            ltsv_candidates,
            num_fold: default_num_fold(),
            image_prefix: default_image_prefix(),
            image_policy: TrialArtifactPolicy::default(),
            data_file: None,
            fold_seed: 0,
            warm_start: default_warm_start(),
            solver: SolverConfig::default(),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, CrossValidationError> {
        serde_json::from_str(text).map_err(|e| {
            CrossValidationError::Configuration(format!("malformed configuration: {e}"))
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CrossValidationError> {
        let text = fs::read_to_string(path).map_err(|e| {
            CrossValidationError::Configuration(format!(
                "cannot read configuration '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&text)
    }
}
