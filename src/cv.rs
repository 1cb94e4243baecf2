//! K-fold cross-validation search over (L1, Ltsv) regularisation weights.
//!
//! Trials are visited with Ltsv ascending in the outer loop and L1 descending
//! in the inner loop. Each trial first reconstructs from the full data set to
//! produce its image artifact, then scores the parameter pair by
//! reconstructing once per fold from the active subset and comparing against
//! the held-out samples. The pair with the smallest sample-weighted mean
//! squared error wins; ties go to the trial visited first.

use crate::artifact::{
    ArtifactStore, CvTableWriter, canonical_artifact_name, trial_artifact_name,
};
use crate::error::CrossValidationError;
use crate::folds::CrossValidationSession;
use crate::mse::ErrorAccumulator;
use crate::solver::Solver;
use crate::types::{
    CrossValidationConfig, ImageArray, RegularizationParameters, SolverConfig,
    TrialArtifactPolicy, default_image_prefix, default_warm_start,
};
use crate::visibility::GriddedVisibilityStore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// MSE reported for trials that were not cross validated (single fold).
pub const CV_DISABLED_MSE: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrialScore {
    /// Sample-weighted mean squared error over all folds.
    Evaluated(f64),
    NotEvaluated,
}

impl TrialScore {
    pub fn evaluated(&self) -> Option<f64> {
        match *self {
            TrialScore::Evaluated(mse) => Some(mse),
            TrialScore::NotEvaluated => None,
        }
    }

    /// Numeric form used in reports, with [`CV_DISABLED_MSE`] for unevaluated trials.
    pub fn as_f64(&self) -> f64 {
        self.evaluated().unwrap_or(CV_DISABLED_MSE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub l1: f64,
    pub ltsv: f64,
    pub score: TrialScore,
    /// Name of the full-data image in the artifact store. May have been
    /// removed by [`TrialArtifactPolicy::RetainBestOnly`].
    pub artifact: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub l1: f64,
    pub ltsv: f64,
    /// Canonical name of the winning image in the artifact store.
    pub image: PathBuf,
    pub score: TrialScore,
    /// False when no trial carried a usable MSE, in which case the first
    /// trial in sweep order is reported.
    pub cross_validated: bool,
    /// Every trial in visitation order.
    pub trials: Vec<TrialResult>,
}

/// Cooperative cancellation, observed before every trial and every fold.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine settings that do not affect which parameter pair wins.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub image_prefix: String,
    pub image_policy: TrialArtifactPolicy,
    pub data_file: Option<PathBuf>,
    pub fold_seed: u64,
    pub warm_start: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            image_prefix: default_image_prefix(),
            image_policy: TrialArtifactPolicy::default(),
            data_file: None,
            fold_seed: 0,
            warm_start: default_warm_start(),
        }
    }
}

impl From<&CrossValidationConfig> for EngineOptions {
    fn from(config: &CrossValidationConfig) -> Self {
        Self {
            image_prefix: config.image_prefix.clone(),
            image_policy: config.image_policy,
            data_file: config.data_file.clone(),
            fold_seed: config.fold_seed,
            warm_start: config.warm_start,
        }
    }
}

fn validate_candidates(name: &str, values: &[f64]) -> Result<(), CrossValidationError> {
    if values.is_empty() {
        return Err(CrossValidationError::Configuration(format!(
            "{name} candidate list is empty"
        )));
    }
    if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
        return Err(CrossValidationError::Configuration(format!(
            "{name} candidate list contains invalid value {bad}; weights must be finite and non-negative"
        )));
    }
    Ok(())
}

fn sorted_ascending(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// `(L1, Ltsv)` pairs in visitation order: Ltsv ascending, L1 descending.
pub fn sweep_order(l1_candidates: &[f64], ltsv_candidates: &[f64]) -> Vec<(f64, f64)> {
    let l1_sorted = sorted_ascending(l1_candidates);
    let ltsv_sorted = sorted_ascending(ltsv_candidates);
    ltsv_sorted
        .iter()
        .flat_map(|&ltsv| l1_sorted.iter().rev().map(move |&l1| (l1, ltsv)))
        .collect()
}

/// Trial with the smallest finite MSE, first visited on ties. Falls back to
/// the first trial when none was evaluated.
pub fn select_best(trials: &[TrialResult]) -> Result<&TrialResult, CrossValidationError> {
    let first = trials.first().ok_or_else(|| {
        CrossValidationError::State("no trials were recorded to select from".to_string())
    })?;
    let best = trials
        .iter()
        .filter_map(|t| {
            t.score
                .evaluated()
                .filter(|mse| mse.is_finite())
                .map(|mse| (t, mse))
        })
        .fold(None, |acc: Option<(&TrialResult, f64)>, (t, mse)| match acc {
            Some((_, best_mse)) if mse >= best_mse => acc,
            _ => Some((t, mse)),
        });
    Ok(best.map(|(t, _)| t).unwrap_or(first))
}

fn evaluate_folds_sequential<S: Solver + ?Sized>(
    solver: &mut S,
    session: &CrossValidationSession<'_>,
    params: &RegularizationParameters,
    cancel: &CancellationFlag,
) -> Result<TrialScore, CrossValidationError> {
    if !session.is_cross_validation_enabled() {
        return Ok(TrialScore::NotEvaluated);
    }
    let mut accumulator = ErrorAccumulator::new(*session.store().grid());
    for fold in 0..session.num_fold() {
        if cancel.is_cancelled() {
            return Err(CrossValidationError::Cancelled {
                l1: params.l1(),
                ltsv: params.ltsv(),
                folds_completed: accumulator.num_folds(),
            });
        }
        let mut scope = session.enter_fold(fold, &mut *solver)?;
        let image = scope
            .solve(params)
            .map_err(|source| CrossValidationError::Solver {
                l1: params.l1(),
                ltsv: params.ltsv(),
                fold: Some(fold),
                source,
            })?;
        let fold_mse = accumulator.evaluate_and_accumulate(scope.heldout(), &image)?;
        log::debug!(
            "[CV] L1 {:e} Ltsv {:e} fold {}: MSE {:.6e} over {} samples",
            params.l1(),
            params.ltsv(),
            fold,
            fold_mse,
            scope.heldout().len()
        );
    }
    Ok(TrialScore::Evaluated(accumulator.get_mean_mse()?))
}

fn evaluate_folds_parallel<S: Solver + Clone + Send>(
    solver: &mut S,
    session: &CrossValidationSession<'_>,
    params: &RegularizationParameters,
    cancel: &CancellationFlag,
) -> Result<TrialScore, CrossValidationError> {
    if !session.is_cross_validation_enabled() {
        return Ok(TrialScore::NotEvaluated);
    }
    let grid = *session.store().grid();
    let workers: Vec<S> = (0..session.num_fold()).map(|_| solver.clone()).collect();
    let outcomes: Vec<Result<ErrorAccumulator, CrossValidationError>> = workers
        .into_par_iter()
        .enumerate()
        .map(|(fold, mut local)| {
            if cancel.is_cancelled() {
                return Err(CrossValidationError::Cancelled {
                    l1: params.l1(),
                    ltsv: params.ltsv(),
                    folds_completed: 0,
                });
            }
            let mut accumulator = ErrorAccumulator::new(grid);
            let mut scope = session.enter_fold(fold, &mut local)?;
            let image = scope
                .solve(params)
                .map_err(|source| CrossValidationError::Solver {
                    l1: params.l1(),
                    ltsv: params.ltsv(),
                    fold: Some(fold),
                    source,
                })?;
            accumulator.evaluate_and_accumulate(scope.heldout(), &image)?;
            Ok(accumulator)
        })
        .collect();

    let folds_completed = outcomes.iter().filter(|o| o.is_ok()).count();
    let mut total = ErrorAccumulator::new(grid);
    for outcome in outcomes {
        match outcome {
            Ok(fold_acc) => total.merge(&fold_acc),
            Err(CrossValidationError::Cancelled { l1, ltsv, .. }) => {
                return Err(CrossValidationError::Cancelled {
                    l1,
                    ltsv,
                    folds_completed,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(TrialScore::Evaluated(total.get_mean_mse()?))
}

/// Drives the (L1, Ltsv) sweep for one gridded visibility store.
pub struct CrossValidationEngine<'a, S, A> {
    store: &'a GriddedVisibilityStore,
    solver: S,
    artifacts: A,
    options: EngineOptions,
    cancel: CancellationFlag,
}

impl<'a, S: Solver, A: ArtifactStore> CrossValidationEngine<'a, S, A> {
    pub fn new(store: &'a GriddedVisibilityStore, solver: S, artifacts: A) -> Self {
        Self {
            store,
            solver,
            artifacts,
            options: EngineOptions::default(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Observe an externally owned flag instead of the engine's own.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Handle that cancels a running search from another thread.
    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn artifacts(&self) -> &A {
        &self.artifacts
    }

    pub fn begin_cross_validation(
        &self,
        num_fold: usize,
    ) -> Result<CrossValidationSession<'a>, CrossValidationError> {
        CrossValidationSession::begin(self.store, num_fold, self.options.fold_seed)
    }

    pub fn end_cross_validation(&self, session: CrossValidationSession<'a>) {
        session.end();
    }

    /// Mean held-out MSE of one parameter pair, or [`CV_DISABLED_MSE`] when
    /// the session has a single fold (no solver call is made then).
    pub fn compute_grid_mse(
        &mut self,
        session: &CrossValidationSession<'_>,
        params: &RegularizationParameters,
    ) -> Result<f64, CrossValidationError> {
        evaluate_folds_sequential(&mut self.solver, session, params, &self.cancel)
            .map(|score| score.as_f64())
    }

    /// Run the search described by `config`, adopting its engine options.
    pub fn run(&mut self, config: &CrossValidationConfig) -> Result<BestResult, CrossValidationError> {
        self.options = EngineOptions::from(config);
        self.search(
            &config.l1_candidates,
            &config.ltsv_candidates,
            config.num_fold,
            &config.solver,
        )
    }

    pub fn search(
        &mut self,
        l1_candidates: &[f64],
        ltsv_candidates: &[f64],
        num_fold: usize,
        solver_config: &SolverConfig,
    ) -> Result<BestResult, CrossValidationError> {
        self.sweep(
            l1_candidates,
            ltsv_candidates,
            num_fold,
            solver_config,
            |solver, session, params, cancel| {
                evaluate_folds_sequential(solver, session, params, cancel)
            },
        )
    }

    fn sweep<F>(
        &mut self,
        l1_candidates: &[f64],
        ltsv_candidates: &[f64],
        num_fold: usize,
        solver_config: &SolverConfig,
        mut evaluate_folds: F,
    ) -> Result<BestResult, CrossValidationError>
    where
        F: FnMut(
            &mut S,
            &CrossValidationSession<'a>,
            &RegularizationParameters,
            &CancellationFlag,
        ) -> Result<TrialScore, CrossValidationError>,
    {
        let start = Instant::now();

        validate_candidates("L1", l1_candidates)?;
        validate_candidates("Ltsv", ltsv_candidates)?;
        let grid = *self.store.grid();
        grid.validate()?;
        let image_shape = grid.image_shape();
        // Surface clean-box problems before any reconstruction runs.
        solver_config.parameters(l1_candidates[0], ltsv_candidates[0], image_shape)?;

        let order = sweep_order(l1_candidates, ltsv_candidates);
        let session = self.begin_cross_validation(num_fold)?;
        let mut table = match &self.options.data_file {
            Some(path) => Some(CvTableWriter::create(path)?),
            None => None,
        };

        let mut trials: Vec<TrialResult> = Vec::with_capacity(order.len());
        let mut warm: Option<ImageArray> = None;
        let mut current_ltsv: Option<f64> = None;
        for (l1, ltsv) in order {
            if current_ltsv.map_or(true, |prev| prev.to_bits() != ltsv.to_bits()) {
                // New Ltsv row: start its first trial cold.
                warm = None;
                current_ltsv = Some(ltsv);
            }
            if self.cancel.is_cancelled() {
                return Err(CrossValidationError::Cancelled {
                    l1,
                    ltsv,
                    folds_completed: 0,
                });
            }

            let params = solver_config.parameters(l1, ltsv, image_shape)?;
            let seed = if self.options.warm_start {
                warm.as_ref()
            } else {
                None
            };
            let image = self
                .solver
                .solve(self.store, &params, seed)
                .map_err(|source| CrossValidationError::Solver {
                    l1,
                    ltsv,
                    fold: None,
                    source,
                })?;
            if image.dim() != image_shape {
                return Err(CrossValidationError::ImageShapeMismatch {
                    expected: image_shape,
                    found: image.dim(),
                });
            }
            let non_finite = image.iter().filter(|x| !x.is_finite()).count();
            if non_finite > 0 {
                log::warn!(
                    "[CV] L1 {:e} Ltsv {:e}: full-data image has {} non-finite pixels",
                    l1,
                    ltsv,
                    non_finite
                );
            }
            let artifact = trial_artifact_name(l1, ltsv);
            self.artifacts.write(&image, &artifact, true)?;

            let score = evaluate_folds(&mut self.solver, &session, &params, &self.cancel)?;
            log::info!(
                "[CV] L1 {:e} Ltsv {:e}: MSE {} image {}",
                l1,
                ltsv,
                score.as_f64(),
                artifact.display()
            );
            if let Some(table) = table.as_mut() {
                table.write_row(l1, ltsv, score.as_f64())?;
            }
            trials.push(TrialResult {
                l1,
                ltsv,
                score,
                artifact,
            });
            warm = Some(image);
        }
        self.end_cross_validation(session);

        let winner = select_best(&trials)?.clone();
        let cross_validated = matches!(winner.score, TrialScore::Evaluated(mse) if mse.is_finite());
        let canonical = canonical_artifact_name(&self.options.image_prefix);
        let artifact_names: Vec<PathBuf> = trials.iter().map(|t| t.artifact.clone()).collect();
        self.options.image_policy.apply(
            &self.artifacts,
            &artifact_names,
            &winner.artifact,
            &canonical,
        )?;

        if cross_validated {
            log::info!(
                "[CV] search completed: L1 {:e}, Ltsv {:e}, MSE {:.6e}, image {}",
                winner.l1,
                winner.ltsv,
                winner.score.as_f64(),
                canonical.display()
            );
        } else {
            log::warn!(
                "[CV] cross validation was not performed; L1 {:e}, Ltsv {:e} is the first trial, not a validated optimum",
                winner.l1,
                winner.ltsv
            );
        }
        log::info!(
            "[CV] {} trials in {:.3} sec",
            trials.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(BestResult {
            l1: winner.l1,
            ltsv: winner.ltsv,
            image: canonical,
            score: winner.score,
            cross_validated,
            trials,
        })
    }
}

impl<'a, S: Solver + Clone + Send, A: ArtifactStore> CrossValidationEngine<'a, S, A> {
    /// [`Self::search`] with the folds of each trial reconstructed
    /// concurrently, each on its own clone of the solver. Trials themselves
    /// still run one after another.
    pub fn search_with_parallel_folds(
        &mut self,
        l1_candidates: &[f64],
        ltsv_candidates: &[f64],
        num_fold: usize,
        solver_config: &SolverConfig,
    ) -> Result<BestResult, CrossValidationError> {
        self.sweep(
            l1_candidates,
            ltsv_candidates,
            num_fold,
            solver_config,
            |solver, session, params, cancel| {
                evaluate_folds_parallel(solver, session, params, cancel)
            },
        )
    }
}
