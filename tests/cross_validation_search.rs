use approx::assert_relative_eq;
use ndarray::{Array2, Array3};
use sparsecv::{
    ArtifactStore, CV_DISABLED_MSE, CancellationFlag, CrossValidationConfig,
    CrossValidationEngine, CrossValidationError, EngineOptions, FourierForwardModel,
    FsArtifactStore, GridConfig, GriddedVisibilityStore, ImageArray, RegularizationParameters,
    Solver, SolverConfig, SolverError, TrialArtifactPolicy, TrialScore, read_cv_table,
    sweep_order,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const L1: [f64; 2] = [1e-3, 1e-2];
const LTSV: [f64; 2] = [1e-1, 1e-2];

#[derive(Debug, Clone, PartialEq)]
struct Call {
    l1: f64,
    ltsv: f64,
    samples: usize,
    warm: bool,
}

/// Returns the true sky scaled down by the regularisation strength, so the
/// weakest (L1, Ltsv) pair always reconstructs best.
#[derive(Clone)]
struct ShrinkingSolver {
    truth: ImageArray,
    total_samples: usize,
    calls: Arc<Mutex<Vec<Call>>>,
    releases: Arc<AtomicUsize>,
    fail_on_fold: Option<(f64, f64, usize)>,
    cancel_after: Option<(usize, CancellationFlag)>,
}

impl ShrinkingSolver {
    fn new(truth: &ImageArray, store: &GriddedVisibilityStore) -> Self {
        Self {
            truth: truth.clone(),
            total_samples: store.num_samples(),
            calls: Arc::new(Mutex::new(Vec::new())),
            releases: Arc::new(AtomicUsize::new(0)),
            fail_on_fold: None,
            cancel_after: None,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

fn shrink_factor(l1: f64, ltsv: f64) -> f64 {
    1.0 / (1.0 + 100.0 * l1 + 10.0 * ltsv)
}

impl Solver for ShrinkingSolver {
    fn solve(
        &mut self,
        visibility: &GriddedVisibilityStore,
        params: &RegularizationParameters,
        warm_start: Option<&ImageArray>,
    ) -> Result<ImageArray, SolverError> {
        let samples = visibility.num_samples();
        let is_fold = samples < self.total_samples;
        let (previous_fold_solves, call_count) = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls
                .iter()
                .filter(|c| c.l1 == params.l1() && c.ltsv == params.ltsv())
                .filter(|c| c.samples < self.total_samples)
                .count();
            calls.push(Call {
                l1: params.l1(),
                ltsv: params.ltsv(),
                samples,
                warm: warm_start.is_some(),
            });
            (previous, calls.len())
        };
        if let Some((l1, ltsv, fold)) = self.fail_on_fold {
            if is_fold && l1 == params.l1() && ltsv == params.ltsv() && previous_fold_solves == fold
            {
                return Err(SolverError::Diverged {
                    iterations: 7,
                    message: "objective became NaN".to_string(),
                });
            }
        }
        if let Some((after, flag)) = &self.cancel_after {
            if call_count >= *after {
                flag.cancel();
            }
        }
        let factor = shrink_factor(params.l1(), params.ltsv());
        Ok(ImageArray::new(self.truth.mapv(|x| x * factor)))
    }

    fn release_scratch(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn true_sky() -> ImageArray {
    let mut sky = Array2::<f64>::zeros((8, 8));
    sky[[4, 4]] = 1.0;
    sky[[2, 5]] = 0.6;
    sky[[6, 1]] = 0.3;
    ImageArray::new(sky)
}

/// Noise-free visibilities of the true sky on a checkerboard of sampled cells.
fn observed_store(sky: &ImageArray) -> GriddedVisibilityStore {
    let grid = GridConfig::new(1.0, 1.0, 8, 8);
    let model = FourierForwardModel::new(grid);
    let mut real = Array3::<f64>::zeros((1, 8, 8));
    let mut imag = Array3::<f64>::zeros((1, 8, 8));
    let mut weight = Array3::<f64>::zeros((1, 8, 8));
    for v in 0..8 {
        for u in 0..8 {
            if (u + v) % 2 == 0 {
                let (re, im) = model.visibility_at(sky, u, v);
                real[[0, v, u]] = re;
                imag[[0, v, u]] = im;
                weight[[0, v, u]] = 1.0;
            }
        }
    }
    GriddedVisibilityStore::new(real, imag, weight, grid).unwrap()
}

/// Expected CV score: every sample is held out exactly once, so the
/// sample-weighted mean does not depend on the fold assignment.
fn expected_mse(store: &GriddedVisibilityStore, sky: &ImageArray, l1: f64, ltsv: f64) -> f64 {
    let model = FourierForwardModel::new(*store.grid());
    let samples = store.sample_locations();
    let power: f64 = samples
        .iter()
        .map(|&at| {
            let (re, im) = model.visibility_at(sky, at.u, at.v);
            re * re + im * im
        })
        .sum::<f64>()
        / samples.len() as f64;
    let residual = 1.0 - shrink_factor(l1, ltsv);
    residual * residual * power
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

#[test]
fn search_visits_trials_in_order_and_picks_the_smallest_mse() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let mut solver = ShrinkingSolver::new(&sky, &store);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();

    let best = CrossValidationEngine::new(&store, &mut solver, &artifacts)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap();

    assert_eq!((best.l1, best.ltsv), (1e-3, 1e-2));
    assert!(best.cross_validated);
    assert_eq!(best.image, PathBuf::from("image.json"));

    let visited: Vec<(f64, f64)> = best.trials.iter().map(|t| (t.l1, t.ltsv)).collect();
    assert_eq!(visited, sweep_order(&L1, &LTSV));
    assert_eq!(visited[0], (1e-2, 1e-2));

    for trial in &best.trials {
        let mse = trial.score.evaluated().expect("trial was cross validated");
        assert_relative_eq!(
            mse,
            expected_mse(&store, &sky, trial.l1, trial.ltsv),
            max_relative = 1e-10
        );
    }

    // One full-data solve followed by four fold solves per trial.
    let calls = solver.calls();
    assert_eq!(calls.len(), 4 * 5);
    let total = store.num_samples();
    for (trial, chunk) in best.trials.iter().zip(calls.chunks(5)) {
        assert_eq!((chunk[0].l1, chunk[0].ltsv), (trial.l1, trial.ltsv));
        assert_eq!(chunk[0].samples, total);
        let held_out: usize = chunk[1..].iter().map(|c| total - c.samples).sum();
        assert_eq!(held_out, total);
        assert!(chunk[1..].iter().all(|c| !c.warm));
    }
    assert_eq!(solver.releases(), 4 * 4);

    let expected = ImageArray::new(sky.mapv(|x| x * shrink_factor(1e-3, 1e-2)));
    assert_eq!(artifacts.read(&best.image).unwrap(), expected);
}

#[test]
fn warm_start_resets_at_every_new_ltsv_row() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let mut solver = ShrinkingSolver::new(&sky, &store);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();

    CrossValidationEngine::new(&store, &mut solver, &artifacts)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap();
    let full: Vec<bool> = solver
        .calls()
        .iter()
        .filter(|c| c.samples == store.num_samples())
        .map(|c| c.warm)
        .collect();
    assert_eq!(full, vec![false, true, false, true]);

    let mut cold = ShrinkingSolver::new(&sky, &store);
    let options = EngineOptions {
        warm_start: false,
        ..EngineOptions::default()
    };
    CrossValidationEngine::new(&store, &mut cold, &artifacts)
        .with_options(options)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap();
    assert!(cold.calls().iter().all(|c| !c.warm));
}

#[test]
fn artifact_policy_controls_which_images_survive() {
    let sky = true_sky();
    let store = observed_store(&sky);

    let keep_all = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(keep_all.path()).unwrap();
    let best = CrossValidationEngine::new(&store, ShrinkingSolver::new(&sky, &store), &artifacts)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap();
    assert_eq!(json_files(keep_all.path()).len(), 4 + 1);
    assert!(best.trials.iter().all(|t| artifacts.exists(&t.artifact)));

    let best_only = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(best_only.path()).unwrap();
    let options = EngineOptions {
        image_prefix: "winner".to_string(),
        image_policy: TrialArtifactPolicy::RetainBestOnly,
        ..EngineOptions::default()
    };
    let best = CrossValidationEngine::new(&store, ShrinkingSolver::new(&sky, &store), &artifacts)
        .with_options(options)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap();
    assert_eq!(
        json_files(best_only.path()),
        vec![best_only.path().join("winner.json")]
    );
    assert_eq!(best.image, PathBuf::from("winner.json"));
}

#[test]
fn single_fold_skips_validation_and_reports_the_first_trial() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let mut solver = ShrinkingSolver::new(&sky, &store);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();

    let best = CrossValidationEngine::new(&store, &mut solver, &artifacts)
        .search(&L1, &LTSV, 1, &SolverConfig::default())
        .unwrap();

    assert_eq!(solver.calls().len(), 4);
    assert!(solver.calls().iter().all(|c| c.samples == store.num_samples()));
    assert_eq!(solver.releases(), 0);
    assert!(!best.cross_validated);
    assert_eq!((best.l1, best.ltsv), (1e-2, 1e-2));
    assert_eq!(best.score, TrialScore::NotEvaluated);
    assert!(best.trials.iter().all(|t| t.score.as_f64() == CV_DISABLED_MSE));
}

#[test]
fn compute_grid_mse_matches_the_search_score() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let mut solver = ShrinkingSolver::new(&sky, &store);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();
    let mut engine = CrossValidationEngine::new(&store, &mut solver, &artifacts);
    let params = RegularizationParameters::new(1e-2, 1e-1, 100, 1e-5, None).unwrap();

    let session = engine.begin_cross_validation(1).unwrap();
    assert_eq!(engine.compute_grid_mse(&session, &params).unwrap(), -1.0);
    engine.end_cross_validation(session);

    let session = engine.begin_cross_validation(8).unwrap();
    let mse = engine.compute_grid_mse(&session, &params).unwrap();
    engine.end_cross_validation(session);
    assert_relative_eq!(
        mse,
        expected_mse(&store, &sky, 1e-2, 1e-1),
        max_relative = 1e-10
    );
    drop(engine);
    assert_eq!(solver.calls().len(), 8);
    assert_eq!(solver.releases(), 8);
}

#[test]
fn solver_failure_aborts_with_the_failing_coordinates() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let mut solver = ShrinkingSolver::new(&sky, &store);
    solver.fail_on_fold = Some((1e-2, 1e-1, 2));
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();

    let err = CrossValidationEngine::new(&store, &mut solver, &artifacts)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap_err();

    match &err {
        CrossValidationError::Solver {
            l1,
            ltsv,
            fold,
            source,
        } => {
            assert_eq!((*l1, *ltsv, *fold), (1e-2, 1e-1, Some(2)));
            assert!(matches!(source, SolverError::Diverged { iterations: 7, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("fold 2"));
    // Every fold that was entered released its scratch state, the failed one included.
    let fold_solves = solver
        .calls()
        .iter()
        .filter(|c| c.samples < store.num_samples())
        .count();
    assert_eq!(solver.releases(), fold_solves);
    assert!(!artifacts.exists(Path::new("image.json")));
}

#[test]
fn cancellation_stops_before_the_next_fold() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let flag = CancellationFlag::new();
    let mut solver = ShrinkingSolver::new(&sky, &store);
    // Full-data solve plus two folds of the first trial.
    solver.cancel_after = Some((3, flag.clone()));
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();

    let err = CrossValidationEngine::new(&store, &mut solver, &artifacts)
        .with_cancellation(flag)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap_err();

    assert!(matches!(
        err,
        CrossValidationError::Cancelled {
            folds_completed: 2,
            ..
        }
    ));
    assert_eq!(solver.calls().len(), 3);
    assert_eq!(solver.releases(), 2);
}

#[test]
fn parallel_folds_agree_with_sequential_folds() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let config = SolverConfig::default();

    let seq_dir = tempfile::tempdir().unwrap();
    let seq_store = FsArtifactStore::create(seq_dir.path()).unwrap();
    let sequential = CrossValidationEngine::new(&store, ShrinkingSolver::new(&sky, &store), &seq_store)
        .search(&L1, &LTSV, 5, &config)
        .unwrap();

    let par_dir = tempfile::tempdir().unwrap();
    let par_store = FsArtifactStore::create(par_dir.path()).unwrap();
    let solver = ShrinkingSolver::new(&sky, &store);
    let parallel = CrossValidationEngine::new(&store, solver.clone(), &par_store)
        .search_with_parallel_folds(&L1, &LTSV, 5, &config)
        .unwrap();

    assert_eq!((parallel.l1, parallel.ltsv), (sequential.l1, sequential.ltsv));
    for (p, s) in parallel.trials.iter().zip(&sequential.trials) {
        assert_eq!((p.l1, p.ltsv), (s.l1, s.ltsv));
        assert_relative_eq!(
            p.score.as_f64(),
            s.score.as_f64(),
            max_relative = 1e-12
        );
    }
    assert_eq!(solver.calls().len(), 4 * 6);
    assert_eq!(solver.releases(), 4 * 5);
}

#[test]
fn data_file_records_every_trial_in_visitation_order() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path().join("images")).unwrap();
    let data_file = dir.path().join("cvresult.dat");
    let options = EngineOptions {
        data_file: Some(data_file.clone()),
        ..EngineOptions::default()
    };

    let best = CrossValidationEngine::new(&store, ShrinkingSolver::new(&sky, &store), &artifacts)
        .with_options(options)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap();

    let rows = read_cv_table(&data_file).unwrap();
    let expected: Vec<(f64, f64, f64)> = best
        .trials
        .iter()
        .map(|t| (t.l1, t.ltsv, t.score.as_f64()))
        .collect();
    assert_eq!(rows, expected);
}

#[test]
fn run_takes_everything_from_a_json_config() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();
    let data_file = dir.path().join("cv.dat");
    let text = serde_json::json!({
        "l1_candidates": [1e-2, 1e-3],
        "ltsv_candidates": [1e-2],
        "num_fold": 4,
        "image_prefix": "best_image",
        "image_policy": "best",
        "data_file": data_file,
        "fold_seed": 17,
        "solver": { "max_iterations": 200 }
    })
    .to_string();
    let config = CrossValidationConfig::from_json_str(&text).unwrap();

    let mut engine =
        CrossValidationEngine::new(&store, ShrinkingSolver::new(&sky, &store), &artifacts);
    let best = engine.run(&config).unwrap();

    assert_eq!((best.l1, best.ltsv), (1e-3, 1e-2));
    assert_eq!(engine.options().fold_seed, 17);
    assert_eq!(
        json_files(dir.path()),
        vec![dir.path().join("best_image.json")]
    );
    assert_eq!(read_cv_table(&data_file).unwrap().len(), 2);
}

#[test]
fn invalid_inputs_fail_before_any_reconstruction() {
    let sky = true_sky();
    let store = observed_store(&sky);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();
    let mut solver = ShrinkingSolver::new(&sky, &store);

    let mut engine = CrossValidationEngine::new(&store, &mut solver, &artifacts);
    let config = SolverConfig::default();
    assert!(matches!(
        engine.search(&[1e-3, -1.0], &LTSV, 4, &config),
        Err(CrossValidationError::Configuration(_))
    ));
    assert!(matches!(
        engine.search(&L1, &[], 4, &config),
        Err(CrossValidationError::Configuration(_))
    ));
    assert!(matches!(
        engine.search(&L1, &LTSV, 0, &config),
        Err(CrossValidationError::Configuration(_))
    ));
    assert!(matches!(
        engine.search(&L1, &LTSV, store.num_samples() + 1, &config),
        Err(CrossValidationError::Configuration(_))
    ));
    let boxed = SolverConfig {
        clean_box: Some(Array2::from_elem((4, 4), true)),
        ..SolverConfig::default()
    };
    assert!(matches!(
        engine.search(&L1, &LTSV, 4, &boxed),
        Err(CrossValidationError::Configuration(_))
    ));
    drop(engine);
    assert!(solver.calls().is_empty());
    assert!(json_files(dir.path()).is_empty());
}

struct WrongShapeSolver;

impl Solver for WrongShapeSolver {
    fn solve(
        &mut self,
        _visibility: &GriddedVisibilityStore,
        _params: &RegularizationParameters,
        _warm_start: Option<&ImageArray>,
    ) -> Result<ImageArray, SolverError> {
        Ok(ImageArray::zeros((2, 2)))
    }
}

#[test]
fn solver_images_must_match_the_grid() {
    let store = observed_store(&true_sky());
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();
    let err = CrossValidationEngine::new(&store, WrongShapeSolver, &artifacts)
        .search(&L1, &LTSV, 4, &SolverConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        CrossValidationError::ImageShapeMismatch {
            expected: (8, 8),
            found: (2, 2)
        }
    ));
    assert!(json_files(dir.path()).is_empty());
}

/// Reconstruction that blew up in a few pixels.
struct DivergingSolver;

impl Solver for DivergingSolver {
    fn solve(
        &mut self,
        visibility: &GriddedVisibilityStore,
        _params: &RegularizationParameters,
        _warm_start: Option<&ImageArray>,
    ) -> Result<ImageArray, SolverError> {
        let mut image = ImageArray::zeros(visibility.grid().image_shape());
        image[[0, 0]] = f64::NAN;
        image[[1, 1]] = f64::INFINITY;
        image[[2, 2]] = -0.0;
        Ok(image)
    }
}

#[test]
fn published_best_image_keeps_non_finite_pixels_readable() {
    let store = observed_store(&true_sky());
    let dir = tempfile::tempdir().unwrap();
    let artifacts = FsArtifactStore::create(dir.path()).unwrap();
    let best = CrossValidationEngine::new(&store, DivergingSolver, &artifacts)
        .search(&L1, &LTSV, 1, &SolverConfig::default())
        .unwrap();

    let image = artifacts.read(&best.image).unwrap();
    assert_eq!(image.dim(), (8, 8));
    assert!(image[[0, 0]].is_nan());
    assert_eq!(image[[1, 1]], f64::INFINITY);
    assert_eq!(image[[2, 2]].to_bits(), (-0.0f64).to_bits());
    assert_eq!(image[[3, 3]], 0.0);
}
