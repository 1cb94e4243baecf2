#![deny(dead_code)]
#![deny(unused_imports)]

pub mod artifact;
pub mod cv;
pub mod error;
pub mod folds;
pub mod mse;
pub mod solver;
pub mod types;
pub mod visibility;

pub use artifact::{
    ArtifactError, ArtifactStore, CvTableWriter, FsArtifactStore, canonical_artifact_name,
    read_cv_table, trial_artifact_name,
};
pub use cv::{
    BestResult, CV_DISABLED_MSE, CancellationFlag, CrossValidationEngine, EngineOptions,
    TrialResult, TrialScore, select_best, sweep_order,
};
pub use error::CrossValidationError;
pub use folds::{
    CrossValidationSession, FoldAssignment, FoldPartitioner, HeldOutSample, HeldOutSamples,
    SubsetScope, SubsetView,
};
pub use mse::{ErrorAccumulator, FourierForwardModel};
pub use solver::{Solver, SolverError};
pub use types::{
    CrossValidationConfig, GridConfig, ImageArray, RegularizationParameters, SolverConfig,
    TrialArtifactPolicy,
};
pub use visibility::{GriddedVisibilityStore, SampleIndex, VisibilityError};
