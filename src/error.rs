use crate::artifact::ArtifactError;
use crate::solver::SolverError;
use crate::visibility::VisibilityError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrossValidationError {
    #[error("Invalid cross-validation configuration: {0}")]
    Configuration(String),

    #[error("Solver failed for L1={l1:e}, Ltsv={ltsv:e} ({stage}): {source}", stage = describe_stage(.fold))]
    Solver {
        l1: f64,
        ltsv: f64,
        /// `None` for the full-data reconstruction of the trial.
        fold: Option<usize>,
        #[source]
        source: SolverError,
    },

    #[error("Cross-validation state violation: {0}")]
    State(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Visibility(#[from] VisibilityError),

    #[error(
        "Reconstructed image has shape {found:?} but the visibility grid expects {expected:?}"
    )]
    ImageShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "Search cancelled during trial L1={l1:e}, Ltsv={ltsv:e} after {folds_completed} completed folds; partial fold results were discarded"
    )]
    Cancelled {
        l1: f64,
        ltsv: f64,
        folds_completed: usize,
    },
}

fn describe_stage(fold: &Option<usize>) -> String {
    match fold {
        Some(i) => format!("fold {i}"),
        None => "full-data reconstruction".to_string(),
    }
}
