use crate::types::{ImageArray, RegularizationParameters};
use crate::visibility::GriddedVisibilityStore;
use thiserror::Error;

/// Failure reported by an image reconstruction backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("solver diverged after {iterations} iterations: {message}")]
    Diverged { iterations: usize, message: String },

    #[error("{0}")]
    Other(String),
}

/// Reconstruction backend driven by the cross-validation engine.
///
/// Implementations minimise `||F x - y||^2 + L1 |x| + Ltsv TSV(x)` over the
/// visibilities they are handed and return an image of shape `(nv, nu)` for
/// the grid of that store. The engine never calls a solver from more than one
/// thread at a time unless fold parallelism is requested explicitly, in which
/// case every fold works on its own clone.
pub trait Solver {
    fn solve(
        &mut self,
        visibility: &GriddedVisibilityStore,
        params: &RegularizationParameters,
        warm_start: Option<&ImageArray>,
    ) -> Result<ImageArray, SolverError>;

    /// Drop any per-subset scratch state. Called when a fold scope ends.
    fn release_scratch(&mut self) {}
}

impl<S: Solver + ?Sized> Solver for &mut S {
    fn solve(
        &mut self,
        visibility: &GriddedVisibilityStore,
        params: &RegularizationParameters,
        warm_start: Option<&ImageArray>,
    ) -> Result<ImageArray, SolverError> {
        (**self).solve(visibility, params, warm_start)
    }

    fn release_scratch(&mut self) {
        (**self).release_scratch()
    }
}
