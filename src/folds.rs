//! Fold partitioning and scoped acquisition of per-fold visibility subsets.
//!
//! A [`CrossValidationSession`] fixes the sample enumeration and the fold
//! assignment for one search. Each fold is then entered through a
//! [`SubsetScope`], which owns the materialised active subset for as long as
//! the fold's reconstruction runs and hands the solver nothing else. When the
//! scope is dropped the subset buffers go with it and the solver is told to
//! release its scratch state, whichever way the fold ended.

use crate::error::CrossValidationError;
use crate::solver::{Solver, SolverError};
use crate::types::{GridConfig, ImageArray, RegularizationParameters};
use crate::visibility::{GriddedVisibilityStore, SampleIndex};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Mapping from every sample to a fold id in `0..num_fold`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    num_fold: usize,
    fold_of: Vec<usize>,
    /// Sample indices of each fold, ascending.
    members: Vec<Vec<usize>>,
}

impl FoldAssignment {
    pub fn num_fold(&self) -> usize {
        self.num_fold
    }

    pub fn num_samples(&self) -> usize {
        self.fold_of.len()
    }

    /// With a single fold there is nothing to hold out.
    pub fn is_cross_validation_enabled(&self) -> bool {
        self.num_fold > 1
    }

    pub fn fold_of(&self, sample: usize) -> usize {
        self.fold_of[sample]
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        self.members.iter().map(Vec::len).collect()
    }

    pub fn heldout_indices(&self, fold: usize) -> Result<&[usize], CrossValidationError> {
        self.check_fold(fold)?;
        Ok(&self.members[fold])
    }

    fn check_fold(&self, fold: usize) -> Result<(), CrossValidationError> {
        if fold < self.num_fold {
            Ok(())
        } else {
            Err(CrossValidationError::State(format!(
                "fold index {fold} out of range for {} folds",
                self.num_fold
            )))
        }
    }
}

pub struct FoldPartitioner;

impl FoldPartitioner {
    /// Assign `total_samples` samples to `num_fold` folds.
    ///
    /// The sample order is shuffled with a generator seeded from `seed` and
    /// cut into consecutive chunks; the first `total_samples % num_fold` folds
    /// receive one extra sample. Identical inputs give identical folds.
    pub fn build(
        total_samples: usize,
        num_fold: usize,
        seed: u64,
    ) -> Result<FoldAssignment, CrossValidationError> {
        if num_fold == 0 {
            return Err(CrossValidationError::Configuration(
                "number of folds must be at least 1".to_string(),
            ));
        }
        if num_fold == 1 {
            return Ok(FoldAssignment {
                num_fold,
                fold_of: vec![0; total_samples],
                members: vec![(0..total_samples).collect()],
            });
        }
        if num_fold > total_samples {
            return Err(CrossValidationError::Configuration(format!(
                "{num_fold} folds requested but only {total_samples} visibility samples are available"
            )));
        }

        let mut order: Vec<usize> = (0..total_samples).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let base = total_samples / num_fold;
        let extra = total_samples % num_fold;
        let mut fold_of = vec![0usize; total_samples];
        let mut members = Vec::with_capacity(num_fold);
        let mut start = 0usize;
        for fold in 0..num_fold {
            let size = base + usize::from(fold < extra);
            let mut chunk = order[start..start + size].to_vec();
            chunk.sort_unstable();
            for &sample in &chunk {
                fold_of[sample] = fold;
            }
            members.push(chunk);
            start += size;
        }
        debug_assert_eq!(start, total_samples);

        Ok(FoldAssignment {
            num_fold,
            fold_of,
            members,
        })
    }

    /// Boolean selection masks `(active, heldout)` for one fold.
    pub fn subset(
        assignment: &FoldAssignment,
        fold: usize,
    ) -> Result<(Vec<bool>, Vec<bool>), CrossValidationError> {
        assignment.check_fold(fold)?;
        let heldout: Vec<bool> = assignment.fold_of.iter().map(|&f| f == fold).collect();
        let active = heldout.iter().map(|&h| !h).collect();
        Ok((active, heldout))
    }
}

/// One held-out visibility sample with its physical uv position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeldOutSample {
    pub location: SampleIndex,
    pub u: f64,
    pub v: f64,
    pub real: f64,
    pub imag: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeldOutSamples {
    samples: Vec<HeldOutSample>,
}

impl HeldOutSamples {
    pub fn new(samples: Vec<HeldOutSample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[HeldOutSample] {
        &self.samples
    }
}

/// Materialised active/held-out split for one fold.
#[derive(Debug)]
pub struct SubsetView {
    fold: usize,
    active: GriddedVisibilityStore,
    heldout: HeldOutSamples,
}

impl SubsetView {
    fn materialize(
        store: &GriddedVisibilityStore,
        samples: &[SampleIndex],
        active_mask: &[bool],
        heldout_mask: &[bool],
        fold: usize,
    ) -> Result<Self, CrossValidationError> {
        if active_mask.len() != samples.len() || heldout_mask.len() != samples.len() {
            return Err(CrossValidationError::State(format!(
                "selection masks cover {} / {} samples but the session has {}",
                active_mask.len(),
                heldout_mask.len(),
                samples.len()
            )));
        }
        let grid = store.grid();
        let mut removed = Vec::new();
        let mut heldout = Vec::new();
        for ((&at, &is_active), &is_heldout) in
            samples.iter().zip(active_mask).zip(heldout_mask)
        {
            if is_active == is_heldout {
                return Err(CrossValidationError::State(format!(
                    "sample {at:?} must be either active or held out in fold {fold}"
                )));
            }
            if is_heldout {
                removed.push(at);
                heldout.push(held_out_sample(store, grid, at));
            }
        }
        Ok(Self {
            fold,
            active: store.without_samples(&removed),
            heldout: HeldOutSamples::new(heldout),
        })
    }

    pub fn fold(&self) -> usize {
        self.fold
    }

    pub fn active(&self) -> &GriddedVisibilityStore {
        &self.active
    }

    pub fn heldout(&self) -> &HeldOutSamples {
        &self.heldout
    }

    pub fn active_count(&self) -> usize {
        self.active.num_samples()
    }

    pub fn heldout_count(&self) -> usize {
        self.heldout.len()
    }
}

fn held_out_sample(
    store: &GriddedVisibilityStore,
    grid: &GridConfig,
    at: SampleIndex,
) -> HeldOutSample {
    let (real, imag) = store.value(at);
    let (u, v) = grid.uv_of(at.u, at.v);
    HeldOutSample {
        location: at,
        u,
        v,
        real,
        imag,
    }
}

/// Explicit cross-validation state for one search over one store.
#[derive(Debug)]
pub struct CrossValidationSession<'a> {
    store: &'a GriddedVisibilityStore,
    samples: Vec<SampleIndex>,
    assignment: FoldAssignment,
}

impl<'a> CrossValidationSession<'a> {
    pub fn begin(
        store: &'a GriddedVisibilityStore,
        num_fold: usize,
        seed: u64,
    ) -> Result<Self, CrossValidationError> {
        let samples = store.sample_locations();
        let assignment = FoldPartitioner::build(samples.len(), num_fold, seed)?;
        log::debug!(
            "[CV] session started: {} samples in {} folds (sizes {:?})",
            samples.len(),
            num_fold,
            assignment.fold_sizes()
        );
        Ok(Self {
            store,
            samples,
            assignment,
        })
    }

    pub fn store(&self) -> &'a GriddedVisibilityStore {
        self.store
    }

    pub fn assignment(&self) -> &FoldAssignment {
        &self.assignment
    }

    pub fn num_fold(&self) -> usize {
        self.assignment.num_fold()
    }

    pub fn is_cross_validation_enabled(&self) -> bool {
        self.assignment.is_cross_validation_enabled()
    }

    /// Enter one fold. The returned scope owns the subset until it is dropped.
    pub fn enter_fold<'s, S: Solver + ?Sized>(
        &'s self,
        fold: usize,
        solver: &'s mut S,
    ) -> Result<SubsetScope<'s, S>, CrossValidationError> {
        if !self.is_cross_validation_enabled() {
            return Err(CrossValidationError::State(
                "cross validation is disabled for a single fold".to_string(),
            ));
        }
        let (active_mask, heldout_mask) = FoldPartitioner::subset(&self.assignment, fold)?;
        SubsetScope::enter(
            self.store,
            &self.samples,
            &active_mask,
            &heldout_mask,
            fold,
            solver,
        )
    }

    pub fn end(self) {
        log::debug!(
            "[CV] session ended ({} folds over {} samples)",
            self.assignment.num_fold(),
            self.samples.len()
        );
    }
}

/// Scoped ownership of one fold's subset.
///
/// Only the active subset can reach the solver through [`SubsetScope::solve`];
/// the held-out samples are exposed read-only for error evaluation.
pub struct SubsetScope<'s, S: Solver + ?Sized> {
    view: SubsetView,
    solver: &'s mut S,
}

impl<'s, S: Solver + ?Sized> SubsetScope<'s, S> {
    pub fn enter(
        store: &GriddedVisibilityStore,
        samples: &[SampleIndex],
        active_mask: &[bool],
        heldout_mask: &[bool],
        fold: usize,
        solver: &'s mut S,
    ) -> Result<Self, CrossValidationError> {
        let view = SubsetView::materialize(store, samples, active_mask, heldout_mask, fold)?;
        log::debug!(
            "[CV] fold {} entered: {} active, {} held out",
            fold,
            view.active_count(),
            view.heldout_count()
        );
        Ok(Self { view, solver })
    }

    pub fn fold(&self) -> usize {
        self.view.fold()
    }

    pub fn heldout(&self) -> &HeldOutSamples {
        self.view.heldout()
    }

    pub fn active_count(&self) -> usize {
        self.view.active_count()
    }

    /// Cold reconstruction from the active subset only.
    pub fn solve(&mut self, params: &RegularizationParameters) -> Result<ImageArray, SolverError> {
        self.solver.solve(self.view.active(), params, None)
    }
}

impl<S: Solver + ?Sized> Drop for SubsetScope<'_, S> {
    fn drop(&mut self) {
        // The view's buffers are dropped right after this runs.
        self.solver.release_scratch();
        log::debug!("[CV] fold {} released", self.view.fold());
    }
}
