//! Derivative-free maximization over a polytope.

use fsr_geometry::Polytope;
use fsr_linalg::null_space;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ReachResult, invalid};

/// Feasibility slack used when accepting trial points.
const FEASIBILITY_TOL: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfoResult {
    pub point: DVector<f64>,
    pub value: f64,
    pub evaluations: usize,
    /// Step size fell below the minimum before the evaluation budget ran out.
    pub converged: bool,
}

/// Local maximizer of a black-box objective over a polytope.
pub trait DerivativeFreeOptimizer {
    /// Maximize `objective` over `feasible`, starting from a feasible `start`.
    fn maximize(
        &self,
        objective: &mut dyn FnMut(&DVector<f64>) -> ReachResult<f64>,
        feasible: &Polytope,
        start: &DVector<f64>,
    ) -> ReachResult<DfoResult>;
}

impl<T: DerivativeFreeOptimizer + ?Sized> DerivativeFreeOptimizer for &T {
    fn maximize(
        &self,
        objective: &mut dyn FnMut(&DVector<f64>) -> ReachResult<f64>,
        feasible: &Polytope,
        start: &DVector<f64>,
    ) -> ReachResult<DfoResult> {
        (**self).maximize(objective, feasible, start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternSearchOptions {
    pub initial_step: f64,
    pub min_step: f64,
    pub max_evaluations: usize,
}

impl Default for PatternSearchOptions {
    fn default() -> Self {
        Self {
            initial_step: 0.5,
            min_step: 1e-2,
            max_evaluations: 200,
        }
    }
}

/// Feasible compass search: poll `±step · b_i`, move to the best improving
/// feasible point, halve the step when no poll improves. The `b_i` are the
/// coordinate axes, or an orthonormal basis of the null space of the
/// equality rows when the feasible set has any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSearch {
    pub options: PatternSearchOptions,
}

impl PatternSearch {
    #[must_use]
    pub const fn new(options: PatternSearchOptions) -> Self {
        Self { options }
    }
}

impl DerivativeFreeOptimizer for PatternSearch {
    fn maximize(
        &self,
        objective: &mut dyn FnMut(&DVector<f64>) -> ReachResult<f64>,
        feasible: &Polytope,
        start: &DVector<f64>,
    ) -> ReachResult<DfoResult> {
        let PatternSearchOptions {
            initial_step,
            min_step,
            max_evaluations,
        } = self.options;
        if !(initial_step > 0.0 && min_step > 0.0 && min_step <= initial_step) {
            return Err(invalid(
                "pattern search needs 0 < min_step <= initial_step",
            ));
        }
        if start.len() != feasible.dim() {
            return Err(invalid(format!(
                "start has length {}, feasible set has dimension {}",
                start.len(),
                feasible.dim()
            )));
        }
        if !feasible.contains(start, FEASIBILITY_TOL) {
            return Err(invalid("pattern search start point is infeasible"));
        }

        let basis = if feasible.has_equalities() {
            null_space(feasible.ae())
        } else {
            DMatrix::identity(start.len(), start.len())
        };

        let mut point = start.clone();
        let mut value = objective(&point)?;
        let mut evaluations = 1;
        let mut step = initial_step;
        while step >= min_step && evaluations < max_evaluations {
            let mut best: Option<(DVector<f64>, f64)> = None;
            'poll: for direction in basis.column_iter() {
                for sign in [1.0, -1.0] {
                    if evaluations >= max_evaluations {
                        break 'poll;
                    }
                    let trial = &point + direction * (sign * step);
                    if !feasible.contains(&trial, FEASIBILITY_TOL) {
                        continue;
                    }
                    let trial_value = objective(&trial)?;
                    evaluations += 1;
                    let incumbent = best.as_ref().map_or(value, |(_, v)| *v);
                    if trial_value > incumbent {
                        best = Some((trial, trial_value));
                    }
                }
            }
            match best {
                Some((next, next_value)) => {
                    point = next;
                    value = next_value;
                }
                None => step *= 0.5,
            }
        }
        trace!(evaluations, value, step, "pattern search finished");
        Ok(DfoResult {
            point,
            value,
            evaluations,
            converged: step < min_step,
        })
    }
}
