//! Target tube `S_0, .., S_N` of polytopes the trajectory must remain in.

use fsr_geometry::Polytope;
use fsr_linalg::block_diag;
use nalgebra::{DVector, RowDVector};
use serde::{Deserialize, Serialize};

use crate::error::{ReachError, ReachResult, invalid};

/// One inequality `hᵀ x_k <= g` of the tube at stage `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct TubeRow {
    pub stage: usize,
    pub normal: DVector<f64>,
    pub rhs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyTube {
    sets: Vec<Polytope>,
}

impl SafetyTube {
    /// Tube from `N + 1` sets of a common dimension.
    pub fn new(sets: Vec<Polytope>) -> ReachResult<Self> {
        let Some(first) = sets.first() else {
            return Err(invalid("safety tube needs at least one set"));
        };
        let dim = first.dim();
        if let Some((k, bad)) = sets.iter().enumerate().find(|(_, s)| s.dim() != dim) {
            return Err(invalid(format!(
                "tube set {k} has dimension {}, expected {dim}",
                bad.dim()
            )));
        }
        if sets.len() < 2 {
            return Err(ReachError::InvalidHorizon { horizon: 0 });
        }
        Ok(Self { sets })
    }

    /// The same set repeated for stages `0..=horizon`.
    pub fn constant(set: Polytope, horizon: usize) -> ReachResult<Self> {
        if horizon == 0 {
            return Err(ReachError::InvalidHorizon { horizon });
        }
        Self::new(vec![set; horizon + 1])
    }

    #[must_use]
    pub fn horizon(&self) -> usize {
        self.sets.len() - 1
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.sets[0].dim()
    }

    #[must_use]
    pub fn sets(&self) -> &[Polytope] {
        &self.sets
    }

    /// `S_k`, or `InvalidArgument` past the horizon.
    pub fn stage(&self, k: usize) -> ReachResult<&Polytope> {
        self.sets
            .get(k)
            .ok_or_else(|| invalid(format!("tube has no stage {k}")))
    }

    /// Inequalities of `S_k`, equalities split into two opposing rows.
    pub fn rows(&self, k: usize) -> ReachResult<Vec<TubeRow>> {
        let set = self.stage(k)?;
        let mut rows = Vec::with_capacity(set.num_inequalities() + 2 * set.num_equalities());
        let mut push = |normal: RowDVector<f64>, rhs: f64| {
            rows.push(TubeRow {
                stage: k,
                normal: normal.transpose(),
                rhs,
            });
        };
        for i in 0..set.num_inequalities() {
            push(set.a().row(i).into_owned(), set.b()[i]);
        }
        for i in 0..set.num_equalities() {
            push(set.ae().row(i).into_owned(), set.be()[i]);
            push(-set.ae().row(i).into_owned(), -set.be()[i]);
        }
        Ok(rows)
    }

    /// Rows of `S_1, .., S_N`, in stage order.
    pub fn future_rows(&self) -> ReachResult<Vec<TubeRow>> {
        let mut all = Vec::new();
        for k in 1..=self.horizon() {
            all.extend(self.rows(k)?);
        }
        Ok(all)
    }

    /// `S_1 × .. × S_N` as a polytope over the stacked trajectory `[x_1; ..; x_N]`.
    pub fn stacked_future(&self) -> ReachResult<Polytope> {
        let future = &self.sets[1..];
        let a = block_diag(&future.iter().map(|s| s.a().clone()).collect::<Vec<_>>());
        let ae = block_diag(&future.iter().map(|s| s.ae().clone()).collect::<Vec<_>>());
        let b = DVector::from_iterator(
            a.nrows(),
            future.iter().flat_map(|s| s.b().iter().copied()),
        );
        let be = DVector::from_iterator(
            ae.nrows(),
            future.iter().flat_map(|s| s.be().iter().copied()),
        );
        Ok(Polytope::new(a, b, ae, be)?)
    }

    /// Whether every state of a trajectory `[x_0, .., x_N]` lies in its set.
    #[must_use]
    pub fn contains_trajectory(&self, states: &[DVector<f64>], tol: f64) -> bool {
        states.len() == self.sets.len()
            && states
                .iter()
                .zip(&self.sets)
                .all(|(x, set)| set.contains(x, tol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_tube(horizon: usize) -> SafetyTube {
        SafetyTube::constant(
            Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box"),
            horizon,
        )
        .expect("tube")
    }

    #[test]
    fn horizon_counts_transitions() {
        let tube = square_tube(3);
        assert_eq!(tube.horizon(), 3);
        assert_eq!(tube.sets().len(), 4);
        assert!(matches!(
            tube.stage(4),
            Err(crate::ReachError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn single_set_tube_is_rejected() {
        let err = SafetyTube::new(vec![Polytope::from_box(&[0.0], &[1.0]).expect("box")])
            .expect_err("needs a transition");
        assert_eq!(err, ReachError::InvalidHorizon { horizon: 0 });
    }

    #[test]
    fn equalities_split_into_two_rows() {
        let set = Polytope::new(
            nalgebra::DMatrix::from_row_slice(2, 2, &[1.0, 0.0, -1.0, 0.0]),
            DVector::from_vec(vec![1.0, 1.0]),
            nalgebra::DMatrix::from_row_slice(1, 2, &[0.0, 1.0]),
            DVector::from_vec(vec![0.5]),
        )
        .expect("polytope");
        let tube = SafetyTube::constant(set, 1).expect("tube");
        let rows = tube.rows(1).expect("rows");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].rhs, -0.5);
        assert_eq!(rows[3].stage, 1);
    }

    #[test]
    fn stacked_future_has_block_structure() {
        let tube = square_tube(2);
        let stacked = tube.stacked_future().expect("stacked");
        assert_eq!(stacked.dim(), 4);
        assert_eq!(stacked.num_inequalities(), 8);
        assert!(stacked.contains(&DVector::from_vec(vec![0.5, 0.5, -0.5, 0.9]), 0.0));
        assert!(!stacked.contains(&DVector::from_vec(vec![0.5, 0.5, -0.5, 1.1]), 0.0));
    }

    #[test]
    fn trajectory_membership() {
        let tube = square_tube(1);
        let inside = vec![DVector::zeros(2), DVector::from_element(2, 0.5)];
        let outside = vec![DVector::zeros(2), DVector::from_element(2, 1.5)];
        assert!(tube.contains_trajectory(&inside, 0.0));
        assert!(!tube.contains_trajectory(&outside, 0.0));
        assert!(!tube.contains_trajectory(&inside[..1], 0.0));
    }
}
