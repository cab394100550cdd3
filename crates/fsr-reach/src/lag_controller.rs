//! One-step input synthesis along a robust backward tube.

use fsr_conic::{ConicProgram, ConicSolver, LinExpr, SolveStatus};
use fsr_geometry::{BoundedSet, Polytope};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::chance::add_polytope_rows;
use crate::error::{ReachResult, invalid};
use crate::lagrangian::{BackwardTube, erode};
use crate::system::{LinearSystem, StageMatrices};

/// Precomputed `X_{t+1} ⊖ F_t E` targets of an under-approximation tube.
///
/// An input returned by [`LagrangianController::input_for`] keeps the
/// nominal successor in the eroded target, so every disturbance in the sets
/// the tube was built with keeps the true successor in `X_{t+1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagrangianController {
    stages: Vec<StageMatrices>,
    targets: Vec<Polytope>,
    input_space: Polytope,
    margin_cap: f64,
}

impl LagrangianController {
    pub fn new(
        system: &LinearSystem,
        tube: &BackwardTube,
        disturbance_sets: &[BoundedSet],
    ) -> ReachResult<Self> {
        if disturbance_sets.is_empty() {
            return Err(invalid("controller needs at least one disturbance set"));
        }
        let horizon = tube.horizon();
        let mut stages = Vec::with_capacity(horizon);
        let mut targets = Vec::with_capacity(horizon);
        for t in 0..horizon {
            let stage = system.stage(t)?;
            let next = tube.stage(t + 1)?;
            let mut target = erode(next, stage, &disturbance_sets[0])?;
            for set in &disturbance_sets[1..] {
                target = target.intersect(&erode(next, stage, set)?)?;
            }
            stages.push(stage.clone());
            targets.push(target);
        }
        Ok(Self {
            stages,
            targets,
            input_space: system.input_space().clone(),
            margin_cap: 1e3,
        })
    }

    #[must_use]
    pub fn horizon(&self) -> usize {
        self.targets.len()
    }

    /// Admissible input at `stage` from `x` with the largest margin to the
    /// boundary of the eroded target; `None` when no admissible input exists.
    pub fn input_for(
        &self,
        stage: usize,
        x: &DVector<f64>,
        solver: &dyn ConicSolver,
    ) -> ReachResult<Option<DVector<f64>>> {
        let (Some(matrices), Some(target)) = (self.stages.get(stage), self.targets.get(stage))
        else {
            return Err(invalid(format!(
                "stage {stage} outside controller horizon {}",
                self.horizon()
            )));
        };
        if x.len() != matrices.a.ncols() {
            return Err(invalid(format!(
                "state has length {}, expected {}",
                x.len(),
                matrices.a.ncols()
            )));
        }
        let m = matrices.b.ncols();
        let drift = &matrices.a * x;

        let mut program = ConicProgram::new();
        let u = program.add_variables(m);
        let margin = program.add_variable();
        let split = target.with_split_equalities();
        for i in 0..split.num_inequalities() {
            let normal = split.a().row(i).transpose();
            let on_input = matrices.b.transpose() * &normal;
            // Equality pairs have no interior; they get no margin term.
            let scale = if i >= target.num_inequalities() {
                0.0
            } else {
                normal.norm()
            };
            let expr = LinExpr::dot(u, on_input.as_slice()).term(margin, scale);
            program.add_le(expr, split.b()[i] - normal.dot(&drift));
        }
        add_polytope_rows(&mut program, &self.input_space, u);
        program.add_bounds(margin, 0.0, self.margin_cap);
        program.maximize(LinExpr::var(margin));

        let solution = solver.solve(&program)?;
        match solution.status {
            SolveStatus::Solved | SolveStatus::SolvedInaccurate => {
                Ok(Some(DVector::from_column_slice(solution.values(u, m))))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lagrangian::test_support::box_tube;
    use crate::lagrangian::{Approximation, LagrangianMethod, LagrangianOptions, backward_tube};
    use crate::system::{Disturbance, fixtures};
    use fsr_conic::ClarabelSolver;

    fn controller() -> (LinearSystem, BackwardTube, LagrangianController) {
        let system = fixtures::bounded_double_integrator();
        let Disturbance::Bounded(sets) = system.disturbance().clone() else {
            panic!("bounded fixture");
        };
        let result = backward_tube(
            &system,
            &box_tube(3),
            &sets,
            &LagrangianMethod::Exact,
            Approximation::Under,
            &LagrangianOptions::default(),
            &ClarabelSolver::default(),
        )
        .expect("exact tube must work");
        let controller =
            LagrangianController::new(&system, &result.tube, &sets).expect("controller");
        (system, result.tube, controller)
    }

    #[test]
    fn keeps_worst_case_successor_in_tube() {
        let (system, tube, controller) = controller();
        let solver = ClarabelSolver::default();
        let corners = [[0.1, 0.1], [0.1, -0.1], [-0.1, 0.1], [-0.1, -0.1]];
        let mut x = DVector::from_vec(vec![2.0, 1.0]);
        assert!(tube.stage(0).expect("stage").contains(&x, 1e-7));
        for t in 0..controller.horizon() {
            let u = controller
                .input_for(t, &x, &solver)
                .expect("controller must work")
                .expect("admissible input");
            assert!(system.input_space().contains(&u, 1e-6));
            let stage = system.stage(t).expect("stage");
            for corner in corners {
                let w = DVector::from_vec(corner.to_vec());
                let next = stage.step(&x, &u, &w);
                assert!(tube.stage(t + 1).expect("stage").contains(&next, 1e-6));
            }
            x = stage.step(&x, &u, &DVector::from_vec(vec![0.1, -0.1]));
        }
    }

    #[test]
    fn state_outside_tube_has_no_input() {
        let (_, _, controller) = controller();
        let u = controller
            .input_for(0, &DVector::from_vec(vec![4.9, 2.0]), &ClarabelSolver::default())
            .expect("controller must work");
        assert!(u.is_none());
    }

    #[test]
    fn stage_beyond_horizon_is_rejected() {
        let (_, _, controller) = controller();
        assert!(
            controller
                .input_for(3, &DVector::zeros(2), &ClarabelSolver::default())
                .is_err()
        );
    }
}
