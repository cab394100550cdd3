//! Ray-shooting inner approximation of the one-step backward set.
//!
//! The joint set `{(x, u) : A x + B u ∈ Y, x ∈ S_t, u ∈ U}` is bounded, so
//! rays from an interior point hit its boundary. The hull of the hit points,
//! projected on `x`, lies inside the exact one-step set.

use fsr_conic::{ConicProgram, ConicSolver, LinExpr, SolveStatus};
use fsr_geometry::Polytope;
use fsr_linalg::null_space;
use fsr_runtime::{Component, DiagnosticLedger, ReachEvent};
use nalgebra::{DMatrix, DVector};

use crate::error::{ReachError, ReachResult, invalid};
use crate::lagrangian::LagrangianOptions;
use crate::system::StageMatrices;

/// Directions shorter than this (after projection on the affine hull) are
/// skipped.
const DIRECTION_TOL: f64 = 1e-12;

/// Slopes below this do not limit a ray.
const SLOPE_TOL: f64 = 1e-12;

#[allow(clippy::too_many_arguments)]
pub(crate) fn ray_one_step(
    eroded: &Polytope,
    stage: &StageMatrices,
    input_space: &Polytope,
    safe: &Polytope,
    directions: &[DVector<f64>],
    options: &LagrangianOptions,
    solver: &dyn ConicSolver,
    t: usize,
    ledger: &mut DiagnosticLedger,
) -> ReachResult<Polytope> {
    let n = stage.a.nrows();
    let m = stage.b.ncols();
    let joint = joint_set(eroded, stage, input_space, safe)?;

    let Some((chebyshev, _)) = joint.chebyshev_center(solver, options.chebyshev_radius_cap)?
    else {
        return Err(ReachError::NoFeasiblePoint { stage: t });
    };
    let center = match analytic_center(&joint, solver)? {
        Some((point, status)) if joint.contains(&point, 1e-7) => {
            if status == SolveStatus::SolvedInaccurate {
                ledger.record(ReachEvent::warning(
                    Component::Lagrangian,
                    t,
                    "analytic center solved to relaxed tolerances",
                ));
            }
            point
        }
        _ => {
            ledger.record(ReachEvent::warning(
                Component::Lagrangian,
                t,
                "analytic center unavailable; shooting from the Chebyshev center",
            ));
            chebyshev
        }
    };

    let projector = if joint.has_equalities() {
        let basis = null_space(joint.ae());
        &basis * basis.transpose()
    } else {
        DMatrix::identity(n + m, n + m)
    };

    let mut points = Vec::with_capacity(directions.len());
    for (j, direction) in directions.iter().enumerate() {
        let padded = if direction.len() == n {
            let mut padded = DVector::zeros(n + m);
            padded.rows_mut(0, n).copy_from(direction);
            padded
        } else if direction.len() == n + m {
            direction.clone()
        } else {
            return Err(invalid(format!(
                "ray direction {j} has length {}, expected {n} or {}",
                direction.len(),
                n + m
            )));
        };
        let d = &projector * padded;
        if d.norm() < DIRECTION_TOL {
            ledger.record(ReachEvent::warning(
                Component::Lagrangian,
                t,
                format!("direction {j} vanishes on the affine hull; skipped"),
            ));
            continue;
        }
        let theta = ray_length(&joint, &center, &d)
            .ok_or(ReachError::BoundaryComputationFailed { stage: t, direction: j })?;
        let hit = &center + d * theta;
        points.push(hit.rows(0, n).into_owned());
    }
    if points.is_empty() {
        return Err(ReachError::NoFeasiblePoint { stage: t });
    }
    Ok(Polytope::from_vertices(&points, n)?)
}

/// `{(x, u) : A x + B u ∈ eroded, x ∈ safe, u ∈ U}` in `R^{n+m}`.
fn joint_set(
    eroded: &Polytope,
    stage: &StageMatrices,
    input_space: &Polytope,
    safe: &Polytope,
) -> ReachResult<Polytope> {
    let n = stage.a.nrows();
    let m = stage.b.ncols();
    let mut dynamics = DMatrix::zeros(n, n + m);
    dynamics.view_mut((0, 0), (n, n)).copy_from(&stage.a);
    dynamics.view_mut((0, n), (n, m)).copy_from(&stage.b);
    let mut state = DMatrix::zeros(n, n + m);
    state.view_mut((0, 0), (n, n)).fill_with_identity();
    let mut input = DMatrix::zeros(m, n + m);
    input.view_mut((0, n), (m, m)).fill_with_identity();
    Ok(eroded
        .preimage(&dynamics)?
        .intersect(&safe.preimage(&state)?)?
        .intersect(&input_space.preimage(&input)?)?)
}

/// Maximizer of `Σ log(b_i − a_iᵀz)` subject to the equalities.
fn analytic_center(
    set: &Polytope,
    solver: &dyn ConicSolver,
) -> ReachResult<Option<(DVector<f64>, SolveStatus)>> {
    let dim = set.dim();
    let rows = set.num_inequalities();
    let mut program = ConicProgram::new();
    let z = program.add_variables(dim);
    let logs = program.add_variables(rows);
    for i in 0..rows {
        let normal = -set.a().row(i).transpose();
        let slack = LinExpr::dot(z, normal.as_slice()).plus_constant(set.b()[i]);
        program.add_exp(LinExpr::var(logs + i), LinExpr::constant(1.0), slack);
    }
    for i in 0..set.num_equalities() {
        let normal = set.ae().row(i).transpose();
        program.add_eq(LinExpr::dot(z, normal.as_slice()), set.be()[i]);
    }
    program.maximize(LinExpr::dot(logs, &vec![1.0; rows]));
    let solution = solver.solve(&program)?;
    if !solution.status.is_usable() {
        return Ok(None);
    }
    Ok(Some((
        DVector::from_column_slice(solution.values(z, dim)),
        solution.status,
    )))
}

/// Largest `θ >= 0` with `center + θ d` in the set; `None` when the ray is
/// unbounded.
pub(crate) fn ray_length(
    set: &Polytope,
    center: &DVector<f64>,
    direction: &DVector<f64>,
) -> Option<f64> {
    let mut theta = f64::INFINITY;
    for i in 0..set.num_inequalities() {
        let normal = set.a().row(i).transpose();
        let slope = normal.dot(direction);
        if slope > SLOPE_TOL {
            let slack = (set.b()[i] - normal.dot(center)).max(0.0);
            theta = theta.min(slack / slope);
        }
    }
    theta.is_finite().then_some(theta)
}
