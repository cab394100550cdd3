//! Support-function outer approximation of the backward tube.
//!
//! For stage `t` and direction `ℓ`, one program over the trajectory
//! `x_t, .., x_N`, inputs `u_t, .., u_{N-1}` and disturbances
//! `w_t, .., w_{N-1} ∈ E` maximizes `ℓᵀ x_t`. Its value bounds the support
//! function of every backward set computed with `E`, so the halfspaces
//! `ℓᵀ x <= value` intersected with `S_t` form an outer approximation.

use fsr_conic::{ConicProgram, ConicSolver, LinExpr, RowRange, SolveStatus};
use fsr_geometry::{BoundedSet, Polytope};
use fsr_runtime::{Component, DiagnosticLedger, ReachEvent};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::chance::add_polytope_rows;
use crate::error::{ReachError, ReachResult};
use crate::lagrangian::SupportDiagnostics;
use crate::system::LinearSystem;
use crate::tube::SafetyTube;

/// Variable layout of one support program.
struct Layout {
    states: usize,
    inputs: usize,
    disturbances: usize,
}

struct SupportValue {
    value: f64,
    costates: Vec<DVector<f64>>,
}

pub(crate) fn support_tube(
    system: &LinearSystem,
    tube: &SafetyTube,
    disturbance_sets: &[BoundedSet],
    directions: &[DVector<f64>],
    solver: &dyn ConicSolver,
    ledger: &mut DiagnosticLedger,
) -> ReachResult<(Vec<Polytope>, Vec<SupportDiagnostics>)> {
    let horizon = tube.horizon();
    let n = tube.dim();
    let mut sets = Vec::with_capacity(horizon + 1);
    let mut diagnostics = Vec::with_capacity(horizon * directions.len());

    for t in 0..horizon {
        let safe = tube.stage(t)?;
        let mut normals = DMatrix::zeros(directions.len(), n);
        let mut values = DVector::zeros(directions.len());
        let mut empty = false;
        for (j, direction) in directions.iter().enumerate() {
            let mut best: Option<SupportValue> = None;
            for set in disturbance_sets {
                let candidate = stage_support(system, tube, set, t, j, direction, solver, ledger)?;
                if let Some(candidate) = candidate
                    && best.as_ref().is_none_or(|b| candidate.value > b.value)
                {
                    best = Some(candidate);
                }
            }
            let (value, costates) = match best {
                Some(SupportValue { value, costates }) => (value, costates),
                None => {
                    empty = true;
                    (f64::NEG_INFINITY, Vec::new())
                }
            };
            normals.set_row(j, &direction.transpose());
            values[j] = value;
            diagnostics.push(SupportDiagnostics {
                stage: t,
                direction: j,
                value,
                costates,
            });
        }
        let stage_set = if empty {
            ledger.record(ReachEvent::warning(
                Component::Lagrangian,
                t,
                "no admissible trajectory from this stage; outer set is empty",
            ));
            Polytope::empty(n)
        } else {
            safe.with_halfspaces(&normals, &values)?
        };
        debug!(stage = t, empty, "support-function stage set");
        ledger.record(
            ReachEvent::progress(Component::Lagrangian, t)
                .with_metric("directions", directions.len() as f64)
                .with_message("support_function"),
        );
        sets.push(stage_set);
    }
    sets.push(tube.stage(horizon)?.clone());
    Ok((sets, diagnostics))
}

/// `None` when no trajectory from stage `t` stays in the tube with
/// disturbances drawn from `set`.
#[allow(clippy::too_many_arguments)]
fn stage_support(
    system: &LinearSystem,
    tube: &SafetyTube,
    set: &BoundedSet,
    t: usize,
    j: usize,
    direction: &DVector<f64>,
    solver: &dyn ConicSolver,
    ledger: &mut DiagnosticLedger,
) -> ReachResult<Option<SupportValue>> {
    let horizon = tube.horizon();
    let steps = horizon - t;
    let n = system.state_dim();
    let m = system.input_dim();
    let p = system.disturbance_dim();

    let mut program = ConicProgram::new();
    let layout = Layout {
        states: program.add_variables(n * (steps + 1)),
        inputs: program.add_variables(m * steps),
        disturbances: program.add_variables(p * steps),
    };
    let state = |k: usize| layout.states + (k - t) * n;
    let input = |k: usize| layout.inputs + (k - t) * m;
    let noise = |k: usize| layout.disturbances + (k - t) * p;

    for k in t..=horizon {
        add_polytope_rows(&mut program, tube.stage(k)?, state(k));
    }
    for k in t..horizon {
        add_polytope_rows(&mut program, system.input_space(), input(k));
        add_disturbance_rows(&mut program, set, noise(k));
    }

    let mut dynamics_rows: Vec<Vec<RowRange>> = Vec::with_capacity(steps);
    for k in t..horizon {
        let stage = system.stage(k)?;
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            let mut expr = LinExpr::var(state(k + 1) + i);
            for c in 0..n {
                expr.push_term(state(k) + c, -stage.a[(i, c)]);
            }
            for c in 0..m {
                expr.push_term(input(k) + c, -stage.b[(i, c)]);
            }
            for c in 0..p {
                expr.push_term(noise(k) + c, -stage.f[(i, c)]);
            }
            rows.push(program.add_eq(expr, 0.0));
        }
        dynamics_rows.push(rows);
    }
    program.maximize(LinExpr::dot(state(t), direction.as_slice()));

    let solution = solver.solve(&program)?;
    match solution.status {
        SolveStatus::Solved | SolveStatus::SolvedInaccurate => {
            if solution.status == SolveStatus::SolvedInaccurate {
                ledger.record(
                    ReachEvent::warning(
                        Component::Lagrangian,
                        t,
                        "support program solved to relaxed tolerances",
                    )
                    .with_metric("direction", j as f64),
                );
            }
            let costates = dynamics_rows
                .iter()
                .map(|rows| {
                    DVector::from_iterator(
                        rows.len(),
                        rows.iter()
                            .map(|&row| solution.dual(row).first().copied().unwrap_or(f64::NAN)),
                    )
                })
                .collect();
            let value = direction.dot(&DVector::from_column_slice(solution.values(state(t), n)));
            Ok(Some(SupportValue { value, costates }))
        }
        SolveStatus::Infeasible => Ok(None),
        SolveStatus::Unbounded | SolveStatus::Failed => {
            Err(ReachError::BoundaryComputationFailed { stage: t, direction: j })
        }
    }
}

/// `w ∈ E`: polytope rows, or `w = c + L v` with `‖v‖ <= 1`.
fn add_disturbance_rows(program: &mut ConicProgram, set: &BoundedSet, start: usize) {
    match set {
        BoundedSet::Polytope(polytope) => add_polytope_rows(program, polytope, start),
        BoundedSet::Ellipsoid(ellipsoid) => {
            let factor = ellipsoid.factor();
            let v = program.add_variables(factor.ncols());
            for i in 0..factor.nrows() {
                let mut expr = LinExpr::var(start + i);
                for c in 0..factor.ncols() {
                    expr.push_term(v + c, -factor[(i, c)]);
                }
                program.add_eq(expr, ellipsoid.center()[i]);
            }
            let rest = (0..factor.ncols()).map(|c| LinExpr::var(v + c)).collect();
            program.add_soc(LinExpr::constant(1.0), rest);
        }
    }
}
