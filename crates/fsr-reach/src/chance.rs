//! Open-loop chance-constrained reformulation.
//!
//! Row `hᵀ x_k <= g` of the tube holds with probability at least `1 − δ`
//! when `hᵀ E[x_k] + σ Φ⁻¹(1 − δ) <= g`, `σ = ‖Σ^{1/2} h‖`. With open-loop
//! inputs `σ` is fixed, and replacing `Φ⁻¹(1 − δ)` by the max of the
//! piecewise-linear chords gives one linear row per chord. Boole's
//! inequality turns the per-row risks into `P(stay) >= 1 − Σ δ`.

use fsr_conic::{ConicProgram, ConicSolver, LinExpr, SolveStatus};
use fsr_geometry::Polytope;
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::concat::{ConcatenatedDynamics, concatenate};
use crate::error::ReachResult;
use crate::outcome::{
    Controller, NoCertificateReason, PointCertificate, PointOutcome, PointResult, RiskAllocation,
};
use crate::pwl::{PiecewiseLinearBound, PwlOptions, RISK_UPPER_BOUND, inverse_cdf_bound};
use crate::system::LinearSystem;
use crate::tube::SafetyTube;
use crate::validation::validate_point_inputs;

/// Standard deviations below this are treated as deterministic rows.
pub(crate) const DETERMINISTIC_STD: f64 = 1e-12;

/// Membership slack for the initial-state check.
pub(crate) const MEMBERSHIP_TOL: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChanceOpenOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    pub pwl: PwlOptions,
}

impl Default for ChanceOpenOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            pwl: PwlOptions::default(),
        }
    }
}

/// How `x_0` enters the program.
#[derive(Clone, Copy)]
pub(crate) enum InitialPoint<'a> {
    Fixed(&'a DVector<f64>),
    /// Decision variable constrained to a polytope.
    Free(&'a Polytope),
}

/// Variable layout of an assembled open-loop program.
pub(crate) struct OpenLoopProgram {
    pub program: ConicProgram,
    pub x0: Option<usize>,
    pub inputs: usize,
    pub input_len: usize,
    pub risks: usize,
    pub risk_len: usize,
}

impl OpenLoopProgram {
    pub fn total_risk(&self) -> LinExpr {
        LinExpr::dot(self.risks, &vec![1.0; self.risk_len])
    }
}

/// Assemble the linear rows of the open-loop reformulation. The caller sets
/// the objective and any extra rows.
pub(crate) fn build_open_loop(
    system: &LinearSystem,
    tube: &SafetyTube,
    concat: &ConcatenatedDynamics,
    bound: &PiecewiseLinearBound,
    initial: InitialPoint<'_>,
) -> ReachResult<OpenLoopProgram> {
    let n = concat.state_dim;
    let input_len = concat.input_dim * concat.horizon;
    let (mean_w, cov_w) = system.stacked_disturbance(concat.horizon)?;
    let noise_cov: DMatrix<f64> = &concat.g * cov_w * concat.g.transpose();
    let noise_mean = &concat.g * mean_w;
    let rows = tube.future_rows()?;

    let mut program = ConicProgram::new();
    let (x0, fixed_x0) = match initial {
        InitialPoint::Fixed(point) => (None, Some(point)),
        InitialPoint::Free(_) => (Some(program.add_variables(n)), None),
    };
    let inputs = program.add_variables(input_len);
    let risks = program.add_variables(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let lifted = concat.lift_row(row.stage, &row.normal);
        let sigma = lifted.dot(&(&noise_cov * &lifted)).max(0.0).sqrt();
        let on_x0 = concat.z.transpose() * &lifted;
        let on_inputs = concat.h.transpose() * &lifted;

        let mut mean_expr = LinExpr::dot(inputs, on_inputs.as_slice());
        let mut rhs = row.rhs - lifted.dot(&noise_mean);
        if let Some(point) = fixed_x0 {
            rhs -= on_x0.dot(point);
        }
        if let Some(start) = x0 {
            mean_expr = mean_expr.plus(&LinExpr::dot(start, on_x0.as_slice()));
        }

        let delta = risks + i;
        program.add_bounds(delta, bound.lower_bound(), RISK_UPPER_BOUND);
        if sigma < DETERMINISTIC_STD {
            program.add_le(mean_expr, rhs);
            continue;
        }
        for segment in bound.segments() {
            let expr = mean_expr.clone().term(delta, sigma * segment.slope);
            program.add_le(expr, rhs - sigma * segment.intercept);
        }
    }
    if !rows.is_empty() {
        // Boole: the allocated risk must leave a nonnegative probability.
        program.add_le(LinExpr::dot(risks, &vec![1.0; rows.len()]), 1.0);
    }

    let input_space = system.input_space();
    let m = concat.input_dim;
    for t in 0..concat.horizon {
        add_polytope_rows(&mut program, input_space, inputs + t * m);
    }
    if let (InitialPoint::Free(set), Some(start)) = (&initial, x0) {
        add_polytope_rows(&mut program, set, start);
    }

    Ok(OpenLoopProgram {
        program,
        x0,
        inputs,
        input_len,
        risks,
        risk_len: rows.len(),
    })
}

/// `A v <= b, Ae v = be` for the variables starting at `start`.
pub(crate) fn add_polytope_rows(program: &mut ConicProgram, set: &Polytope, start: usize) {
    for i in 0..set.num_inequalities() {
        let row = set.a().row(i).transpose();
        program.add_le(LinExpr::dot(start, row.as_slice()), set.b()[i]);
    }
    for i in 0..set.num_equalities() {
        let row = set.ae().row(i).transpose();
        program.add_eq(LinExpr::dot(start, row.as_slice()), set.be()[i]);
    }
}

/// Maximal certified probability from a fixed `x_0` over open-loop inputs.
pub fn chance_open_point(
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    options: &ChanceOpenOptions,
    solver: &dyn ConicSolver,
) -> ReachResult<PointResult> {
    validate_point_inputs(system, tube, x0, options.mode, options.check_finite)?;
    let mut ledger = DiagnosticLedger::default();

    let start = tube.stage(0)?;
    if !start.contains(x0, MEMBERSHIP_TOL) {
        ledger.record(
            ReachEvent::new(Component::ChanceOpen, 0, EventKind::Terminated)
                .with_metric("initial_violation", start.max_violation(x0))
                .with_message("initial state outside the first tube set"),
        );
        return Ok(PointResult {
            outcome: PointOutcome::none(
                NoCertificateReason::InitialStateOutsideTube,
                "initial state violates the first tube set",
            ),
            diagnostics: ledger.into_events(),
        });
    }

    let concat = concatenate(system, tube.horizon())?;
    let bound = inverse_cdf_bound(&options.pwl)?;
    let mut assembled = build_open_loop(system, tube, &concat, &bound, InitialPoint::Fixed(x0))?;
    assembled.program.minimize(assembled.total_risk());
    ledger.record(
        ReachEvent::progress(Component::ChanceOpen, 0)
            .with_metric("risk_rows", assembled.risk_len as f64)
            .with_metric("segments", bound.len() as f64)
            .with_metric("constraints", assembled.program.num_rows() as f64),
    );

    let solution = solver.solve(&assembled.program)?;
    let outcome = match solution.status {
        SolveStatus::Solved | SolveStatus::SolvedInaccurate => {
            if solution.status == SolveStatus::SolvedInaccurate {
                ledger.record(ReachEvent::warning(
                    Component::ChanceOpen,
                    0,
                    "solver converged with reduced accuracy",
                ));
            }
            let risk: Vec<f64> = solution
                .values(assembled.risks, assembled.risk_len)
                .to_vec();
            let total: f64 = risk.iter().sum();
            let probability = (1.0 - total).clamp(0.0, 1.0);
            ledger.record(
                ReachEvent::new(Component::ChanceOpen, 0, EventKind::Converged)
                    .with_metric("probability", probability)
                    .with_metric("total_risk", total)
                    .with_metric("solver_iterations", f64::from(solution.iterations)),
            );
            PointOutcome::Certified(PointCertificate {
                probability,
                controller: Controller::OpenLoop {
                    inputs: DVector::from_column_slice(
                        solution.values(assembled.inputs, assembled.input_len),
                    ),
                },
                risk: RiskAllocation {
                    state: risk,
                    input: Vec::new(),
                },
            })
        }
        SolveStatus::Infeasible => {
            ledger.record(
                ReachEvent::new(Component::ChanceOpen, 0, EventKind::Terminated)
                    .with_message("chance-constrained program infeasible"),
            );
            PointOutcome::none(
                NoCertificateReason::SolverInfeasible,
                "no open-loop input meets the chance constraints",
            )
        }
        status => {
            ledger.record(ReachEvent::warning(
                Component::ChanceOpen,
                0,
                format!("solver ended with status {status:?}"),
            ));
            PointOutcome::none(
                NoCertificateReason::SolverFailed,
                format!("solver ended with status {status:?}"),
            )
        }
    };

    Ok(PointResult {
        outcome,
        diagnostics: ledger.into_events(),
    })
}
