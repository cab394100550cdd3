//! Affine disturbance-feedback chance constraints by difference-of-convex
//! iteration.
//!
//! With `U = M W + d` the row `hᵀ x_k <= g` needs
//! `hᵀ E[x_k] + s λ <= g` where `s >= ‖Lᵀ (H M + G)ᵀ h‖` and
//! `λ >= Φ⁻¹(1 − δ)`. The product is split as
//! `s λ = (s + λ)² / 2 − (s² + λ²) / 2`; the concave part is replaced by
//! its tangent at the previous iterate `(s̄, λ̄)`, which bounds it from
//! above. Each subproblem is a second-order cone program; a penalized
//! slack absorbs the linearization error while the iterates settle.

use fsr_conic::{ConicProgram, ConicSolver, LinExpr, SolveStatus};
use fsr_linalg::psd_factor;
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::chance::MEMBERSHIP_TOL;
use crate::concat::{ConcatenatedDynamics, concatenate};
use crate::error::ReachResult;
use crate::moments::{affine_input_moments, affine_policy_moments};
use crate::outcome::{
    Controller, NoCertificateReason, PointCertificate, PointOutcome, PointResult, RiskAllocation,
};
use crate::pwl::{PiecewiseLinearBound, PwlOptions, RISK_UPPER_BOUND, inverse_cdf_bound, upper_quantile};
use crate::system::LinearSystem;
use crate::tube::SafetyTube;
use crate::validation::{validate_affine_options, validate_point_inputs};

/// State-row risk used to seed the first linearization, spread evenly.
const INITIAL_STATE_RISK: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChanceAffineOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    pub pwl: PwlOptions,
    /// Initial slack penalty.
    pub tau_initial: f64,
    /// Geometric growth of the penalty per iteration.
    pub tau_scaling: f64,
    pub tau_max: f64,
    pub iter_max: usize,
    /// Objective change below which the iteration may stop.
    pub dc_tolerance: f64,
    /// Total slack (state and input separately) below which the iteration may stop.
    pub slack_tolerance: f64,
    /// Hard cap on the total input-row risk.
    pub max_input_violation: f64,
}

impl Default for ChanceAffineOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            pwl: PwlOptions::default(),
            tau_initial: 1.0,
            tau_scaling: 2.0,
            tau_max: 1e5,
            iter_max: 200,
            dc_tolerance: 1e-4,
            slack_tolerance: 1e-6,
            max_input_violation: 0.01,
        }
    }
}

/// One chance-constraint row `aᵀ U + cᵀ W + constant <= rhs`, where `U` is
/// the stacked input and `W` the stacked disturbance. `lifted` is the row
/// over the stacked states (state rows) or stacked inputs (input rows).
#[derive(Debug, Clone)]
struct RowData {
    lifted: DVector<f64>,
    on_inputs: DVector<f64>,
    on_noise: DVector<f64>,
    constant: f64,
    rhs: f64,
}

/// Linearization point for one row group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linearization {
    pub norms: Vec<f64>,
    pub quantiles: Vec<f64>,
}

/// Record of one DC iteration. Each step produces a fresh record from the
/// previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcIterate {
    pub iteration: usize,
    pub gain: DMatrix<f64>,
    pub offset: DVector<f64>,
    pub state: Linearization,
    pub input: Linearization,
    pub state_risk: Vec<f64>,
    pub input_risk: Vec<f64>,
    pub objective: f64,
    pub state_slack: f64,
    pub input_slack: f64,
    pub tau: f64,
}

enum StepOutcome {
    Next(DcIterate, SolveStatus),
    Stopped(SolveStatus),
}

/// Variable offsets of one row group in the subproblem.
struct GroupVars {
    risk: usize,
    quantile: usize,
    norm: usize,
    slack: usize,
    len: usize,
}

struct AffineProblem {
    input_len: usize,
    noise_mean: DVector<f64>,
    noise_factor: DMatrix<f64>,
    /// Causal `(row, col)` entries of the gain, in variable order.
    gain_entries: Vec<(usize, usize)>,
    state_rows: Vec<RowData>,
    input_rows: Vec<RowData>,
    bound: PiecewiseLinearBound,
    max_input_violation: f64,
}

impl AffineProblem {
    fn new(
        system: &LinearSystem,
        tube: &SafetyTube,
        concat: &ConcatenatedDynamics,
        x0: &DVector<f64>,
        bound: PiecewiseLinearBound,
        max_input_violation: f64,
    ) -> ReachResult<Self> {
        let (m, p, horizon) = (concat.input_dim, concat.disturbance_dim, concat.horizon);
        let input_len = m * horizon;
        let (noise_mean, noise_cov) = system.stacked_disturbance(horizon)?;
        let noise_factor = psd_factor(&noise_cov)?;

        let mut gain_entries = Vec::new();
        for r in 0..input_len {
            for c in 0..p * horizon {
                if c / p < r / m {
                    gain_entries.push((r, c));
                }
            }
        }

        let free_state = &concat.z * x0;
        let state_rows = tube
            .future_rows()?
            .into_iter()
            .map(|row| {
                let lifted = concat.lift_row(row.stage, &row.normal);
                RowData {
                    on_inputs: concat.h.transpose() * &lifted,
                    on_noise: concat.g.transpose() * &lifted,
                    constant: lifted.dot(&free_state),
                    rhs: row.rhs,
                    lifted,
                }
            })
            .collect();

        let input_space = system.input_space();
        let mut input_rows = Vec::new();
        for t in 0..horizon {
            let mut push = |normal: DVector<f64>, rhs: f64| {
                let mut on_inputs = DVector::zeros(input_len);
                on_inputs.rows_mut(t * m, m).copy_from(&normal);
                input_rows.push(RowData {
                    lifted: on_inputs.clone(),
                    on_inputs,
                    on_noise: DVector::zeros(p * horizon),
                    constant: 0.0,
                    rhs,
                });
            };
            for i in 0..input_space.num_inequalities() {
                push(input_space.a().row(i).transpose(), input_space.b()[i]);
            }
            for i in 0..input_space.num_equalities() {
                push(input_space.ae().row(i).transpose(), input_space.be()[i]);
                push(-input_space.ae().row(i).transpose(), -input_space.be()[i]);
            }
        }

        Ok(Self {
            input_len,
            noise_mean,
            noise_factor,
            gain_entries,
            state_rows,
            input_rows,
            bound,
            max_input_violation,
        })
    }

    fn noise_len(&self) -> usize {
        self.noise_mean.len()
    }

    /// `E[aᵀ U + cᵀ W] + constant` as an expression in `(M, d)`.
    fn mean_expr(&self, row: &RowData, gain: usize, offset: usize) -> LinExpr {
        let mut expr = LinExpr::dot(offset, row.on_inputs.as_slice())
            .plus_constant(row.constant + row.on_noise.dot(&self.noise_mean));
        for (k, &(r, c)) in self.gain_entries.iter().enumerate() {
            let coef = row.on_inputs[r] * self.noise_mean[c];
            if coef != 0.0 {
                expr.push_term(gain + k, coef);
            }
        }
        expr
    }

    /// Entries of `Lᵀ (Mᵀ a + c)`.
    fn std_exprs(&self, row: &RowData, gain: usize) -> Vec<LinExpr> {
        let base = self.noise_factor.transpose() * &row.on_noise;
        (0..self.noise_len())
            .map(|j| {
                let mut expr = LinExpr::constant(base[j]);
                for (k, &(r, c)) in self.gain_entries.iter().enumerate() {
                    let coef = self.noise_factor[(c, j)] * row.on_inputs[r];
                    if coef != 0.0 {
                        expr.push_term(gain + k, coef);
                    }
                }
                expr
            })
            .collect()
    }

    /// `‖Lᵀ (Mᵀ a + c)‖` for a concrete gain.
    fn row_std(&self, row: &RowData, gain: &DMatrix<f64>) -> f64 {
        (self.noise_factor.transpose() * (gain.transpose() * &row.on_inputs + &row.on_noise))
            .norm()
    }

    fn gain_matrix(&self, values: &[f64]) -> DMatrix<f64> {
        let mut gain = DMatrix::zeros(self.input_len, self.noise_len());
        for (&(r, c), v) in self.gain_entries.iter().zip(values) {
            gain[(r, c)] = *v;
        }
        gain
    }

    /// Linearization at `M = 0` with the given per-row risk.
    fn initial_linearization(&self, rows: &[RowData], risk: f64) -> ReachResult<Linearization> {
        let zero = DMatrix::zeros(self.input_len, self.noise_len());
        let quantile = upper_quantile(risk.clamp(self.bound.lower_bound(), RISK_UPPER_BOUND))?;
        Ok(Linearization {
            norms: rows.iter().map(|row| self.row_std(row, &zero)).collect(),
            quantiles: vec![quantile; rows.len()],
        })
    }

    fn initial_iterate(&self, tau: f64) -> ReachResult<DcIterate> {
        let state_risk = INITIAL_STATE_RISK / self.state_rows.len().max(1) as f64;
        let input_risk = self.max_input_violation / self.input_rows.len().max(1) as f64;
        Ok(DcIterate {
            iteration: 0,
            gain: DMatrix::zeros(self.input_len, self.noise_len()),
            offset: DVector::zeros(self.input_len),
            state: self.initial_linearization(&self.state_rows, state_risk)?,
            input: self.initial_linearization(&self.input_rows, input_risk)?,
            state_risk: vec![state_risk; self.state_rows.len()],
            input_risk: vec![input_risk; self.input_rows.len()],
            objective: f64::INFINITY,
            state_slack: f64::INFINITY,
            input_slack: f64::INFINITY,
            tau,
        })
    }

    /// Rows of one group: risk bounds, chord rows, both cones and the
    /// linearized chance constraint.
    fn add_group(
        &self,
        program: &mut ConicProgram,
        rows: &[RowData],
        lin: &Linearization,
        gain: usize,
        offset: usize,
    ) -> GroupVars {
        let len = rows.len();
        let vars = GroupVars {
            risk: program.add_variables(len),
            quantile: program.add_variables(len),
            norm: program.add_variables(len),
            slack: program.add_variables(len),
            len,
        };
        let square = program.add_variables(len);

        for (i, row) in rows.iter().enumerate() {
            let (delta, lambda, s, q, slack) = (
                vars.risk + i,
                vars.quantile + i,
                vars.norm + i,
                square + i,
                vars.slack + i,
            );
            program.add_bounds(delta, self.bound.lower_bound(), RISK_UPPER_BOUND);
            program.add_ge(LinExpr::var(lambda), 0.0);
            program.add_ge(LinExpr::var(slack), 0.0);
            for segment in self.bound.segments() {
                program.add_le(
                    LinExpr::var(delta)
                        .scaled(segment.slope)
                        .term(lambda, -1.0),
                    -segment.intercept,
                );
            }

            program.add_soc(LinExpr::var(s), self.std_exprs(row, gain));
            // q >= (s + λ)² / 2  <=>  ‖(s + λ, q − ½)‖ <= q + ½
            program.add_soc(
                LinExpr::var(q).plus_constant(0.5),
                vec![
                    LinExpr::var(s).term(lambda, 1.0),
                    LinExpr::var(q).plus_constant(-0.5),
                ],
            );

            let (s_bar, l_bar) = (lin.norms[i], lin.quantiles[i]);
            let expr = self
                .mean_expr(row, gain, offset)
                .term(q, 1.0)
                .term(s, -s_bar)
                .term(lambda, -l_bar)
                .term(slack, -1.0);
            program.add_le(expr, row.rhs - 0.5 * (s_bar * s_bar + l_bar * l_bar));
        }
        vars
    }

    fn step(
        &self,
        previous: &DcIterate,
        tau: f64,
        solver: &dyn ConicSolver,
    ) -> ReachResult<StepOutcome> {
        let mut program = ConicProgram::new();
        let gain = program.add_variables(self.gain_entries.len());
        let offset = program.add_variables(self.input_len);
        let state = self.add_group(&mut program, &self.state_rows, &previous.state, gain, offset);
        let input = self.add_group(&mut program, &self.input_rows, &previous.input, gain, offset);
        program.add_le(
            LinExpr::dot(input.risk, &vec![1.0; input.len]),
            self.max_input_violation,
        );
        if state.len > 0 {
            program.add_le(
                LinExpr::dot(state.risk, &vec![1.0; state.len]),
                1.0 - self.max_input_violation,
            );
        }

        let penalty = LinExpr::dot(state.slack, &vec![tau; state.len])
            .plus(&LinExpr::dot(input.slack, &vec![tau; input.len]));
        program.minimize(LinExpr::dot(state.risk, &vec![1.0; state.len]).plus(&penalty));

        let solution = solver.solve(&program)?;
        if !solution.status.is_usable() {
            return Ok(StepOutcome::Stopped(solution.status));
        }
        let read = |start: usize, len: usize| solution.values(start, len).to_vec();
        let sum = |start: usize, len: usize| solution.values(start, len).iter().sum::<f64>();
        Ok(StepOutcome::Next(
            DcIterate {
                iteration: previous.iteration + 1,
                gain: self.gain_matrix(solution.values(gain, self.gain_entries.len())),
                offset: DVector::from_column_slice(solution.values(offset, self.input_len)),
                state: Linearization {
                    norms: read(state.norm, state.len),
                    quantiles: read(state.quantile, state.len),
                },
                input: Linearization {
                    norms: read(input.norm, input.len),
                    quantiles: read(input.quantile, input.len),
                },
                state_risk: read(state.risk, state.len),
                input_risk: read(input.risk, input.len),
                objective: solution.objective,
                state_slack: sum(state.slack, state.len),
                input_slack: sum(input.slack, input.len),
                tau,
            },
            solution.status,
        ))
    }

    /// Largest violation of the exact (non-linearized) chance constraints at
    /// an iterate, from the closed-loop moments.
    fn exact_violation(
        &self,
        concat: &ConcatenatedDynamics,
        system: &LinearSystem,
        x0: &DVector<f64>,
        iterate: &DcIterate,
    ) -> ReachResult<f64> {
        let states = affine_policy_moments(concat, system, x0, &iterate.gain, &iterate.offset)?;
        let inputs = affine_input_moments(concat, system, &iterate.gain, &iterate.offset)?;
        let mut worst = f64::NEG_INFINITY;
        let groups = [
            (&self.state_rows, &iterate.state_risk, &states),
            (&self.input_rows, &iterate.input_risk, &inputs),
        ];
        for (rows, risks, moments) in groups {
            for (row, risk) in rows.iter().zip(risks) {
                let mean = row.lifted.dot(&moments.mean);
                let std = moments.std_along(&row.lifted);
                let quantile = upper_quantile(risk.max(f64::MIN_POSITIVE))?;
                worst = worst.max(mean + std * quantile - row.rhs);
            }
        }
        Ok(worst)
    }
}

/// Affine disturbance-feedback controller maximizing the certified
/// probability from a fixed `x_0`.
pub fn chance_affine_point(
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    options: &ChanceAffineOptions,
    solver: &dyn ConicSolver,
) -> ReachResult<PointResult> {
    validate_point_inputs(system, tube, x0, options.mode, options.check_finite)?;
    validate_affine_options(options)?;
    let mut ledger = DiagnosticLedger::default();

    let start = tube.stage(0)?;
    if !start.contains(x0, MEMBERSHIP_TOL) {
        ledger.record(
            ReachEvent::new(Component::ChanceAffine, 0, EventKind::Terminated)
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
    let problem = AffineProblem::new(
        system,
        tube,
        &concat,
        x0,
        bound,
        options.max_input_violation,
    )?;
    let (iterates, stop) = run_dc(&problem, options, solver, &mut ledger)?;

    let outcome = match (stop, iterates.last()) {
        (DcStop::Converged, Some(last)) => {
            let violation = problem.exact_violation(&concat, system, x0, last)?;
            let state_total: f64 = last.state_risk.iter().sum();
            let probability =
                (1.0 - state_total / (1.0 - options.max_input_violation)).clamp(0.0, 1.0);
            ledger.record(
                ReachEvent::new(Component::ChanceAffine, last.iteration, EventKind::Converged)
                    .with_metric("probability", probability)
                    .with_metric("objective", last.objective)
                    .with_metric("max_exact_violation", violation),
            );
            PointOutcome::Certified(PointCertificate {
                probability,
                controller: Controller::AffineFeedback {
                    gain: last.gain.clone(),
                    offset: last.offset.clone(),
                },
                risk: RiskAllocation {
                    state: last.state_risk.clone(),
                    input: last.input_risk.clone(),
                },
            })
        }
        (DcStop::Converged, None) | (DcStop::IterationCap, _) => PointOutcome::none(
            NoCertificateReason::IterationCapReached,
            format!("no convergence within {} iterations", options.iter_max),
        ),
        (DcStop::Solver(SolveStatus::Infeasible), _) => PointOutcome::none(
            NoCertificateReason::SolverInfeasible,
            "difference-of-convex subproblem infeasible",
        ),
        (DcStop::Solver(status), _) => PointOutcome::none(
            NoCertificateReason::SolverFailed,
            format!("difference-of-convex subproblem ended with status {status:?}"),
        ),
    };

    Ok(PointResult {
        outcome,
        diagnostics: ledger.into_events(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DcStop {
    Converged,
    IterationCap,
    Solver(SolveStatus),
}

/// Iterate until the objective settles with negligible slack, the cap is
/// hit, or a subproblem fails. Returns every solved iterate.
fn run_dc(
    problem: &AffineProblem,
    options: &ChanceAffineOptions,
    solver: &dyn ConicSolver,
    ledger: &mut DiagnosticLedger,
) -> ReachResult<(Vec<DcIterate>, DcStop)> {
    let mut current = problem.initial_iterate(options.tau_initial)?;
    let mut history = Vec::new();
    let mut tau = options.tau_initial;
    for _ in 0..options.iter_max {
        let next = match problem.step(&current, tau, solver)? {
            StepOutcome::Next(next, status) => {
                if status == SolveStatus::SolvedInaccurate {
                    ledger.record(ReachEvent::warning(
                        Component::ChanceAffine,
                        next.iteration,
                        "subproblem solved with reduced accuracy",
                    ));
                }
                next
            }
            StepOutcome::Stopped(status) => {
                ledger.record(
                    ReachEvent::new(Component::ChanceAffine, current.iteration + 1, EventKind::Terminated)
                        .with_message(format!("subproblem ended with status {status:?}")),
                );
                return Ok((history, DcStop::Solver(status)));
            }
        };
        ledger.record(
            ReachEvent::progress(Component::ChanceAffine, next.iteration)
                .with_metric("objective", next.objective)
                .with_metric("state_risk", next.state_risk.iter().sum())
                .with_metric("state_slack", next.state_slack)
                .with_metric("input_slack", next.input_slack)
                .with_metric("tau", tau),
        );
        let settled = (next.objective - current.objective).abs() < options.dc_tolerance
            && next.state_slack < options.slack_tolerance
            && next.input_slack < options.slack_tolerance;
        history.push(next.clone());
        if settled {
            return Ok((history, DcStop::Converged));
        }
        current = next;
        tau = (tau * options.tau_scaling).min(options.tau_max);
    }
    ledger.record(
        ReachEvent::new(Component::ChanceAffine, current.iteration, EventKind::Terminated)
            .with_metric("iterations", options.iter_max as f64)
            .with_message("iteration cap reached"),
    );
    Ok((history, DcStop::IterationCap))
}
