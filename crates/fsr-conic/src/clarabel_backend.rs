//! Clarabel (pure-Rust interior point) backend for [`ConicProgram`].

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{self, ExponentialConeT, NonnegativeConeT, SecondOrderConeT, ZeroConeT},
};
use fsr_runtime::RuntimeMode;
use serde::{Deserialize, Serialize};

use crate::program::{ConeKind, ConicProgram, Sense};
use crate::{ConicError, ConicSolution, ConicSolver, SolveStatus};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClarabelSettings {
    pub mode: RuntimeMode,
    pub max_iter: u32,
    pub tol_gap_abs: f64,
    pub tol_gap_rel: f64,
    pub tol_feas: f64,
}

impl Default for ClarabelSettings {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            max_iter: 200,
            tol_gap_abs: 1e-8,
            tol_gap_rel: 1e-8,
            tol_feas: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClarabelSolver {
    settings: ClarabelSettings,
}

impl ClarabelSolver {
    #[must_use]
    pub const fn new(settings: ClarabelSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub const fn settings(&self) -> &ClarabelSettings {
        &self.settings
    }
}

/// Assembled Clarabel data: `A x + s = b`, `s ∈ K`.
struct Assembled {
    q: Vec<f64>,
    a: CscMatrix<f64>,
    b: Vec<f64>,
    cones: Vec<SupportedConeT<f64>>,
}

fn assemble(program: &ConicProgram) -> Assembled {
    let n = program.num_vars();
    let sign = match program.sense() {
        Sense::Minimize => 1.0,
        Sense::Maximize => -1.0,
    };
    let mut q = vec![0.0; n];
    for (idx, coef) in &program.objective().terms {
        q[*idx] += sign * coef;
    }

    // Row expression e(x) = aᵀx + c must equal the slack s = b - A x,
    // so the A row is -a and b is c.
    let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
    let mut b = Vec::with_capacity(program.num_rows());
    let mut cones = Vec::with_capacity(program.blocks().len());
    let mut row = 0;
    for block in program.blocks() {
        for expr in &block.rows {
            for (col, coef) in &expr.terms {
                triplets.push((row, *col, -coef));
            }
            b.push(expr.constant);
            row += 1;
        }
        let dim = block.rows.len();
        cones.push(match block.kind {
            ConeKind::Zero => ZeroConeT(dim),
            ConeKind::Nonnegative => NonnegativeConeT(dim),
            ConeKind::SecondOrder => SecondOrderConeT(dim),
            ConeKind::Exponential => ExponentialConeT(),
        });
    }
    Assembled {
        q,
        a: triplets_to_csc(row, n, triplets),
        b,
        cones,
    }
}

/// Column-compressed matrix from (row, col, value) triplets; duplicates are summed.
fn triplets_to_csc(
    nrows: usize,
    ncols: usize,
    mut triplets: Vec<(usize, usize, f64)>,
) -> CscMatrix<f64> {
    triplets.sort_by(|x, y| (x.1, x.0).cmp(&(y.1, y.0)));
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval: Vec<usize> = Vec::with_capacity(triplets.len());
    let mut nzval: Vec<f64> = Vec::with_capacity(triplets.len());
    let mut last: Option<(usize, usize)> = None;
    for (r, c, v) in triplets {
        if last == Some((r, c)) {
            if let Some(tail) = nzval.last_mut() {
                *tail += v;
            }
            continue;
        }
        rowval.push(r);
        nzval.push(v);
        colptr[c + 1] += 1;
        last = Some((r, c));
    }
    for j in 0..ncols {
        colptr[j + 1] += colptr[j];
    }
    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

fn map_status(status: SolverStatus) -> SolveStatus {
    match status {
        SolverStatus::Solved => SolveStatus::Solved,
        SolverStatus::AlmostSolved => SolveStatus::SolvedInaccurate,
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            SolveStatus::Infeasible
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => SolveStatus::Unbounded,
        _ => SolveStatus::Failed,
    }
}

impl ConicSolver for ClarabelSolver {
    fn solve(&self, program: &ConicProgram) -> Result<ConicSolution, ConicError> {
        program.validate()?;
        let n = program.num_vars();
        if n == 0 {
            return Ok(ConicSolution {
                status: SolveStatus::Solved,
                x: Vec::new(),
                z: vec![0.0; program.num_rows()],
                objective: program.objective().constant,
                iterations: 0,
            });
        }

        let assembled = assemble(program);
        let p = CscMatrix::new(n, n, vec![0; n + 1], Vec::new(), Vec::new());
        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.settings.max_iter)
            .verbose(false)
            .tol_gap_abs(self.settings.tol_gap_abs)
            .tol_gap_rel(self.settings.tol_gap_rel)
            .tol_feas(self.settings.tol_feas)
            .build()
            .map_err(|err| ConicError::SolverSetup {
                message: format!("{err:?}"),
            })?;

        let mut solver = DefaultSolver::new(
            &p,
            &assembled.q,
            &assembled.a,
            &assembled.b,
            &assembled.cones,
            settings,
        )
        .map_err(|err| ConicError::SolverSetup {
            message: format!("{err:?}"),
        })?;
        solver.solve();
        let raw = &solver.solution;

        let mut status = map_status(raw.status);
        let x = raw.x.clone();
        let z = raw.z.clone();
        let finite = x.iter().chain(z.iter()).all(|v| v.is_finite());
        if !finite && status.is_usable() && matches!(self.settings.mode, RuntimeMode::Hardened) {
            status = SolveStatus::Failed;
        }
        let objective = program.objective().evaluate(&x);

        tracing::trace!(
            status = ?status,
            iterations = raw.iterations,
            vars = n,
            rows = program.num_rows(),
            objective,
            "clarabel solve finished"
        );

        Ok(ConicSolution {
            status,
            x,
            z,
            objective,
            iterations: raw.iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinExpr;
    use fsr_runtime::assert_close;

    #[test]
    fn triplets_sum_duplicates() {
        let csc = triplets_to_csc(2, 2, vec![(1, 1, 2.0), (0, 0, 1.0), (1, 1, 3.0)]);
        assert_eq!(csc.colptr, vec![0, 1, 2]);
        assert_eq!(csc.rowval, vec![0, 1]);
        assert_eq!(csc.nzval, vec![1.0, 5.0]);
    }

    #[test]
    fn solves_box_lp() {
        // max x + y s.t. x <= 1, y <= 2, x + y <= 2.5
        let mut program = ConicProgram::new();
        let v = program.add_variables(2);
        program.add_le(LinExpr::var(v), 1.0);
        program.add_le(LinExpr::var(v + 1), 2.0);
        program.add_le(LinExpr::var(v).term(v + 1, 1.0), 2.5);
        program.maximize(LinExpr::var(v).term(v + 1, 1.0));
        let solution = ClarabelSolver::default()
            .solve(&program)
            .expect("solve must work");
        assert_eq!(solution.status, SolveStatus::Solved);
        assert_close(solution.objective, 2.5, 1e-6, 0.0);
    }

    #[test]
    fn reports_duals_of_active_constraint() {
        // max x s.t. x <= 3; dual of the bound is 1
        let mut program = ConicProgram::new();
        let v = program.add_variable();
        let row = program.add_le(LinExpr::var(v), 3.0);
        program.maximize(LinExpr::var(v));
        let solution = ClarabelSolver::default()
            .solve(&program)
            .expect("solve must work");
        assert_close(solution.value(v), 3.0, 1e-6, 0.0);
        assert_close(solution.dual(row)[0], 1.0, 1e-6, 0.0);
    }

    #[test]
    fn solves_second_order_cone() {
        // min t s.t. ‖(x - 3, y + 4)‖ <= t
        let mut program = ConicProgram::new();
        let v = program.add_variables(3);
        program.add_eq(LinExpr::var(v + 1), 0.0);
        program.add_eq(LinExpr::var(v + 2), 0.0);
        program.add_soc(
            LinExpr::var(v),
            vec![
                LinExpr::var(v + 1).plus_constant(-3.0),
                LinExpr::var(v + 2).plus_constant(4.0),
            ],
        );
        program.minimize(LinExpr::var(v));
        let solution = ClarabelSolver::default()
            .solve(&program)
            .expect("solve must work");
        assert!(solution.status.is_usable());
        assert_close(solution.objective, 5.0, 1e-6, 0.0);
    }

    #[test]
    fn solves_exponential_cone() {
        // max t s.t. (t, 1, 2) ∈ K_exp  <=>  t <= ln 2
        let mut program = ConicProgram::new();
        let t = program.add_variable();
        program.add_exp(
            LinExpr::var(t),
            LinExpr::constant(1.0),
            LinExpr::constant(2.0),
        );
        program.maximize(LinExpr::var(t));
        let solution = ClarabelSolver::default()
            .solve(&program)
            .expect("solve must work");
        assert!(solution.status.is_usable());
        assert_close(solution.objective, 2.0_f64.ln(), 1e-5, 0.0);
    }

    #[test]
    fn detects_infeasibility() {
        let mut program = ConicProgram::new();
        let v = program.add_variable();
        program.add_le(LinExpr::var(v), -1.0);
        program.add_ge(LinExpr::var(v), 1.0);
        program.minimize(LinExpr::var(v));
        let solution = ClarabelSolver::default()
            .solve(&program)
            .expect("solve must work");
        assert_eq!(solution.status, SolveStatus::Infeasible);
    }

    #[test]
    fn empty_program_is_trivially_solved() {
        let program = ConicProgram::new();
        let solution = ClarabelSolver::default()
            .solve(&program)
            .expect("solve must work");
        assert_eq!(solution.status, SolveStatus::Solved);
        assert!(solution.x.is_empty());
    }
}
