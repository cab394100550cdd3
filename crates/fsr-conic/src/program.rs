//! Solver-independent conic program model.
//!
//! A program is a linear objective over `num_vars` scalar variables plus an
//! ordered list of cone blocks. Each block constrains a tuple of affine
//! expressions to lie in one cone:
//!
//! | Cone            | Membership of `(e_1, .., e_k)`            |
//! |-----------------|-------------------------------------------|
//! | `Zero`          | every `e_i = 0`                           |
//! | `Nonnegative`   | every `e_i >= 0`                          |
//! | `SecondOrder`   | `‖(e_2, .., e_k)‖₂ <= e_1`                |
//! | `Exponential`   | `e_2 · exp(e_1 / e_2) <= e_3`, `e_2 > 0`  |

use serde::{Deserialize, Serialize};

use crate::ConicError;

/// Sparse affine expression `Σ coef·x_var + constant`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinExpr {
    pub terms: Vec<(usize, f64)>,
    pub constant: f64,
}

impl LinExpr {
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    #[must_use]
    pub fn var(index: usize) -> Self {
        Self {
            terms: vec![(index, 1.0)],
            constant: 0.0,
        }
    }

    /// `Σ coefs[i] · x_{start+i}`, skipping exact zeros.
    #[must_use]
    pub fn dot(start: usize, coefs: &[f64]) -> Self {
        let terms = coefs
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0.0)
            .map(|(i, c)| (start + i, *c))
            .collect();
        Self {
            terms,
            constant: 0.0,
        }
    }

    #[must_use]
    pub fn term(mut self, index: usize, coef: f64) -> Self {
        if coef != 0.0 {
            self.terms.push((index, coef));
        }
        self
    }

    #[must_use]
    pub fn plus_constant(mut self, value: f64) -> Self {
        self.constant += value;
        self
    }

    #[must_use]
    pub fn plus(mut self, other: &Self) -> Self {
        self.terms.extend_from_slice(&other.terms);
        self.constant += other.constant;
        self
    }

    #[must_use]
    pub fn scaled(mut self, factor: f64) -> Self {
        for (_, coef) in &mut self.terms {
            *coef *= factor;
        }
        self.constant *= factor;
        self
    }

    pub fn push_term(&mut self, index: usize, coef: f64) {
        if coef != 0.0 {
            self.terms.push((index, coef));
        }
    }

    #[must_use]
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        self.terms
            .iter()
            .map(|(idx, coef)| coef * x.get(*idx).copied().unwrap_or(0.0))
            .sum::<f64>()
            + self.constant
    }

    fn max_index(&self) -> Option<usize> {
        self.terms.iter().map(|(idx, _)| *idx).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConeKind {
    Zero,
    Nonnegative,
    SecondOrder,
    Exponential,
}

/// Contiguous block of constraint rows, used to read back dual values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConeBlock {
    pub kind: ConeKind,
    pub rows: Vec<LinExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConicProgram {
    num_vars: usize,
    sense: Sense,
    objective: LinExpr,
    blocks: Vec<ConeBlock>,
    num_rows: usize,
}

impl Default for ConicProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl ConicProgram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_vars: 0,
            sense: Sense::Minimize,
            objective: LinExpr::zero(),
            blocks: Vec::new(),
            num_rows: 0,
        }
    }

    /// Allocate `count` fresh variables, returning the index of the first one.
    pub fn add_variables(&mut self, count: usize) -> usize {
        let start = self.num_vars;
        self.num_vars += count;
        start
    }

    pub fn add_variable(&mut self) -> usize {
        self.add_variables(1)
    }

    #[must_use]
    pub const fn num_vars(&self) -> usize {
        self.num_vars
    }

    #[must_use]
    pub const fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[must_use]
    pub const fn sense(&self) -> Sense {
        self.sense
    }

    #[must_use]
    pub fn objective(&self) -> &LinExpr {
        &self.objective
    }

    #[must_use]
    pub fn blocks(&self) -> &[ConeBlock] {
        &self.blocks
    }

    pub fn minimize(&mut self, objective: LinExpr) {
        self.sense = Sense::Minimize;
        self.objective = objective;
    }

    pub fn maximize(&mut self, objective: LinExpr) {
        self.sense = Sense::Maximize;
        self.objective = objective;
    }

    fn push_block(&mut self, kind: ConeKind, rows: Vec<LinExpr>) -> RowRange {
        let range = RowRange {
            start: self.num_rows,
            len: rows.len(),
        };
        if rows.is_empty() {
            return range;
        }
        self.num_rows += rows.len();
        // merge with a trailing block of the same elementwise kind
        if matches!(kind, ConeKind::Zero | ConeKind::Nonnegative)
            && let Some(last) = self.blocks.last_mut()
            && last.kind == kind
        {
            last.rows.extend(rows);
            return range;
        }
        self.blocks.push(ConeBlock { kind, rows });
        range
    }

    /// `expr = rhs`.
    pub fn add_eq(&mut self, expr: LinExpr, rhs: f64) -> RowRange {
        self.push_block(ConeKind::Zero, vec![expr.plus_constant(-rhs)])
    }

    /// `expr <= rhs`.
    pub fn add_le(&mut self, expr: LinExpr, rhs: f64) -> RowRange {
        self.push_block(
            ConeKind::Nonnegative,
            vec![expr.scaled(-1.0).plus_constant(rhs)],
        )
    }

    /// `expr >= rhs`.
    pub fn add_ge(&mut self, expr: LinExpr, rhs: f64) -> RowRange {
        self.push_block(ConeKind::Nonnegative, vec![expr.plus_constant(-rhs)])
    }

    /// `lower <= x_var <= upper`.
    pub fn add_bounds(&mut self, var: usize, lower: f64, upper: f64) -> RowRange {
        self.push_block(
            ConeKind::Nonnegative,
            vec![
                LinExpr::var(var).plus_constant(-lower),
                LinExpr::var(var).scaled(-1.0).plus_constant(upper),
            ],
        )
    }

    /// `‖rest‖₂ <= head`.
    pub fn add_soc(&mut self, head: LinExpr, rest: Vec<LinExpr>) -> RowRange {
        let mut rows = Vec::with_capacity(rest.len() + 1);
        rows.push(head);
        rows.extend(rest);
        self.push_block(ConeKind::SecondOrder, rows)
    }

    /// `y · exp(x / y) <= z`.
    pub fn add_exp(&mut self, x: LinExpr, y: LinExpr, z: LinExpr) -> RowRange {
        self.push_block(ConeKind::Exponential, vec![x, y, z])
    }

    /// Check that every referenced variable exists and every coefficient is finite.
    pub fn validate(&self) -> Result<(), ConicError> {
        let exprs = self
            .blocks
            .iter()
            .flat_map(|block| block.rows.iter())
            .chain(std::iter::once(&self.objective));
        for expr in exprs {
            if let Some(max) = expr.max_index()
                && max >= self.num_vars
            {
                return Err(ConicError::InvalidProgram {
                    message: format!(
                        "expression references variable {max} but only {} exist",
                        self.num_vars
                    ),
                });
            }
            let finite = expr.constant.is_finite() && expr.terms.iter().all(|(_, c)| c.is_finite());
            if !finite {
                return Err(ConicError::InvalidProgram {
                    message: String::from("non-finite coefficient in program"),
                });
            }
        }
        Ok(())
    }

    /// Largest violation of any cone constraint at `x`, 0 when feasible.
    #[must_use]
    pub fn max_violation(&self, x: &[f64]) -> f64 {
        let mut worst: f64 = 0.0;
        for block in &self.blocks {
            let values: Vec<f64> = block.rows.iter().map(|row| row.evaluate(x)).collect();
            let violation = match block.kind {
                ConeKind::Zero => values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())),
                ConeKind::Nonnegative => values.iter().fold(0.0_f64, |acc, v| acc.max(-v)),
                ConeKind::SecondOrder => {
                    let norm = values[1..].iter().map(|v| v * v).sum::<f64>().sqrt();
                    (norm - values[0]).max(0.0)
                }
                ConeKind::Exponential => {
                    let (a, b, c) = (values[0], values[1], values[2]);
                    if b <= 0.0 {
                        (-b).max(0.0) + (-c).max(0.0)
                    } else {
                        (b * (a / b).exp() - c).max(0.0)
                    }
                }
            };
            worst = worst.max(violation);
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elementwise_blocks_merge() {
        let mut program = ConicProgram::new();
        let x = program.add_variables(2);
        let first = program.add_le(LinExpr::var(x), 1.0);
        let second = program.add_ge(LinExpr::var(x + 1), 0.0);
        assert_eq!(program.blocks().len(), 1);
        assert_eq!(first, RowRange { start: 0, len: 1 });
        assert_eq!(second, RowRange { start: 1, len: 1 });
    }

    #[test]
    fn cone_blocks_stay_separate() {
        let mut program = ConicProgram::new();
        let x = program.add_variables(3);
        program.add_soc(LinExpr::var(x), vec![LinExpr::var(x + 1)]);
        program.add_soc(LinExpr::var(x), vec![LinExpr::var(x + 2)]);
        assert_eq!(program.blocks().len(), 2);
        assert_eq!(program.num_rows(), 4);
    }

    #[test]
    fn validate_rejects_out_of_range_variable() {
        let mut program = ConicProgram::new();
        program.add_variables(1);
        program.add_le(LinExpr::var(3), 1.0);
        assert!(matches!(
            program.validate(),
            Err(ConicError::InvalidProgram { .. })
        ));
    }

    #[test]
    fn max_violation_measures_each_cone() {
        let mut program = ConicProgram::new();
        let x = program.add_variables(2);
        program.add_le(LinExpr::var(x), 1.0);
        program.add_soc(LinExpr::constant(1.0), vec![LinExpr::var(x + 1)]);
        assert_eq!(program.max_violation(&[0.5, 0.5]), 0.0);
        assert!((program.max_violation(&[2.0, 0.5]) - 1.0).abs() < 1e-12);
        assert!((program.max_violation(&[0.0, 3.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn lin_expr_evaluates() {
        let expr = LinExpr::dot(1, &[2.0, 0.0, -1.0]).plus_constant(0.5);
        assert_eq!(expr.terms.len(), 2);
        assert!((expr.evaluate(&[9.0, 1.0, 9.0, 3.0]) - (-0.5)).abs() < 1e-12);
    }
}
