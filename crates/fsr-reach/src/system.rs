//! Linear system model: per-stage matrices, input space and disturbance.

use fsr_geometry::{BoundedSet, Polytope, SupportFunction};
use fsr_linalg::{ensure_square, psd_factor, repeat_block_diag, repeat_vector};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ReachResult, invalid};

/// `x_{t+1} = A x_t + B u_t + F w_t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMatrices {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub f: DMatrix<f64>,
}

impl StageMatrices {
    #[must_use]
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>, f: DMatrix<f64>) -> Self {
        Self { a, b, f }
    }

    /// One step of the dynamics.
    #[must_use]
    pub fn step(&self, x: &DVector<f64>, u: &DVector<f64>, w: &DVector<f64>) -> DVector<f64> {
        &self.a * x + &self.b * u + &self.f * w
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dynamics {
    TimeInvariant(StageMatrices),
    TimeVarying(Vec<StageMatrices>),
}

/// Disturbance model.
///
/// The chance-constrained and Gaussian-integration routes need the
/// `Gaussian` variant (i.i.d. across stages). The Lagrangian routes take a
/// collection of bounded sets; a Gaussian disturbance is converted to a
/// confidence ellipsoid first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Disturbance {
    Gaussian {
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
    },
    Bounded(Vec<BoundedSet>),
}

impl Disturbance {
    #[must_use]
    pub fn dim(&self) -> Option<usize> {
        match self {
            Self::Gaussian { mean, .. } => Some(mean.len()),
            Self::Bounded(sets) => sets.first().map(SupportFunction::dim),
        }
    }
}

/// Initial state: a known vector or a Gaussian random vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitialState {
    Deterministic(DVector<f64>),
    Gaussian {
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
    },
}

impl InitialState {
    #[must_use]
    pub fn mean(&self) -> &DVector<f64> {
        match self {
            Self::Deterministic(x) => x,
            Self::Gaussian { mean, .. } => mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSystem {
    dynamics: Dynamics,
    input_space: Polytope,
    disturbance: Disturbance,
    state_dim: usize,
    input_dim: usize,
    disturbance_dim: usize,
}

impl LinearSystem {
    pub fn time_invariant(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        f: DMatrix<f64>,
        input_space: Polytope,
        disturbance: Disturbance,
    ) -> ReachResult<Self> {
        Self::new(
            Dynamics::TimeInvariant(StageMatrices::new(a, b, f)),
            input_space,
            disturbance,
        )
    }

    pub fn time_varying(
        stages: Vec<StageMatrices>,
        input_space: Polytope,
        disturbance: Disturbance,
    ) -> ReachResult<Self> {
        Self::new(Dynamics::TimeVarying(stages), input_space, disturbance)
    }

    pub fn new(
        dynamics: Dynamics,
        input_space: Polytope,
        disturbance: Disturbance,
    ) -> ReachResult<Self> {
        let first = match &dynamics {
            Dynamics::TimeInvariant(stage) => stage,
            Dynamics::TimeVarying(stages) => stages
                .first()
                .ok_or_else(|| invalid("time-varying dynamics need at least one stage"))?,
        };
        let state_dim = ensure_square(&first.a)?;
        let input_dim = first.b.ncols();
        let disturbance_dim = first.f.ncols();

        let stages: &[StageMatrices] = match &dynamics {
            Dynamics::TimeInvariant(stage) => std::slice::from_ref(stage),
            Dynamics::TimeVarying(stages) => stages,
        };
        for (t, stage) in stages.iter().enumerate() {
            let shapes_ok = stage.a.shape() == (state_dim, state_dim)
                && stage.b.shape() == (state_dim, input_dim)
                && stage.f.shape() == (state_dim, disturbance_dim);
            if !shapes_ok {
                return Err(invalid(format!(
                    "stage {t} matrices have shapes A{:?} B{:?} F{:?}, expected A({state_dim}, {state_dim}) B({state_dim}, {input_dim}) F({state_dim}, {disturbance_dim})",
                    stage.a.shape(),
                    stage.b.shape(),
                    stage.f.shape()
                )));
            }
        }

        if input_space.dim() != input_dim {
            return Err(invalid(format!(
                "input space has dimension {}, expected {input_dim}",
                input_space.dim()
            )));
        }

        match &disturbance {
            Disturbance::Gaussian { mean, covariance } => {
                if mean.len() != disturbance_dim
                    || covariance.shape() != (disturbance_dim, disturbance_dim)
                {
                    return Err(invalid(format!(
                        "Gaussian disturbance must have mean of length {disturbance_dim} and a square covariance of the same size"
                    )));
                }
                psd_factor(covariance)?;
            }
            Disturbance::Bounded(sets) => {
                if sets.is_empty() {
                    return Err(invalid("bounded disturbance needs at least one set"));
                }
                if let Some(bad) = sets.iter().find(|s| s.dim() != disturbance_dim) {
                    return Err(invalid(format!(
                        "disturbance set has dimension {}, expected {disturbance_dim}",
                        bad.dim()
                    )));
                }
            }
        }

        Ok(Self {
            dynamics,
            input_space,
            disturbance,
            state_dim,
            input_dim,
            disturbance_dim,
        })
    }

    #[must_use]
    pub const fn state_dim(&self) -> usize {
        self.state_dim
    }

    #[must_use]
    pub const fn input_dim(&self) -> usize {
        self.input_dim
    }

    #[must_use]
    pub const fn disturbance_dim(&self) -> usize {
        self.disturbance_dim
    }

    #[must_use]
    pub fn dynamics(&self) -> &Dynamics {
        &self.dynamics
    }

    #[must_use]
    pub fn input_space(&self) -> &Polytope {
        &self.input_space
    }

    #[must_use]
    pub fn disturbance(&self) -> &Disturbance {
        &self.disturbance
    }

    #[must_use]
    pub fn is_time_varying(&self) -> bool {
        matches!(self.dynamics, Dynamics::TimeVarying(_))
    }

    /// Longest horizon the stored dynamics cover; `None` when time invariant.
    #[must_use]
    pub fn max_horizon(&self) -> Option<usize> {
        match &self.dynamics {
            Dynamics::TimeInvariant(_) => None,
            Dynamics::TimeVarying(stages) => Some(stages.len()),
        }
    }

    /// Matrices at stage `t`.
    pub fn stage(&self, t: usize) -> ReachResult<&StageMatrices> {
        match &self.dynamics {
            Dynamics::TimeInvariant(stage) => Ok(stage),
            Dynamics::TimeVarying(stages) => stages.get(t).ok_or_else(|| {
                invalid(format!(
                    "stage {t} requested but time-varying dynamics only cover {} stages",
                    stages.len()
                ))
            }),
        }
    }

    /// Gaussian disturbance parameters; errors for bounded disturbances.
    pub fn gaussian(&self) -> ReachResult<(&DVector<f64>, &DMatrix<f64>)> {
        match &self.disturbance {
            Disturbance::Gaussian { mean, covariance } => Ok((mean, covariance)),
            Disturbance::Bounded(_) => Err(invalid(
                "this computation needs a Gaussian disturbance, got bounded sets",
            )),
        }
    }

    /// Mean and block-diagonal covariance of the stacked i.i.d. disturbance
    /// `W = [w_0; ..; w_{N-1}]`.
    pub fn stacked_disturbance(
        &self,
        horizon: usize,
    ) -> ReachResult<(DVector<f64>, DMatrix<f64>)> {
        let (mean, covariance) = self.gaussian()?;
        Ok((
            repeat_vector(mean, horizon),
            repeat_block_diag(covariance, horizon),
        ))
    }

    /// Input space repeated over `horizon` stages, as a polytope in `R^{mN}`.
    pub fn stacked_input_space(&self, horizon: usize) -> ReachResult<Polytope> {
        Ok(Polytope::new(
            repeat_block_diag(self.input_space.a(), horizon),
            repeat_vector(self.input_space.b(), horizon),
            repeat_block_diag(self.input_space.ae(), horizon),
            repeat_vector(self.input_space.be(), horizon),
        )?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_input_space() {
        let err = LinearSystem::time_invariant(
            DMatrix::identity(2, 2),
            DMatrix::zeros(2, 1),
            DMatrix::identity(2, 2),
            Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box"),
            Disturbance::Gaussian {
                mean: DVector::zeros(2),
                covariance: DMatrix::identity(2, 2),
            },
        )
        .expect_err("input space must be 1-D");
        assert!(matches!(err, crate::ReachError::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_indefinite_covariance() {
        let err = LinearSystem::time_invariant(
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
            Polytope::from_box(&[-1.0], &[1.0]).expect("box"),
            Disturbance::Gaussian {
                mean: DVector::zeros(1),
                covariance: DMatrix::from_element(1, 1, -1.0),
            },
        )
        .expect_err("covariance must be PSD");
        assert!(matches!(err, crate::ReachError::Linalg(_)));
    }

    #[test]
    fn time_varying_stage_lookup() {
        let stage = StageMatrices::new(
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
            DMatrix::identity(1, 1),
        );
        let system = LinearSystem::time_varying(
            vec![stage.clone(), stage],
            Polytope::from_box(&[-1.0], &[1.0]).expect("box"),
            Disturbance::Gaussian {
                mean: DVector::zeros(1),
                covariance: DMatrix::identity(1, 1),
            },
        )
        .expect("valid system");
        assert_eq!(system.max_horizon(), Some(2));
        assert!(system.stage(1).is_ok());
        assert!(system.stage(2).is_err());
    }

    #[test]
    fn stacked_disturbance_is_block_diagonal() {
        let system = fixtures::double_integrator();
        let (mean, cov) = system.stacked_disturbance(3).expect("gaussian");
        assert_eq!(mean.len(), 6);
        assert_eq!(cov.shape(), (6, 6));
        assert_eq!(cov[(2, 2)], 1.0);
        assert_eq!(cov[(0, 2)], 0.0);
    }

    #[test]
    fn bounded_system_has_no_gaussian() {
        let system = fixtures::bounded_double_integrator();
        assert!(system.gaussian().is_err());
        assert_eq!(system.disturbance().dim(), Some(2));
    }
}
