//! Concatenated dynamics over a finite horizon.
//!
//! The stacked trajectory `X = [x_1; ..; x_N]` satisfies
//! `X = Z x_0 + H U + G W` with `U = [u_0; ..; u_{N-1}]` and
//! `W = [w_0; ..; w_{N-1}]`. `H` and `G` are block lower triangular.

use fsr_linalg::reciprocal_condition;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReachError, ReachResult, invalid};
use crate::system::LinearSystem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatenatedDynamics {
    pub horizon: usize,
    pub state_dim: usize,
    pub input_dim: usize,
    pub disturbance_dim: usize,
    /// `nN × n`.
    pub z: DMatrix<f64>,
    /// `nN × mN`.
    pub h: DMatrix<f64>,
    /// `nN × pN`.
    pub g: DMatrix<f64>,
}

/// Build `(Z, H, G)` for `horizon` steps.
///
/// Every stage's state matrix must be invertible (the Lagrangian recursion
/// relies on it); a singular stage is reported as `SingularMatrix`.
pub fn concatenate(system: &LinearSystem, horizon: usize) -> ReachResult<ConcatenatedDynamics> {
    if horizon == 0 {
        return Err(ReachError::InvalidHorizon { horizon });
    }
    if let Some(limit) = system.max_horizon()
        && horizon > limit
    {
        return Err(invalid(format!(
            "horizon {horizon} exceeds the {limit} stages of the time-varying dynamics"
        )));
    }

    let n = system.state_dim();
    let m = system.input_dim();
    let p = system.disturbance_dim();
    let mut z = DMatrix::zeros(n * horizon, n);
    let mut h = DMatrix::zeros(n * horizon, m * horizon);
    let mut g = DMatrix::zeros(n * horizon, p * horizon);

    let mut transition = DMatrix::identity(n, n);
    for t in 0..horizon {
        let stage = system.stage(t)?;
        if reciprocal_condition(&stage.a)? < f64::EPSILON {
            return Err(ReachError::SingularMatrix { stage: t });
        }
        transition = &stage.a * &transition;
        z.view_mut((t * n, 0), (n, n)).copy_from(&transition);

        // Row block t holds x_{t+1}; earlier columns propagate through A_t.
        if t > 0 {
            let prev_h = h.view(((t - 1) * n, 0), (n, m * t)).into_owned();
            let prev_g = g.view(((t - 1) * n, 0), (n, p * t)).into_owned();
            h.view_mut((t * n, 0), (n, m * t))
                .copy_from(&(&stage.a * prev_h));
            g.view_mut((t * n, 0), (n, p * t))
                .copy_from(&(&stage.a * prev_g));
        }
        h.view_mut((t * n, t * m), (n, m)).copy_from(&stage.b);
        g.view_mut((t * n, t * p), (n, p)).copy_from(&stage.f);
    }

    debug!(horizon, state_dim = n, input_dim = m, "concatenated dynamics");
    Ok(ConcatenatedDynamics {
        horizon,
        state_dim: n,
        input_dim: m,
        disturbance_dim: p,
        z,
        h,
        g,
    })
}

impl ConcatenatedDynamics {
    /// Row range of `x_k` (`1 <= k <= N`) in the stacked trajectory.
    #[must_use]
    pub const fn state_offset(&self, k: usize) -> usize {
        (k - 1) * self.state_dim
    }

    /// `Z x_0 + H U + G W`.
    #[must_use]
    pub fn trajectory(
        &self,
        x0: &DVector<f64>,
        inputs: &DVector<f64>,
        disturbances: &DVector<f64>,
    ) -> DVector<f64> {
        &self.z * x0 + &self.h * inputs + &self.g * disturbances
    }

    /// `x_k` extracted from a stacked trajectory (`x_0` for `k == 0`).
    #[must_use]
    pub fn state_at(&self, stacked: &DVector<f64>, x0: &DVector<f64>, k: usize) -> DVector<f64> {
        if k == 0 {
            return x0.clone();
        }
        stacked.rows(self.state_offset(k), self.state_dim).into_owned()
    }

    /// `h_fullᵀ` for a row acting on `x_k` only.
    #[must_use]
    pub fn lift_row(&self, k: usize, normal: &DVector<f64>) -> DVector<f64> {
        let mut full = DVector::zeros(self.state_dim * self.horizon);
        full.rows_mut(self.state_offset(k), self.state_dim)
            .copy_from(normal);
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{Disturbance, LinearSystem, StageMatrices, fixtures};
    use fsr_geometry::Polytope;
    use fsr_runtime::assert_close_slice;

    fn simulate(
        system: &LinearSystem,
        x0: &DVector<f64>,
        inputs: &DVector<f64>,
        disturbances: &DVector<f64>,
        horizon: usize,
    ) -> Vec<DVector<f64>> {
        let (m, p) = (system.input_dim(), system.disturbance_dim());
        let mut x = x0.clone();
        let mut states = Vec::new();
        for t in 0..horizon {
            let stage = system.stage(t).expect("stage");
            x = stage.step(
                &x,
                &inputs.rows(t * m, m).into_owned(),
                &disturbances.rows(t * p, p).into_owned(),
            );
            states.push(x.clone());
        }
        states
    }

    #[test]
    fn matches_forward_simulation() {
        let system = fixtures::double_integrator();
        let cd = concatenate(&system, 4).expect("concatenate must work");
        let x0 = DVector::from_vec(vec![1.0, -2.0]);
        let u = DVector::from_vec(vec![0.5, -1.0, 0.25, 1.0]);
        let w = DVector::from_fn(8, |i, _| (i as f64) * 0.1 - 0.3);
        let stacked = cd.trajectory(&x0, &u, &w);
        for (k, state) in simulate(&system, &x0, &u, &w, 4).iter().enumerate() {
            let got = cd.state_at(&stacked, &x0, k + 1);
            assert_close_slice(got.as_slice(), state.as_slice(), 1e-12, 1e-12);
        }
    }

    #[test]
    fn known_blocks_of_double_integrator() {
        let system = fixtures::double_integrator();
        let cd = concatenate(&system, 2).expect("concatenate must work");
        // x_2 = A² x_0 + A B u_0 + B u_1
        assert_eq!(cd.z[(2, 1)], 2.0);
        assert_eq!(cd.h[(2, 0)], 1.5);
        assert_eq!(cd.h[(3, 0)], 1.0);
        assert_eq!(cd.h[(2, 1)], 0.5);
        assert_eq!(cd.h[(0, 1)], 0.0);
    }

    #[test]
    fn zero_horizon_is_rejected() {
        let err = concatenate(&fixtures::double_integrator(), 0).expect_err("N = 0");
        assert_eq!(err, ReachError::InvalidHorizon { horizon: 0 });
    }

    #[test]
    fn singular_stage_is_reported() {
        let stages = vec![
            StageMatrices::new(
                DMatrix::identity(1, 1),
                DMatrix::identity(1, 1),
                DMatrix::identity(1, 1),
            ),
            StageMatrices::new(
                DMatrix::zeros(1, 1),
                DMatrix::identity(1, 1),
                DMatrix::identity(1, 1),
            ),
        ];
        let system = LinearSystem::time_varying(
            stages,
            Polytope::from_box(&[-1.0], &[1.0]).expect("box"),
            Disturbance::Gaussian {
                mean: DVector::zeros(1),
                covariance: DMatrix::identity(1, 1),
            },
        )
        .expect("system");
        let err = concatenate(&system, 2).expect_err("singular A_1");
        assert_eq!(err, ReachError::SingularMatrix { stage: 1 });
        assert!(matches!(
            concatenate(&system, 3),
            Err(ReachError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn time_varying_products_are_ordered() {
        let stages = vec![
            StageMatrices::new(
                DMatrix::from_element(1, 1, 2.0),
                DMatrix::identity(1, 1),
                DMatrix::identity(1, 1),
            ),
            StageMatrices::new(
                DMatrix::from_element(1, 1, 3.0),
                DMatrix::from_element(1, 1, 5.0),
                DMatrix::identity(1, 1),
            ),
        ];
        let system = LinearSystem::time_varying(
            stages,
            Polytope::from_box(&[-1.0], &[1.0]).expect("box"),
            Disturbance::Gaussian {
                mean: DVector::zeros(1),
                covariance: DMatrix::identity(1, 1),
            },
        )
        .expect("system");
        let cd = concatenate(&system, 2).expect("concatenate must work");
        assert_eq!(cd.z[(1, 0)], 6.0);
        assert_eq!(cd.h[(1, 0)], 3.0);
        assert_eq!(cd.h[(1, 1)], 5.0);
    }
}
