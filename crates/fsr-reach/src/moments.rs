//! Mean and covariance of the stacked state trajectory under Gaussian
//! disturbance, for open-loop inputs and for causal affine disturbance
//! feedback `U = M W + d`.

use fsr_linalg::{ensure_shape, psd_factor, symmetrize};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::concat::ConcatenatedDynamics;
use crate::error::{ReachResult, invalid};
use crate::system::{InitialState, LinearSystem};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMoments {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl GaussianMoments {
    /// Standard deviation of `ℓᵀ X`.
    #[must_use]
    pub fn std_along(&self, direction: &DVector<f64>) -> f64 {
        direction.dot(&(&self.covariance * direction)).max(0.0).sqrt()
    }

    /// Marginal of the block `[offset, offset + len)`.
    #[must_use]
    pub fn marginal(&self, offset: usize, len: usize) -> Self {
        Self {
            mean: self.mean.rows(offset, len).into_owned(),
            covariance: self
                .covariance
                .view((offset, offset), (len, len))
                .into_owned(),
        }
    }
}

/// Moments of `[x_1; ..; x_N]` under open-loop inputs.
pub fn trajectory_moments(
    concat: &ConcatenatedDynamics,
    system: &LinearSystem,
    initial: &InitialState,
    inputs: &DVector<f64>,
) -> ReachResult<GaussianMoments> {
    check_input_len(concat, inputs)?;
    let (mean_w, cov_w) = system.stacked_disturbance(concat.horizon)?;
    let x0_mean = initial.mean();
    if x0_mean.len() != concat.state_dim {
        return Err(invalid(format!(
            "initial state has length {}, expected {}",
            x0_mean.len(),
            concat.state_dim
        )));
    }

    let mean = &concat.z * x0_mean + &concat.h * inputs + &concat.g * &mean_w;
    let mut covariance = &concat.g * cov_w * concat.g.transpose();
    if let InitialState::Gaussian { covariance: cov0, .. } = initial {
        ensure_shape(cov0, (concat.state_dim, concat.state_dim), "initial covariance")?;
        psd_factor(cov0)?;
        covariance += &concat.z * cov0 * concat.z.transpose();
    }
    Ok(GaussianMoments {
        mean,
        covariance: symmetrize(&covariance),
    })
}

/// Moments of `[x_0; x_1; ..; x_N]`.
pub fn full_trajectory_moments(
    concat: &ConcatenatedDynamics,
    system: &LinearSystem,
    initial: &InitialState,
    inputs: &DVector<f64>,
) -> ReachResult<GaussianMoments> {
    let tail = trajectory_moments(concat, system, initial, inputs)?;
    let n = concat.state_dim;
    let total = n * (concat.horizon + 1);
    let mut mean = DVector::zeros(total);
    mean.rows_mut(0, n).copy_from(initial.mean());
    mean.rows_mut(n, total - n).copy_from(&tail.mean);

    let mut covariance = DMatrix::zeros(total, total);
    covariance
        .view_mut((n, n), (total - n, total - n))
        .copy_from(&tail.covariance);
    if let InitialState::Gaussian { covariance: cov0, .. } = initial {
        let cross = &concat.z * cov0;
        covariance.view_mut((0, 0), (n, n)).copy_from(cov0);
        covariance.view_mut((n, 0), (total - n, n)).copy_from(&cross);
        covariance
            .view_mut((0, n), (n, total - n))
            .copy_from(&cross.transpose());
    }
    Ok(GaussianMoments { mean, covariance })
}

/// Moments of the single state `x_k`, `1 <= k <= N`.
pub fn state_moments(
    concat: &ConcatenatedDynamics,
    system: &LinearSystem,
    initial: &InitialState,
    inputs: &DVector<f64>,
    k: usize,
) -> ReachResult<GaussianMoments> {
    if k == 0 || k > concat.horizon {
        return Err(invalid(format!(
            "stage {k} outside 1..={}",
            concat.horizon
        )));
    }
    let all = trajectory_moments(concat, system, initial, inputs)?;
    Ok(all.marginal(concat.state_offset(k), concat.state_dim))
}

/// Moments of `[x_1; ..; x_N]` under `U = M W + d` with deterministic `x_0`.
///
/// `X = Z x_0 + H d + (H M + G) W`.
pub fn affine_policy_moments(
    concat: &ConcatenatedDynamics,
    system: &LinearSystem,
    x0: &DVector<f64>,
    gain: &DMatrix<f64>,
    offset: &DVector<f64>,
) -> ReachResult<GaussianMoments> {
    let n_u = concat.input_dim * concat.horizon;
    let n_w = concat.disturbance_dim * concat.horizon;
    ensure_shape(gain, (n_u, n_w), "feedback gain")?;
    check_input_len(concat, offset)?;
    let (mean_w, cov_w) = system.stacked_disturbance(concat.horizon)?;
    let closed = &concat.h * gain + &concat.g;
    let mean = &concat.z * x0 + &concat.h * offset + &closed * &mean_w;
    let covariance = symmetrize(&(&closed * cov_w * closed.transpose()));
    Ok(GaussianMoments { mean, covariance })
}

/// Moments of the stacked inputs `U = M W + d`.
pub fn affine_input_moments(
    concat: &ConcatenatedDynamics,
    system: &LinearSystem,
    gain: &DMatrix<f64>,
    offset: &DVector<f64>,
) -> ReachResult<GaussianMoments> {
    let (mean_w, cov_w) = system.stacked_disturbance(concat.horizon)?;
    ensure_shape(
        gain,
        (concat.input_dim * concat.horizon, mean_w.len()),
        "feedback gain",
    )?;
    check_input_len(concat, offset)?;
    Ok(GaussianMoments {
        mean: gain * &mean_w + offset,
        covariance: symmetrize(&(gain * cov_w * gain.transpose())),
    })
}

fn check_input_len(concat: &ConcatenatedDynamics, inputs: &DVector<f64>) -> ReachResult<()> {
    let expected = concat.input_dim * concat.horizon;
    if inputs.len() != expected {
        return Err(invalid(format!(
            "stacked input has length {}, expected {expected}",
            inputs.len()
        )));
    }
    Ok(())
}
