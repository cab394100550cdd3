//! Certificates, controllers and the "no certificate" outcome shared by
//! every point computation.

use fsr_runtime::ReachEvent;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ReachResult, invalid};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Controller {
    /// Stacked inputs `[u_0; ..; u_{N-1}]`.
    OpenLoop { inputs: DVector<f64> },
    /// `U = M W + d` with block lower triangular (causal) `M`.
    AffineFeedback {
        gain: DMatrix<f64>,
        offset: DVector<f64>,
    },
}

impl Controller {
    /// Stacked inputs for a realised stacked disturbance.
    pub fn inputs(&self, disturbances: &DVector<f64>) -> ReachResult<DVector<f64>> {
        match self {
            Self::OpenLoop { inputs } => Ok(inputs.clone()),
            Self::AffineFeedback { gain, offset } => {
                if gain.ncols() != disturbances.len() {
                    return Err(invalid(format!(
                        "gain expects {} disturbance entries, got {}",
                        gain.ncols(),
                        disturbances.len()
                    )));
                }
                Ok(gain * disturbances + offset)
            }
        }
    }

    #[must_use]
    pub fn input_len(&self) -> usize {
        match self {
            Self::OpenLoop { inputs } => inputs.len(),
            Self::AffineFeedback { offset, .. } => offset.len(),
        }
    }
}

/// Per-halfspace risk, state and input rows tracked separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskAllocation {
    pub state: Vec<f64>,
    pub input: Vec<f64>,
}

impl RiskAllocation {
    #[must_use]
    pub fn state_total(&self) -> f64 {
        self.state.iter().sum()
    }

    #[must_use]
    pub fn input_total(&self) -> f64 {
        self.input.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCertificate {
    /// Lower bound on the probability of staying in the tube.
    pub probability: f64,
    pub controller: Controller,
    pub risk: RiskAllocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoCertificateReason {
    InitialStateOutsideTube,
    SolverInfeasible,
    IterationCapReached,
    BelowThreshold,
    SolverFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointOutcome {
    Certified(PointCertificate),
    NoCertificate {
        reason: NoCertificateReason,
        detail: String,
    },
}

impl PointOutcome {
    pub(crate) fn none(reason: NoCertificateReason, detail: impl Into<String>) -> Self {
        Self::NoCertificate {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResult {
    pub outcome: PointOutcome,
    pub diagnostics: Vec<ReachEvent>,
}

impl PointResult {
    #[must_use]
    pub fn probability(&self) -> Option<f64> {
        match &self.outcome {
            PointOutcome::Certified(cert) => Some(cert.probability),
            PointOutcome::NoCertificate { .. } => None,
        }
    }

    #[must_use]
    pub fn certificate(&self) -> Option<&PointCertificate> {
        match &self.outcome {
            PointOutcome::Certified(cert) => Some(cert),
            PointOutcome::NoCertificate { .. } => None,
        }
    }

    #[must_use]
    pub fn no_certificate_reason(&self) -> Option<NoCertificateReason> {
        match &self.outcome {
            PointOutcome::Certified(_) => None,
            PointOutcome::NoCertificate { reason, .. } => Some(*reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_controller_applies_gain() {
        let controller = Controller::AffineFeedback {
            gain: DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 1.0, 0.0]),
            offset: DVector::from_vec(vec![0.5, -0.5]),
        };
        let u = controller
            .inputs(&DVector::from_vec(vec![2.0, 3.0]))
            .expect("inputs");
        assert_eq!(u.as_slice(), &[0.5, 1.5]);
        assert!(controller.inputs(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn outcome_accessors() {
        let result = PointResult {
            outcome: PointOutcome::none(NoCertificateReason::SolverInfeasible, "infeasible"),
            diagnostics: Vec::new(),
        };
        assert_eq!(result.probability(), None);
        assert_eq!(
            result.no_certificate_reason(),
            Some(NoCertificateReason::SolverInfeasible)
        );
    }

    #[test]
    fn risk_totals() {
        let risk = RiskAllocation {
            state: vec![0.1, 0.2],
            input: vec![0.05],
        };
        assert!((risk.state_total() - 0.3).abs() < 1e-15);
        assert!((risk.input_total() - 0.05).abs() < 1e-15);
    }
}
