//! Open-loop reach probability by direct Gaussian integration, maximized
//! over the stacked inputs with a derivative-free search.

use fsr_conic::ConicSolver;
use fsr_geometry::Polytope;
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::chance::MEMBERSHIP_TOL;
use crate::concat::{ConcatenatedDynamics, concatenate};
use crate::dfo::{DerivativeFreeOptimizer, DfoResult, PatternSearchOptions};
use crate::error::{ReachError, ReachResult};
use crate::genz::{CertifierOptions, GaussianCdfOracle, membership_probability};
use crate::moments::trajectory_moments;
use crate::outcome::{
    Controller, NoCertificateReason, PointCertificate, PointOutcome, PointResult, RiskAllocation,
};
use crate::system::{InitialState, LinearSystem};
use crate::tube::SafetyTube;
use crate::validation::{validate_certifier_options, validate_point_inputs};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenzOpenOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    pub certifier: CertifierOptions,
    pub pattern: PatternSearchOptions,
    pub chebyshev_radius_cap: f64,
}

impl Default for GenzOpenOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            certifier: CertifierOptions::default(),
            pattern: PatternSearchOptions::default(),
            chebyshev_radius_cap: 1e3,
        }
    }
}

/// `P(x_1 ∈ S_1, .., x_N ∈ S_N)` as a function of `(x_0, U)`.
pub(crate) struct OpenLoopIntegrator<'a> {
    system: &'a LinearSystem,
    tube: &'a SafetyTube,
    concat: ConcatenatedDynamics,
    region: Polytope,
    input_space: Polytope,
    certifier: CertifierOptions,
    oracle: &'a dyn GaussianCdfOracle,
}

impl<'a> OpenLoopIntegrator<'a> {
    pub fn new(
        system: &'a LinearSystem,
        tube: &'a SafetyTube,
        certifier: CertifierOptions,
        oracle: &'a dyn GaussianCdfOracle,
    ) -> ReachResult<Self> {
        let horizon = tube.horizon();
        Ok(Self {
            system,
            tube,
            concat: concatenate(system, horizon)?,
            region: tube.stacked_future()?,
            input_space: system.stacked_input_space(horizon)?,
            certifier,
            oracle,
        })
    }

    pub fn input_space(&self) -> &Polytope {
        &self.input_space
    }

    pub fn input_len(&self) -> usize {
        self.input_space.dim()
    }

    /// Zero outside `S_0`.
    pub fn probability(&self, x0: &DVector<f64>, inputs: &DVector<f64>) -> ReachResult<f64> {
        if !self.tube.stage(0)?.contains(x0, MEMBERSHIP_TOL) {
            return Ok(0.0);
        }
        let moments = trajectory_moments(
            &self.concat,
            self.system,
            &InitialState::Deterministic(x0.clone()),
            inputs,
        )?;
        Ok(membership_probability(&moments, &self.region, &self.certifier, self.oracle)?.probability)
    }

    /// Best open-loop inputs from `x0`, searching from the feasible `start`.
    pub fn best_inputs(
        &self,
        x0: &DVector<f64>,
        start: &DVector<f64>,
        optimizer: &dyn DerivativeFreeOptimizer,
    ) -> ReachResult<DfoResult> {
        let mut objective = |u: &DVector<f64>| self.probability(x0, u);
        optimizer.maximize(&mut objective, &self.input_space, start)
    }
}

/// Open-loop certificate from `x0` using the Gaussian-integration
/// certifier; the search starts at the Chebyshev center of `U^N`.
pub fn genz_open_point(
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    options: &GenzOpenOptions,
    oracle: &dyn GaussianCdfOracle,
    optimizer: &dyn DerivativeFreeOptimizer,
    solver: &dyn ConicSolver,
) -> ReachResult<PointResult> {
    validate_point_inputs(system, tube, x0, options.mode, options.check_finite)?;
    validate_certifier_options(&options.certifier)?;
    let mut ledger = DiagnosticLedger::default();

    let start_set = tube.stage(0)?;
    if !start_set.contains(x0, MEMBERSHIP_TOL) {
        ledger.record(
            ReachEvent::new(Component::Certifier, 0, EventKind::Terminated)
                .with_metric("initial_violation", start_set.max_violation(x0))
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

    let integrator = OpenLoopIntegrator::new(system, tube, options.certifier, oracle)?;
    let Some((start, _)) = integrator
        .input_space()
        .chebyshev_center(solver, options.chebyshev_radius_cap)?
    else {
        return Err(ReachError::NoFeasiblePoint { stage: 0 });
    };
    let best = integrator.best_inputs(x0, &start, optimizer)?;
    ledger.record(
        ReachEvent::progress(Component::PatternSearch, 0)
            .with_metric("evaluations", best.evaluations as f64)
            .with_metric("probability", best.value),
    );
    if !best.converged {
        ledger.record(ReachEvent::warning(
            Component::PatternSearch,
            0,
            "evaluation budget exhausted before the step size converged",
        ));
    }
    ledger.record(
        ReachEvent::new(Component::Certifier, 0, EventKind::Converged)
            .with_metric("probability", best.value),
    );
    Ok(PointResult {
        outcome: PointOutcome::Certified(PointCertificate {
            probability: best.value,
            controller: Controller::OpenLoop { inputs: best.point },
            risk: RiskAllocation::default(),
        }),
        diagnostics: ledger.into_events(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfo::PatternSearch;
    use crate::genz::MonteCarloOracle;
    use crate::system::fixtures;
    use fsr_conic::ClarabelSolver;

    fn options() -> GenzOpenOptions {
        GenzOpenOptions {
            certifier: CertifierOptions {
                desired_accuracy: 0.05,
                ..CertifierOptions::default()
            },
            pattern: PatternSearchOptions {
                initial_step: 0.5,
                min_step: 0.1,
                max_evaluations: 40,
            },
            ..GenzOpenOptions::default()
        }
    }

    fn tube() -> SafetyTube {
        SafetyTube::constant(
            Polytope::from_box(&[-10.0, -5.0], &[10.0, 5.0]).expect("box"),
            2,
        )
        .expect("tube")
    }

    #[test]
    fn center_start_is_likely_safe() {
        let opts = options();
        let result = genz_open_point(
            &fixtures::double_integrator(),
            &tube(),
            &DVector::zeros(2),
            &opts,
            &MonteCarloOracle::new(11),
            &PatternSearch::new(opts.pattern),
            &ClarabelSolver::default(),
        )
        .expect("genz point must work");
        let probability = result.probability().expect("certified");
        assert!(probability > 0.8, "probability {probability}");
        let Some(PointCertificate {
            controller: Controller::OpenLoop { inputs },
            ..
        }) = result.certificate()
        else {
            panic!("open-loop certificate expected");
        };
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn start_outside_tube_has_no_certificate() {
        let opts = options();
        let result = genz_open_point(
            &fixtures::double_integrator(),
            &tube(),
            &DVector::from_vec(vec![30.0, 0.0]),
            &opts,
            &MonteCarloOracle::new(11),
            &PatternSearch::new(opts.pattern),
            &ClarabelSolver::default(),
        )
        .expect("genz point must work");
        assert_eq!(
            result.no_certificate_reason(),
            Some(NoCertificateReason::InitialStateOutsideTube)
        );
    }

    #[test]
    fn integrator_is_zero_outside_first_set() {
        let system = fixtures::double_integrator();
        let tube = tube();
        let oracle = MonteCarloOracle::new(0);
        let integrator =
            OpenLoopIntegrator::new(&system, &tube, options().certifier, &oracle).expect("integrator");
        let p = integrator
            .probability(&DVector::from_vec(vec![11.0, 0.0]), &DVector::zeros(2))
            .expect("probability");
        assert_eq!(p, 0.0);
        assert_eq!(integrator.input_len(), 2);
    }
}
