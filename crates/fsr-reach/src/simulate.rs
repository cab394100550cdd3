//! Seeded Monte Carlo check of a certified controller.

use fsr_linalg::{psd_factor, validate_finite_vector};
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::DVector;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::concat::concatenate;
use crate::error::{ReachResult, invalid};
use crate::outcome::Controller;
use crate::system::LinearSystem;
use crate::tube::SafetyTube;
use crate::validation::validate_tube;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    pub samples: usize,
    pub seed: u64,
    /// Membership slack applied to every simulated state.
    pub tolerance: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            samples: 10_000,
            seed: 0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Fraction of simulated trajectories with `x_k ∈ S_k` for every `k`.
    pub probability: f64,
    /// Binomial standard error of `probability`.
    pub standard_error: f64,
    pub samples: usize,
    pub diagnostics: Vec<ReachEvent>,
}

/// Simulate `x_0 → x_N` under `controller` with i.i.d. Gaussian noise and
/// count the trajectories that stay in the tube.
pub fn monte_carlo_validation(
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    controller: &Controller,
    options: &SimulationOptions,
) -> ReachResult<ValidationReport> {
    validate_tube(system, tube)?;
    validate_finite_vector(x0, options.mode, options.check_finite)?;
    if x0.len() != system.state_dim() {
        return Err(invalid(format!(
            "initial state has length {}, expected {}",
            x0.len(),
            system.state_dim()
        )));
    }
    if options.samples == 0 {
        return Err(invalid("simulation needs at least one sample"));
    }
    let horizon = tube.horizon();
    let concat = concatenate(system, horizon)?;
    if controller.input_len() != concat.input_dim * horizon {
        return Err(invalid(format!(
            "controller produces {} inputs, expected {}",
            controller.input_len(),
            concat.input_dim * horizon
        )));
    }
    let (mean, covariance) = system.stacked_disturbance(horizon)?;
    let factor = psd_factor(&covariance)?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut ledger = DiagnosticLedger::default();

    let mut hits = 0usize;
    for _ in 0..options.samples {
        let z = DVector::<f64>::from_fn(mean.len(), |_, _| StandardNormal.sample(&mut rng));
        let w = &mean + &factor * z;
        let inputs = controller.inputs(&w)?;
        let stacked = concat.trajectory(x0, &inputs, &w);
        let states: Vec<DVector<f64>> = (0..=horizon)
            .map(|k| concat.state_at(&stacked, x0, k))
            .collect();
        if tube.contains_trajectory(&states, options.tolerance) {
            hits += 1;
        }
    }

    let n = options.samples as f64;
    let probability = hits as f64 / n;
    let standard_error = (probability * (1.0 - probability) / n).sqrt();
    ledger.record(
        ReachEvent::new(Component::Simulation, 0, EventKind::Converged)
            .with_metric("probability", probability)
            .with_metric("standard_error", standard_error)
            .with_metric("samples", n),
    );
    Ok(ValidationReport {
        probability,
        standard_error,
        samples: options.samples,
        diagnostics: ledger.into_events(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fixtures;
    use fsr_geometry::Polytope;
    use nalgebra::DMatrix;

    fn tube() -> SafetyTube {
        SafetyTube::constant(
            Polytope::from_box(&[-20.0, -10.0], &[20.0, 10.0]).expect("box"),
            5,
        )
        .expect("tube")
    }

    #[test]
    fn zero_input_from_center_mostly_stays() {
        let controller = Controller::OpenLoop {
            inputs: DVector::zeros(5),
        };
        let report = monte_carlo_validation(
            &fixtures::double_integrator(),
            &tube(),
            &DVector::zeros(2),
            &controller,
            &SimulationOptions {
                samples: 2_000,
                ..SimulationOptions::default()
            },
        )
        .expect("simulation must work");
        assert!(report.probability > 0.8, "probability {}", report.probability);
        assert!(report.standard_error < 0.02);
        assert_eq!(report.samples, 2_000);
    }

    #[test]
    fn start_outside_tube_never_stays() {
        let controller = Controller::OpenLoop {
            inputs: DVector::zeros(5),
        };
        let report = monte_carlo_validation(
            &fixtures::double_integrator(),
            &tube(),
            &DVector::from_vec(vec![30.0, 0.0]),
            &controller,
            &SimulationOptions {
                samples: 200,
                ..SimulationOptions::default()
            },
        )
        .expect("simulation must work");
        assert_eq!(report.probability, 0.0);
        assert_eq!(report.standard_error, 0.0);
    }

    #[test]
    fn same_seed_same_estimate() {
        let controller = Controller::AffineFeedback {
            gain: DMatrix::zeros(5, 10),
            offset: DVector::zeros(5),
        };
        let options = SimulationOptions {
            samples: 300,
            seed: 9,
            ..SimulationOptions::default()
        };
        let system = fixtures::double_integrator();
        let first = monte_carlo_validation(&system, &tube(), &DVector::zeros(2), &controller, &options)
            .expect("simulation must work");
        let second =
            monte_carlo_validation(&system, &tube(), &DVector::zeros(2), &controller, &options)
                .expect("simulation must work");
        assert_eq!(first.probability, second.probability);
    }

    #[test]
    fn rejects_wrong_controller_length() {
        let controller = Controller::OpenLoop {
            inputs: DVector::zeros(3),
        };
        assert!(
            monte_carlo_validation(
                &fixtures::double_integrator(),
                &tube(),
                &DVector::zeros(2),
                &controller,
                &SimulationOptions::default(),
            )
            .is_err()
        );
    }
}
