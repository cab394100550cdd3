//! Argument checks shared by the public entry points.

use fsr_geometry::{BoundedSet, Polytope, SupportFunction};
use fsr_linalg::{validate_finite_matrix, validate_finite_vector};
use fsr_runtime::RuntimeMode;
use nalgebra::DVector;

use crate::chance_affine::ChanceAffineOptions;
use crate::error::{ReachResult, invalid};
use crate::genz::CertifierOptions;
use crate::lagrangian::{Approximation, LagrangianMethod, LagrangianOptions};
use crate::pwl::{PwlOptions, RISK_UPPER_BOUND};
use crate::set_search::SetSearchOptions;
use crate::system::{Disturbance, LinearSystem};
use crate::tube::SafetyTube;

pub fn validate_pwl_options(options: &PwlOptions) -> ReachResult<()> {
    if !(options.accuracy.is_finite() && options.accuracy > 0.0) {
        return Err(invalid(format!(
            "inverse-CDF accuracy must be positive, got {}",
            options.accuracy
        )));
    }
    if !(options.lower_bound > 0.0 && options.lower_bound < RISK_UPPER_BOUND) {
        return Err(invalid(format!(
            "inverse-CDF lower bound must lie in (0, {RISK_UPPER_BOUND}), got {}",
            options.lower_bound
        )));
    }
    if options.max_segments == 0 {
        return Err(invalid("inverse-CDF bound needs at least one segment"));
    }
    Ok(())
}

pub fn validate_threshold(threshold: f64) -> ReachResult<()> {
    if !(threshold > 0.0 && threshold < 1.0) {
        return Err(invalid(format!(
            "probability threshold must lie in (0, 1), got {threshold}"
        )));
    }
    Ok(())
}

/// Tube and system agree on the state dimension and the tube fits the
/// dynamics' horizon.
pub fn validate_tube(system: &LinearSystem, tube: &SafetyTube) -> ReachResult<()> {
    if tube.dim() != system.state_dim() {
        return Err(invalid(format!(
            "tube has dimension {}, system state has dimension {}",
            tube.dim(),
            system.state_dim()
        )));
    }
    if let Some(max) = system.max_horizon()
        && tube.horizon() > max
    {
        return Err(invalid(format!(
            "tube horizon {} exceeds the {max} stages of the time-varying dynamics",
            tube.horizon()
        )));
    }
    Ok(())
}

fn validate_system_finite(
    system: &LinearSystem,
    mode: RuntimeMode,
    check_finite: bool,
) -> ReachResult<()> {
    for t in 0..system.max_horizon().unwrap_or(1) {
        let stage = system.stage(t)?;
        validate_finite_matrix(&stage.a, mode, check_finite)?;
        validate_finite_matrix(&stage.b, mode, check_finite)?;
        validate_finite_matrix(&stage.f, mode, check_finite)?;
    }
    if let Disturbance::Gaussian { mean, covariance } = system.disturbance() {
        validate_finite_vector(mean, mode, check_finite)?;
        validate_finite_matrix(covariance, mode, check_finite)?;
    }
    Ok(())
}

/// Inputs of the Gaussian point computations.
pub fn validate_point_inputs(
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    mode: RuntimeMode,
    check_finite: bool,
) -> ReachResult<()> {
    validate_tube(system, tube)?;
    if x0.len() != system.state_dim() {
        return Err(invalid(format!(
            "initial state has length {}, expected {}",
            x0.len(),
            system.state_dim()
        )));
    }
    system.gaussian()?;
    validate_finite_vector(x0, mode, check_finite)?;
    validate_system_finite(system, mode, check_finite)
}

pub fn validate_affine_options(options: &ChanceAffineOptions) -> ReachResult<()> {
    if !(options.tau_initial > 0.0 && options.tau_initial <= options.tau_max) {
        return Err(invalid("DC penalty needs 0 < tau_initial <= tau_max"));
    }
    if !(options.tau_scaling >= 1.0) {
        return Err(invalid(format!(
            "DC penalty scaling must be at least 1, got {}",
            options.tau_scaling
        )));
    }
    if options.iter_max == 0 {
        return Err(invalid("DC iteration needs iter_max >= 1"));
    }
    if !(options.dc_tolerance >= 0.0 && options.slack_tolerance >= 0.0) {
        return Err(invalid("DC tolerances must be nonnegative"));
    }
    if !(options.max_input_violation > 0.0 && options.max_input_violation < 1.0) {
        return Err(invalid(format!(
            "input-violation budget must lie in (0, 1), got {}",
            options.max_input_violation
        )));
    }
    validate_pwl_options(&options.pwl)
}

pub fn validate_certifier_options(options: &CertifierOptions) -> ReachResult<()> {
    if !(options.desired_accuracy > 0.0 && options.desired_accuracy < 1.0) {
        return Err(invalid(format!(
            "certifier accuracy must lie in (0, 1), got {}",
            options.desired_accuracy
        )));
    }
    if options.initial_samples == 0 || options.max_attempts == 0 {
        return Err(invalid("certifier needs initial_samples >= 1 and max_attempts >= 1"));
    }
    if options.sample_growth < 2 {
        return Err(invalid("certifier sample_growth must be at least 2"));
    }
    Ok(())
}

/// Nonempty, finite, nonzero directions of one of the allowed lengths.
pub fn validate_directions(directions: &[DVector<f64>], lengths: &[usize]) -> ReachResult<()> {
    if directions.is_empty() {
        return Err(invalid("at least one direction is required"));
    }
    for (j, d) in directions.iter().enumerate() {
        if !lengths.contains(&d.len()) {
            return Err(invalid(format!(
                "direction {j} has length {}, expected one of {lengths:?}",
                d.len()
            )));
        }
        if d.iter().any(|v| !v.is_finite()) || d.norm() == 0.0 {
            return Err(invalid(format!("direction {j} must be finite and nonzero")));
        }
    }
    Ok(())
}

/// Inputs of the initial-set searches.
pub fn validate_set_search_inputs(
    system: &LinearSystem,
    tube: &SafetyTube,
    initial_set: &Polytope,
    options: &SetSearchOptions,
) -> ReachResult<()> {
    validate_tube(system, tube)?;
    system.gaussian()?;
    validate_system_finite(system, options.mode, options.check_finite)?;
    validate_threshold(options.threshold)?;
    if initial_set.dim() != system.state_dim() {
        return Err(invalid(format!(
            "initial set has dimension {}, expected {}",
            initial_set.dim(),
            system.state_dim()
        )));
    }
    validate_directions(&options.directions, &[system.state_dim()])?;
    if !(options.bisection_tolerance > 0.0) || options.bisection_max_iterations == 0 {
        return Err(invalid(
            "bisection needs a positive tolerance and at least one iteration",
        ));
    }
    if !(options.chebyshev_radius_cap > 0.0) {
        return Err(invalid("Chebyshev radius cap must be positive"));
    }
    validate_pwl_options(&options.pwl)?;
    validate_certifier_options(&options.certifier)
}

pub fn validate_lagrangian_inputs(
    system: &LinearSystem,
    tube: &SafetyTube,
    disturbance_sets: &[BoundedSet],
    method: &LagrangianMethod,
    approximation: Approximation,
    options: &LagrangianOptions,
) -> ReachResult<()> {
    validate_tube(system, tube)?;
    validate_system_finite(system, options.mode, options.check_finite)?;
    if disturbance_sets.is_empty() {
        return Err(invalid("at least one disturbance set is required"));
    }
    if let Some(bad) = disturbance_sets
        .iter()
        .find(|set| set.dim() != system.disturbance_dim())
    {
        return Err(invalid(format!(
            "disturbance set has dimension {}, expected {}",
            bad.dim(),
            system.disturbance_dim()
        )));
    }
    if !(options.chebyshev_radius_cap > 0.0) {
        return Err(invalid("Chebyshev radius cap must be positive"));
    }
    let n = system.state_dim();
    match (method, approximation) {
        (LagrangianMethod::Exact, _) => {
            if disturbance_sets.len() != 1 {
                return Err(invalid("the exact operator takes a single disturbance set"));
            }
        }
        (LagrangianMethod::RayShooting { directions }, Approximation::Under) => {
            validate_directions(directions, &[n, n + system.input_dim()])?;
        }
        (LagrangianMethod::SupportFunction { directions }, Approximation::Over) => {
            validate_directions(directions, &[n])?;
        }
        (LagrangianMethod::RayShooting { .. }, Approximation::Over) => {
            return Err(invalid("ray shooting only under-approximates"));
        }
        (LagrangianMethod::SupportFunction { .. }, Approximation::Under) => {
            return Err(invalid("the support-function operator only over-approximates"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReachError;
    use crate::system::fixtures;

    fn tube(horizon: usize) -> SafetyTube {
        SafetyTube::constant(
            Polytope::from_box(&[-10.0, -5.0], &[10.0, 5.0]).expect("box"),
            horizon,
        )
        .expect("tube")
    }

    // ── inverse-CDF options ──

    #[test]
    fn pwl_options_reject_bad_bounds() {
        let bad = PwlOptions {
            lower_bound: 0.5,
            ..PwlOptions::default()
        };
        assert!(validate_pwl_options(&bad).is_err());
        let bad = PwlOptions {
            accuracy: 0.0,
            ..PwlOptions::default()
        };
        assert!(validate_pwl_options(&bad).is_err());
        assert!(validate_pwl_options(&PwlOptions::default()).is_ok());
    }

    // ── point inputs ──

    #[test]
    fn point_inputs_check_dimensions() {
        let system = fixtures::double_integrator();
        let err = validate_point_inputs(
            &system,
            &tube(3),
            &DVector::zeros(3),
            RuntimeMode::Strict,
            true,
        )
        .expect_err("wrong length");
        assert!(matches!(err, ReachError::InvalidArgument { .. }));
    }

    #[test]
    fn point_inputs_need_gaussian_disturbance() {
        let system = fixtures::bounded_double_integrator();
        assert!(
            validate_point_inputs(&system, &tube(3), &DVector::zeros(2), RuntimeMode::Strict, true)
                .is_err()
        );
    }

    #[test]
    fn hardened_mode_rejects_nan_state() {
        let system = fixtures::double_integrator();
        let x0 = DVector::from_vec(vec![f64::NAN, 0.0]);
        assert!(validate_point_inputs(&system, &tube(2), &x0, RuntimeMode::Hardened, false).is_err());
        assert!(validate_point_inputs(&system, &tube(2), &x0, RuntimeMode::Strict, false).is_ok());
    }

    // ── DC options ──

    #[test]
    fn affine_options_reject_shrinking_penalty() {
        let bad = ChanceAffineOptions {
            tau_scaling: 0.5,
            ..ChanceAffineOptions::default()
        };
        assert!(validate_affine_options(&bad).is_err());
        let bad = ChanceAffineOptions {
            max_input_violation: 1.0,
            ..ChanceAffineOptions::default()
        };
        assert!(validate_affine_options(&bad).is_err());
        assert!(validate_affine_options(&ChanceAffineOptions::default()).is_ok());
    }

    // ── certifier and thresholds ──

    #[test]
    fn certifier_options_need_growth() {
        let bad = CertifierOptions {
            sample_growth: 1,
            ..CertifierOptions::default()
        };
        assert!(validate_certifier_options(&bad).is_err());
    }

    #[test]
    fn threshold_is_open_interval() {
        assert!(validate_threshold(0.0).is_err());
        assert!(validate_threshold(1.0).is_err());
        assert!(validate_threshold(f64::NAN).is_err());
        assert!(validate_threshold(0.8).is_ok());
    }

    // ── set search ──

    #[test]
    fn set_search_needs_state_directions() {
        let system = fixtures::double_integrator();
        let init = Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box");
        let options = SetSearchOptions {
            directions: vec![DVector::from_vec(vec![1.0, 0.0, 0.0])],
            ..SetSearchOptions::default()
        };
        assert!(validate_set_search_inputs(&system, &tube(2), &init, &options).is_err());
        let options = SetSearchOptions {
            directions: vec![DVector::from_vec(vec![1.0, 0.0])],
            ..SetSearchOptions::default()
        };
        assert!(validate_set_search_inputs(&system, &tube(2), &init, &options).is_ok());
        let options = SetSearchOptions {
            threshold: 1.0,
            ..options
        };
        assert!(validate_set_search_inputs(&system, &tube(2), &init, &options).is_err());
    }

    // ── Lagrangian inputs ──

    #[test]
    fn directions_must_match_allowed_lengths() {
        let dirs = vec![DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0])];
        assert!(validate_directions(&dirs, &[2, 3]).is_err());
        assert!(validate_directions(&[DVector::zeros(2)], &[2]).is_err());
        assert!(validate_directions(&[], &[2]).is_err());
    }

    #[test]
    fn exact_operator_takes_one_set() {
        let system = fixtures::bounded_double_integrator();
        let set = BoundedSet::Polytope(Polytope::from_box(&[-0.1, -0.1], &[0.1, 0.1]).expect("box"));
        let err = validate_lagrangian_inputs(
            &system,
            &tube(2),
            &[set.clone(), set],
            &LagrangianMethod::Exact,
            Approximation::Under,
            &LagrangianOptions::default(),
        )
        .expect_err("two sets");
        assert!(matches!(err, ReachError::InvalidArgument { .. }));
    }
}
