//! Property tests for fsr-reach.
//!
//! Convention: test_{module}_{function}_{scenario}
//!
//! Seed replay: `PROPTEST_CASES=1000 cargo test -p fsr-reach --test property_tests`
//! Reproduce: `PROPTEST_SEED=<seed> cargo test -p fsr-reach --test property_tests`

use fsr_conic::ClarabelSolver;
use fsr_geometry::Polytope;
use fsr_reach::{
    Approximation, ChanceAffineOptions, ChanceOpenOptions, Disturbance, InitialState,
    LinearSystem, PwlOptions, SafetyTube, chance_affine_point, chance_open_point, concatenate,
    confidence_ellipsoid, inverse_cdf_bound, trajectory_moments, upper_quantile,
};
use fsr_runtime::assert_close_slice;
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

fn zero_noise_system(a: DMatrix<f64>) -> LinearSystem {
    let n = a.nrows();
    LinearSystem::time_invariant(
        a,
        DMatrix::from_element(n, 1, 1.0),
        DMatrix::identity(n, n),
        Polytope::from_box(&[-1.0], &[1.0]).expect("input box"),
        Disturbance::Gaussian {
            mean: DVector::zeros(n),
            covariance: DMatrix::zeros(n, n),
        },
    )
    .expect("valid system")
}

fn double_integrator() -> LinearSystem {
    LinearSystem::time_invariant(
        DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
        DMatrix::from_row_slice(2, 1, &[0.5, 1.0]),
        DMatrix::identity(2, 2),
        Polytope::from_box(&[-1.0], &[1.0]).expect("input box"),
        Disturbance::Gaussian {
            mean: DVector::zeros(2),
            covariance: DMatrix::identity(2, 2),
        },
    )
    .expect("valid system")
}

/// Strictly diagonally dominant, hence invertible.
fn dominant_matrix() -> impl Strategy<Value = DMatrix<f64>> {
    (
        1.5f64..2.5,
        -1.0f64..1.0,
        -1.0f64..1.0,
        1.5f64..2.5,
    )
        .prop_map(|(a, b, c, d)| DMatrix::from_row_slice(2, 2, &[a, b, c, d]))
}

// ═══════════════════════════════════════════════════════════════
// Property 1: the chord bound dominates the quantile within accuracy
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_pwl_inverse_cdf_bound_dominates_within_accuracy(
        accuracy in 1e-3f64..1e-1,
        delta in 1e-6f64..0.5,
    ) {
        let options = PwlOptions {
            accuracy,
            lower_bound: 1e-6,
            ..PwlOptions::default()
        };
        let bound = inverse_cdf_bound(&options).expect("bound must build");
        prop_assume!(bound.in_domain(delta));
        let exact = upper_quantile(delta).expect("quantile");
        let approx = bound.evaluate(delta);
        prop_assert!(approx >= exact - 1e-9, "bound {approx} below quantile {exact}");
        prop_assert!(approx - exact <= accuracy + 1e-9, "gap {} above {accuracy}", approx - exact);
    }
}

// ═══════════════════════════════════════════════════════════════
// Property 2: coarser accuracy never needs more segments
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_pwl_inverse_cdf_bound_segments_monotone_in_accuracy(
        fine in 1e-3f64..1e-2,
        factor in 1.0f64..10.0,
    ) {
        let make = |accuracy: f64| {
            inverse_cdf_bound(&PwlOptions {
                accuracy,
                ..PwlOptions::default()
            })
            .expect("bound must build")
        };
        let dense = make(fine);
        let sparse = make(fine * factor);
        prop_assert!(sparse.len() <= dense.len());
        prop_assert!(sparse.max_gap() <= fine * factor + 1e-9);
    }
}

// ═══════════════════════════════════════════════════════════════
// Property 3: Z x_0 reproduces forward simulation without input or noise
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_concat_concatenate_round_trip_forward_simulation(
        a in dominant_matrix(),
        x0 in prop::collection::vec(-5.0f64..5.0, 2),
        horizon in 1usize..7,
    ) {
        let system = zero_noise_system(a.clone());
        let concat = concatenate(&system, horizon).expect("concatenate must work");
        let x0 = DVector::from_vec(x0);
        let stacked = &concat.z * &x0;
        let mut x = x0.clone();
        for k in 1..=horizon {
            x = &a * x;
            let got = concat.state_at(&stacked, &x0, k);
            assert_close_slice(got.as_slice(), x.as_slice(), 1e-9, 1e-9);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Property 4: trajectory mean is the noiseless trajectory
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_moments_trajectory_moments_mean_matches_nominal(
        x0 in prop::collection::vec(-5.0f64..5.0, 2),
        inputs in prop::collection::vec(-1.0f64..1.0, 4),
    ) {
        let system = double_integrator();
        let concat = concatenate(&system, 4).expect("concatenate must work");
        let x0 = DVector::from_vec(x0);
        let inputs = DVector::from_vec(inputs);
        let moments = trajectory_moments(
            &concat,
            &system,
            &InitialState::Deterministic(x0.clone()),
            &inputs,
        )
        .expect("moments must work");
        let nominal = concat.trajectory(&x0, &inputs, &DVector::zeros(8));
        assert_close_slice(moments.mean.as_slice(), nominal.as_slice(), 1e-9, 1e-9);
        let expected_cov = &concat.g * concat.g.transpose();
        assert_close_slice(moments.covariance.as_slice(), expected_cov.as_slice(), 1e-9, 1e-9);
    }
}

// ═══════════════════════════════════════════════════════════════
// Property 5: certified probability equals one minus the allocated risk
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_chance_open_point_probability_is_risk_complement(
        position in -10.0f64..10.0,
        velocity in -3.0f64..3.0,
    ) {
        let tube = SafetyTube::constant(
            Polytope::from_box(&[-20.0, -10.0], &[20.0, 10.0]).expect("box"),
            3,
        )
        .expect("tube");
        let options = ChanceOpenOptions::default();
        let result = chance_open_point(
            &double_integrator(),
            &tube,
            &DVector::from_vec(vec![position, velocity]),
            &options,
            &ClarabelSolver::default(),
        )
        .expect("chance-open must work");
        if let Some(cert) = result.certificate() {
            let total = cert.risk.state_total();
            prop_assert!(total <= 1.0 + 1e-7, "state risk {total}");
            prop_assert!((cert.probability - (1.0 - total)).abs() <= 1e-7);
            for delta in &cert.risk.state {
                prop_assert!(*delta >= options.pwl.lower_bound - 1e-7);
                prop_assert!(*delta <= 0.5 + 1e-7);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Property 6: affine state risk plus the input budget never exceeds one
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn test_chance_affine_point_risk_within_budget(
        half_width in 0.5f64..20.0,
        position in -0.4f64..0.4,
    ) {
        let tube = SafetyTube::constant(
            Polytope::from_box(&[-half_width, -10.0], &[half_width, 10.0]).expect("box"),
            2,
        )
        .expect("tube");
        let options = ChanceAffineOptions::default();
        let result = chance_affine_point(
            &double_integrator(),
            &tube,
            &DVector::from_vec(vec![position, 0.0]),
            &options,
            &ClarabelSolver::default(),
        )
        .expect("chance-affine must work");
        if let Some(cert) = result.certificate() {
            let state = cert.risk.state_total();
            prop_assert!(state + options.max_input_violation <= 1.0 + 1e-6, "state risk {state}");
            prop_assert!(cert.risk.input_total() <= options.max_input_violation + 1e-6);
            prop_assert!((0.0..=1.0).contains(&cert.probability));
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Property 7: higher thresholds give larger under-approximation ellipsoids
// ═══════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_lagrangian_confidence_ellipsoid_grows_with_threshold(
        low in 0.05f64..0.9,
        step in 0.01f64..0.09,
        horizon in 1usize..8,
    ) {
        let mean = DVector::zeros(2);
        let cov = DMatrix::identity(2, 2);
        let small = confidence_ellipsoid(&mean, &cov, low, horizon, Approximation::Under)
            .expect("ellipsoid");
        let large = confidence_ellipsoid(&mean, &cov, low + step, horizon, Approximation::Under)
            .expect("ellipsoid");
        let e = DVector::from_vec(vec![1.0, 0.0]);
        prop_assert!(large.support(&e) >= small.support(&e));
    }
}
