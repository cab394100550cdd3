#![no_main]

use arbitrary::Arbitrary;
use fsr_geometry::Polytope;
use fsr_reach::{Disturbance, LinearSystem, concatenate};
use libfuzzer_sys::fuzz_target;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Arbitrary)]
struct ConcatInput {
    a: [f64; 4],
    b: [f64; 2],
    horizon: u8,
}

fuzz_target!(|input: ConcatInput| {
    if input.a.iter().chain(&input.b).any(|v| !v.is_finite() || v.abs() > 1e3) {
        return;
    }
    let Ok(input_space) = Polytope::from_box(&[-1.0], &[1.0]) else {
        return;
    };
    let Ok(system) = LinearSystem::time_invariant(
        DMatrix::from_row_slice(2, 2, &input.a),
        DMatrix::from_row_slice(2, 1, &input.b),
        DMatrix::identity(2, 2),
        input_space,
        Disturbance::Gaussian {
            mean: DVector::zeros(2),
            covariance: DMatrix::identity(2, 2),
        },
    ) else {
        return;
    };
    let horizon = usize::from(input.horizon % 12);
    let Ok(concat) = concatenate(&system, horizon) else {
        return;
    };
    assert_eq!(concat.z.shape(), (2 * horizon, 2));
    assert_eq!(concat.h.shape(), (2 * horizon, horizon));
    assert_eq!(concat.g.shape(), (2 * horizon, 2 * horizon));
});
