#![no_main]

use arbitrary::Arbitrary;
use fsr_geometry::Polytope;
use libfuzzer_sys::fuzz_target;
use nalgebra::DVector;

#[derive(Debug, Arbitrary)]
struct VertexInput {
    points: Vec<(f64, f64)>,
}

fuzz_target!(|input: VertexInput| {
    let points: Vec<DVector<f64>> = input
        .points
        .iter()
        .take(32)
        .filter(|(x, y)| x.is_finite() && y.is_finite() && x.abs() < 1e6 && y.abs() < 1e6)
        .map(|&(x, y)| DVector::from_vec(vec![x, y]))
        .collect();
    let Ok(hull) = Polytope::from_vertices(&points, 2) else {
        return;
    };
    for point in &points {
        assert!(hull.contains(point, 1e-6 * (1.0 + point.norm())));
    }
});
