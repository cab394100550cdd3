use criterion::{Criterion, criterion_group, criterion_main};
use fsr_conic::ClarabelSolver;
use fsr_geometry::{BoundedSet, Polytope};
use fsr_reach::{
    Approximation, ChanceOpenOptions, Disturbance, LagrangianMethod, LagrangianOptions,
    LinearSystem, PwlOptions, SafetyTube, backward_tube, chance_open_point, concatenate,
    inverse_cdf_bound,
};
use nalgebra::{DMatrix, DVector};

fn double_integrator(disturbance: Disturbance) -> LinearSystem {
    LinearSystem::time_invariant(
        DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
        DMatrix::from_row_slice(2, 1, &[0.5, 1.0]),
        DMatrix::identity(2, 2),
        Polytope::from_box(&[-1.0], &[1.0]).expect("input box"),
        disturbance,
    )
    .expect("valid system")
}

fn gaussian() -> Disturbance {
    Disturbance::Gaussian {
        mean: DVector::zeros(2),
        covariance: DMatrix::identity(2, 2),
    }
}

fn box_tube(horizon: usize) -> SafetyTube {
    SafetyTube::constant(
        Polytope::from_box(&[-20.0, -10.0], &[20.0, 10.0]).expect("box"),
        horizon,
    )
    .expect("tube")
}

fn bench_inverse_cdf_bound(c: &mut Criterion) {
    let options = PwlOptions::default();
    c.bench_function("inverse_cdf_bound_1e-3", |b| {
        b.iter(|| inverse_cdf_bound(&options));
    });
}

fn bench_concatenate(c: &mut Criterion) {
    let system = double_integrator(gaussian());
    c.bench_function("concatenate_double_integrator_n20", |b| {
        b.iter(|| concatenate(&system, 20));
    });
}

fn bench_chance_open_point(c: &mut Criterion) {
    let system = double_integrator(gaussian());
    let tube = box_tube(5);
    let x0 = DVector::zeros(2);
    let options = ChanceOpenOptions::default();
    let solver = ClarabelSolver::default();
    c.bench_function("chance_open_point_n5", |b| {
        b.iter(|| chance_open_point(&system, &tube, &x0, &options, &solver));
    });
}

fn bench_exact_backward_tube(c: &mut Criterion) {
    let sets = vec![BoundedSet::Polytope(
        Polytope::from_box(&[-0.1, -0.1], &[0.1, 0.1]).expect("box"),
    )];
    let system = double_integrator(Disturbance::Bounded(sets.clone()));
    let tube = box_tube(5);
    let options = LagrangianOptions::default();
    let solver = ClarabelSolver::default();
    c.bench_function("backward_tube_exact_n5", |b| {
        b.iter(|| {
            backward_tube(
                &system,
                &tube,
                &sets,
                &LagrangianMethod::Exact,
                Approximation::Under,
                &options,
                &solver,
            )
        });
    });
}

criterion_group!(
    benches,
    bench_inverse_cdf_bound,
    bench_concatenate,
    bench_chance_open_point,
    bench_exact_backward_tube
);
criterion_main!(benches);
