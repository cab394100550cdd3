//! Certified initial-state sets assembled from point certificates.
//!
//! Both routes first locate the initial state of maximal certified
//! probability inside `X_init ∩ S_0`, then push outward along every
//! direction while the certificate stays above the threshold, and hull the
//! boundary points.
//!
//! | Route             | Maximal point            | Boundary point                 |
//! |-------------------|--------------------------|--------------------------------|
//! | chance-constrained| one convex program       | one convex program per ray     |
//! | Gaussian integral | pattern search over (x, U)| bisection on the ray parameter |

use fsr_conic::{ConicSolver, LinExpr, SolveStatus};
use fsr_geometry::Polytope;
use fsr_linalg::block_diag;
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chance::{InitialPoint, OpenLoopProgram, build_open_loop};
use crate::concat::concatenate;
use crate::dfo::{DerivativeFreeOptimizer, PatternSearchOptions};
use crate::error::{ReachError, ReachResult, invalid};
use crate::genz::{CertifierOptions, GaussianCdfOracle};
use crate::genz_open::OpenLoopIntegrator;
use crate::lag_ray::ray_length;
use crate::outcome::Controller;
use crate::pwl::{PwlOptions, inverse_cdf_bound};
use crate::system::LinearSystem;
use crate::tube::SafetyTube;
use crate::validation::validate_set_search_inputs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSearchOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    pub threshold: f64,
    /// Ray directions in state space.
    pub directions: Vec<DVector<f64>>,
    /// Bisection stops once the ray-parameter bracket is narrower than this.
    pub bisection_tolerance: f64,
    pub bisection_max_iterations: usize,
    pub pwl: PwlOptions,
    pub certifier: CertifierOptions,
    pub pattern: PatternSearchOptions,
    pub chebyshev_radius_cap: f64,
}

impl Default for SetSearchOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            threshold: 0.8,
            directions: Vec::new(),
            bisection_tolerance: 1e-2,
            bisection_max_iterations: 30,
            pwl: PwlOptions::default(),
            certifier: CertifierOptions::default(),
            pattern: PatternSearchOptions::default(),
            chebyshev_radius_cap: 1e3,
        }
    }
}

/// Where a boundary ray started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchSeed {
    MaxProbability,
    ChebyshevCenter,
}

/// An initial state with the probability certified for it and the
/// controller achieving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertifiedPoint {
    pub point: DVector<f64>,
    pub probability: f64,
    pub controller: Controller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPoint {
    pub direction: usize,
    pub seed: SearchSeed,
    pub certified: CertifiedPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSearchResult {
    /// `None` when no initial state reaches the threshold.
    pub polytope: Option<Polytope>,
    pub max_point: Option<CertifiedPoint>,
    pub boundary: Vec<BoundaryPoint>,
    pub diagnostics: Vec<ReachEvent>,
}

impl SetSearchResult {
    fn empty(max_point: Option<CertifiedPoint>, ledger: DiagnosticLedger) -> Self {
        Self {
            polytope: None,
            max_point,
            boundary: Vec::new(),
            diagnostics: ledger.into_events(),
        }
    }
}

/// Chance-constrained route.
pub fn chance_open_set(
    system: &LinearSystem,
    tube: &SafetyTube,
    initial_set: &Polytope,
    options: &SetSearchOptions,
    solver: &dyn ConicSolver,
) -> ReachResult<SetSearchResult> {
    validate_set_search_inputs(system, tube, initial_set, options)?;
    let mut ledger = DiagnosticLedger::default();
    let n = system.state_dim();
    let free = initial_set.intersect(tube.stage(0)?)?;
    let concat = concatenate(system, tube.horizon())?;
    let bound = inverse_cdf_bound(&options.pwl)?;

    let mut max_program =
        build_open_loop(system, tube, &concat, &bound, InitialPoint::Free(&free))?;
    max_program.program.minimize(max_program.total_risk());
    let solution = solver.solve(&max_program.program)?;
    match solution.status {
        SolveStatus::Solved => {}
        SolveStatus::SolvedInaccurate => ledger.record(ReachEvent::warning(
            Component::SetSearch,
            0,
            "maximal-probability program solved to relaxed tolerances",
        )),
        SolveStatus::Infeasible => {
            ledger.record(
                ReachEvent::new(Component::SetSearch, 0, EventKind::Terminated)
                    .with_message("maximal-probability program infeasible"),
            );
            return Ok(SetSearchResult::empty(None, ledger));
        }
        status => return Err(ReachError::SolverFailed { stage: 0, status }),
    }
    let max_point = certified_from(&max_program, &solution.x)?;
    ledger.record(
        ReachEvent::progress(Component::SetSearch, 0)
            .with_metric("max_probability", max_point.probability),
    );
    if max_point.probability < options.threshold {
        ledger.record(
            ReachEvent::new(Component::SetSearch, 0, EventKind::Terminated)
                .with_metric("max_probability", max_point.probability)
                .with_message("maximal probability below threshold"),
        );
        return Ok(SetSearchResult::empty(Some(max_point), ledger));
    }

    let mut boundary = Vec::with_capacity(options.directions.len());
    for (j, direction) in options.directions.iter().enumerate() {
        let mut ray = build_open_loop(system, tube, &concat, &bound, InitialPoint::Free(&free))?;
        let Some(x0) = ray.x0 else {
            return Err(invalid("free initial state has no variables"));
        };
        let alpha = ray.program.add_variable();
        ray.program.add_ge(LinExpr::var(alpha), 0.0);
        for i in 0..n {
            ray.program.add_eq(
                LinExpr::var(x0 + i).term(alpha, -direction[i]),
                max_point.point[i],
            );
        }
        let risk = ray.total_risk();
        ray.program.add_le(risk, 1.0 - options.threshold);
        ray.program.maximize(LinExpr::var(alpha));

        let solution = solver.solve(&ray.program)?;
        match solution.status {
            SolveStatus::Solved => {}
            SolveStatus::SolvedInaccurate => ledger.record(
                ReachEvent::warning(
                    Component::SetSearch,
                    j,
                    "ray program solved to relaxed tolerances",
                )
                .with_metric("direction", j as f64),
            ),
            _ => return Err(ReachError::BoundaryComputationFailed { stage: 0, direction: j }),
        }
        let certified = certified_from(&ray, &solution.x)?;
        ledger.record(
            ReachEvent::progress(Component::SetSearch, j)
                .with_metric("alpha", solution.value(alpha))
                .with_metric("probability", certified.probability),
        );
        boundary.push(BoundaryPoint {
            direction: j,
            seed: SearchSeed::MaxProbability,
            certified,
        });
    }
    finish(boundary, Some(max_point), n, ledger)
}

/// Gaussian-integration route with the maximal-point and Chebyshev seeds.
pub fn genz_open_set(
    system: &LinearSystem,
    tube: &SafetyTube,
    initial_set: &Polytope,
    options: &SetSearchOptions,
    oracle: &dyn GaussianCdfOracle,
    optimizer: &dyn DerivativeFreeOptimizer,
    solver: &dyn ConicSolver,
) -> ReachResult<SetSearchResult> {
    validate_set_search_inputs(system, tube, initial_set, options)?;
    let mut ledger = DiagnosticLedger::default();
    let n = system.state_dim();
    let free = initial_set.intersect(tube.stage(0)?)?;
    let integrator = OpenLoopIntegrator::new(system, tube, options.certifier, oracle)?;
    let m_total = integrator.input_len();
    let joint = product(&free, integrator.input_space())?;

    let Some((center, _)) = joint.chebyshev_center(solver, options.chebyshev_radius_cap)? else {
        ledger.record(
            ReachEvent::new(Component::SetSearch, 0, EventKind::Terminated)
                .with_message("initial set does not meet the first tube set"),
        );
        return Ok(SetSearchResult::empty(None, ledger));
    };
    let mut objective = |z: &DVector<f64>| {
        integrator.probability(&z.rows(0, n).into_owned(), &z.rows(n, m_total).into_owned())
    };
    let best = optimizer.maximize(&mut objective, &joint, &center)?;
    let max_point = CertifiedPoint {
        point: best.point.rows(0, n).into_owned(),
        probability: best.value,
        controller: Controller::OpenLoop {
            inputs: best.point.rows(n, m_total).into_owned(),
        },
    };
    ledger.record(
        ReachEvent::progress(Component::SetSearch, 0)
            .with_metric("max_probability", best.value)
            .with_metric("evaluations", best.evaluations as f64),
    );
    if max_point.probability < options.threshold {
        ledger.record(
            ReachEvent::new(Component::SetSearch, 0, EventKind::Terminated)
                .with_metric("max_probability", max_point.probability)
                .with_message("maximal probability below threshold"),
        );
        return Ok(SetSearchResult::empty(Some(max_point), ledger));
    }

    let mut seeds = vec![(SearchSeed::MaxProbability, max_point.clone())];
    if let Some((x_center, _)) = free.chebyshev_center(solver, options.chebyshev_radius_cap)? {
        let start = open_loop_inputs(&max_point.controller);
        let at_center = integrator.best_inputs(&x_center, &start, optimizer)?;
        if at_center.value >= options.threshold {
            seeds.push((
                SearchSeed::ChebyshevCenter,
                CertifiedPoint {
                    point: x_center,
                    probability: at_center.value,
                    controller: Controller::OpenLoop {
                        inputs: at_center.point,
                    },
                },
            ));
        } else {
            ledger.record(
                ReachEvent::warning(
                    Component::SetSearch,
                    0,
                    "Chebyshev seed below threshold; searching from the maximal point only",
                )
                .with_metric("probability", at_center.value),
            );
        }
    }

    let split = free.with_split_equalities();
    let mut boundary = Vec::with_capacity(seeds.len() * options.directions.len());
    for (seed, origin) in &seeds {
        for (j, direction) in options.directions.iter().enumerate() {
            let alpha_max = ray_length(&split, &origin.point, direction)
                .ok_or(ReachError::BoundaryComputationFailed { stage: 0, direction: j })?;
            let (alpha, certified, iterations) =
                bisect_ray(&integrator, optimizer, origin, direction, alpha_max, options)?;
            ledger.record(
                ReachEvent::progress(Component::SetSearch, j)
                    .with_metric("alpha", alpha)
                    .with_metric("alpha_max", alpha_max)
                    .with_metric("probability", certified.probability)
                    .with_metric("bisection_iterations", iterations as f64),
            );
            boundary.push(BoundaryPoint {
                direction: j,
                seed: *seed,
                certified,
            });
        }
    }
    finish(boundary, Some(max_point), n, ledger)
}

/// Largest certified step along `direction` from `origin`, the certified
/// point there and the number of bisection steps taken.
fn bisect_ray(
    integrator: &OpenLoopIntegrator<'_>,
    optimizer: &dyn DerivativeFreeOptimizer,
    origin: &CertifiedPoint,
    direction: &DVector<f64>,
    alpha_max: f64,
    options: &SetSearchOptions,
) -> ReachResult<(f64, CertifiedPoint, usize)> {
    let certify = |alpha: f64, start: &DVector<f64>| -> ReachResult<CertifiedPoint> {
        let point = &origin.point + direction * alpha;
        let best = integrator.best_inputs(&point, start, optimizer)?;
        Ok(CertifiedPoint {
            point,
            probability: best.value,
            controller: Controller::OpenLoop { inputs: best.point },
        })
    };

    let far = certify(alpha_max, &open_loop_inputs(&origin.controller))?;
    if far.probability >= options.threshold {
        return Ok((alpha_max, far, 0));
    }
    let mut lo = 0.0;
    let mut hi = alpha_max;
    let mut best = origin.clone();
    let mut iterations = 0;
    while hi - lo > options.bisection_tolerance && iterations < options.bisection_max_iterations {
        let mid = 0.5 * (lo + hi);
        let trial = certify(mid, &open_loop_inputs(&best.controller))?;
        if trial.probability >= options.threshold {
            lo = mid;
            best = trial;
        } else {
            hi = mid;
        }
        iterations += 1;
    }
    debug!(lo, hi, iterations, "ray bisection finished");
    Ok((lo, best, iterations))
}

fn open_loop_inputs(controller: &Controller) -> DVector<f64> {
    match controller {
        Controller::OpenLoop { inputs } => inputs.clone(),
        Controller::AffineFeedback { offset, .. } => offset.clone(),
    }
}

fn certified_from(assembled: &OpenLoopProgram, x: &[f64]) -> ReachResult<CertifiedPoint> {
    let Some(x0) = assembled.x0 else {
        return Err(invalid("free initial state has no variables"));
    };
    let n = assembled.inputs - x0;
    let risk = assembled.total_risk().evaluate(x);
    Ok(CertifiedPoint {
        point: DVector::from_column_slice(&x[x0..x0 + n]),
        probability: (1.0 - risk).clamp(0.0, 1.0),
        controller: Controller::OpenLoop {
            inputs: DVector::from_column_slice(
                &x[assembled.inputs..assembled.inputs + assembled.input_len],
            ),
        },
    })
}

/// `P × Q` over the concatenated coordinates.
fn product(first: &Polytope, second: &Polytope) -> ReachResult<Polytope> {
    let a = block_diag(&[first.a().clone(), second.a().clone()]);
    let ae = block_diag(&[first.ae().clone(), second.ae().clone()]);
    let b = DVector::from_iterator(a.nrows(), first.b().iter().chain(second.b().iter()).copied());
    let be = DVector::from_iterator(
        ae.nrows(),
        first.be().iter().chain(second.be().iter()).copied(),
    );
    Ok(Polytope::new(a, b, ae, be)?)
}

fn finish(
    boundary: Vec<BoundaryPoint>,
    max_point: Option<CertifiedPoint>,
    n: usize,
    mut ledger: DiagnosticLedger,
) -> ReachResult<SetSearchResult> {
    let mut points: Vec<DVector<f64>> = boundary
        .iter()
        .map(|b| b.certified.point.clone())
        .collect();
    if let Some(max) = &max_point {
        points.push(max.point.clone());
    }
    let polytope = Polytope::from_vertices(&points, n)?;
    ledger.record(
        ReachEvent::new(Component::SetSearch, 0, EventKind::Converged)
            .with_metric("boundary_points", boundary.len() as f64)
            .with_metric("inequalities", polytope.num_inequalities() as f64),
    );
    Ok(SetSearchResult {
        polytope: Some(polytope),
        max_point,
        boundary,
        diagnostics: ledger.into_events(),
    })
}
