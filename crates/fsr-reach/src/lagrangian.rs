//! Lagrangian backward tube.
//!
//! `X_N = S_N` and, for `t = N-1, .., 0`,
//! `X_t = S_t ∩ A_t⁻¹ ((X_{t+1} ⊖ F_t E) ⊕ (−B_t U))` for the robust
//! (under) tube. The over tube replaces the erosion by `X_{t+1} ⊕ (−F_t E)`.
//! The exact operator evaluates either recursion with set algebra, ray
//! shooting under-approximates the robust one-step set, and the
//! support-function operator over-approximates each `X_t` directly without
//! recursion.

use fsr_conic::ConicSolver;
use fsr_geometry::{BoundedSet, Ellipsoid, Polytope, SupportFunction};
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

use crate::error::{ReachError, ReachResult, invalid};
use crate::lag_exact::exact_one_step;
use crate::lag_ray::ray_one_step;
use crate::lag_support::support_tube;
use crate::system::{Disturbance, LinearSystem, StageMatrices};
use crate::tube::SafetyTube;
use crate::validation::{validate_lagrangian_inputs, validate_threshold};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LagrangianMethod {
    Exact,
    /// Directions in state space (`n`) or joint state-input space (`n + m`).
    RayShooting { directions: Vec<DVector<f64>> },
    /// Directions in state space.
    SupportFunction { directions: Vec<DVector<f64>> },
}

impl LagrangianMethod {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::RayShooting { .. } => "ray_shooting",
            Self::SupportFunction { .. } => "support_function",
        }
    }
}

/// Direction of the Gaussian-to-ellipsoid conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Approximation {
    Under,
    Over,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LagrangianOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    /// Cap on the Chebyshev radius used to locate interior points.
    pub chebyshev_radius_cap: f64,
}

impl Default for LagrangianOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            chebyshev_radius_cap: 1e3,
        }
    }
}

/// `X_0, .., X_N`, each contained in the matching tube set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackwardTube {
    sets: Vec<Polytope>,
}

impl BackwardTube {
    pub(crate) fn new(sets: Vec<Polytope>) -> Self {
        Self { sets }
    }

    #[must_use]
    pub fn sets(&self) -> &[Polytope] {
        &self.sets
    }

    #[must_use]
    pub fn horizon(&self) -> usize {
        self.sets.len().saturating_sub(1)
    }

    pub fn stage(&self, t: usize) -> ReachResult<&Polytope> {
        self.sets
            .get(t)
            .ok_or_else(|| invalid(format!("backward tube has no stage {t}")))
    }

    /// `X_0`.
    #[must_use]
    pub fn initial(&self) -> &Polytope {
        &self.sets[0]
    }
}

/// Support value and costates of one (stage, direction) program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportDiagnostics {
    pub stage: usize,
    pub direction: usize,
    /// `-∞` when the stage set is empty.
    pub value: f64,
    /// Multipliers of the dynamics rows `x_{k+1} = A x_k + B u_k + F w_k`,
    /// `k = stage, .., N-1`, for the maximizing disturbance set.
    pub costates: Vec<DVector<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagrangianResult {
    pub tube: BackwardTube,
    /// Empty unless the support-function operator ran.
    pub support: Vec<SupportDiagnostics>,
    pub diagnostics: Vec<ReachEvent>,
}

/// Confidence ellipsoid `{w : (w − μ)ᵀ Σ⁻¹ (w − μ) <= r²}` with
/// `r² = χ²_p⁻¹(β)`, `β = θ^{1/N}` (under) or `(1 − θ)^{1/N}` (over).
pub fn confidence_ellipsoid(
    mean: &DVector<f64>,
    covariance: &DMatrix<f64>,
    threshold: f64,
    horizon: usize,
    approximation: Approximation,
) -> ReachResult<Ellipsoid> {
    validate_threshold(threshold)?;
    if horizon == 0 {
        return Err(ReachError::InvalidHorizon { horizon });
    }
    let per_stage = match approximation {
        Approximation::Under => threshold,
        Approximation::Over => 1.0 - threshold,
    };
    let beta = per_stage.powf(1.0 / horizon as f64);
    let chi = ChiSquared::new(mean.len() as f64).map_err(|err| invalid(err.to_string()))?;
    let radius_sq = chi.inverse_cdf(beta);
    debug!(beta, radius_sq, "confidence ellipsoid");
    Ok(Ellipsoid::new(mean.clone(), covariance * radius_sq)?)
}

/// Bounded disturbance sets of a system; Gaussian disturbances become a
/// single confidence ellipsoid.
pub fn bounded_disturbance_sets(
    system: &LinearSystem,
    threshold: f64,
    horizon: usize,
    approximation: Approximation,
) -> ReachResult<Vec<BoundedSet>> {
    match system.disturbance() {
        Disturbance::Bounded(sets) => Ok(sets.clone()),
        Disturbance::Gaussian { mean, covariance } => Ok(vec![BoundedSet::Ellipsoid(
            confidence_ellipsoid(mean, covariance, threshold, horizon, approximation)?,
        )]),
    }
}

/// `target ⊖ F E`.
pub(crate) fn erode(
    target: &Polytope,
    stage: &StageMatrices,
    set: &BoundedSet,
) -> ReachResult<Polytope> {
    let ft = stage.f.transpose();
    Ok(target.minkowski_difference(|normal| set.support(&(&ft * normal)))?)
}

/// `target ⊕ (−F E)`; ellipsoids enter through an outer polytope.
pub(crate) fn inflate(
    target: &Polytope,
    stage: &StageMatrices,
    set: &BoundedSet,
) -> ReachResult<Polytope> {
    let map = -&stage.f;
    let pushed = match set {
        BoundedSet::Polytope(p) => p.image(&map)?,
        BoundedSet::Ellipsoid(e) => outer_polytope(&e.map(&map)?)?,
    };
    Ok(target.minkowski_sum(&pushed)?)
}

/// Polytope `{x : ℓᵀx <= h(ℓ)}` over the axis and pairwise-diagonal
/// directions.
fn outer_polytope(ellipsoid: &Ellipsoid) -> ReachResult<Polytope> {
    let n = ellipsoid.dim();
    let mut normals = Vec::with_capacity(2 * n * n);
    for i in 0..n {
        for sign in [1.0, -1.0] {
            let mut l = DVector::zeros(n);
            l[i] = sign;
            normals.push(l);
        }
        for j in (i + 1)..n {
            for (si, sj) in [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)] {
                let mut l = DVector::zeros(n);
                l[i] = si * std::f64::consts::FRAC_1_SQRT_2;
                l[j] = sj * std::f64::consts::FRAC_1_SQRT_2;
                normals.push(l);
            }
        }
    }
    let mut a = DMatrix::zeros(normals.len(), n);
    let mut b = DVector::zeros(normals.len());
    for (row, l) in normals.iter().enumerate() {
        a.set_row(row, &l.transpose());
        b[row] = ellipsoid.support(l);
    }
    Ok(Polytope::from_halfspaces(a, b)?)
}

pub fn backward_tube(
    system: &LinearSystem,
    tube: &SafetyTube,
    disturbance_sets: &[BoundedSet],
    method: &LagrangianMethod,
    approximation: Approximation,
    options: &LagrangianOptions,
    solver: &dyn ConicSolver,
) -> ReachResult<LagrangianResult> {
    validate_lagrangian_inputs(system, tube, disturbance_sets, method, approximation, options)?;
    let mut ledger = DiagnosticLedger::default();
    let horizon = tube.horizon();

    if let LagrangianMethod::SupportFunction { directions } = method {
        let (sets, support) =
            support_tube(system, tube, disturbance_sets, directions, solver, &mut ledger)?;
        return Ok(LagrangianResult {
            tube: BackwardTube::new(sets),
            support,
            diagnostics: ledger.into_events(),
        });
    }

    let mut sets = vec![Polytope::empty(tube.dim()); horizon + 1];
    sets[horizon] = tube.stage(horizon)?.clone();
    for t in (0..horizon).rev() {
        let stage = system.stage(t)?;
        let safe = tube.stage(t)?;
        let target = &sets[t + 1];
        let mut per_set = Vec::with_capacity(disturbance_sets.len());
        for set in disturbance_sets {
            let next = match approximation {
                Approximation::Under => erode(target, stage, set)?,
                Approximation::Over => inflate(target, stage, set)?,
            };
            let one_step = match method {
                LagrangianMethod::Exact => exact_one_step(&next, stage, system.input_space(), t)?,
                LagrangianMethod::RayShooting { directions } => ray_one_step(
                    &next,
                    stage,
                    system.input_space(),
                    safe,
                    directions,
                    options,
                    solver,
                    t,
                    &mut ledger,
                )?,
                LagrangianMethod::SupportFunction { .. } => {
                    return Err(invalid("support-function operator has no recursion"));
                }
            };
            per_set.push(one_step.intersect(safe)?);
        }

        let stage_set = if per_set.len() == 1 {
            per_set.remove(0)
        } else {
            ledger.record(ReachEvent::warning(
                Component::Lagrangian,
                t,
                "convex hull of per-disturbance-set results is a heuristic combination",
            ));
            let mut points = Vec::new();
            for set in &per_set {
                points.extend(set.vertices()?);
            }
            Polytope::from_vertices(&points, tube.dim())?.intersect(safe)?
        };

        ledger.record(
            ReachEvent::progress(Component::Lagrangian, t)
                .with_metric("inequalities", stage_set.num_inequalities() as f64)
                .with_metric("vertices", stage_set.vertices()?.len() as f64)
                .with_message(method.name()),
        );
        sets[t] = stage_set;
    }

    ledger.record(
        ReachEvent::new(Component::Lagrangian, 0, EventKind::Terminated)
            .with_metric("empty", f64::from(u8::from(sets[0].is_empty()?)))
            .with_message(method.name()),
    );
    Ok(LagrangianResult {
        tube: BackwardTube::new(sets),
        support: Vec::new(),
        diagnostics: ledger.into_events(),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{box_tube, circle_directions};
    use super::*;
    use crate::system::fixtures;
    use fsr_conic::ClarabelSolver;
    use fsr_runtime::assert_close;

    fn sets_of(system: &LinearSystem) -> Vec<BoundedSet> {
        bounded_disturbance_sets(system, 0.9, 3, Approximation::Under).expect("sets")
    }

    #[test]
    fn confidence_radius_follows_chi_squared() {
        // χ²_2⁻¹(β) = −2 ln(1 − β).
        let e = confidence_ellipsoid(
            &DVector::zeros(2),
            &DMatrix::identity(2, 2),
            0.8,
            1,
            Approximation::Under,
        )
        .expect("ellipsoid");
        let radius = e.support(&DVector::from_vec(vec![1.0, 0.0]));
        assert_close(radius * radius, -2.0 * (0.2_f64).ln(), 1e-6, 1e-6);

        let over = confidence_ellipsoid(
            &DVector::zeros(2),
            &DMatrix::identity(2, 2),
            0.8,
            1,
            Approximation::Over,
        )
        .expect("ellipsoid");
        assert!(over.support(&DVector::from_vec(vec![1.0, 0.0])) < radius);
    }

    #[test]
    fn longer_horizon_inflates_under_ellipsoid() {
        let short = confidence_ellipsoid(
            &DVector::zeros(1),
            &DMatrix::identity(1, 1),
            0.9,
            1,
            Approximation::Under,
        )
        .expect("ellipsoid");
        let long = confidence_ellipsoid(
            &DVector::zeros(1),
            &DMatrix::identity(1, 1),
            0.9,
            5,
            Approximation::Under,
        )
        .expect("ellipsoid");
        let l = DVector::from_element(1, 1.0);
        assert!(long.support(&l) > short.support(&l));
    }

    #[test]
    fn exact_tube_stays_inside_safety_tube() {
        let system = fixtures::bounded_double_integrator();
        let tube = box_tube(3);
        let result = backward_tube(
            &system,
            &tube,
            &sets_of(&system),
            &LagrangianMethod::Exact,
            Approximation::Under,
            &LagrangianOptions::default(),
            &ClarabelSolver::default(),
        )
        .expect("exact tube must work");
        assert_eq!(result.tube.sets().len(), 4);
        assert_eq!(result.tube.stage(3).expect("last"), tube.stage(3).expect("last"));
        for (t, set) in result.tube.sets().iter().enumerate() {
            let safe = tube.stage(t).expect("stage");
            assert!(set.is_subset_of(safe, 1e-7).expect("subset"));
        }
        assert!(!result.tube.initial().is_empty().expect("emptiness"));
        assert!(result.tube.initial().contains(&DVector::zeros(2), 1e-9));
    }

    #[test]
    fn ray_shooting_is_inside_exact() {
        let system = fixtures::bounded_double_integrator();
        let tube = box_tube(2);
        let sets = sets_of(&system);
        let solver = ClarabelSolver::default();
        let exact = backward_tube(
            &system,
            &tube,
            &sets,
            &LagrangianMethod::Exact,
            Approximation::Under,
            &LagrangianOptions::default(),
            &solver,
        )
        .expect("exact tube must work");
        let ray = backward_tube(
            &system,
            &tube,
            &sets,
            &LagrangianMethod::RayShooting {
                directions: circle_directions(16),
            },
            Approximation::Under,
            &LagrangianOptions::default(),
            &solver,
        )
        .expect("ray tube must work");
        for (under, reference) in ray.tube.sets().iter().zip(exact.tube.sets()) {
            assert!(under.is_subset_of(reference, 1e-6).expect("subset"));
        }
    }

    #[test]
    fn support_function_contains_exact() {
        let system = fixtures::bounded_double_integrator();
        let tube = box_tube(2);
        let sets = sets_of(&system);
        let solver = ClarabelSolver::default();
        let exact = backward_tube(
            &system,
            &tube,
            &sets,
            &LagrangianMethod::Exact,
            Approximation::Under,
            &LagrangianOptions::default(),
            &solver,
        )
        .expect("exact tube must work");
        let over = backward_tube(
            &system,
            &tube,
            &sets,
            &LagrangianMethod::SupportFunction {
                directions: circle_directions(12),
            },
            Approximation::Over,
            &LagrangianOptions::default(),
            &solver,
        )
        .expect("support tube must work");
        assert_eq!(over.support.len(), 12 * 2);
        for (outer, reference) in over.tube.sets().iter().zip(exact.tube.sets()) {
            assert!(reference.is_subset_of(outer, 1e-6).expect("subset"));
        }
    }

    #[test]
    fn exact_over_contains_exact_under() {
        let system = fixtures::bounded_double_integrator();
        let tube = box_tube(3);
        let sets = sets_of(&system);
        let solver = ClarabelSolver::default();
        let run = |approximation| {
            backward_tube(
                &system,
                &tube,
                &sets,
                &LagrangianMethod::Exact,
                approximation,
                &LagrangianOptions::default(),
                &solver,
            )
            .expect("exact tube must work")
        };
        let under = run(Approximation::Under);
        let over = run(Approximation::Over);
        for (inner, outer) in under.tube.sets().iter().zip(over.tube.sets()) {
            assert!(inner.is_subset_of(outer, 1e-7).expect("subset"));
        }
    }

    #[test]
    fn inflating_by_ellipsoid_covers_its_support() {
        let system = fixtures::double_integrator();
        let stage = system.stage(0).expect("stage");
        let target = Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box");
        let ball = BoundedSet::Ellipsoid(Ellipsoid::ball(DVector::zeros(2), 0.5).expect("ball"));
        let grown = inflate(&target, stage, &ball).expect("inflate");
        let l = DVector::from_vec(vec![1.0, 0.0]);
        assert!(grown.support(&l).expect("support") >= 1.5 - 1e-9);
        assert!(target.is_subset_of(&grown, 1e-9).expect("subset"));
    }

    #[test]
    fn ray_shooting_rejects_over_approximation() {
        let system = fixtures::bounded_double_integrator();
        let result = backward_tube(
            &system,
            &box_tube(1),
            &sets_of(&system),
            &LagrangianMethod::RayShooting {
                directions: circle_directions(4),
            },
            Approximation::Over,
            &LagrangianOptions::default(),
            &ClarabelSolver::default(),
        );
        assert!(matches!(result, Err(ReachError::InvalidArgument { .. })));
    }

    #[test]
    fn multiple_sets_emit_hull_warning() {
        let system = fixtures::bounded_double_integrator();
        let tube = box_tube(1);
        let sets = vec![
            BoundedSet::Polytope(Polytope::from_box(&[-0.1, -0.1], &[0.1, 0.1]).expect("box")),
            BoundedSet::Ellipsoid(Ellipsoid::ball(DVector::zeros(2), 0.1).expect("ball")),
        ];
        let result = backward_tube(
            &system,
            &tube,
            &sets,
            &LagrangianMethod::RayShooting {
                directions: circle_directions(8),
            },
            Approximation::Under,
            &LagrangianOptions::default(),
            &ClarabelSolver::default(),
        )
        .expect("ray tube must work");
        assert!(
            result
                .diagnostics
                .iter()
                .any(|e| e.kind == EventKind::Warning && e.component == Component::Lagrangian)
        );
    }

    #[test]
    fn gaussian_disturbance_is_converted() {
        let system = fixtures::double_integrator();
        let sets = bounded_disturbance_sets(&system, 0.8, 5, Approximation::Over).expect("sets");
        assert_eq!(sets.len(), 1);
        assert!(matches!(sets[0], BoundedSet::Ellipsoid(_)));
    }
}
