//! Single dispatch point over computation methods.
//!
//! [`reach_point`] and [`reach_set`] build the default collaborators (Clarabel
//! solver, seeded Monte Carlo oracle, compass search) from [`ReachOptions`];
//! the `_with` variants take caller-supplied ones.

use fsr_conic::{ClarabelSettings, ClarabelSolver, ConicSolver};
use fsr_geometry::Polytope;
use fsr_runtime::{Component, EventKind, ReachEvent, RuntimeMode};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::chance::{ChanceOpenOptions, chance_open_point};
use crate::chance_affine::{ChanceAffineOptions, chance_affine_point};
use crate::dfo::{DerivativeFreeOptimizer, PatternSearch, PatternSearchOptions};
use crate::error::{ReachResult, invalid};
use crate::genz::{CertifierOptions, GaussianCdfOracle, MonteCarloOracle};
use crate::genz_open::{GenzOpenOptions, genz_open_point};
use crate::lagrangian::{
    Approximation, BackwardTube, LagrangianMethod, LagrangianOptions, SupportDiagnostics,
    backward_tube, bounded_disturbance_sets,
};
use crate::outcome::{NoCertificateReason, PointOutcome, PointResult};
use crate::pwl::PwlOptions;
use crate::set_search::{
    BoundaryPoint, CertifiedPoint, SetSearchOptions, chance_open_set, genz_open_set,
};
use crate::system::LinearSystem;
use crate::tube::SafetyTube;
use crate::validation::validate_threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointMethod {
    ChanceOpen,
    ChanceAffine,
    GenzOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetMethod {
    ChanceOpen,
    GenzOpen,
    LagUnder(LagrangianMethod),
    LagOver(LagrangianMethod),
}

impl SetMethod {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChanceOpen => "chance_open",
            Self::GenzOpen => "genz_open",
            Self::LagUnder(_) => "lag_under",
            Self::LagOver(_) => "lag_over",
        }
    }
}

/// Options shared by every method. `mode` and `check_finite` override the
/// per-method settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    /// Point certificates below this become `BelowThreshold`.
    pub point_threshold: Option<f64>,
    pub pwl: PwlOptions,
    pub affine: ChanceAffineOptions,
    pub certifier: CertifierOptions,
    pub pattern: PatternSearchOptions,
    /// Threshold, directions and bisection settings of the set searches; its
    /// threshold also sizes the confidence ellipsoid of the Lagrangian sets.
    pub search: SetSearchOptions,
    pub lagrangian: LagrangianOptions,
    pub solver: ClarabelSettings,
}

impl Default for ReachOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            point_threshold: None,
            pwl: PwlOptions::default(),
            affine: ChanceAffineOptions::default(),
            certifier: CertifierOptions::default(),
            pattern: PatternSearchOptions::default(),
            search: SetSearchOptions::default(),
            lagrangian: LagrangianOptions::default(),
            solver: ClarabelSettings::default(),
        }
    }
}

impl ReachOptions {
    /// Parse options from JSON; absent fields keep their defaults.
    pub fn from_json(text: &str) -> ReachResult<Self> {
        serde_json::from_str(text).map_err(|err| invalid(format!("options JSON: {err}")))
    }

    fn chance_open(&self) -> ChanceOpenOptions {
        ChanceOpenOptions {
            mode: self.mode,
            check_finite: self.check_finite,
            pwl: self.pwl,
        }
    }

    fn chance_affine(&self) -> ChanceAffineOptions {
        ChanceAffineOptions {
            mode: self.mode,
            check_finite: self.check_finite,
            pwl: self.pwl,
            ..self.affine
        }
    }

    fn genz_open(&self) -> GenzOpenOptions {
        GenzOpenOptions {
            mode: self.mode,
            check_finite: self.check_finite,
            certifier: self.certifier,
            pattern: self.pattern,
            chebyshev_radius_cap: self.search.chebyshev_radius_cap,
        }
    }

    fn set_search(&self) -> SetSearchOptions {
        SetSearchOptions {
            mode: self.mode,
            check_finite: self.check_finite,
            pwl: self.pwl,
            certifier: self.certifier,
            pattern: self.pattern,
            ..self.search.clone()
        }
    }

    fn lagrangian(&self) -> LagrangianOptions {
        LagrangianOptions {
            mode: self.mode,
            check_finite: self.check_finite,
            ..self.lagrangian
        }
    }

    fn solver(&self) -> ClarabelSolver {
        ClarabelSolver::new(ClarabelSettings {
            mode: self.mode,
            ..self.solver
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetResult {
    /// Certified initial-state region; `None` when empty.
    pub polytope: Option<Polytope>,
    /// Maximal point of the set searches.
    pub max_point: Option<CertifiedPoint>,
    pub boundary: Vec<BoundaryPoint>,
    /// Full backward tube of the Lagrangian methods.
    pub backward_tube: Option<BackwardTube>,
    pub support: Vec<SupportDiagnostics>,
    pub diagnostics: Vec<ReachEvent>,
}

pub fn reach_point(
    method: PointMethod,
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    options: &ReachOptions,
) -> ReachResult<PointResult> {
    let solver = options.solver();
    let oracle = MonteCarloOracle::new(options.certifier.seed);
    let optimizer = PatternSearch::new(options.pattern);
    reach_point_with(method, system, tube, x0, options, &solver, &oracle, &optimizer)
}

#[allow(clippy::too_many_arguments)]
pub fn reach_point_with(
    method: PointMethod,
    system: &LinearSystem,
    tube: &SafetyTube,
    x0: &DVector<f64>,
    options: &ReachOptions,
    solver: &dyn ConicSolver,
    oracle: &dyn GaussianCdfOracle,
    optimizer: &dyn DerivativeFreeOptimizer,
) -> ReachResult<PointResult> {
    if let Some(threshold) = options.point_threshold {
        validate_threshold(threshold)?;
    }
    let mut result = match method {
        PointMethod::ChanceOpen => {
            chance_open_point(system, tube, x0, &options.chance_open(), solver)?
        }
        PointMethod::ChanceAffine => {
            chance_affine_point(system, tube, x0, &options.chance_affine(), solver)?
        }
        PointMethod::GenzOpen => genz_open_point(
            system,
            tube,
            x0,
            &options.genz_open(),
            oracle,
            optimizer,
            solver,
        )?,
    };
    if let (Some(threshold), Some(probability)) = (options.point_threshold, result.probability())
        && probability < threshold
    {
        let event = ReachEvent::new(Component::Certifier, 0, EventKind::Terminated)
            .with_metric("probability", probability)
            .with_metric("threshold", threshold)
            .with_message("certified probability below threshold");
        result.diagnostics.push(event);
        result.outcome = PointOutcome::none(
            NoCertificateReason::BelowThreshold,
            format!("certified probability {probability} below threshold {threshold}"),
        );
    }
    Ok(result)
}

/// `initial_set` restricts the searched (or returned) initial states; the
/// set searches require it.
pub fn reach_set(
    method: &SetMethod,
    system: &LinearSystem,
    tube: &SafetyTube,
    initial_set: Option<&Polytope>,
    options: &ReachOptions,
) -> ReachResult<SetResult> {
    let solver = options.solver();
    let oracle = MonteCarloOracle::new(options.certifier.seed);
    let optimizer = PatternSearch::new(options.pattern);
    reach_set_with(
        method,
        system,
        tube,
        initial_set,
        options,
        &solver,
        &oracle,
        &optimizer,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn reach_set_with(
    method: &SetMethod,
    system: &LinearSystem,
    tube: &SafetyTube,
    initial_set: Option<&Polytope>,
    options: &ReachOptions,
    solver: &dyn ConicSolver,
    oracle: &dyn GaussianCdfOracle,
    optimizer: &dyn DerivativeFreeOptimizer,
) -> ReachResult<SetResult> {
    match method {
        SetMethod::ChanceOpen | SetMethod::GenzOpen => {
            let Some(initial) = initial_set else {
                return Err(invalid(format!(
                    "{} set search needs an initial set",
                    method.name()
                )));
            };
            let search = options.set_search();
            let found = if matches!(method, SetMethod::ChanceOpen) {
                chance_open_set(system, tube, initial, &search, solver)?
            } else {
                genz_open_set(system, tube, initial, &search, oracle, optimizer, solver)?
            };
            Ok(SetResult {
                polytope: found.polytope,
                max_point: found.max_point,
                boundary: found.boundary,
                backward_tube: None,
                support: Vec::new(),
                diagnostics: found.diagnostics,
            })
        }
        SetMethod::LagUnder(lag) | SetMethod::LagOver(lag) => {
            let approximation = if matches!(method, SetMethod::LagUnder(_)) {
                Approximation::Under
            } else {
                Approximation::Over
            };
            let sets = bounded_disturbance_sets(
                system,
                options.search.threshold,
                tube.horizon(),
                approximation,
            )?;
            let computed = backward_tube(
                system,
                tube,
                &sets,
                lag,
                approximation,
                &options.lagrangian(),
                solver,
            )?;
            let mut first = computed.tube.initial().clone();
            if let Some(initial) = initial_set {
                first = first.intersect(initial)?;
            }
            let polytope = if first.is_empty()? { None } else { Some(first) };
            Ok(SetResult {
                polytope,
                max_point: None,
                boundary: Vec::new(),
                backward_tube: Some(computed.tube),
                support: computed.support,
                diagnostics: computed.diagnostics,
            })
        }
    }
}
