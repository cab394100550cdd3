#![forbid(unsafe_code)]

//! Stochastic reachability of discrete-time linear systems.
//!
//! Given `x_{t+1} = A_t x_t + B_t u_t + F_t w_t` and a safety tube
//! `S_0, .., S_N`, the crate certifies the probability of staying in the
//! tube from a point, or the set of initial states whose certified
//! probability exceeds a threshold.
//!
//! ## Module layout
//!
//! | Module           | Contents                                                   |
//! |------------------|------------------------------------------------------------|
//! | `system`         | [`LinearSystem`], disturbance and initial-state models     |
//! | `tube`           | [`SafetyTube`] and its stacked rows                        |
//! | `concat`         | stacked dynamics `X = Z x_0 + H U + G W`                   |
//! | `moments`        | trajectory mean / covariance, open-loop and affine policy  |
//! | `pwl`            | piecewise-linear upper bound of `Φ⁻¹(1 − δ)`               |
//! | `chance`         | open-loop chance-constrained point certificate             |
//! | `chance_affine`  | affine disturbance-feedback certificate (DC iteration)     |
//! | `genz`           | Gaussian-integration certifier and its oracle seam         |
//! | `genz_open`      | open-loop certificate by direct integration                |
//! | `dfo`            | derivative-free optimizer seam and compass search          |
//! | `lagrangian`     | robust backward tubes (exact, ray shooting, support)       |
//! | `lag_controller` | one-step inputs along an under-approximation tube          |
//! | `set_search`     | certified initial-state sets from point certificates       |
//! | `simulate`       | seeded Monte Carlo validation                              |
//! | `api`            | [`reach_point`] / [`reach_set`] dispatch                   |
//! | `validation`     | argument checks shared by the entry points                 |

pub mod api;
pub mod chance;
pub mod chance_affine;
pub mod concat;
pub mod dfo;
pub mod error;
pub mod genz;
pub mod genz_open;
mod lag_exact;
mod lag_ray;
mod lag_support;
pub mod lag_controller;
pub mod lagrangian;
pub mod moments;
pub mod outcome;
pub mod pwl;
pub mod set_search;
pub mod simulate;
pub mod system;
pub mod tube;
pub mod validation;

// ── Re-exports: preserve the flat public API ────────────────────────
pub use api::{
    PointMethod, ReachOptions, SetMethod, SetResult, reach_point, reach_point_with, reach_set,
    reach_set_with,
};
pub use chance::{ChanceOpenOptions, chance_open_point};
pub use chance_affine::{ChanceAffineOptions, chance_affine_point};
pub use concat::{ConcatenatedDynamics, concatenate};
pub use dfo::{DerivativeFreeOptimizer, DfoResult, PatternSearch, PatternSearchOptions};
pub use error::{ReachError, ReachResult};
pub use genz::{
    CertifierOptions, CertifierReport, GaussianCdfOracle, MonteCarloOracle, OracleEstimate,
    certify_probability, membership_probability,
};
pub use genz_open::{GenzOpenOptions, genz_open_point};
pub use lag_controller::LagrangianController;
pub use lagrangian::{
    Approximation, BackwardTube, LagrangianMethod, LagrangianOptions, LagrangianResult,
    SupportDiagnostics, backward_tube, bounded_disturbance_sets, confidence_ellipsoid,
};
pub use moments::{
    GaussianMoments, affine_input_moments, affine_policy_moments, full_trajectory_moments,
    state_moments, trajectory_moments,
};
pub use outcome::{
    Controller, NoCertificateReason, PointCertificate, PointOutcome, PointResult, RiskAllocation,
};
pub use pwl::{
    PiecewiseLinearBound, PwlOptions, PwlSegment, inverse_cdf_bound, normal_quantile,
    upper_quantile,
};
pub use set_search::{
    BoundaryPoint, CertifiedPoint, SearchSeed, SetSearchOptions, SetSearchResult,
    chance_open_set, genz_open_set,
};
pub use simulate::{SimulationOptions, ValidationReport, monte_carlo_validation};
pub use system::{Disturbance, Dynamics, InitialState, LinearSystem, StageMatrices};
pub use tube::{SafetyTube, TubeRow};
