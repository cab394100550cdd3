//! Gaussian-integration certifier: probability that a Gaussian vector lies
//! in a polytope, refined until the oracle's error estimate meets the
//! requested accuracy.

use fsr_geometry::Polytope;
use fsr_linalg::{psd_factor, validate_finite_matrix, validate_finite_vector};
use fsr_runtime::{Component, DiagnosticLedger, EventKind, ReachEvent, RuntimeMode};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{ReachError, ReachResult, invalid};
use crate::moments::GaussianMoments;
use crate::validation::validate_certifier_options;

/// Estimate returned by a [`GaussianCdfOracle`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleEstimate {
    pub probability: f64,
    /// Error bound of the estimate (oracle specific; three standard errors
    /// for [`MonteCarloOracle`]).
    pub error: f64,
}

/// Multivariate Gaussian probability of a polytope.
pub trait GaussianCdfOracle {
    /// `P(X ∈ region)` for `X ~ N(mean, covariance)` using about `samples`
    /// evaluations. `attempt` distinguishes refinement rounds.
    fn estimate(
        &self,
        mean: &DVector<f64>,
        covariance: &DMatrix<f64>,
        region: &Polytope,
        samples: usize,
        attempt: usize,
    ) -> ReachResult<OracleEstimate>;
}

impl<T: GaussianCdfOracle + ?Sized> GaussianCdfOracle for &T {
    fn estimate(
        &self,
        mean: &DVector<f64>,
        covariance: &DMatrix<f64>,
        region: &Polytope,
        samples: usize,
        attempt: usize,
    ) -> ReachResult<OracleEstimate> {
        (**self).estimate(mean, covariance, region, samples, attempt)
    }
}

/// Seeded Monte Carlo oracle. The same seed gives the same samples on every
/// call, so objectives built on it are deterministic in their arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonteCarloOracle {
    pub seed: u64,
}

impl MonteCarloOracle {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl GaussianCdfOracle for MonteCarloOracle {
    fn estimate(
        &self,
        mean: &DVector<f64>,
        covariance: &DMatrix<f64>,
        region: &Polytope,
        samples: usize,
        attempt: usize,
    ) -> ReachResult<OracleEstimate> {
        if samples == 0 {
            return Err(invalid("Monte Carlo oracle needs at least one sample"));
        }
        if region.dim() != mean.len() {
            return Err(invalid(format!(
                "region has dimension {}, mean has length {}",
                region.dim(),
                mean.len()
            )));
        }
        let factor = psd_factor(covariance)?;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(attempt as u64));
        let dim = mean.len();
        let mut hits = 0usize;
        for _ in 0..samples {
            let z = DVector::<f64>::from_fn(dim, |_, _| StandardNormal.sample(&mut rng));
            if region.contains(&(mean + &factor * z), 0.0) {
                hits += 1;
            }
        }
        let n = samples as f64;
        let probability = hits as f64 / n;
        // Three standard errors, floored by the rule of three at the ends.
        let error = (3.0 * (probability * (1.0 - probability) / n).sqrt()).max(3.0 / n);
        Ok(OracleEstimate { probability, error })
    }
}

/// With [`MonteCarloOracle`] the sample count needed grows as
/// `(3 / desired_accuracy)²`: the default accuracy settles within 64 000
/// samples per certification at any probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CertifierOptions {
    pub mode: RuntimeMode,
    pub check_finite: bool,
    pub desired_accuracy: f64,
    pub initial_samples: usize,
    pub sample_growth: usize,
    pub max_attempts: usize,
    pub seed: u64,
}

impl Default for CertifierOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            check_finite: true,
            desired_accuracy: 1e-2,
            initial_samples: 1_000,
            sample_growth: 4,
            max_attempts: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertifierReport {
    /// Estimate, clamped up to `desired_accuracy` when smaller.
    pub probability: f64,
    pub raw_probability: f64,
    pub error: f64,
    pub samples: usize,
    pub attempts: usize,
    pub clamped: bool,
    pub diagnostics: Vec<ReachEvent>,
}

/// `P(X ∈ region)` within `desired_accuracy`, growing the sample count by
/// `sample_growth` per attempt.
pub fn certify_probability(
    mean: &DVector<f64>,
    covariance: &DMatrix<f64>,
    region: &Polytope,
    options: &CertifierOptions,
    oracle: &dyn GaussianCdfOracle,
) -> ReachResult<CertifierReport> {
    validate_certifier_options(options)?;
    validate_finite_vector(mean, options.mode, options.check_finite)?;
    validate_finite_matrix(covariance, options.mode, options.check_finite)?;
    let mut ledger = DiagnosticLedger::new(options.max_attempts + 1);
    let mut samples = options.initial_samples;
    let mut last_error = f64::INFINITY;
    for attempt in 0..options.max_attempts {
        let estimate = oracle.estimate(mean, covariance, region, samples, attempt)?;
        last_error = estimate.error;
        ledger.record(
            ReachEvent::progress(Component::Certifier, attempt)
                .with_metric("samples", samples as f64)
                .with_metric("probability", estimate.probability)
                .with_metric("error", estimate.error),
        );
        if estimate.error <= options.desired_accuracy {
            let clamped = estimate.probability < options.desired_accuracy;
            let probability = if clamped {
                options.desired_accuracy
            } else {
                estimate.probability
            };
            ledger.record(
                ReachEvent::new(Component::Certifier, attempt, EventKind::Converged)
                    .with_metric("probability", probability),
            );
            return Ok(CertifierReport {
                probability,
                raw_probability: estimate.probability,
                error: estimate.error,
                samples,
                attempts: attempt + 1,
                clamped,
                diagnostics: ledger.into_events(),
            });
        }
        samples = samples.saturating_mul(options.sample_growth);
    }
    Err(ReachError::IntegrationDidNotConverge {
        requested: options.desired_accuracy,
        achieved: last_error,
        attempts: options.max_attempts,
    })
}

/// Membership probability of a set of Gaussian moments.
pub fn membership_probability(
    moments: &GaussianMoments,
    region: &Polytope,
    options: &CertifierOptions,
    oracle: &dyn GaussianCdfOracle,
) -> ReachResult<CertifierReport> {
    certify_probability(&moments.mean, &moments.covariance, region, options, oracle)
}
