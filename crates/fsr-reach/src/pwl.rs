//! Piecewise-linear over-approximation of the normal quantile `Φ⁻¹(1 − δ)`
//! on `[lower_bound, 0.5]`.
//!
//! `δ ↦ Φ⁻¹(1 − δ)` is convex and decreasing on `(0, 0.5]`, so every chord
//! lies above the function on its own interval and below it elsewhere. The
//! maximum of the chords is therefore an over-approximation whose error on
//! each interval is the chord gap. Breakpoints are placed greedily from
//! `0.5` downwards, each interval as wide as the accuracy allows.

use fsr_runtime::RuntimeMode;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::error::{ReachResult, invalid};

/// Upper end of the risk domain; beyond it the quantile turns negative and
/// the chance constraint would no longer be convex.
pub const RISK_UPPER_BOUND: f64 = 0.5;

const GOLDEN_ITERATIONS: usize = 96;
const BISECTION_ITERATIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PwlOptions {
    pub mode: RuntimeMode,
    /// Maximum vertical gap between the bound and the quantile.
    pub accuracy: f64,
    /// Requested lower end of the risk domain.
    pub lower_bound: f64,
    pub max_segments: usize,
}

impl Default for PwlOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            accuracy: 1e-3,
            lower_bound: 1e-10,
            max_segments: 400,
        }
    }
}

/// One chord `m δ + c` valid on `[left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PwlSegment {
    pub left: f64,
    pub right: f64,
    pub slope: f64,
    pub intercept: f64,
    pub gap: f64,
}

impl PwlSegment {
    #[must_use]
    pub fn evaluate(&self, delta: f64) -> f64 {
        self.slope * delta + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseLinearBound {
    /// Ordered by decreasing `left`.
    segments: Vec<PwlSegment>,
    lower_bound: f64,
    max_gap: f64,
}

impl PiecewiseLinearBound {
    #[must_use]
    pub fn segments(&self) -> &[PwlSegment] {
        &self.segments
    }

    /// Achieved lower end of the domain; larger than requested when the
    /// segment cap was hit.
    #[must_use]
    pub const fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    #[must_use]
    pub const fn max_gap(&self) -> f64 {
        self.max_gap
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// `max_k (m_k δ + c_k)`.
    #[must_use]
    pub fn evaluate(&self, delta: f64) -> f64 {
        self.segments
            .iter()
            .map(|s| s.evaluate(delta))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Whether `delta` lies in the certified domain.
    #[must_use]
    pub fn in_domain(&self, delta: f64) -> bool {
        (self.lower_bound..=RISK_UPPER_BOUND).contains(&delta)
    }
}

/// `Φ⁻¹(p)` for the standard normal.
pub fn normal_quantile(p: f64) -> ReachResult<f64> {
    let normal = Normal::new(0.0, 1.0).map_err(|err| invalid(err.to_string()))?;
    Ok(normal.inverse_cdf(p))
}

/// `Φ⁻¹(1 − δ)`, evaluated through the lower tail for precision at small `δ`.
pub fn upper_quantile(delta: f64) -> ReachResult<f64> {
    Ok(-normal_quantile(delta)?)
}

pub fn inverse_cdf_bound(options: &PwlOptions) -> ReachResult<PiecewiseLinearBound> {
    crate::validation::validate_pwl_options(options)?;
    let normal = Normal::new(0.0, 1.0).map_err(|err| invalid(err.to_string()))?;
    let quantile = |delta: f64| -normal.inverse_cdf(delta);

    let mut segments = Vec::new();
    let mut right = RISK_UPPER_BOUND;
    while right > options.lower_bound && segments.len() < options.max_segments {
        let left = if chord_gap(&quantile, options.lower_bound, right) <= options.accuracy {
            options.lower_bound
        } else {
            widest_left(&quantile, options.lower_bound, right, options.accuracy)
        };
        segments.push(chord(&quantile, left, right));
        right = left;
    }
    if segments.is_empty() {
        return Err(invalid("inverse-CDF bound produced no segments"));
    }

    let lower_bound = right.max(options.lower_bound);
    let max_gap = segments.iter().map(|s| s.gap).fold(0.0, f64::max);
    if lower_bound > options.lower_bound {
        debug!(
            requested = options.lower_bound,
            achieved = lower_bound,
            "segment cap reached before the requested lower bound"
        );
    }
    debug!(segments = segments.len(), max_gap, "inverse-CDF bound built");
    Ok(PiecewiseLinearBound {
        segments,
        lower_bound,
        max_gap,
    })
}

fn chord(quantile: &impl Fn(f64) -> f64, left: f64, right: f64) -> PwlSegment {
    let (f_left, f_right) = (quantile(left), quantile(right));
    let slope = (f_right - f_left) / (right - left);
    PwlSegment {
        left,
        right,
        slope,
        intercept: f_left - slope * left,
        gap: chord_gap(quantile, left, right),
    }
}

/// `max_{δ ∈ [left, right]} chord(δ) − Φ⁻¹(1 − δ)`; the gap is concave, so a
/// golden-section search finds it.
fn chord_gap(quantile: &impl Fn(f64) -> f64, left: f64, right: f64) -> f64 {
    let (f_left, f_right) = (quantile(left), quantile(right));
    let slope = (f_right - f_left) / (right - left);
    let gap = |delta: f64| f_left + slope * (delta - left) - quantile(delta);

    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (left, right);
    let mut x1 = hi - ratio * (hi - lo);
    let mut x2 = lo + ratio * (hi - lo);
    let (mut g1, mut g2) = (gap(x1), gap(x2));
    for _ in 0..GOLDEN_ITERATIONS {
        if g1 < g2 {
            lo = x1;
            x1 = x2;
            g1 = g2;
            x2 = lo + ratio * (hi - lo);
            g2 = gap(x2);
        } else {
            hi = x2;
            x2 = x1;
            g2 = g1;
            x1 = hi - ratio * (hi - lo);
            g1 = gap(x1);
        }
    }
    g1.max(g2).max(0.0)
}

/// Smallest `left` in `[floor, right)` whose chord gap stays within
/// `accuracy`; bisection on `ln(left)` since the quantile varies over decades.
fn widest_left(quantile: &impl Fn(f64) -> f64, floor: f64, right: f64, accuracy: f64) -> f64 {
    let (mut too_wide, mut ok) = (floor.ln(), right.ln());
    for _ in 0..BISECTION_ITERATIONS {
        let mid = 0.5 * (too_wide + ok);
        if chord_gap(quantile, mid.exp(), right) <= accuracy {
            ok = mid;
        } else {
            too_wide = mid;
        }
    }
    // Guard against a zero-width segment when the quantile is near-linear.
    ok.exp().min(right * (1.0 - 1e-12))
}
