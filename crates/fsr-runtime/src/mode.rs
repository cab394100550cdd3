#![forbid(unsafe_code)]

//! Runtime mode definitions for Strict and Hardened operation.

use serde::{Deserialize, Serialize};

/// Operational mode governing validation strictness.
///
/// - **Strict**: validate shapes always, finite values only when the caller
///   asks for it through `check_finite`.
/// - **Hardened**: always reject NaN/Inf inputs, and treat non-finite solver
///   output as a solver failure instead of passing it downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeMode {
    #[default]
    Strict,
    Hardened,
}

impl RuntimeMode {
    /// Whether finite-value checks must run for a call with the given flag.
    #[must_use]
    pub const fn must_check_finite(self, check_finite: bool) -> bool {
        check_finite || matches!(self, Self::Hardened)
    }
}
