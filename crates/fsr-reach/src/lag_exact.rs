//! Exact one-step operator `A⁻¹ (Y ⊕ (−B U))` by vertex algebra.

use fsr_geometry::Polytope;
use fsr_linalg::reciprocal_condition;

use crate::error::{ReachError, ReachResult};
use crate::system::StageMatrices;

pub(crate) fn exact_one_step(
    eroded: &Polytope,
    stage: &StageMatrices,
    input_space: &Polytope,
    t: usize,
) -> ReachResult<Polytope> {
    if reciprocal_condition(&stage.a)? < f64::EPSILON {
        return Err(ReachError::SingularMatrix { stage: t });
    }
    let steered = input_space.image(&(-&stage.b))?;
    Ok(eroded.minkowski_sum(&steered)?.preimage(&stage.a)?)
}
