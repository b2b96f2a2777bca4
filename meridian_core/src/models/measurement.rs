// meridian_core/src/models/measurement.rs

use crate::manifold::Manifold;
use crate::types::{CovMatrix, DifVector};
use dyn_clone::DynClone;
use std::fmt::Debug;

// --- MEASUREMENT MODEL TRAIT ---
// Represents the mathematical model of a sensor on a manifold:
// `y = h(x, z, n)`, where `x` is the state, `z` the raw measurement, and `n`
// a flat Gaussian nuisance vector. The innovation `y` lives on its own
// manifold and is reduced to a residual against a fixed reference element by
// the update engine.
//
// `S` is the state manifold, `Y` the innovation manifold, and `M` the opaque
// raw-measurement type. Implementations must be deterministic and
// differentiable at the evaluated point.
pub trait MeasurementModel<S: Manifold, Y: Manifold, M>: DynClone + Debug + Send + Sync {
    /// Dimension D_x of the state tangent space.
    fn state_dim(&self) -> usize;

    /// Dimension D_y of the innovation tangent space.
    fn inn_dim(&self) -> usize;

    /// Dimension D_n of the measurement-noise vector.
    fn noise_dim(&self) -> usize;

    /// Evaluates the model: `y = h(x, z, n)`.
    fn evaluate(&self, state: &S, meas: &M, noise: &DifVector) -> Y;

    /// Jacobian of `h` with respect to the state, `D_y × D_x`.
    fn jacobian_state(&self, state: &S, meas: &M) -> CovMatrix;

    /// Jacobian of `h` with respect to the noise, `D_y × D_n`.
    fn jacobian_noise(&self, state: &S, meas: &M) -> CovMatrix;
}

// Generates `Clone` for boxed measurement models.
dyn_clone::clone_trait_object!(<S: Manifold, Y: Manifold, M> MeasurementModel<S, Y, M>);
