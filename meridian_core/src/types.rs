// meridian_core/src/types.rs

use nalgebra::{DMatrix, DVector};

// --- Core Type Aliases ---

/// A covariance (or Jacobian/gain) matrix. Always paired with the reference
/// state it was linearized about.
pub type CovMatrix = DMatrix<f64>;

/// A flat tangent-space difference vector. Manifold elements may be curved,
/// but their local differences are always plain real vectors.
pub type DifVector = DVector<f64>;
