// meridian_core/src/manifold.rs

use crate::types::DifVector;
use nalgebra::DVector;

// --- MANIFOLD CONTRACT ---
// The minimal algebra a state or innovation type must provide for the update
// engine to work with it. `boxplus` maps a point and a flat perturbation back
// onto the manifold (a retraction); `boxminus` recovers the perturbation that
// carries `self` to another point.
//
// Required identities (within numerical tolerance, inside the chart where the
// retraction is invertible):
//   a.boxplus(&a.boxminus(&b)) == b
//   a.boxminus(&a.boxplus(&d)) == d
pub trait Manifold: Clone {
    /// Dimension of the local tangent space.
    fn dim(&self) -> usize;

    /// Retraction: `self ⊞ delta`.
    fn boxplus(&self, delta: &DifVector) -> Self;

    /// Inverse retraction: the tangent vector at `self` that reaches `other`,
    /// a flat vector of dimension [`Manifold::dim`].
    fn boxminus(&self, other: &Self) -> DifVector;
}

/// Plain Euclidean vectors are the trivial manifold. Noise vectors, update
/// vectors, and flat states all use this impl.
impl Manifold for DVector<f64> {
    fn dim(&self) -> usize {
        self.nrows()
    }

    fn boxplus(&self, delta: &DifVector) -> Self {
        self + delta
    }

    fn boxminus(&self, other: &Self) -> DifVector {
        other - self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn euclidean_boxplus_boxminus_round_trip() {
        let a = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let b = DVector::from_vec(vec![-0.3, 4.0, 2.5]);
        let d = DVector::from_vec(vec![0.1, 0.2, -0.7]);

        let back = a.boxplus(&a.boxminus(&b));
        for i in 0..3 {
            assert_abs_diff_eq!(back[i], b[i], epsilon = 1e-12);
        }

        let d_back = a.boxminus(&a.boxplus(&d));
        for i in 0..3 {
            assert_abs_diff_eq!(d_back[i], d[i], epsilon = 1e-12);
        }
    }
}
