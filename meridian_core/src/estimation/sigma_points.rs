// meridian_core/src/estimation/sigma_points.rs

use crate::errors::FilterError;
use crate::manifold::Manifold;
use crate::types::{CovMatrix, DifVector};
use nalgebra::{Cholesky, DVector};
use serde::{Deserialize, Serialize};

/// Spread parameters for the scaled unscented transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnscentedParams {
    /// Spreading of the sigma points, in (0, 1].
    pub alpha: f64,
    /// Prior-distribution knowledge term (2.0 is optimal for Gaussians).
    pub beta: f64,
    /// Secondary scaling parameter.
    pub kappa: f64,
}

impl Default for UnscentedParams {
    fn default() -> Self {
        Self {
            alpha: 1e-3,
            beta: 2.0,
            kappa: 0.0,
        }
    }
}

// Iterative manifold-mean recovery has no closed form; these bound it.
const MEAN_MAX_ITERATIONS: usize = 20;
const MEAN_CONVERGENCE_TOL: f64 = 1e-12;

/// A deterministic, weighted set of `2*dim + 1` manifold samples embedded in
/// a shared index space of length `2*aug_dim + 1` at a given offset.
///
/// Several sets of different sizes cooperate over one augmented quadrature:
/// indexing a set outside its own slot range yields its central sample (zero
/// deviation), which is what keeps mean/covariance sums over the full index
/// space consistent between, say, a state set and a noise set.
#[derive(Debug, Clone)]
pub struct SigmaPointSet<Mf: Manifold> {
    samples: Vec<Mf>,
    /// Number of perturbed directions; the set holds `2*dim + 1` samples.
    dim: usize,
    /// Augmented dimension L of the shared index space.
    aug_dim: usize,
    /// Placement of this set's slots within the shared index space.
    offset: usize,
    w_mean_center: f64,
    w_cov_center: f64,
    w_side: f64,
    gamma: f64,
}

impl<Mf: Manifold> SigmaPointSet<Mf> {
    /// Allocates an empty set. Samples are filled by one of the `compute_*`
    /// operations (or [`SigmaPointSet::set_samples`]) before any statistics
    /// are read.
    pub fn new(dim: usize, aug_dim: usize, offset: usize) -> Self {
        let mut set = Self {
            samples: Vec::with_capacity(2 * dim + 1),
            dim,
            aug_dim,
            offset,
            w_mean_center: 0.0,
            w_cov_center: 0.0,
            w_side: 0.0,
            gamma: 0.0,
        };
        set.compute_parameter(&UnscentedParams::default());
        set
    }

    /// Builds a set from externally produced samples (the seam an external
    /// prediction step uses to populate [`PredictionCoupling`]).
    ///
    /// [`PredictionCoupling`]: crate::estimation::PredictionCoupling
    pub fn from_samples(
        samples: Vec<Mf>,
        aug_dim: usize,
        offset: usize,
        params: &UnscentedParams,
    ) -> Self {
        assert!(
            samples.len() % 2 == 1,
            "a sigma point set holds an odd number of samples"
        );
        let dim = (samples.len() - 1) / 2;
        let mut set = Self::new(dim, aug_dim, offset);
        set.compute_parameter(params);
        set.samples = samples;
        set
    }

    /// Number of actual samples held by this set.
    pub fn sample_count(&self) -> usize {
        2 * self.dim + 1
    }

    /// Length of the shared index space all cooperating sets agree on.
    pub fn index_len(&self) -> usize {
        2 * self.aug_dim + 1
    }

    pub fn aug_dim(&self) -> usize {
        self.aug_dim
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Spread factor `γ = √(L + λ)` applied to covariance square-root columns.
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Whether the samples have been filled (by a `compute_*` operation,
    /// [`SigmaPointSet::set_samples`] or [`SigmaPointSet::from_samples`]).
    pub fn is_populated(&self) -> bool {
        self.samples.len() == self.sample_count()
    }

    /// Sample at index `i` of the shared index space. Indices outside this
    /// set's slot range clamp to the central sample.
    pub fn at(&self, i: usize) -> &Mf {
        debug_assert!(i < self.index_len());
        debug_assert!(!self.samples.is_empty(), "sigma points not computed yet");
        if i >= self.offset && i < self.offset + self.sample_count() {
            &self.samples[i - self.offset]
        } else {
            &self.samples[0]
        }
    }

    /// Recomputes the scaled-unscented weights from the spread parameters and
    /// the augmented dimension: `λ = α²(L + κ) − L`.
    pub fn compute_parameter(&mut self, params: &UnscentedParams) {
        let l = self.aug_dim as f64;
        let lambda = params.alpha * params.alpha * (l + params.kappa) - l;
        self.w_mean_center = lambda / (l + lambda);
        self.w_cov_center =
            self.w_mean_center + (1.0 - params.alpha * params.alpha + params.beta);
        self.w_side = 0.5 / (l + lambda);
        self.gamma = (l + lambda).sqrt();
    }

    /// Samples a Gaussian on the manifold: the mean, then `mean ⊞ (±γ·Lᵢ)`
    /// for every column of the covariance square root.
    pub fn compute_from_gaussian(
        &mut self,
        mean: &Mf,
        cov: &CovMatrix,
    ) -> Result<(), FilterError> {
        debug_assert_eq!(cov.nrows(), self.dim);
        debug_assert_eq!(cov.ncols(), self.dim);
        let chol = Cholesky::new(cov.clone()).ok_or(FilterError::NotPositiveDefinite)?;
        let root = chol.l() * self.gamma;

        self.samples.clear();
        self.samples.push(mean.clone());
        for i in 0..self.dim {
            self.samples.push(mean.boxplus(&root.column(i).into_owned()));
        }
        for i in 0..self.dim {
            self.samples
                .push(mean.boxplus(&(-root.column(i)).into_owned()));
        }
        Ok(())
    }

    /// Replaces the samples wholesale (used after propagating another set
    /// through a model). The count must match this set's slot range.
    pub fn set_samples(&mut self, samples: Vec<Mf>) {
        assert_eq!(samples.len(), self.sample_count());
        self.samples = samples;
    }

    fn w_mean(&self, i: usize) -> f64 {
        if i == 0 {
            self.w_mean_center
        } else {
            self.w_side
        }
    }

    fn w_cov(&self, i: usize) -> f64 {
        if i == 0 {
            self.w_cov_center
        } else {
            self.w_side
        }
    }

    /// Weighted manifold mean, recovered by iterative retraction.
    pub fn mean(&self) -> Mf {
        let mut mean = self.samples[0].clone();
        for _ in 0..MEAN_MAX_ITERATIONS {
            let mut delta = DVector::zeros(mean.dim());
            for i in 0..self.index_len() {
                delta += self.w_mean(i) * mean.boxminus(self.at(i));
            }
            mean = mean.boxplus(&delta);
            if delta.norm() < MEAN_CONVERGENCE_TOL {
                break;
            }
        }
        mean
    }

    /// Weighted covariance of the set about `mean`, via `boxminus` outer
    /// products over the full index space.
    pub fn covariance(&self, mean: &Mf) -> CovMatrix {
        let d = mean.dim();
        let mut cov = CovMatrix::zeros(d, d);
        for i in 0..self.index_len() {
            let dev = mean.boxminus(self.at(i));
            cov += self.w_cov(i) * &dev * dev.transpose();
        }
        cov
    }

    /// Weighted cross-covariance against a compatible set sharing the same
    /// index space.
    pub fn cross_covariance<O: Manifold>(
        &self,
        mean: &Mf,
        other: &SigmaPointSet<O>,
        other_mean: &O,
    ) -> CovMatrix {
        assert_eq!(
            self.aug_dim, other.aug_dim,
            "cross-covariance requires sets over the same index space"
        );
        let mut cov = CovMatrix::zeros(mean.dim(), other_mean.dim());
        for i in 0..self.index_len() {
            let dev = mean.boxminus(self.at(i));
            let other_dev = other_mean.boxminus(other.at(i));
            cov += self.w_cov(i) * &dev * other_dev.transpose();
        }
        cov
    }
}

impl SigmaPointSet<DifVector> {
    /// Samples a zero-mean Gaussian over a flat noise vector.
    pub fn compute_from_zero_mean_gaussian(&mut self, cov: &CovMatrix) -> Result<(), FilterError> {
        let zero = DVector::zeros(self.dim);
        self.compute_from_gaussian(&zero, cov)
    }

    /// Enlarges an existing zero-mean noise set with an additional noise
    /// block correlated with it through `cross_cov`.
    ///
    /// Conditional-Gaussian construction: with the joint distribution
    /// `(p, n) ~ N(0, [[Qp, Qxn], [Qxnᵗ, Qn]])` and `p` the base block, the
    /// new block is `n = Qxnᵗ·Qp⁻¹·p + e` with `e` independent of `p` and
    /// `Cov(e) = Qn − Qxnᵗ·Qp⁻¹·Qxn` (the Schur complement). This set spans
    /// the base slots and its own: at a base-deviation index it carries the
    /// conditional mean `Qxnᵗ·Qp⁻¹·dev`, in its own slots the deviations of
    /// `e`. Summed over the shared index space the samples reproduce `Qn`
    /// and the cross-covariance `Qxn` against the base exactly.
    ///
    /// Requires `self.dim == base.dim + extra_dim`, the same index space and
    /// the same offset as `base` (the base slots are re-described here), and
    /// a populated base.
    pub fn extend_zero_mean(
        &mut self,
        base: &SigmaPointSet<DifVector>,
        extra_cov: &CovMatrix,
        cross_cov: &CovMatrix,
    ) -> Result<(), FilterError> {
        let extra_dim = extra_cov.nrows();
        if self.aug_dim != base.aug_dim
            || self.offset != base.offset
            || self.dim != base.dim + extra_dim
            || cross_cov.nrows() != base.dim
            || cross_cov.ncols() != extra_dim
        {
            return Err(FilterError::CouplingDimensionMismatch);
        }
        if !base.is_populated() {
            return Err(FilterError::MissingCoupling);
        }

        // The base's positive deviations are the columns of γ·Lp, so
        // B = (γ·Lp)⁻¹·Qxn gives the conditional terms without refactoring:
        // conditional mean at slot ±j is ±γ²·Bᵗ·eⱼ and
        // Qxnᵗ·Qp⁻¹·Qxn = γ²·Bᵗ·B.
        let mut scaled_root = CovMatrix::zeros(base.dim, base.dim);
        for j in 0..base.dim {
            scaled_root.set_column(j, &base.samples[1 + j]);
        }
        let b = scaled_root
            .solve_lower_triangular(cross_cov)
            .ok_or(FilterError::NotPositiveDefinite)?;
        let gamma2 = self.gamma * self.gamma;
        let schur = extra_cov - gamma2 * b.transpose() * &b;
        let chol = Cholesky::new(schur).ok_or(FilterError::NotPositiveDefinite)?;
        let root = chol.l() * self.gamma;

        // Sample order follows the global slot layout: the base's +/-
        // deviation slots first, then this block's own.
        self.samples.clear();
        self.samples.push(DVector::zeros(extra_dim));
        for j in 0..base.dim {
            self.samples.push(gamma2 * b.row(j).transpose());
        }
        for j in 0..base.dim {
            self.samples.push(-gamma2 * b.row(j).transpose());
        }
        for i in 0..extra_dim {
            self.samples.push(root.column(i).into_owned());
        }
        for i in 0..extra_dim {
            self.samples.push((-root.column(i)).into_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector};

    fn params() -> UnscentedParams {
        UnscentedParams {
            alpha: 0.5,
            beta: 2.0,
            kappa: 0.0,
        }
    }

    #[test]
    fn mean_weights_sum_to_one_over_index_space() {
        let mut set = SigmaPointSet::<DVector<f64>>::new(2, 5, 3);
        set.compute_parameter(&params());
        let mut sum = set.w_mean(0);
        for i in 1..set.index_len() {
            sum += set.w_mean(i);
        }
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn recovers_gaussian_mean_and_covariance() {
        let mean = DVector::from_vec(vec![1.0, -2.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[0.8, 0.2, 0.2, 0.5]);

        let mut set = SigmaPointSet::<DVector<f64>>::new(2, 2, 0);
        set.compute_parameter(&params());
        set.compute_from_gaussian(&mean, &cov).unwrap();

        let m = set.mean();
        assert_abs_diff_eq!(m[0], mean[0], epsilon = 1e-10);
        assert_abs_diff_eq!(m[1], mean[1], epsilon = 1e-10);

        let p = set.covariance(&m);
        for r in 0..2 {
            for c in 0..2 {
                assert_abs_diff_eq!(p[(r, c)], cov[(r, c)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn cross_covariance_with_itself_matches_covariance() {
        let mean = DVector::from_vec(vec![0.0, 3.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, -0.3, -0.3, 2.0]);

        let mut set = SigmaPointSet::<DVector<f64>>::new(2, 2, 0);
        set.compute_parameter(&params());
        set.compute_from_gaussian(&mean, &cov).unwrap();

        let m = set.mean();
        let p = set.covariance(&m);
        let pximself = set.cross_covariance(&m, &set.clone(), &m);
        for r in 0..2 {
            for c in 0..2 {
                assert_abs_diff_eq!(p[(r, c)], pximself[(r, c)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn clamped_indices_return_central_sample() {
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.1]));
        // A 1-D noise set at the tail of a 3-D augmented space.
        let mut set = SigmaPointSet::<DVector<f64>>::new(1, 3, 4);
        set.compute_parameter(&params());
        set.compute_from_zero_mean_gaussian(&cov).unwrap();

        for i in 0..4 {
            assert_abs_diff_eq!(set.at(i)[0], 0.0, epsilon = 1e-15);
        }
        assert!(set.at(5)[0].abs() > 0.0);
    }

    // Recovers the joint covariance of a base block and its extension over
    // the shared index space.
    fn joint_covariance(
        base: &SigmaPointSet<DVector<f64>>,
        ext: &SigmaPointSet<DVector<f64>>,
    ) -> DMatrix<f64> {
        let zero = DVector::zeros(1);
        let mut joint = DMatrix::zeros(2, 2);
        for i in 0..base.index_len() {
            let mut dev = DVector::zeros(2);
            dev[0] = zero.boxminus(base.at(i))[0];
            dev[1] = zero.boxminus(ext.at(i))[0];
            joint += base.w_cov(i) * &dev * dev.transpose();
        }
        joint
    }

    #[test]
    fn extension_with_zero_cross_covariance_is_block_diagonal() {
        let base_cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.4]));
        let extra_cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.9]));
        let p = params();

        // Index space over (state=1, base noise=1, extra noise=1).
        let mut base = SigmaPointSet::<DVector<f64>>::new(1, 3, 2);
        base.compute_parameter(&p);
        base.compute_from_zero_mean_gaussian(&base_cov).unwrap();

        let mut ext = SigmaPointSet::<DVector<f64>>::new(2, 3, 2);
        ext.compute_parameter(&p);
        ext.extend_zero_mean(&base, &extra_cov, &DMatrix::zeros(1, 1))
            .unwrap();

        let joint = joint_covariance(&base, &ext);
        assert_abs_diff_eq!(joint[(0, 0)], 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(joint[(1, 1)], 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!(joint[(0, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn extension_with_cross_covariance_recovers_joint_covariance() {
        let base_cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.4]));
        let extra_cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.9]));
        let cross_cov = DMatrix::from_element(1, 1, 0.3);
        let p = params();

        let mut base = SigmaPointSet::<DVector<f64>>::new(1, 3, 2);
        base.compute_parameter(&p);
        base.compute_from_zero_mean_gaussian(&base_cov).unwrap();

        let mut ext = SigmaPointSet::<DVector<f64>>::new(2, 3, 2);
        ext.compute_parameter(&p);
        ext.extend_zero_mean(&base, &extra_cov, &cross_cov).unwrap();

        // The conditional construction reproduces the full joint covariance,
        // off-diagonal included.
        let joint = joint_covariance(&base, &ext);
        assert_abs_diff_eq!(joint[(0, 0)], 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(joint[(1, 1)], 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!(joint[(0, 1)], 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(joint[(1, 0)], 0.3, epsilon = 1e-9);
    }

    #[test]
    fn extension_rejects_layout_mismatch_and_unpopulated_base() {
        let extra_cov = DMatrix::identity(1, 1);
        let cross_cov = DMatrix::zeros(1, 1);

        let mut base = SigmaPointSet::<DVector<f64>>::new(1, 3, 2);
        base.compute_from_zero_mean_gaussian(&DMatrix::identity(1, 1))
            .unwrap();

        // Wrong offset: the extension must re-describe the base slots.
        let mut ext = SigmaPointSet::<DVector<f64>>::new(2, 3, 4);
        let err = ext.extend_zero_mean(&base, &extra_cov, &cross_cov).unwrap_err();
        assert_eq!(err, FilterError::CouplingDimensionMismatch);

        // Base whose samples were never computed.
        let empty = SigmaPointSet::<DVector<f64>>::new(1, 3, 2);
        let mut ext = SigmaPointSet::<DVector<f64>>::new(2, 3, 2);
        let err = ext.extend_zero_mean(&empty, &extra_cov, &cross_cov).unwrap_err();
        assert_eq!(err, FilterError::MissingCoupling);
    }

    #[test]
    fn non_positive_definite_covariance_is_rejected() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let mut set = SigmaPointSet::<DVector<f64>>::new(2, 2, 0);
        let err = set
            .compute_from_gaussian(&DVector::zeros(2), &cov)
            .unwrap_err();
        assert_eq!(err, FilterError::NotPositiveDefinite);
    }
}
