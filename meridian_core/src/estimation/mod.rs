// meridian_core/src/estimation/mod.rs

use crate::manifold::Manifold;
use crate::types::{CovMatrix, DifVector};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use self::sigma_points::SigmaPointSet;

pub mod outlier;
pub mod sigma_points;
pub mod update;

/// Which strategy `perform_update` dispatches to. The iterated EKF is invoked
/// explicitly and is not reachable through the mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    Ekf,
    Ukf,
}

/// The record a filtering loop persists between prediction and update calls.
/// Owned by the caller; the update engine mutates `state` and `cov` in place
/// and performs no locking, so the caller serializes access per instance.
#[derive(Debug, Clone)]
pub struct FilterState<S: Manifold> {
    pub state: S,
    /// Covariance about the current `state` (the linearization point).
    pub cov: CovMatrix,
    pub mode: FilterMode,
    /// Offset applied when linearizing away from the current estimate.
    pub lin_offset: DifVector,
    /// Prediction-stage products, required only by coupled-noise updates.
    pub coupling: Option<PredictionCoupling<S>>,
}

impl<S: Manifold> FilterState<S> {
    pub fn new(state: S, cov: CovMatrix, mode: FilterMode) -> Self {
        let dim = state.dim();
        assert_eq!(cov.nrows(), dim);
        assert_eq!(cov.ncols(), dim);
        Self {
            state,
            cov,
            mode,
            lin_offset: DVector::zeros(dim),
            coupling: None,
        }
    }
}

/// What the preceding prediction step must hand over for a coupled update:
/// its pre-update state sigma points, its zero-mean process-noise sigma
/// points in the same index space, and the sensitivity `G` of the propagated
/// state to the process noise.
#[derive(Debug, Clone)]
pub struct PredictionCoupling<S: Manifold> {
    pub sigma_points_pre: SigmaPointSet<S>,
    pub noise_sigma_points_pre: SigmaPointSet<DifVector>,
    /// `G`: D_x × D_pn noise Jacobian of the prediction. The state sigma
    /// points deviate by `G·dev` in the process-noise slots, and the same
    /// `G` forms the coupled cross term `C = G·Qxn·Hnᵗ`.
    pub noise_state_cross: CovMatrix,
}
