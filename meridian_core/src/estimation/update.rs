// meridian_core/src/estimation/update.rs

use crate::errors::{ConfigError, FilterError};
use crate::estimation::outlier::OutlierDetection;
use crate::estimation::sigma_points::{SigmaPointSet, UnscentedParams};
use crate::estimation::{FilterMode, FilterState};
use crate::manifold::Manifold;
use crate::models::measurement::MeasurementModel;
use crate::types::{CovMatrix, DifVector};
use log::{debug, warn};
use nalgebra::{Cholesky, DVector};

/// Whether the measurement noise is statistically independent of the
/// preceding prediction step. Fixed at construction; the choice never changes
/// after setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingMode {
    Independent,
    CoupledToPrediction {
        /// Dimension D_pn of the prediction's process-noise vector.
        prediction_noise_dim: usize,
        /// Noise-extension dimension declared by the filter's prediction
        /// step. Must equal the model's noise dimension.
        noise_extension_dim: usize,
    },
}

/// Tunable configuration of a measurement update. Mutate the fields, then
/// call [`MeasurementUpdate::refresh`] so derived quantities follow.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub params: UnscentedParams,
    /// IEKF terminates once the correction norm drops below this.
    pub update_vec_norm_termination: f64,
    pub max_num_iterations: usize,
    /// Measurement-noise covariance Qn, D_n × D_n.
    pub update_noise_cov: CovMatrix,
    /// Cross-covariance Qxn between prediction noise and measurement noise,
    /// D_pn × D_n. Only read by coupled updates.
    pub prediction_noise_cross: CovMatrix,
    pub outlier_detection: OutlierDetection,
    /// Linearize at `state ⊞ lin_offset` instead of the estimate (EKF only).
    pub use_special_linearization_point: bool,
}

impl UpdateConfig {
    /// Defaults matching a conservative small-noise update.
    pub fn new(noise_dim: usize) -> Self {
        Self {
            params: UnscentedParams::default(),
            update_vec_norm_termination: 1e-6,
            max_num_iterations: 10,
            update_noise_cov: CovMatrix::identity(noise_dim, noise_dim) * 1e-4,
            prediction_noise_cross: CovMatrix::zeros(0, noise_dim),
            outlier_detection: OutlierDetection::default(),
            use_special_linearization_point: false,
        }
    }
}

/// The measurement-update engine: one of {EKF, IEKF, UKF} × {independent,
/// coupled} applied to a caller-owned [`FilterState`].
///
/// Owns its model and all per-call scratch (Jacobians, gain, covariances,
/// sigma-point sets), sized once at construction, so repeated updates do not
/// reallocate. One engine instance must not be invoked concurrently; distinct
/// engine / filter-state pairs are independent.
pub struct MeasurementUpdate<S: Manifold, Y: Manifold, M> {
    model: Box<dyn MeasurementModel<S, Y, M>>,
    /// The zero-innovation reference element residuals are taken against.
    inn_reference: Y,
    coupling_mode: CouplingMode,
    pub config: UpdateConfig,

    // --- Per-call scratch, reused across calls ---
    jac_state: CovMatrix,    // H,   D_y × D_x
    jac_noise: CovMatrix,    // Hn,  D_y × D_n
    coupled_cross: CovMatrix, // C,  D_x × D_y
    inn_cov: CovMatrix,      // Py
    cross_cov: CovMatrix,    // Pyx, D_y × D_x
    gain: CovMatrix,         // K,   D_x × D_y
    residual: DifVector,
    update_vec: DifVector,
    zero_noise: DifVector,
    inn_mean: Y,
    state_sigma_points: SigmaPointSet<S>,
    noise_sigma_points: SigmaPointSet<DifVector>,
    inn_sigma_points: SigmaPointSet<Y>,
    coupled_noise_sigma_points: SigmaPointSet<DifVector>,
    coupled_inn_sigma_points: SigmaPointSet<Y>,
    update_vec_sigma_points: SigmaPointSet<DifVector>,
    posterior_sigma_points: SigmaPointSet<S>,
    /// Memoized value behind `noise_sigma_points`; the cached set is rebuilt
    /// exactly when the configured noise covariance differs from this.
    cached_noise_cov: CovMatrix,

    last_iterations: usize,
    last_update_norm: f64,
    last_rejections: Vec<bool>,
}

impl<S: Manifold, Y: Manifold, M> MeasurementUpdate<S, Y, M> {
    /// Validates the configuration and sizes all scratch storage from the
    /// model's dimensions. Configuration errors are rejected here, before any
    /// filter state can be touched.
    pub fn new(
        model: Box<dyn MeasurementModel<S, Y, M>>,
        inn_reference: Y,
        coupling_mode: CouplingMode,
        config: UpdateConfig,
    ) -> Result<Self, ConfigError> {
        let dx = model.state_dim();
        let dy = model.inn_dim();
        let dn = model.noise_dim();

        let alpha = config.params.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::InvalidAlpha(alpha));
        }
        if config.update_noise_cov.nrows() != dn || config.update_noise_cov.ncols() != dn {
            return Err(ConfigError::BadNoiseCovarianceShape {
                expected: dn,
                rows: config.update_noise_cov.nrows(),
                cols: config.update_noise_cov.ncols(),
            });
        }
        let dpn = match coupling_mode {
            CouplingMode::Independent => 0,
            CouplingMode::CoupledToPrediction {
                prediction_noise_dim,
                noise_extension_dim,
            } => {
                if dn != noise_extension_dim {
                    return Err(ConfigError::NoiseDimensionMismatch {
                        model_dim: dn,
                        extension_dim: noise_extension_dim,
                    });
                }
                let cross = &config.prediction_noise_cross;
                if cross.nrows() != prediction_noise_dim || cross.ncols() != dn {
                    return Err(ConfigError::BadCrossCovarianceShape {
                        expected_rows: prediction_noise_dim,
                        expected_cols: dn,
                        rows: cross.nrows(),
                        cols: cross.ncols(),
                    });
                }
                prediction_noise_dim
            }
        };
        for group in &config.outlier_detection.groups {
            if group.start + group.dim > dy {
                return Err(ConfigError::OutlierGroupOutOfRange {
                    start: group.start,
                    dim: group.dim,
                    inn_dim: dy,
                });
            }
        }

        // Shared quadrature spaces: (state, noise) for the independent UKF,
        // (state, prediction noise, noise) for the coupled one.
        let aug = dx + dn;
        let aug_coupled = dx + dpn + dn;

        let mut engine = Self {
            inn_mean: inn_reference.clone(),
            model,
            inn_reference,
            coupling_mode,
            config,
            jac_state: CovMatrix::zeros(dy, dx),
            jac_noise: CovMatrix::zeros(dy, dn),
            coupled_cross: CovMatrix::zeros(dx, dy),
            inn_cov: CovMatrix::zeros(dy, dy),
            cross_cov: CovMatrix::zeros(dy, dx),
            gain: CovMatrix::zeros(dx, dy),
            residual: DVector::zeros(dy),
            update_vec: DVector::zeros(dx),
            zero_noise: DVector::zeros(dn),
            state_sigma_points: SigmaPointSet::new(dx, aug, 0),
            noise_sigma_points: SigmaPointSet::new(dn, aug, 2 * dx),
            inn_sigma_points: SigmaPointSet::new(aug, aug, 0),
            coupled_noise_sigma_points: SigmaPointSet::new(dpn + dn, aug_coupled, 2 * dx),
            coupled_inn_sigma_points: SigmaPointSet::new(aug_coupled, aug_coupled, 0),
            update_vec_sigma_points: SigmaPointSet::new(dx, dx, 0),
            posterior_sigma_points: SigmaPointSet::new(dx, dx, 0),
            cached_noise_cov: CovMatrix::zeros(dn, dn),
            last_iterations: 0,
            last_update_norm: 0.0,
            last_rejections: Vec::new(),
        };
        engine
            .refresh()
            .map_err(|_| ConfigError::NoiseCovarianceNotPositiveDefinite)?;
        Ok(engine)
    }

    /// Recomputes every derived quantity after a configuration change:
    /// sigma-point weights from the spread parameters, and the cached noise
    /// sigma points from the (possibly new) noise covariance.
    pub fn refresh(&mut self) -> Result<(), FilterError> {
        let params = self.config.params;
        self.state_sigma_points.compute_parameter(&params);
        self.noise_sigma_points.compute_parameter(&params);
        self.inn_sigma_points.compute_parameter(&params);
        self.coupled_noise_sigma_points.compute_parameter(&params);
        self.coupled_inn_sigma_points.compute_parameter(&params);
        self.update_vec_sigma_points.compute_parameter(&params);
        self.posterior_sigma_points.compute_parameter(&params);
        // The spread factor changed, so the cached samples are stale no
        // matter what the covariance value says.
        self.noise_sigma_points
            .compute_from_zero_mean_gaussian(&self.config.update_noise_cov)?;
        self.cached_noise_cov = self.config.update_noise_cov.clone();
        Ok(())
    }

    /// Iterations the last IEKF call took (1 on a linear model).
    pub fn last_iteration_count(&self) -> usize {
        self.last_iterations
    }

    /// Correction norm at the end of the last IEKF call. A value at or above
    /// the termination threshold means the iteration cap was hit.
    pub fn last_update_norm(&self) -> f64 {
        self.last_update_norm
    }

    /// Per-group outlier decisions of the last update call.
    pub fn last_outlier_rejections(&self) -> &[bool] {
        &self.last_rejections
    }

    pub fn coupling_mode(&self) -> CouplingMode {
        self.coupling_mode
    }

    /// Performs one measurement update, dispatching on the filter state's
    /// mode selector. Mutates `state` and `cov` in place on success; on a
    /// numerical failure the filter state is left untouched and the error is
    /// surfaced to the caller.
    pub fn perform_update(
        &mut self,
        filter_state: &mut FilterState<S>,
        meas: &M,
    ) -> Result<(), FilterError> {
        match filter_state.mode {
            FilterMode::Ukf => self.perform_update_ukf(filter_state, meas),
            FilterMode::Ekf => self.perform_update_ekf(filter_state, meas),
        }
    }

    // Fetches the prediction-stage coupling record, surfacing its absence or
    // a mis-sized sensitivity as an error before anything is mutated.
    fn coupling_record<'a>(
        &self,
        filter_state: &'a FilterState<S>,
    ) -> Result<&'a crate::estimation::PredictionCoupling<S>, FilterError> {
        let coupling = filter_state
            .coupling
            .as_ref()
            .ok_or(FilterError::MissingCoupling)?;
        let dpn = match self.coupling_mode {
            CouplingMode::CoupledToPrediction {
                prediction_noise_dim,
                ..
            } => prediction_noise_dim,
            CouplingMode::Independent => 0,
        };
        if coupling.noise_state_cross.nrows() != self.model.state_dim()
            || coupling.noise_state_cross.ncols() != dpn
        {
            return Err(FilterError::CouplingDimensionMismatch);
        }
        Ok(coupling)
    }

    // Linearizes the model at `lin_state` and fills H, Hn, Py and the
    // residual. Shared by the EKF and every IEKF iteration.
    fn linearize(
        &mut self,
        filter_state: &FilterState<S>,
        lin_state: &S,
        meas: &M,
    ) -> Result<(), FilterError> {
        self.jac_state = self.model.jacobian_state(lin_state, meas);
        self.jac_noise = self.model.jacobian_noise(lin_state, meas);
        let y = self.model.evaluate(lin_state, meas, &self.zero_noise);

        self.inn_cov = &self.jac_state * &filter_state.cov * self.jac_state.transpose()
            + &self.jac_noise * &self.config.update_noise_cov * self.jac_noise.transpose();
        if let CouplingMode::CoupledToPrediction { .. } = self.coupling_mode {
            let coupling = self.coupling_record(filter_state)?;
            self.coupled_cross = &coupling.noise_state_cross
                * &self.config.prediction_noise_cross
                * self.jac_noise.transpose();
            self.inn_cov += &self.jac_state * &self.coupled_cross
                + self.coupled_cross.transpose() * self.jac_state.transpose();
        }
        self.residual = self.inn_reference.boxminus(&y);
        Ok(())
    }

    // Outlier gating, factorization and gain for the linearized variants.
    fn ekf_gain(&mut self, filter_state: &FilterState<S>) -> Result<(), FilterError> {
        self.last_rejections = self.config.outlier_detection.process(
            &mut self.residual,
            &mut self.inn_cov,
            &mut self.jac_state,
        );
        let chol = match Cholesky::new(self.inn_cov.clone()) {
            Some(chol) => chol,
            None => {
                warn!("innovation covariance is not positive definite, update aborted");
                return Err(FilterError::NotPositiveDefinite);
            }
        };
        let py_inv = chol.inverse();
        self.gain = match self.coupling_mode {
            CouplingMode::CoupledToPrediction { .. } => {
                (&filter_state.cov * self.jac_state.transpose() + &self.coupled_cross) * py_inv
            }
            CouplingMode::Independent => {
                &filter_state.cov * self.jac_state.transpose() * py_inv
            }
        };
        Ok(())
    }

    /// Extended Kalman filter update.
    pub fn perform_update_ekf(
        &mut self,
        filter_state: &mut FilterState<S>,
        meas: &M,
    ) -> Result<(), FilterError> {
        let lin_state = if self.config.use_special_linearization_point {
            filter_state.state.boxplus(&filter_state.lin_offset)
        } else {
            filter_state.state.clone()
        };
        self.linearize(filter_state, &lin_state, meas)?;
        self.ekf_gain(filter_state)?;

        let new_cov =
            &filter_state.cov - &self.gain * (&self.inn_cov * self.gain.transpose());
        if self.config.use_special_linearization_point {
            // compensate for the offset linearization point
            self.update_vec =
                -(&self.gain * (&self.residual - &self.jac_state * &filter_state.lin_offset));
        } else {
            self.update_vec = -(&self.gain * &self.residual);
        }
        filter_state.state = filter_state.state.boxplus(&self.update_vec);
        filter_state.cov = new_cov;
        Ok(())
    }

    /// Iterated EKF update. Re-linearizes at a running state until the step
    /// between successive iterates drops below the configured threshold or
    /// the iteration cap is reached; the last iterate is accepted either way
    /// (inspect [`MeasurementUpdate::last_update_norm`] to detect
    /// non-convergence: a value at or above the threshold means the cap was
    /// hit). On a linear model the first re-linearization already confirms
    /// the iterate, so the count is one.
    pub fn perform_update_iekf(
        &mut self,
        filter_state: &mut FilterState<S>,
        meas: &M,
    ) -> Result<(), FilterError> {
        if self.config.max_num_iterations == 0 {
            self.last_iterations = 0;
            self.last_update_norm = 0.0;
            return Ok(());
        }
        let mut lin_state = filter_state.state.clone();
        let mut iterations = 0;
        let norm;
        loop {
            self.linearize(filter_state, &lin_state, meas)?;
            self.ekf_gain(filter_state)?;

            // The correction is taken relative to the prior, not the
            // current linearization point.
            let dif = filter_state.state.boxminus(&lin_state);
            self.update_vec =
                -(&self.gain * (&self.residual - &self.jac_state * &dif));
            let next = filter_state.state.boxplus(&self.update_vec);
            let step = lin_state.boxminus(&next).norm();
            lin_state = next;
            if step < self.config.update_vec_norm_termination {
                norm = step;
                break;
            }
            iterations += 1;
            if iterations >= self.config.max_num_iterations {
                norm = step;
                break;
            }
        }
        debug!(
            "iekf finished after {} iteration(s), |step| = {:.3e}",
            iterations, norm
        );
        self.last_iterations = iterations;
        self.last_update_norm = norm;
        filter_state.cov =
            &filter_state.cov - &self.gain * (&self.inn_cov * self.gain.transpose());
        filter_state.state = lin_state;
        Ok(())
    }

    /// Unscented Kalman filter update.
    pub fn perform_update_ukf(
        &mut self,
        filter_state: &mut FilterState<S>,
        meas: &M,
    ) -> Result<(), FilterError> {
        match self.coupling_mode {
            CouplingMode::Independent => self.project_sigma_points(filter_state, meas)?,
            CouplingMode::CoupledToPrediction { .. } => {
                self.project_sigma_points_coupled(filter_state, meas)?
            }
        }
        self.residual = self.inn_reference.boxminus(&self.inn_mean);
        self.last_rejections = self.config.outlier_detection.process(
            &mut self.residual,
            &mut self.inn_cov,
            &mut self.cross_cov,
        );
        let chol = match Cholesky::new(self.inn_cov.clone()) {
            Some(chol) => chol,
            None => {
                warn!("innovation covariance is not positive definite, update aborted");
                return Err(FilterError::NotPositiveDefinite);
            }
        };
        self.gain = self.cross_cov.transpose() * chol.inverse();
        let new_cov =
            &filter_state.cov - &self.gain * (&self.inn_cov * self.gain.transpose());
        self.update_vec = -(&self.gain * &self.residual);

        // Applying one linear correction through boxplus is only first-order
        // correct on a curved manifold. Resample around the correction and
        // take the weighted mean/covariance of the candidates instead.
        self.update_vec_sigma_points
            .compute_from_zero_mean_gaussian(&new_cov)?;
        let mut candidates = Vec::with_capacity(self.posterior_sigma_points.sample_count());
        for i in 0..self.update_vec_sigma_points.index_len() {
            candidates.push(
                filter_state
                    .state
                    .boxplus(&(&self.update_vec + self.update_vec_sigma_points.at(i))),
            );
        }
        self.posterior_sigma_points.set_samples(candidates);
        let posterior_state = self.posterior_sigma_points.mean();
        let posterior_cov = self.posterior_sigma_points.covariance(&posterior_state);
        filter_state.state = posterior_state;
        filter_state.cov = posterior_cov;
        Ok(())
    }

    // Independent-mode sigma propagation: state points from the prior, noise
    // points from the memoized cache, innovation statistics from the
    // projected set.
    fn project_sigma_points(
        &mut self,
        filter_state: &FilterState<S>,
        meas: &M,
    ) -> Result<(), FilterError> {
        self.refresh_noise_sigma_points()?;
        self.state_sigma_points
            .compute_from_gaussian(&filter_state.state, &filter_state.cov)?;

        let mut projected = Vec::with_capacity(self.inn_sigma_points.sample_count());
        for i in 0..self.inn_sigma_points.index_len() {
            projected.push(self.model.evaluate(
                self.state_sigma_points.at(i),
                meas,
                self.noise_sigma_points.at(i),
            ));
        }
        self.inn_sigma_points.set_samples(projected);

        self.inn_mean = self.inn_sigma_points.mean();
        self.inn_cov = self.inn_sigma_points.covariance(&self.inn_mean);
        let state_mean = self.state_sigma_points.mean();
        self.cross_cov = self.inn_sigma_points.cross_covariance(
            &self.inn_mean,
            &self.state_sigma_points,
            &state_mean,
        );
        Ok(())
    }

    // Coupled-mode sigma propagation: the prediction's pre-update state
    // points, with its noise set extended by the measurement-noise block
    // conditioned on the prediction noise through Qxn.
    fn project_sigma_points_coupled(
        &mut self,
        filter_state: &FilterState<S>,
        meas: &M,
    ) -> Result<(), FilterError> {
        let coupling = self.coupling_record(filter_state)?;
        let aug = self.coupled_inn_sigma_points.aug_dim();
        if coupling.sigma_points_pre.aug_dim() != aug
            || coupling.noise_sigma_points_pre.aug_dim() != aug
        {
            return Err(FilterError::CouplingDimensionMismatch);
        }
        if !coupling.sigma_points_pre.is_populated() {
            return Err(FilterError::MissingCoupling);
        }
        self.coupled_noise_sigma_points.extend_zero_mean(
            &coupling.noise_sigma_points_pre,
            &self.config.update_noise_cov,
            &self.config.prediction_noise_cross,
        )?;

        let mut projected = Vec::with_capacity(self.coupled_inn_sigma_points.sample_count());
        for i in 0..self.coupled_inn_sigma_points.index_len() {
            projected.push(self.model.evaluate(
                coupling.sigma_points_pre.at(i),
                meas,
                self.coupled_noise_sigma_points.at(i),
            ));
        }
        self.coupled_inn_sigma_points.set_samples(projected);

        self.inn_mean = self.coupled_inn_sigma_points.mean();
        self.inn_cov = self.coupled_inn_sigma_points.covariance(&self.inn_mean);
        let pre_mean = coupling.sigma_points_pre.mean();
        self.cross_cov = self.coupled_inn_sigma_points.cross_covariance(
            &self.inn_mean,
            &coupling.sigma_points_pre,
            &pre_mean,
        );
        Ok(())
    }

    // Rebuilds the cached noise sigma points only when the configured value
    // actually changed.
    fn refresh_noise_sigma_points(&mut self) -> Result<(), FilterError> {
        if self.cached_noise_cov != self.config.update_noise_cov {
            self.noise_sigma_points
                .compute_from_zero_mean_gaussian(&self.config.update_noise_cov)?;
            self.cached_noise_cov = self.config.update_noise_cov.clone();
        }
        Ok(())
    }
}
