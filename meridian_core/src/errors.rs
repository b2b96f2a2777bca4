// meridian_core/src/errors.rs

use thiserror::Error;

/// Construction-time configuration errors. These are rejected before any
/// filter state is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A coupled update requires the measurement-noise dimension to match the
    /// noise-extension dimension declared by the filter's prediction step.
    #[error("coupled update noise dimension {model_dim} does not match the prediction noise extension {extension_dim}")]
    NoiseDimensionMismatch {
        model_dim: usize,
        extension_dim: usize,
    },

    #[error("update noise covariance must be {expected}x{expected}, got {rows}x{cols}")]
    BadNoiseCovarianceShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("prediction/measurement noise cross-covariance must be {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    BadCrossCovarianceShape {
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("sigma point spread alpha must lie in (0, 1], got {0}")]
    InvalidAlpha(f64),

    #[error("outlier group [{start}, {start}+{dim}) exceeds the innovation dimension {inn_dim}")]
    OutlierGroupOutOfRange {
        start: usize,
        dim: usize,
        inn_dim: usize,
    },

    #[error("update noise covariance is not positive definite")]
    NoiseCovarianceNotPositiveDefinite,
}

/// Per-call numerical failures. Recoverable by the caller; the filter state
/// is left untouched when one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FilterError {
    /// A covariance that must be positive definite (innovation covariance,
    /// or a covariance being sampled into sigma points) failed its Cholesky
    /// factorization.
    #[error("covariance is not positive definite")]
    NotPositiveDefinite,

    /// A coupled-strategy update was invoked on a filter state that carries
    /// no prediction-stage coupling record, or an incomplete one.
    #[error("coupled update invoked without a populated prediction coupling record")]
    MissingCoupling,

    /// The prediction-stage sigma points or noise sensitivity in the
    /// coupling record do not fit the coupled quadrature space the engine
    /// was sized for.
    #[error("prediction coupling record does not fit the coupled quadrature space")]
    CouplingDimensionMismatch,
}
