// meridian_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::manifold::Manifold;
pub use crate::models::measurement::MeasurementModel;
pub use crate::types::{CovMatrix, DifVector};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::errors::{ConfigError, FilterError};
pub use crate::estimation::{FilterMode, FilterState, PredictionCoupling};

// --- Update Engine ---
pub use crate::estimation::outlier::{OutlierDetection, OutlierGroup};
pub use crate::estimation::sigma_points::{SigmaPointSet, UnscentedParams};
pub use crate::estimation::update::{CouplingMode, MeasurementUpdate, UpdateConfig};
