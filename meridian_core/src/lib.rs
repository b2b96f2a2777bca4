// meridian_core/src/lib.rs

// This file defines the public modules of the library.
pub mod errors;
pub mod estimation;
pub mod manifold;
pub mod models;
pub mod prelude;
pub mod types;
