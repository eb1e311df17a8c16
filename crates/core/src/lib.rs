//! NWP Post-Processing Core Library
//!
//! Post-processing for numerical-weather-prediction output: ensemble
//! calibration against historical truth, regeneration of ensemble members from
//! the calibrated distribution, and Newton-iterated thermodynamic diagnostics.
//!
//! ## Ensemble Calibration Pipeline
//!
//! - Minimum-CRPS regression (EMOS global or NGR per grid point)
//! - Gaussian and truncated-gaussian predictive distributions
//! - Evenly spaced percentile generation
//! - Schaake-shuffle or seeded random reordering into members
//!
//! ## Thermodynamic Diagnostics
//!
//! - Wet-bulb temperature by Newton–Raphson iteration
//! - Falling-snow level from the vertical wet-bulb integral

// Data model and shared utilities
pub mod error;
pub mod field;
pub mod io;
pub mod special;
pub mod units;

// Post-processing stages
pub mod calibration;
pub mod distribution;
pub mod percentiles;
pub mod reorder;
pub mod thermo;

// Configuration and end-to-end pipeline
pub mod config;
pub mod pipeline;

// Re-export core types
pub use error::{Error, Result};
pub use field::{DimCoord, Field, HEIGHT, PERCENTILE, REALIZATION, TIME};

// Re-export stage entry points
pub use calibration::{
    calibrate, CalibratedDistribution, CalibrationDiagnostics, CalibrationMethod,
    CalibrationOutput, CalibrationSettings, PredictorMode, RegressionCoefficients,
};
pub use distribution::Distribution;
pub use percentiles::{
    choose_percentiles, generate_percentiles, percentiles_at_levels, PercentileSampling,
};
pub use reorder::reorder;
pub use thermo::{
    falling_snow_level, wet_bulb_temperature, ConvergenceMask, SnowLevelOutput, WetBulbOutput,
};

// Re-export configuration
pub use config::PostProcessConfig;
pub use pipeline::{calibrated_ensemble, CalibratedEnsemble, PipelineOptions};
