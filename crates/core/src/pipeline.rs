//! End-to-end calibrated ensemble: calibrate, generate percentiles, reorder

use crate::calibration::{calibrate, CalibrationOutput, CalibrationSettings};
use crate::config::{PostProcessConfig, ReorderingConfig};
use crate::error::{Error, Result};
use crate::field::{Field, REALIZATION};
use crate::percentiles::generate_percentiles;
use crate::reorder::reorder;
use tracing::info;

/// Options for [`calibrated_ensemble`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOptions {
    pub calibration: CalibrationSettings,
    /// Members to generate; the current forecast's member count when `None`
    pub num_members: Option<usize>,
    pub reordering: ReorderingConfig,
}

impl PipelineOptions {
    pub fn from_config(config: &PostProcessConfig, num_members: Option<usize>) -> Self {
        Self {
            calibration: config.calibration.clone(),
            num_members,
            reordering: config.reordering,
        }
    }
}

/// Calibrated members plus the intermediate products
#[derive(Debug, Clone)]
pub struct CalibratedEnsemble {
    /// Members on the current forecast's grid, `realization` first
    pub ensemble: Field,
    pub percentiles: Field,
    pub calibration: CalibrationOutput,
}

/// Calibrate `current` and regenerate it as an ensemble.
pub fn calibrated_ensemble(
    current: &Field,
    historic_forecast: &Field,
    historic_truth: &Field,
    options: &PipelineOptions,
) -> Result<CalibratedEnsemble> {
    current.require_dim(REALIZATION)?;
    let num_members = options
        .num_members
        .unwrap_or_else(|| current.dim_len(REALIZATION));
    if num_members == 0 {
        return Err(Error::invalid("num_members", "at least one member is required"));
    }
    info!(
        members = num_members,
        method = %options.calibration.method,
        "Building calibrated ensemble"
    );

    let calibration = calibrate(current, historic_forecast, historic_truth, &options.calibration)?;
    let percentiles = generate_percentiles(
        &calibration.distribution.mean,
        &calibration.distribution.variance,
        calibration.distribution.distribution,
        num_members,
    )?;
    let ensemble = reorder(
        &percentiles,
        current,
        options.reordering.random_ordering,
        options.reordering.random_seed,
    )?;

    Ok(CalibratedEnsemble {
        ensemble,
        percentiles,
        calibration,
    })
}
