//! Post-processing configuration
//!
//! One JSON document configures every stage. Missing sections and fields take
//! their defaults, so `{}` is a valid configuration.
//!
//! ```json
//! {
//!   "wet_bulb": { "precision": 0.005, "max_iterations": 100 },
//!   "snow_level": { "threshold": 90.0 },
//!   "calibration": { "method": "ngr", "distribution": "truncated_gaussian" },
//!   "reordering": { "random_ordering": true, "random_seed": 42 }
//! }
//! ```

use crate::calibration::CalibrationSettings;
use crate::error::{Error, Result};
use crate::thermo::snow_level::DEFAULT_FALLING_LEVEL_THRESHOLD;
use crate::thermo::wet_bulb::{DEFAULT_MAX_ITERATIONS, DEFAULT_PRECISION};
use crate::thermo::{SnowLevelSolver, WetBulbSolver};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Newton solver settings for wet-bulb temperature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WetBulbConfig {
    /// Convergence threshold on the Newton step (K)
    pub precision: f64,
    pub max_iterations: usize,
}

impl Default for WetBulbConfig {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl WetBulbConfig {
    pub fn solver(&self) -> WetBulbSolver {
        WetBulbSolver::new(self.precision).with_max_iterations(self.max_iterations)
    }
}

/// Falling-snow level settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnowLevelConfig {
    /// Melting threshold on the wet-bulb integral (K·m)
    pub threshold: f64,
}

impl Default for SnowLevelConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FALLING_LEVEL_THRESHOLD,
        }
    }
}

/// Percentile-to-member ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderingConfig {
    pub random_ordering: bool,
    pub random_seed: Option<u64>,
}

/// Settings for every stage
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    pub wet_bulb: WetBulbConfig,
    pub snow_level: SnowLevelConfig,
    pub calibration: CalibrationSettings,
    pub reordering: ReorderingConfig,
}

impl PostProcessConfig {
    /// Read a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| Error::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&contents).map_err(|source| Error::Serialization {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded post-processing config");
        Ok(config)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn snow_level_solver(&self) -> SnowLevelSolver {
        SnowLevelSolver {
            wet_bulb: self.wet_bulb.solver(),
            threshold: self.snow_level.threshold,
        }
    }
}
