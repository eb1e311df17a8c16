//! Thermodynamic diagnostics: wet-bulb temperature and falling-snow level

pub mod snow_level;
pub mod wet_bulb;

pub use snow_level::{
    falling_snow_level, SnowLevelOutput, SnowLevelSolver, DEFAULT_FALLING_LEVEL_THRESHOLD,
};
pub use wet_bulb::{
    dew_point_temperature, saturation_vapour_pressure, wet_bulb_point, wet_bulb_temperature,
    ConvergenceMask, WetBulbOutput, WetBulbPoint, WetBulbSolver,
};

/// Physical constants for moist thermodynamics
pub mod constants {
    /// Latent heat of condensation of water at 0°C (J/kg)
    pub const LATENT_HEAT_CONDENSATION: f64 = 2.501e6;

    /// Specific heat of dry air at constant pressure (J/(kg·K))
    pub const CP_DRY_AIR: f64 = 1005.0;

    /// Ratio of molecular weights, water vapour to dry air
    pub const EPSILON: f64 = 0.622;

    /// 0°C in Kelvin
    pub const ZERO_CELSIUS: f64 = 273.15;

    /// Magnus formula (Bolton 1980): e_sat at 0°C (Pa)
    pub const MAGNUS_E0: f64 = 611.2;

    /// Magnus formula (Bolton 1980): dimensionless coefficient
    pub const MAGNUS_A: f64 = 17.67;

    /// Magnus formula (Bolton 1980): temperature offset (K)
    pub const MAGNUS_B: f64 = 243.5;
}
