//! Wet-bulb temperature by Newton–Raphson iteration
//!
//! The wet-bulb temperature `Tw` is the temperature a parcel reaches by
//! evaporating water into itself at constant pressure until saturated. The
//! isobaric energy balance gives
//!
//! ```text
//! g(Tw) = Tw - T + (L / cp) · (r_sat(Tw, P) - r) = 0
//! ```
//!
//! where `r` is the parcel's mixing ratio and `r_sat` the saturation mixing
//! ratio. `g` is increasing and convex in `Tw`, and `g(T) ≥ 0`, so Newton
//! steps seeded at `Tw = T` descend monotonically onto the root.
//!
//! # References
//! - Bolton, D. (1980). "The computation of equivalent potential temperature."
//!   Monthly Weather Review, 108(7), 1046-1053.
//! - Stull, R. (2017). "Practical Meteorology", Chapter 4.

use super::constants::{
    CP_DRY_AIR, EPSILON, LATENT_HEAT_CONDENSATION, MAGNUS_A, MAGNUS_B, MAGNUS_E0, ZERO_CELSIUS,
};
use crate::error::{Error, Result};
use crate::field::Field;
use crate::units::convert_field;
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use tracing::{info, warn};

/// Default convergence precision on the Newton step (K)
pub const DEFAULT_PRECISION: f64 = 0.05;

/// Default Newton iteration cap
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Lowest relative humidity used in the solve (fraction)
const MIN_RELATIVE_HUMIDITY: f64 = 1e-6;

/// Saturation vapour pressure over liquid water (Pa), Magnus form.
pub fn saturation_vapour_pressure(temperature: f64) -> f64 {
    let t_c = temperature - ZERO_CELSIUS;
    MAGNUS_E0 * (MAGNUS_A * t_c / (t_c + MAGNUS_B)).exp()
}

/// d(e_sat)/dT (Pa/K)
fn saturation_vapour_pressure_slope(temperature: f64) -> f64 {
    let t_c = temperature - ZERO_CELSIUS;
    saturation_vapour_pressure(temperature) * MAGNUS_A * MAGNUS_B / ((t_c + MAGNUS_B) * (t_c + MAGNUS_B))
}

/// Mixing ratio (kg/kg) for vapour pressure `e` at pressure `p`.
///
/// The dry-air partial pressure is floored at 1% of `p` so that near-boiling
/// inputs stay finite.
fn mixing_ratio(e: f64, p: f64) -> f64 {
    EPSILON * e / (p - e).max(0.01 * p)
}

/// Dew-point temperature (K) from temperature (K) and relative humidity
/// (fraction), by inverting the Magnus formula.
pub fn dew_point_temperature(temperature: f64, relative_humidity: f64) -> f64 {
    let rh = relative_humidity.clamp(MIN_RELATIVE_HUMIDITY, 1.0);
    let l = (rh * saturation_vapour_pressure(temperature) / MAGNUS_E0).ln();
    ZERO_CELSIUS + MAGNUS_B * l / (MAGNUS_A - l)
}

/// Result of one point's Newton iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WetBulbPoint {
    /// Final estimate (K)
    pub value: f64,
    /// Whether the last step fell below the precision
    pub converged: bool,
    /// Newton steps taken
    pub iterations: usize,
}

/// Solve for the wet-bulb temperature of one air parcel.
///
/// Inputs are temperature (K), relative humidity (fraction) and pressure (Pa).
/// Non-finite inputs yield NaN without iterating.
pub fn wet_bulb_point(
    temperature: f64,
    relative_humidity: f64,
    pressure: f64,
    precision: f64,
    max_iterations: usize,
) -> WetBulbPoint {
    if !(temperature.is_finite() && relative_humidity.is_finite() && pressure.is_finite()) {
        return WetBulbPoint {
            value: f64::NAN,
            converged: true,
            iterations: 0,
        };
    }

    let rh = relative_humidity.clamp(MIN_RELATIVE_HUMIDITY, 1.0);
    let vapour_pressure = rh * saturation_vapour_pressure(temperature);
    let r = mixing_ratio(vapour_pressure, pressure);
    let lv_over_cp = LATENT_HEAT_CONDENSATION / CP_DRY_AIR;

    let mut tw = temperature;
    for iteration in 1..=max_iterations {
        let es = saturation_vapour_pressure(tw);
        let r_sat = mixing_ratio(es, pressure);
        let denom = (pressure - es).max(0.01 * pressure);
        let dr_sat = EPSILON * pressure / (denom * denom) * saturation_vapour_pressure_slope(tw);

        let g = tw - temperature + lv_over_cp * (r_sat - r);
        let dg = 1.0 + lv_over_cp * dr_sat;
        let step = g / dg;
        tw -= step;

        if step.abs() < precision {
            return WetBulbPoint {
                value: tw,
                converged: true,
                iterations: iteration,
            };
        }
    }

    WetBulbPoint {
        value: tw,
        converged: false,
        iterations: max_iterations,
    }
}

/// Per-point convergence flags, shaped like the solved field
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceMask {
    flags: ArrayD<bool>,
}

impl ConvergenceMask {
    pub fn flags(&self) -> &ArrayD<bool> {
        &self.flags
    }

    pub fn unconverged_count(&self) -> usize {
        self.flags.iter().filter(|&&ok| !ok).count()
    }

    pub fn all_converged(&self) -> bool {
        self.unconverged_count() == 0
    }
}

/// Wet-bulb field plus its convergence diagnostics
#[derive(Debug, Clone)]
pub struct WetBulbOutput {
    pub field: Field,
    pub convergence: ConvergenceMask,
}

/// Newton solver settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WetBulbSolver {
    /// Stop once `|ΔTw|` is below this (K)
    pub precision: f64,
    /// Iteration cap; non-converged points keep their last estimate
    pub max_iterations: usize,
}

impl Default for WetBulbSolver {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl WetBulbSolver {
    #[must_use]
    pub fn new(precision: f64) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.precision.is_finite() && self.precision > 0.0) {
            return Err(Error::invalid(
                "precision",
                format!("must be finite and positive, got {}", self.precision),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::invalid("max_iterations", "must be at least 1"));
        }
        Ok(())
    }

    /// Solve every point of the input fields.
    ///
    /// Inputs are converted to K, fraction and Pa first and must share one
    /// grid. Points are independent and solved in parallel.
    pub fn solve(
        &self,
        temperature: &Field,
        relative_humidity: &Field,
        pressure: &Field,
    ) -> Result<WetBulbOutput> {
        self.validate()?;
        let temperature = convert_field(temperature, "K")?;
        let relative_humidity = convert_field(relative_humidity, "1")?;
        let pressure = convert_field(pressure, "Pa")?;
        temperature.check_same_grid(&relative_humidity, &[])?;
        temperature.check_same_grid(&pressure, &[])?;

        let t: Vec<f64> = temperature.data().iter().copied().collect();
        let rh: Vec<f64> = relative_humidity.data().iter().copied().collect();
        let p: Vec<f64> = pressure.data().iter().copied().collect();

        info!(
            points = t.len(),
            precision = self.precision,
            "Computing wet-bulb temperature"
        );

        let solved: Vec<WetBulbPoint> = t
            .par_iter()
            .zip(rh.par_iter())
            .zip(p.par_iter())
            .map(|((&t, &rh), &p)| wet_bulb_point(t, rh, p, self.precision, self.max_iterations))
            .collect();

        let values: Vec<f64> = solved.iter().map(|s| s.value).collect();
        let flags: Vec<bool> = solved.iter().map(|s| s.converged).collect();
        let flags = ArrayD::from_shape_vec(IxDyn(temperature.shape()), flags).map_err(|e| {
            Error::ShapeMismatch {
                field: "wet_bulb_temperature".to_string(),
                detail: e.to_string(),
            }
        })?;
        let convergence = ConvergenceMask { flags };

        let unconverged = convergence.unconverged_count();
        if unconverged > 0 {
            warn!(
                unconverged,
                max_iterations = self.max_iterations,
                "Wet-bulb iteration did not converge at some points; keeping last estimates"
            );
        }

        let field = Field::from_values(
            "wet_bulb_temperature",
            "K",
            temperature.coords().to_vec(),
            values,
        )?;
        Ok(WetBulbOutput { field, convergence })
    }
}

/// Wet-bulb temperature of `temperature`, `relative_humidity` and
/// `pressure` with the default iteration cap.
pub fn wet_bulb_temperature(
    temperature: &Field,
    relative_humidity: &Field,
    pressure: &Field,
    precision: f64,
) -> Result<WetBulbOutput> {
    WetBulbSolver::new(precision).solve(temperature, relative_humidity, pressure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DimCoord;
    use approx::assert_abs_diff_eq;

    fn scalar_field(name: &str, units: &str, values: Vec<f64>) -> Field {
        let coords = vec![DimCoord::new("x", "m", (0..values.len()).map(|i| i as f64).collect())];
        Field::from_values(name, units, coords, values).unwrap()
    }

    #[test]
    fn test_saturation_vapour_pressure_reference_points() {
        // 611.2 Pa at 0°C, ~2339 Pa at 20°C
        assert_abs_diff_eq!(saturation_vapour_pressure(273.15), 611.2, epsilon = 1e-9);
        assert_abs_diff_eq!(saturation_vapour_pressure(293.15), 2339.0, epsilon = 10.0);
    }

    #[test]
    fn test_dew_point_at_saturation_equals_temperature() {
        assert_abs_diff_eq!(dew_point_temperature(285.0, 1.0), 285.0, epsilon = 1e-9);
        assert!(dew_point_temperature(285.0, 0.5) < 285.0);
    }

    #[test]
    fn test_saturated_air_wet_bulb_is_dry_bulb() {
        let point = wet_bulb_point(290.0, 1.0, 100000.0, 0.001, 50);
        assert!(point.converged);
        assert_abs_diff_eq!(point.value, 290.0, epsilon = 1e-3);
    }

    #[test]
    fn test_wet_bulb_between_dew_point_and_temperature() {
        let point = wet_bulb_point(280.0, 0.8, 101325.0, DEFAULT_PRECISION, DEFAULT_MAX_ITERATIONS);
        let dew_point = dew_point_temperature(280.0, 0.8);
        assert!(point.converged);
        assert!(point.value > dew_point && point.value < 280.0, "Tw = {}", point.value);
    }

    #[test]
    fn test_dry_hot_air_cools_strongly() {
        let point = wet_bulb_point(308.15, 0.2, 100000.0, 0.001, 50);
        assert!(point.converged);
        // 35°C at 20% RH has a wet-bulb near 19-20°C
        let tw_c = point.value - ZERO_CELSIUS;
        assert!(tw_c > 17.0 && tw_c < 22.0, "Tw = {tw_c}°C");
    }

    #[test]
    fn test_iteration_cap_flags_non_convergence() {
        let point = wet_bulb_point(308.15, 0.2, 100000.0, 1e-14, 1);
        assert!(!point.converged);
        assert_eq!(point.iterations, 1);
        assert!(point.value < 308.15);
    }

    #[test]
    fn test_nan_input_propagates() {
        let point = wet_bulb_point(f64::NAN, 0.5, 100000.0, 0.05, 50);
        assert!(point.value.is_nan());
    }

    #[test]
    fn test_field_solve_converts_units() {
        let t = scalar_field("air_temperature", "degC", vec![6.85, 20.0]);
        let rh = scalar_field("relative_humidity", "%", vec![80.0, 50.0]);
        let p = scalar_field("air_pressure", "hPa", vec![1013.25, 1000.0]);
        let out = wet_bulb_temperature(&t, &rh, &p, 0.05).unwrap();
        assert_eq!(out.field.units(), "K");
        assert_eq!(out.field.name(), "wet_bulb_temperature");
        assert!(out.convergence.all_converged());
        let tw = out.field.data()[[0]];
        assert!(tw > dew_point_temperature(280.0, 0.8) && tw < 280.0);
    }

    #[test]
    fn test_field_solve_keeps_estimates_at_iteration_cap() {
        let t = scalar_field("air_temperature", "K", vec![308.15, 300.0]);
        let rh = scalar_field("relative_humidity", "1", vec![0.2, 0.3]);
        let p = scalar_field("air_pressure", "Pa", vec![1e5, 9e4]);
        let out = WetBulbSolver::new(1e-14)
            .with_max_iterations(1)
            .solve(&t, &rh, &p)
            .unwrap();
        assert_eq!(out.convergence.unconverged_count(), 2);
        assert!(!out.convergence.all_converged());

        let single = wet_bulb_point(308.15, 0.2, 1e5, 1e-14, 1);
        assert_eq!(out.field.data()[[0]], single.value);
        assert!(out.field.data()[[1]] < 300.0);
    }

    #[test]
    fn test_field_solve_rejects_grid_mismatch() {
        let t = scalar_field("air_temperature", "K", vec![280.0, 281.0]);
        let rh = scalar_field("relative_humidity", "1", vec![0.5, 0.5, 0.5]);
        let p = scalar_field("air_pressure", "Pa", vec![1e5, 1e5]);
        let err = wet_bulb_temperature(&t, &rh, &p, 0.05).unwrap_err();
        assert!(matches!(err, Error::GridMismatch { .. }));
    }

    #[test]
    fn test_non_positive_precision_rejected() {
        let t = scalar_field("air_temperature", "K", vec![280.0]);
        let rh = scalar_field("relative_humidity", "1", vec![0.5]);
        let p = scalar_field("air_pressure", "Pa", vec![1e5]);
        let err = wet_bulb_temperature(&t, &rh, &p, 0.0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "precision", .. }));
    }
}
