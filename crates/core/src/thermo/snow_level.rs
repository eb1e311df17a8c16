//! Falling-snow level from vertical wet-bulb profiles
//!
//! Snow melts as it falls through air whose wet-bulb temperature is above
//! freezing. Integrating the positive part of `Tw - 273.15` downward from the
//! top of the profile gives the accumulated melting potential (K·m); the
//! falling-snow level is the height where that integral first reaches the
//! threshold.
//!
//! Profiles that never accumulate enough melting put the level at the lowest
//! model height (snow reaches the ground). A non-positive threshold can be met
//! at the top of the profile already, in which case the level is the top
//! height.

use super::constants::ZERO_CELSIUS;
use super::wet_bulb::{ConvergenceMask, WetBulbSolver};
use crate::error::{Error, Result};
use crate::field::{DimCoord, Field, HEIGHT, REALIZATION};
use crate::units::{convert_field, convert_value};
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Default melting threshold on the wet-bulb integral (K·m)
pub const DEFAULT_FALLING_LEVEL_THRESHOLD: f64 = 90.0;

/// Where in the profile a point's level was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelKind {
    Interpolated,
    Surface,
    ProfileTop,
    Missing,
}

/// Falling-snow level field and per-point diagnostics
#[derive(Debug, Clone)]
pub struct SnowLevelOutput {
    /// Level above sea level (m)
    pub field: Field,
    /// Convergence of the underlying wet-bulb solve, per (height, point)
    pub wet_bulb_convergence: ConvergenceMask,
    /// Points whose level was set to the lowest profile height
    pub at_surface: usize,
    /// Points whose level was set to the top profile height
    pub at_profile_top: usize,
}

/// Falling-snow level settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnowLevelSolver {
    pub wet_bulb: WetBulbSolver,
    /// Melting threshold (K·m)
    pub threshold: f64,
}

impl Default for SnowLevelSolver {
    fn default() -> Self {
        Self {
            wet_bulb: WetBulbSolver::default(),
            threshold: DEFAULT_FALLING_LEVEL_THRESHOLD,
        }
    }
}

impl SnowLevelSolver {
    #[must_use]
    pub fn new(precision: f64, threshold: f64) -> Self {
        Self {
            wet_bulb: WetBulbSolver::new(precision),
            threshold,
        }
    }

    /// Compute the falling-snow level above sea level.
    ///
    /// `temperature`, `relative_humidity` and `pressure` must share a grid
    /// with an ascending `height` dimension of at least two levels.
    /// `orography` must carry exactly the remaining grid dimensions once
    /// `height` and any leading `realization` are removed; it is repeated
    /// across members.
    pub fn solve(
        &self,
        temperature: &Field,
        relative_humidity: &Field,
        pressure: &Field,
        orography: &Field,
    ) -> Result<SnowLevelOutput> {
        if !self.threshold.is_finite() {
            return Err(Error::invalid("threshold", "must be finite"));
        }

        let heights = profile_heights(temperature)?;
        let orography = convert_field(orography, "m")?;
        let grid = temperature.leading_coords(&[HEIGHT]);
        check_orography_grid(temperature.name(), &grid, &orography)?;

        let wet_bulb = self
            .wet_bulb
            .solve(temperature, relative_humidity, pressure)?;
        let profiles = wet_bulb
            .field
            .flatten_trailing(&[HEIGHT])?
            .into_raw_vec();
        let surface: Vec<f64> = orography.data().iter().copied().collect();
        let n_levels = heights.len();

        info!(
            profiles = profiles.len() / n_levels,
            levels = n_levels,
            threshold = self.threshold,
            "Computing falling-snow level"
        );

        let levels: Vec<(f64, LevelKind)> = profiles
            .par_chunks(n_levels)
            .enumerate()
            .map(|(point, profile)| {
                let (height, kind) = level_in_profile(profile, &heights, self.threshold);
                // Rows run member-major, so each member repeats the surface grid
                let base = surface[point % surface.len()];
                (base + height, kind)
            })
            .collect();

        let at_surface = levels.iter().filter(|(_, k)| *k == LevelKind::Surface).count();
        let at_profile_top = levels
            .iter()
            .filter(|(_, k)| *k == LevelKind::ProfileTop)
            .count();
        let missing = levels.iter().filter(|(_, k)| *k == LevelKind::Missing).count();
        debug!(at_surface, at_profile_top, missing, "Falling-snow level edge cases");

        let values = levels.into_iter().map(|(v, _)| v).collect();
        let field = Field::from_values("falling_snow_level_asl", "m", grid, values)?;
        Ok(SnowLevelOutput {
            field,
            wet_bulb_convergence: wet_bulb.convergence,
            at_surface,
            at_profile_top,
        })
    }
}

/// Falling-snow level with the default Newton iteration cap.
pub fn falling_snow_level(
    temperature: &Field,
    relative_humidity: &Field,
    pressure: &Field,
    orography: &Field,
    precision: f64,
    threshold: f64,
) -> Result<SnowLevelOutput> {
    SnowLevelSolver::new(precision, threshold).solve(
        temperature,
        relative_humidity,
        pressure,
        orography,
    )
}

/// Height coordinate in metres, validated as ascending with ≥ 2 levels.
fn profile_heights(field: &Field) -> Result<Vec<f64>> {
    let coord = field
        .coord(HEIGHT)
        .ok_or_else(|| Error::missing_dimension(field.name(), HEIGHT))?;
    if coord.len() < 2 {
        return Err(Error::invalid(
            "height",
            format!("need at least 2 levels, got {}", coord.len()),
        ));
    }
    let heights = coord
        .points
        .iter()
        .map(|&h| convert_value(h, &coord.units, "m"))
        .collect::<Result<Vec<f64>>>()?;
    if heights
        .windows(2)
        .any(|w| w[1].partial_cmp(&w[0]) != Some(Ordering::Greater))
    {
        return Err(Error::invalid(
            "height",
            "levels must be strictly ascending",
        ));
    }
    Ok(heights)
}

/// Orography must carry exactly the profile grid, less any leading
/// `realization` dimension.
fn check_orography_grid(profile_name: &str, grid: &[DimCoord], orography: &Field) -> Result<()> {
    let horizontal = match grid.first() {
        Some(first) if first.name == REALIZATION => &grid[1..],
        _ => grid,
    };
    let oro = orography.coords();
    let mismatch = |detail: String| Error::GridMismatch {
        left: profile_name.to_string(),
        right: orography.name().to_string(),
        detail,
    };
    if oro.len() != horizontal.len() {
        return Err(mismatch(format!(
            "orography has {} dimensions, profile grid has {} horizontal dimensions",
            oro.len(),
            horizontal.len()
        )));
    }
    for (a, b) in horizontal.iter().zip(oro) {
        if a != b {
            return Err(mismatch(format!(
                "orography coordinate `{}` does not match `{}`",
                b.name, a.name
            )));
        }
    }
    Ok(())
}

/// Level (m above ground) in one wet-bulb profile ordered bottom to top.
fn level_in_profile(wet_bulb: &[f64], heights: &[f64], threshold: f64) -> (f64, LevelKind) {
    if wet_bulb.iter().any(|v| !v.is_finite()) {
        return (f64::NAN, LevelKind::Missing);
    }
    let n = heights.len();
    let positive = |k: usize| (wet_bulb[k] - ZERO_CELSIUS).max(0.0);

    // Trapezoid integral from the top down; integral[n - 1] == 0
    let mut integral = vec![0.0; n];
    for k in (0..n - 1).rev() {
        integral[k] = integral[k + 1] + 0.5 * (positive(k) + positive(k + 1)) * (heights[k + 1] - heights[k]);
    }

    if integral[n - 1] >= threshold {
        return (heights[n - 1], LevelKind::ProfileTop);
    }
    if integral[0] < threshold {
        return (heights[0], LevelKind::Surface);
    }

    for k in (0..n - 1).rev() {
        if integral[k] >= threshold {
            let (upper, lower) = (integral[k + 1], integral[k]);
            let fraction = (threshold - upper) / (lower - upper);
            let height = heights[k + 1] - fraction * (heights[k + 1] - heights[k]);
            return (height, LevelKind::Interpolated);
        }
    }
    (heights[0], LevelKind::Surface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_cold_profile_snows_to_ground() {
        let heights = [0.0, 500.0, 1000.0];
        let (h, kind) = level_in_profile(&[270.0, 268.0, 265.0], &heights, 90.0);
        assert_eq!(kind, LevelKind::Surface);
        assert_eq!(h, 0.0);
    }

    #[test]
    fn test_linear_interpolation_within_layer() {
        // 1 K above freezing everywhere: integral = 1 K × depth below top
        let heights = [0.0, 100.0, 200.0];
        let profile = [274.15, 274.15, 274.15];
        let (h, kind) = level_in_profile(&profile, &heights, 150.0);
        assert_eq!(kind, LevelKind::Interpolated);
        assert_abs_diff_eq!(h, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_warm_layer_near_ground() {
        // Freezing aloft, +2 K at the surface
        let heights = [0.0, 200.0, 400.0];
        let profile = [275.15, 273.15, 270.0];
        // integral: top 0, middle 0, bottom 0.5·2·200 = 200
        let (h, kind) = level_in_profile(&profile, &heights, 90.0);
        assert_eq!(kind, LevelKind::Interpolated);
        assert_abs_diff_eq!(h, 200.0 - 90.0 / 200.0 * 200.0, epsilon = 1e-9);
    }

    #[test]
    fn test_non_positive_threshold_sits_at_profile_top() {
        let heights = [0.0, 100.0];
        let (h, kind) = level_in_profile(&[280.0, 275.0], &heights, 0.0);
        assert_eq!(kind, LevelKind::ProfileTop);
        assert_eq!(h, 100.0);
    }

    #[test]
    fn test_missing_profile_yields_nan() {
        let (h, kind) = level_in_profile(&[f64::NAN, 275.0], &[0.0, 100.0], 90.0);
        assert_eq!(kind, LevelKind::Missing);
        assert!(h.is_nan());
    }

    fn column(name: &str, units: &str, heights: &[f64], values: Vec<f64>) -> Field {
        let coords = vec![
            DimCoord::new(HEIGHT, "m", heights.to_vec()),
            DimCoord::new("x", "m", vec![0.0, 1000.0]),
        ];
        Field::from_values(name, units, coords, values).unwrap()
    }

    #[test]
    fn test_solve_adds_orography() {
        let heights = [0.0, 200.0, 400.0, 600.0];
        // x=0 warm at the surface, x=1 cold throughout
        let t = column(
            "air_temperature",
            "K",
            &heights,
            vec![280.0, 265.0, 276.0, 263.0, 272.0, 261.0, 268.0, 259.0],
        );
        let rh = column("relative_humidity", "1", &heights, vec![0.9; 8]);
        let p = column(
            "air_pressure",
            "Pa",
            &heights,
            vec![100000.0, 100000.0, 97700.0, 97700.0, 95400.0, 95400.0, 93200.0, 93200.0],
        );
        let orography = Field::from_values(
            "surface_altitude",
            "m",
            vec![DimCoord::new("x", "m", vec![0.0, 1000.0])],
            vec![100.0, 350.0],
        )
        .unwrap();

        let out = falling_snow_level(&t, &rh, &p, &orography, 0.05, 90.0).unwrap();
        assert_eq!(out.field.name(), "falling_snow_level_asl");
        assert_eq!(out.field.units(), "m");
        assert_eq!(out.field.shape(), &[2]);
        let warm = out.field.data()[[0]];
        let cold = out.field.data()[[1]];
        assert!(warm > 100.0 && warm < 700.0, "warm level {warm}");
        assert_abs_diff_eq!(cold, 350.0);
        assert_eq!(out.at_surface, 1);
    }

    #[test]
    fn test_rejects_single_level_profiles() {
        let t = column("air_temperature", "K", &[0.0], vec![280.0, 280.0]);
        let rh = column("relative_humidity", "1", &[0.0], vec![0.5, 0.5]);
        let p = column("air_pressure", "Pa", &[0.0], vec![1e5, 1e5]);
        let oro = Field::from_values(
            "surface_altitude",
            "m",
            vec![DimCoord::new("x", "m", vec![0.0, 1000.0])],
            vec![0.0, 0.0],
        )
        .unwrap();
        let err = falling_snow_level(&t, &rh, &p, &oro, 0.05, 90.0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "height", .. }));
    }

    #[test]
    fn test_rejects_mismatched_orography() {
        let heights = [0.0, 100.0];
        let t = column("air_temperature", "K", &heights, vec![275.0; 4]);
        let rh = column("relative_humidity", "1", &heights, vec![0.5; 4]);
        let p = column("air_pressure", "Pa", &heights, vec![1e5; 4]);
        let oro = Field::from_values(
            "surface_altitude",
            "m",
            vec![DimCoord::new("y", "m", vec![0.0, 1000.0])],
            vec![0.0, 0.0],
        )
        .unwrap();
        let err = falling_snow_level(&t, &rh, &p, &oro, 0.05, 90.0).unwrap_err();
        assert!(matches!(err, Error::GridMismatch { .. }));
    }

    fn fields_on(coords: &[DimCoord], temperature: f64) -> (Field, Field, Field) {
        let n: usize = coords.iter().map(DimCoord::len).product();
        let field = |name: &str, units: &str, value: f64| {
            Field::from_values(name, units, coords.to_vec(), vec![value; n]).unwrap()
        };
        (
            field("air_temperature", "K", temperature),
            field("relative_humidity", "1", 0.9),
            field("air_pressure", "Pa", 95000.0),
        )
    }

    #[test]
    fn test_rejects_orography_missing_a_horizontal_dimension() {
        let coords = [
            DimCoord::new(HEIGHT, "m", vec![0.0, 500.0]),
            DimCoord::new("y", "m", vec![0.0, 1000.0]),
            DimCoord::new("x", "m", vec![0.0, 1000.0]),
        ];
        let (t, rh, p) = fields_on(&coords, 280.0);
        let oro = Field::from_values(
            "surface_altitude",
            "m",
            vec![DimCoord::new("x", "m", vec![0.0, 1000.0])],
            vec![10.0, 20.0],
        )
        .unwrap();
        let err = falling_snow_level(&t, &rh, &p, &oro, 0.05, 90.0).unwrap_err();
        assert!(matches!(err, Error::GridMismatch { .. }), "got {err}");
    }

    #[test]
    fn test_orography_repeats_across_members() {
        let coords = [
            DimCoord::index(REALIZATION, 2),
            DimCoord::new(HEIGHT, "m", vec![0.0, 500.0]),
            DimCoord::new("x", "m", vec![0.0, 1000.0]),
        ];
        let (t, rh, p) = fields_on(&coords, 265.0);
        let oro = Field::from_values(
            "surface_altitude",
            "m",
            vec![DimCoord::new("x", "m", vec![0.0, 1000.0])],
            vec![10.0, 20.0],
        )
        .unwrap();
        let out = falling_snow_level(&t, &rh, &p, &oro, 0.05, 90.0).unwrap();
        assert_eq!(out.field.shape(), &[2, 2]);
        assert_eq!(out.field.coords()[0].name, REALIZATION);
        let levels: Vec<f64> = out.field.data().iter().copied().collect();
        assert_eq!(levels, vec![10.0, 20.0, 10.0, 20.0]);
        assert_eq!(out.at_surface, 4);
    }
}
