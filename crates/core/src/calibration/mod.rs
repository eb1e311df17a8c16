//! Ensemble calibration by minimum-CRPS regression
//!
//! Fits a location/scale model to historic forecast/truth pairs and applies it
//! to the current forecast. Two fitting strategies:
//!
//! - **EMOS** (Ensemble Model Output Statistics): one coefficient set pooled
//!   over every grid point and training time.
//! - **NGR** (Nonhomogeneous Gaussian Regression, per point): an independent
//!   coefficient set for each grid point, fitted in parallel.
//!
//! Either way the predictive variance is `γ² + δ²·s²`, so the fitted scale is
//! always real, and the location is a linear function of either the ensemble
//! mean or of each member.

mod fit;
pub mod minimise;

use self::fit::{Model, TrainingSet};
use self::minimise::NelderMead;
use crate::distribution::Distribution;
use crate::error::{Error, Result};
use crate::field::{Field, REALIZATION, TIME};
use crate::units::convert_field;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Default Nelder–Mead iteration cap
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Default Nelder–Mead tolerance on both objective and coefficients
pub const DEFAULT_TOLERANCE: f64 = 1e-4;

/// Coefficient fitting strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    /// One global coefficient set
    #[default]
    Emos,
    /// One coefficient set per grid point
    Ngr,
}

impl CalibrationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CalibrationMethod::Emos => "emos",
            CalibrationMethod::Ngr => "ngr",
        }
    }
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalibrationMethod {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "emos" | "ensemble model output statistics" => Ok(CalibrationMethod::Emos),
            "ngr" | "nonhomogeneous gaussian regression" => Ok(CalibrationMethod::Ngr),
            _ => Err(Error::UnknownMethod(s.to_string())),
        }
    }
}

/// Predictor used for the location parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorMode {
    /// `μ = a + b·x̄`
    #[default]
    Mean,
    /// `μ = a + Σ bₘ·xₘ`
    Members,
}

impl PredictorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictorMode::Mean => "mean",
            PredictorMode::Members => "members",
        }
    }
}

impl fmt::Display for PredictorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictorMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(PredictorMode::Mean),
            "members" | "realizations" => Ok(PredictorMode::Members),
            _ => Err(Error::UnknownPredictorMode(s.to_string())),
        }
    }
}

/// Calibration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub method: CalibrationMethod,
    pub distribution: Distribution,
    pub predictor_mode: PredictorMode,
    /// Unit to calibrate in; `None` keeps the current forecast's unit
    pub units: Option<String>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::default(),
            distribution: Distribution::default(),
            predictor_mode: PredictorMode::default(),
            units: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl CalibrationSettings {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::invalid("max_iterations", "must be at least 1"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(Error::invalid(
                "tolerance",
                format!("must be finite and positive, got {}", self.tolerance),
            ));
        }
        Ok(())
    }
}

/// Fitted coefficients, owned by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressionCoefficients {
    Global {
        names: Vec<String>,
        values: Vec<f64>,
    },
    PerPoint {
        names: Vec<String>,
        /// One row per grid point, in flattened grid order
        values: Vec<Vec<f64>>,
    },
}

impl RegressionCoefficients {
    pub fn names(&self) -> &[String] {
        match self {
            RegressionCoefficients::Global { names, .. }
            | RegressionCoefficients::PerPoint { names, .. } => names,
        }
    }

    /// Coefficients in force at flattened grid point `point`
    pub fn for_point(&self, point: usize) -> Option<&[f64]> {
        match self {
            RegressionCoefficients::Global { values, .. } => Some(values),
            RegressionCoefficients::PerPoint { values, .. } => {
                values.get(point).map(Vec::as_slice)
            }
        }
    }
}

/// Summary of the minimisations behind one calibration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDiagnostics {
    /// Coefficient sets fitted by minimisation
    pub fits: usize,
    /// Fits that hit the iteration cap
    pub non_converged: usize,
    /// NGR points with no valid training data
    pub fallback_points: usize,
    /// Valid training samples used
    pub training_samples: usize,
    /// Mean CRPS at the optimum, averaged over fits
    pub mean_crps: f64,
}

/// Calibrated location and squared scale on the forecast grid
#[derive(Debug, Clone)]
pub struct CalibratedDistribution {
    pub mean: Field,
    pub variance: Field,
    pub distribution: Distribution,
}

/// Everything `calibrate` produces
#[derive(Debug, Clone)]
pub struct CalibrationOutput {
    pub distribution: CalibratedDistribution,
    pub coefficients: RegressionCoefficients,
    pub diagnostics: CalibrationDiagnostics,
}

/// One fitted coefficient set, before aggregation
struct PointFit {
    coefficients: Vec<f64>,
    samples: usize,
    /// None for fallback points
    outcome: Option<(bool, f64)>,
}

/// Calibrate `current_forecast` against historic forecast/truth pairs.
///
/// Shapes: current `[realization, S…]`, historic forecast
/// `[realization, time, S…]`, historic truth `[time, S…]`, in any dimension
/// order. `S` must match across all three and the `time` points of forecast
/// and truth must agree. Every current member value must be finite; the
/// current forecast may carry at most one `time` point.
pub fn calibrate(
    current_forecast: &Field,
    historic_forecast: &Field,
    historic_truth: &Field,
    settings: &CalibrationSettings,
) -> Result<CalibrationOutput> {
    settings.validate()?;

    let target_units = settings
        .units
        .clone()
        .unwrap_or_else(|| current_forecast.units().to_string());
    let current = convert_field(current_forecast, &target_units)?;
    let historic = convert_field(historic_forecast, &target_units)?;
    let truth = convert_field(historic_truth, &target_units)?;

    current.require_dim(REALIZATION)?;
    let members = current.dim_len(REALIZATION);
    historic.require_dim(REALIZATION)?;
    historic.require_dim(TIME)?;
    truth.require_dim(TIME)?;
    if current.dim_len(TIME) > 1 {
        return Err(Error::ShapeMismatch {
            field: current.name().to_string(),
            detail: format!(
                "current forecast has {} `time` points; calibrate one forecast time per call",
                current.dim_len(TIME)
            ),
        });
    }
    current.check_same_grid(&historic, &[REALIZATION, TIME])?;
    current.check_same_grid(&truth, &[REALIZATION, TIME])?;
    if historic.coord(TIME) != truth.coord(TIME) {
        return Err(Error::GridMismatch {
            left: historic.name().to_string(),
            right: truth.name().to_string(),
            detail: "`time` coordinates differ".to_string(),
        });
    }
    let historic_members = historic.dim_len(REALIZATION);
    if settings.predictor_mode == PredictorMode::Members && historic_members != members {
        return Err(Error::ShapeMismatch {
            field: historic.name().to_string(),
            detail: format!(
                "members mode needs equal member counts: current has {members}, historic has {historic_members}"
            ),
        });
    }

    let current_table = current.flatten_trailing(&[REALIZATION])?;
    let historic_table = historic.flatten_trailing(&[TIME, REALIZATION])?;
    let truth_table = truth.flatten_trailing(&[TIME])?;
    let points = current_table.nrows();
    let times = truth_table.ncols();
    if historic_table.nrows() != points || truth_table.nrows() != points {
        return Err(Error::ShapeMismatch {
            field: historic.name().to_string(),
            detail: format!(
                "{points} current grid points but {} historic and {} truth points",
                historic_table.nrows(),
                truth_table.nrows()
            ),
        });
    }
    let incomplete = current_table
        .outer_iter()
        .filter(|row| row.iter().any(|v| !v.is_finite()))
        .count();
    if incomplete > 0 {
        return Err(Error::invalid(
            "current_forecast",
            format!("{incomplete} of {points} grid points have non-finite member values"),
        ));
    }

    info!(
        method = %settings.method,
        distribution = %settings.distribution,
        predictor_mode = %settings.predictor_mode,
        points,
        times,
        members,
        "Calibrating ensemble"
    );

    let model = Model {
        mode: settings.predictor_mode,
        members: historic_members,
    };
    let minimiser = NelderMead::new(settings.max_iterations, settings.tolerance);
    let training = |point: usize, set: &mut TrainingSet| {
        let forecasts = historic_table.row(point);
        let truths = truth_table.row(point);
        for t in 0..times {
            let sample: Vec<f64> = (0..historic_members)
                .map(|m| forecasts[t * historic_members + m])
                .collect();
            set.push(&sample, truths[t]);
        }
    };

    let fits: Vec<PointFit> = match settings.method {
        CalibrationMethod::Emos => {
            let mut set = TrainingSet::new(historic_members);
            for point in 0..points {
                training(point, &mut set);
            }
            if set.is_empty() {
                return Err(Error::InsufficientTrainingData(format!(
                    "no finite forecast/truth pairs across {points} points and {times} times"
                )));
            }
            let outcome = set.fit(&model, settings.distribution, &minimiser);
            debug!(
                iterations = outcome.iterations,
                crps = outcome.value,
                samples = set.len(),
                "EMOS fit finished"
            );
            vec![PointFit {
                coefficients: outcome.x.as_slice().to_vec(),
                samples: set.len(),
                outcome: Some((outcome.converged, outcome.value)),
            }]
        }
        CalibrationMethod::Ngr => (0..points)
            .into_par_iter()
            .map(|point| {
                let mut set = TrainingSet::new(historic_members);
                training(point, &mut set);
                if set.is_empty() {
                    return PointFit {
                        coefficients: model.raw_ensemble_coefficients(),
                        samples: 0,
                        outcome: None,
                    };
                }
                let outcome = set.fit(&model, settings.distribution, &minimiser);
                PointFit {
                    coefficients: outcome.x.as_slice().to_vec(),
                    samples: set.len(),
                    outcome: Some((outcome.converged, outcome.value)),
                }
            })
            .collect(),
    };

    let diagnostics = summarise(&fits);
    if diagnostics.fallback_points > 0 {
        warn!(
            points = diagnostics.fallback_points,
            "No valid training data at some points; using raw ensemble statistics there"
        );
    }
    if diagnostics.non_converged > 0 {
        warn!(
            fits = diagnostics.non_converged,
            max_iterations = settings.max_iterations,
            "Minimisation did not converge; using best coefficients found"
        );
    }

    let names = model.coefficient_names();
    let coefficients = match settings.method {
        CalibrationMethod::Emos => RegressionCoefficients::Global {
            names,
            values: fits
                .into_iter()
                .next()
                .map(|fit| fit.coefficients)
                .unwrap_or_default(),
        },
        CalibrationMethod::Ngr => RegressionCoefficients::PerPoint {
            names,
            values: fits.into_iter().map(|fit| fit.coefficients).collect(),
        },
    };

    let distribution = apply(&current, &current_table, &model, &coefficients, settings.distribution)?;
    Ok(CalibrationOutput {
        distribution,
        coefficients,
        diagnostics,
    })
}

fn summarise(fits: &[PointFit]) -> CalibrationDiagnostics {
    let fitted: Vec<(bool, f64)> = fits.iter().filter_map(|f| f.outcome).collect();
    let mean_crps = if fitted.is_empty() {
        f64::NAN
    } else {
        fitted.iter().map(|(_, crps)| crps).sum::<f64>() / fitted.len() as f64
    };
    CalibrationDiagnostics {
        fits: fitted.len(),
        non_converged: fitted.iter().filter(|(converged, _)| !converged).count(),
        fallback_points: fits.len() - fitted.len(),
        training_samples: fits.iter().map(|f| f.samples).sum(),
        mean_crps,
    }
}

/// Apply the fitted coefficients to the current forecast.
fn apply(
    current: &Field,
    table: &Array2<f64>,
    model: &Model,
    coefficients: &RegressionCoefficients,
    distribution: Distribution,
) -> Result<CalibratedDistribution> {
    let predictions: Vec<(f64, f64)> = table
        .outer_iter()
        .enumerate()
        .map(|(point, row)| {
            let members: Vec<f64> = row.iter().copied().collect();
            let Some(coeffs) = coefficients.for_point(point) else {
                return Err(Error::ShapeMismatch {
                    field: current.name().to_string(),
                    detail: format!("no coefficients for grid point {point}"),
                });
            };
            let (mu, variance) = model.predict(coeffs, &members);
            if !(mu.is_finite() && variance.is_finite()) {
                return Err(Error::NumericalInstability {
                    stage: "calibration",
                    detail: format!("non-finite mean or variance at grid point {point}"),
                });
            }
            Ok((mu, variance.max(0.0)))
        })
        .collect::<Result<_>>()?;

    let grid = current.leading_coords(&[REALIZATION]);
    let mean = Field::from_values(
        current.name(),
        current.units(),
        grid.clone(),
        predictions.iter().map(|(mu, _)| *mu).collect(),
    )?
    .with_attribute("calibration_statistic", "location");
    let variance = Field::from_values(
        current.name(),
        format!("{}^2", current.units()),
        grid,
        predictions.iter().map(|(_, var)| *var).collect(),
    )?
    .with_attribute("calibration_statistic", "squared_scale");

    Ok(CalibratedDistribution {
        mean,
        variance,
        distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DimCoord;
    use approx::assert_abs_diff_eq;

    const TIMES: usize = 12;
    const MEMBERS: usize = 4;

    fn grid() -> Vec<DimCoord> {
        vec![DimCoord::new("x", "m", vec![0.0, 1000.0])]
    }

    /// Truth cycles between 270 and 281 K; forecasts run `bias` warm with a
    /// symmetric member spread.
    fn training_data(bias: f64) -> (Field, Field, Field) {
        let time = DimCoord::new(TIME, "s", (0..TIMES).map(|t| t as f64 * 86400.0).collect());
        let mut truth = Vec::new();
        for t in 0..TIMES {
            for x in 0..2 {
                truth.push(270.0 + (t % 12) as f64 + x as f64);
            }
        }
        let mut forecast = Vec::new();
        for m in 0..MEMBERS {
            for t in 0..TIMES {
                for x in 0..2 {
                    let jitter = if t % 2 == 0 { 0.4 } else { -0.4 };
                    forecast.push(truth[t * 2 + x] + bias + jitter + (m as f64 - 1.5) * 0.5);
                }
            }
        }
        let mut fc_coords = vec![DimCoord::index(REALIZATION, MEMBERS), time.clone()];
        fc_coords.extend(grid());
        let historic = Field::from_values("air_temperature", "K", fc_coords, forecast).unwrap();
        let mut truth_coords = vec![time];
        truth_coords.extend(grid());
        let truth = Field::from_values("air_temperature", "K", truth_coords, truth).unwrap();

        let mut current_coords = vec![DimCoord::index(REALIZATION, MEMBERS)];
        current_coords.extend(grid());
        let current = Field::from_values(
            "air_temperature",
            "K",
            current_coords,
            vec![276.0, 277.0, 276.5, 277.5, 277.0, 278.0, 277.5, 278.5],
        )
        .unwrap();
        (current, historic, truth)
    }

    #[test]
    fn test_parse_method_and_mode() {
        assert_eq!("NGR".parse::<CalibrationMethod>().unwrap(), CalibrationMethod::Ngr);
        assert_eq!("emos".parse::<CalibrationMethod>().unwrap(), CalibrationMethod::Emos);
        assert!(matches!("kalman".parse::<CalibrationMethod>(), Err(Error::UnknownMethod(_))));
        assert_eq!("Members".parse::<PredictorMode>().unwrap(), PredictorMode::Members);
        let err = "median".parse::<PredictorMode>().unwrap_err();
        assert!(err.to_string().contains("`mean` or `members`"));
    }

    #[test]
    fn test_emos_removes_warm_bias() {
        let (current, historic, truth) = training_data(2.0);
        let out = calibrate(&current, &historic, &truth, &CalibrationSettings::default()).unwrap();
        assert!(matches!(out.coefficients, RegressionCoefficients::Global { .. }));
        assert_eq!(out.diagnostics.fits, 1);
        assert_eq!(out.diagnostics.training_samples, TIMES * 2);

        let mean = out.distribution.mean.data();
        // raw ensemble means are 276.75 and 277.75
        assert_abs_diff_eq!(mean[[0]], 274.75, epsilon = 0.5);
        assert_abs_diff_eq!(mean[[1]], 275.75, epsilon = 0.5);
        assert!(out.distribution.variance.data().iter().all(|v| *v >= 0.0));
        assert_eq!(out.distribution.mean.coords(), grid().as_slice());
    }

    #[test]
    fn test_ngr_fits_each_point() {
        let (current, historic, truth) = training_data(-1.0);
        let settings = CalibrationSettings {
            method: CalibrationMethod::Ngr,
            ..CalibrationSettings::default()
        };
        let out = calibrate(&current, &historic, &truth, &settings).unwrap();
        match &out.coefficients {
            RegressionCoefficients::PerPoint { values, names } => {
                assert_eq!(values.len(), 2);
                assert_eq!(names.len(), 4);
            }
            other => panic!("expected per-point coefficients, got {other:?}"),
        }
        assert_eq!(out.diagnostics.fits, 2);
        assert_abs_diff_eq!(out.distribution.mean.data()[[0]], 277.75, epsilon = 0.5);
    }

    #[test]
    fn test_ngr_falls_back_without_training_data() {
        let (current, historic, truth) = training_data(0.0);
        let nan_truth = truth.with_data(truth.data().mapv(|_| f64::NAN)).unwrap();
        let settings = CalibrationSettings {
            method: CalibrationMethod::Ngr,
            ..CalibrationSettings::default()
        };
        let out = calibrate(&current, &historic, &nan_truth, &settings).unwrap();
        assert_eq!(out.diagnostics.fallback_points, 2);
        // a=0, b=1: raw ensemble mean
        assert_abs_diff_eq!(out.distribution.mean.data()[[0]], 276.75, epsilon = 1e-9);
    }

    #[test]
    fn test_emos_without_training_data_is_error() {
        let (current, historic, truth) = training_data(0.0);
        let nan_truth = truth.with_data(truth.data().mapv(|_| f64::NAN)).unwrap();
        let err = calibrate(&current, &historic, &nan_truth, &CalibrationSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientTrainingData(_)));
    }

    #[test]
    fn test_members_mode_coefficient_count() {
        let (current, historic, truth) = training_data(1.0);
        let settings = CalibrationSettings {
            predictor_mode: PredictorMode::Members,
            ..CalibrationSettings::default()
        };
        let out = calibrate(&current, &historic, &truth, &settings).unwrap();
        assert_eq!(out.coefficients.names().len(), MEMBERS + 3);
        assert!(out.distribution.mean.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_units_conversion_before_fitting() {
        let (current, historic, truth) = training_data(0.0);
        let settings = CalibrationSettings {
            units: Some("degC".to_string()),
            ..CalibrationSettings::default()
        };
        let out = calibrate(&current, &historic, &truth, &settings).unwrap();
        assert_eq!(out.distribution.mean.units(), "degC");
        let mean = out.distribution.mean.data()[[0]];
        assert!(mean > 0.0 && mean < 10.0, "mean {mean} should be in Celsius");
    }

    #[test]
    fn test_truth_without_time_dimension_rejected() {
        let (current, historic, truth) = training_data(0.0);
        let shifted = truth.rename_coordinate(TIME, "forecast_reference_time");
        let err = calibrate(&current, &historic, &shifted, &CalibrationSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::MissingDimension { .. }));
    }

    #[test]
    fn test_current_with_several_times_rejected() {
        let (_, historic, truth) = training_data(0.0);
        let mut coords = vec![
            DimCoord::index(REALIZATION, MEMBERS),
            DimCoord::new(TIME, "s", vec![0.0, 3600.0]),
        ];
        coords.extend(grid());
        let values = (0..MEMBERS * 2 * 2).map(|i| 276.0 + (i % 3) as f64).collect();
        let current = Field::from_values("air_temperature", "K", coords, values).unwrap();
        let err = calibrate(&current, &historic, &truth, &CalibrationSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "got {err}");
    }

    #[test]
    fn test_non_finite_current_member_rejected() {
        let (current, historic, truth) = training_data(0.0);
        let mut data = current.data().clone();
        data[[1, 1]] = f64::NAN;
        let current = current.with_data(data).unwrap();
        let err = calibrate(&current, &historic, &truth, &CalibrationSettings::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgument {
                name: "current_forecast",
                ..
            }
        ));
        assert!(err.to_string().contains("1 of 2 grid points"));
    }

    #[test]
    fn test_iteration_cap_keeps_best_coefficients() {
        let (current, historic, truth) = training_data(2.0);
        let settings = CalibrationSettings {
            max_iterations: 1,
            ..CalibrationSettings::default()
        };
        let out = calibrate(&current, &historic, &truth, &settings).unwrap();
        assert_eq!(out.diagnostics.fits, 1);
        assert_eq!(out.diagnostics.non_converged, 1);
        assert!(out.diagnostics.mean_crps.is_finite());
        assert!(out.distribution.mean.data().iter().all(|v| v.is_finite()));
        assert!(out.distribution.variance.data().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_coefficients_serialise() {
        let coefficients = RegressionCoefficients::Global {
            names: vec!["alpha".into(), "beta".into(), "gamma".into(), "delta".into()],
            values: vec![0.1, 0.9, 0.5, 1.1],
        };
        let json = serde_json::to_string(&coefficients).unwrap();
        assert!(json.contains("\"kind\":\"global\""));
        let back: RegressionCoefficients = serde_json::from_str(&json).unwrap();
        assert_eq!(back, coefficients);
    }
}
