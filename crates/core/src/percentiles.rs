//! Percentiles of a calibrated distribution
//!
//! Evenly spaced levels `pᵢ = 100·(i − ½)/n` avoid the 0th and 100th
//! percentiles, which are infinite for the gaussian family.

use crate::distribution::Distribution;
use crate::error::{Error, Result};
use crate::field::{DimCoord, Field, PERCENTILE};
use ndarray::Array2;
use rand::distr::Open01;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How percentile levels are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PercentileSampling {
    /// Evenly spaced levels at the centres of `n` equal-probability bins
    #[default]
    Quantile,
    /// Sorted uniform draws in (0, 100); a fresh seed when `None`
    Random { seed: Option<u64> },
}

/// Evenly spaced percentile levels (percent)
pub fn percentile_levels(n: usize) -> Vec<f64> {
    (1..=n)
        .map(|i| 100.0 * (i as f64 - 0.5) / n as f64)
        .collect()
}

/// `n` percentile levels (percent) chosen by `sampling`, ascending.
pub fn choose_percentiles(n: usize, sampling: PercentileSampling) -> Result<Vec<f64>> {
    if n == 0 {
        return Err(Error::invalid(
            "num_percentiles",
            "at least one percentile is required",
        ));
    }
    match sampling {
        PercentileSampling::Quantile => Ok(percentile_levels(n)),
        PercentileSampling::Random { seed } => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_rng(&mut rand::rng()),
            };
            let mut levels: Vec<f64> = (0..n)
                .map(|_| 100.0 * rng.sample::<f64, _>(Open01))
                .collect();
            levels.sort_by(f64::total_cmp);
            Ok(levels)
        }
    }
}

/// Percentiles of the calibrated distribution at `n` evenly spaced levels.
///
/// `mean` and `variance` must share a grid. The result has a leading
/// `percentile` dimension (unit `%`) and the name and unit of `mean`.
pub fn generate_percentiles(
    mean: &Field,
    variance: &Field,
    distribution: Distribution,
    num_percentiles: usize,
) -> Result<Field> {
    let levels = choose_percentiles(num_percentiles, PercentileSampling::Quantile)?;
    percentiles_at_levels(mean, variance, distribution, &levels)
}

/// Percentiles of the calibrated distribution at the given levels (percent).
pub fn percentiles_at_levels(
    mean: &Field,
    variance: &Field,
    distribution: Distribution,
    levels: &[f64],
) -> Result<Field> {
    if levels.is_empty() {
        return Err(Error::invalid(
            "num_percentiles",
            "at least one percentile is required",
        ));
    }
    if let Some(bad) = levels.iter().find(|p| !(**p > 0.0 && **p < 100.0)) {
        return Err(Error::invalid(
            "percentiles",
            format!("levels must lie strictly between 0 and 100, got {bad}"),
        ));
    }
    mean.check_same_grid(variance, &[])?;

    let mu: Vec<f64> = mean.data().iter().copied().collect();
    let var: Vec<f64> = variance.data().iter().copied().collect();
    if let Some(point) = mu
        .iter()
        .zip(&var)
        .position(|(m, v)| m.is_nan() || v.is_nan())
    {
        return Err(Error::NumericalInstability {
            stage: "percentile generation",
            detail: format!("NaN mean or variance at grid point {point}"),
        });
    }
    let clipped = var.iter().filter(|v| **v < 0.0).count();
    if clipped > 0 {
        warn!(points = clipped, "Negative variance clipped to zero");
    }
    debug!(
        points = mu.len(),
        percentiles = levels.len(),
        distribution = %distribution,
        "Generating percentiles"
    );

    let fractions: Vec<f64> = levels.iter().map(|p| p / 100.0).collect();
    let values: Vec<f64> = mu
        .par_iter()
        .zip(var.par_iter())
        .flat_map_iter(|(&m, &v)| {
            let sigma = v.max(0.0).sqrt();
            fractions
                .iter()
                .map(move |&p| distribution.quantile(p, m, sigma))
        })
        .collect();

    let table = Array2::from_shape_vec((mu.len(), levels.len()), values).map_err(|e| {
        Error::ShapeMismatch {
            field: mean.name().to_string(),
            detail: e.to_string(),
        }
    })?;
    Field::from_point_table(
        mean.name(),
        mean.units(),
        DimCoord::new(PERCENTILE, "%", levels.to_vec()),
        mean.coords().to_vec(),
        &table,
    )
}
