//! Argument definitions and stage dispatch

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nwp_post_core::calibration::{CalibrationMethod, CalibrationSettings, PredictorMode};
use nwp_post_core::config::PostProcessConfig;
use nwp_post_core::io::{load_field, save_field};
use nwp_post_core::{
    calibrate, calibrated_ensemble, choose_percentiles, percentiles_at_levels, reorder,
    Distribution, Field, PercentileSampling, PipelineOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Post-processing for numerical weather prediction output
#[derive(Parser, Debug)]
#[command(name = "nwp-post")]
#[command(about = "Ensemble calibration and thermodynamic diagnostics", long_about = None)]
pub struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wet-bulb temperature from temperature, humidity and pressure
    #[command(alias = "wet_bulb_temperature")]
    WetBulbTemperature {
        #[arg(long)]
        temperature: PathBuf,
        #[arg(long, alias = "relative_humidity")]
        relative_humidity: PathBuf,
        #[arg(long)]
        pressure: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[command(flatten)]
        solver: SolverArgs,
    },

    /// Falling-snow level above sea level from vertical profiles
    #[command(alias = "falling_snow_level")]
    FallingSnowLevel {
        #[arg(long)]
        temperature: PathBuf,
        #[arg(long, alias = "relative_humidity")]
        relative_humidity: PathBuf,
        #[arg(long)]
        pressure: PathBuf,
        #[arg(long)]
        orography: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[command(flatten)]
        solver: SolverArgs,
        /// Melting threshold on the wet-bulb integral (K m)
        #[arg(long, alias = "falling_level_threshold")]
        falling_level_threshold: Option<f64>,
    },

    /// Fit calibration coefficients and write the calibrated mean and variance
    Calibrate {
        #[command(flatten)]
        inputs: TrainingArgs,
        #[arg(long, alias = "output_mean")]
        output_mean: PathBuf,
        #[arg(long, alias = "output_variance")]
        output_variance: PathBuf,
        /// Also write the fitted coefficients as JSON
        #[arg(long, alias = "coefficients_output")]
        coefficients_output: Option<PathBuf>,
        #[command(flatten)]
        calibration: CalibrationArgs,
    },

    /// Percentiles of a calibrated distribution
    #[command(alias = "generate_percentiles")]
    GeneratePercentiles {
        #[arg(long)]
        mean: PathBuf,
        #[arg(long)]
        variance: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        distribution: Option<Distribution>,
        #[arg(long, alias = "num_percentiles", alias = "num-members", alias = "num_members")]
        num_percentiles: usize,
        /// Draw sorted uniform random levels instead of evenly spaced ones
        #[arg(long, alias = "random_percentiles")]
        random_percentiles: bool,
        /// Seed for --random-percentiles
        #[arg(long, alias = "random_seed", requires = "random_percentiles")]
        random_seed: Option<u64>,
    },

    /// Reorder percentiles into members using raw ensemble ranks
    Reorder {
        #[arg(long)]
        percentiles: PathBuf,
        #[arg(long, alias = "raw_ensemble")]
        raw_ensemble: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[command(flatten)]
        ordering: OrderingArgs,
    },

    /// Calibrate, generate percentiles and reorder in one pass
    #[command(alias = "calibrated_ensemble")]
    CalibratedEnsemble {
        #[command(flatten)]
        inputs: TrainingArgs,
        #[arg(long)]
        output: PathBuf,
        /// Members to generate (defaults to the current forecast's count)
        #[arg(long, alias = "num_members")]
        num_members: Option<usize>,
        #[command(flatten)]
        calibration: CalibrationArgs,
        #[command(flatten)]
        ordering: OrderingArgs,
    },
}

#[derive(Args, Debug)]
struct SolverArgs {
    /// Newton convergence threshold (K)
    #[arg(long)]
    precision: Option<f64>,
    #[arg(long, alias = "max_iterations")]
    max_iterations: Option<usize>,
}

#[derive(Args, Debug)]
struct TrainingArgs {
    #[arg(long)]
    current: PathBuf,
    #[arg(long, alias = "historic_forecast")]
    historic_forecast: PathBuf,
    #[arg(long, alias = "historic_truth")]
    historic_truth: PathBuf,
}

#[derive(Args, Debug)]
struct CalibrationArgs {
    /// emos or ngr
    #[arg(long)]
    method: Option<CalibrationMethod>,
    /// gaussian or truncated_gaussian
    #[arg(long)]
    distribution: Option<Distribution>,
    /// mean or members
    #[arg(long, alias = "predictor_mode")]
    predictor_mode: Option<PredictorMode>,
    /// Unit to calibrate in
    #[arg(long)]
    units: Option<String>,
    #[arg(long = "max-iterations", alias = "max_iterations")]
    max_iterations: Option<usize>,
    #[arg(long)]
    tolerance: Option<f64>,
}

impl CalibrationArgs {
    fn apply(&self, mut settings: CalibrationSettings) -> CalibrationSettings {
        if let Some(method) = self.method {
            settings.method = method;
        }
        if let Some(distribution) = self.distribution {
            settings.distribution = distribution;
        }
        if let Some(mode) = self.predictor_mode {
            settings.predictor_mode = mode;
        }
        if let Some(units) = &self.units {
            settings.units = Some(units.clone());
        }
        if let Some(max_iterations) = self.max_iterations {
            settings.max_iterations = max_iterations;
        }
        if let Some(tolerance) = self.tolerance {
            settings.tolerance = tolerance;
        }
        settings
    }
}

#[derive(Args, Debug)]
struct OrderingArgs {
    #[arg(long, alias = "random_ordering")]
    random_ordering: bool,
    #[arg(long, alias = "random_seed")]
    random_seed: Option<u64>,
}

fn load(path: &Path, what: &str) -> Result<Field> {
    load_field(path).with_context(|| format!("loading {what}"))
}

fn save(field: &Field, path: &Path) -> Result<()> {
    save_field(field, path).with_context(|| format!("writing {}", path.display()))
}

/// Execute the parsed command line.
pub fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PostProcessConfig::load(path).context("reading configuration")?,
        None => PostProcessConfig::default(),
    };

    match cli.command {
        Command::WetBulbTemperature {
            temperature,
            relative_humidity,
            pressure,
            output,
            solver,
        } => {
            apply_solver_args(&mut config, &solver);
            let t = load(&temperature, "temperature")?;
            let rh = load(&relative_humidity, "relative humidity")?;
            let p = load(&pressure, "pressure")?;
            let result = config
                .wet_bulb
                .solver()
                .solve(&t, &rh, &p)
                .context("wet-bulb temperature")?;
            save(&result.field, &output)?;
            info!(
                unconverged = result.convergence.unconverged_count(),
                output = %output.display(),
                "Wet-bulb temperature written"
            );
        }

        Command::FallingSnowLevel {
            temperature,
            relative_humidity,
            pressure,
            orography,
            output,
            solver,
            falling_level_threshold,
        } => {
            apply_solver_args(&mut config, &solver);
            if let Some(threshold) = falling_level_threshold {
                config.snow_level.threshold = threshold;
            }
            let t = load(&temperature, "temperature")?;
            let rh = load(&relative_humidity, "relative humidity")?;
            let p = load(&pressure, "pressure")?;
            let oro = load(&orography, "orography")?;
            let result = config
                .snow_level_solver()
                .solve(&t, &rh, &p, &oro)
                .context("falling-snow level")?;
            save(&result.field, &output)?;
            info!(
                at_surface = result.at_surface,
                at_profile_top = result.at_profile_top,
                output = %output.display(),
                "Falling-snow level written"
            );
        }

        Command::Calibrate {
            inputs,
            output_mean,
            output_variance,
            coefficients_output,
            calibration,
        } => {
            let settings = calibration.apply(config.calibration);
            let (current, historic, truth) = load_training(&inputs)?;
            let result = calibrate(&current, &historic, &truth, &settings).context("calibration")?;
            save(&result.distribution.mean, &output_mean)?;
            save(&result.distribution.variance, &output_variance)?;
            if let Some(path) = coefficients_output {
                let json = serde_json::to_string_pretty(&result.coefficients)
                    .context("serialising coefficients")?;
                fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            info!(
                fits = result.diagnostics.fits,
                non_converged = result.diagnostics.non_converged,
                crps = result.diagnostics.mean_crps,
                "Calibration written"
            );
        }

        Command::GeneratePercentiles {
            mean,
            variance,
            output,
            distribution,
            num_percentiles,
            random_percentiles,
            random_seed,
        } => {
            let distribution = distribution.unwrap_or(config.calibration.distribution);
            let sampling = if random_percentiles {
                PercentileSampling::Random { seed: random_seed }
            } else {
                PercentileSampling::Quantile
            };
            let mean = load(&mean, "mean")?;
            let variance = load(&variance, "variance")?;
            let percentiles = choose_percentiles(num_percentiles, sampling)
                .and_then(|levels| percentiles_at_levels(&mean, &variance, distribution, &levels))
                .context("percentile generation")?;
            save(&percentiles, &output)?;
        }

        Command::Reorder {
            percentiles,
            raw_ensemble,
            output,
            ordering,
        } => {
            apply_ordering_args(&mut config, &ordering);
            let percentiles = load(&percentiles, "percentiles")?;
            let raw = load(&raw_ensemble, "raw ensemble")?;
            let members = reorder(
                &percentiles,
                &raw,
                config.reordering.random_ordering,
                config.reordering.random_seed,
            )
            .context("reordering")?;
            save(&members, &output)?;
        }

        Command::CalibratedEnsemble {
            inputs,
            output,
            num_members,
            calibration,
            ordering,
        } => {
            apply_ordering_args(&mut config, &ordering);
            config.calibration = calibration.apply(config.calibration);
            let options = PipelineOptions::from_config(&config, num_members);
            let (current, historic, truth) = load_training(&inputs)?;
            let result = calibrated_ensemble(&current, &historic, &truth, &options)
                .context("calibrated ensemble")?;
            save(&result.ensemble, &output)?;
            info!(
                members = result.ensemble.dim_len(nwp_post_core::REALIZATION),
                output = %output.display(),
                "Calibrated ensemble written"
            );
        }
    }
    Ok(())
}

fn apply_solver_args(config: &mut PostProcessConfig, args: &SolverArgs) {
    if let Some(precision) = args.precision {
        config.wet_bulb.precision = precision;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.wet_bulb.max_iterations = max_iterations;
    }
}

fn apply_ordering_args(config: &mut PostProcessConfig, args: &OrderingArgs) {
    if args.random_ordering {
        config.reordering.random_ordering = true;
    }
    if args.random_seed.is_some() {
        config.reordering.random_seed = args.random_seed;
    }
}

fn load_training(args: &TrainingArgs) -> Result<(Field, Field, Field)> {
    Ok((
        load(&args.current, "current forecast")?,
        load(&args.historic_forecast, "historic forecast")?,
        load(&args.historic_truth, "historic truth")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_underscore_aliases_parse() {
        let cli = Cli::try_parse_from([
            "nwp-post",
            "falling_snow_level",
            "--temperature",
            "t.json",
            "--relative_humidity",
            "rh.json",
            "--pressure",
            "p.json",
            "--orography",
            "oro.json",
            "--output",
            "out.json",
            "--falling_level_threshold",
            "50",
        ])
        .unwrap();
        match cli.command {
            Command::FallingSnowLevel {
                falling_level_threshold,
                ..
            } => assert_eq!(falling_level_threshold, Some(50.0)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_bad_predictor_mode_rejected_at_parse() {
        let err = Cli::try_parse_from([
            "nwp-post",
            "calibrate",
            "--current",
            "c.json",
            "--historic-forecast",
            "h.json",
            "--historic-truth",
            "t.json",
            "--output-mean",
            "m.json",
            "--output-variance",
            "v.json",
            "--predictor-mode",
            "median",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("mean` or `members"));
    }

    #[test]
    fn test_random_percentile_flags_parse() {
        let cli = Cli::try_parse_from([
            "nwp-post",
            "generate-percentiles",
            "--mean",
            "m.json",
            "--variance",
            "v.json",
            "--output",
            "p.json",
            "--num-percentiles",
            "9",
            "--random-percentiles",
            "--random_seed",
            "7",
        ])
        .unwrap();
        match cli.command {
            Command::GeneratePercentiles {
                random_percentiles,
                random_seed,
                ..
            } => {
                assert!(random_percentiles);
                assert_eq!(random_seed, Some(7));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_percentile_seed_requires_random_flag() {
        let result = Cli::try_parse_from([
            "nwp-post",
            "generate-percentiles",
            "--mean",
            "m.json",
            "--variance",
            "v.json",
            "--output",
            "p.json",
            "--num-percentiles",
            "9",
            "--random-seed",
            "7",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_input_names_stage() {
        let cli = Cli::try_parse_from([
            "nwp-post",
            "generate-percentiles",
            "--mean",
            "/nonexistent/mean.json",
            "--variance",
            "/nonexistent/variance.json",
            "--output",
            "/nonexistent/out.json",
            "--num-percentiles",
            "5",
        ])
        .unwrap();
        let err = run(cli).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("loading mean"));
        assert!(message.contains("mean.json"));
    }
}
