//! Regression model and CRPS objective for one coefficient set
//!
//! Coefficient vector layout: `[a, b₁ … b_k, γ, δ]` where `k` is 1 in mean
//! mode and the member count in members mode. The predictive distribution for
//! an ensemble `x` is
//!
//! ```text
//! μ  = a + Σ bᵢ·fᵢ(x)        (f = [x̄] or the members themselves)
//! σ² = γ² + δ²·s²(x)          (s² = unbiased ensemble variance)
//! ```

use super::minimise::{MinimiseOutcome, NelderMead};
use super::PredictorMode;
use crate::distribution::Distribution;
use nalgebra::{DMatrix, DVector};

const SVD_EPSILON: f64 = 1e-12;

/// Ensemble mean and unbiased variance
pub(crate) fn mean_and_variance(members: &[f64]) -> (f64, f64) {
    let n = members.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = members.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let ss: f64 = members.iter().map(|x| (x - mean) * (x - mean)).sum();
    (mean, ss / (n - 1) as f64)
}

/// Predictor layout shared by training and application
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Model {
    pub mode: PredictorMode,
    pub members: usize,
}

impl Model {
    /// Number of slope coefficients
    pub fn slopes(&self) -> usize {
        match self.mode {
            PredictorMode::Mean => 1,
            PredictorMode::Members => self.members,
        }
    }

    pub fn n_coefficients(&self) -> usize {
        self.slopes() + 3
    }

    pub fn coefficient_names(&self) -> Vec<String> {
        let mut names = vec!["alpha".to_string()];
        match self.mode {
            PredictorMode::Mean => names.push("beta".to_string()),
            PredictorMode::Members => {
                names.extend((0..self.members).map(|m| format!("beta_{m}")));
            }
        }
        names.push("gamma".to_string());
        names.push("delta".to_string());
        names
    }

    /// Coefficients that reproduce the raw ensemble mean and spread.
    pub fn raw_ensemble_coefficients(&self) -> Vec<f64> {
        let k = self.slopes();
        let mut coefficients = vec![0.0];
        coefficients.extend(std::iter::repeat_n(1.0 / k as f64, k));
        coefficients.push(0.0);
        coefficients.push(1.0);
        coefficients
    }

    /// (μ, σ²) for one ensemble; σ² is not clipped here.
    pub fn predict(&self, coefficients: &[f64], members: &[f64]) -> (f64, f64) {
        let k = self.slopes();
        let (mean, variance) = mean_and_variance(members);
        let location = match self.mode {
            PredictorMode::Mean => coefficients[0] + coefficients[1] * mean,
            PredictorMode::Members => {
                coefficients[0]
                    + coefficients[1..=k]
                        .iter()
                        .zip(members)
                        .map(|(b, x)| b * x)
                        .sum::<f64>()
            }
        };
        let gamma = coefficients[k + 1];
        let delta = coefficients[k + 2];
        (location, gamma * gamma + delta * delta * variance)
    }
}

/// Valid (finite) forecast/truth pairs for one fit
#[derive(Debug, Clone, Default)]
pub(crate) struct TrainingSet {
    /// Member values, `members` per sample
    forecasts: Vec<f64>,
    truths: Vec<f64>,
    members: usize,
}

impl TrainingSet {
    pub fn new(members: usize) -> Self {
        Self {
            forecasts: Vec::new(),
            truths: Vec::new(),
            members,
        }
    }

    /// Add one sample; non-finite samples are skipped. Returns whether kept.
    pub fn push(&mut self, members: &[f64], truth: f64) -> bool {
        if !truth.is_finite() || members.len() != self.members || members.iter().any(|x| !x.is_finite())
        {
            return false;
        }
        self.forecasts.extend_from_slice(members);
        self.truths.push(truth);
        true
    }

    pub fn len(&self) -> usize {
        self.truths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.truths.is_empty()
    }

    fn samples(&self) -> impl Iterator<Item = (&[f64], f64)> {
        self.forecasts
            .chunks(self.members.max(1))
            .zip(self.truths.iter().copied())
    }

    /// Mean CRPS of `coefficients` over the training samples.
    pub fn mean_crps(&self, model: &Model, distribution: Distribution, coefficients: &[f64]) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        let total: f64 = self
            .samples()
            .map(|(members, truth)| {
                let (mu, variance) = model.predict(coefficients, members);
                if variance < 0.0 || !variance.is_finite() {
                    return f64::NAN;
                }
                distribution.crps(truth, mu, variance.sqrt())
            })
            .sum();
        total / self.len() as f64
    }

    /// Starting point: least squares of truth on the ensemble mean, γ = δ = 1.
    ///
    /// Falls back to the raw-ensemble slope when the system is degenerate.
    pub fn initial_guess(&self, model: &Model) -> Vec<f64> {
        let k = model.slopes();
        let (intercept, slope) = self.least_squares().unwrap_or((0.0, 1.0));
        let mut guess = vec![intercept];
        guess.extend(std::iter::repeat_n(slope / k as f64, k));
        guess.push(1.0);
        guess.push(1.0);
        guess
    }

    fn least_squares(&self) -> Option<(f64, f64)> {
        let n = self.len();
        if n < 2 {
            return None;
        }
        let means: Vec<f64> = self
            .samples()
            .map(|(members, _)| mean_and_variance(members).0)
            .collect();
        let design = DMatrix::from_fn(n, 2, |row, col| if col == 0 { 1.0 } else { means[row] });
        let target = DVector::from_column_slice(&self.truths);
        let solution = design.svd(true, true).solve(&target, SVD_EPSILON).ok()?;
        let (a, b) = (solution[0], solution[1]);
        (a.is_finite() && b.is_finite()).then_some((a, b))
    }

    /// Minimise mean CRPS from the least-squares starting point.
    pub fn fit(
        &self,
        model: &Model,
        distribution: Distribution,
        minimiser: &NelderMead,
    ) -> MinimiseOutcome {
        let x0 = DVector::from_vec(self.initial_guess(model));
        minimiser.minimise(
            |x| self.mean_crps(model, distribution, x.as_slice()),
            x0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn mean_model() -> Model {
        Model {
            mode: PredictorMode::Mean,
            members: 3,
        }
    }

    #[test]
    fn test_mean_and_variance() {
        let (m, v) = mean_and_variance(&[1.0, 2.0, 3.0]);
        assert_abs_diff_eq!(m, 2.0);
        assert_abs_diff_eq!(v, 1.0);
        assert_eq!(mean_and_variance(&[4.0]), (4.0, 0.0));
    }

    #[test]
    fn test_raw_coefficients_reproduce_ensemble() {
        let model = Model {
            mode: PredictorMode::Members,
            members: 4,
        };
        let coefficients = model.raw_ensemble_coefficients();
        assert_eq!(coefficients.len(), model.n_coefficients());
        let (mu, var) = model.predict(&coefficients, &[1.0, 2.0, 3.0, 6.0]);
        assert_abs_diff_eq!(mu, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(var, 14.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coefficient_names() {
        assert_eq!(mean_model().coefficient_names(), ["alpha", "beta", "gamma", "delta"]);
        let members = Model {
            mode: PredictorMode::Members,
            members: 2,
        };
        assert_eq!(
            members.coefficient_names(),
            ["alpha", "beta_0", "beta_1", "gamma", "delta"]
        );
    }

    #[test]
    fn test_non_finite_samples_are_skipped() {
        let mut set = TrainingSet::new(3);
        assert!(set.push(&[1.0, 2.0, 3.0], 2.0));
        assert!(!set.push(&[1.0, f64::NAN, 3.0], 2.0));
        assert!(!set.push(&[1.0, 2.0, 3.0], f64::INFINITY));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_initial_guess_recovers_linear_bias() {
        let mut set = TrainingSet::new(3);
        for i in 0..10 {
            let x = f64::from(i);
            set.push(&[x - 1.0, x, x + 1.0], 2.0 + 0.5 * x);
        }
        let guess = set.initial_guess(&mean_model());
        assert_abs_diff_eq!(guess[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(guess[1], 0.5, epsilon = 1e-9);
        assert_eq!(&guess[2..], &[1.0, 1.0]);
    }

    #[test]
    fn test_fit_corrects_warm_bias() {
        // Forecasts run 2 K warm with realistic spread
        let mut set = TrainingSet::new(3);
        for i in 0..40 {
            let truth = 270.0 + f64::from(i % 10);
            let jitter = if i % 2 == 0 { 0.3 } else { -0.3 };
            let centre = truth + 2.0 + jitter;
            set.push(&[centre - 1.0, centre, centre + 1.0], truth);
        }
        let model = mean_model();
        let outcome = set.fit(&model, Distribution::Gaussian, &NelderMead::new(2000, 1e-6));
        let raw_cost = set.mean_crps(&model, Distribution::Gaussian, &model.raw_ensemble_coefficients());
        assert!(outcome.value < raw_cost);
        let (mu, _) = model.predict(outcome.x.as_slice(), &[274.0, 275.0, 276.0]);
        assert_abs_diff_eq!(mu, 273.0, epsilon = 0.5);
    }
}
