//! Derivative-free Nelder–Mead simplex minimiser
//!
//! Coefficients `(reflection, expansion, contraction, shrink) = (1, 2, ½, ½)`.
//! The initial simplex perturbs each coordinate of the starting point by 5%
//! (or by 0.00025 when that coordinate is zero). Iteration stops when both the
//! spread of vertex values and the spread of vertex positions fall under their
//! tolerances, or when the iteration cap is reached.

use nalgebra::DVector;

const REFLECTION: f64 = 1.0;
const EXPANSION: f64 = 2.0;
const CONTRACTION: f64 = 0.5;
const SHRINK: f64 = 0.5;

const NONZERO_STEP: f64 = 0.05;
const ZERO_STEP: f64 = 0.00025;

/// Objective values that are NaN or infinite are replaced by this penalty
pub const PENALTY: f64 = 1e12;

/// Minimiser settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NelderMead {
    pub max_iterations: usize,
    /// Absolute tolerance on the spread of objective values
    pub fatol: f64,
    /// Absolute tolerance on the spread of vertex coordinates
    pub xatol: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            fatol: 1e-4,
            xatol: 1e-4,
        }
    }
}

/// Best vertex found and how the search ended
#[derive(Debug, Clone, PartialEq)]
pub struct MinimiseOutcome {
    pub x: DVector<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl NelderMead {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            fatol: tolerance,
            xatol: tolerance,
        }
    }

    /// Minimise `objective` starting from `x0`.
    pub fn minimise<F>(&self, objective: F, x0: DVector<f64>) -> MinimiseOutcome
    where
        F: Fn(&DVector<f64>) -> f64,
    {
        let eval = |x: &DVector<f64>| {
            let value = objective(x);
            if value.is_finite() {
                value
            } else {
                PENALTY
            }
        };

        let n = x0.len();
        if n == 0 {
            let value = eval(&x0);
            return MinimiseOutcome {
                x: x0,
                value,
                iterations: 0,
                converged: true,
            };
        }

        let mut simplex: Vec<(DVector<f64>, f64)> = Vec::with_capacity(n + 1);
        simplex.push((x0.clone(), eval(&x0)));
        for i in 0..n {
            let mut vertex = x0.clone();
            vertex[i] = if vertex[i] == 0.0 {
                ZERO_STEP
            } else {
                (1.0 + NONZERO_STEP) * vertex[i]
            };
            let value = eval(&vertex);
            simplex.push((vertex, value));
        }

        let mut iterations = 0;
        let mut converged = false;
        loop {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
            if self.has_converged(&simplex) {
                converged = true;
                break;
            }
            if iterations >= self.max_iterations {
                break;
            }
            iterations += 1;

            let best_value = simplex[0].1;
            let second_worst_value = simplex[n - 1].1;
            let (worst, worst_value) = simplex[n].clone();

            let mut centroid = DVector::zeros(n);
            for (vertex, _) in &simplex[..n] {
                centroid += vertex;
            }
            centroid /= n as f64;

            let reflected = &centroid + REFLECTION * (&centroid - &worst);
            let reflected_value = eval(&reflected);

            if reflected_value < best_value {
                let expanded = &centroid + EXPANSION * (&reflected - &centroid);
                let expanded_value = eval(&expanded);
                simplex[n] = if expanded_value < reflected_value {
                    (expanded, expanded_value)
                } else {
                    (reflected, reflected_value)
                };
                continue;
            }

            if reflected_value < second_worst_value {
                simplex[n] = (reflected, reflected_value);
                continue;
            }

            let accepted = if reflected_value < worst_value {
                let outside = &centroid + CONTRACTION * (&reflected - &centroid);
                let outside_value = eval(&outside);
                (outside_value <= reflected_value).then_some((outside, outside_value))
            } else {
                let inside = &centroid + CONTRACTION * (&worst - &centroid);
                let inside_value = eval(&inside);
                (inside_value < worst_value).then_some((inside, inside_value))
            };

            match accepted {
                Some(vertex) => simplex[n] = vertex,
                None => {
                    let best = simplex[0].0.clone();
                    for (vertex, value) in simplex.iter_mut().skip(1) {
                        *vertex = &best + SHRINK * (&*vertex - &best);
                        *value = eval(vertex);
                    }
                }
            }
        }

        let (x, value) = simplex.swap_remove(0);
        MinimiseOutcome {
            x,
            value,
            iterations,
            converged,
        }
    }

    /// Simplex must be sorted best-first.
    fn has_converged(&self, simplex: &[(DVector<f64>, f64)]) -> bool {
        let (best, best_value) = &simplex[0];
        let f_spread = simplex[1..]
            .iter()
            .map(|(_, v)| (v - best_value).abs())
            .fold(0.0, f64::max);
        let x_spread = simplex[1..]
            .iter()
            .map(|(v, _)| (v - best).amax())
            .fold(0.0, f64::max);
        f_spread <= self.fatol && x_spread <= self.xatol
    }
}
