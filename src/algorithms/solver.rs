//! Damped Gauss-Newton (Levenberg-Marquardt) least-squares engine
//!
//! Shared by the localizer (2 parameters per hit) and the calibrator
//! (sensor coordinates, speed and nuisance hit positions). Every run is
//! bounded by an iteration cap and, optionally, a wall-clock deadline and a
//! cancellation token checked between iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Upper bound on the damping factor; beyond it no step can lower the cost
const MAX_DAMPING: f64 = 1e16;

/// Floor for the Marquardt diagonal scaling so flat directions still get damped
const MIN_DIAGONAL: f64 = 1e-9;

/// A nonlinear least-squares problem: minimize the squared norm of `residuals`
pub trait LeastSquaresProblem {
    /// Number of free parameters
    fn parameter_count(&self) -> usize;

    /// Residual vector at `params`
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of the residuals, one row per residual and one column per
    /// parameter. Defaults to central finite differences.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let base = self.residuals(params);
        let mut jacobian = DMatrix::zeros(base.len(), params.len());
        let mut probe = params.clone();
        for k in 0..params.len() {
            let h = 1e-6 * (1.0 + params[k].abs());
            probe[k] = params[k] + h;
            let plus = self.residuals(&probe);
            probe[k] = params[k] - h;
            let minus = self.residuals(&probe);
            probe[k] = params[k];
            jacobian.set_column(k, &((plus - minus) / (2.0 * h)));
        }
        jacobian
    }
}

/// How a solver run ended
///
/// Anything other than `Converged` means the returned parameters are the
/// best found so far, not a verified minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Converged,
    IterationLimit,
    TimeBudgetExceeded,
    Cancelled,
}

impl SolveStatus {
    pub fn is_converged(self) -> bool {
        self == SolveStatus::Converged
    }
}

/// Solver tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Hard cap on outer iterations
    pub max_iterations: usize,
    /// Relative cost decrease below which an accepted step counts as converged
    pub cost_tolerance: f64,
    /// Relative step length below which an accepted step counts as converged
    pub step_tolerance: f64,
    /// Absolute gradient magnitude below which the current point is a minimum
    pub gradient_tolerance: f64,
    /// Initial Levenberg-Marquardt damping
    pub initial_damping: f64,
    /// Optional wall-clock budget per run (milliseconds)
    pub time_budget_ms: Option<u64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            step_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            initial_damping: 1e-3,
            time_budget_ms: None,
        }
    }
}

impl SolverSettings {
    /// Deadline for a run starting now, if a time budget is configured
    pub fn deadline_from_now(&self) -> Option<Instant> {
        self.time_budget_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
    }
}

/// Cooperative cancellation flag shared between a long-running solve and
/// whoever wants to stop it
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a solver run
#[derive(Debug, Clone)]
pub struct SolverReport {
    /// Best parameters found
    pub params: DVector<f64>,
    /// Sum of squared residuals at `params`
    pub cost: f64,
    /// Number of residuals
    pub residual_count: usize,
    /// Outer iterations performed
    pub iterations: usize,
    pub status: SolveStatus,
}

impl SolverReport {
    /// Root-mean-square residual
    pub fn rms(&self) -> f64 {
        if self.residual_count == 0 {
            0.0
        } else {
            (self.cost / self.residual_count as f64).sqrt()
        }
    }
}

/// Ratio of largest to smallest singular value of a Jacobian; infinite when
/// the matrix is rank deficient or has fewer rows than columns
pub fn condition_number(jacobian: &DMatrix<f64>) -> f64 {
    if jacobian.ncols() == 0 {
        return 1.0;
    }
    if jacobian.nrows() < jacobian.ncols() {
        return f64::INFINITY;
    }
    let singular_values = jacobian.clone().svd(false, false).singular_values;
    let max = singular_values.max();
    let min = singular_values.min();
    if min <= 0.0 || !min.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Levenberg-Marquardt with Marquardt diagonal scaling and gain-ratio damping
/// updates
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    settings: SolverSettings,
}

impl LevenbergMarquardt {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Minimize from `initial` using the configured time budget
    pub fn minimize<P>(&self, problem: &P, initial: DVector<f64>) -> SolverReport
    where
        P: LeastSquaresProblem + ?Sized,
    {
        self.minimize_with(problem, initial, None, self.settings.deadline_from_now())
    }

    /// Minimize from `initial`, stopping early on cancellation or once
    /// `deadline` has passed
    pub fn minimize_with<P>(
        &self,
        problem: &P,
        initial: DVector<f64>,
        cancel: Option<&CancellationToken>,
        deadline: Option<Instant>,
    ) -> SolverReport
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let n = problem.parameter_count();
        let mut x = initial;
        let mut r = problem.residuals(&x);
        let mut cost = r.norm_squared();
        let mut lambda = self.settings.initial_damping;
        let mut nu = 2.0;
        let mut iterations = 0;
        let mut status = SolveStatus::IterationLimit;

        'outer: for iteration in 0..self.settings.max_iterations {
            if cancel.map_or(false, |c| c.is_cancelled()) {
                status = SolveStatus::Cancelled;
                break;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                status = SolveStatus::TimeBudgetExceeded;
                break;
            }
            iterations = iteration + 1;

            let jacobian = problem.jacobian(&x);
            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let gradient = &jt * &r;

            if gradient.amax() <= self.settings.gradient_tolerance {
                status = SolveStatus::Converged;
                break;
            }

            loop {
                let mut augmented = jtj.clone();
                for i in 0..n {
                    augmented[(i, i)] += lambda * jtj[(i, i)].max(MIN_DIAGONAL);
                }
                let rhs = -&gradient;
                let step = match augmented.clone().cholesky() {
                    Some(cholesky) => Some(cholesky.solve(&rhs)),
                    None => augmented.svd(true, true).solve(&rhs, 1e-12).ok(),
                };

                if let Some(step) = step {
                    let candidate = &x + &step;
                    let candidate_r = problem.residuals(&candidate);
                    let candidate_cost = candidate_r.norm_squared();

                    if candidate_cost.is_finite() && candidate_cost < cost {
                        // cost - |r + J s|^2
                        let predicted = -(2.0 * gradient.dot(&step) + step.dot(&(&jtj * &step)));
                        let rho = if predicted > 0.0 { (cost - candidate_cost) / predicted } else { 1.0 };
                        lambda *= (1.0_f64 / 3.0).max(1.0 - (2.0 * rho - 1.0).powi(3));
                        nu = 2.0;

                        let small_step = step.norm() <= self.settings.step_tolerance * (x.norm() + self.settings.step_tolerance);
                        let small_decrease = cost - candidate_cost <= self.settings.cost_tolerance * cost;
                        x = candidate;
                        r = candidate_r;
                        cost = candidate_cost;

                        if small_step || small_decrease {
                            status = SolveStatus::Converged;
                            break 'outer;
                        }
                        break;
                    }
                }

                lambda *= nu;
                nu *= 2.0;
                if !lambda.is_finite() || lambda > MAX_DAMPING {
                    // no step along any damped direction lowers the cost
                    status = SolveStatus::Converged;
                    break 'outer;
                }
            }
        }

        debug!(
            "levenberg-marquardt: {:?} after {} iterations, cost {:.3e}",
            status, iterations, cost
        );

        SolverReport {
            params: x,
            cost,
            residual_count: r.len(),
            iterations,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fit y = a * exp(b * t) to exact samples
    struct ExponentialFit {
        t: Vec<f64>,
        y: Vec<f64>,
    }

    impl LeastSquaresProblem for ExponentialFit {
        fn parameter_count(&self) -> usize {
            2
        }

        fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.t.len(),
                self.t.iter().zip(&self.y).map(|(t, y)| params[0] * (params[1] * t).exp() - y),
            )
        }
    }

    fn exponential() -> ExponentialFit {
        let t: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y = t.iter().map(|t| 2.5 * (-1.3 * t).exp()).collect();
        ExponentialFit { t, y }
    }

    #[test]
    fn test_converges_on_exact_data() {
        let solver = LevenbergMarquardt::default();
        let report = solver.minimize(&exponential(), DVector::from_vec(vec![1.0, 0.0]));
        assert_eq!(report.status, SolveStatus::Converged);
        assert!((report.params[0] - 2.5).abs() < 1e-6);
        assert!((report.params[1] + 1.3).abs() < 1e-6);
        assert!(report.rms() < 1e-8);
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        let solver = LevenbergMarquardt::new(SolverSettings {
            max_iterations: 1,
            ..SolverSettings::default()
        });
        let report = solver.minimize(&exponential(), DVector::from_vec(vec![1.0, 0.0]));
        assert_eq!(report.status, SolveStatus::IterationLimit);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn test_cancellation_stops_before_first_iteration() {
        let token = CancellationToken::new();
        token.cancel();
        let solver = LevenbergMarquardt::default();
        let initial = DVector::from_vec(vec![1.0, 0.0]);
        let report = solver.minimize_with(&exponential(), initial.clone(), Some(&token), None);
        assert_eq!(report.status, SolveStatus::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.params, initial);
    }

    #[test]
    fn test_expired_deadline() {
        let solver = LevenbergMarquardt::default();
        let past = Instant::now() - Duration::from_millis(5);
        let report = solver.minimize_with(&exponential(), DVector::from_vec(vec![1.0, 0.0]), None, Some(past));
        assert_eq!(report.status, SolveStatus::TimeBudgetExceeded);
    }

    #[test]
    fn test_condition_number() {
        let well = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        assert!(condition_number(&well) < 10.0);

        let singular = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        assert!(condition_number(&singular) > 1e12);

        let wide = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        assert!(condition_number(&wide).is_infinite());
    }
}
