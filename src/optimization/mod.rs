//! The `optimization` module provides the non-linear least-squares plumbing
//! shared by every calibration stage.
//!
//! This module defines the [`Optimizer`] trait, the reprojection statistics
//! ([`ProjectionError`]) reported for each camera, and [`solve_in_rounds`], a
//! driver around the tiny-solver Levenberg-Marquardt optimizer that runs the
//! iteration budget in short rounds so that cancellation, wall-time limits and
//! progress reporting happen between rounds.
//!
//! The residual factors themselves live in [`factors`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::camera::{Intrinsics, Resolution};
use crate::progress::{CancellationToken, ProgressEvent, ProgressObserver, Stage};

pub mod factors;

pub use factors::{BoardViewFactor, PointReprojectionFactor};

/// Parameter blocks keyed by name, the representation tiny-solver works on.
pub type ParameterMap = HashMap<String, DVector<f64>>;

/// Summary statistics of per-point reprojection errors in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    /// Computes the statistics of a set of per-point errors.
    ///
    /// Returns `None` for an empty set.
    pub fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// A trait for camera model optimization tasks.
///
/// Types implementing `Optimizer` refine the parameters of a camera model by
/// minimizing the reprojection error of known board points.
pub trait Optimizer {
    type Error;

    /// Closed-form estimate used to seed [`Optimizer::optimize`].
    fn linear_estimation(&mut self) -> Result<(), Self::Error>;

    /// Performs non-linear optimization to refine the camera model parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, logs optimization progress at info level.
    fn optimize(&mut self, verbose: bool) -> Result<(), Self::Error>;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    /// Distortion coefficients as `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("optimization failed")]
    Failed,
    #[error("optimization cancelled")]
    Cancelled,
    #[error("cost is not finite")]
    NonFiniteCost,
}

/// Iteration and time limits for one least-squares problem.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverBudget {
    pub max_iterations: usize,
    /// Iterations run between two cancellation/progress checkpoints.
    pub iterations_per_round: usize,
    pub time_budget: Option<Duration>,
    /// A round whose relative cost decrease is below this counts as converged.
    pub tolerance: f64,
}

impl SolverBudget {
    /// All iterations in a single round.
    pub fn single_round(max_iterations: usize) -> Self {
        SolverBudget {
            max_iterations,
            iterations_per_round: max_iterations.max(1),
            time_budget: None,
            tolerance: 1e-10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Converged,
    IterationBudget,
    TimeBudget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveSummary {
    pub rounds: usize,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

/// Runs Levenberg-Marquardt on `problem` in rounds of
/// `budget.iterations_per_round` iterations.
///
/// `cost` evaluates the objective on a parameter map and is used for
/// convergence checks and progress events only.
///
/// # Errors
///
/// * [`SolverError::Cancelled`] if `cancel` fires before a round starts.
/// * [`SolverError::Failed`] if tiny-solver returns no solution.
/// * [`SolverError::NonFiniteCost`] if the objective becomes NaN or infinite.
pub fn solve_in_rounds<C>(
    problem: &tiny_solver::Problem,
    initial: ParameterMap,
    budget: &SolverBudget,
    cost: C,
    stage: Stage,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<(ParameterMap, SolveSummary), SolverError>
where
    C: Fn(&ParameterMap) -> f64,
{
    let started = Instant::now();
    let initial_cost = cost(&initial);
    if !initial_cost.is_finite() {
        return Err(SolverError::NonFiniteCost);
    }

    let optimizer = LevenbergMarquardtOptimizer::default();
    let per_round = budget.iterations_per_round.max(1);
    let mut values = initial;
    let mut current_cost = initial_cost;
    let mut iterations = 0;
    let mut rounds = 0;

    let stop_reason = loop {
        if current_cost < 1e-20 {
            break StopReason::Converged;
        }
        if iterations >= budget.max_iterations {
            break StopReason::IterationBudget;
        }
        if cancel.is_cancelled() {
            info!("[{}] cancelled after {} iterations", stage, iterations);
            return Err(SolverError::Cancelled);
        }
        if budget
            .time_budget
            .is_some_and(|limit| started.elapsed() >= limit)
        {
            break StopReason::TimeBudget;
        }

        let round_iterations = per_round.min(budget.max_iterations - iterations);
        let options = OptimizerOptions {
            max_iteration: round_iterations,
            ..Default::default()
        };
        values = optimizer
            .optimize(problem, &values, Some(options))
            .ok_or(SolverError::Failed)?;
        iterations += round_iterations;
        rounds += 1;

        let new_cost = cost(&values);
        if !new_cost.is_finite() {
            return Err(SolverError::NonFiniteCost);
        }
        observer.on_progress(
            &ProgressEvent::new(stage, iterations, budget.max_iterations).with_cost(new_cost),
        );
        debug!(
            "[{}] round {}: cost {:.6e} -> {:.6e}",
            stage, rounds, current_cost, new_cost
        );

        let decrease = current_cost - new_cost;
        let scale = current_cost.max(f64::MIN_POSITIVE);
        current_cost = new_cost;
        if new_cost < 1e-20 || decrease.abs() <= budget.tolerance * scale {
            break StopReason::Converged;
        }
    };

    Ok((
        values,
        SolveSummary {
            rounds,
            iterations,
            initial_cost,
            final_cost: current_cost,
            stop_reason,
            elapsed: started.elapsed(),
        },
    ))
}

/// A factor together with the names of the parameter blocks it reads, in order.
#[derive(Debug, Clone)]
pub struct ResidualBlock<F> {
    pub factor: F,
    pub params: Vec<String>,
}

impl<F: Factor<f64>> ResidualBlock<F> {
    pub fn new(factor: F, params: Vec<String>) -> Self {
        ResidualBlock { factor, params }
    }

    /// Evaluates the residual; `None` if a parameter block is missing.
    pub fn residual(&self, values: &ParameterMap) -> Option<DVector<f64>> {
        let params = self
            .params
            .iter()
            .map(|name| values.get(name).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Factor::<f64>::residual_func(&self.factor, &params))
    }

    pub fn param_refs(&self) -> Vec<&str> {
        self.params.iter().map(String::as_str).collect()
    }
}

/// Huber loss applied to a squared residual norm, matching what tiny-solver
/// minimizes for a block with a Huber loss of scale `delta`.
pub fn huber(squared_norm: f64, delta: f64) -> f64 {
    let delta2 = delta * delta;
    if squared_norm <= delta2 {
        squared_norm
    } else {
        2.0 * delta * squared_norm.sqrt() - delta2
    }
}

/// Objective value `Σ ρ(‖r_i‖²)` over all blocks.
///
/// A block with a missing parameter contributes infinity.
pub fn total_cost<F: Factor<f64>>(
    blocks: &[ResidualBlock<F>],
    values: &ParameterMap,
    huber_scale: Option<f64>,
) -> f64 {
    blocks
        .iter()
        .map(|block| match block.residual(values) {
            Some(r) => {
                let s = r.norm_squared();
                match huber_scale {
                    Some(delta) => huber(s, delta),
                    None => s,
                }
            }
            None => f64::INFINITY,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullObserver;
    use approx::assert_relative_eq;
    use nalgebra::RealField;

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
        assert!(ProjectionError::from_errors(&[]).is_none());
    }

    #[test]
    fn test_huber_is_continuous() {
        assert_relative_eq!(huber(4.0, 2.0), 4.0);
        assert_relative_eq!(huber(9.0, 2.0), 2.0 * 2.0 * 3.0 - 4.0);
    }

    #[derive(Debug, Clone)]
    struct LineFit {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl<T: RealField> Factor<T> for LineFit {
        fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
            let p = &params[0];
            DVector::from_iterator(
                self.xs.len(),
                self.xs.iter().zip(self.ys.iter()).map(|(x, y)| {
                    let x: T = nalgebra::convert(*x);
                    let y: T = nalgebra::convert(*y);
                    p[0].clone() * x + p[1].clone() - y
                }),
            )
        }
    }

    fn line_problem() -> (tiny_solver::Problem, ResidualBlock<LineFit>, ParameterMap) {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys = xs.iter().map(|x| 2.0 * x - 1.0).collect();
        let factor = LineFit { xs, ys };
        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(10, &["line"], Box::new(factor.clone()), None);
        let block = ResidualBlock::new(factor, vec!["line".to_string()]);
        let mut initial = HashMap::new();
        initial.insert("line".to_string(), DVector::from_vec(vec![0.0, 0.0]));
        (problem, block, initial)
    }

    #[test]
    fn test_solve_in_rounds_converges() {
        let (problem, block, initial) = line_problem();
        let budget = SolverBudget {
            max_iterations: 50,
            iterations_per_round: 5,
            time_budget: None,
            tolerance: 1e-12,
        };
        let blocks = [block];
        let (values, summary) = solve_in_rounds(
            &problem,
            initial,
            &budget,
            |v| total_cost(&blocks, v, None),
            Stage::BundleAdjustment,
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_relative_eq!(values["line"][0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(values["line"][1], -1.0, epsilon = 1e-6);
        assert_eq!(summary.stop_reason, StopReason::Converged);
        assert!(summary.final_cost < summary.initial_cost);
    }

    #[test]
    fn test_solve_in_rounds_honors_cancellation() {
        let (problem, block, initial) = line_problem();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let blocks = [block];
        let result = solve_in_rounds(
            &problem,
            initial,
            &SolverBudget::single_round(10),
            |v| total_cost(&blocks, v, None),
            Stage::BundleAdjustment,
            &NullObserver,
            &cancel,
        );
        assert_eq!(result.unwrap_err(), SolverError::Cancelled);
    }

    #[test]
    fn test_zero_budget_returns_initial_values() {
        let (problem, block, initial) = line_problem();
        let blocks = [block];
        let (values, summary) = solve_in_rounds(
            &problem,
            initial,
            &SolverBudget::single_round(0),
            |v| total_cost(&blocks, v, None),
            Stage::Intrinsics,
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(summary.rounds, 0);
        assert_eq!(summary.stop_reason, StopReason::IterationBudget);
        assert_relative_eq!(values["line"][0], 0.0);
    }
}
