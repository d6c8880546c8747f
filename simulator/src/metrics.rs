use serde::{Deserialize, Serialize};
use stats::{MinMax, OnlineStats};
use std::fmt;
use std::time::Duration;

use prelude::*;

/// Measurements taken after one simulation step.
#[derive(Clone, Copy, Debug)]
pub struct StepSample {
    pub ego_velocity: float,
    /// Acceleration the ego vehicle actually applied.
    pub ego_acceleration: float,
    pub distance: float,
    pub reference_speed: float,
    pub desired_distance: float,
    pub solver_failed: bool,
    pub too_close: bool,
    pub too_far: bool,
    pub solve_time: Duration,
}

/// Summary of a run, serialised into the report keyed by style name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub velocity_rmse: float,
    pub velocity_mae: float,
    pub distance_rmse: float,
    pub distance_mae: float,
    /// Mean absolute acceleration.
    pub acceleration_mean: float,
    pub acceleration_std: float,
    pub acceleration_max: float,
    pub jerk_mean: float,
    pub jerk_std: float,
    pub jerk_max: float,
    pub comfort_index: float,
    pub steps: usize,
    pub solver_failures: usize,
    pub too_close_steps: usize,
    pub too_far_steps: usize,
    pub solve_time_mean_ms: float,
    pub solve_time_max_ms: float,
}

#[derive(Clone, Debug, Default)]
struct ErrorStats {
    sum_squares: float,
    sum_abs: float,
    n: usize,
}

impl ErrorStats {
    fn add(&mut self, error: float) {
        self.sum_squares += error * error;
        self.sum_abs += error.abs();
        self.n += 1;
    }

    fn rmse(&self) -> float {
        if self.n == 0 {
            0.0
        } else {
            (self.sum_squares / self.n as float).sqrt()
        }
    }

    fn mae(&self) -> float {
        if self.n == 0 {
            0.0
        } else {
            self.sum_abs / self.n as float
        }
    }
}

/// Running statistics updated once per step. Jerk is the first difference of the applied
/// accelerations, so a run of n steps has n - 1 jerk samples.
pub struct MetricsAccumulator {
    dt: float,
    velocity_error: ErrorStats,
    distance_error: ErrorStats,
    acceleration: OnlineStats,
    acceleration_abs: OnlineStats,
    acceleration_max: MinMax<float>,
    jerk: OnlineStats,
    jerk_abs: OnlineStats,
    jerk_max: MinMax<float>,
    sum_acceleration_squares: float,
    sum_jerk_squares: float,
    last_acceleration: Option<float>,
    last_jerk: Option<float>,
    steps: usize,
    solver_failures: usize,
    too_close_steps: usize,
    too_far_steps: usize,
    solve_time_ms: OnlineStats,
    solve_time_max_ms: MinMax<float>,
}

impl MetricsAccumulator {
    pub fn new(dt: float) -> MetricsAccumulator {
        MetricsAccumulator {
            dt,
            velocity_error: ErrorStats::default(),
            distance_error: ErrorStats::default(),
            acceleration: OnlineStats::new(),
            acceleration_abs: OnlineStats::new(),
            acceleration_max: MinMax::new(),
            jerk: OnlineStats::new(),
            jerk_abs: OnlineStats::new(),
            jerk_max: MinMax::new(),
            sum_acceleration_squares: 0.0,
            sum_jerk_squares: 0.0,
            last_acceleration: None,
            last_jerk: None,
            steps: 0,
            solver_failures: 0,
            too_close_steps: 0,
            too_far_steps: 0,
            solve_time_ms: OnlineStats::new(),
            solve_time_max_ms: MinMax::new(),
        }
    }

    pub fn record(&mut self, sample: &StepSample) {
        self.velocity_error
            .add(sample.ego_velocity - sample.reference_speed);
        self.distance_error
            .add(sample.distance - sample.desired_distance);

        let a = sample.ego_acceleration;
        self.acceleration.add(a);
        self.acceleration_abs.add(a.abs());
        self.acceleration_max.add(a.abs());
        self.sum_acceleration_squares += a * a;

        if let Some(previous) = self.last_acceleration {
            let jerk = (a - previous) / self.dt;
            self.jerk.add(jerk);
            self.jerk_abs.add(jerk.abs());
            self.jerk_max.add(jerk.abs());
            self.sum_jerk_squares += jerk * jerk;
            self.last_jerk = Some(jerk);
        }
        self.last_acceleration = Some(a);

        self.steps += 1;
        self.solver_failures += sample.solver_failed as usize;
        self.too_close_steps += sample.too_close as usize;
        self.too_far_steps += sample.too_far as usize;

        let millis = sample.solve_time.as_secs_f64() * 1e3;
        self.solve_time_ms.add(millis);
        self.solve_time_max_ms.add(millis);
    }

    /// Metrics of the steps recorded so far.
    pub fn finish(&self) -> Metrics {
        if self.steps == 0 {
            return Metrics::default();
        }

        let max_of = |min_max: &MinMax<float>| min_max.max().copied().unwrap_or(0.0);
        let mean_of = |online: &OnlineStats, n: usize| if n == 0 { 0.0 } else { online.mean() };
        let n_jerk = self.steps - 1;

        // The jerk series is padded with its last value to match the acceleration samples
        let padded_jerk_squares = self.sum_jerk_squares + self.last_jerk.map_or(0.0, |j| j * j);

        Metrics {
            velocity_rmse: self.velocity_error.rmse(),
            velocity_mae: self.velocity_error.mae(),
            distance_rmse: self.distance_error.rmse(),
            distance_mae: self.distance_error.mae(),
            acceleration_mean: self.acceleration_abs.mean(),
            acceleration_std: self.acceleration.stddev(),
            acceleration_max: max_of(&self.acceleration_max),
            jerk_mean: mean_of(&self.jerk_abs, n_jerk),
            jerk_std: if n_jerk == 0 { 0.0 } else { self.jerk.stddev() },
            jerk_max: max_of(&self.jerk_max),
            comfort_index: (self.sum_acceleration_squares + padded_jerk_squares)
                / self.steps as float,
            steps: self.steps,
            solver_failures: self.solver_failures,
            too_close_steps: self.too_close_steps,
            too_far_steps: self.too_far_steps,
            solve_time_mean_ms: self.solve_time_ms.mean(),
            solve_time_max_ms: max_of(&self.solve_time_max_ms),
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "  velocity RMSE:      {:.2} m/s", self.velocity_rmse)?;
        writeln!(f, "  velocity MAE:       {:.2} m/s", self.velocity_mae)?;
        writeln!(f, "  distance RMSE:      {:.2} m", self.distance_rmse)?;
        writeln!(f, "  distance MAE:       {:.2} m", self.distance_mae)?;
        writeln!(f, "  mean |accel|:       {:.2} m/s^2", self.acceleration_mean)?;
        writeln!(f, "  max |accel|:        {:.2} m/s^2", self.acceleration_max)?;
        writeln!(f, "  mean |jerk|:        {:.2} m/s^3", self.jerk_mean)?;
        writeln!(f, "  max |jerk|:         {:.2} m/s^3", self.jerk_max)?;
        writeln!(f, "  comfort index:      {:.2}", self.comfort_index)?;
        writeln!(
            f,
            "  steps:              {} ({} solver failures, {} too close, {} too far)",
            self.steps, self.solver_failures, self.too_close_steps, self.too_far_steps
        )?;
        write!(
            f,
            "  solve time (ms):    mean {:.3}, max {:.3}",
            self.solve_time_mean_ms, self.solve_time_max_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(velocity: float, acceleration: float, distance: float) -> StepSample {
        StepSample {
            ego_velocity: velocity,
            ego_acceleration: acceleration,
            distance,
            reference_speed: 15.0,
            desired_distance: 30.0,
            solver_failed: false,
            too_close: false,
            too_far: false,
            solve_time: Duration::from_millis(2),
        }
    }

    #[test]
    fn empty_run_has_zero_metrics() {
        let metrics = MetricsAccumulator::new(0.1).finish();
        assert_eq!(metrics, Metrics::default());
    }

    #[test]
    fn tracking_errors() {
        let mut acc = MetricsAccumulator::new(0.1);
        acc.record(&sample(14.0, 0.0, 33.0));
        acc.record(&sample(17.0, 0.0, 30.0));

        let metrics = acc.finish();
        // Velocity errors -1 and 2, distance errors 3 and 0
        assert!((metrics.velocity_rmse - (2.5 as float).sqrt()).abs() < 1e-12);
        assert!((metrics.velocity_mae - 1.5).abs() < 1e-12);
        assert!((metrics.distance_rmse - (4.5 as float).sqrt()).abs() < 1e-12);
        assert!((metrics.distance_mae - 1.5).abs() < 1e-12);
        assert!((metrics.solve_time_mean_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn jerk_and_comfort_from_applied_accelerations() {
        let mut acc = MetricsAccumulator::new(0.1);
        for &a in &[0.0, 1.0, 1.0, -1.0] {
            acc.record(&sample(15.0, a, 30.0));
        }
        let metrics = acc.finish();

        // Jerk samples 10, 0, -20, padded with -20 for the comfort index
        assert!((metrics.acceleration_mean - 0.75).abs() < 1e-12);
        assert!((metrics.acceleration_max - 1.0).abs() < 1e-12);
        assert!((metrics.jerk_mean - 10.0).abs() < 1e-9);
        assert!((metrics.jerk_max - 20.0).abs() < 1e-9);
        let comfort = (0.0 + 1.0 + 1.0 + 1.0 + 100.0 + 0.0 + 400.0 + 400.0) / 4.0;
        assert!((metrics.comfort_index - comfort).abs() < 1e-9);

        let mean_a = 0.25;
        let var_a = [0.0, 1.0, 1.0, -1.0]
            .iter()
            .map(|a: &float| (a - mean_a).powi(2))
            .sum::<float>()
            / 4.0;
        assert!((metrics.acceleration_std - var_a.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn counts_failures_and_violations() {
        let mut acc = MetricsAccumulator::new(0.1);
        acc.record(&StepSample {
            solver_failed: true,
            too_close: true,
            ..sample(15.0, -3.0, 8.0)
        });
        acc.record(&StepSample {
            too_far: true,
            ..sample(15.0, 0.0, 90.0)
        });

        let metrics = acc.finish();
        assert_eq!(metrics.steps, 2);
        assert_eq!(metrics.solver_failures, 1);
        assert_eq!(metrics.too_close_steps, 1);
        assert_eq!(metrics.too_far_steps, 1);
    }
}
