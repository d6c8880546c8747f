use std::thread;
use std::time::{Duration, Instant};

use config::Config;
use control_model::{ActuatorLimits, ControlCommand, VehicleModel, VehicleState};
use controller::{
    Controller, DriverStyle, DriverStyleProfile, MpcController, MpcSettings, SolverStatus,
    ViolationKind,
};
use prelude::flame;
use prelude::*;

use crate::lead_trajectory::{self, LeadTrajectory};
use crate::metrics::{Metrics, MetricsAccumulator, StepSample};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(
        "controller degraded at step {step} after {consecutive_failures} consecutive solver failures"
    )]
    ControllerDegraded {
        step: usize,
        consecutive_failures: usize,
        /// Metrics of the run up to and including the failing step.
        metrics: Box<Metrics>,
    },
}

impl SimulationError {
    pub fn metrics(&self) -> &Metrics {
        match self {
            SimulationError::ControllerDegraded { metrics, .. } => metrics,
        }
    }
}

/// State after a step, as seen by observers. Observers have no control authority.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub step: usize,
    pub t: float,
    pub ego: VehicleState,
    pub lead: VehicleState,
    pub distance: float,
    pub desired_distance: float,
    pub command: ControlCommand,
    pub status: SolverStatus,
}

pub trait Observer {
    fn observe(&mut self, snapshot: &Snapshot);
}

impl Observer for visualisation::History {
    fn observe(&mut self, snapshot: &Snapshot) {
        self.record(
            snapshot.t,
            &snapshot.ego,
            &snapshot.lead,
            snapshot.desired_distance,
            snapshot.command.jerk,
        );
    }
}

/// Closed loop of one driver profile: the controller chooses the ego acceleration, the vehicle
/// model applies it and the lead follows its own trajectory.
pub struct Simulation {
    profile: DriverStyleProfile,
    reference_speed: float,
    controller: Box<dyn Controller>,
    ego_model: VehicleModel,
    lead_model: VehicleModel,
    lead_trajectory: Box<dyn LeadTrajectory>,
    ego: VehicleState,
    lead: VehicleState,
    previous_acceleration: float,
    consecutive_failures: usize,
    failure_threshold: usize,
    real_time: bool,
    step: usize,
    metrics: MetricsAccumulator,
}

impl Simulation {
    pub fn new(
        profile: DriverStyleProfile,
        controller: Box<dyn Controller>,
        settings: &MpcSettings,
        ego: VehicleState,
        lead: VehicleState,
        lead_trajectory: Box<dyn LeadTrajectory>,
    ) -> Simulation {
        Simulation {
            reference_speed: profile.reference_speed(settings.nominal_speed),
            metrics: MetricsAccumulator::new(profile.dt),
            profile,
            controller,
            ego_model: VehicleModel::new(settings.limits),
            lead_model: VehicleModel::new(ActuatorLimits {
                min_acceleration: NEG_INFINITY,
                max_acceleration: INFINITY,
                max_velocity: INFINITY,
            }),
            lead_trajectory,
            previous_acceleration: ego.acceleration,
            ego,
            lead,
            consecutive_failures: 0,
            failure_threshold: 5,
            real_time: false,
            step: 0,
        }
    }

    pub fn from_config(config: &Config, style: DriverStyle) -> Simulation {
        let settings = config.mpc_settings();
        let controller = MpcController::new(settings.clone());
        Simulation::new(
            config.profile(style),
            Box::new(controller),
            &settings,
            config.ego_state(),
            config.lead_state(),
            lead_trajectory::from_config(&config.lead.trajectory),
        )
        .with_failure_threshold(config.failure_threshold)
        .real_time(config.real_time)
    }

    pub fn with_failure_threshold(self, failure_threshold: usize) -> Simulation {
        assert!(failure_threshold > 0);
        Simulation {
            failure_threshold,
            ..self
        }
    }

    /// Command assumed to have been applied before the first step.
    pub fn with_previous_acceleration(self, previous_acceleration: float) -> Simulation {
        Simulation {
            previous_acceleration,
            ..self
        }
    }

    pub fn real_time(self, real_time: bool) -> Simulation {
        Simulation { real_time, ..self }
    }

    pub fn profile(&self) -> &DriverStyleProfile {
        &self.profile
    }

    pub fn ego(&self) -> &VehicleState {
        &self.ego
    }

    pub fn lead(&self) -> &VehicleState {
        &self.lead
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.finish()
    }

    /// Advances the loop by one control step. `ControllerDegraded` is returned on the step
    /// where the consecutive failure count reaches the threshold; later failures in the same
    /// streak are not reported again.
    pub fn step(&mut self, observers: &mut [&mut dyn Observer]) -> Result<Snapshot, SimulationError> {
        let _guard = flame::start_guard("simulation step");
        let dt = self.profile.dt;
        let t = self.step as float * dt;
        let step_start = Instant::now();

        let action = self.controller.compute_action(
            &self.ego,
            &self.lead,
            &self.profile,
            self.previous_acceleration,
        );
        let solve_time = step_start.elapsed();

        let lead_acceleration = self.lead_trajectory.acceleration(t, &self.lead, dt);
        self.ego = self
            .ego_model
            .advance(&self.ego, action.command.acceleration, dt);
        self.lead = self.lead_model.advance(&self.lead, lead_acceleration, dt);
        self.previous_acceleration = self.ego.acceleration;

        let failed = action.is_fallback();
        if failed {
            self.consecutive_failures += 1;
            warn!(
                "step {}: solver failure {} of {} allowed",
                self.step, self.consecutive_failures, self.failure_threshold
            );
        } else {
            self.consecutive_failures = 0;
        }

        let measured = |kind| {
            action
                .violations
                .iter()
                .any(|v| v.stage == 0 && v.kind == kind)
        };
        let distance = self.ego.gap_to(&self.lead);
        let desired_distance = self.profile.desired_distance(self.ego.velocity);
        self.metrics.record(&StepSample {
            ego_velocity: self.ego.velocity,
            ego_acceleration: self.ego.acceleration,
            distance,
            reference_speed: self.reference_speed,
            desired_distance,
            solver_failed: failed,
            too_close: measured(ViolationKind::TooClose),
            too_far: measured(ViolationKind::TooFar),
            solve_time,
        });

        let snapshot = Snapshot {
            step: self.step,
            t: t + dt,
            ego: self.ego,
            lead: self.lead,
            distance,
            desired_distance,
            command: action.command,
            status: action.status,
        };
        debug!(
            "t={:.2} ego=({:.2}, {:.2}, {:.2}) lead=({:.2}, {:.2}) gap={:.2}",
            snapshot.t,
            self.ego.position,
            self.ego.velocity,
            self.ego.acceleration,
            self.lead.position,
            self.lead.velocity,
            distance
        );
        for observer in observers.iter_mut() {
            observer.observe(&snapshot);
        }

        let step = self.step;
        self.step += 1;

        if self.real_time {
            self.wait_for_deadline(step_start, dt);
        }

        if failed && self.consecutive_failures == self.failure_threshold {
            error!(
                "{}: aborting after {} consecutive solver failures",
                self.profile.style, self.consecutive_failures
            );
            return Err(SimulationError::ControllerDegraded {
                step,
                consecutive_failures: self.consecutive_failures,
                metrics: Box::new(self.metrics.finish()),
            });
        }

        Ok(snapshot)
    }

    /// Runs `steps` control steps and returns the run's metrics.
    pub fn run(
        mut self,
        steps: usize,
        observers: &mut [&mut dyn Observer],
    ) -> Result<Metrics, SimulationError> {
        info!(
            "running {} steps of {} with {} behind a {} lead",
            steps,
            self.profile.style,
            self.controller.name(),
            self.lead_trajectory.name()
        );
        for _ in 0..steps {
            self.step(observers)?;
        }

        let metrics = self.metrics.finish();
        info!(
            "{}: controller took {:.3} ms on average, {:.3} ms at most",
            self.profile.style, metrics.solve_time_mean_ms, metrics.solve_time_max_ms
        );
        Ok(metrics)
    }

    fn wait_for_deadline(&self, step_start: Instant, dt: float) {
        let step_duration = Duration::from_secs_f64(dt);
        let elapsed = step_start.elapsed();
        match step_duration.checked_sub(elapsed) {
            Some(remaining) => thread::sleep(remaining),
            None => warn!(
                "step missed deadline. took {:.1}ms.",
                elapsed.as_secs_f64() * 1e3
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead_trajectory::ConstantSpeed;

    fn simulation(style: DriverStyle, ego: VehicleState, lead: VehicleState) -> Simulation {
        let settings = MpcSettings::default();
        Simulation::new(
            DriverStyleProfile::from_style(style),
            Box::new(MpcController::new(settings.clone())),
            &settings,
            ego,
            lead,
            Box::new(ConstantSpeed),
        )
    }

    struct Collect(Vec<Snapshot>);

    impl Observer for Collect {
        fn observe(&mut self, snapshot: &Snapshot) {
            self.0.push(snapshot.clone());
        }
    }

    #[test]
    fn observers_see_every_step() {
        let mut collect = Collect(Vec::new());
        let sim = simulation(
            DriverStyle::Balanced,
            VehicleState::new(0.0, 15.0),
            VehicleState::new(30.0, 15.0),
        );
        let metrics = sim.run(20, &mut [&mut collect]).unwrap();

        assert_eq!(metrics.steps, 20);
        assert_eq!(collect.0.len(), 20);
        for (i, snapshot) in collect.0.iter().enumerate() {
            assert_eq!(snapshot.step, i);
            assert!((snapshot.t - (i + 1) as float * 0.1).abs() < 1e-9);
            assert!((snapshot.distance - snapshot.ego.gap_to(&snapshot.lead)).abs() < 1e-12);
        }
    }

    #[test]
    fn settles_behind_a_constant_speed_lead() {
        let mut sim = simulation(
            DriverStyle::Balanced,
            VehicleState::new(0.0, 10.0),
            VehicleState::new(50.0, 12.0),
        );
        for _ in 0..600 {
            sim.step(&mut []).unwrap();
        }

        // Speed tracking and gap tracking pull in different directions, so the equilibrium
        // sits between them
        assert!((sim.lead().velocity - 12.0).abs() < 1e-9);
        assert!((sim.ego().velocity - 12.0).abs() < 0.5);
        let gap = sim.ego().gap_to(sim.lead());
        assert!(gap > 10.0 && gap < 60.0, "gap {}", gap);
        assert_eq!(sim.metrics().solver_failures, 0);
    }

    #[test]
    fn applied_acceleration_becomes_previous_command() {
        let mut sim = simulation(
            DriverStyle::Aggressive,
            VehicleState::new(0.0, 12.0),
            VehicleState::new(25.0, 15.0),
        );
        let first = sim.step(&mut []).unwrap();
        assert!(first.command.acceleration > 0.0);
        assert_eq!(sim.previous_acceleration, sim.ego().acceleration);
        assert!((first.command.jerk - first.command.acceleration / 0.1).abs() < 1e-9);
    }
}
