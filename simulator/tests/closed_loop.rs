use config::Config;
use control_model::{ControlCommand, VehicleState};
use controller::{
    Action, Controller, DriverStyle, DriverStyleProfile, MpcController, MpcSettings,
    SolverFailure, SolverStatus,
};
use simulator::lead_trajectory::ConstantSpeed;
use simulator::report::{self, Report};
use simulator::{Observer, Simulation, SimulationError, TraceRecorder};

/// Fails on every step where `fails(step)` is true and otherwise holds zero acceleration.
struct ScriptedController<F: FnMut(usize) -> bool> {
    fails: F,
    calls: usize,
}

impl<F: FnMut(usize) -> bool> Controller for ScriptedController<F> {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn compute_action(
        &mut self,
        _ego: &VehicleState,
        _lead: &VehicleState,
        profile: &DriverStyleProfile,
        previous_acceleration: f64,
    ) -> Action {
        let failed = (self.fails)(self.calls);
        self.calls += 1;
        let (acceleration, status) = if failed {
            (-3.0, SolverStatus::Failed(SolverFailure::PrimalInfeasible))
        } else {
            (0.0, SolverStatus::Solved)
        };
        Action {
            command: ControlCommand::new(acceleration, previous_acceleration, profile.dt),
            status,
            violations: Vec::new(),
            horizon: Vec::new(),
        }
    }
}

fn scripted_simulation<F: FnMut(usize) -> bool + 'static>(fails: F) -> Simulation {
    let settings = MpcSettings::default();
    Simulation::new(
        DriverStyleProfile::from_style(DriverStyle::Balanced),
        Box::new(ScriptedController { fails, calls: 0 }),
        &settings,
        VehicleState::new(0.0, 15.0),
        VehicleState::new(30.0, 15.0),
        Box::new(ConstantSpeed),
    )
}

#[test]
fn persistent_failure_degrades_with_partial_metrics() {
    let sim = scripted_simulation(|_| true).with_failure_threshold(3);
    match sim.run(100, &mut []) {
        Err(SimulationError::ControllerDegraded {
            step,
            consecutive_failures,
            metrics,
        }) => {
            assert_eq!(step, 2);
            assert_eq!(consecutive_failures, 3);
            assert_eq!(metrics.steps, 3);
            assert_eq!(metrics.solver_failures, 3);
        }
        Ok(_) => panic!("run should have degraded"),
    }
}

#[test]
fn degradation_is_reported_once_per_streak() {
    let mut sim = scripted_simulation(|_| true).with_failure_threshold(2);
    let errors = (0..6)
        .map(|_| sim.step(&mut []))
        .filter(|result| result.is_err())
        .count();
    assert_eq!(errors, 1);
    assert_eq!(sim.consecutive_failures(), 6);
}

#[test]
fn intermittent_failures_do_not_degrade() {
    let sim = scripted_simulation(|step| step % 2 == 0).with_failure_threshold(2);
    let metrics = sim.run(20, &mut []).unwrap();
    assert_eq!(metrics.steps, 20);
    assert_eq!(metrics.solver_failures, 10);
}

#[test]
fn fallback_brakes_the_ego_vehicle() {
    let mut sim = scripted_simulation(|_| true).with_failure_threshold(10);
    let snapshot = sim.step(&mut []).unwrap();
    assert_eq!(snapshot.command.acceleration, -3.0);
    assert!(matches!(snapshot.status, SolverStatus::Failed(_)));
    assert!((snapshot.ego.velocity - 14.7).abs() < 1e-9);
}

#[test]
fn reference_run_completes() {
    let config = Config::from_toml("t = 20.0").unwrap();
    let mut trace = TraceRecorder::new(Vec::new());
    let metrics = {
        let mut observers: Vec<&mut dyn Observer> = vec![&mut trace];
        Simulation::from_config(&config, DriverStyle::Balanced)
            .run(config.steps(), &mut observers)
            .unwrap()
    };

    assert_eq!(metrics.steps, 200);
    assert_eq!(metrics.solver_failures, 0);
    assert!(metrics.acceleration_max <= 3.0 + 1e-6);
    assert!(metrics.velocity_rmse.is_finite());
    assert_eq!(trace.rows(), 200);
    let csv = String::from_utf8(trace.finish().unwrap()).unwrap();
    assert_eq!(csv.lines().count(), 201);
}

#[test]
fn recovers_after_infeasible_step() {
    let settings = MpcSettings {
        max_jerk: Some(1.0),
        ..MpcSettings::default()
    };
    let mut sim = Simulation::new(
        DriverStyleProfile::from_style(DriverStyle::Balanced),
        Box::new(MpcController::new(settings.clone())),
        &settings,
        VehicleState::new(0.0, 15.0),
        VehicleState::new(30.0, 15.0),
        Box::new(ConstantSpeed),
    )
    .with_previous_acceleration(50.0);

    let first = sim.step(&mut []).unwrap();
    assert!(matches!(first.status, SolverStatus::Failed(_)));
    assert_eq!(first.command.acceleration, -3.0);
    assert_eq!(sim.consecutive_failures(), 1);

    let second = sim.step(&mut []).unwrap();
    assert!(!matches!(second.status, SolverStatus::Failed(_)));
    assert!((second.command.acceleration + 3.0).abs() <= 0.1 + 1e-6);
    assert_eq!(sim.consecutive_failures(), 0);
}

#[test]
fn report_has_a_section_per_style() {
    let config = Config::from_toml("t = 3.0").unwrap();
    let mut report = Report::new();
    for style in DriverStyle::ALL.iter().copied() {
        let metrics = Simulation::from_config(&config, style)
            .run(config.steps(), &mut [])
            .unwrap();
        assert_eq!(metrics.steps, 30);
        report.insert(style.name().to_owned(), metrics);
    }

    let text = report::to_toml(&report).unwrap();
    for style in DriverStyle::ALL.iter() {
        assert!(text.contains(&format!("[{}]", style)));
    }
}
