use control_model::{ControlCommand, VehicleState};
use prelude::flame;
use prelude::*;

use crate::{
    Action, ConstraintViolation, Controller, DriverStyleProfile, HorizonStage, LeadPrediction,
    MpcSettings, OsqpMpc, PredictionHorizon, QpParameters, SolverFailure, SolverStatus,
    StepInput, ViolationKind,
};

// Slack below this is solver noise rather than a predicted breach
const SLACK_TOLERANCE: float = 1e-3;

/// Adaptive cruise control by receding horizon optimisation. Only the first acceleration of
/// each solved horizon is applied.
pub struct MpcController {
    settings: MpcSettings,
    prediction: Box<dyn LeadPrediction>,
    mpc: Option<OsqpMpc>,
}

struct Solved {
    acceleration: float,
    inaccurate: bool,
    horizon: PredictionHorizon,
    violations: Vec<ConstraintViolation>,
}

impl MpcController {
    pub fn new(settings: MpcSettings) -> MpcController {
        MpcController {
            prediction: settings.lead_prediction.build(),
            settings,
            mpc: None,
        }
    }

    pub fn settings(&self) -> &MpcSettings {
        &self.settings
    }

    fn qp_parameters(&self, profile: &DriverStyleProfile) -> QpParameters {
        QpParameters {
            dt: profile.dt,
            weights: profile.weights,
            time_gap: profile.time_gap,
            min_safe_distance: self.settings.min_safe_distance,
            far_gap_multiplier: self.settings.far_gap_multiplier,
            limits: self.settings.limits,
            max_jerk: self.settings.max_jerk,
        }
    }

    /// Reuses the solver workspace while the horizon length is unchanged.
    fn mpc_for(&mut self, profile: &DriverStyleProfile) -> Result<&mut OsqpMpc, SolverFailure> {
        let params = self.qp_parameters(profile);
        let mpc = match self.mpc.take() {
            Some(mut mpc) if mpc.horizon_len() == profile.horizon => {
                mpc.update_parameters(params);
                mpc
            }
            _ => {
                let _guard = flame::start_guard("osqp mpc create");
                OsqpMpc::new(profile.horizon, params, &self.settings.solver)?
            }
        };
        Ok(self.mpc.insert(mpc))
    }

    fn measured_violations(
        &self,
        ego: &VehicleState,
        lead: &VehicleState,
        profile: &DriverStyleProfile,
    ) -> Vec<ConstraintViolation> {
        let distance = ego.gap_to(lead);
        let d_safe = self.settings.min_safe_distance;
        let d_max = self.settings.max_distance(profile, ego.velocity);

        let violation = if distance < d_safe {
            let violation = ConstraintViolation {
                kind: ViolationKind::TooClose,
                stage: 0,
                distance,
                bound: d_safe,
            };
            warn!(
                "gap {:.2} m below minimum safe distance {:.2} m",
                distance, d_safe
            );
            Some(violation)
        } else if distance > d_max {
            warn!("gap {:.2} m beyond following band {:.2} m", distance, d_max);
            Some(ConstraintViolation {
                kind: ViolationKind::TooFar,
                stage: 0,
                distance,
                bound: d_max,
            })
        } else {
            None
        };

        violation.into_iter().collect()
    }

    fn solve(
        &mut self,
        ego: &VehicleState,
        lead: &VehicleState,
        profile: &DriverStyleProfile,
        previous_acceleration: float,
    ) -> Result<Solved, SolverFailure> {
        let N = profile.horizon;
        let dt = profile.dt;
        let limits = self.settings.limits;
        let d_safe = self.settings.min_safe_distance;
        let far_band = self.settings.far_gap_multiplier * profile.time_gap;
        let reference_speed = profile.reference_speed(self.settings.nominal_speed);

        let lead_horizon = flame::span_of("lead prediction", || {
            self.prediction.predict(lead, N, dt)
        });
        let lead_positions: Vec<_> = lead_horizon
            .iter()
            .map(|state| state.position - ego.position)
            .collect();

        let mpc = self.mpc_for(profile)?;
        let solution = mpc.solve(&StepInput {
            velocity: ego.velocity,
            previous_acceleration,
            reference_speed,
            lead_positions: &lead_positions,
        })?;

        let a_0 = solution.accelerations[0];
        if a_0 < limits.min_acceleration - BOUND_TOLERANCE
            || a_0 > limits.max_acceleration + BOUND_TOLERANCE
        {
            warn!("solved acceleration {} outside actuator limits", a_0);
        }

        let mut violations = Vec::new();
        let mut horizon = Vec::with_capacity(N);
        for k in 0..N {
            let (p_k, v_k) = solution.states[k];
            let a_k = solution.accelerations[k];
            let distance = lead_positions[k] - p_k;

            if solution.close_slack[k] > SLACK_TOLERANCE {
                violations.push(ConstraintViolation {
                    kind: ViolationKind::TooClose,
                    stage: k + 1,
                    distance,
                    bound: d_safe,
                });
            }
            if solution.far_slack[k] > SLACK_TOLERANCE {
                violations.push(ConstraintViolation {
                    kind: ViolationKind::TooFar,
                    stage: k + 1,
                    distance,
                    bound: d_safe + far_band * v_k,
                });
            }

            horizon.push(HorizonStage {
                ego: VehicleState {
                    position: ego.position + p_k,
                    velocity: v_k,
                    acceleration: a_k,
                },
                lead: lead_horizon[k],
                acceleration: a_k,
            });
        }
        if !violations.is_empty() {
            debug!("{} predicted distance violations", violations.len());
        }

        Ok(Solved {
            acceleration: limits.clamp_acceleration(a_0),
            inaccurate: solution.inaccurate,
            horizon,
            violations,
        })
    }
}

impl Controller for MpcController {
    fn name(&self) -> &'static str {
        "mpc_acc"
    }

    fn compute_action(
        &mut self,
        ego: &VehicleState,
        lead: &VehicleState,
        profile: &DriverStyleProfile,
        previous_acceleration: float,
    ) -> Action {
        let _guard = flame::start_guard("mpc compute action");

        let mut violations = self.measured_violations(ego, lead, profile);

        match self.solve(ego, lead, profile, previous_acceleration) {
            Ok(solved) => {
                let status = if solved.inaccurate {
                    debug!("using inaccurate solution");
                    SolverStatus::SolvedInaccurate
                } else {
                    SolverStatus::Solved
                };
                debug!(
                    "command {:.3} m/s^2 at v={:.2} gap={:.2}",
                    solved.acceleration,
                    ego.velocity,
                    ego.gap_to(lead)
                );
                violations.extend(solved.violations);
                Action {
                    command: ControlCommand::new(
                        solved.acceleration,
                        previous_acceleration,
                        profile.dt,
                    ),
                    status,
                    violations,
                    horizon: solved.horizon,
                }
            }
            Err(failure) => {
                let acceleration = self
                    .settings
                    .fallback
                    .command(&self.settings.limits, previous_acceleration);
                warn!(
                    "mpc solve failed ({}), applying fallback {:?} of {} m/s^2",
                    failure, self.settings.fallback, acceleration
                );
                Action {
                    command: ControlCommand::new(acceleration, previous_acceleration, profile.dt),
                    status: SolverStatus::Failed(failure),
                    violations,
                    horizon: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DriverStyle, FallbackPolicy, LeadPredictionKind, SolverSettings};
    use std::time::Duration;

    fn state(position: float, velocity: float) -> VehicleState {
        VehicleState::new(position, velocity)
    }

    fn controller() -> MpcController {
        MpcController::new(MpcSettings::default())
    }

    #[test]
    fn commands_stay_within_actuator_limits() {
        let mut controller = controller();
        let limits = controller.settings().limits;

        for style in DriverStyle::ALL {
            let profile = DriverStyleProfile::from_style(style);
            for &velocity in &[0.0, 5.0, 15.0, 30.0] {
                for &gap in &[3.0, 12.0, 40.0, 120.0] {
                    for &lead_velocity in &[0.0, 10.0, 25.0] {
                        for &previous in &[-3.0, 0.0, 2.0] {
                            let action = controller.compute_action(
                                &state(0.0, velocity),
                                &state(gap, lead_velocity),
                                &profile,
                                previous,
                            );
                            let a = action.command.acceleration;
                            assert!(a >= limits.min_acceleration && a <= limits.max_acceleration);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn steady_state_is_a_fixed_point() {
        let mut controller = controller();
        for style in DriverStyle::ALL {
            let profile = DriverStyleProfile::from_style(style).with_horizon(1, 0.1);
            let v_ref = profile.reference_speed(15.0);
            let action = controller.compute_action(
                &state(0.0, v_ref),
                &state(profile.time_gap * v_ref, v_ref),
                &profile,
                0.0,
            );
            assert_eq!(action.status, SolverStatus::Solved);
            assert!(action.command.acceleration.abs() < 1e-3);
            assert!(action.violations.is_empty());
        }
    }

    #[test]
    fn aggressive_driver_closes_a_long_gap() {
        let mut controller = controller();
        let profile = DriverStyleProfile::for_style("aggressive").unwrap();
        let action = controller.compute_action(&state(0.0, 12.0), &state(25.0, 15.0), &profile, 0.0);

        assert_eq!(action.status, SolverStatus::Solved);
        assert!(action.command.acceleration > 0.0);
        assert_eq!(action.horizon.len(), 10);
    }

    #[test]
    fn conservative_driver_brakes_when_too_close() {
        let mut controller = controller();
        let profile = DriverStyleProfile::for_style("conservative").unwrap();
        let action = controller.compute_action(&state(0.0, 15.0), &state(8.0, 10.0), &profile, 0.0);

        assert!(action.command.acceleration <= 0.0);
        assert!(action
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::TooClose && v.stage == 0 && v.distance == 8.0));
    }

    #[test]
    fn stronger_close_penalty_never_brakes_less() {
        let mut controller = controller();
        let profile = DriverStyleProfile::from_style(DriverStyle::Balanced);
        let ego = state(0.0, 12.0);
        let lead = state(11.0, 12.0);

        let mut last = INFINITY;
        for &q_close in &[1.0, 5.0, 10.0, 20.0, 50.0, 100.0] {
            let weights = crate::Weights {
                q_close,
                ..profile.weights
            };
            let profile = profile.clone().with_weights(weights);
            let a = controller
                .compute_action(&ego, &lead, &profile, 0.0)
                .command
                .acceleration;
            assert!(a <= last + 1e-4, "q_close={} gave {} after {}", q_close, a, last);
            last = a;
        }
    }

    #[test]
    fn infeasible_step_applies_fallback() {
        let settings = MpcSettings {
            max_jerk: Some(1.0),
            ..MpcSettings::default()
        };
        let mut controller = MpcController::new(settings.clone());
        let profile = DriverStyleProfile::from_style(DriverStyle::Balanced);
        let ego = state(0.0, 15.0);
        let lead = state(30.0, 15.0);

        // The jerk limit makes an acceleration of 50 unreachable from below 2
        let action = controller.compute_action(&ego, &lead, &profile, 50.0);
        assert!(action.is_fallback());
        assert_eq!(
            action.status,
            SolverStatus::Failed(SolverFailure::PrimalInfeasible)
        );
        assert_eq!(action.command.acceleration, -3.0);
        assert!(action.horizon.is_empty());

        let mut holding = MpcController::new(MpcSettings {
            fallback: FallbackPolicy::HoldPrevious,
            ..settings
        });
        let action = holding.compute_action(&ego, &lead, &profile, 50.0);
        assert!(action.is_fallback());
        assert_eq!(action.command.acceleration, 2.0);

        // Recovers once the previous command is reachable again
        let action = controller.compute_action(&ego, &lead, &profile, 0.0);
        assert!(!action.is_fallback());
    }

    #[test]
    fn measured_far_gap_is_a_violation() {
        let mut controller = controller();
        let profile = DriverStyleProfile::from_style(DriverStyle::Balanced);
        // Band edge at 15 m/s: 10 + 2 * 2.0 * 15 = 70 m
        let action =
            controller.compute_action(&state(0.0, 15.0), &state(100.0, 15.0), &profile, 0.0);

        let measured: Vec<_> = action.violations.iter().filter(|v| v.stage == 0).collect();
        assert_eq!(measured.len(), 1);
        assert_eq!(measured[0].kind, ViolationKind::TooFar);
        assert_eq!(measured[0].distance, 100.0);
        assert!((measured[0].bound - 70.0).abs() < 1e-9);
    }

    #[test]
    fn solver_deadline_applies_fallback() {
        let mut controller = MpcController::new(MpcSettings {
            solver: SolverSettings {
                time_limit: Some(Duration::from_nanos(1)),
                ..SolverSettings::default()
            },
            ..MpcSettings::default()
        });
        let profile = DriverStyleProfile::from_style(DriverStyle::Balanced);
        let action = controller.compute_action(&state(0.0, 15.0), &state(30.0, 15.0), &profile, 0.0);

        // OSQP may converge before it first checks the clock
        match action.status {
            SolverStatus::Failed(failure) => {
                assert_eq!(failure, SolverFailure::TimeLimit);
                assert_eq!(action.command.acceleration, -3.0);
                assert!(action.horizon.is_empty());
            }
            SolverStatus::Solved | SolverStatus::SolvedInaccurate => {
                assert_eq!(action.horizon.len(), profile.horizon);
            }
        }
    }

    #[test]
    fn braking_lead_prediction_brakes_harder() {
        let profile = DriverStyleProfile::from_style(DriverStyle::Balanced);
        let ego = state(0.0, 15.0);
        let lead = VehicleState {
            position: 30.0,
            velocity: 15.0,
            acceleration: -3.0,
        };

        let mut constant_velocity = controller();
        let mut constant_acceleration = MpcController::new(MpcSettings {
            lead_prediction: LeadPredictionKind::ConstantAcceleration,
            ..MpcSettings::default()
        });

        let a_cv = constant_velocity
            .compute_action(&ego, &lead, &profile, 0.0)
            .command
            .acceleration;
        let a_ca = constant_acceleration
            .compute_action(&ego, &lead, &profile, 0.0)
            .command
            .acceleration;
        assert!(a_ca < a_cv);
    }

    #[test]
    fn horizon_change_rebuilds_problem() {
        let mut controller = controller();
        let ego = state(0.0, 10.0);
        let lead = state(30.0, 12.0);

        let long = DriverStyleProfile::from_style(DriverStyle::Balanced);
        let first = controller.compute_action(&ego, &lead, &long, 0.0);
        let short = long.clone().with_horizon(5, 0.2);
        let action = controller.compute_action(&ego, &lead, &short, 0.0);
        assert_eq!(action.horizon.len(), 5);

        // Back to the first profile, same answer as before
        let again = controller.compute_action(&ego, &lead, &long, 0.0);
        assert!((again.command.acceleration - first.command.acceleration).abs() < 1e-5);

        let last = again.horizon.last().unwrap();
        assert!((last.lead.position - (30.0 + 12.0 * 1.0)).abs() < 1e-9);
    }
}
