#![allow(non_snake_case)]

#[macro_use]
extern crate log;

use std::time::Duration;

use control_model::{ActuatorLimits, ControlCommand, VehicleState};
use prelude::*;

mod driver_style;
pub use driver_style::{
    DriverStyle, DriverStyleProfile, UnknownStyleError, Weights, DEFAULT_DT, DEFAULT_HORIZON,
};

mod lead_prediction;
pub use lead_prediction::{
    ConstantAcceleration, ConstantVelocity, LeadPrediction, LeadPredictionKind,
};

mod osqp_mpc_builder;
pub use osqp_mpc_builder::{OsqpMpc, QpParameters, QpSolution, StepInput};

mod mpc_acc;
pub use mpc_acc::MpcController;

pub trait Controller {
    fn name(&self) -> &'static str;

    /// Computes the acceleration to apply for the next step. Never fails: a step whose
    /// optimisation could not be solved returns the fallback command and reports the failure
    /// in `Action::status`.
    fn compute_action(
        &mut self,
        ego: &VehicleState,
        lead: &VehicleState,
        profile: &DriverStyleProfile,
        previous_acceleration: float,
    ) -> Action;
}

#[derive(Clone, Debug)]
pub struct Action {
    pub command: ControlCommand,
    pub status: SolverStatus,
    pub violations: Vec<ConstraintViolation>,
    /// Predicted trajectory of the solved step, empty when the solve failed.
    pub horizon: PredictionHorizon,
}

impl Action {
    pub fn is_fallback(&self) -> bool {
        matches!(self.status, SolverStatus::Failed(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SolverStatus {
    Solved,
    /// OSQP stopped at a looser tolerance than requested; the command is still used.
    SolvedInaccurate,
    Failed(SolverFailure),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SolverFailure {
    #[error("problem is primal infeasible")]
    PrimalInfeasible,
    #[error("problem is dual infeasible")]
    DualInfeasible,
    #[error("cost is non-convex")]
    NonConvex,
    #[error("maximum number of iterations reached")]
    MaxIterations,
    #[error("solver time limit reached")]
    TimeLimit,
    #[error("solution contains non-finite values")]
    NonFinite,
    #[error("solver setup failed: {0}")]
    Setup(String),
    #[error("solver returned an unknown status")]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// Gap below the minimum safe distance.
    TooClose,
    /// Gap beyond the far edge of the following band.
    TooFar,
}

/// A soft distance bound that was breached. Stage 0 is the measured gap, later stages are
/// predictions of the solved horizon.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstraintViolation {
    pub kind: ViolationKind,
    pub stage: usize,
    pub distance: float,
    pub bound: float,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HorizonStage {
    pub ego: VehicleState,
    pub lead: VehicleState,
    pub acceleration: float,
}

pub type PredictionHorizon = Vec<HorizonStage>;

/// Command applied when a step fails to solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackPolicy {
    MaxBraking,
    /// Repeat the previous command, limited to the actuator range.
    HoldPrevious,
}

impl FallbackPolicy {
    pub fn command(self, limits: &ActuatorLimits, previous_acceleration: float) -> float {
        match self {
            FallbackPolicy::MaxBraking => limits.min_acceleration,
            FallbackPolicy::HoldPrevious => limits.clamp_acceleration(previous_acceleration),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SolverSettings {
    pub eps_abs: float,
    pub eps_rel: float,
    pub max_iter: u32,
    /// Wall clock budget of a single solve.
    pub time_limit: Option<Duration>,
}

impl Default for SolverSettings {
    fn default() -> SolverSettings {
        SolverSettings {
            eps_abs: 1e-6,
            eps_rel: 1e-6,
            max_iter: 10_000,
            time_limit: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MpcSettings {
    pub limits: ActuatorLimits,
    /// Cruise speed before the style's speed factor is applied.
    pub nominal_speed: float,
    pub min_safe_distance: float,
    /// Width of the following band beyond the desired gap, in multiples of it.
    pub far_gap_multiplier: float,
    pub max_jerk: Option<float>,
    pub fallback: FallbackPolicy,
    pub lead_prediction: LeadPredictionKind,
    pub solver: SolverSettings,
}

impl Default for MpcSettings {
    fn default() -> MpcSettings {
        MpcSettings {
            limits: ActuatorLimits::default(),
            nominal_speed: 15.0,
            min_safe_distance: 10.0,
            far_gap_multiplier: 2.0,
            max_jerk: None,
            fallback: FallbackPolicy::MaxBraking,
            lead_prediction: LeadPredictionKind::ConstantVelocity,
            solver: SolverSettings::default(),
        }
    }
}

impl MpcSettings {
    /// Far edge of the following band at the given ego velocity.
    pub fn max_distance(&self, profile: &DriverStyleProfile, velocity: float) -> float {
        self.min_safe_distance + self.far_gap_multiplier * profile.time_gap * velocity
    }
}
