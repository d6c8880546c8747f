use control_model::{ActuatorLimits, VehicleModel, VehicleState};
use prelude::*;

/// Extrapolates the lead vehicle over the horizon using only its current state.
pub trait LeadPrediction: Send {
    fn name(&self) -> &'static str;

    /// Returns the predicted lead state after each of the `horizon` steps.
    fn predict(&self, lead: &VehicleState, horizon: usize, dt: float) -> Vec<VehicleState>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadPredictionKind {
    ConstantVelocity,
    ConstantAcceleration,
}

impl LeadPredictionKind {
    pub fn build(self) -> Box<dyn LeadPrediction> {
        match self {
            LeadPredictionKind::ConstantVelocity => Box::new(ConstantVelocity),
            LeadPredictionKind::ConstantAcceleration => Box::new(ConstantAcceleration),
        }
    }
}

pub struct ConstantVelocity;

impl LeadPrediction for ConstantVelocity {
    fn name(&self) -> &'static str {
        "constant_velocity"
    }

    fn predict(&self, lead: &VehicleState, horizon: usize, dt: float) -> Vec<VehicleState> {
        let coasting = VehicleState {
            acceleration: 0.0,
            ..*lead
        };
        extrapolate(&coasting, horizon, dt)
    }
}

/// Holds the last measured acceleration. A decelerating lead comes to rest rather than
/// reversing.
pub struct ConstantAcceleration;

impl LeadPrediction for ConstantAcceleration {
    fn name(&self) -> &'static str {
        "constant_acceleration"
    }

    fn predict(&self, lead: &VehicleState, horizon: usize, dt: float) -> Vec<VehicleState> {
        extrapolate(lead, horizon, dt)
    }
}

fn extrapolate(lead: &VehicleState, horizon: usize, dt: float) -> Vec<VehicleState> {
    let model = VehicleModel::new(ActuatorLimits {
        min_acceleration: NEG_INFINITY,
        max_acceleration: INFINITY,
        max_velocity: INFINITY,
    });

    let mut state = *lead;
    (0..horizon)
        .map(|_| {
            state = model.advance(&state, lead.acceleration, dt);
            state
        })
        .collect()
}
