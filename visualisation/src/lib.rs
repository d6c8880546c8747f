#[macro_use]
extern crate log;

use gnuplot::{AxesCommon, Caption, Figure};
use std::path::Path;

use control_model::VehicleState;
use prelude::*;

#[derive(Debug, thiserror::Error)]
#[error("gnuplot failed: {0}")]
pub struct PlotError(String);

/// Per-step record of a car following run.
#[derive(Clone, Debug, Default)]
pub struct History {
    t: Vec<float>,
    ego_position: Vec<float>,
    lead_position: Vec<float>,
    ego_velocity: Vec<float>,
    lead_velocity: Vec<float>,
    distance: Vec<float>,
    desired_distance: Vec<float>,
    acceleration: Vec<float>,
    jerk: Vec<float>,
}

impl History {
    pub fn new() -> History {
        History::default()
    }

    pub fn record(
        &mut self,
        t: float,
        ego: &VehicleState,
        lead: &VehicleState,
        desired_distance: float,
        jerk: float,
    ) {
        self.t.push(t);
        self.ego_position.push(ego.position);
        self.lead_position.push(lead.position);
        self.ego_velocity.push(ego.velocity);
        self.lead_velocity.push(lead.velocity);
        self.distance.push(ego.gap_to(lead));
        self.desired_distance.push(desired_distance);
        self.acceleration.push(ego.acceleration);
        self.jerk.push(jerk);
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }
}

/// Plots positions, velocities, gap, acceleration and jerk. Opens a window when `output` is
/// `None`, otherwise writes a PNG.
pub fn plot(title: &str, history: &History, output: Option<&Path>) -> Result<(), PlotError> {
    let mut fg = Figure::new();
    // Position
    {
        let ax = fg.axes2d();
        ax.set_pos_grid(3, 2, 0);
        ax.set_title(&format!("{} position", title), &[]);
        ax.lines(&history.t, &history.ego_position, &[Caption("ego")]);
        ax.lines(&history.t, &history.lead_position, &[Caption("lead")]);
    }
    // Speed
    {
        let ax = fg.axes2d();
        ax.set_pos_grid(3, 2, 1);
        ax.set_title("v", &[]);
        ax.lines(&history.t, &history.ego_velocity, &[Caption("ego")]);
        ax.lines(&history.t, &history.lead_velocity, &[Caption("lead")]);
    }
    // Gap
    {
        let ax = fg.axes2d();
        ax.set_pos_grid(3, 2, 2);
        ax.set_title("distance", &[]);
        ax.lines(&history.t, &history.distance, &[Caption("actual")]);
        ax.lines(&history.t, &history.desired_distance, &[Caption("desired")]);
    }
    // Acceleration
    {
        let ax = fg.axes2d();
        ax.set_pos_grid(3, 2, 3);
        ax.set_title("acceleration", &[]);
        ax.lines(&history.t, &history.acceleration, &[]);
    }
    // Jerk
    {
        let ax = fg.axes2d();
        ax.set_pos_grid(3, 2, 4);
        ax.set_title("jerk", &[]);
        ax.lines(&history.t, &history.jerk, &[]);
    }

    match output {
        Some(path) => {
            info!("writing plot to {}", path.display());
            fg.save_to_png(path, 1200, 900)
                .map_err(|e| PlotError(e.to_string()))
        }
        None => fg.show().map(|_| ()).map_err(|e| PlotError(e.to_string())),
    }
}
