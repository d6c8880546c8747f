#[macro_use]
extern crate log;

pub mod flame_merge;
pub mod lead_trajectory;
pub mod metrics;
pub mod recorder;
pub mod report;
pub mod simulation;

pub use lead_trajectory::LeadTrajectory;
pub use metrics::{Metrics, MetricsAccumulator, StepSample};
pub use recorder::TraceRecorder;
pub use report::{write_report, Report, ReportError};
pub use simulation::{Observer, Simulation, SimulationError, Snapshot};
