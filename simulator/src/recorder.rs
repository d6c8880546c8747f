use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::Path;

use controller::SolverStatus;
use prelude::*;

use crate::simulation::{Observer, Snapshot};

#[derive(Serialize)]
struct TraceRow {
    step: usize,
    t: float,
    ego_position: float,
    ego_velocity: float,
    ego_acceleration: float,
    lead_position: float,
    lead_velocity: float,
    lead_acceleration: float,
    distance: float,
    desired_distance: float,
    command: float,
    jerk: float,
    status: &'static str,
}

fn status_name(status: &SolverStatus) -> &'static str {
    match status {
        SolverStatus::Solved => "solved",
        SolverStatus::SolvedInaccurate => "solved_inaccurate",
        SolverStatus::Failed(_) => "failed",
    }
}

/// Writes one csv row per step. Observers cannot fail a step, so the first write error is kept
/// and returned by `finish`.
pub struct TraceRecorder<W: io::Write> {
    writer: csv::Writer<W>,
    error: Option<csv::Error>,
    rows: usize,
}

impl TraceRecorder<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<TraceRecorder<File>, csv::Error> {
        Ok(TraceRecorder::new(File::create(path)?))
    }
}

impl<W: io::Write> TraceRecorder<W> {
    pub fn new(writer: W) -> TraceRecorder<W> {
        TraceRecorder {
            writer: csv::Writer::from_writer(writer),
            error: None,
            rows: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> Result<W, csv::Error> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}

impl<W: io::Write> Observer for TraceRecorder<W> {
    fn observe(&mut self, snapshot: &Snapshot) {
        if self.error.is_some() {
            return;
        }

        let row = TraceRow {
            step: snapshot.step,
            t: snapshot.t,
            ego_position: snapshot.ego.position,
            ego_velocity: snapshot.ego.velocity,
            ego_acceleration: snapshot.ego.acceleration,
            lead_position: snapshot.lead.position,
            lead_velocity: snapshot.lead.velocity,
            lead_acceleration: snapshot.lead.acceleration,
            distance: snapshot.distance,
            desired_distance: snapshot.desired_distance,
            command: snapshot.command.acceleration,
            jerk: snapshot.command.jerk,
            status: status_name(&snapshot.status),
        };
        match self.writer.serialize(row) {
            Ok(()) => self.rows += 1,
            Err(e) => {
                warn!("failed to write trace row: {}", e);
                self.error = Some(e);
            }
        }
    }
}
