#[macro_use]
extern crate log;

mod cli;

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use config::{Config, ConfigError};
use controller::{DriverStyle, UnknownStyleError};
use simulator::flame_merge;
use simulator::report::{self, Report, ReportError};
use simulator::{Metrics, Observer, Simulation, SimulationError, TraceRecorder};
use visualisation::{History, PlotError};

use cli::{Args, PlotTarget, StyleSelection, USAGE};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Style(#[from] UnknownStyleError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to write trace: {0}")]
    Trace(#[from] csv::Error),
    #[error("failed to create {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn main() {
    env_logger::init();

    let args = match Args::parse(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            process::exit(2);
        }
    };
    if args.help {
        println!("{}", USAGE);
        return;
    }

    let code = match run(&args) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            1
        }
    };

    if let Some(path) = &args.flame {
        match flame_merge::write_flame(path) {
            Ok(()) => info!("wrote flame graph to {}", path.display()),
            Err(e) => error!("failed to write flame graph: {}", e),
        }
    }

    process::exit(code);
}

/// Runs every selected style. Returns false when any run degraded.
fn run(args: &Args) -> Result<bool, AppError> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(t) = args.time {
        config.t = t;
        config.validate()?;
    }
    let steps = args.steps.unwrap_or_else(|| config.steps());

    let selection = match args.style {
        Some(selection) => selection,
        None => StyleSelection::from_name(&config.style)?,
    };
    let styles = selection.styles();
    let multiple = styles.len() > 1;

    if let PlotTarget::Directory(dir) = &args.plot {
        fs::create_dir_all(dir).map_err(|source| AppError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    let mut report = Report::new();
    let mut all_completed = true;

    for style in styles {
        let (metrics, completed) = run_style(args, &config, style, steps, multiple)?;
        println!(
            "{} ({}):\n{}",
            style,
            if completed { "completed" } else { "degraded" },
            metrics
        );
        all_completed &= completed;
        report.insert(style.name().to_owned(), metrics);
    }

    if let Some(path) = &args.report {
        report::write_report(path, &report)?;
    }

    Ok(all_completed)
}

fn run_style(
    args: &Args,
    config: &Config,
    style: DriverStyle,
    steps: usize,
    multiple: bool,
) -> Result<(Metrics, bool), AppError> {
    let mut history = match args.plot {
        PlotTarget::Disabled => None,
        _ => Some(History::new()),
    };
    let mut trace = match args.trace_path(style, multiple) {
        Some(path) => Some(TraceRecorder::create(path)?),
        None => None,
    };

    let result = {
        let mut observers: Vec<&mut dyn Observer> = Vec::new();
        if let Some(history) = history.as_mut() {
            observers.push(history);
        }
        if let Some(trace) = trace.as_mut() {
            observers.push(trace);
        }
        Simulation::from_config(config, style).run(steps, &mut observers)
    };

    if let Some(trace) = trace {
        trace.finish()?;
    }

    let (metrics, completed) = match result {
        Ok(metrics) => (metrics, true),
        Err(e @ SimulationError::ControllerDegraded { .. }) => {
            error!("{}: {}", style, e);
            (e.metrics().clone(), false)
        }
    };

    if let Some(history) = &history {
        if let Err(e) = plot(args, style, history) {
            warn!("{}", e);
        }
    }

    Ok((metrics, completed))
}

fn plot(args: &Args, style: DriverStyle, history: &History) -> Result<(), PlotError> {
    let title = format!("ACC {}", style);
    match &args.plot {
        PlotTarget::Disabled => Ok(()),
        PlotTarget::Window => visualisation::plot(&title, history, None),
        PlotTarget::Directory(dir) => {
            let path = dir.join(format!("{}.png", style));
            visualisation::plot(&title, history, Some(&path))
        }
    }
}
