use std::path::PathBuf;

use controller::{DriverStyle, UnknownStyleError};
use prelude::*;

pub const USAGE: &str = "\
usage: acc_simulator [options]

options:
  --style <name|all>   driver style: aggressive, balanced, conservative or all
  --time <seconds>     simulated duration
  --steps <n>          number of control steps, overrides --time
  --config <path>      run configuration (default acc.toml)
  --report <path>      write the metrics of every run as toml
  --trace <path>       write a per-step csv trace
  --plot <dir>         save result plots into a directory instead of showing them
  --no-plot            skip plotting
  --flame <path>       write a merged flame graph
  --help               print this message";

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("invalid value '{value}' for {flag}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown argument '{0}'")]
    UnknownArgument(String),
    #[error(transparent)]
    UnknownStyle(#[from] UnknownStyleError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StyleSelection {
    One(DriverStyle),
    All,
}

impl StyleSelection {
    pub fn from_name(name: &str) -> Result<StyleSelection, UnknownStyleError> {
        if name.trim().eq_ignore_ascii_case("all") {
            Ok(StyleSelection::All)
        } else {
            name.parse().map(StyleSelection::One)
        }
    }

    pub fn styles(self) -> Vec<DriverStyle> {
        match self {
            StyleSelection::One(style) => vec![style],
            StyleSelection::All => DriverStyle::ALL.to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlotTarget {
    Window,
    Directory(PathBuf),
    Disabled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Args {
    /// Overrides the style named in the configuration.
    pub style: Option<StyleSelection>,
    pub time: Option<float>,
    pub steps: Option<usize>,
    pub config: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub trace: Option<PathBuf>,
    pub plot: PlotTarget,
    pub flame: Option<PathBuf>,
    pub help: bool,
}

impl Default for Args {
    fn default() -> Args {
        Args {
            style: None,
            time: None,
            steps: None,
            config: None,
            report: None,
            trace: None,
            plot: PlotTarget::Window,
            flame: None,
            help: false,
        }
    }
}

impl Args {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Args, CliError> {
        let mut parsed = Args::default();
        let mut args = args.into_iter();

        while let Some(flag) = args.next() {
            let mut value = || args.next().ok_or_else(|| CliError::MissingValue(flag.clone()));
            match flag.as_str() {
                "--style" => parsed.style = Some(StyleSelection::from_name(&value()?)?),
                "--time" => {
                    let time = parse_value::<float>(&flag, value()?)?;
                    if !(time > 0.0 && time.is_finite()) {
                        return Err(CliError::InvalidValue {
                            flag,
                            value: time.to_string(),
                        });
                    }
                    parsed.time = Some(time);
                }
                "--steps" => parsed.steps = Some(parse_value(&flag, value()?)?),
                "--config" => parsed.config = Some(value()?.into()),
                "--report" => parsed.report = Some(value()?.into()),
                "--trace" => parsed.trace = Some(value()?.into()),
                "--plot" => parsed.plot = PlotTarget::Directory(value()?.into()),
                "--no-plot" => parsed.plot = PlotTarget::Disabled,
                "--flame" => parsed.flame = Some(value()?.into()),
                "--help" | "-h" => parsed.help = true,
                _ => return Err(CliError::UnknownArgument(flag)),
            }
        }

        Ok(parsed)
    }

    /// Trace file of one style. Runs of several styles get the style appended to the file
    /// stem so they do not overwrite each other.
    pub fn trace_path(&self, style: DriverStyle, multiple: bool) -> Option<PathBuf> {
        let path = self.trace.as_ref()?;
        if !multiple {
            return Some(path.clone());
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trace".to_owned());
        let file_name = match path.extension() {
            Some(ext) => format!("{}-{}.{}", stem, style, ext.to_string_lossy()),
            None => format!("{}-{}", stem, style),
        };
        Some(path.with_file_name(file_name))
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: String) -> Result<T, CliError> {
    value.parse().map_err(|_| CliError::InvalidValue {
        flag: flag.to_owned(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, CliError> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args, Args::default());
        assert_eq!(args.style, None);
        assert_eq!(args.plot, PlotTarget::Window);
    }

    #[test]
    fn all_flags() {
        let args = parse(&[
            "--style", "Conservative", "--time", "12.5", "--steps", "40", "--config", "run.toml",
            "--report", "out.toml", "--trace", "trace.csv", "--plot", "plots", "--flame",
            "flame.html",
        ])
        .unwrap();
        assert_eq!(args.style, Some(StyleSelection::One(DriverStyle::Conservative)));
        assert_eq!(args.time, Some(12.5));
        assert_eq!(args.steps, Some(40));
        assert_eq!(args.config, Some(PathBuf::from("run.toml")));
        assert_eq!(args.report, Some(PathBuf::from("out.toml")));
        assert_eq!(args.plot, PlotTarget::Directory(PathBuf::from("plots")));
        assert_eq!(args.flame, Some(PathBuf::from("flame.html")));
    }

    #[test]
    fn all_styles_and_trace_names() {
        let args = parse(&["--style", "all", "--trace", "out/trace.csv"]).unwrap();
        assert_eq!(args.style, Some(StyleSelection::All));
        assert_eq!(StyleSelection::All.styles().len(), 3);
        assert_eq!(
            StyleSelection::from_name("ALL").unwrap(),
            StyleSelection::All
        );
        assert_eq!(
            args.trace_path(DriverStyle::Aggressive, true),
            Some(PathBuf::from("out/trace-aggressive.csv"))
        );
        assert_eq!(
            args.trace_path(DriverStyle::Aggressive, false),
            Some(PathBuf::from("out/trace.csv"))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            parse(&["--style", "sporty"]),
            Err(CliError::UnknownStyle(_))
        ));
        assert!(matches!(
            parse(&["--steps", "many"]),
            Err(CliError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse(&["--time", "-1"]),
            Err(CliError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse(&["--time", "inf"]),
            Err(CliError::InvalidValue { .. })
        ));
        assert!(matches!(parse(&["--time"]), Err(CliError::MissingValue(_))));
        assert!(matches!(
            parse(&["--verbose"]),
            Err(CliError::UnknownArgument(_))
        ));
    }
}
