use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::metrics::Metrics;

/// Metrics of every run, keyed by driver style name.
pub type Report = BTreeMap<String, Metrics>;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialise report: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write report to {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

pub fn to_toml(report: &Report) -> Result<String, ReportError> {
    Ok(toml::to_string(report)?)
}

pub fn write_report(path: &Path, report: &Report) -> Result<(), ReportError> {
    let text = to_toml(report)?;
    fs::write(path, text).map_err(|source| ReportError::Io {
        path: path.to_owned(),
        source,
    })?;
    info!("wrote report for {} runs to {}", report.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_per_style() {
        let mut report = Report::new();
        report.insert(
            "conservative".to_owned(),
            Metrics {
                steps: 10,
                velocity_rmse: 0.5,
                ..Metrics::default()
            },
        );
        report.insert(
            "aggressive".to_owned(),
            Metrics {
                steps: 10,
                solver_failures: 2,
                ..Metrics::default()
            },
        );

        let text = to_toml(&report).unwrap();
        let aggressive = text.find("[aggressive]").unwrap();
        let conservative = text.find("[conservative]").unwrap();
        assert!(aggressive < conservative);

        let parsed: Report = toml::from_str(&text).unwrap();
        assert_eq!(parsed, report);
    }
}
