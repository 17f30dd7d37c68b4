//! Human-readable run report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::stats::{Metrics, Stats};
use crate::workload::Config;

/// Everything a finished run produced, serialized as indented JSON for the
/// operator. A failed run never gets this far: the first fatal error is
/// reported instead of partial, possibly misleading numbers.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub config: Config,
    pub metrics: Metrics,
    pub stats: Stats,
}

impl Report {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Print the report to stdout.
    pub fn pretty_print(&self) -> serde_json::Result<()> {
        println!("{}", self.to_json_pretty()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn report_serializes_with_all_sections() {
        let sampler = crate::stats::LatencySampler::with_capacity(8);
        sampler.record(Duration::from_micros(120));
        let report = Report {
            start_time: Utc::now(),
            end_time: Utc::now(),
            config: Config::default(),
            metrics: sampler.metrics(Duration::from_secs(1)),
            stats: Stats::default(),
        };
        let json = report.to_json_pretty().unwrap();
        for section in ["start_time", "end_time", "config", "metrics", "stats"] {
            assert!(json.contains(section), "missing section {section}");
        }
        assert!(json.contains("p99_us"));
    }
}
