use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::types::{apply_overrides, Collector, Fields, RawConfig, Tags};
use crate::accumulator::Accumulator;
use crate::error::{CollectionError, ConfigError};

pub const MEASUREMENT: &str = "system";
pub const DEFAULT_PATH: &str = "/proc/loadavg";

const SAMPLE_CONFIG: &str = r#"
  ## file in /proc/loadavg format
  # path = "/proc/loadavg"
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadAvgConfig {
    pub path: PathBuf,
}

impl Default for LoadAvgConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PATH),
        }
    }
}

/// Parsed contents of a loadavg file, e.g. `0.52 0.58 0.59 1/467 12345`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadAvg {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub n_running: i64,
    pub n_total: i64,
}

impl LoadAvg {
    pub fn parse(contents: &str) -> Result<Self, CollectionError> {
        let bad = || CollectionError::Protocol(format!("unexpected loadavg contents {contents:?}"));

        let mut parts = contents.split_whitespace();
        let mut load = || -> Result<f64, CollectionError> {
            parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)
        };
        let (load1, load5, load15) = (load()?, load()?, load()?);

        let (running, total) = parts
            .next()
            .and_then(|p| p.split_once('/'))
            .ok_or_else(bad)?;

        Ok(Self {
            load1,
            load5,
            load15,
            n_running: running.parse().map_err(|_| bad())?,
            n_total: total.parse().map_err(|_| bad())?,
        })
    }

    pub fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("load1".to_string(), self.load1.into());
        fields.insert("load5".to_string(), self.load5.into());
        fields.insert("load15".to_string(), self.load15.into());
        fields.insert("n_running".to_string(), self.n_running.into());
        fields.insert("n_total".to_string(), self.n_total.into());
        fields
    }
}

/// Reads system load averages from a file.
#[derive(Default)]
pub struct LoadAvgCollector {
    config: LoadAvgConfig,
}

impl LoadAvgCollector {
    pub fn new(config: LoadAvgConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Collector for LoadAvgCollector {
    fn describe(&self) -> &'static str {
        "Read system load averages"
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn configure(&mut self, options: &RawConfig) -> Result<(), ConfigError> {
        self.config = apply_overrides(&self.config, options)?;
        Ok(())
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> Result<(), CollectionError> {
        let contents = tokio::fs::read_to_string(&self.config.path).await?;
        let load = LoadAvg::parse(&contents)?;
        if let Err(e) = acc.emit_gauge(MEASUREMENT, Tags::new(), load.fields(), None) {
            acc.report_error(&e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{MetricAccumulator, Naming, VecSink};
    use crate::collectors::{FieldValue, MetricKind};
    use std::io::Write;

    #[test]
    fn test_parse_loadavg() {
        let load = LoadAvg::parse("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!(load.load1, 0.52);
        assert_eq!(load.load15, 0.59);
        assert_eq!(load.n_running, 1);
        assert_eq!(load.n_total, 467);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LoadAvg::parse("").is_err());
        assert!(LoadAvg::parse("0.1 0.2").is_err());
        assert!(LoadAvg::parse("0.1 0.2 0.3 17").is_err());
        assert!(LoadAvg::parse("a b c 1/2").is_err());
    }

    #[tokio::test]
    async fn test_collect_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.00 2.00 3.00 4/500 999").unwrap();

        let mut collector = LoadAvgCollector::default();
        let mut options = RawConfig::new();
        options.insert(
            "path".to_string(),
            serde_json::json!(file.path().to_str().unwrap()),
        );
        collector.configure(&options).unwrap();

        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("loadavg", &defaults, &naming, &sink);
        collector.collect(&mut acc).await.unwrap();

        let metrics = sink.take();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name(), MEASUREMENT);
        assert_eq!(metrics[0].kind(), MetricKind::Gauge);
        assert_eq!(metrics[0].field("load5"), Some(&FieldValue::Float(2.0)));
        assert_eq!(metrics[0].field("n_total"), Some(&FieldValue::Integer(500)));
    }

    #[tokio::test]
    async fn test_missing_file_is_collection_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = LoadAvgCollector::new(LoadAvgConfig {
            path: dir.path().join("absent"),
        });

        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("loadavg", &defaults, &naming, &sink);
        let err = collector.collect(&mut acc).await.unwrap_err();
        assert!(matches!(err, CollectionError::Io(_)));
        assert!(sink.is_empty());
    }
}
