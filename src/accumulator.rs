use chrono::{DateTime, DurationRound, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::collectors::{Fields, Metric, MetricKind, Tags};
use crate::error::ValidationError;

/// Downstream consumer of validated metrics.
///
/// Sinks are shared by every running collector, so `send` may be called from
/// many tasks at once.
pub trait MetricSink: Send + Sync {
    fn send(&self, metric: Metric);
}

/// Intake point collectors write their samples into.
pub trait Accumulator: Send {
    /// Validates one sample and hands the resulting metric downstream.
    fn emit_kind(
        &mut self,
        kind: MetricKind,
        name: &str,
        tags: Tags,
        fields: Fields,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ValidationError>;

    /// Records an error that does not end the collection cycle.
    fn report_error(&mut self, err: &dyn std::error::Error);

    fn emit(
        &mut self,
        name: &str,
        tags: Tags,
        fields: Fields,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ValidationError> {
        self.emit_kind(MetricKind::Untyped, name, tags, fields, timestamp)
    }

    fn emit_gauge(
        &mut self,
        name: &str,
        tags: Tags,
        fields: Fields,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ValidationError> {
        self.emit_kind(MetricKind::Gauge, name, tags, fields, timestamp)
    }

    fn emit_counter(
        &mut self,
        name: &str,
        tags: Tags,
        fields: Fields,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ValidationError> {
        self.emit_kind(MetricKind::Counter, name, tags, fields, timestamp)
    }
}

/// Measurement renaming rules applied to everything a collector emits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Naming {
    pub name_override: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
}

impl Naming {
    pub fn apply(&self, name: &str) -> String {
        let base = self.name_override.as_deref().unwrap_or(name);
        format!(
            "{}{}{}",
            self.name_prefix.as_deref().unwrap_or(""),
            base,
            self.name_suffix.as_deref().unwrap_or("")
        )
    }
}

/// Accumulator bound to one collection cycle of one collector.
///
/// Default tags are applied first, so a tag the collector sets itself wins
/// over a default with the same key.
pub struct MetricAccumulator<'a> {
    plugin: &'a str,
    default_tags: &'a Tags,
    naming: &'a Naming,
    precision: Option<Duration>,
    sink: &'a dyn MetricSink,
    emitted: usize,
    rejected: usize,
    errors: usize,
}

impl<'a> MetricAccumulator<'a> {
    pub fn new(
        plugin: &'a str,
        default_tags: &'a Tags,
        naming: &'a Naming,
        sink: &'a dyn MetricSink,
    ) -> Self {
        Self {
            plugin,
            default_tags,
            naming,
            precision: None,
            sink,
            emitted: 0,
            rejected: 0,
            errors: 0,
        }
    }

    /// Truncates every timestamp to a multiple of `precision`.
    pub fn with_precision(mut self, precision: Option<Duration>) -> Self {
        self.precision = precision.filter(|p| !p.is_zero());
        self
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    fn truncate(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let Some(precision) = self.precision else {
            return timestamp;
        };
        chrono::Duration::from_std(precision)
            .ok()
            .and_then(|p| timestamp.duration_trunc(p).ok())
            .unwrap_or(timestamp)
    }
}

impl Accumulator for MetricAccumulator<'_> {
    fn emit_kind(
        &mut self,
        kind: MetricKind,
        name: &str,
        tags: Tags,
        fields: Fields,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ValidationError> {
        let mut merged = self.default_tags.clone();
        merged.extend(tags);

        let timestamp = self.truncate(timestamp.unwrap_or_else(Utc::now));
        let name = if name.is_empty() {
            // renaming must not hide an empty measurement name
            String::new()
        } else {
            self.naming.apply(name)
        };

        match Metric::new(name, merged, fields, timestamp) {
            Ok(metric) => {
                self.sink.send(metric.with_kind(kind));
                self.emitted += 1;
                Ok(())
            }
            Err(e) => {
                self.rejected += 1;
                tracing::warn!(plugin = self.plugin, error = %e, "dropping invalid sample");
                Err(e)
            }
        }
    }

    fn report_error(&mut self, err: &dyn std::error::Error) {
        self.errors += 1;
        tracing::error!(plugin = self.plugin, error = %err, "collector reported an error");
    }
}

/// Keeps every metric in memory.
#[derive(Default)]
pub struct VecSink {
    metrics: Mutex<Vec<Metric>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything received so far, in arrival order.
    pub fn take(&self) -> Vec<Metric> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Metric>> {
        // a panic while holding the lock cannot leave the Vec half-written
        self.metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MetricSink for VecSink {
    fn send(&self, metric: Metric) {
        self.lock().push(metric);
    }
}

/// Forwards metrics into an unbounded channel, so emitting never waits on the
/// consumer.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Metric>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Metric>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Metric>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl MetricSink for ChannelSink {
    fn send(&self, metric: Metric) {
        if let Err(e) = self.tx.send(metric) {
            tracing::warn!(measurement = e.0.name(), "metric receiver closed, dropping metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::FieldValue;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_emit_produces_exact_metric() {
        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        acc.emit(
            "cpu",
            tags(&[("core", "0")]),
            fields(&[
                ("idle", 12.5.into()),
                ("ticks", 42.into()),
                ("online", true.into()),
                ("mode", "perf".into()),
            ]),
            Some(ts),
        )
        .unwrap();

        let metrics = sink.take();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.name(), "cpu");
        assert_eq!(m.tag("core"), Some("0"));
        assert_eq!(m.field("idle"), Some(&FieldValue::Float(12.5)));
        assert_eq!(m.field("ticks"), Some(&FieldValue::Integer(42)));
        assert_eq!(m.field("online"), Some(&FieldValue::Boolean(true)));
        assert_eq!(m.field("mode"), Some(&FieldValue::String("perf".to_string())));
        assert_eq!(m.timestamp(), ts);
        assert_eq!(m.kind(), MetricKind::Untyped);
        assert_eq!(acc.emitted(), 1);
    }

    #[test]
    fn test_empty_fields_rejected_without_output() {
        let sink = VecSink::new();
        let defaults = tags(&[("host", "h")]);
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        let err = acc.emit("cpu", Tags::new(), Fields::new(), None).unwrap_err();
        assert!(matches!(err, ValidationError::NoFields { .. }));
        assert!(sink.is_empty());
        assert_eq!(acc.rejected(), 1);
    }

    #[test]
    fn test_failed_emit_does_not_block_later_emits() {
        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        assert!(acc.emit("a", Tags::new(), fields(&[("v", 1.into())]), None).is_ok());
        let err = acc
            .emit("b", Tags::new(), fields(&[("v", f64::INFINITY.into())]), None)
            .unwrap_err();
        assert_eq!(err.key(), Some("v"));
        assert!(acc.emit("", Tags::new(), fields(&[("v", 1.into())]), None).is_err());
        assert!(acc.emit("c", Tags::new(), fields(&[("v", 2.into())]), None).is_ok());

        let names: Vec<_> = sink.take().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(acc.emitted(), 2);
        assert_eq!(acc.rejected(), 2);
    }

    #[test]
    fn test_collector_tags_override_defaults() {
        let sink = VecSink::new();
        let defaults = tags(&[("host", "agent"), ("program", "static"), ("dc", "eu")]);
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        acc.emit(
            "supervisor",
            tags(&[("program", "worker-a")]),
            fields(&[("pid", 1.into())]),
            None,
        )
        .unwrap();

        let metric = &sink.take()[0];
        assert_eq!(metric.tag("program"), Some("worker-a"));
        assert_eq!(metric.tag("host"), Some("agent"));
        assert_eq!(metric.tag("dc"), Some("eu"));
    }

    #[test]
    fn test_missing_timestamp_uses_collection_time() {
        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        let before = Utc::now();
        acc.emit("m", Tags::new(), fields(&[("v", 1.into())]), None)
            .unwrap();
        let after = Utc::now();

        let ts = sink.take()[0].timestamp();
        assert!(ts >= before && ts <= after);
    }

    #[test]
    fn test_precision_and_naming() {
        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming {
            name_override: Some("procs".to_string()),
            name_prefix: Some("sv_".to_string()),
            name_suffix: None,
        };
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink)
            .with_precision(Some(Duration::from_secs(1)));

        let ts = Utc.timestamp_opt(1_000, 999_000_000).unwrap();
        acc.emit_gauge("supervisor", Tags::new(), fields(&[("v", 1.into())]), Some(ts))
            .unwrap();

        let metric = &sink.take()[0];
        assert_eq!(metric.name(), "sv_procs");
        assert_eq!(metric.timestamp(), Utc.timestamp_opt(1_000, 0).unwrap());
        assert_eq!(metric.kind(), MetricKind::Gauge);
    }

    #[test]
    fn test_report_error_is_counted() {
        let sink = VecSink::new();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        let err = std::io::Error::new(std::io::ErrorKind::Other, "partial read");
        acc.report_error(&err);
        assert_eq!(acc.errors(), 1);
        assert!(sink.is_empty());
    }

    async fn produce(sink: &dyn MetricSink, producer: usize, count: i64) {
        let id = producer.to_string();
        let defaults = tags(&[("producer", id.as_str())]);
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, sink);
        for i in 0..count {
            acc.emit("seq", Tags::new(), fields(&[("i", FieldValue::from(i))]), None)
                .unwrap();
            if i % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    fn per_producer(metrics: &[Metric], producers: usize) -> Vec<Vec<i64>> {
        let mut seen = vec![Vec::new(); producers];
        for metric in metrics {
            let producer: usize = metric.tag("producer").unwrap().parse().unwrap();
            seen[producer].push(metric.field("i").and_then(FieldValue::as_i64).unwrap());
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_vec_sink_concurrent_producers() {
        const PRODUCERS: usize = 8;
        const COUNT: i64 = 1000;
        let sink = Arc::new(VecSink::new());

        let mut tasks = tokio::task::JoinSet::new();
        for producer in 0..PRODUCERS {
            let sink = Arc::clone(&sink);
            tasks.spawn(async move { produce(sink.as_ref(), producer, COUNT).await });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        let metrics = sink.take();
        assert_eq!(metrics.len(), PRODUCERS * COUNT as usize);
        let expected: Vec<i64> = (0..COUNT).collect();
        for seen in per_producer(&metrics, PRODUCERS) {
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_channel_sink_concurrent_producers() {
        const PRODUCERS: usize = 4;
        const COUNT: i64 = 500;
        let (sink, mut rx) = ChannelSink::channel();

        let mut tasks = tokio::task::JoinSet::new();
        for producer in 0..PRODUCERS {
            let sink = sink.clone();
            tasks.spawn(async move { produce(&sink, producer, COUNT).await });
        }
        drop(sink);
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        let mut metrics = Vec::new();
        while let Some(metric) = rx.recv().await {
            metrics.push(metric);
        }
        assert_eq!(metrics.len(), PRODUCERS * COUNT as usize);
        let expected: Vec<i64> = (0..COUNT).collect();
        for seen in per_producer(&metrics, PRODUCERS) {
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::channel();
        let defaults = Tags::new();
        let naming = Naming::default();
        let mut acc = MetricAccumulator::new("test", &defaults, &naming, &sink);

        for i in 0..5 {
            acc.emit("seq", Tags::new(), fields(&[("i", FieldValue::from(i))]), None)
                .unwrap();
        }
        drop(acc);
        drop(sink);

        let mut seen = Vec::new();
        while let Some(metric) = rx.recv().await {
            seen.push(metric.field("i").and_then(FieldValue::as_i64).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
