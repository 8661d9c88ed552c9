use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::accumulator::{MetricAccumulator, MetricSink, Naming};
use crate::collectors::{Collector, Tags};
use crate::error::CollectionError;

/// Per-input settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct InputSettings {
    /// Identity used in logs, normally the plugin type name.
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub naming: Naming,
    pub precision: Option<Duration>,
    /// Tags stamped on every metric; collector tags with the same key win.
    pub tags: Tags,
}

impl InputSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            naming: Naming::default(),
            precision: None,
            tags: Tags::new(),
        }
    }
}

/// Counters kept across collection cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub cycles: u64,
    pub failures: u64,
    pub metrics_gathered: u64,
    pub samples_rejected: u64,
    pub last_duration: Duration,
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub emitted: usize,
    pub rejected: usize,
    pub elapsed: Duration,
}

/// Owns one collector and everything needed to invoke it on behalf of a
/// scheduler.
pub struct RunningCollector {
    settings: InputSettings,
    collector: Box<dyn Collector>,
    stats: CollectStats,
}

impl RunningCollector {
    pub fn new(collector: Box<dyn Collector>, settings: InputSettings) -> Self {
        Self {
            settings,
            collector,
            stats: CollectStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn describe(&self) -> &'static str {
        self.collector.describe()
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    pub fn settings(&self) -> &InputSettings {
        &self.settings
    }

    pub fn stats(&self) -> &CollectStats {
        &self.stats
    }

    pub async fn start(&mut self) -> Result<(), CollectionError> {
        self.collector.start().await
    }

    pub async fn stop(&mut self) {
        self.collector.stop().await;
    }

    /// Runs exactly one collection attempt.
    ///
    /// Cancellation and the input timeout both end the attempt with an error;
    /// metrics emitted before that point have already reached `sink`.
    pub async fn invoke(
        &mut self,
        sink: &dyn MetricSink,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CollectionError> {
        let started = Instant::now();
        let timeout = self.settings.timeout;

        let mut acc = MetricAccumulator::new(
            &self.settings.name,
            &self.settings.tags,
            &self.settings.naming,
            sink,
        )
        .with_precision(self.settings.precision);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectionError::Cancelled),
            res = tokio::time::timeout(timeout, self.collector.collect(&mut acc)) => {
                res.unwrap_or(Err(CollectionError::Timeout(timeout)))
            }
        };

        let report = CycleReport {
            emitted: acc.emitted(),
            rejected: acc.rejected(),
            elapsed: started.elapsed(),
        };

        self.stats.cycles += 1;
        self.stats.metrics_gathered += report.emitted as u64;
        self.stats.samples_rejected += report.rejected as u64;
        self.stats.last_duration = report.elapsed;

        match result {
            Ok(()) => {
                tracing::debug!(
                    input = %self.settings.name,
                    emitted = report.emitted,
                    rejected = report.rejected,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "collection cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{Accumulator, VecSink};
    use crate::collectors::{FieldValue, Fields};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Emits `count` samples, optionally sleeping in between.
    #[derive(Default)]
    struct Counting {
        count: usize,
        pause: Option<Duration>,
        lifecycle: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Collector for Counting {
        fn describe(&self) -> &'static str {
            "counting test collector"
        }

        async fn start(&mut self) -> Result<(), CollectionError> {
            self.lifecycle.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn collect(&mut self, acc: &mut dyn Accumulator) -> Result<(), CollectionError> {
            for i in 0..self.count {
                let mut tags = Tags::new();
                tags.insert("source".to_string(), "plugin".to_string());
                let mut fields = Fields::new();
                fields.insert("i".to_string(), FieldValue::from(i as i64));
                acc.emit("counting", tags, fields, None)
                    .map_err(|e| CollectionError::Protocol(e.to_string()))?;
                if let Some(pause) = self.pause {
                    tokio::time::sleep(pause).await;
                }
            }
            Ok(())
        }

        async fn stop(&mut self) {
            self.lifecycle.fetch_add(10, Ordering::SeqCst);
        }
    }

    fn settings(tags: &[(&str, &str)]) -> InputSettings {
        let mut settings = InputSettings::new("counting");
        settings.timeout = Duration::from_secs(5);
        settings.tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        settings
    }

    #[tokio::test]
    async fn test_invoke_applies_static_tags() {
        let collector = Counting {
            count: 2,
            ..Default::default()
        };
        let mut running = RunningCollector::new(
            Box::new(collector),
            settings(&[("host", "agent-1"), ("source", "static"), ("env", "prod")]),
        );
        let sink = VecSink::new();

        let report = running
            .invoke(&sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.emitted, 2);

        let metrics = sink.take();
        assert_eq!(metrics.len(), 2);
        for metric in &metrics {
            assert_eq!(metric.tag("host"), Some("agent-1"));
            assert_eq!(metric.tag("env"), Some("prod"));
            assert_eq!(metric.tag("source"), Some("plugin"));
        }
        assert_eq!(running.stats().cycles, 1);
        assert_eq!(running.stats().metrics_gathered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_earlier_metrics() {
        let collector = Counting {
            count: 10,
            pause: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let mut settings = settings(&[]);
        settings.timeout = Duration::from_millis(2500);
        let mut running = RunningCollector::new(Box::new(collector), settings);
        let sink = VecSink::new();

        let err = running
            .invoke(&sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Timeout(_)));
        assert_eq!(sink.len(), 3);
        assert_eq!(running.stats().failures, 1);
        assert_eq!(running.stats().metrics_gathered, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let collector = Counting {
            count: 1,
            ..Default::default()
        };
        let mut running = RunningCollector::new(Box::new(collector), settings(&[]));
        let sink = VecSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = running.invoke(&sink, &cancel).await.unwrap_err();
        assert!(matches!(err, CollectionError::Cancelled));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_hooks() {
        let lifecycle = Arc::new(AtomicUsize::new(0));
        let collector = Counting {
            lifecycle: Arc::clone(&lifecycle),
            ..Default::default()
        };
        let mut running = RunningCollector::new(Box::new(collector), settings(&[]));
        assert_eq!(running.describe(), "counting test collector");

        running.start().await.unwrap();
        assert_eq!(lifecycle.load(Ordering::SeqCst), 1);
        running.stop().await;
        assert_eq!(lifecycle.load(Ordering::SeqCst), 11);
    }
}
