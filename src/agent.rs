//! Drives a set of running collectors: one task per input, plus a writer task
//! that batches their output into storage.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{ChannelSink, MetricSink, Naming};
use crate::collectors::{host, Metric, Tags};
use crate::config::AgentConfig;
use crate::error::{CollectionError, RegistryError};
use crate::registry::Registry;
use crate::running::{InputSettings, RunningCollector};
use crate::storage::Storage;

/// Instantiates every configured input.
///
/// Fails on the first input that can never run, before anything is scheduled.
pub fn build_inputs(registry: &Registry, config: &AgentConfig) -> Result<Vec<RunningCollector>, RegistryError> {
    let host = if config.agent.omit_hostname {
        None
    } else {
        Some(
            config
                .agent
                .hostname
                .clone()
                .unwrap_or_else(host::local_hostname),
        )
    };

    let mut inputs = Vec::with_capacity(config.inputs.len());
    for input in &config.inputs {
        let collector = registry.create(&input.type_name, &input.options)?;

        let mut tags = Tags::new();
        if let Some(host) = &host {
            tags.insert("host".to_string(), host.clone());
        }
        tags.extend(config.agent.tags.clone());
        tags.extend(input.tags.clone());

        let interval = input
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.agent.interval());
        let timeout = input
            .timeout_secs
            .or(config.agent.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(interval);

        let settings = InputSettings {
            name: input.type_name.clone(),
            interval,
            timeout,
            naming: Naming {
                name_override: input.name_override.clone(),
                name_prefix: input.name_prefix.clone(),
                name_suffix: input.name_suffix.clone(),
            },
            precision: input.precision_secs.map(Duration::from_secs),
            tags,
        };
        inputs.push(RunningCollector::new(collector, settings));
    }

    Ok(inputs)
}

/// Runs every input exactly once, one after another. Returns the number of
/// inputs whose cycle failed.
pub async fn gather_once(
    inputs: &mut [RunningCollector],
    sink: &dyn MetricSink,
    cancel: &CancellationToken,
) -> usize {
    let mut failures = 0;
    for input in inputs.iter_mut() {
        if let Err(e) = input.start().await {
            error!(input = %input.name(), error = %e, "failed to start input");
            failures += 1;
            continue;
        }
        if let Err(e) = input.invoke(sink, cancel).await {
            warn!(input = %input.name(), error = %e, "collection failed");
            failures += 1;
        }
        input.stop().await;
    }
    failures
}

/// Schedules every input until `shutdown` fires, then stops them and flushes
/// whatever is still pending.
pub async fn run(
    inputs: Vec<RunningCollector>,
    storage: Arc<dyn Storage>,
    flush_interval: Duration,
    shutdown: CancellationToken,
) {
    let (sink, rx) = ChannelSink::channel();
    let writer = tokio::spawn(write_metrics(rx, storage, flush_interval));

    info!(inputs = inputs.len(), "starting collection");
    let mut tasks = JoinSet::new();
    for input in inputs {
        tasks.spawn(run_input(input, sink.clone(), shutdown.clone()));
    }
    // the writer finishes once every input has dropped its sender
    drop(sink);

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "input task failed");
        }
    }

    match writer.await {
        Ok(stored) => info!(stored, "collection stopped"),
        Err(e) => error!(error = %e, "writer task failed"),
    }
}

async fn run_input(mut input: RunningCollector, sink: ChannelSink, shutdown: CancellationToken) {
    if let Err(e) = input.start().await {
        error!(input = %input.name(), error = %e, "failed to start input");
        return;
    }

    let mut tick = tokio::time::interval(input.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        match input.invoke(&sink, &shutdown).await {
            Ok(_) => {}
            Err(CollectionError::Cancelled) => break,
            Err(e) => warn!(input = %input.name(), error = %e, "collection failed"),
        }
    }

    input.stop().await;
    let stats = input.stats();
    info!(
        input = %input.name(),
        cycles = stats.cycles,
        failures = stats.failures,
        metrics = stats.metrics_gathered,
        "input stopped"
    );
}

async fn write_metrics(
    mut rx: mpsc::UnboundedReceiver<Metric>,
    storage: Arc<dyn Storage>,
    flush_interval: Duration,
) -> usize {
    let mut pending = Vec::new();
    let mut stored = 0;
    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    tick.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(metric) => pending.push(metric),
                None => break,
            },
            _ = tick.tick() => {
                stored += flush(storage.as_ref(), &mut pending);
            }
        }
    }

    stored + flush(storage.as_ref(), &mut pending)
}

fn flush(storage: &dyn Storage, pending: &mut Vec<Metric>) -> usize {
    if pending.is_empty() {
        return 0;
    }

    let batch = std::mem::take(pending);
    let count = batch.len();
    match storage.store_metrics(batch) {
        Ok(round) => {
            debug!(round = %round.id, count, "stored metrics");
            count
        }
        Err(e) => {
            error!(error = %e, count, "failed to store metrics");
            0
        }
    }
}
