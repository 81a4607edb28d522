//! The collection loop.
//!
//! Every interval all catalog metrics are fanned out over their slots in
//! one [`JoinSet`]. The set is joined before the next tick starts, bounded
//! by the tick timeout; whatever is still running then is aborted, which
//! also kills its `nvidia-smi` child.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gpumon_app::Shutdown;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::{Aggregator, MetricReport};
use crate::catalog::MetricDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub tick_timeout: Duration,
    /// How long an in-flight tick may keep running after shutdown.
    pub shutdown_grace: Duration,
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub sampled: usize,
    pub failed: usize,
    /// Tasks still running at the deadline.
    pub aborted: usize,
}

impl TickReport {
    fn add(&mut self, metric: MetricReport) {
        self.dispatched += metric.dispatched;
        self.sampled += metric.sampled;
        self.failed += metric.failed;
    }
}

pub struct Scheduler {
    aggregator: Aggregator,
    catalog: Vec<Arc<MetricDefinition>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        aggregator: Aggregator,
        catalog: impl IntoIterator<Item = MetricDefinition>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            aggregator,
            catalog: catalog.into_iter().map(Arc::new).collect(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one tick to completion or to the tick timeout.
    pub async fn run_tick(&self) -> TickReport {
        self.tick(None).await
    }

    /// Tick every interval until `shutdown` fires. Returns the number of
    /// ticks run.
    pub async fn run(&self, mut shutdown: Shutdown) -> u64 {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        tracing::info!(
            interval = ?self.config.interval,
            metrics = self.catalog.len(),
            units = self.aggregator.unit_count().get(),
            "Collection started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            let report = self.tick(Some(&mut shutdown)).await;
            ticks += 1;

            tracing::info!(
                tick = ticks,
                dispatched = report.dispatched,
                sampled = report.sampled,
                failed = report.failed,
                aborted = report.aborted,
                elapsed = ?started.elapsed(),
                "Tick complete"
            );

            if shutdown.is_triggered() {
                break;
            }
        }

        tracing::info!(ticks, "Collection stopped");
        ticks
    }

    async fn tick(&self, mut shutdown: Option<&mut Shutdown>) -> TickReport {
        let mut tasks = JoinSet::new();
        let mut report = TickReport::default();
        let mut per_metric = HashMap::with_capacity(self.catalog.len());

        for def in &self.catalog {
            let dispatched = self.aggregator.spawn_metric(def, &mut tasks);
            per_metric.insert(
                def.name.clone(),
                MetricReport {
                    dispatched,
                    ..Default::default()
                },
            );
        }

        let tick_deadline = Instant::now() + self.config.tick_timeout;
        let deadline = tokio::time::sleep_until(tick_deadline);
        tokio::pin!(deadline);
        let mut draining = false;

        loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        if let Some(metric) = per_metric.get_mut(&outcome.metric) {
                            metric.record(&outcome);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Sampling task failed");
                        report.failed += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    report.aborted = tasks.len();
                    if draining {
                        tracing::warn!(aborted = report.aborted, "Shutdown grace period elapsed, aborting tick");
                    } else {
                        tracing::warn!(aborted = report.aborted, timeout = ?self.config.tick_timeout, "Tick timed out, aborting stragglers");
                    }
                    tasks.shutdown().await;
                    break;
                }
                _ = wait_for(&mut shutdown), if !draining => {
                    draining = true;
                    let grace = Instant::now() + self.config.shutdown_grace;
                    if grace < tick_deadline {
                        deadline.as_mut().reset(grace);
                    }
                    tracing::info!(in_flight = tasks.len(), "Draining in-flight tick");
                }
            }
        }

        for (name, metric) in per_metric {
            if metric.failed > 0 {
                tracing::debug!(metric = %name, failed = metric.failed, dispatched = metric.dispatched, "Metric had failed slots");
            }
            report.add(metric);
        }
        report
    }
}

async fn wait_for(shutdown: &mut Option<&mut Shutdown>) {
    match shutdown {
        Some(shutdown) => shutdown.wait().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::RecordingSink;
    use gpumon_app::shutdown_channel;
    use gpumon_smi::{Sampler, ScriptedRunner, UnitSlot};
    use std::num::NonZeroU32;

    fn config(interval: Duration, tick_timeout: Duration) -> SchedulerConfig {
        SchedulerConfig {
            interval,
            tick_timeout,
            shutdown_grace: Duration::from_millis(50),
        }
    }

    fn scheduler(
        runner: ScriptedRunner,
        sink: Arc<RecordingSink>,
        units: u32,
        catalog: Vec<MetricDefinition>,
        config: SchedulerConfig,
    ) -> Scheduler {
        let aggregator = Aggregator::new(
            Sampler::new(Arc::new(runner)),
            sink,
            NonZeroU32::new(units).unwrap(),
            true,
        );
        Scheduler::new(aggregator, catalog, config)
    }

    fn two_metric_runner() -> ScriptedRunner {
        let mut runner = ScriptedRunner::new();
        for (metric, values) in [("memory.used", ["100 MiB", "300 MiB"]), ("memory.free", ["7 MiB", "9 MiB"])] {
            runner = runner
                .respond(Sampler::query_args(metric, Some(0)), format!("{}\n", values[0]))
                .respond(Sampler::query_args(metric, Some(1)), format!("{}\n", values[1]))
                .respond(
                    Sampler::query_args(metric, None),
                    format!("{}\n{}\n", values[0], values[1]),
                );
        }
        runner
    }

    fn memory_catalog() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::gauge("memory.used", "GPU memory used", "MiBy"),
            MetricDefinition::gauge("memory.free", "GPU memory free", "MiBy"),
        ]
    }

    #[tokio::test]
    async fn test_tick_dispatches_units_plus_one_per_metric() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(
            two_metric_runner(),
            sink.clone(),
            2,
            memory_catalog(),
            config(Duration::from_secs(10), Duration::from_secs(10)),
        );

        let report = scheduler.run_tick().await;

        assert_eq!(
            report,
            TickReport {
                dispatched: 6,
                sampled: 6,
                failed: 0,
                aborted: 0
            }
        );
        let points = sink.sorted();
        assert_eq!(points.len(), 6);
        assert!(points.contains(&("memory.used".to_string(), UnitSlot::Aggregate, 200)));
        assert!(points.contains(&("memory.free".to_string(), UnitSlot::Aggregate, 8)));
    }

    #[tokio::test]
    async fn test_stragglers_are_aborted() {
        let runner = two_metric_runner().delay(
            Sampler::query_args("memory.used", Some(1)),
            Duration::from_secs(30),
        );
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(
            runner,
            sink.clone(),
            2,
            memory_catalog(),
            config(Duration::from_secs(10), Duration::from_millis(200)),
        );

        let started = std::time::Instant::now();
        let report = scheduler.run_tick().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.dispatched, 6);
        assert_eq!(report.sampled, 5);
        assert_eq!(report.aborted, 1);
        assert!(!sink
            .sorted()
            .contains(&("memory.used".to_string(), UnitSlot::Unit(1), 300)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Arc::new(scheduler(
            two_metric_runner(),
            sink.clone(),
            2,
            memory_catalog(),
            config(Duration::from_millis(20), Duration::from_millis(20)),
        ));
        let (trigger, shutdown) = shutdown_channel();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.trigger();

        let ticks = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ticks >= 2, "ran {ticks} ticks");
        assert!(sink.points.lock().len() >= 12);
    }

    #[tokio::test]
    async fn test_shutdown_grace_bounds_in_flight_tick() {
        let runner = two_metric_runner().delay(
            Sampler::query_args("memory.free", None),
            Duration::from_secs(30),
        );
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Arc::new(scheduler(
            runner,
            sink,
            2,
            memory_catalog(),
            config(Duration::from_secs(60), Duration::from_secs(60)),
        ));
        let (trigger, shutdown) = shutdown_channel();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(shutdown).await }
        });
        // The first tick fires immediately and blocks on the slow slot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();

        let ticks = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticks, 1);
    }
}
