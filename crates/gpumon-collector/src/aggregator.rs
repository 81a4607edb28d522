//! Per-metric fan-out over GPU slots.
//!
//! For a host with `U` GPUs one metric is sampled `U + 1` times per tick:
//! once per GPU (`--id=<n>`) and once across all of them, which
//! `nvidia-smi` answers with one line per GPU that the parser averages.
//! Each slot runs as its own task and reports to the [`SampleSink`] on
//! its own; a failing slot never holds back its siblings.

use std::num::NonZeroU32;
use std::sync::Arc;

use gpumon_smi::{Sampler, UnitSlot};
use tokio::task::JoinSet;

use crate::catalog::MetricDefinition;
use crate::publisher::SampleSink;

/// Result of sampling one slot. `value` is `None` when sampling failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOutcome {
    pub metric: String,
    pub slot: UnitSlot,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricReport {
    pub dispatched: usize,
    pub sampled: usize,
    pub failed: usize,
}

impl MetricReport {
    pub fn record(&mut self, outcome: &SlotOutcome) {
        match outcome.value {
            Some(_) => self.sampled += 1,
            None => self.failed += 1,
        }
    }
}

#[derive(Clone)]
pub struct Aggregator {
    sampler: Sampler,
    sink: Arc<dyn SampleSink>,
    unit_count: NonZeroU32,
    per_unit: bool,
}

impl Aggregator {
    pub fn new(
        sampler: Sampler,
        sink: Arc<dyn SampleSink>,
        unit_count: NonZeroU32,
        per_unit: bool,
    ) -> Self {
        Self {
            sampler,
            sink,
            unit_count,
            per_unit,
        }
    }

    pub fn unit_count(&self) -> NonZeroU32 {
        self.unit_count
    }

    /// Slots sampled for every metric: each GPU then the aggregate, or the
    /// aggregate alone when per-unit labels are off.
    pub fn slots(&self) -> Vec<UnitSlot> {
        if self.per_unit {
            UnitSlot::all(self.unit_count).collect()
        } else {
            vec![UnitSlot::Aggregate]
        }
    }

    /// Spawn one task per slot for `def` into `tasks`. Returns how many.
    pub fn spawn_metric(
        &self,
        def: &Arc<MetricDefinition>,
        tasks: &mut JoinSet<SlotOutcome>,
    ) -> usize {
        let slots = self.slots();
        for &slot in &slots {
            let sampler = self.sampler.clone();
            let sink = self.sink.clone();
            let def = def.clone();
            tasks.spawn(async move { sample_slot(&sampler, sink.as_ref(), &def, slot).await });
        }
        slots.len()
    }
}

async fn sample_slot(
    sampler: &Sampler,
    sink: &dyn SampleSink,
    def: &MetricDefinition,
    slot: UnitSlot,
) -> SlotOutcome {
    let value = match sampler.sample_slot(&def.name, slot).await {
        Ok(reading) => {
            tracing::trace!(metric = %def.name, slot = %slot, value = reading.value, unit = %reading.raw_unit, "Sampled");
            sink.accept(def, slot, reading.value).await;
            Some(reading.value)
        }
        Err(e) => {
            tracing::warn!(metric = %def.name, slot = %slot, error = %e, "Failed to sample");
            None
        }
    };

    SlotOutcome {
        metric: def.name.clone(),
        slot,
        value,
    }
}
