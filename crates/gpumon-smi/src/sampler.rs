use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::{SmiError, SmiResult};
use crate::parse::{data_lines, parse_reading, Reading};
use crate::runner::CommandRunner;
use crate::slot::UnitSlot;

/// Flags selecting unit-annotated CSV without a header line.
const QUERY_FORMAT: [&str; 2] = ["-u", "--format=csv,noheader"];

/// Samples metrics and discovers GPUs through `nvidia-smi`.
///
/// Cheap to clone; every clone shares the same runner.
#[derive(Clone)]
pub struct Sampler {
    runner: Arc<dyn CommandRunner>,
}

impl Sampler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Arguments for one metric query, scoped to `unit` if given.
    pub fn query_args(metric: &str, unit: Option<u32>) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(index) = unit {
            args.push(format!("--id={}", index));
        }
        args.push(format!("--query-gpu={}", metric));
        args.extend(QUERY_FORMAT.iter().map(|s| s.to_string()));
        args
    }

    /// Sample `metric` for one GPU, or for every GPU when `unit` is `None`.
    pub async fn sample(&self, metric: &str, unit: Option<u32>) -> SmiResult<Reading> {
        let output = self.runner.run(&Self::query_args(metric, unit)).await?;
        parse_reading(&output)
    }

    pub async fn sample_slot(&self, metric: &str, slot: UnitSlot) -> SmiResult<Reading> {
        self.sample(metric, slot.selector()).await
    }

    /// Check that the tool is installed and can talk to the driver.
    pub async fn probe(&self) -> SmiResult<()> {
        self.runner.run(&["--list-gpus".to_string()]).await?;
        Ok(())
    }

    /// Number of GPUs on the host. Zero is an error, never a count.
    pub async fn unit_count(&self) -> SmiResult<NonZeroU32> {
        let mut args = vec!["--query-gpu=index".to_string()];
        args.extend(QUERY_FORMAT.iter().map(|s| s.to_string()));

        let output = self.runner.run(&args).await?;
        let count = data_lines(&output).len();
        u32::try_from(count)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or(SmiError::NoUnits)
    }

    /// PCI bus id of one GPU, e.g. `00000000:00:04.0`.
    pub async fn bus_id(&self, unit: u32) -> SmiResult<String> {
        let mut args = vec![
            "--query-gpu=pci.bus_id".to_string(),
            format!("--id={}", unit),
        ];
        args.extend(QUERY_FORMAT.iter().map(|s| s.to_string()));

        let output = self.runner.run(&args).await?;
        data_lines(&output)
            .first()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or(SmiError::EmptyResult)
    }

    /// Keep the driver loaded between queries (`-pm 1`).
    ///
    /// Without persistence mode every query re-initializes the driver, which
    /// briefly pins one GPU at 100% utilization.
    pub async fn enable_persistence_mode(&self) -> SmiResult<()> {
        self.runner
            .run(&["-pm".to_string(), "1".to_string()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;

    const FMT: [&str; 2] = ["-u", "--format=csv,noheader"];

    fn sampler(runner: ScriptedRunner) -> (Sampler, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (Sampler::new(runner.clone()), runner)
    }

    #[test]
    fn test_query_args() {
        assert_eq!(
            Sampler::query_args("memory.used", Some(1)),
            vec!["--id=1", "--query-gpu=memory.used", FMT[0], FMT[1]]
        );
        assert_eq!(
            Sampler::query_args("memory.used", None),
            vec!["--query-gpu=memory.used", FMT[0], FMT[1]]
        );
    }

    #[tokio::test]
    async fn test_sample_single_unit() {
        let (sampler, _) = sampler(
            ScriptedRunner::new().respond(["--id=0", "--query-gpu=utilization.gpu", FMT[0], FMT[1]], "10 %\n"),
        );
        let reading = sampler.sample("utilization.gpu", Some(0)).await.unwrap();
        assert_eq!(reading.value, 10);
        assert_eq!(reading.raw_unit, "%");
    }

    #[tokio::test]
    async fn test_sample_all_units_averages() {
        let (sampler, _) = sampler(
            ScriptedRunner::new().respond(["--query-gpu=memory.used", FMT[0], FMT[1]], "100 MiB\n301 MiB\n"),
        );
        let reading = sampler.sample_slot("memory.used", UnitSlot::Aggregate).await.unwrap();
        assert_eq!(reading.value, 200);
        assert_eq!(reading.raw_unit, "MiB");
    }

    #[tokio::test]
    async fn test_sample_empty_output() {
        let (sampler, _) =
            sampler(ScriptedRunner::new().respond(["--query-gpu=memory.used", FMT[0], FMT[1]], ""));
        let err = sampler.sample("memory.used", None).await.unwrap_err();
        assert!(matches!(err, SmiError::EmptyResult));
    }

    #[tokio::test]
    async fn test_sample_invocation_failure() {
        let (sampler, _) = sampler(ScriptedRunner::new());
        let err = sampler.sample("memory.used", Some(3)).await.unwrap_err();
        assert!(err.is_invocation_failure());
    }

    #[tokio::test]
    async fn test_unit_count() {
        let (sampler, _) = sampler(
            ScriptedRunner::new().respond(["--query-gpu=index", FMT[0], FMT[1]], "0\n1\n2\n3\n"),
        );
        assert_eq!(sampler.unit_count().await.unwrap().get(), 4);
    }

    #[tokio::test]
    async fn test_unit_count_zero_is_error() {
        let (sampler, _) =
            sampler(ScriptedRunner::new().respond(["--query-gpu=index", FMT[0], FMT[1]], ""));
        assert!(matches!(sampler.unit_count().await, Err(SmiError::NoUnits)));
    }

    #[tokio::test]
    async fn test_bus_id() {
        let (sampler, _) = sampler(ScriptedRunner::new().respond(
            ["--query-gpu=pci.bus_id", "--id=0", FMT[0], FMT[1]],
            "00000000:00:04.0\n",
        ));
        assert_eq!(sampler.bus_id(0).await.unwrap(), "00000000:00:04.0");
    }

    #[tokio::test]
    async fn test_probe_and_persistence_mode() {
        let (sampler, runner) = sampler(
            ScriptedRunner::new()
                .respond(["--list-gpus"], "GPU 0: Tesla T4 (UUID: GPU-1)\n")
                .respond(["-pm", "1"], "Enabled persistence mode for GPU 00000000:00:04.0.\n"),
        );
        sampler.probe().await.unwrap();
        sampler.enable_persistence_mode().await.unwrap();
        assert_eq!(runner.call_count(), 2);
    }
}
