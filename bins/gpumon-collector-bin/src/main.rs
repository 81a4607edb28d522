use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use gpumon_app::{shutdown_channel, BuildInfo};
use gpumon_collector::{parse_bool, CollectorConfig, ConfigOverrides};
use gpumon_logging::init_logging;

/// Publishes nvidia-smi GPU metrics to Cloud Monitoring.
///
/// Flags override `GGM_*` environment variables, which override the
/// config file.
#[derive(Parser, Debug)]
#[command(name = "gpumon-collector", about, disable_version_flag = true)]
struct Args {
    /// Seconds between two collections [env: GGM_METRICS_INTERVAL]
    #[arg(long, value_name = "SECONDS")]
    metrics_interval: Option<u64>,

    /// JSON file with an OAuth2 access_token [env: GGM_SERVICE_ACCOUNT_PATH]
    #[arg(long, value_name = "PATH")]
    service_account_path: Option<PathBuf>,

    /// Enable nvidia-smi persistence mode [env: GGM_ENABLE_NVIDIASMI_PM]
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = parse_bool_arg
    )]
    enable_nvidiasmi_pm: Option<bool>,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log descriptors and points instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Also write rolling log files to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Print version and exit
    #[arg(short = 'V', long)]
    version: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            interval_secs: self.metrics_interval,
            service_account_path: self.service_account_path.clone(),
            enable_persistence_mode: self.enable_nvidiasmi_pm,
            dry_run: self.dry_run,
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            json_logs: self.json_logs,
        }
    }
}

fn parse_bool_arg(value: &str) -> Result<bool, String> {
    parse_bool(value).ok_or_else(|| format!("invalid boolean: {:?}", value))
}

fn build_info() -> BuildInfo {
    BuildInfo::new("gpumon-collector", env!("CARGO_PKG_VERSION"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if args.version {
        println!("{}", build_info());
        return ExitCode::SUCCESS;
    }

    if args.dump_default_config {
        return match CollectorConfig::default().to_toml() {
            Ok(toml) => {
                print!("{}", toml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("gpumon-collector: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let (config, rejections) = match CollectorConfig::resolve(
        args.config.as_deref(),
        |key| std::env::var(key).ok(),
        &args.overrides(),
    ) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("gpumon-collector: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("gpumon-collector: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for rejection in &rejections {
        tracing::warn!(
            source = %rejection.source,
            value = %rejection.value,
            reason = %rejection.reason,
            "Ignoring configuration value"
        );
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "gpumon-collector failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: CollectorConfig) -> anyhow::Result<()> {
    tracing::info!(
        build = %build_info(),
        interval = ?config.interval(),
        per_unit_labels = config.per_unit_labels,
        dry_run = config.dry_run,
        "Starting gpumon collector"
    );

    let (trigger, shutdown) = shutdown_channel();
    let _signals = trigger.trigger_on_signal();

    gpumon_collector::run(config, shutdown)
        .await
        .context("startup failed")?;

    tracing::info!("gpumon collector stopped");
    Ok(())
}
