use serde::Serialize;
use std::fmt;
use std::io;
use tokio::sync::watch;

/// Version information reported by `--version` and the startup log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub commit: Option<&'static str>,
}

impl BuildInfo {
    /// `GPUMON_COMMIT` is read at compile time when the build sets it.
    pub fn new(name: &'static str, version: &'static str) -> Self {
        Self {
            name,
            version,
            commit: option_env!("GPUMON_COMMIT"),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)?;
        if let Some(commit) = self.commit {
            write!(f, " ({})", commit)?;
        }
        Ok(())
    }
}

/// Wait for a shutdown signal (CTRL+C or SIGTERM).
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("Received CTRL+C");
            }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received CTRL+C");
    }
    Ok(())
}

/// Sending half of a shutdown channel.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half of a shutdown channel. Cloning is cheap; every clone sees
/// the same trigger.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    /// Trigger once a process signal arrives. If handlers cannot be
    /// installed the error is logged and shutdown is triggered right away.
    pub fn trigger_on_signal(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
            self.trigger();
        })
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is triggered, or when every trigger is gone.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_info_display() {
        let info = BuildInfo {
            name: "gpumon-collector",
            version: "0.1.0",
            commit: None,
        };
        assert_eq!(info.to_string(), "gpumon-collector 0.1.0");

        let info = BuildInfo {
            commit: Some("3f2a9c1"),
            ..info
        };
        assert_eq!(info.to_string(), "gpumon-collector 0.1.0 (3f2a9c1)");
    }

    #[test]
    fn test_build_info_serializes() {
        let info = BuildInfo::new("gpumon-collector", "0.1.0");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "gpumon-collector");
        assert_eq!(json["version"], "0.1.0");
    }

    #[tokio::test]
    async fn test_shutdown_trigger() {
        let (trigger, mut shutdown) = shutdown_channel();
        let observer = shutdown.clone();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(async move {
            shutdown.wait().await;
        });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(observer.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_waiters() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }
}
