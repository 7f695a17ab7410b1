//! Supervise all services in a unit file

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use warden::{CommandRuntime, PollConfig, Supervisor, UnitFileSource, UpdateWatcher};

/// Command-line settings layered over the environment
#[derive(Debug, Default)]
pub struct WatchOverrides {
    pub interval: Option<Duration>,
    pub cleanup: bool,
    pub include_stopped: bool,
    pub revive_stopped: bool,
    pub no_watch: bool,
}

pub async fn run(path: &Path, overrides: WatchOverrides) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = PollConfig::from_env()?;
    if let Some(interval) = overrides.interval {
        config.interval = interval;
    }
    config.cleanup |= overrides.cleanup;
    config.include_stopped |= overrides.include_stopped;
    config.revive_stopped |= overrides.revive_stopped;
    config.validate()?;

    let runtime = CommandRuntime::new();
    if !runtime.cgroups_available() {
        log::warn!("cgroup v2 unavailable, resource limits will not be enforced");
    }

    let mut supervisor = Supervisor::new(Arc::new(runtime));
    supervisor.load_unit_file(path).await?;

    let started = supervisor.start_all().await;
    log::info!("Started {} units: {:?}", started.len(), started);

    let (update_tx, update_rx) = mpsc::channel(16);
    if overrides.no_watch {
        log::info!("Update watcher disabled");
        drop(update_tx);
    } else {
        let source = Arc::new(UnitFileSource::new(path));
        UpdateWatcher::new(config, source, supervisor.subscribe(), update_tx).spawn();
    }

    supervisor.run(update_rx, shutdown_signal()).await;
    log::info!("All units stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
        _ = term.recv() => log::info!("Received SIGTERM"),
    }
}
