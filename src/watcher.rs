//! Update watcher
//!
//! A periodic task that compares each supervised unit against the newest
//! available definition. It never touches units itself: updates go to the
//! supervisor over a channel, so a slow or failing check cannot hold up
//! crash recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::PollConfig;
use crate::manager::{UnitSnapshot, UnitState};
use crate::units::{load_unit_file, ServiceSpec, UnitFileError, MAX_DURATION};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A newer definition for a unit, sent to the supervisor
#[derive(Debug, Clone)]
pub struct Update {
    pub spec: ServiceSpec,
    /// Prune the old definition once the unit is stopped
    pub cleanup: bool,
    /// Start the unit after updating even if it was not running
    pub revive_stopped: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    UnitFile(#[from] UnitFileError),

    #[error("Update source unavailable: {0}")]
    Unavailable(String),
}

/// Where newer definitions come from
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Return the newer definition of `current`, if there is one
    async fn check(&self, current: &ServiceSpec) -> Result<Option<ServiceSpec>, UpdateError>;
}

/// Re-reads the unit file on every check
pub struct UnitFileSource {
    path: PathBuf,
}

impl UnitFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UpdateSource for UnitFileSource {
    async fn check(&self, current: &ServiceSpec) -> Result<Option<ServiceSpec>, UpdateError> {
        let specs = load_unit_file(&self.path).await?;
        let Some(latest) = specs.into_iter().find(|s| s.name == current.name) else {
            log::debug!(
                "{} is no longer in {}, keeping current definition",
                current.name,
                self.path.display()
            );
            return Ok(None);
        };

        if latest == *current {
            Ok(None)
        } else {
            Ok(Some(latest))
        }
    }
}

pub struct UpdateWatcher {
    config: PollConfig,
    source: Arc<dyn UpdateSource>,
    units: watch::Receiver<Vec<UnitSnapshot>>,
    updates: mpsc::Sender<Update>,
}

impl UpdateWatcher {
    pub fn new(
        config: PollConfig,
        source: Arc<dyn UpdateSource>,
        units: watch::Receiver<Vec<UnitSnapshot>>,
        updates: mpsc::Sender<Update>,
    ) -> Self {
        Self {
            config,
            source,
            units,
            updates,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Units to check this round
    fn candidates(&self) -> Vec<Arc<ServiceSpec>> {
        self.units
            .borrow()
            .iter()
            .filter(|unit| unit.state != UnitState::Removed)
            .filter(|unit| unit.active || self.config.include_stopped)
            .map(|unit| Arc::clone(&unit.spec))
            .collect()
    }

    /// Check every candidate once. Returns the number of updates sent.
    pub async fn poll_once(&self) -> usize {
        let mut sent = 0;

        for spec in self.candidates() {
            match self.source.check(&spec).await {
                Ok(Some(latest)) => {
                    log::info!(
                        "Found new definition for {} (image {} -> {})",
                        spec.name,
                        spec.image.as_deref().unwrap_or("-"),
                        latest.image.as_deref().unwrap_or("-")
                    );
                    let update = Update {
                        spec: latest,
                        cleanup: self.config.cleanup,
                        revive_stopped: self.config.revive_stopped,
                    };
                    if self.updates.send(update).await.is_err() {
                        log::warn!("Supervisor is gone, dropping update for {}", spec.name);
                        break;
                    }
                    sent += 1;
                }
                Ok(None) => log::debug!("{} is up to date", spec.name),
                Err(e) => log::warn!(
                    "Update check for {} failed: {} (retrying in {:?})",
                    spec.name,
                    e,
                    self.config.interval
                ),
            }
        }

        sent
    }

    /// Poll every interval until the supervisor drops its receiver.
    /// The first check runs one interval after start.
    pub async fn run(self) {
        let period = self.config.interval.clamp(MIN_INTERVAL, MAX_DURATION);
        let start = Instant::now()
            .checked_add(period)
            .unwrap_or_else(Instant::now);
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Checking for updates every {:?}", period);

        loop {
            ticker.tick().await;
            if self.updates.is_closed() {
                break;
            }
            let sent = self.poll_once().await;
            log::debug!("Update check complete, {} update(s) sent", sent);
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::RestartPolicy;

    fn snapshot(spec: ServiceSpec, state: UnitState, active: bool) -> UnitSnapshot {
        UnitSnapshot {
            name: spec.name.clone(),
            state,
            active,
            spec: Arc::new(spec),
        }
    }

    const UNIT_FILE: &str = r#"
services:
  auto-rsa:
    image: auto-rsa:v2
    command: sleep 60
    restart: unless-stopped
"#;

    #[tokio::test]
    async fn test_unit_file_source_detects_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yml");
        std::fs::write(&path, UNIT_FILE).unwrap();
        let source = UnitFileSource::new(&path);

        let mut current = ServiceSpec::new("auto-rsa")
            .with_image("auto-rsa:v1")
            .with_command(["sleep", "60"])
            .with_restart(RestartPolicy::UnlessStopped);
        let latest = source.check(&current).await.unwrap().unwrap();
        assert_eq!(latest.image.as_deref(), Some("auto-rsa:v2"));

        current.image = Some("auto-rsa:v2".to_string());
        assert!(source.check(&current).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unit_file_source_missing_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yml");
        std::fs::write(&path, UNIT_FILE).unwrap();
        let source = UnitFileSource::new(&path);

        let other = ServiceSpec::new("watchtower");
        assert!(source.check(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unit_file_source_unreadable() {
        let source = UnitFileSource::new("/nonexistent/warden/compose.yml");
        let err = source.check(&ServiceSpec::new("auto-rsa")).await.unwrap_err();
        assert!(matches!(err, UpdateError::UnitFile(UnitFileError::Io(_))));
    }

    #[test]
    fn test_candidates_respect_include_stopped() {
        let units = vec![
            snapshot(ServiceSpec::new("running"), UnitState::Running, true),
            snapshot(ServiceSpec::new("stopped"), UnitState::Stopped, false),
            snapshot(ServiceSpec::new("crashed"), UnitState::Crashed, false),
            snapshot(ServiceSpec::new("gone"), UnitState::Removed, false),
        ];
        let (_units_tx, units_rx) = watch::channel(units);
        let (tx, _rx) = mpsc::channel(8);
        let source: Arc<dyn UpdateSource> = Arc::new(UnitFileSource::new("unused.yml"));

        let watcher = UpdateWatcher::new(
            PollConfig::default(),
            Arc::clone(&source),
            units_rx.clone(),
            tx.clone(),
        );
        let names: Vec<_> = watcher.candidates().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["running"]);

        let config = PollConfig {
            include_stopped: true,
            ..PollConfig::default()
        };
        let watcher = UpdateWatcher::new(config, source, units_rx, tx);
        let names: Vec<_> = watcher.candidates().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["running", "stopped", "crashed"]);
    }

    #[tokio::test]
    async fn test_huge_interval_does_not_kill_task() {
        let (_units_tx, units_rx) = watch::channel(Vec::new());
        let (tx, _rx) = mpsc::channel(8);
        let config = PollConfig {
            interval: Duration::MAX,
            ..PollConfig::default()
        };
        let source: Arc<dyn UpdateSource> = Arc::new(UnitFileSource::new("unused.yml"));

        let handle = UpdateWatcher::new(config, source, units_rx, tx).spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
