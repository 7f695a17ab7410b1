//! Lifecycle supervisor
//!
//! Starts, stops and restarts units, observes their exit status and applies
//! restart policies. Driven by [`Supervisor::tick`], which the main loop in
//! [`Supervisor::run`] calls every 100ms.

mod mounts;
mod process;
mod state;

pub use process::{CommandRuntime, ContainerRuntime, SpawnError, UnitProcess};
pub use state::{RunningUnit, UnitState};

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::registry::{Registry, RegistryError, SharedRegistry};
use crate::units::{self, ServiceSpec, UnitFileError};
use crate::watcher::Update;

/// Scheduling tick of the supervisor loop
pub const TICK: Duration = Duration::from_millis(100);

/// Minimum wait before relaunching a unit whose launch failed
const LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Point-in-time view of a unit, published to the update watcher
#[derive(Debug, Clone)]
pub struct UnitSnapshot {
    pub name: String,
    pub state: UnitState,
    pub active: bool,
    pub spec: Arc<ServiceSpec>,
}

/// Supervisor that tracks and controls units
pub struct Supervisor {
    registry: SharedRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    /// Runtime state for each registered unit
    units: HashMap<String, RunningUnit>,
    /// Live processes
    processes: HashMap<String, Box<dyn UnitProcess>>,
    snapshot_tx: watch::Sender<Vec<UnitSnapshot>>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            registry: Registry::new().shared(),
            runtime,
            units: HashMap::new(),
            processes: HashMap::new(),
            snapshot_tx,
        }
    }

    /// Handle to the registry, for read access from other tasks
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Unit snapshots, refreshed after every operation and tick
    pub fn subscribe(&self) -> watch::Receiver<Vec<UnitSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Register a unit definition. The unit starts out Created.
    pub async fn register(&mut self, spec: ServiceSpec) -> Result<(), ManagerError> {
        let spec = self.registry.write().await.register(spec)?;
        self.units
            .insert(spec.name.clone(), RunningUnit::new(Arc::clone(&spec)));
        self.publish();
        Ok(())
    }

    /// Register every service in a unit file, in file order.
    /// Returns the number of services registered.
    pub async fn load_unit_file(&mut self, path: &Path) -> Result<usize, ManagerError> {
        let specs = units::load_unit_file(path).await?;
        let count = specs.len();
        for spec in specs {
            self.register(spec).await?;
        }
        log::info!("Loaded {} services from {}", count, path.display());
        Ok(count)
    }

    /// Start a unit
    pub async fn start(&mut self, name: &str) -> Result<(), ManagerError> {
        let spec = self.registry.read().await.get(name)?;

        let unit = self
            .units
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        if unit.state == UnitState::Running {
            return Err(ManagerError::AlreadyActive(name.to_string()));
        }
        unit.manually_stopped = false;
        unit.restart_count = 0;

        let result = self.launch(name, spec).await;
        self.publish();
        result
    }

    /// Stop a unit. Stopping a unit that is not running is not an error.
    pub async fn stop(&mut self, name: &str) -> Result<(), ManagerError> {
        let unit = self
            .units
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        match self.processes.remove(name) {
            Some(mut process) => {
                log::info!(
                    "Stopping {} (PID {})",
                    name,
                    process.id().map_or_else(|| "?".to_string(), |p| p.to_string())
                );
                match process.terminate(unit.spec.stop_timeout).await {
                    Ok(code) => {
                        unit.set_stopped(Some(code));
                        log::info!("Stopped {} (exit code {})", name, code);
                    }
                    Err(e) => {
                        log::warn!("Error waiting for {} to stop: {}", name, e);
                        unit.set_stopped(None);
                    }
                }
            }
            None => {
                if unit.restart_pending() {
                    log::info!("Cancelled pending restart of {}", name);
                }
                unit.set_stopped(None);
            }
        }

        self.publish();
        Ok(())
    }

    /// Stop then start
    pub async fn restart(&mut self, name: &str) -> Result<(), ManagerError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Stop a unit and drop it from the registry
    pub async fn remove(&mut self, name: &str) -> Result<RunningUnit, ManagerError> {
        self.stop(name).await?;
        self.registry.write().await.remove(name)?;

        let mut unit = self
            .units
            .remove(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        unit.set_removed();
        log::info!("Removed {}", name);

        self.publish();
        Ok(unit)
    }

    /// Start every registered unit in registration order, except those an
    /// operator stopped under the `unless-stopped` policy.
    /// Returns the names of the units started.
    pub async fn start_all(&mut self) -> Vec<String> {
        let specs: Vec<Arc<ServiceSpec>> = self.registry.read().await.list().cloned().collect();

        let mut started = Vec::new();
        for spec in specs {
            let Some(unit) = self.units.get(&spec.name) else {
                continue;
            };
            if unit.state == UnitState::Running {
                log::debug!("{} already running, skipping", spec.name);
                continue;
            }
            if unit.manually_stopped && !spec.restart.starts_after_manual_stop() {
                log::info!("{} was stopped manually, leaving it stopped", spec.name);
                continue;
            }

            match self.start(&spec.name).await {
                Ok(()) => started.push(spec.name.clone()),
                Err(e) => log::warn!("Failed to start {}: {}", spec.name, e),
            }
        }
        started
    }

    /// Stop every running unit, newest registration first
    pub async fn stop_all(&mut self) {
        let names: Vec<String> = self
            .registry
            .read()
            .await
            .list()
            .map(|s| s.name.clone())
            .collect();

        for name in names.iter().rev() {
            let active = self.units.get(name).is_some_and(|u| u.is_active());
            if !active {
                continue;
            }
            if let Err(e) = self.stop(name).await {
                log::warn!("Failed to stop {}: {}", name, e);
            }
        }
    }

    /// Swap in a newer definition and cycle the unit: stop, optionally
    /// prune the old definition, start.
    pub async fn apply_update(&mut self, update: Update) -> Result<(), ManagerError> {
        let name = update.spec.name.clone();
        let was_active = self
            .units
            .get(&name)
            .ok_or_else(|| ManagerError::NotFound(name.clone()))?
            .is_active();

        let old = self.registry.write().await.replace(update.spec)?;
        let new = self.registry.read().await.get(&name)?;
        if let Some(unit) = self.units.get_mut(&name) {
            unit.spec = Arc::clone(&new);
        }
        log::info!(
            "Updating {} ({} -> {})",
            name,
            old.image.as_deref().unwrap_or("-"),
            new.image.as_deref().unwrap_or("-")
        );

        if was_active {
            self.stop(&name).await?;
        }

        if update.cleanup {
            if let Err(e) = self.runtime.prune(&old).await {
                log::warn!("Failed to prune old definition of {}: {}", name, e);
            }
        }

        if was_active || update.revive_stopped {
            self.start(&name).await?;
        } else {
            log::info!("{} updated while stopped, not starting it", name);
            self.publish();
        }
        Ok(())
    }

    /// One scheduling tick: observe exits, then relaunch units that are due
    pub async fn tick(&mut self) {
        self.reap();
        self.process_restarts().await;
        self.publish();
    }

    /// Check on running processes and apply restart policies to exits
    pub fn reap(&mut self) {
        let mut exited = Vec::new();

        for (name, process) in &mut self.processes {
            match process.try_wait() {
                Ok(Some(code)) => exited.push((name.clone(), code)),
                Ok(None) => {
                    // Still running
                }
                Err(e) => {
                    log::error!("Error checking {}: {}", name, e);
                }
            }
        }

        for (name, code) in exited {
            self.processes.remove(&name);
            let Some(unit) = self.units.get_mut(&name) else {
                continue;
            };

            unit.set_crashed(code);
            let policy = unit.spec.restart;
            if policy.should_restart(code, unit.manually_stopped) {
                let delay = unit.spec.restart_delay;
                unit.schedule_restart(delay);
                log::warn!(
                    "{} exited with code {}, scheduling restart in {:?}",
                    name,
                    code,
                    delay
                );
            } else {
                log::warn!(
                    "{} exited with code {} (restart: {})",
                    name,
                    code,
                    policy.as_str()
                );
            }
        }
    }

    /// Relaunch crashed units whose restart delay has passed
    pub async fn process_restarts(&mut self) {
        let due: Vec<String> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.state == UnitState::Crashed && unit.restart_due())
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            let spec = match self.registry.read().await.get(&name) {
                Ok(spec) => spec,
                Err(e) => {
                    log::error!("Cannot restart {}: {}", name, e);
                    continue;
                }
            };
            if let Some(unit) = self.units.get_mut(&name) {
                unit.restart_count += 1;
                log::info!("Restarting {} (attempt {})", name, unit.restart_count);
            }
            // Failures are logged and rescheduled inside launch
            let _ = self.launch(&name, spec).await;
        }
    }

    /// Status of a unit
    pub fn status(&self, name: &str) -> Option<&RunningUnit> {
        self.units.get(name)
    }

    /// All units (unordered)
    pub fn list(&self) -> impl Iterator<Item = (&String, &RunningUnit)> {
        self.units.iter()
    }

    /// Main loop: ticks, applies updates from the watcher, and stops all
    /// units once `shutdown` resolves.
    pub async fn run<F>(mut self, mut updates: mpsc::Receiver<Update>, shutdown: F) -> Self
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down, stopping all units");
                    self.stop_all().await;
                    break;
                }
                _ = interval.tick() => self.tick().await,
                Some(update) = updates.recv() => {
                    let name = update.spec.name.clone();
                    if let Err(e) = self.apply_update(update).await {
                        log::error!("Failed to update {}: {}", name, e);
                    }
                }
            }
        }

        self
    }

    /// Launch a unit's process and mark it Running. On failure the unit is
    /// left Crashed, with a retry scheduled when its policy allows one.
    async fn launch(&mut self, name: &str, spec: Arc<ServiceSpec>) -> Result<(), ManagerError> {
        match self.runtime.launch(&spec).await {
            Ok(process) => {
                let pid = process.id();
                self.processes.insert(name.to_string(), process);
                if let Some(unit) = self.units.get_mut(name) {
                    unit.spec = spec;
                    unit.set_running(pid);
                }
                match pid {
                    Some(pid) => log::info!("Started {} (PID {})", name, pid),
                    None => log::info!("Started {}", name),
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start {}: {}", name, e);
                if let Some(unit) = self.units.get_mut(name) {
                    unit.set_launch_failed(e.to_string());
                    // A failed launch counts as a failed run
                    let code = unit.exit_code.filter(|c| *c != 0).unwrap_or(1);
                    if spec.restart.should_restart(code, unit.manually_stopped) {
                        unit.schedule_restart(spec.restart_delay.max(LAUNCH_RETRY_DELAY));
                    }
                }
                Err(ManagerError::Spawn(e))
            }
        }
    }

    fn publish(&self) {
        let mut snapshot: Vec<UnitSnapshot> = self
            .units
            .values()
            .map(|unit| UnitSnapshot {
                name: unit.name().to_string(),
                state: unit.state,
                active: unit.is_active(),
                spec: Arc::clone(&unit.spec),
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unit not found: {0}")]
    NotFound(String),

    #[error("Unit already registered: {0}")]
    DuplicateName(String),

    #[error("Unit already active: {0}")]
    AlreadyActive(String),

    #[error(transparent)]
    UnitFile(#[from] UnitFileError),

    #[error("Failed to spawn: {0}")]
    Spawn(#[from] SpawnError),
}

impl From<RegistryError> for ManagerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateName(name) => Self::DuplicateName(name),
            RegistryError::NotFound(name) => Self::NotFound(name),
        }
    }
}
