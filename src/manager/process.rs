//! Process spawning and management
//!
//! The supervisor talks to processes through [`ContainerRuntime`] and
//! [`UnitProcess`]. [`CommandRuntime`] is the built-in runtime: it runs the
//! unit's command as a child process, applies its env file, bind mounts and
//! cgroup limits.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::mounts::{apply_bind_mounts, PreparedMount};
use crate::cgroups::CgroupManager;
use crate::units::{MountBinding, ServiceSpec};

/// Launches processes for units
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, spec: &ServiceSpec) -> Result<Box<dyn UnitProcess>, SpawnError>;

    /// Drop whatever the runtime keeps for an outdated definition
    async fn prune(&self, _old: &ServiceSpec) -> Result<(), SpawnError> {
        Ok(())
    }
}

/// A launched unit process
#[async_trait]
pub trait UnitProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Exit code if the process has exited, without blocking
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// SIGTERM, then SIGKILL once `timeout` passes. Returns the exit code.
    async fn terminate(&mut self, timeout: Duration) -> std::io::Result<i32>;
}

/// Runs unit commands as child processes of the supervisor
pub struct CommandRuntime {
    cgroup_manager: Option<Arc<CgroupManager>>,
}

impl CommandRuntime {
    pub fn new() -> Self {
        // May fail if not root or cgroups unavailable
        let cgroup_manager = match CgroupManager::new() {
            Ok(mgr) => {
                log::debug!("Cgroup manager initialized");
                Some(Arc::new(mgr))
            }
            Err(e) => {
                log::debug!("Cgroup manager unavailable: {} (running without cgroups)", e);
                None
            }
        };
        Self { cgroup_manager }
    }

    pub fn without_cgroups() -> Self {
        Self {
            cgroup_manager: None,
        }
    }

    pub fn cgroups_available(&self) -> bool {
        self.cgroup_manager.is_some()
    }

    fn setup_cgroup(&self, spec: &ServiceSpec, pid: u32) -> Option<PathBuf> {
        let has_limits = !spec.limits.is_empty();
        let Some(cgroup_mgr) = &self.cgroup_manager else {
            if has_limits {
                log::error!(
                    "Service {} requests resource limits but cgroups unavailable, \
                     limits NOT enforced",
                    spec.name
                );
            }
            return None;
        };

        match cgroup_mgr.setup_service_cgroup(&spec.name, pid, &spec.limits) {
            Ok(path) => {
                log::debug!("Created cgroup {} for {}", path.display(), spec.name);
                Some(path)
            }
            Err(e) => {
                if has_limits {
                    log::error!(
                        "Failed to set up cgroup for {} (resource limits NOT enforced): {}",
                        spec.name,
                        e
                    );
                } else {
                    log::warn!("Failed to set up cgroup for {}: {}", spec.name, e);
                }
                None
            }
        }
    }
}

impl Default for CommandRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for CommandRuntime {
    async fn launch(&self, spec: &ServiceSpec) -> Result<Box<dyn UnitProcess>, SpawnError> {
        let mut cmd = build_command(spec)?;

        let mounts = prepare_mounts(spec)?;
        if !mounts.is_empty() {
            // SAFETY: the closure only issues unshare/mount syscalls on
            // pre-allocated CStrings between fork and exec.
            unsafe {
                cmd.pre_exec(move || apply_bind_mounts(&mounts));
            }
        }

        let child = cmd.spawn().map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let pid = child.id();
        let cgroup = pid.and_then(|pid| self.setup_cgroup(spec, pid));

        Ok(Box::new(ChildProcess {
            name: spec.name.clone(),
            child,
            cgroup_manager: cgroup.as_ref().and(self.cgroup_manager.clone()),
            cgroup,
        }))
    }

    async fn prune(&self, old: &ServiceSpec) -> Result<(), SpawnError> {
        // Child processes leave nothing behind beyond their cgroup,
        // which is released on exit.
        log::debug!("Nothing to prune for {}", old.name);
        Ok(())
    }
}

/// Build the command for a unit: argv, working directory and environment
fn build_command(spec: &ServiceSpec) -> Result<Command, SpawnError> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| SpawnError::NoCommand(spec.name.clone()))?;

    let mut cmd = Command::new(program);
    cmd.args(args);

    if let Some(wd) = &spec.working_dir {
        cmd.current_dir(wd);
    }

    // Inherit current env, then env file, then inline environment
    cmd.env_clear();
    cmd.envs(std::env::vars());
    if let Some(env_file) = &spec.env_file {
        let vars = load_env_file(env_file)
            .map_err(|e| SpawnError::EnvFile(env_file.clone(), e.to_string()))?;
        cmd.envs(vars);
    }
    for (key, value) in &spec.environment {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    Ok(cmd)
}

fn prepare_mounts(spec: &ServiceSpec) -> Result<Vec<PreparedMount>, SpawnError> {
    if spec.mounts.is_empty() {
        return Ok(Vec::new());
    }

    // Mount namespaces need CAP_SYS_ADMIN
    if unsafe { libc::geteuid() } != 0 {
        log::warn!(
            "{}: mount bindings need root, starting without {} mount(s)",
            spec.name,
            spec.mounts.len()
        );
        return Ok(Vec::new());
    }

    spec.mounts
        .iter()
        .map(|m| {
            if !m.host.exists() {
                return Err(SpawnError::MissingMountSource(m.host.clone()));
            }
            ensure_mount_target(m)?;
            let host = CString::new(m.host.as_os_str().as_bytes())
                .map_err(|_| SpawnError::MissingMountSource(m.host.clone()))?;
            let container = CString::new(m.container.as_os_str().as_bytes())
                .map_err(|_| SpawnError::MissingMountSource(m.container.clone()))?;
            Ok(PreparedMount {
                host,
                container,
                read_only: m.read_only,
            })
        })
        .collect()
}

/// Create the mount point when it does not exist yet: a directory for a
/// directory source, an empty file for a file source.
fn ensure_mount_target(mount: &MountBinding) -> Result<(), SpawnError> {
    let target = &mount.container;
    if target.exists() {
        return Ok(());
    }
    let err = |e: std::io::Error| SpawnError::MountTarget(target.clone(), e.to_string());

    if mount.host.is_dir() {
        std::fs::create_dir_all(target).map_err(err)?;
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(err)?;
        }
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .map_err(err)?;
    }
    log::debug!("Created mount point {}", target.display());
    Ok(())
}

struct ChildProcess {
    name: String,
    child: Child,
    cgroup_manager: Option<Arc<CgroupManager>>,
    cgroup: Option<PathBuf>,
}

impl ChildProcess {
    fn release_cgroup(&mut self) {
        if self.cgroup.take().is_none() {
            return;
        }
        if let Some(cgroup_mgr) = self.cgroup_manager.take() {
            if let Err(e) = cgroup_mgr.cleanup_service_cgroup(&self.name) {
                log::debug!("Failed to clean up cgroup for {}: {}", self.name, e);
            }
        }
    }
}

#[async_trait]
impl UnitProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.release_cgroup();
        }
        Ok(status.map(exit_code))
    }

    async fn terminate(&mut self, timeout: Duration) -> std::io::Result<i32> {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let code = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => exit_code(status?),
            Err(_) => {
                log::warn!("Timeout stopping {}, sending SIGKILL", self.name);
                self.child.kill().await?;
                exit_code(self.child.wait().await?)
            }
        };
        self.release_cgroup();
        Ok(code)
    }
}

/// Exit code, with signal deaths reported as 128 + signal number
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Load environment variables from a file
fn load_env_file(path: &Path) -> Result<HashMap<String, String>, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_env_content(&content))
}

fn parse_env_content(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            // Remove quotes from value
            let value = value.trim().trim_matches('"').trim_matches('\'');
            vars.insert(key.trim().to_string(), value.to_string());
        }
    }

    vars
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Service {0} has no command")]
    NoCommand(String),

    #[error("Failed to read env file {0}: {1}")]
    EnvFile(PathBuf, String),

    #[error("Mount source does not exist: {0}")]
    MissingMountSource(PathBuf),

    #[error("Cannot create mount point {0}: {1}")]
    MountTarget(PathBuf, String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
