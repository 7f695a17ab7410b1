//! Typed service definitions loaded from compose-style unit files

use std::path::PathBuf;
use std::time::Duration;

/// Restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "no" | "never" => Some(Self::Never),
            "on-failure" => Some(Self::OnFailure),
            "always" => Some(Self::Always),
            "unless-stopped" => Some(Self::UnlessStopped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "no",
            Self::OnFailure => "on-failure",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
        }
    }

    /// Whether an unexpected exit with `exit_code` should be followed by a restart.
    ///
    /// A unit stopped by the operator is never restarted, whatever its policy.
    pub fn should_restart(&self, exit_code: i32, manually_stopped: bool) -> bool {
        if manually_stopped {
            return false;
        }
        match self {
            Self::Never => false,
            Self::OnFailure => exit_code != 0,
            Self::Always | Self::UnlessStopped => true,
        }
    }

    /// Whether a boot-time `start_all` should bring the unit back up after
    /// the operator stopped it.
    pub fn starts_after_manual_stop(&self) -> bool {
        !matches!(self, Self::UnlessStopped)
    }
}

/// Resource ceilings (enforced through cgroup v2 when available)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    /// memory.max in bytes
    pub memory_bytes: Option<u64>,
    /// CPU share in cores (0.5 = half a core)
    pub cpu_share: Option<f64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu_share.is_none()
    }

    /// CPU share as a cpu.max percentage (100 = 1 core)
    pub fn cpu_percent(&self) -> Option<u32> {
        self.cpu_share
            .filter(|share| *share > 0.0)
            .map(|share| ((share * 100.0).round() as u32).max(1))
    }
}

/// A host path bound into the unit's filesystem view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

impl MountBinding {
    /// Parse a compose volume entry: `host:container[:ro|:rw]`
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(':');
        let host = parts.next().filter(|p| !p.is_empty())?;
        let container = parts.next().filter(|p| !p.is_empty())?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            host: PathBuf::from(host),
            container: PathBuf::from(container),
            read_only,
        })
    }
}

/// Complete service definition. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    /// Image reference; a change here is what the update watcher looks for
    pub image: Option<String>,
    /// Build context directory
    pub build: Option<PathBuf>,
    /// argv of the main process
    pub command: Vec<String>,
    pub restart: RestartPolicy,
    pub limits: ResourceLimits,
    pub mounts: Vec<MountBinding>,
    pub env_file: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub restart_delay: Duration,
    pub stop_timeout: Duration,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            build: None,
            command: Vec::new(),
            restart: RestartPolicy::default(),
            limits: ResourceLimits::default(),
            mounts: Vec::new(),
            env_file: None,
            environment: Vec::new(),
            working_dir: None,
            restart_delay: Duration::ZERO,
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }
}

/// Check a service name: `[A-Za-z0-9][A-Za-z0-9_.-]*`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Longest delay or interval accepted (ten years)
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Parse duration (e.g., "5s", "100ms", "1min", "1h"); a bare number is seconds.
/// Values above [`MAX_DURATION`] are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    let duration = if let Some(n) = s.strip_suffix("ms") {
        Duration::from_millis(n.parse().ok()?)
    } else if let Some(n) = s.strip_suffix("min") {
        Duration::from_secs(n.parse::<u64>().ok()?.checked_mul(60)?)
    } else if let Some(n) = s.strip_suffix('s') {
        Duration::from_secs(n.parse().ok()?)
    } else if let Some(n) = s.strip_suffix('m') {
        Duration::from_secs(n.parse::<u64>().ok()?.checked_mul(60)?)
    } else if let Some(n) = s.strip_suffix('h') {
        Duration::from_secs(n.parse::<u64>().ok()?.checked_mul(3600)?)
    } else {
        Duration::from_secs(s.parse().ok()?)
    };

    (duration <= MAX_DURATION).then_some(duration)
}

/// Parse memory size (e.g., "512M", "512mb", "1G", "1073741824")
pub fn parse_memory(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let s = s.strip_suffix('B').filter(|n| !n.is_empty()).unwrap_or(&s);

    if let Some(n) = s.strip_suffix('G') {
        n.parse::<u64>().ok()?.checked_mul(1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        n.parse::<u64>().ok()?.checked_mul(1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        n.parse::<u64>().ok()?.checked_mul(1024)
    } else {
        s.parse().ok()
    }
}

/// Parse a CPU share in cores (e.g., "0.5", "2")
pub fn parse_cpu_share(s: &str) -> Option<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}
