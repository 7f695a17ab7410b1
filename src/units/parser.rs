//! Compose-style unit file parser
//!
//! Parses a YAML `services:` mapping into [`ServiceSpec`]s, keeping the
//! order in which services appear in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_yml::{Mapping, Value};

use super::service::{
    is_valid_name, parse_cpu_share, parse_duration, parse_memory, MountBinding, RestartPolicy,
    ServiceSpec, MAX_DURATION,
};

#[derive(Debug, thiserror::Error)]
pub enum UnitFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("Unit file has no services")]
    NoServices,

    #[error("Invalid service name: {0:?}")]
    InvalidName(String),

    #[error("Service '{0}' is defined more than once")]
    DuplicateService(String),

    #[error("Service '{service}': invalid {field}: {value}")]
    InvalidValue {
        service: String,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawUnitFile {
    #[serde(default)]
    services: Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Float(f64),
    String(String),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Environment {
    List(Vec<String>),
    Map(Mapping),
}

#[derive(Debug, Default, Deserialize)]
struct RawLimits {
    memory: Option<Scalar>,
    cpus: Option<Scalar>,
}

#[derive(Debug, Default, Deserialize)]
struct RawResources {
    #[serde(default)]
    limits: RawLimits,
}

#[derive(Debug, Default, Deserialize)]
struct RawDeploy {
    #[serde(default)]
    resources: RawResources,
}

#[derive(Debug, Default, Deserialize)]
struct RawService {
    image: Option<String>,
    build: Option<PathBuf>,
    command: Option<StringOrList>,
    restart: Option<String>,
    env_file: Option<PathBuf>,
    environment: Option<Environment>,
    #[serde(default)]
    volumes: Vec<String>,
    mem_limit: Option<Scalar>,
    cpus: Option<Scalar>,
    #[serde(default)]
    deploy: RawDeploy,
    working_dir: Option<PathBuf>,
    restart_delay: Option<Scalar>,
    stop_timeout: Option<Scalar>,
}

/// Parse unit file content. Relative paths are resolved against `base_dir`.
pub fn parse_unit_str(content: &str, base_dir: &Path) -> Result<Vec<ServiceSpec>, UnitFileError> {
    let raw: RawUnitFile = serde_yml::from_str(content)?;
    if raw.services.is_empty() {
        return Err(UnitFileError::NoServices);
    }

    let mut specs: Vec<ServiceSpec> = Vec::with_capacity(raw.services.len());
    for (key, value) in &raw.services {
        let name = key
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| UnitFileError::InvalidName(format!("{:?}", key)))?;
        if !is_valid_name(&name) {
            return Err(UnitFileError::InvalidName(name));
        }
        if specs.iter().any(|s| s.name == name) {
            return Err(UnitFileError::DuplicateService(name));
        }

        let raw_service = if value.is_null() {
            RawService::default()
        } else {
            RawService::deserialize(value.clone())?
        };
        specs.push(convert_service(name, raw_service, base_dir)?);
    }

    Ok(specs)
}

/// Read and parse a unit file from disk
pub async fn load_unit_file(path: &Path) -> Result<Vec<ServiceSpec>, UnitFileError> {
    let content = tokio::fs::read_to_string(path).await?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_unit_str(&content, base_dir)
}

fn convert_service(
    name: String,
    raw: RawService,
    base_dir: &Path,
) -> Result<ServiceSpec, UnitFileError> {
    let invalid = |field: &'static str, value: String| UnitFileError::InvalidValue {
        service: name.clone(),
        field,
        value,
    };

    let mut spec = ServiceSpec::new(name.clone());
    spec.image = raw.image;
    spec.build = raw.build.map(|p| resolve(base_dir, p));
    spec.env_file = raw.env_file.map(|p| resolve(base_dir, p));
    spec.working_dir = raw.working_dir.map(|p| resolve(base_dir, p));

    spec.command = match raw.command {
        None => Vec::new(),
        Some(StringOrList::List(argv)) => argv,
        Some(StringOrList::String(line)) => {
            shlex::split(&line).ok_or_else(|| invalid("command", line.clone()))?
        }
    };

    if let Some(restart) = raw.restart {
        spec.restart = RestartPolicy::parse(&restart).ok_or_else(|| invalid("restart", restart))?;
    }

    spec.environment = match raw.environment {
        None => Vec::new(),
        Some(Environment::List(pairs)) => pairs
            .into_iter()
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair, String::new()),
            })
            .collect(),
        Some(Environment::Map(map)) => {
            let mut vars = Vec::with_capacity(map.len());
            for (k, v) in &map {
                let key = k
                    .as_str()
                    .ok_or_else(|| invalid("environment", format!("{:?}", k)))?;
                let value = scalar_text(v).ok_or_else(|| invalid("environment", key.to_string()))?;
                vars.push((key.to_string(), value));
            }
            vars
        }
    };

    for volume in raw.volumes {
        let mut mount =
            MountBinding::parse(&volume).ok_or_else(|| invalid("volumes", volume.clone()))?;
        mount.host = resolve(base_dir, mount.host);
        spec.mounts.push(mount);
    }

    // Top-level keys win over deploy.resources.limits
    let memory = raw.mem_limit.or(raw.deploy.resources.limits.memory);
    if let Some(memory) = memory {
        let text = memory.as_text();
        let bytes = parse_memory(&text).ok_or_else(|| invalid("mem_limit", text))?;
        spec.limits.memory_bytes = Some(bytes);
    }
    let cpus = raw.cpus.or(raw.deploy.resources.limits.cpus);
    if let Some(cpus) = cpus {
        let text = cpus.as_text();
        let share = parse_cpu_share(&text).ok_or_else(|| invalid("cpus", text))?;
        spec.limits.cpu_share = Some(share);
    }

    if let Some(delay) = raw.restart_delay {
        spec.restart_delay =
            duration_field(&delay).ok_or_else(|| invalid("restart_delay", delay.as_text()))?;
    }
    if let Some(timeout) = raw.stop_timeout {
        spec.stop_timeout =
            duration_field(&timeout).ok_or_else(|| invalid("stop_timeout", timeout.as_text()))?;
    }

    Ok(spec)
}

fn duration_field(value: &Scalar) -> Option<Duration> {
    match value {
        Scalar::Float(f) => Duration::try_from_secs_f64(*f)
            .ok()
            .filter(|d| *d <= MAX_DURATION),
        other => parse_duration(&other.as_text()),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"
services:
  auto-rsa:
    build: .
    image: auto-rsa:latest
    command: python ./auto-rsa.py "all accounts"
    restart: unless-stopped
    env_file: ./.env
    volumes:
      - ./creds:/app/creds
      - /var/log/rsa:/app/logs:ro
    deploy:
      resources:
        limits:
          memory: 512M
          cpus: "0.5"
  watchtower:
    image: containrrr/watchtower
    restart: unless-stopped
    environment:
      CLEANUP: true
      POLL_INTERVAL: 3600
"#;

    #[test]
    fn test_parse_deployment() {
        let specs = parse_unit_str(DEPLOYMENT, Path::new("/srv/rsa")).unwrap();
        assert_eq!(specs.len(), 2);

        let app = &specs[0];
        assert_eq!(app.name, "auto-rsa");
        assert_eq!(app.image.as_deref(), Some("auto-rsa:latest"));
        assert_eq!(app.build, Some(PathBuf::from("/srv/rsa/.")));
        assert_eq!(app.command, vec!["python", "./auto-rsa.py", "all accounts"]);
        assert_eq!(app.restart, RestartPolicy::UnlessStopped);
        assert_eq!(app.env_file, Some(PathBuf::from("/srv/rsa/./.env")));
        assert_eq!(app.mounts.len(), 2);
        assert_eq!(app.mounts[0].host, PathBuf::from("/srv/rsa/./creds"));
        assert_eq!(app.mounts[0].container, PathBuf::from("/app/creds"));
        assert_eq!(app.mounts[1].host, PathBuf::from("/var/log/rsa"));
        assert!(app.mounts[1].read_only);
        assert_eq!(app.limits.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(app.limits.cpu_share, Some(0.5));

        let sidecar = &specs[1];
        assert_eq!(sidecar.name, "watchtower");
        assert!(sidecar.command.is_empty());
        assert_eq!(
            sidecar.environment,
            vec![
                ("CLEANUP".to_string(), "true".to_string()),
                ("POLL_INTERVAL".to_string(), "3600".to_string()),
            ]
        );
    }

    #[test]
    fn test_order_follows_file() {
        let content = "services:\n  zeta: {}\n  alpha: {}\n  mid: {}\n";
        let specs = parse_unit_str(content, Path::new(".")).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_top_level_limits_and_list_command() {
        let content = r#"
services:
  worker:
    command: ["/bin/sh", "-c", "exit 3"]
    restart: on-failure
    mem_limit: 1g
    cpus: 2
    restart_delay: 250ms
    stop_timeout: 3
    environment:
      - MODE=batch
      - FLAG
"#;
        let specs = parse_unit_str(content, Path::new(".")).unwrap();
        let worker = &specs[0];
        assert_eq!(worker.command, vec!["/bin/sh", "-c", "exit 3"]);
        assert_eq!(worker.restart, RestartPolicy::OnFailure);
        assert_eq!(worker.limits.memory_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(worker.limits.cpu_share, Some(2.0));
        assert_eq!(worker.restart_delay, Duration::from_millis(250));
        assert_eq!(worker.stop_timeout, Duration::from_secs(3));
        assert_eq!(
            worker.environment,
            vec![
                ("MODE".to_string(), "batch".to_string()),
                ("FLAG".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_null_service_body() {
        let specs = parse_unit_str("services:\n  bare:\n", Path::new(".")).unwrap();
        assert_eq!(specs[0].name, "bare");
        assert_eq!(specs[0].restart, RestartPolicy::Never);
    }

    #[test]
    fn test_rejects_bad_restart() {
        let content = "services:\n  app:\n    restart: sometimes\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            UnitFileError::InvalidValue { field: "restart", .. }
        ));
    }

    #[test]
    fn test_rejects_bad_volume() {
        let content = "services:\n  app:\n    volumes: [\"/only-host\"]\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            UnitFileError::InvalidValue { field: "volumes", .. }
        ));
    }

    #[test]
    fn test_rejects_bad_memory() {
        let content = "services:\n  app:\n    mem_limit: lots\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            UnitFileError::InvalidValue { field: "mem_limit", .. }
        ));
    }

    #[test]
    fn test_rejects_invalid_name() {
        let content = "services:\n  \"bad name\": {}\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(err, UnitFileError::InvalidName(_)));
    }

    #[test]
    fn test_rejects_empty_file() {
        let err = parse_unit_str("services: {}\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, UnitFileError::NoServices));
        let err = parse_unit_str("version: '3'\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, UnitFileError::NoServices));
    }

    #[test]
    fn test_rejects_unbalanced_quotes() {
        let content = "services:\n  app:\n    command: 'echo \"unterminated'\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            UnitFileError::InvalidValue { field: "command", .. }
        ));
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        for value in ["1e30", "18446744073709551615", "-1.5", ".nan", "99999999999h"] {
            let content = format!("services:\n  app:\n    restart_delay: {}\n", value);
            let err = parse_unit_str(&content, Path::new(".")).unwrap_err();
            assert!(
                matches!(err, UnitFileError::InvalidValue { field: "restart_delay", .. }),
                "{} accepted",
                value
            );
        }

        let content = "services:\n  app:\n    stop_timeout: 1e30\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            UnitFileError::InvalidValue { field: "stop_timeout", .. }
        ));
    }

    #[test]
    fn test_fractional_duration() {
        let content = "services:\n  app:\n    restart_delay: 1.5\n";
        let specs = parse_unit_str(content, Path::new(".")).unwrap();
        assert_eq!(specs[0].restart_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_overflowing_memory() {
        let content = "services:\n  app:\n    mem_limit: 99999999999999G\n";
        let err = parse_unit_str(content, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            UnitFileError::InvalidValue { field: "mem_limit", .. }
        ));
    }
}
