//! switchyard.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::types::{EnvironmentId, Percent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Environment that receives 100% of traffic on first boot.
    pub initial_active: EnvironmentId,
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub switch: SwitchSettings,
    #[serde(default)]
    pub migration: MigrationSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub deploy: DeploySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub id: EnvironmentId,
    pub version: String,
    /// Instance addresses (`host:port`) probed by the health prober.
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub liveness_path: String,
    pub deep_path: String,
    pub timeout_ms: u64,
    pub retry: BackoffPolicy,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            liveness_path: "/healthz".to_string(),
            deep_path: "/health/deep".to_string(),
            timeout_ms: 3_000,
            retry: BackoffPolicy::default(),
        }
    }
}

impl HealthSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchSettings {
    /// How long the edge router may take to report the new revision.
    pub adoption_timeout_ms: u64,
    pub retry: BackoffPolicy,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            adoption_timeout_ms: 5_000,
            retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub steps: Vec<Percent>,
    /// Pause after each weight change before probing.
    pub settle_secs: u64,
    /// Also probe the source environment after each step.
    pub check_source: bool,
    /// Lease on the global plan lock; a crashed holder loses it after this.
    pub lock_ttl_secs: u64,
    pub canary_percent: Percent,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            steps: vec![25, 50, 75, 100],
            settle_secs: 5,
            check_source: true,
            lock_ttl_secs: 600,
            canary_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    /// Trailing window for outcome sampling and availability.
    pub window_secs: u64,
    /// Error rate (0.0-1.0) above which a Critical alert is raised.
    pub error_rate_threshold: f64,
    pub p95_latency_ms: f64,
    /// Availability percentage below which a Warning is raised.
    pub availability_threshold: f64,
    pub cooldown_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            window_secs: 60,
            error_rate_threshold: 0.05,
            p95_latency_ms: 1_000.0,
            availability_threshold: 99.0,
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    /// Upstream file + reload command for an external proxy.
    File,
    /// In-process weighted router.
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub kind: RouterKind,
    pub config_path: PathBuf,
    pub reload_command: Option<String>,
    pub reload_timeout_ms: u64,
    /// Where the in-process router accepts client traffic.
    pub proxy_listen: String,
    pub upstream_timeout_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            kind: RouterKind::Memory,
            config_path: PathBuf::from("upstreams.json"),
            reload_command: None,
            reload_timeout_ms: 5_000,
            proxy_listen: "0.0.0.0:8481".to_string(),
            upstream_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Build/update command; receives SWITCHYARD_ENVIRONMENT and SWITCHYARD_VERSION.
    pub command: Option<String>,
    pub timeout_secs: u64,
    /// Upper bound on waiting for a freshly deployed environment.
    pub ready_timeout_secs: u64,
    pub ready_poll_secs: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 600,
            ready_timeout_secs: 120,
            ready_poll_secs: 5,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no environments configured")]
    NoEnvironments,
    #[error("duplicate environment id: {0}")]
    DuplicateEnvironment(EnvironmentId),
    #[error("initial_active {0} is not a configured environment")]
    UnknownInitialActive(EnvironmentId),
    #[error("environment {0} has no endpoints")]
    NoEndpoints(EnvironmentId),
    #[error("environment {id} has invalid version {version:?}")]
    InvalidVersion { id: EnvironmentId, version: String },
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("invalid migration steps: {0}")]
    Steps(#[from] StepsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepsError {
    #[error("step list is empty")]
    Empty,
    #[error("step {0} is outside 1..=100")]
    OutOfRange(Percent),
    #[error("steps must be strictly increasing ({prev} then {next})")]
    NotIncreasing { prev: Percent, next: Percent },
    #[error("final step must be 100, got {0}")]
    FinalNotFull(Percent),
}

/// Check a migration step list: non-empty, strictly increasing, ending at 100.
pub fn validate_steps(steps: &[Percent]) -> Result<(), StepsError> {
    let Some(&last) = steps.last() else {
        return Err(StepsError::Empty);
    };
    for &step in steps {
        if step == 0 || step > 100 {
            return Err(StepsError::OutOfRange(step));
        }
    }
    for pair in steps.windows(2) {
        if pair[1] <= pair[0] {
            return Err(StepsError::NotIncreasing {
                prev: pair[0],
                next: pair[1],
            });
        }
    }
    if last != 100 {
        return Err(StepsError::FinalNotFull(last));
    }
    Ok(())
}

/// Validate a version string as semver.
pub fn validate_version(version: &str) -> bool {
    semver::Version::parse(version.trim_start_matches('v')).is_ok()
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl SwitchyardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SwitchyardConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.id) {
                return Err(ConfigError::DuplicateEnvironment(env.id));
            }
            if env.endpoints.is_empty() {
                return Err(ConfigError::NoEndpoints(env.id));
            }
            if !validate_version(&env.version) {
                return Err(ConfigError::InvalidVersion {
                    id: env.id,
                    version: env.version.clone(),
                });
            }
        }
        if !seen.contains(&self.initial_active) {
            return Err(ConfigError::UnknownInitialActive(self.initial_active));
        }

        check_range("health.timeout_ms", self.health.timeout_ms, 2_000, 5_000)?;
        check_range(
            "health.retry.max_attempts",
            self.health.retry.max_attempts as u64,
            3,
            10,
        )?;
        check_range(
            "switch.retry.max_attempts",
            self.switch.retry.max_attempts as u64,
            1,
            10,
        )?;
        check_range("migration.settle_secs", self.migration.settle_secs, 0, 60)?;
        check_range(
            "migration.canary_percent",
            self.migration.canary_percent as u64,
            1,
            99,
        )?;
        check_range("monitor.interval_secs", self.monitor.interval_secs, 5, 30)?;
        validate_steps(&self.migration.steps)?;
        Ok(())
    }

    /// Scaffold a two-environment blue-green config.
    pub fn scaffold(primary: &str, secondary: &str) -> Self {
        SwitchyardConfig {
            initial_active: EnvironmentId::Primary,
            environments: vec![
                EnvironmentConfig {
                    id: EnvironmentId::Primary,
                    version: "1.0.0".to_string(),
                    endpoints: vec![primary.to_string()],
                },
                EnvironmentConfig {
                    id: EnvironmentId::Secondary,
                    version: "1.0.0".to_string(),
                    endpoints: vec![secondary.to_string()],
                },
            ],
            health: HealthSettings::default(),
            switch: SwitchSettings::default(),
            migration: MigrationSettings::default(),
            monitor: MonitorSettings::default(),
            router: RouterSettings::default(),
            deploy: DeploySettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_is_valid() {
        let config = SwitchyardConfig::scaffold("127.0.0.1:9001", "127.0.0.1:9002");
        assert_eq!(config.validate(), Ok(()));
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("primary"));
        assert!(toml_str.contains("127.0.0.1:9002"));
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
initial_active = "primary"

[[environments]]
id = "primary"
version = "1.0.0"
endpoints = ["10.0.0.1:8080"]

[[environments]]
id = "secondary"
version = "1.0.0"
endpoints = ["10.0.0.2:8080"]
"#;
        let config: SwitchyardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.environments.len(), 2);
        assert_eq!(config.migration.steps, vec![25, 50, 75, 100]);
        assert_eq!(config.router.kind, RouterKind::Memory);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_parse_overrides() {
        let toml_str = r#"
initial_active = "secondary"

[[environments]]
id = "primary"
version = "2.1.0"
endpoints = ["10.0.0.1:8080"]

[[environments]]
id = "secondary"
version = "2.0.0"
endpoints = ["10.0.0.2:8080"]

[migration]
steps = [10, 100]
settle_secs = 1

[router]
kind = "file"
config_path = "/tmp/upstreams.json"
reload_command = "true"

[health.retry]
max_attempts = 5
"#;
        let config: SwitchyardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.initial_active, EnvironmentId::Secondary);
        assert_eq!(config.migration.steps, vec![10, 100]);
        assert_eq!(config.router.kind, RouterKind::File);
        assert_eq!(config.health.retry.max_attempts, 5);
        // Unset fields inside a partially specified table keep defaults.
        assert_eq!(config.health.retry.base_delay_ms, 200);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_unknown_initial_active() {
        let mut config = SwitchyardConfig::scaffold("a:1", "b:2");
        config.initial_active = EnvironmentId::Canary;
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownInitialActive(EnvironmentId::Canary))
        );
    }

    #[test]
    fn rejects_duplicate_environment() {
        let mut config = SwitchyardConfig::scaffold("a:1", "b:2");
        config.environments[1].id = EnvironmentId::Primary;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateEnvironment(EnvironmentId::Primary))
        );
    }

    #[test]
    fn rejects_probe_timeout_out_of_range() {
        let mut config = SwitchyardConfig::scaffold("a:1", "b:2");
        config.health.timeout_ms = 30_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "health.timeout_ms", .. })
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let mut config = SwitchyardConfig::scaffold("a:1", "b:2");
        config.environments[0].version = "latest".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn steps_validation() {
        assert_eq!(validate_steps(&[25, 50, 75, 100]), Ok(()));
        assert_eq!(validate_steps(&[100]), Ok(()));
        assert_eq!(validate_steps(&[]), Err(StepsError::Empty));
        assert_eq!(validate_steps(&[0, 100]), Err(StepsError::OutOfRange(0)));
        assert_eq!(validate_steps(&[50, 101]), Err(StepsError::OutOfRange(101)));
        assert_eq!(
            validate_steps(&[50, 50, 100]),
            Err(StepsError::NotIncreasing { prev: 50, next: 50 })
        );
        assert_eq!(validate_steps(&[25, 75]), Err(StepsError::FinalNotFull(75)));
    }

    #[test]
    fn version_validation() {
        assert!(validate_version("2.0.0"));
        assert!(validate_version("v1.4.2"));
        assert!(!validate_version("two"));
    }
}
