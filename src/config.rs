use std::time::Duration;

use serde::Deserialize;
use validator::{Validate, ValidationError};

fn default_min_runners() -> u32 {
    2
}
fn default_max_runners() -> u32 {
    10
}
fn default_scale_up_threshold() -> u32 {
    3
}
fn default_scale_down_threshold() -> u32 {
    1
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    30
}
fn default_registration_grace() -> u64 {
    120
}
fn default_scale_up_cooldown() -> u64 {
    60
}
fn default_runner_prefix() -> String {
    "orchestrated".into()
}
fn default_runner_name_prefix() -> String {
    "github-runner".into()
}
fn default_controller_id() -> String {
    "runner-controller".into()
}
fn default_runner_image() -> String {
    "github-runner:latest".into()
}
fn default_runner_network() -> String {
    "github-runners".into()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}

/// Controller configuration, read from `CONTROLLER_*` environment variables.
///
/// Validated once at startup; the process refuses to come up on a bad config.
#[derive(Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_cross_fields"))]
pub struct Config {
    /// GitHub personal access token used for all registry calls.
    #[validate(length(min = 1, message = "CONTROLLER_TOKEN must not be empty"))]
    pub token: String,
    /// Organization scope. Mutually exclusive with `repo`.
    pub org: Option<String>,
    /// Repository scope as `owner/repo`. Mutually exclusive with `org`.
    pub repo: Option<String>,

    #[serde(default = "default_min_runners")]
    pub min_runners: u32,
    #[serde(default = "default_max_runners")]
    #[validate(range(min = 1))]
    pub max_runners: u32,
    #[serde(default = "default_scale_up_threshold")]
    #[validate(range(min = 1))]
    pub scale_up_threshold: u32,
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: u32,
    /// Minimum container age before a worker may be culled by automatic
    /// scale-down, in seconds.
    #[serde(rename = "idle_timeout", default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(rename = "poll_interval", default = "default_poll_interval")]
    #[validate(range(min = 15, message = "CONTROLLER_POLL_INTERVAL must be at least 15 seconds"))]
    pub poll_interval_secs: u64,
    /// How long a container may run unregistered before the reconciler
    /// considers it orphaned, in seconds.
    #[serde(rename = "registration_grace", default = "default_registration_grace")]
    pub registration_grace_secs: u64,
    #[serde(rename = "scale_up_cooldown", default = "default_scale_up_cooldown")]
    pub scale_up_cooldown_secs: u64,

    /// Name prefix identifying registrations and containers owned by this
    /// controller. Anything without it is invisible to us.
    #[serde(default = "default_runner_prefix")]
    pub runner_prefix: String,
    #[serde(default = "default_runner_name_prefix")]
    pub runner_name_prefix: String,
    /// Value of the `managed-by` label stamped on every container we create.
    #[serde(default = "default_controller_id")]
    pub controller_id: String,

    #[serde(default = "default_runner_image")]
    pub runner_image: String,
    #[serde(default = "default_runner_network")]
    pub runner_network: String,
    /// Extra registration labels, comma-separated.
    #[serde(default)]
    pub runner_labels: String,
    pub docker_socket: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub structured_logging: bool,
}

fn validate_cross_fields(config: &Config) -> Result<(), ValidationError> {
    match (&config.org, &config.repo) {
        (Some(_), Some(_)) => {
            return Err(ValidationError::new("scope")
                .with_message("set exactly one of CONTROLLER_ORG or CONTROLLER_REPO, not both".into()));
        }
        (None, None) => {
            return Err(ValidationError::new("scope")
                .with_message("one of CONTROLLER_ORG or CONTROLLER_REPO is required".into()));
        }
        (None, Some(repo)) if !repo.contains('/') => {
            return Err(ValidationError::new("scope")
                .with_message("CONTROLLER_REPO must be in owner/repo form".into()));
        }
        _ => {}
    }
    if config.min_runners > config.max_runners {
        return Err(ValidationError::new("bounds")
            .with_message("CONTROLLER_MIN_RUNNERS must not exceed CONTROLLER_MAX_RUNNERS".into()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] envy::Error),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = envy::prefixed("CONTROLLER_").from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// API path segment for the configured scope: `repos/{owner}/{repo}` or
    /// `orgs/{org}`.
    pub fn scope_path(&self) -> String {
        match (&self.org, &self.repo) {
            (Some(org), _) => format!("orgs/{org}"),
            (_, Some(repo)) => format!("repos/{repo}"),
            _ => unreachable!("validated at startup"),
        }
    }

    /// Browser-facing URL a fresh runner registers against.
    pub fn scope_url(&self) -> String {
        match (&self.org, &self.repo) {
            (Some(org), _) => format!("https://github.com/{org}"),
            (_, Some(repo)) => format!("https://github.com/{repo}"),
            _ => unreachable!("validated at startup"),
        }
    }

    pub fn org_scope(&self) -> bool {
        self.org.is_some()
    }

    /// Labels every runner registers with, base set plus configured extras.
    pub fn registration_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = ["docker-dind", "linux", "self-hosted"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        labels.extend(
            self.runner_labels
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        labels
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn registration_grace(&self) -> Duration {
        Duration::from_secs(self.registration_grace_secs)
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            token: "ghp_test".into(),
            org: None,
            repo: Some("acme/widgets".into()),
            min_runners: 2,
            max_runners: 10,
            scale_up_threshold: 3,
            scale_down_threshold: 1,
            idle_timeout_secs: 300,
            poll_interval_secs: 30,
            registration_grace_secs: 120,
            scale_up_cooldown_secs: 60,
            runner_prefix: "orchestrated".into(),
            runner_name_prefix: "github-runner".into(),
            controller_id: "runner-controller".into(),
            runner_image: "github-runner:latest".into(),
            runner_network: "github-runners".into(),
            runner_labels: String::new(),
            docker_socket: None,
            port: 8080,
            log_level: "info".into(),
            structured_logging: false,
        }
    }

    #[test]
    fn valid_repo_scope_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn org_and_repo_together_rejected() {
        let mut config = base_config();
        config.org = Some("acme".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_scope_rejected() {
        let mut config = base_config();
        config.repo = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn repo_without_owner_rejected() {
        let mut config = base_config();
        config.repo = Some("widgets".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_above_max_rejected() {
        let mut config = base_config();
        config.min_runners = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn poll_interval_below_quota_floor_rejected() {
        let mut config = base_config();
        config.poll_interval_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn scope_paths() {
        let config = base_config();
        assert_eq!(config.scope_path(), "repos/acme/widgets");
        assert_eq!(config.scope_url(), "https://github.com/acme/widgets");

        let mut config = base_config();
        config.repo = None;
        config.org = Some("acme".into());
        assert_eq!(config.scope_path(), "orgs/acme");
        assert_eq!(config.scope_url(), "https://github.com/acme");
    }

    #[test]
    fn registration_labels_include_base_set_and_extras() {
        let mut config = base_config();
        config.runner_labels = "gpu, large".into();
        let labels = config.registration_labels();
        assert_eq!(
            labels,
            vec!["docker-dind", "linux", "self-hosted", "gpu", "large"]
        );
    }

    #[test]
    fn empty_extra_labels_yield_base_set_only() {
        let labels = base_config().registration_labels();
        assert_eq!(labels, vec!["docker-dind", "linux", "self-hosted"]);
    }
}
