use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;

/// Directory (relative to the project root) holding orchestrator state.
pub const STATE_DIR: &str = ".foreman";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Batches smaller than this run as a single direct dispatch.
    #[serde(default = "default_low_threshold")]
    pub low_threshold: usize,
    /// Batches at least this large run in a supervised pool.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: usize,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Worker identities are `<prefix>-<n>`.
    #[serde(default = "default_worker_prefix")]
    pub worker_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
            max_pool_size: default_max_pool_size(),
            worker_prefix: default_worker_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default = "default_mainline")]
    pub mainline: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Attempts for a transient fetch/publish failure before blocking.
    #[serde(default = "default_infra_retries")]
    pub infra_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_validation_command")]
    pub validation_command: Vec<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            mainline: default_mainline(),
            remote: default_remote(),
            infra_retries: default_infra_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            validation_command: default_validation_command(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file, relative to the project root.
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

impl ProjectConfig {
    /// Reject settings the dispatcher and pipeline cannot work with.
    ///
    /// # Errors
    ///
    /// Names the first offending key.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.low_threshold < 1 {
            bail!("dispatch.low_threshold must be at least 1");
        }
        if d.high_threshold <= d.low_threshold {
            bail!(
                "dispatch.high_threshold ({}) must exceed low_threshold ({})",
                d.high_threshold,
                d.low_threshold
            );
        }
        if d.max_pool_size == 0 {
            bail!("dispatch.max_pool_size must be at least 1");
        }
        if d.worker_prefix.trim().is_empty() {
            bail!("dispatch.worker_prefix must not be empty");
        }
        if self
            .integration
            .validation_command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            bail!("integration.validation_command must name a program");
        }
        Ok(())
    }

    /// Absolute path of the SQLite database under `project_root`.
    #[must_use]
    pub fn database_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.store.database)
    }
}

/// Load `<root>/.foreman/config.toml`, falling back to defaults when absent,
/// then apply `FOREMAN_*` environment overrides and validate.
///
/// # Errors
///
/// Fails when the file cannot be read or parsed, or the result is invalid.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let mut config = read_project_config(project_root)?;
    apply_env_overrides(&mut config, |key| env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("{}: invalid configuration", ErrorCode::ConfigParseError))?;
    Ok(config)
}

fn read_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_root.join(STATE_DIR).join("config.toml");
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ProjectConfig>(&content).with_context(|| {
        format!(
            "{}: Failed to parse {}",
            ErrorCode::ConfigParseError,
            path.display()
        )
    })
}

fn apply_env_overrides(config: &mut ProjectConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(mainline) = non_empty("FOREMAN_MAINLINE") {
        config.integration.mainline = mainline;
    }
    if let Some(remote) = non_empty("FOREMAN_REMOTE") {
        config.integration.remote = remote;
    }
}

const fn default_low_threshold() -> usize {
    2
}

const fn default_high_threshold() -> usize {
    5
}

const fn default_max_pool_size() -> usize {
    8
}

fn default_worker_prefix() -> String {
    "worker".to_string()
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_backoff_ms() -> u64 {
    2
}

const fn default_max_backoff_ms() -> u64 {
    50
}

fn default_mainline() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

const fn default_infra_retries() -> u32 {
    3
}

const fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_validation_command() -> Vec<String> {
    vec!["cargo".to_string(), "test".to_string()]
}

fn default_database() -> PathBuf {
    PathBuf::from(STATE_DIR).join("graph.sqlite3")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(root: &Path, content: &str) {
        let dir = root.join(STATE_DIR);
        std::fs::create_dir_all(&dir).expect("create state dir");
        std::fs::write(dir.join("config.toml"), content).expect("write config");
    }

    #[test]
    fn missing_project_config_uses_defaults() {
        let root = tempfile::tempdir().expect("tempdir");
        let cfg = read_project_config(root.path()).expect("load should succeed");
        assert_eq!(cfg, ProjectConfig::default());
        assert_eq!(cfg.dispatch.low_threshold, 2);
        assert_eq!(cfg.dispatch.high_threshold, 5);
        assert_eq!(cfg.dispatch.max_pool_size, 8);
        assert_eq!(cfg.integration.mainline, "main");
        assert_eq!(cfg.integration.validation_command, vec!["cargo", "test"]);
        assert_eq!(
            cfg.database_path(root.path()),
            root.path().join(".foreman/graph.sqlite3")
        );
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let root = tempfile::tempdir().expect("tempdir");
        write_config(
            root.path(),
            r#"
[dispatch]
max_pool_size = 3

[integration]
remote = "upstream"
validation_command = ["make", "check"]
"#,
        );
        let cfg = load_project_config(root.path()).expect("load");
        assert_eq!(cfg.dispatch.max_pool_size, 3);
        assert_eq!(cfg.dispatch.high_threshold, 5);
        assert_eq!(cfg.claim.max_attempts, 5);
        assert_eq!(cfg.integration.validation_command, vec!["make", "check"]);
    }

    #[test]
    fn parse_errors_carry_error_code() {
        let root = tempfile::tempdir().expect("tempdir");
        write_config(root.path(), "[dispatch\nlow_threshold = ");
        let err = load_project_config(root.path()).expect_err("must fail");
        assert!(format!("{err:#}").contains("E1001"));
    }

    #[test]
    fn validate_rejects_unusable_thresholds() {
        let mut cfg = ProjectConfig::default();
        cfg.dispatch.high_threshold = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = ProjectConfig::default();
        cfg.dispatch.low_threshold = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ProjectConfig::default();
        cfg.dispatch.max_pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ProjectConfig::default();
        cfg.integration.validation_command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_integration_targets() {
        let mut cfg = ProjectConfig::default();
        apply_env_overrides(&mut cfg, |key| match key {
            "FOREMAN_MAINLINE" => Some("trunk".to_string()),
            "FOREMAN_REMOTE" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.integration.mainline, "trunk");
        assert_eq!(cfg.integration.remote, "origin");
    }
}
