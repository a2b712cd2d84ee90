//! Warden policy configuration
//!
//! A YAML file tunes the ownership fallbacks, expiration thresholds and poll
//! budgets. Every field has a default, and a missing file means "all
//! defaults".
//!
//! ```yaml
//! dry_run: false
//! regions: [us-east-1, us-west-2]
//! ownership:
//!   bypass_types: [security_group, classic_load_balancer]
//! expiration:
//!   grace_days: 3
//! convergence:
//!   instance_termination: { poll_interval_secs: 15, max_attempts: 60 }
//! ```

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use warden_core::expiration::DEFAULT_GRACE_DAYS;
use warden_core::tags::{TAG_BUILD_ID, TAG_EXPIRATION_DATE, TAG_JOB};
use warden_core::{
    EngineSettings, ExpirationPolicy, OwnershipPolicy, PlannerSettings, RetryConfig,
};

/// Environment variable naming the config file directly
pub const CONFIG_PATH_ENV: &str = "WARDEN_CONFIG_PATH";

const CANDIDATES: [&str; 4] = [
    "warden.local.yaml",
    ".warden.local.yaml",
    "warden.yaml",
    ".warden.yaml",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub ownership: OwnershipPolicy,
    pub expiration: ExpirationConfig,
    pub convergence: PlannerSettings,
    pub retry: RetrySection,
    /// Only describe what would be done
    pub dry_run: bool,
    /// Regions to scan; enumeration is left to the caller when empty
    pub regions: Vec<String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            ownership: OwnershipPolicy::default(),
            expiration: ExpirationConfig::default(),
            convergence: PlannerSettings::default(),
            retry: RetrySection::default(),
            dry_run: true,
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    pub grace_days: i64,
    /// VPCs and OIDC providers
    pub required_tags_vpc: Vec<String>,
    /// Elastic IPs, IAM roles and instance profiles
    pub required_tags_global: Vec<String>,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            grace_days: DEFAULT_GRACE_DAYS,
            required_tags_vpc: vec![TAG_EXPIRATION_DATE.to_string(), TAG_BUILD_ID.to_string()],
            required_tags_global: vec![TAG_EXPIRATION_DATE.to_string(), TAG_JOB.to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub volume_delete: FixedRetry,
}

/// Fixed-delay retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedRetry {
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            delay_secs: 5,
        }
    }
}

impl From<FixedRetry> for RetryConfig {
    fn from(retry: FixedRetry) -> Self {
        RetryConfig::fixed(retry.max_attempts, Duration::from_secs(retry.delay_secs))
    }
}

impl WardenConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let config: WardenConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content, path)?;
        info!(path = %path.display(), dry_run = config.dry_run, "Loaded warden config");
        Ok(config)
    }

    /// Load the first config file found, or the defaults when there is none
    pub fn load_or_default() -> Result<Self> {
        match find_config_file() {
            Ok(path) => Self::load(&path),
            Err(ConfigError::ConfigFileNotFound) => {
                debug!("No warden config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.expiration.grace_days < 0 {
            return Err(ConfigError::Invalid(format!(
                "expiration.grace_days must be >= 0, got {}",
                self.expiration.grace_days
            )));
        }
        let polls = [
            ("compute", &self.convergence.compute),
            ("instance_termination", &self.convergence.instance_termination),
            ("nat_gateway", &self.convergence.nat_gateway),
        ];
        for (name, poll) in polls {
            if poll.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "convergence.{name}.max_attempts must be at least 1"
                )));
            }
        }
        if self.retry.volume_delete.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.volume_delete.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn vpc_expiration(&self) -> ExpirationPolicy {
        ExpirationPolicy {
            grace_days: self.expiration.grace_days,
            required_tags: self.expiration.required_tags_vpc.clone(),
        }
    }

    pub fn global_expiration(&self) -> ExpirationPolicy {
        ExpirationPolicy {
            grace_days: self.expiration.grace_days,
            required_tags: self.expiration.required_tags_global.clone(),
        }
    }

    /// Settings for `LifecycleEngine::new`
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            ownership: self.ownership.clone(),
            planner: self.convergence,
            vpc_expiration: self.vpc_expiration(),
            global_expiration: self.global_expiration(),
            volume_retry: self.retry.volume_delete.into(),
            dry_run: self.dry_run,
        }
    }
}

/// Warden's per-user config directory (`~/.config/warden`)
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("warden"))
}

/// Find the warden config file
///
/// Search order:
/// 1. `WARDEN_CONFIG_PATH`
/// 2. current directory: warden.local.yaml, .warden.local.yaml, warden.yaml, .warden.yaml
/// 3. ~/.config/warden/warden.yaml
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join("warden.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}
