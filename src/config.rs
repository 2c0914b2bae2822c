use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// How the retrying inventory client spaces out attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Timeout and retry policy for inventory RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Extra attempts after the first one fails with a transient error
    pub max_retries: u32,
    /// Delay before the first retry
    pub retry_delay_ms: u64,
    /// Upper bound for exponential backoff
    pub max_retry_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5 * 60 * 1000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 60_000,
            backoff: Backoff::Fixed,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms;
        let delay_ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                base.saturating_mul(factor).min(self.max_retry_delay_ms)
            }
        };
        Duration::from_millis(delay_ms)
    }
}

/// Shard identity and heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Whether this process runs as a shard of the central scheduler.
    pub is_shard: bool,
    /// Hostname the master knows this shard by.
    pub shard_hostname: Option<String>,
    pub heartbeat_interval_ms: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            is_shard: false,
            shard_hostname: None,
            heartbeat_interval_ms: 60_000,
        }
    }
}

impl ShardConfig {
    pub fn shard(hostname: impl Into<String>) -> Self {
        Self {
            is_shard: true,
            shard_hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The shard hostname, or an error if this process is not a shard.
    pub fn shard_hostname(&self) -> Result<&str> {
        if !self.is_shard {
            return Err(LabError::NotAShard(
                "is_shard is false in the shard configuration".to_string(),
            ));
        }
        match self.shard_hostname.as_deref().map(str::trim) {
            Some(hostname) if !hostname.is_empty() => Ok(hostname),
            _ => Err(LabError::NotAShard(
                "shard_hostname must neither be missing nor empty".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Directory holding one lease file per running job.
    pub lease_dir: PathBuf,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_dir: PathBuf::from("/var/lib/lab-scheduler/leases"),
        }
    }
}

/// One `[[scheduler.tasks]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    pub suite: String,
    /// Keyword of the event that triggers this task, e.g. "nightly".
    pub run_on: String,
    #[serde(default)]
    pub branch_specs: Vec<String>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub num: Option<u32>,
    #[serde(default)]
    pub one_shot: bool,
}

/// Suite scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub nightly_hour: u32,
    /// Day of week for the weekly event, 0 = Monday.
    pub weekly_day: u32,
    pub weekly_hour: u32,
    pub job_timeout_mins: u32,
    pub boards: Vec<String>,
    pub tasks: Vec<TaskConfig>,
    /// board -> branch -> builds, used when no build service is wired in.
    pub builds: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            nightly_hour: 21,
            weekly_day: 5,
            weekly_hour: 23,
            job_timeout_mins: 24 * 60,
            boards: Vec::new(),
            tasks: Vec::new(),
            builds: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub shard: ShardConfig,
    pub lease: LeaseConfig,
    pub rpc: RpcConfig,
    pub scheduler: SchedulerConfig,
    /// Name recorded on hosts this process locks. Defaults to user@pid.
    pub lock_owner: Option<String>,
}

impl LabConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| LabError::filesystem(path, e))?;
        Self::from_toml_str(&raw)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: LabConfig =
            toml::from_str(raw).map_err(|e| LabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard.heartbeat_interval_ms == 0 {
            return Err(LabError::Config(
                "shard.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(LabError::Config(
                "scheduler.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.nightly_hour > 23 || self.scheduler.weekly_hour > 23 {
            return Err(LabError::Config("trigger hours must be within 0..=23".to_string()));
        }
        if self.scheduler.weekly_day > 6 {
            return Err(LabError::Config(
                "scheduler.weekly_day must be within 0..=6".to_string(),
            ));
        }
        if self.rpc.timeout_ms == 0 {
            return Err(LabError::Config("rpc.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_owner(&self) -> String {
        self.lock_owner.clone().unwrap_or_else(default_lock_owner)
    }
}

pub fn default_lock_owner() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "lab-scheduler".to_string());
    format!("{}@{}", user, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_config_default() {
        let cfg = RpcConfig::default();
        assert_eq!(cfg.timeout(), Duration::from_secs(300));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.backoff, Backoff::Fixed);
        assert_eq!(cfg.retry_delay(1), Duration::from_secs(5));
        assert_eq!(cfg.retry_delay(3), Duration::from_secs(5));
    }

    #[test]
    fn exponential_retry_delay_is_capped() {
        let cfg = RpcConfig {
            retry_delay_ms: 100,
            max_retry_delay_ms: 350,
            backoff: Backoff::Exponential,
            ..Default::default()
        };
        assert_eq!(cfg.retry_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.retry_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.retry_delay(3), Duration::from_millis(350));
        assert_eq!(cfg.retry_delay(70), Duration::from_millis(350));
    }

    #[test]
    fn shard_config_default_is_not_a_shard() {
        let cfg = ShardConfig::default();
        assert!(!cfg.is_shard);
        assert!(matches!(cfg.shard_hostname(), Err(LabError::NotAShard(_))));
    }

    #[test]
    fn shard_config_rejects_blank_hostname() {
        let mut cfg = ShardConfig::shard("  ");
        assert!(matches!(cfg.shard_hostname(), Err(LabError::NotAShard(_))));
        cfg.shard_hostname = None;
        assert!(cfg.shard_hostname().is_err());
    }

    #[test]
    fn shard_config_builder() {
        let cfg = ShardConfig::shard("shard1.lab").with_heartbeat_interval_ms(250);
        assert_eq!(cfg.shard_hostname().unwrap(), "shard1.lab");
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(250));
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.nightly_hour, 21);
        assert_eq!(cfg.weekly_day, 5);
        assert_eq!(cfg.weekly_hour, 23);
        assert!(cfg.tasks.is_empty());
    }

    #[test]
    fn lab_config_from_toml() {
        let raw = r#"
            lock_owner = "reaper@lab"

            [shard]
            is_shard = true
            shard_hostname = "shard2.lab"
            heartbeat_interval_ms = 1000

            [lease]
            lease_dir = "/tmp/leases"

            [rpc]
            max_retries = 5
            backoff = "exponential"

            [scheduler]
            boards = ["link", "lumpy"]

            [[scheduler.tasks]]
            name = "NightlyBvt"
            suite = "bvt"
            run_on = "nightly"
            branch_specs = [">=R20"]
            pool = "bvt"
            num = 2

            [scheduler.builds.link]
            R21 = ["link-release/R21-2000.0.0"]
        "#;
        let cfg = LabConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.lock_owner(), "reaper@lab");
        assert_eq!(cfg.shard.shard_hostname().unwrap(), "shard2.lab");
        assert_eq!(cfg.lease.lease_dir, PathBuf::from("/tmp/leases"));
        assert_eq!(cfg.rpc.max_retries, 5);
        assert_eq!(cfg.rpc.backoff, Backoff::Exponential);
        assert_eq!(cfg.rpc.timeout_ms, RpcConfig::default().timeout_ms);
        assert_eq!(cfg.scheduler.boards, vec!["link", "lumpy"]);
        assert_eq!(cfg.scheduler.tasks.len(), 1);
        assert_eq!(cfg.scheduler.tasks[0].num, Some(2));
        assert!(!cfg.scheduler.tasks[0].one_shot);
        assert_eq!(
            cfg.scheduler.builds["link"]["R21"],
            vec!["link-release/R21-2000.0.0".to_string()]
        );
    }

    #[test]
    fn lab_config_rejects_unknown_task_keys() {
        let raw = r#"
            [[scheduler.tasks]]
            name = "Bad"
            suite = "bvt"
            run_on = "nightly"
            colour = "blue"
        "#;
        assert!(matches!(
            LabConfig::from_toml_str(raw),
            Err(LabError::Config(_))
        ));
    }

    #[test]
    fn lab_config_validates_ranges() {
        let raw = r#"
            [scheduler]
            weekly_day = 7
        "#;
        assert!(LabConfig::from_toml_str(raw).is_err());

        let raw = r#"
            [shard]
            heartbeat_interval_ms = 0
        "#;
        assert!(LabConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn default_lock_owner_mentions_pid() {
        let owner = default_lock_owner();
        assert!(owner.ends_with(&format!("@{}", std::process::id())));
    }
}
