//! slipway.toml configuration parser.
//!
//! Durations are kept as the human strings found in the file and resolved
//! through accessor methods, so a malformed value falls back to the
//! documented default instead of aborting the daemon.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration_or;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlipwayConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub listeners: ListenersConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub shift: ShiftConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Expected `registry/repository` for published artifacts.
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Confirm that a published tag exists before enqueueing it.
    pub verify: bool,
    /// Plain-HTTP registry endpoint (host:port) used for manifest lookups.
    pub endpoint: Option<String>,
    pub timeout: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            verify: false,
            endpoint: None,
            timeout: "5s".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// CPU units per instance (1024 = one vCPU).
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_port: u16,
    /// JSON template rendered into the scheduler manifest.
    pub manifest_template: Option<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cpu: 256,
            memory_mib: 512,
            container_port: 8080,
            manifest_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Instance count for a freshly provisioned candidate pool.
    pub desired: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            desired: 2,
            min: 1,
            max: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenersConfig {
    pub production: String,
    pub test: String,
    /// Address of the test listener, used for synthetic checks.
    pub test_address: Option<String>,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            production: "production".to_string(),
            test: "test".to_string(),
            test_address: None,
        }
    }
}

/// How candidate instances are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Ask the scheduler for instance status.
    #[default]
    Scheduler,
    /// HTTP GET against each instance address.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe: ProbeKind,
    /// HTTP path probed when `probe = "http"`.
    pub path: String,
    pub interval: String,
    /// Timeout per probe.
    pub timeout: String,
    /// Consecutive all-healthy rounds required to pass validation.
    pub healthy_threshold: u32,
    /// Consecutive failures of one instance that fail validation.
    pub unhealthy_threshold: u32,
    /// Consecutive `Unknown` results tolerated before they count as failures.
    pub unknown_budget: u32,
    /// Cumulative limit for the health validation phase.
    pub validation_timeout: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Scheduler,
            path: "/healthz".to_string(),
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            unknown_budget: 3,
            validation_timeout: "5m".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(5))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(2))
    }

    pub fn validation_timeout(&self) -> Duration {
        parse_duration_or(&self.validation_timeout, Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Validation window on the test listener.
    pub window: String,
    /// Only an explicit approval ends the window successfully.
    pub require_approval: bool,
    /// Probe the test listener address during the window.
    pub synthetic_checks: bool,
    /// Bounded wait for the candidate to reach its desired count.
    pub provision_timeout: String,
    /// Attempts per scheduler / load-balancer call.
    pub max_attempts: u32,
    pub backoff_base: String,
    pub backoff_max: String,
    /// Time allowed for in-flight requests before a pool is destroyed.
    pub drain_grace: String,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            window: "2m".to_string(),
            require_approval: false,
            synthetic_checks: false,
            provision_timeout: "10m".to_string(),
            max_attempts: 4,
            backoff_base: "500ms".to_string(),
            backoff_max: "10s".to_string(),
            drain_grace: "30s".to_string(),
        }
    }
}

impl TrafficConfig {
    pub fn window(&self) -> Duration {
        parse_duration_or(&self.window, Duration::from_secs(120))
    }

    pub fn provision_timeout(&self) -> Duration {
        parse_duration_or(&self.provision_timeout, Duration::from_secs(600))
    }

    pub fn backoff_base(&self) -> Duration {
        parse_duration_or(&self.backoff_base, Duration::from_millis(500))
    }

    pub fn backoff_max(&self) -> Duration {
        parse_duration_or(&self.backoff_max, Duration::from_secs(10))
    }

    pub fn drain_grace(&self) -> Duration {
        parse_duration_or(&self.drain_grace, Duration::from_secs(30))
    }

    /// Retry policy for scheduler and load-balancer calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base(), self.backoff_max())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShiftMode {
    #[default]
    AllAtOnce,
    Linear,
    Canary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    pub mode: ShiftMode,
    /// Health checkpoints before the swap (`linear`).
    pub steps: u32,
    pub step_interval: String,
    /// Test-listener observation before the swap (`canary`).
    pub observation: String,
    pub bake: String,
    pub rollback_on_alarm: bool,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            mode: ShiftMode::AllAtOnce,
            steps: 4,
            step_interval: "30s".to_string(),
            observation: "5m".to_string(),
            bake: "10m".to_string(),
            rollback_on_alarm: true,
        }
    }
}

impl ShiftConfig {
    pub fn step_interval(&self) -> Duration {
        parse_duration_or(&self.step_interval, Duration::from_secs(30))
    }

    pub fn observation(&self) -> Duration {
        parse_duration_or(&self.observation, Duration::from_secs(300))
    }

    pub fn bake(&self) -> Duration {
        parse_duration_or(&self.bake, Duration::from_secs(600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub backoff_base: String,
    pub backoff_max: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: "1s".to_string(),
            backoff_max: "30s".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn backoff_base(&self) -> Duration {
        parse_duration_or(&self.backoff_base, Duration::from_secs(1))
    }

    pub fn backoff_max(&self) -> Duration {
        parse_duration_or(&self.backoff_max, Duration::from_secs(30))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base(), self.backoff_max())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub interval: String,
    /// Averaging window for the utilization metric.
    pub window: String,
    /// Target CPU utilization percentage.
    pub target_utilization: f64,
    /// Dead band around the target, in percent of the target.
    pub tolerance: f64,
    /// Largest change in instance count per evaluation.
    pub max_step: u32,
    pub scale_up_cooldown: String,
    pub scale_down_cooldown: String,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "30s".to_string(),
            window: "5m".to_string(),
            target_utilization: 60.0,
            tolerance: 10.0,
            max_step: 2,
            scale_up_cooldown: "1m".to_string(),
            scale_down_cooldown: "5m".to_string(),
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(30))
    }

    pub fn window(&self) -> Duration {
        parse_duration_or(&self.window, Duration::from_secs(300))
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        parse_duration_or(&self.scale_up_cooldown, Duration::from_secs(60))
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        parse_duration_or(&self.scale_down_cooldown, Duration::from_secs(300))
    }
}

/// What happens to requests queued behind an active deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Every queued request runs, in submission order.
    #[default]
    RunEachInTurn,
    /// Only the newest queued request runs; older ones are superseded.
    KeepLatest,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    pub policy: QueuePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Simulated instance startup time for the local scheduler.
    pub startup_delay: String,
    /// Base port for local instance addresses.
    pub base_port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            startup_delay: "1s".to_string(),
            base_port: 9000,
        }
    }
}

impl BackendConfig {
    pub fn startup_delay(&self) -> Duration {
        parse_duration_or(&self.startup_delay, Duration::from_secs(1))
    }
}

impl SlipwayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SlipwayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::artifact::split_location(&self.service.repository)
            .map_err(|e| anyhow::anyhow!("service.repository: {e}"))?;
        if self.pools.min > self.pools.max {
            anyhow::bail!("pools.min ({}) exceeds pools.max ({})", self.pools.min, self.pools.max);
        }
        if self.pools.desired == 0 {
            anyhow::bail!("pools.desired must be at least 1");
        }
        if self.listeners.production == self.listeners.test {
            anyhow::bail!("production and test listeners must differ");
        }
        if self.autoscale.target_utilization <= 0.0 {
            anyhow::bail!("autoscale.target_utilization must be positive");
        }
        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            anyhow::bail!("health thresholds must be at least 1");
        }
        Ok(())
    }

    /// Scaffold a minimal slipway.toml for a service.
    pub fn scaffold(name: &str, repository: &str) -> Self {
        Self {
            service: ServiceConfig {
                name: name.to_string(),
                repository: repository.to_string(),
            },
            registry: RegistryConfig::default(),
            task: TaskConfig::default(),
            pools: PoolsConfig::default(),
            listeners: ListenersConfig::default(),
            health: HealthConfig::default(),
            traffic: TrafficConfig::default(),
            shift: ShiftConfig::default(),
            pipeline: PipelineConfig::default(),
            autoscale: AutoscaleConfig::default(),
            queue: QueueConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}
