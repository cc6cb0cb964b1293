use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the orchestrator
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Container engine settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Reverse proxy synchronization settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Monitor loop and default auto-shutdown settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Managed service definitions, keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

/// Container engine connection and timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST env var or common socket paths)
    pub host: Option<String>,

    /// Docker network to attach service containers to
    pub network: Option<String>,

    /// Bounded timeout for every container engine call, in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a container
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,
}

impl DockerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            network: None,
            operation_timeout_secs: default_operation_timeout(),
            stop_grace_period_secs: default_stop_grace_period(),
        }
    }
}

/// Reverse proxy synchronization settings
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Admin API endpoint of the running proxy
    #[serde(default = "default_proxy_admin_url")]
    pub admin_url: String,

    /// Path of the proxy configuration file WakeDock manages a section of
    #[serde(default = "default_proxy_config_path")]
    pub config_path: PathBuf,

    /// Timeout for proxy admin API calls, in seconds
    #[serde(default = "default_proxy_admin_timeout")]
    pub admin_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: default_proxy_admin_url(),
            config_path: default_proxy_config_path(),
            admin_timeout_secs: default_proxy_admin_timeout(),
        }
    }
}

/// Monitor loop settings and default auto-shutdown policy
///
/// Per-service values in [`ServiceConfig`] override these defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Interval between metric polling cycles, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How long metric samples are retained per service, in hours
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Default inactivity timeout before a running service is put to sleep
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Default CPU threshold in percent; samples below it count as low
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_percent: f64,

    /// Default memory threshold in megabytes; samples below it count as low
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    /// Default evaluation window for the low-resource rule, in seconds
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window_secs: u64,

    /// Default fraction of window samples that must be low on both CPU and
    /// memory before the low-resource rule fires
    #[serde(default = "default_low_sample_ratio")]
    pub low_sample_ratio: f64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retention_hours: default_retention_hours(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            cpu_threshold_percent: default_cpu_threshold(),
            memory_threshold_mb: default_memory_threshold_mb(),
            evaluation_window_secs: default_evaluation_window(),
            low_sample_ratio: default_low_sample_ratio(),
        }
    }
}

/// Configuration for a single managed service
///
/// Exactly one of `image` and `compose_file` must be set: a service is either
/// a single container launched from an image or a multi-container compose
/// stack.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Container image to run (single-container services)
    pub image: Option<String>,

    /// Compose file describing a multi-container stack
    pub compose_file: Option<PathBuf>,

    /// Host port the service's upstream listens on
    #[serde(default)]
    pub port: u16,

    /// Public domain; a running service with a domain is exposed through the
    /// proxy, one without stays internal
    pub domain: Option<String>,

    /// Terminate TLS for this domain at the proxy (default: true)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Require basic auth at the proxy for this domain
    #[serde(default)]
    pub auth: bool,

    /// Environment variables passed to the container
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Container name override (default: wakedock-{service-id})
    pub container_name: Option<String>,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    // === Auto-shutdown overrides ===
    /// Inactivity timeout in seconds (overrides monitor default)
    pub inactivity_timeout_secs: Option<u64>,

    /// CPU threshold in percent (overrides monitor default)
    pub cpu_threshold_percent: Option<f64>,

    /// Memory threshold in megabytes (overrides monitor default)
    pub memory_threshold_mb: Option<u64>,

    /// Evaluation window in seconds (overrides monitor default)
    pub evaluation_window_secs: Option<u64>,

    /// Required low-sample ratio (overrides monitor default)
    pub low_sample_ratio: Option<f64>,
}

impl ServiceConfig {
    /// Create a single-container service config
    pub fn image(image: &str, port: u16) -> Self {
        Self {
            image: Some(image.to_string()),
            port,
            tls: true,
            ..Self::default()
        }
    }

    /// Create a compose-stack service config
    pub fn stack(compose_file: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            compose_file: Some(compose_file.into()),
            port,
            tls: true,
            ..Self::default()
        }
    }

    /// Set the public domain (builder pattern)
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn inactivity_timeout(&self, defaults: &MonitorConfig) -> Duration {
        Duration::from_secs(
            self.inactivity_timeout_secs
                .unwrap_or(defaults.inactivity_timeout_secs),
        )
    }

    pub fn cpu_threshold_percent(&self, defaults: &MonitorConfig) -> f64 {
        self.cpu_threshold_percent
            .unwrap_or(defaults.cpu_threshold_percent)
    }

    pub fn memory_threshold_bytes(&self, defaults: &MonitorConfig) -> u64 {
        self.memory_threshold_mb
            .unwrap_or(defaults.memory_threshold_mb)
            * 1024
            * 1024
    }

    pub fn evaluation_window(&self, defaults: &MonitorConfig) -> Duration {
        Duration::from_secs(
            self.evaluation_window_secs
                .unwrap_or(defaults.evaluation_window_secs),
        )
    }

    pub fn low_sample_ratio(&self, defaults: &MonitorConfig) -> f64 {
        self.low_sample_ratio.unwrap_or(defaults.low_sample_ratio)
    }

    /// Validate this service's configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        match (&self.image, &self.compose_file) {
            (Some(_), Some(_)) => {
                return Err(format!(
                    "Service '{}': 'image' and 'compose_file' are mutually exclusive",
                    name
                ));
            }
            (None, None) => {
                return Err(format!(
                    "Service '{}': one of 'image' or 'compose_file' is required",
                    name
                ));
            }
            _ => {}
        }

        if self.port == 0 {
            return Err(format!("Service '{}': 'port' must be greater than 0", name));
        }

        if let Some(ref domain) = self.domain {
            if domain.trim().is_empty() {
                return Err(format!("Service '{}': 'domain' must not be empty", name));
            }
        }

        if let Some(ratio) = self.low_sample_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(format!(
                    "Service '{}': 'low_sample_ratio' must be between 0 and 1",
                    name
                ));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_operation_timeout() -> u64 {
    30
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_proxy_admin_url() -> String {
    "http://127.0.0.1:2019".to_string()
}

fn default_proxy_config_path() -> PathBuf {
    PathBuf::from("./Caddyfile")
}

fn default_proxy_admin_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    30
}

fn default_retention_hours() -> u64 {
    24
}

fn default_inactivity_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_cpu_threshold() -> f64 {
    5.0
}

fn default_memory_threshold_mb() -> u64 {
    256
}

fn default_evaluation_window() -> u64 {
    600 // 10 minutes
}

fn default_low_sample_ratio() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, service) in &self.services {
            if let Err(e) = service.validate(name) {
                errors.push(e);
            }
        }

        if !(0.0..=1.0).contains(&self.monitor.low_sample_ratio) {
            errors.push("monitor.low_sample_ratio must be between 0 and 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
