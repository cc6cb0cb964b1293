//! Service model and registry
//!
//! A [`Service`] is the unit of orchestration: a named workload with a launch
//! spec, a lifecycle state, and an optional live handle. The
//! [`ServiceRegistry`] owns all services for the process lifetime; every
//! entry sits behind its own async mutex so lifecycle transitions on one
//! service serialize fully while different services stay independent.

use crate::config::{MonitorConfig, ServiceConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No live container or stack
    Stopped,
    /// Launch in progress
    Starting,
    /// Live and serving (exposed through the proxy if a domain is set)
    Running,
    /// Stop in progress
    Stopping,
    /// Last launch or stop failed; a wake retries from here
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Error => write!(f, "error"),
        }
    }
}

/// How a service is launched: a single container or a compose stack
#[derive(Debug, Clone)]
pub enum LaunchSpec {
    Image {
        image: String,
        env: HashMap<String, String>,
        memory: Option<String>,
        cpus: Option<String>,
    },
    Stack {
        compose_file: PathBuf,
    },
}

/// Opaque reference to a live container or stack
///
/// Present on a service only while its state is starting, running, or
/// stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHandle {
    /// Container id returned by the engine
    Container(String),
    /// Compose project name
    Stack { project: String },
}

/// Per-service auto-shutdown policy, resolved from config defaults and
/// per-service overrides
#[derive(Debug, Clone)]
pub struct AutoShutdownPolicy {
    /// A service untouched for this long is put to sleep unconditionally
    pub inactivity_timeout: Duration,
    /// CPU samples below this percentage count as low
    pub cpu_threshold_percent: f64,
    /// Memory samples below this byte count count as low
    pub memory_threshold_bytes: u64,
    /// Only samples within this window are considered by the low-resource rule
    pub evaluation_window: Duration,
    /// Fraction of window samples that must be low on both dimensions
    pub low_sample_ratio: f64,
}

impl AutoShutdownPolicy {
    /// Minimum number of window samples before the low-resource rule may fire
    pub const MIN_SAMPLES: usize = 3;

    pub fn resolve(config: &ServiceConfig, defaults: &MonitorConfig) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout(defaults),
            cpu_threshold_percent: config.cpu_threshold_percent(defaults),
            memory_threshold_bytes: config.memory_threshold_bytes(defaults),
            evaluation_window: config.evaluation_window(defaults),
            low_sample_ratio: config.low_sample_ratio(defaults),
        }
    }
}

/// A managed service
#[derive(Debug, Clone)]
pub struct Service {
    /// Stable id derived from the name
    pub id: String,
    /// Human-readable name from configuration
    pub name: String,
    /// Public domain; presence makes a running service exposed
    pub domain: Option<String>,
    /// Host port the upstream listens on
    pub port: u16,
    /// Terminate TLS at the proxy for this domain
    pub tls: bool,
    /// Require basic auth at the proxy for this domain
    pub auth: bool,
    /// How the service is launched
    pub launch: LaunchSpec,
    /// Deterministic container name (single-container services)
    pub container_name: String,
    /// Current lifecycle state
    pub state: ServiceState,
    /// Live handle; present iff state is starting/running/stopping
    pub handle: Option<ServiceHandle>,
    /// Auto-shutdown policy for the monitor
    pub policy: AutoShutdownPolicy,
    /// Last time traffic targeted this service
    pub last_accessed: DateTime<Utc>,
}

impl Service {
    /// Build a service from its configuration entry
    pub fn from_config(name: &str, config: &ServiceConfig, defaults: &MonitorConfig) -> Self {
        let id = service_id(name);
        let launch = if let Some(ref compose_file) = config.compose_file {
            LaunchSpec::Stack {
                compose_file: compose_file.clone(),
            }
        } else {
            LaunchSpec::Image {
                image: config.image.clone().unwrap_or_default(),
                env: config.env.clone(),
                memory: config.memory.clone(),
                cpus: config.cpus.clone(),
            }
        };
        let container_name = config
            .container_name
            .clone()
            .unwrap_or_else(|| format!("wakedock-{}", id));

        Self {
            id,
            name: name.to_string(),
            domain: config.domain.clone(),
            port: config.port,
            tls: config.tls,
            auth: config.auth,
            launch,
            container_name,
            state: ServiceState::Stopped,
            handle: None,
            policy: AutoShutdownPolicy::resolve(config, defaults),
            last_accessed: Utc::now(),
        }
    }

    /// Upstream address the proxy dials for this service
    pub fn upstream(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// A service is exposed iff it is running and has a domain
    pub fn exposed(&self) -> bool {
        self.state == ServiceState::Running && self.domain.is_some()
    }

    /// The proxy route for this service, if exposed
    pub fn route(&self) -> Option<ProxyRoute> {
        if !self.exposed() {
            return None;
        }
        Some(ProxyRoute {
            service_id: self.id.clone(),
            domain: self.domain.clone()?,
            upstream: self.upstream(),
            tls: self.tls,
            auth: self.auth,
        })
    }

    /// Plain-data snapshot for the API boundary
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            domain: self.domain.clone(),
            port: self.port,
            state: self.state,
            exposed: self.exposed(),
            last_accessed: self.last_accessed,
        }
    }
}

/// Derive a stable service id from a configured name
pub fn service_id(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// One proxy route, generated on demand from an exposed service
///
/// Never persisted independently: the route set is always recomputed from the
/// registry, which keeps the synchronizer idempotent and crash-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub service_id: String,
    pub domain: String,
    pub upstream: String,
    pub tls: bool,
    pub auth: bool,
}

/// Plain-data view of a service, free of framework types
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
    pub port: u16,
    pub state: ServiceState,
    pub exposed: bool,
    pub last_accessed: DateTime<Utc>,
}

/// Registry of all managed services
///
/// Constructed once at startup from configuration and passed by `Arc` to the
/// orchestrator and monitor. Entries are `Arc<Mutex<Service>>`: a lifecycle
/// transition holds the entry mutex across its adapter calls, so one in-flight
/// wake and one in-flight sleep for the same service cannot interleave.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Mutex<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Materialize all services from configuration
    pub fn from_config(
        services: &HashMap<String, ServiceConfig>,
        defaults: &MonitorConfig,
    ) -> Self {
        let registry = Self::new();
        for (name, config) in services {
            registry.insert(Service::from_config(name, config, defaults));
        }
        registry
    }

    pub fn insert(&self, service: Service) {
        self.services
            .insert(service.id.clone(), Arc::new(Mutex::new(service)));
    }

    /// Remove a service entry; callers must force it to stopped first
    pub fn remove(&self, id: &str) -> bool {
        self.services.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Service>>> {
        self.services.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Current set of exposed routes
    ///
    /// Waits on every entry lock, so a snapshot taken while another task
    /// briefly holds an entry still sees that service. Callers must not hold
    /// any entry guard of their own when taking a snapshot.
    pub async fn exposed_routes(&self) -> Vec<ProxyRoute> {
        let entries: Vec<Arc<Mutex<Service>>> = self
            .services
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut routes = Vec::new();
        for entry in entries {
            if let Some(route) = entry.lock().await.route() {
                routes.push(route);
            }
        }
        routes.sort_by(|a, b| a.domain.cmp(&b.domain));
        routes
    }

    /// Plain-data snapshots of all services
    pub async fn infos(&self) -> Vec<ServiceInfo> {
        let entries: Vec<Arc<Mutex<Service>>> = self
            .services
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.lock().await.info());
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn test_service(name: &str, domain: Option<&str>) -> Service {
        let mut config = ServiceConfig::image("nginx:latest", 8080);
        config.domain = domain.map(String::from);
        Service::from_config(name, &config, &MonitorConfig::default())
    }

    #[test]
    fn test_service_id_derivation() {
        assert_eq!(service_id("web1"), "web1");
        assert_eq!(service_id("My App"), "my-app");
        assert_eq!(service_id("api.staging"), "api-staging");
        assert_eq!(service_id(" db_main "), "db-main");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Stopped.to_string(), "stopped");
        assert_eq!(ServiceState::Starting.to_string(), "starting");
        assert_eq!(ServiceState::Running.to_string(), "running");
        assert_eq!(ServiceState::Error.to_string(), "error");
    }

    #[test]
    fn test_exposure_requires_running_and_domain() {
        let mut service = test_service("web1", Some("web.example.com"));
        assert!(!service.exposed());
        assert!(service.route().is_none());

        service.state = ServiceState::Running;
        assert!(service.exposed());
        let route = service.route().unwrap();
        assert_eq!(route.domain, "web.example.com");
        assert_eq!(route.upstream, "127.0.0.1:8080");

        let mut internal = test_service("worker", None);
        internal.state = ServiceState::Running;
        assert!(!internal.exposed());
        assert!(internal.route().is_none());
    }

    #[test]
    fn test_deterministic_container_name() {
        let service = test_service("My App", None);
        assert_eq!(service.container_name, "wakedock-my-app");

        let mut config = ServiceConfig::image("nginx:latest", 8080);
        config.container_name = Some("legacy-name".to_string());
        let service = Service::from_config("web1", &config, &MonitorConfig::default());
        assert_eq!(service.container_name, "legacy-name");
    }

    #[test]
    fn test_env_flows_into_launch_spec() {
        let mut env = HashMap::new();
        env.insert("RAILS_ENV".to_string(), "production".to_string());
        let config = ServiceConfig::image("app:1", 3000).with_env(env);

        let service = Service::from_config("app", &config, &MonitorConfig::default());
        match service.launch {
            LaunchSpec::Image { env, .. } => {
                assert_eq!(env["RAILS_ENV"], "production");
            }
            LaunchSpec::Stack { .. } => panic!("expected an image launch"),
        }
    }

    #[test]
    fn test_registry_from_config() {
        let mut services = HashMap::new();
        services.insert(
            "web1".to_string(),
            ServiceConfig::image("nginx:latest", 8080).with_domain("web.example.com"),
        );
        services.insert("worker".to_string(), ServiceConfig::image("worker:1", 9000));

        let registry = ServiceRegistry::from_config(&services, &MonitorConfig::default());
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("web1"));
        assert!(registry.contains("worker"));
        assert!(registry.get("unknown").is_none());
    }

    #[tokio::test]
    async fn test_exposed_routes_reflect_running_services() {
        let registry = ServiceRegistry::new();
        let mut web = test_service("web1", Some("web.example.com"));
        web.state = ServiceState::Running;
        web.handle = Some(ServiceHandle::Container("abc".to_string()));
        registry.insert(web);
        registry.insert(test_service("api1", Some("api.example.com")));

        let routes = registry.exposed_routes().await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].domain, "web.example.com");
    }

    #[tokio::test]
    async fn test_infos_sorted_by_id() {
        let registry = ServiceRegistry::new();
        registry.insert(test_service("zeta", None));
        registry.insert(test_service("alpha", None));

        let infos = registry.infos().await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "alpha");
        assert_eq!(infos[1].id, "zeta");
    }

    #[test]
    fn test_policy_resolution() {
        let mut config = ServiceConfig::image("nginx:latest", 8080);
        config.cpu_threshold_percent = Some(2.5);
        let policy = AutoShutdownPolicy::resolve(&config, &MonitorConfig::default());

        assert_eq!(policy.cpu_threshold_percent, 2.5);
        assert_eq!(policy.inactivity_timeout, Duration::from_secs(1800));
        assert_eq!(policy.low_sample_ratio, 0.8);
    }
}
