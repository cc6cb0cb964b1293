//! End-to-end lifecycle tests against an in-memory container runtime
//!
//! These drive the public API the way the (out-of-scope) HTTP layer would:
//! wake and sleep services, let the monitor enforce policies, and check that
//! the proxy file on disk always matches the set of running exposed services.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wakedock::config::{DockerConfig, MonitorConfig, ProxyConfig, ServiceConfig};
use wakedock::docker::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, PruneReport,
    RuntimeStats, SharedRuntime,
};
use wakedock::monitor::Monitor;
use wakedock::orchestrator::Orchestrator;
use wakedock::proxy::{ProxySynchronizer, MANAGED_END, MANAGED_START};
use wakedock::service::{ServiceRegistry, ServiceState};

#[derive(Default)]
struct FakeRuntime {
    running: Mutex<HashSet<String>>,
    /// Next stats reading handed out for any container
    stats: Mutex<RuntimeStats>,
}

impl FakeRuntime {
    fn set_stats(&self, cpu_delta: u64, memory_usage: u64) {
        *self.stats.lock() = RuntimeStats {
            cpu_delta,
            system_cpu_delta: 1000,
            online_cpus: 1,
            memory_usage,
            memory_limit: 1024 * 1024 * 1024,
            ..Default::default()
        };
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.running.lock().insert(spec.name.clone());
        Ok(spec.name.clone())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> anyhow::Result<()> {
        self.running.lock().remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> anyhow::Result<Option<ContainerStatus>> {
        if self.running.lock().contains(id) {
            Ok(Some(ContainerStatus {
                running: true,
                status: "running".to_string(),
                created_at: None,
            }))
        } else {
            Ok(None)
        }
    }

    async fn container_stats(&self, id: &str) -> anyhow::Result<Option<RuntimeStats>> {
        if self.running.lock().contains(id) {
            Ok(Some(self.stats.lock().clone()))
        } else {
            Ok(None)
        }
    }

    async fn list_containers(&self, _label: Option<&str>) -> anyhow::Result<Vec<ContainerSummary>> {
        Ok(self
            .running
            .lock()
            .iter()
            .map(|name| ContainerSummary {
                id: name.clone(),
                name: name.clone(),
                running: true,
            })
            .collect())
    }

    async fn container_logs(
        &self,
        _id: &str,
        _tail: usize,
        _since: Option<i64>,
    ) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn launch_stack(&self, _compose_file: &Path, project: &str) -> anyhow::Result<()> {
        self.running.lock().insert(format!("{}-web-1", project));
        Ok(())
    }

    async fn stop_stack(&self, _compose_file: &Path, project: &str) -> anyhow::Result<()> {
        self.running.lock().remove(&format!("{}-web-1", project));
        Ok(())
    }

    async fn prune_system(&self) -> anyhow::Result<PruneReport> {
        Ok(PruneReport::default())
    }
}

struct World {
    orchestrator: Arc<Orchestrator>,
    runtime: Arc<FakeRuntime>,
    monitor_config: MonitorConfig,
    caddyfile: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn world(services: HashMap<String, ServiceConfig>) -> World {
    let dir = tempfile::tempdir().unwrap();
    let caddyfile = dir.path().join("Caddyfile");

    let proxy_config = ProxyConfig {
        admin_url: "http://127.0.0.1:1".to_string(),
        config_path: caddyfile.clone(),
        admin_timeout_secs: 1,
    };
    let proxy = Arc::new(ProxySynchronizer::new(&proxy_config).unwrap());

    let monitor_config = MonitorConfig {
        poll_interval_secs: 1,
        ..MonitorConfig::default()
    };

    let registry = Arc::new(ServiceRegistry::from_config(&services, &monitor_config));
    let runtime = Arc::new(FakeRuntime::default());
    runtime.set_stats(50, 128 * 1024 * 1024);
    let orchestrator = Orchestrator::new(
        registry,
        Arc::clone(&runtime) as SharedRuntime,
        proxy,
        &DockerConfig::default(),
    );

    World {
        orchestrator,
        runtime,
        monitor_config,
        caddyfile,
        _dir: dir,
    }
}

fn managed_section(caddyfile: &Path) -> String {
    let content = std::fs::read_to_string(caddyfile).unwrap();
    let start = content.find(MANAGED_START).unwrap();
    let end = content.find(MANAGED_END).unwrap();
    content[start..end].to_string()
}

async fn state_of(world: &World, id: &str) -> ServiceState {
    world
        .orchestrator
        .get_service(id)
        .await
        .map(|info| info.state)
        .unwrap()
}

#[tokio::test]
async fn wake_publishes_exactly_the_exposed_services() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080).with_domain("api.example.com"),
    );
    services.insert(
        "worker".to_string(),
        ServiceConfig::image("ghcr.io/acme/worker:latest", 9090),
    );
    let w = world(services);

    w.orchestrator.wake("api").await.unwrap();
    w.orchestrator.wake("worker").await.unwrap();

    assert_eq!(state_of(&w, "api").await, ServiceState::Running);
    assert_eq!(state_of(&w, "worker").await, ServiceState::Running);

    // only the exposed service appears in the managed section
    let section = managed_section(&w.caddyfile);
    assert!(section.contains("api.example.com"));
    assert!(section.contains("reverse_proxy 127.0.0.1:8080"));
    assert!(!section.contains("9090"));
}

#[tokio::test]
async fn sleep_withdraws_the_route_and_keeps_operator_content() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080).with_domain("api.example.com"),
    );
    let w = world(services);

    // operator-authored content around the managed markers
    std::fs::write(
        &w.caddyfile,
        format!(
            "admin.example.org {{\n\trespond \"ops\"\n}}\n\n{}\n{}\n",
            MANAGED_START, MANAGED_END
        ),
    )
    .unwrap();

    w.orchestrator.wake("api").await.unwrap();
    let content = std::fs::read_to_string(&w.caddyfile).unwrap();
    assert!(content.contains("admin.example.org"));
    assert!(content.contains("api.example.com"));

    w.orchestrator.sleep("api").await.unwrap();
    let content = std::fs::read_to_string(&w.caddyfile).unwrap();
    assert!(content.contains("admin.example.org"));
    assert!(!content.contains("api.example.com"));
    assert!(!w.runtime.running.lock().contains("wakedock-api"));
}

#[tokio::test]
async fn handle_follows_state_across_a_full_lifecycle() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080),
    );
    let w = world(services);
    let entry = w.orchestrator.registry().get("api").unwrap();

    // stopped: no handle
    assert!(entry.lock().await.handle.is_none());

    w.orchestrator.wake("api").await.unwrap();
    {
        let service = entry.lock().await;
        assert_eq!(service.state, ServiceState::Running);
        assert!(service.handle.is_some());
    }

    w.orchestrator.restart("api").await.unwrap();
    {
        let service = entry.lock().await;
        assert_eq!(service.state, ServiceState::Running);
        assert!(service.handle.is_some());
    }

    w.orchestrator.sleep("api").await.unwrap();
    {
        let service = entry.lock().await;
        assert_eq!(service.state, ServiceState::Stopped);
        assert!(service.handle.is_none());
    }
}

#[tokio::test]
async fn snapshot_waits_for_busy_entries_instead_of_dropping_routes() {
    let mut services = HashMap::new();
    services.insert(
        "alpha".to_string(),
        ServiceConfig::image("ghcr.io/acme/alpha:latest", 8080).with_domain("alpha.example.com"),
    );
    services.insert(
        "beta".to_string(),
        ServiceConfig::image("ghcr.io/acme/beta:latest", 8081).with_domain("beta.example.com"),
    );
    let w = world(services);

    w.orchestrator.wake("alpha").await.unwrap();
    w.orchestrator.wake("beta").await.unwrap();

    // Hold alpha's entry lock, the way a stats or touch reader would, while
    // beta's sleep regenerates the proxy file
    let alpha = w.orchestrator.registry().get("alpha").unwrap();
    let guard = alpha.lock().await;

    let orchestrator = Arc::clone(&w.orchestrator);
    let sleeping = tokio::spawn(async move { orchestrator.sleep("beta").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(guard);
    sleeping.await.unwrap().unwrap();

    // alpha is still running and exposed, so its route must survive the
    // regeneration that removed beta's
    let section = managed_section(&w.caddyfile);
    assert!(section.contains("alpha.example.com"));
    assert!(!section.contains("beta.example.com"));
    assert_eq!(state_of(&w, "alpha").await, ServiceState::Running);
}

#[tokio::test]
async fn monitor_sleeps_an_inactive_service() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080).with_domain("api.example.com"),
    );
    let w = world(services);

    w.orchestrator.wake("api").await.unwrap();

    // backdate the last access beyond the inactivity timeout
    {
        let entry = w.orchestrator.registry().get("api").unwrap();
        entry.lock().await.last_accessed =
            Utc::now() - chrono::Duration::seconds(1801);
    }

    let monitor = Monitor::new(Arc::clone(&w.orchestrator), w.monitor_config.clone());
    monitor.cycle().await.unwrap();

    assert_eq!(state_of(&w, "api").await, ServiceState::Stopped);
    let section = managed_section(&w.caddyfile);
    assert!(!section.contains("api.example.com"));
}

#[tokio::test]
async fn monitor_leaves_an_active_service_alone() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080),
    );
    let w = world(services);
    // busy stats keep the low-resource rule quiet even after many cycles
    w.runtime.set_stats(900, 900 * 1024 * 1024);

    w.orchestrator.wake("api").await.unwrap();
    w.orchestrator.touch("api").await;

    let monitor = Monitor::new(Arc::clone(&w.orchestrator), w.monitor_config.clone());
    for _ in 0..5 {
        monitor.cycle().await.unwrap();
    }

    assert_eq!(state_of(&w, "api").await, ServiceState::Running);
    assert!(!monitor.get_service_metrics("api", 1).is_empty());
}

#[tokio::test]
async fn monitor_collects_history_and_summaries() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080),
    );
    let w = world(services);

    w.orchestrator.wake("api").await.unwrap();
    w.orchestrator.touch("api").await;

    let monitor = Monitor::new(Arc::clone(&w.orchestrator), w.monitor_config.clone());
    monitor.cycle().await.unwrap();
    monitor.cycle().await.unwrap();

    let samples = monitor.get_service_metrics("api", 1);
    assert_eq!(samples.len(), 2);
    // 50/1000 * 1 cpu * 100
    assert!((samples[0].cpu_percent - 5.0).abs() < 1e-9);

    let summary = monitor.get_metrics_summary("api", 1).unwrap();
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.max_memory_bytes, 128 * 1024 * 1024);

    let overview = monitor.get_system_overview().await;
    assert_eq!(overview.services_total, 1);
    assert_eq!(overview.services_running, 1);
    assert_eq!(overview.total_memory_bytes, 128 * 1024 * 1024);
}

#[tokio::test]
async fn restarted_process_adopts_and_republishes_running_services() {
    let mut services = HashMap::new();
    services.insert(
        "api".to_string(),
        ServiceConfig::image("ghcr.io/acme/api:latest", 8080).with_domain("api.example.com"),
    );
    let w = world(services);

    // the engine still runs the container under its deterministic name
    w.runtime.running.lock().insert("wakedock-api".to_string());

    w.orchestrator.reconcile_all().await;

    assert_eq!(state_of(&w, "api").await, ServiceState::Running);
    let section = managed_section(&w.caddyfile);
    assert!(section.contains("api.example.com"));

    // and the adopted service can be slept normally
    w.orchestrator.sleep("api").await.unwrap();
    assert_eq!(state_of(&w, "api").await, ServiceState::Stopped);
    assert!(!w.runtime.running.lock().contains("wakedock-api"));
}
