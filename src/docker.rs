//! Container Runtime Adapter
//!
//! Thin façade over the container engine's administrative API. The
//! [`ContainerRuntime`] trait is the seam the orchestrator and monitor talk
//! through; [`DockerRuntime`] implements it against the Docker daemon via
//! bollard, and compose stacks are driven through the `docker compose` CLI.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Label attached to every container WakeDock creates
pub const SERVICE_LABEL: &str = "wakedock.service";

/// Everything needed to create and start a single service container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Deterministic container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Host port bound to the same container port
    pub port: u16,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Docker network to attach to
    pub network: Option<String>,
    /// Memory limit string (e.g. "512m")
    pub memory: Option<String>,
    /// CPU limit string (e.g. "0.5")
    pub cpus: Option<String>,
    /// Labels to attach
    pub labels: HashMap<String, String>,
}

/// Live status of a container as reported by the engine
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub running: bool,
    pub status: String,
    pub created_at: Option<String>,
}

/// Raw resource counters for one container
///
/// CPU values are deltas between the engine's current and previous readings;
/// callers derive percentages from them.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub cpu_delta: u64,
    pub system_cpu_delta: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

impl RuntimeStats {
    /// CPU usage percentage using the engine's delta formula
    pub fn cpu_percent(&self) -> f64 {
        if self.system_cpu_delta == 0 {
            return 0.0;
        }
        (self.cpu_delta as f64 / self.system_cpu_delta as f64)
            * self.online_cpus.max(1) as f64
            * 100.0
    }
}

/// One container in a listing
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub running: bool,
}

/// Result of a system prune
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub containers: usize,
    pub images: usize,
    pub networks: usize,
    pub volumes: usize,
    pub reclaimed_bytes: u64,
}

/// Administrative interface of the container engine
///
/// Kept behind a trait so the orchestrator and monitor can be exercised
/// against an in-memory runtime in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, reusing an existing container with the
    /// same name if one is present and merely stopped. Returns the container
    /// id.
    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Stop a container gracefully; already-stopped and missing containers
    /// are not errors
    async fn stop_container(&self, id: &str, grace: Duration) -> anyhow::Result<()>;

    /// Inspect a container; `None` if it does not exist
    async fn inspect_container(&self, id: &str) -> anyhow::Result<Option<ContainerStatus>>;

    /// One-shot resource reading; `None` if the container is gone or the
    /// engine has no data for it
    async fn container_stats(&self, id: &str) -> anyhow::Result<Option<RuntimeStats>>;

    /// List containers, optionally filtered by a `key=value` label
    async fn list_containers(&self, label: Option<&str>) -> anyhow::Result<Vec<ContainerSummary>>;

    /// Fetch the last `tail` log lines of a container
    async fn container_logs(
        &self,
        id: &str,
        tail: usize,
        since: Option<i64>,
    ) -> anyhow::Result<String>;

    /// Bring up a compose stack
    async fn launch_stack(&self, compose_file: &Path, project: &str) -> anyhow::Result<()>;

    /// Tear down a compose stack
    async fn stop_stack(&self, compose_file: &Path, project: &str) -> anyhow::Result<()>;

    /// Prune stopped containers, dangling images, unused networks and volumes
    async fn prune_system(&self) -> anyhow::Result<PruneReport>;
}

/// Shared runtime handle
pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// [`ContainerRuntime`] implementation backed by the Docker daemon
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        // Verify connection
        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure dockerd or a compatible daemon is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        // Try common socket paths
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }

            if Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. \
                 Start dockerd or set DOCKER_HOST. Underlying error: {}",
                e
            )
        })
    }

    /// Pull an image if it is not present locally
    async fn pull_image_if_missing(&self, image: &str) -> anyhow::Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        anyhow::bail!("Failed to pull image '{}': {}", image, error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        anyhow::bail!(
                            "Image '{}' not found in registry. \
                             Check the image name and tag are correct.",
                            image
                        );
                    }
                    anyhow::bail!("Failed to pull image '{}': {}", image, e);
                }
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    /// Run `docker compose` with the given arguments
    async fn compose(&self, compose_file: &Path, project: &str, args: &[&str]) -> anyhow::Result<()> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(compose_file)
            .arg("-p")
            .arg(project)
            .args(args);

        let output = cmd
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run docker compose: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "docker compose {} failed for project '{}': {}",
                args.first().unwrap_or(&""),
                project,
                stderr.trim()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        // Reuse an existing container with this name if it is merely stopped
        match self.client.inspect_container(&spec.name, None).await {
            Ok(existing) => {
                let id = existing.id.clone().unwrap_or_else(|| spec.name.clone());
                let running = existing
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if running {
                    debug!(name = %spec.name, "Container already running");
                    return Ok(id);
                }
                info!(name = %spec.name, "Reusing stopped container");
                self.client
                    .start_container(&id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("Failed to start existing container '{}': {}", spec.name, e)
                    })?;
                return Ok(id);
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => {
                anyhow::bail!("Failed to inspect container '{}': {}", spec.name, e);
            }
        }

        self.pull_image_if_missing(&spec.image).await?;

        // Build environment variables
        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", spec.port));

        // Bind the host port to the same container port, loopback only; the
        // proxy is the public entry point
        let port_key = format!("{}/tcp", spec.port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        if let Some(ref memory) = spec.memory {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = spec.cpus {
            let cpu_count: f64 = cpus
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
            host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
        }

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated")
                    || err_str.contains("address already in use")
                {
                    anyhow::anyhow!(
                        "Port {} is already in use. Stop the conflicting service or \
                         configure a different port.",
                        spec.port
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        spec.name,
                        spec.image,
                        e
                    )
                }
            })?;

        let container_id = response.id;
        debug!(name = %spec.name, container_id, image = %spec.image, "Created container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                anyhow::anyhow!("Failed to start container '{}' (id: {}): {}", spec.name, container_id, e)
            })?;

        info!(name = %spec.name, container_id, "Started container");
        Ok(container_id)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    async fn inspect_container(&self, id: &str) -> anyhow::Result<Option<ContainerStatus>> {
        match self.client.inspect_container(id, None).await {
            Ok(info) => {
                let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);
                let status = info
                    .state
                    .as_ref()
                    .and_then(|s| s.status)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(Some(ContainerStatus {
                    running,
                    status,
                    created_at: info.created,
                }))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to inspect container: {}", e)),
        }
    }

    async fn container_stats(&self, id: &str) -> anyhow::Result<Option<RuntimeStats>> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.client.stats(id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }))
            | None => return Ok(None),
            Some(Err(e)) => return Err(anyhow::anyhow!("Failed to read container stats: {}", e)),
        };

        let cpu_total = stats.cpu_stats.cpu_usage.total_usage;
        let precpu_total = stats.precpu_stats.cpu_usage.total_usage;
        let system = stats.cpu_stats.system_cpu_usage.unwrap_or(0);
        let presystem = stats.precpu_stats.system_cpu_usage.unwrap_or(0);

        let (net_rx, net_tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(r, w), entry| {
                    match entry.op.to_lowercase().as_str() {
                        "read" => (r + entry.value, w),
                        "write" => (r, w + entry.value),
                        _ => (r, w),
                    }
                })
            })
            .unwrap_or((0, 0));

        Ok(Some(RuntimeStats {
            cpu_delta: cpu_total.saturating_sub(precpu_total),
            system_cpu_delta: system.saturating_sub(presystem),
            online_cpus: u64::from(stats.cpu_stats.online_cpus.unwrap_or(1)),
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            net_rx,
            net_tx,
            block_read,
            block_write,
        }))
    }

    async fn list_containers(&self, label: Option<&str>) -> anyhow::Result<Vec<ContainerSummary>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(label) = label {
            filters.insert("label".to_string(), vec![label.to_string()]);
        }

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: usize,
        since: Option<i64>,
    ) -> anyhow::Result<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            since: since.unwrap_or(0),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => break,
                Err(e) => return Err(anyhow::anyhow!("Failed to read container logs: {}", e)),
            }
        }
        Ok(text)
    }

    async fn launch_stack(&self, compose_file: &Path, project: &str) -> anyhow::Result<()> {
        info!(project, compose_file = %compose_file.display(), "Bringing up compose stack");
        self.compose(compose_file, project, &["up", "-d"]).await
    }

    async fn stop_stack(&self, compose_file: &Path, project: &str) -> anyhow::Result<()> {
        info!(project, compose_file = %compose_file.display(), "Tearing down compose stack");
        self.compose(compose_file, project, &["down"]).await
    }

    async fn prune_system(&self) -> anyhow::Result<PruneReport> {
        let mut report = PruneReport::default();

        let containers = self
            .client
            .prune_containers(None::<bollard::container::PruneContainersOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to prune containers: {}", e))?;
        report.containers = containers.containers_deleted.map(|c| c.len()).unwrap_or(0);
        report.reclaimed_bytes += containers.space_reclaimed.unwrap_or(0) as u64;

        let images = self
            .client
            .prune_images(None::<bollard::image::PruneImagesOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to prune images: {}", e))?;
        report.images = images.images_deleted.map(|i| i.len()).unwrap_or(0);
        report.reclaimed_bytes += images.space_reclaimed.unwrap_or(0) as u64;

        let networks = self
            .client
            .prune_networks(None::<bollard::network::PruneNetworksOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to prune networks: {}", e))?;
        report.networks = networks.networks_deleted.map(|n| n.len()).unwrap_or(0);

        let volumes = self
            .client
            .prune_volumes(None::<bollard::volume::PruneVolumesOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to prune volumes: {}", e))?;
        report.volumes = volumes.volumes_deleted.map(|v| v.len()).unwrap_or(0);
        report.reclaimed_bytes += volumes.space_reclaimed.unwrap_or(0) as u64;

        if report.containers + report.images + report.networks + report.volumes > 0 {
            info!(
                containers = report.containers,
                images = report.images,
                networks = report.networks,
                volumes = report.volumes,
                reclaimed_bytes = report.reclaimed_bytes,
                "Pruned unused engine resources"
            );
        } else {
            warn!("Prune requested but nothing to reclaim");
        }

        Ok(report)
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}
