//! Service Orchestrator
//!
//! Owns the authoritative lifecycle of every service: wake, sleep, restart,
//! live-state reconciliation, and stats passthrough. On every transition that
//! changes whether a service is publicly reachable, the orchestrator
//! recomputes the exposed route set and drives the proxy synchronizer: an
//! incremental route call first as a fast path, then full regeneration and
//! reload as the authoritative follow-up.
//!
//! The orchestrator never retries failed launches or stops; retry policy is a
//! caller concern. A failed operation leaves the service in `error`, which is
//! deliberately distinct from `stopped` so operators can tell a clean stop
//! from a failed one.

use crate::config::DockerConfig;
use crate::docker::{ContainerSpec, SharedRuntime, SERVICE_LABEL};
use crate::error::OrchestratorError;
use crate::proxy::ProxySynchronizer;
use crate::service::{
    LaunchSpec, Service, ServiceHandle, ServiceInfo, ServiceRegistry, ServiceState,
};
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Derived resource usage for one service, plain data for the API boundary
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

/// Drives service lifecycle transitions and keeps the proxy in step
pub struct Orchestrator {
    registry: Arc<ServiceRegistry>,
    runtime: SharedRuntime,
    proxy: Arc<ProxySynchronizer>,
    adapter_timeout: Duration,
    stop_grace: Duration,
    network: Option<String>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        runtime: SharedRuntime,
        proxy: Arc<ProxySynchronizer>,
        docker: &DockerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            runtime,
            proxy,
            adapter_timeout: docker.operation_timeout(),
            stop_grace: docker.stop_grace_period(),
            network: docker.network.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run an adapter call under the bounded operation timeout
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.adapter_timeout, fut).await {
            Ok(result) => result,
            Err(elapsed) => Err(anyhow::Error::new(elapsed).context(format!(
                "container engine call timed out after {}s",
                self.adapter_timeout.as_secs()
            ))),
        }
    }

    /// Map an adapter failure to the typed boundary error, keeping timeouts
    /// distinguishable
    fn adapter_error(
        &self,
        service_id: &str,
        error: anyhow::Error,
        wrap: impl FnOnce(String, anyhow::Error) -> OrchestratorError,
    ) -> OrchestratorError {
        if error
            .downcast_ref::<tokio::time::error::Elapsed>()
            .is_some()
        {
            OrchestratorError::Timeout {
                id: service_id.to_string(),
                seconds: self.adapter_timeout.as_secs(),
            }
        } else {
            wrap(service_id.to_string(), error)
        }
    }

    /// Wake a service: launch its container or stack and expose it
    ///
    /// No-op if the service is already running. On launch failure the service
    /// moves to `error` with no handle and the failure is returned; nothing
    /// is retried automatically.
    pub async fn wake(&self, service_id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(service_id)
            .ok_or_else(|| OrchestratorError::UnknownService(service_id.to_string()))?;
        let mut service = entry.lock().await;

        if service.state == ServiceState::Running {
            debug!(service = service_id, "Service already running, wake is a no-op");
            return Ok(());
        }

        info!(service = service_id, state = %service.state, "Waking service");
        service.state = ServiceState::Starting;

        let launch_result = match &service.launch {
            LaunchSpec::Image { .. } => {
                let spec = container_spec(&service, self.network.clone());
                self.bounded(self.runtime.start_container(&spec))
                    .await
                    .map(ServiceHandle::Container)
            }
            LaunchSpec::Stack { compose_file } => {
                let project = stack_project(&service.id);
                self.bounded(self.runtime.launch_stack(compose_file, &project))
                    .await
                    .map(|_| ServiceHandle::Stack { project })
            }
        };

        match launch_result {
            Ok(handle) => {
                service.handle = Some(handle);
                service.state = ServiceState::Running;
                service.last_accessed = Utc::now();
                let route = service.route();
                drop(service);

                info!(service = service_id, "Service is running");
                if let Some(route) = route {
                    self.proxy.add_route(&route).await;
                    self.sync_proxy().await;
                }
                Ok(())
            }
            Err(e) => {
                service.state = ServiceState::Error;
                service.handle = None;
                warn!(service = service_id, error = %e, "Service launch failed");
                Err(self.adapter_error(service_id, e, |id, source| {
                    OrchestratorError::LaunchFailed { id, source }
                }))
            }
        }
    }

    /// Put a service to sleep: stop its container or stack and withdraw its
    /// route
    ///
    /// No-op if the service holds no live handle (already stopped, or in
    /// `error` with nothing left to stop). Proxy cleanup runs even when the
    /// engine stop fails: a stale route must never outlive a partially
    /// failed stop.
    pub async fn sleep(&self, service_id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(service_id)
            .ok_or_else(|| OrchestratorError::UnknownService(service_id.to_string()))?;
        let mut service = entry.lock().await;

        let Some(handle) = service.handle.clone() else {
            debug!(service = service_id, state = %service.state, "No live handle, sleep is a no-op");
            return Ok(());
        };

        info!(service = service_id, "Putting service to sleep");
        service.state = ServiceState::Stopping;
        let had_domain = service.domain.is_some();

        let stop_result = match &handle {
            ServiceHandle::Container(container_id) => {
                self.bounded(self.runtime.stop_container(container_id, self.stop_grace))
                    .await
            }
            ServiceHandle::Stack { project } => match &service.launch {
                LaunchSpec::Stack { compose_file } => {
                    self.bounded(self.runtime.stop_stack(compose_file, project))
                        .await
                }
                LaunchSpec::Image { .. } => Err(anyhow::anyhow!(
                    "stack handle on an image-launched service"
                )),
            },
        };

        // The handle is cleared on both outcomes: a service outside
        // starting/running/stopping never carries one
        service.handle = None;

        let result = match stop_result {
            Ok(()) => {
                service.state = ServiceState::Stopped;
                info!(service = service_id, "Service stopped");
                Ok(())
            }
            Err(e) => {
                service.state = ServiceState::Error;
                warn!(service = service_id, error = %e, "Service stop failed");
                Err(self.adapter_error(service_id, e, |id, source| {
                    OrchestratorError::StopFailed { id, source }
                }))
            }
        };
        drop(service);

        if had_domain {
            self.proxy.remove_route(service_id).await;
            self.sync_proxy().await;
        }

        result
    }

    /// Restart a service: sleep, then wake
    ///
    /// If the sleep step fails the restart aborts without waking; starting a
    /// new container on top of one in unknown state is never worth it.
    pub async fn restart(&self, service_id: &str) -> Result<(), OrchestratorError> {
        if let Err(e) = self.sleep(service_id).await {
            return Err(OrchestratorError::RestartAborted {
                id: service_id.to_string(),
                source: Box::new(e),
            });
        }
        self.wake(service_id).await
    }

    /// Reconcile in-memory state against the engine's live view
    ///
    /// Handles out-of-band stops: a running service whose container is gone
    /// moves back to `stopped`, its handle is cleared, and its route is
    /// withdrawn. If the engine is unreachable the in-memory state is kept.
    pub async fn is_running(&self, service_id: &str) -> Result<bool, OrchestratorError> {
        let entry = self
            .registry
            .get(service_id)
            .ok_or_else(|| OrchestratorError::UnknownService(service_id.to_string()))?;
        let mut service = entry.lock().await;

        if service.state != ServiceState::Running {
            return Ok(false);
        }

        let live = match service.handle.clone() {
            Some(ServiceHandle::Container(container_id)) => {
                match self.bounded(self.runtime.inspect_container(&container_id)).await {
                    Ok(status) => status.map(|s| s.running).unwrap_or(false),
                    Err(e) => {
                        warn!(service = service_id, error = %e, "Cannot verify container state, keeping in-memory state");
                        return Ok(true);
                    }
                }
            }
            Some(ServiceHandle::Stack { project }) => {
                match self
                    .bounded(self.runtime.list_containers(Some(&project_label(&project))))
                    .await
                {
                    Ok(containers) => containers.iter().any(|c| c.running),
                    Err(e) => {
                        warn!(service = service_id, error = %e, "Cannot verify stack state, keeping in-memory state");
                        return Ok(true);
                    }
                }
            }
            None => false,
        };

        if live {
            return Ok(true);
        }

        info!(service = service_id, "Container gone out-of-band, reconciling to stopped");
        service.state = ServiceState::Stopped;
        service.handle = None;
        let had_domain = service.domain.is_some();
        drop(service);

        if had_domain {
            self.proxy.remove_route(service_id).await;
            self.sync_proxy().await;
        }
        Ok(false)
    }

    /// Resource usage for a service's current handle; `None` without one
    pub async fn get_service_stats(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceStats>, OrchestratorError> {
        let entry = self
            .registry
            .get(service_id)
            .ok_or_else(|| OrchestratorError::UnknownService(service_id.to_string()))?;
        let handle = entry.lock().await.handle.clone();

        let Some(handle) = handle else {
            return Ok(None);
        };

        let stats = match &handle {
            ServiceHandle::Container(container_id) => {
                match self.bounded(self.runtime.container_stats(container_id)).await {
                    Ok(Some(raw)) => Some(derive_stats(std::iter::once(raw))),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(service = service_id, error = %e, "Stats unavailable");
                        None
                    }
                }
            }
            ServiceHandle::Stack { project } => {
                let containers = match self
                    .bounded(self.runtime.list_containers(Some(&project_label(project))))
                    .await
                {
                    Ok(containers) => containers,
                    Err(e) => {
                        warn!(service = service_id, error = %e, "Stats unavailable");
                        return Ok(None);
                    }
                };

                let mut raws = Vec::new();
                for container in containers.iter().filter(|c| c.running) {
                    if let Ok(Some(raw)) =
                        self.bounded(self.runtime.container_stats(&container.id)).await
                    {
                        raws.push(raw);
                    }
                }
                if raws.is_empty() {
                    None
                } else {
                    Some(derive_stats(raws.into_iter()))
                }
            }
        };

        Ok(stats)
    }

    /// Recent log lines for a service; `None` without a live handle
    pub async fn service_logs(
        &self,
        service_id: &str,
        tail: usize,
    ) -> Result<Option<String>, OrchestratorError> {
        let entry = self
            .registry
            .get(service_id)
            .ok_or_else(|| OrchestratorError::UnknownService(service_id.to_string()))?;
        let handle = entry.lock().await.handle.clone();

        let Some(handle) = handle else {
            return Ok(None);
        };

        let logs = match &handle {
            ServiceHandle::Container(container_id) => self
                .bounded(self.runtime.container_logs(container_id, tail, None))
                .await
                .unwrap_or_else(|e| {
                    warn!(service = service_id, error = %e, "Logs unavailable");
                    String::new()
                }),
            ServiceHandle::Stack { project } => {
                let containers = self
                    .bounded(self.runtime.list_containers(Some(&project_label(project))))
                    .await
                    .unwrap_or_default();
                let mut text = String::new();
                for container in containers {
                    if let Ok(lines) = self
                        .bounded(self.runtime.container_logs(&container.id, tail, None))
                        .await
                    {
                        text.push_str(&format!("=== {} ===\n{}", container.name, lines));
                    }
                }
                text
            }
        };

        Ok(Some(logs))
    }

    /// Refresh a service's last-accessed timestamp
    ///
    /// Called by the request-routing layer whenever traffic targets the
    /// service; the monitor reads the timestamp for the inactivity rule.
    pub async fn touch(&self, service_id: &str) {
        if let Some(entry) = self.registry.get(service_id) {
            entry.lock().await.last_accessed = Utc::now();
        }
    }

    /// Plain-data snapshots of all services
    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        self.registry.infos().await
    }

    /// Plain-data snapshot of one service
    pub async fn get_service(&self, service_id: &str) -> Option<ServiceInfo> {
        let entry = self.registry.get(service_id)?;
        let info = entry.lock().await.info();
        Some(info)
    }

    /// Put every service with a live handle to sleep
    pub async fn sleep_all(&self) {
        for id in self.registry.ids() {
            if let Err(e) = self.sleep(&id).await {
                warn!(service = %id, error = %e, "Failed to sleep service");
            }
        }
    }

    /// Adopt live containers after a process restart, then run the
    /// authoritative proxy sync
    ///
    /// A crash or redeploy of the orchestrator must not disturb running
    /// services: anything the engine still reports as running under its
    /// deterministic name is re-attached, and the proxy file is regenerated
    /// from the resulting state.
    pub async fn reconcile_all(&self) {
        let mut adopted = 0usize;

        for id in self.registry.ids() {
            let Some(entry) = self.registry.get(&id) else {
                continue;
            };
            let mut service = entry.lock().await;
            if service.handle.is_some() {
                continue;
            }

            let live_handle = match &service.launch {
                LaunchSpec::Image { .. } => {
                    match self
                        .bounded(self.runtime.inspect_container(&service.container_name))
                        .await
                    {
                        Ok(Some(status)) if status.running => Some(ServiceHandle::Container(
                            service.container_name.clone(),
                        )),
                        Ok(_) => None,
                        Err(e) => {
                            warn!(service = %id, error = %e, "Reconcile inspect failed");
                            None
                        }
                    }
                }
                LaunchSpec::Stack { .. } => {
                    let project = stack_project(&service.id);
                    match self
                        .bounded(self.runtime.list_containers(Some(&project_label(&project))))
                        .await
                    {
                        Ok(containers) if containers.iter().any(|c| c.running) => {
                            Some(ServiceHandle::Stack { project })
                        }
                        Ok(_) => None,
                        Err(e) => {
                            warn!(service = %id, error = %e, "Reconcile list failed");
                            None
                        }
                    }
                }
            };

            if let Some(handle) = live_handle {
                info!(service = %id, "Adopted running service");
                service.handle = Some(handle);
                service.state = ServiceState::Running;
                adopted += 1;
            }
        }

        info!(adopted, total = self.registry.len(), "Startup reconciliation complete");
        self.sync_proxy().await;
    }

    /// Prune unused engine resources (maintenance passthrough)
    pub async fn prune(&self) -> anyhow::Result<crate::docker::PruneReport> {
        self.bounded(self.runtime.prune_system()).await
    }

    /// Authoritative proxy synchronization from current registry state
    ///
    /// Failures are logged, never raised: a broken proxy must not fail the
    /// lifecycle operation that already committed.
    async fn sync_proxy(&self) {
        let routes = self.registry.exposed_routes().await;
        if let Err(e) = self.proxy.sync(&routes).await {
            warn!(error = %e, "Proxy synchronization failed");
        }
    }
}

/// Compose project name for a stack service
fn stack_project(service_id: &str) -> String {
    format!("wakedock-{}", service_id)
}

/// Label filter matching a compose project's containers
fn project_label(project: &str) -> String {
    format!("com.docker.compose.project={}", project)
}

/// Build the container spec for an image-launched service
fn container_spec(service: &Service, network: Option<String>) -> ContainerSpec {
    let LaunchSpec::Image {
        image,
        env,
        memory,
        cpus,
    } = &service.launch
    else {
        unreachable!("container_spec is only called for image launches");
    };

    let mut labels = std::collections::HashMap::new();
    labels.insert(SERVICE_LABEL.to_string(), service.id.clone());

    ContainerSpec {
        name: service.container_name.clone(),
        image: image.clone(),
        port: service.port,
        env: env.clone(),
        network,
        memory: memory.clone(),
        cpus: cpus.clone(),
        labels,
    }
}

/// Fold raw engine counters into API-facing stats
fn derive_stats(raws: impl Iterator<Item = crate::docker::RuntimeStats>) -> ServiceStats {
    let mut stats = ServiceStats::default();
    for raw in raws {
        stats.cpu_percent += raw.cpu_percent();
        stats.memory_usage += raw.memory_usage;
        stats.memory_limit += raw.memory_limit;
        stats.net_rx += raw.net_rx;
        stats.net_tx += raw.net_tx;
        stats.block_read += raw.block_read;
        stats.block_write += raw.block_write;
    }
    if stats.memory_limit > 0 {
        stats.memory_percent = stats.memory_usage as f64 / stats.memory_limit as f64 * 100.0;
    }
    stats
}
