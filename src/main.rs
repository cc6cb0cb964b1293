use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakedock::config::Config;
use wakedock::docker::{DockerRuntime, SharedRuntime};
use wakedock::monitor::Monitor;
use wakedock::orchestrator::Orchestrator;
use wakedock::proxy::ProxySynchronizer;
use wakedock::service::ServiceRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakedock=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakedock.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        services = config.services.len(),
        "Configuration loaded"
    );

    // Connect to the container engine
    let runtime: SharedRuntime =
        Arc::new(DockerRuntime::connect(config.docker.host.as_deref()).await?);
    info!("Connected to container engine");

    // Proxy synchronizer; make sure the managed file exists with its markers
    let proxy = Arc::new(ProxySynchronizer::new(&config.proxy)?);
    proxy.ensure_base_config()?;
    info!(path = %proxy.config_path().display(), "Proxy configuration ready");

    // Materialize services and adopt anything still running from a previous
    // process
    let registry = Arc::new(ServiceRegistry::from_config(
        &config.services,
        &config.monitor,
    ));
    let orchestrator = Orchestrator::new(
        Arc::clone(&registry),
        runtime,
        Arc::clone(&proxy),
        &config.docker,
    );
    orchestrator.reconcile_all().await;

    // Shutdown channel and monitor loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = Monitor::new(Arc::clone(&orchestrator), config.monitor.clone());
    let monitor_handle = tokio::spawn(Arc::clone(&monitor).run(shutdown_rx));

    info!(services = registry.len(), "WakeDock is running");

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Drain the monitor; services are left running on purpose so a restart
    // of this process does not interrupt them
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), monitor_handle)
        .await
        .is_err()
    {
        warn!("Monitor loop did not stop in time");
    }

    info!("Shutdown complete, managed services keep running");
    Ok(())
}
