use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wakegate::config::{self, RawConfigSources, Settings};
use wakegate::engine::WakeEngine;
use wakegate::pool::{ConnectionPool, PoolConfig};
use wakegate::probe::HttpProber;
use wakegate::proxy::ProxyServer;
use wakegate::registry::{ServiceRegistry, SharedRegistry};
use wakegate::resolver::{resolve_sources, Resolution};
use wakegate::wol::UdpBroadcastSender;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_default();
        EnvFilter::new(config::log_directive(&level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::from_env().map_err(|e| {
        error!(error = %e, "Invalid settings");
        e
    })?;

    let resolution = load_services(&settings).map_err(|e| {
        error!(path = %settings.services_config_path.display(), error = %e, "Failed to load service configuration");
        e
    })?;

    if resolution.is_empty() {
        error!(
            path = %settings.services_config_path.display(),
            "No valid services configured, refusing to start"
        );
        anyhow::bail!("no valid services configured");
    }

    let registry = Arc::new(SharedRegistry::new(ServiceRegistry::from_resolution(resolution)));

    print_startup_banner(&settings, &registry.snapshot());

    let bind_addr: SocketAddr = format!("{}:{}", settings.bind, settings.port)
        .parse()
        .map_err(|e| {
            error!(bind = %settings.bind, port = settings.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    info!(
        max_idle = pool.config().max_idle_per_host,
        idle_timeout_secs = pool.config().idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let sender = UdpBroadcastSender::bind(settings.wol_target)
        .await
        .with_context(|| format!("failed to open magic packet socket for {}", settings.wol_target))?;

    let engine = Arc::new(WakeEngine::new(
        HttpProber::new(Arc::clone(&pool), settings.awake_policy),
        sender,
        Arc::clone(&pool),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(bind_addr, Arc::clone(&registry), engine, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown(&settings, &registry).await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    let stats = pool.stats();
    info!(
        requests = stats.get_total_requests(),
        awake_checks = stats.get_awake_checks(),
        "Shutdown complete"
    );
    Ok(())
}

/// Read both service sources and resolve them, logging every excluded host
fn load_services(settings: &Settings) -> anyhow::Result<Resolution> {
    let sources = RawConfigSources::load(settings)?;
    if sources.file.is_empty() && sources.env.is_empty() {
        warn!(
            path = %settings.services_config_path.display(),
            "No services defined in the service file or environment"
        );
    }
    let resolution = resolve_sources(&sources, &settings.defaults);

    for issue in &resolution.issues {
        error!(host = %issue.host, error = %issue.error, "Service configuration rejected");
    }

    Ok(resolution)
}

/// Re-read the service sources and swap in a new registry snapshot
fn reload(settings: &Settings, registry: &SharedRegistry) -> anyhow::Result<()> {
    let resolution = load_services(settings).context("failed to reload service configuration")?;
    if resolution.is_empty() {
        anyhow::bail!("reloaded configuration has no valid services, keeping current services");
    }

    let result = registry.replace(ServiceRegistry::from_resolution(resolution));
    if result.is_unchanged() {
        info!("Configuration reloaded, no changes");
        return Ok(());
    }

    info!(
        added = result.added.len(),
        removed = result.removed.len(),
        updated = result.updated.len(),
        "Configuration reloaded successfully"
    );
    if !result.added.is_empty() {
        info!(services = ?result.added, "New services available");
    }
    if !result.removed.is_empty() {
        info!(services = ?result.removed, "Services removed");
    }
    if !result.updated.is_empty() {
        info!(services = ?result.updated, "Services updated");
    }
    Ok(())
}

/// Block until SIGINT or SIGTERM, reloading services on SIGHUP
#[cfg(unix)]
async fn wait_for_shutdown(settings: &Settings, registry: &SharedRegistry) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %settings.services_config_path.display(), "Received SIGHUP, reloading configuration...");
                if let Err(e) = reload(settings, registry) {
                    error!(error = %e, "Failed to reload configuration");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_settings: &Settings, _registry: &SharedRegistry) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(settings: &Settings, registry: &ServiceRegistry) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        bind = %settings.bind,
        port = settings.port,
        services_config = %settings.services_config_path.display(),
        awake_policy = ?settings.awake_policy,
        wol_target = %settings.wol_target,
        "Starting wake-on-LAN proxy"
    );

    info!(
        poll_interval_secs = settings.defaults.poll_interval.as_secs(),
        max_retries = settings.defaults.max_retries,
        request_timeout_secs = settings.defaults.request_timeout.as_secs(),
        awake_request_timeout_secs = settings.defaults.awake_request_timeout.as_secs(),
        "Global defaults"
    );

    for host in registry.hosts() {
        if let Some(record) = registry.lookup(host) {
            info!(
                host,
                base_url = %record.base_url,
                awake_check = %record.awake_check_path,
                mac = %record.mac_address,
                poll_interval_secs = record.poll_interval.as_secs(),
                max_retries = record.max_retries,
                request_timeout_secs = record.request_timeout.as_secs(),
                worst_case_wake_secs = record.worst_case_wake_time().map(|d| d.as_secs()),
                "Service registered"
            );
            if record.max_retries == 0 {
                warn!(host, "max_retries is 0, a sleeping service will never be woken");
            }
        }
    }
}
