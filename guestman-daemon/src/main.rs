use anyhow::Context;
use guestman_core::remote::{CrictlRuntime, HttpControlPlane, LocalStorageManager, UnixDeployAgent};
use guestman_core::{init_observability, shutdown_observability, GuestManager, HostConfig, HostContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod shutdown;

use shutdown::{shutdown_signal, ShutdownManager};

const LOOP_STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::load().context("loading host config")?;

    // Initialize observability FIRST
    init_observability(&config.log_level, config.metrics_port)
        .map_err(|e| anyhow::anyhow!("observability init failed: {e}"))?;

    info!(host_id = %config.host_id, servers_path = %config.servers_path.display(), "guestmand starting");

    let control_plane =
        HttpControlPlane::new(config.control_plane_url.clone(), config.control_plane_token.clone())
            .context("building control plane client")?;
    let storage = LocalStorageManager::new(config.storage_root.clone()).context("opening storage root")?;
    let deploy_agent = UnixDeployAgent::new(config.deploy_agent_socket.clone());
    let runtime = config
        .crictl_binary
        .clone()
        .map(|binary| CrictlRuntime::new(binary, config.container_config_dir.clone()));

    let mut ctx = HostContext::new(config, Arc::new(control_plane), Arc::new(storage), Arc::new(deploy_agent));
    if let Some(runtime) = runtime {
        info!("Pod guests enabled");
        ctx = ctx.with_container_runtime(Arc::new(runtime));
    }
    let manager = GuestManager::new(Arc::new(ctx));

    let mut loops = ShutdownManager::new();
    let bootstrap = Arc::clone(&manager);
    let bootstrapped = tokio::spawn(async move { bootstrap.bootstrap().await });
    loops.track("bootstrap", Some(bootstrapped));
    loops.track("cpuset-balancer", manager.spawn_cpuset_balancer());
    loops.track("pod-reconciler", manager.spawn_pod_reconciler());

    info!("guestmand ready");

    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "Signal handler failed, shutting down");
    }

    loops.shutdown(LOOP_STOP_GRACE).await;
    info!(guests = manager.guest_ids().len(), "guestmand shutting down");
    shutdown_observability();
    Ok(())
}
