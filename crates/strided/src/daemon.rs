//! Daemon assembly: store, plugins, controller and API server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use stride_plugin::{InMemoryWorkloads, PluginRegistry, RemotePlugin, ResourcePlugin};
use stride_rollout::{Dispatcher, Reconciler, SystemClock};
use stride_state::StateStore;

use crate::config::{DaemonConfig, PluginConfig, PluginKind};

/// Plugin name registered by standalone mode when the config names none.
pub const STANDALONE_PLUGIN: &str = "memory";

/// Build and register every configured plugin.
pub fn register_plugins(registry: &PluginRegistry, plugins: &[PluginConfig]) -> anyhow::Result<()> {
    for plugin in plugins {
        let instance: Arc<dyn ResourcePlugin> = match plugin.kind {
            PluginKind::Memory => {
                let workloads = InMemoryWorkloads::new();
                for seed in &plugin.workloads {
                    workloads.upsert(&seed.workload_ref(), seed.status())?;
                }
                info!(
                    plugin = %plugin.name,
                    workloads = plugin.workloads.len(),
                    "memory plugin configured"
                );
                Arc::new(workloads)
            }
            PluginKind::Remote => {
                let command = plugin.command.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("plugin {:?}: remote plugins need a command", plugin.name)
                })?;
                info!(plugin = %plugin.name, %command, "starting remote plugin");
                Arc::new(RemotePlugin::spawn(&plugin.name, command, &plugin.args)?)
            }
        };
        registry.register(&plugin.name, instance)?;
    }
    Ok(())
}

/// Run the controller and the API server until `signal` resolves.
pub async fn serve<F>(
    config: DaemonConfig,
    store: StateStore,
    registry: Arc<PluginRegistry>,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start controller ───────────────────────────────────────

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry,
        Arc::new(SystemClock),
        config.controller.clone(),
    ));
    let dispatcher = Dispatcher::new(reconciler);
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));
    info!(workers = config.controller.workers, "rollout controller started");

    // ── Start API server ───────────────────────────────────────

    let router = stride_api::build_router(store);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        signal.await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for the controller to drain its workers.
    dispatcher_handle.await?;

    info!("Stride daemon stopped");
    Ok(())
}

/// Open (creating if needed) the on-disk store under `data_dir`.
pub fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("stride.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}
