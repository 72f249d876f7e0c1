use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod modules;

use config::ProvisiondConfig;
use gridnode_core::types::ReservationType;
use gridnode_core::NodeIdentity;
use gridnode_provision::{
    cached_counters, purge_not_persistent, CachedProvisioner, CombinedSource,
    CommitterProvisioner, DecommissionSource, Engine, EngineOptions, Janitor, PollSource,
    PrimitivesProvisioner, StatisticsProvisioner,
};
use gridnode_registry_client::{HttpRegistryClient, RegistryClient};
use gridnode_store::ReservationStore;
use modules::{DebugPrimitive, ModuleClient, ModulePrimitive};

const BOOT_MARKER: &str = "provisiond.booted";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting gridnode provision daemon");

    let config = ProvisiondConfig::load()?;
    let identity = NodeIdentity::from_mnemonic(&config.node_mnemonic)?;
    let node_id = identity.node_id();
    info!("node identity: {}", node_id);

    std::fs::create_dir_all(&config.storage_dir).with_context(|| {
        format!(
            "failed to create storage directory {}",
            config.storage_dir.display()
        )
    })?;
    let store = ReservationStore::open(config.storage_dir.join("reservations.db"))?;

    // On the first boot after an upgrade, shed cache entries that are not
    // meant to survive one.
    let boot_marker = config.storage_dir.join(BOOT_MARKER);
    if !boot_marker.exists() {
        let purged = purge_not_persistent(&store).await?;
        if purged > 0 {
            info!("first boot: purged {} non-persistent reservations", purged);
        }
        std::fs::write(&boot_marker, b"").context("failed to write boot marker")?;
    }

    // Counters are rebuilt from the durable cache, never carried over from a
    // previous run.
    let initial = cached_counters(&store).await?;
    info!("deployed capacity at boot: [{}] of [{}]", initial, config.capacity);

    let registry: Arc<dyn RegistryClient> =
        Arc::new(HttpRegistryClient::new(config.registry_url.clone()));

    let statistics = StatisticsProvisioner::new(
        build_primitives(&config),
        config.capacity,
        initial,
        store.clone(),
    );
    let counters = statistics.counters_handle();
    let cache = CachedProvisioner::new(statistics, store.clone());
    let provisioner = Arc::new(CommitterProvisioner::new(
        cache,
        registry.clone(),
        identity,
    ));

    let token = CancellationToken::new();
    let events = CombinedSource::new(config.source_buffer)
        .with_source(PollSource::new(
            registry.clone(),
            node_id.clone(),
            config.poll_interval,
        ))
        .with_source(DecommissionSource::new(
            store.clone(),
            config.decommission_interval,
        ))
        .spawn(&token);

    let janitor = Janitor::new(
        registry,
        store,
        provisioner.clone(),
        node_id,
        config.janitor_interval,
    );

    let engine = Engine::new(EngineOptions {
        provisioner,
        events,
        janitor: Some(janitor),
        counters,
        total: config.capacity,
        workers: config.workers,
        grace: config.grace,
    });

    let shutdown = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    engine.run(token).await?;
    info!("provision engine stopped");

    Ok(())
}

fn build_primitives(config: &ProvisiondConfig) -> PrimitivesProvisioner {
    let network = ModuleClient::new(&config.modules.network_url);

    PrimitivesProvisioner::new()
        .with_handler(
            ReservationType::Container,
            Arc::new(ModulePrimitive::new(ModuleClient::new(
                &config.modules.container_url,
            ))),
        )
        .with_handler(
            ReservationType::Network,
            Arc::new(ModulePrimitive::new(network.clone())),
        )
        .with_handler(
            ReservationType::NetworkResource,
            Arc::new(ModulePrimitive::new(network)),
        )
        .with_handler(
            ReservationType::Volume,
            Arc::new(ModulePrimitive::new(ModuleClient::new(
                &config.modules.storage_url,
            ))),
        )
        .with_handler(
            ReservationType::Zdb,
            Arc::new(ModulePrimitive::new(ModuleClient::new(
                &config.modules.zdb_url,
            ))),
        )
        .with_handler(
            ReservationType::Kubernetes,
            Arc::new(ModulePrimitive::new(ModuleClient::new(
                &config.modules.kubernetes_url,
            ))),
        )
        .with_handler(ReservationType::Debug, Arc::new(DebugPrimitive))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
