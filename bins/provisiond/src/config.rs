use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use gridnode_core::types::ResourceUnits;

/// Local endpoints of the backend module daemons.
#[derive(Debug, Clone)]
pub struct ModuleEndpoints {
    pub container_url: String,
    pub network_url: String,
    pub storage_url: String,
    pub zdb_url: String,
    pub kubernetes_url: String,
}

#[derive(Debug, Clone)]
pub struct ProvisiondConfig {
    pub registry_url: String,
    pub node_mnemonic: String,
    pub storage_dir: PathBuf,
    pub poll_interval: Duration,
    pub decommission_interval: Duration,
    pub janitor_interval: Duration,
    /// Worker pool bound for the reconciliation loop.
    pub workers: usize,
    /// Shutdown grace for in-flight provisioning work.
    pub grace: Duration,
    /// Per-source event buffer depth.
    pub source_buffer: usize,
    /// Total allocable capacity of this node.
    pub capacity: ResourceUnits,
    pub modules: ModuleEndpoints,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(name, default))
}

fn env_url(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl ProvisiondConfig {
    pub fn load() -> Result<Self> {
        let node_mnemonic =
            env::var("NODE_MNEMONIC").context("NODE_MNEMONIC must be set with the node's mnemonic words")?;

        let registry_url = env_url("REGISTRY_API_URL", "https://registry.gridnode.dev");

        let storage_dir = env::var("PROVISIOND_STORAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/cache/gridnode/provisiond"));

        // Total allocable units, not the node's raw hardware: the host keeps
        // a slice for itself.
        let capacity = ResourceUnits {
            cru: env_u64("MAX_ALLOCABLE_CRU", 16),
            mru: env_u64("MAX_ALLOCABLE_MRU", 64),
            sru: env_u64("MAX_ALLOCABLE_SRU", 512),
            hru: env_u64("MAX_ALLOCABLE_HRU", 2048),
        };

        Ok(Self {
            registry_url,
            node_mnemonic,
            storage_dir,
            poll_interval: env_secs("POLL_INTERVAL_SECS", 10),
            decommission_interval: env_secs("DECOMMISSION_INTERVAL_SECS", 30),
            janitor_interval: env_secs("JANITOR_INTERVAL_SECS", 120),
            workers: env_u64("PROVISION_WORKERS", 8) as usize,
            grace: env_secs("SHUTDOWN_GRACE_SECS", 30),
            source_buffer: env_u64("SOURCE_BUFFER", 32) as usize,
            capacity,
            modules: ModuleEndpoints {
                container_url: env_url("CONTD_URL", "http://127.0.0.1:9105"),
                network_url: env_url("NETWORKD_URL", "http://127.0.0.1:9101"),
                storage_url: env_url("STORAGED_URL", "http://127.0.0.1:9102"),
                zdb_url: env_url("ZDBD_URL", "http://127.0.0.1:9103"),
                kubernetes_url: env_url("KUBED_URL", "http://127.0.0.1:9104"),
            },
        })
    }
}
