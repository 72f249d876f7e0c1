//! Client for the remote registry: the source of truth for which workloads
//! are assigned to this node, and the sink for signed provisioning results.

use std::collections::HashSet;

use async_trait::async_trait;

mod client;
mod error;
mod types;

pub use client::HttpRegistryClient;
pub use error::{RegistryError, RegistryResult};
pub use types::{SignedResult, Workload, WorkloadResult};

/// Node-scoped registry operations the provisioning engine depends on.
///
/// Reads are polled (the registry is eventually observed, not transactional);
/// writes are best-effort visibility updates and never gate local state.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Full set of workloads currently assigned to the node.
    async fn list_workloads(&self, node_id: &str) -> Result<Vec<Workload>, RegistryError>;

    /// Canonical ids assigned to the node; input to the janitor sweep.
    async fn list_workload_ids(&self, node_id: &str) -> Result<HashSet<String>, RegistryError>;

    /// Push a signed provisioning result.
    async fn submit_result(&self, result: &SignedResult) -> Result<(), RegistryError>;

    /// Confirm a workload was decommissioned on this node.
    async fn mark_deleted(&self, node_id: &str, workload_id: &str) -> Result<(), RegistryError>;
}
