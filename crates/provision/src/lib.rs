//! Provisioning engine for a gridnode: consumes reservation events from the
//! registry, drives them through a layered provisioner chain, and keeps the
//! node's local state authoritative across restarts and network loss.
//!
//! The chain, outer to inner:
//!
//! ```text
//! CommitterProvisioner    report signed results to the registry (best effort)
//!   CachedProvisioner     durable, at-most-once execution per reservation id
//!     StatisticsProvisioner   capacity accounting against node totals
//!       PrimitivesProvisioner type-keyed dispatch to backend handlers
//! ```
//!
//! The [`Engine`] pulls events from a [`CombinedSource`] (registry poller plus
//! local expiry scanner), fans them out over a bounded worker pool, and the
//! [`Janitor`] sweeps the cache against the registry's canonical assignment
//! set to repair drift from missed events.

use anyhow::Result;
use async_trait::async_trait;
use gridnode_core::types::{Reservation, ReservationResult};
use tokio_util::sync::CancellationToken;

pub mod cache;
pub mod committer;
pub mod engine;
pub mod error;
pub mod janitor;
pub mod primitives;
pub mod source;
pub mod statistics;

pub use cache::{cached_counters, purge_not_persistent, CachedProvisioner};
pub use committer::CommitterProvisioner;
pub use engine::{Engine, EngineOptions};
pub use error::ProvisionError;
pub use janitor::Janitor;
pub use primitives::{Primitive, PrimitivesProvisioner};
pub use source::{
    CombinedSource, DecommissionSource, PollSource, ReservationEvent, ReservationSource,
};
pub use statistics::{resource_units, StatisticsProvisioner};

/// The one capability every layer of the chain shares. Each layer wraps an
/// inner delegate and adds a single side effect: the committer reports, the
/// cache persists, statistics accounts, primitives execute.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Attempt the reservation and produce a result. Failures that describe
    /// the reservation itself (bad payload, no capacity, no handler, backend
    /// refusal) are captured into an Error-state result; `Err` is reserved
    /// for infrastructure faults such as a broken store.
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<ReservationResult>;

    /// Tear the reservation down. An `Err` leaves the cache entry in place so
    /// the janitor or a later event retries; handlers must tolerate repeated
    /// invocation.
    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()>;
}
