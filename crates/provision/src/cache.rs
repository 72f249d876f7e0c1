//! Durable at-most-once layer. The cache is the sole authority for "has this
//! reservation already been handled": re-polls and restart replays
//! short-circuit here, and both Ok and Error outcomes are persisted so a
//! failed reservation is not silently retried by re-delivery.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use gridnode_core::types::{Reservation, ReservationResult, ResourceUnits};
use gridnode_store::ReservationStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::statistics::resource_units;
use crate::Provisioner;

pub struct CachedProvisioner<P> {
    inner: P,
    store: ReservationStore,
    /// Per-reservation-id mutexes; the check-then-write sequence below must
    /// be atomic with respect to concurrent calls for the same id.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<P> CachedProvisioner<P> {
    pub fn new(inner: P, store: ReservationStore) -> Self {
        Self {
            inner,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ReservationStore {
        &self.store
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Footprint sum of every cached Ok result; seeds the statistics layer
    /// at boot so counters never depend on pre-restart memory.
    pub async fn current_counters(&self) -> Result<ResourceUnits> {
        cached_counters(&self.store).await
    }

    /// Drop cache entries that are not meant to survive an upgrade; invoked
    /// once on the first boot after one.
    pub async fn purge_not_persistent(&self) -> Result<usize> {
        purge_not_persistent(&self.store).await
    }
}

/// Footprint sum of the store's Ok results. Standalone so boot code can seed
/// counters before the chain is assembled.
pub async fn cached_counters(store: &ReservationStore) -> Result<ResourceUnits> {
    let mut units = ResourceUnits::default();
    for entry in store.list().await? {
        if !entry.is_ok() {
            continue;
        }
        match resource_units(&entry.reservation) {
            Ok(footprint) => units.add(&footprint),
            Err(e) => warn!(
                "skipping footprint of cached reservation {}: {}",
                entry.reservation.id, e
            ),
        }
    }
    Ok(units)
}

/// Drop every non-persistent cache entry; the first-boot upgrade hook.
pub async fn purge_not_persistent(store: &ReservationStore) -> Result<usize> {
    store.purge(|entry| !entry.reservation.persistent()).await
}

#[async_trait]
impl<P: Provisioner> Provisioner for CachedProvisioner<P> {
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<ReservationResult> {
        let lock = self.id_lock(&reservation.id).await;
        let _guard = lock.lock().await;

        if let Some(entry) = self.store.get(&reservation.id).await? {
            if let Some(result) = entry.result {
                debug!(
                    "reservation {} already has a result, returning cached",
                    reservation.id
                );
                return Ok(result);
            }
        }

        // Persist the reservation before attempting it: a crash mid-attempt
        // leaves a result-less entry, which a later delivery completes.
        self.store.put(reservation).await?;

        let result = self.inner.provision(ctx, reservation).await?;
        self.store.set_result(&result).await?;

        Ok(result)
    }

    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        let lock = self.id_lock(&reservation.id).await;
        let _guard = lock.lock().await;

        if !self.store.exists(&reservation.id).await? {
            return Err(ProvisionError::UnknownReservation(reservation.id.clone()).into());
        }

        // Delegate first: a failed teardown keeps the entry visible so the
        // janitor or a later decommission event retries it.
        self.inner.decommission(ctx, reservation).await?;
        self.store.remove(&reservation.id).await?;

        self.locks.lock().await.remove(&reservation.id);

        Ok(())
    }
}
