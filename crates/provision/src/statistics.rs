//! Capacity accounting layer: checks reservation footprints against the
//! node's totals before delegating, and keeps the running counters equal to
//! the footprint sum of live Ok results.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use gridnode_core::types::{Reservation, ReservationResult, ReservationType, ResourceUnits};
use gridnode_store::ReservationStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::primitives::{ContainerData, DiskKind, KubernetesData, NetworkData, VolumeData, ZdbData};
use crate::Provisioner;

/// Compute the resource footprint of a reservation from its typed payload.
/// Networks and debug reservations consume no accounted units.
pub fn resource_units(reservation: &Reservation) -> Result<ResourceUnits, ProvisionError> {
    let units = match reservation.reservation_type {
        ReservationType::Container => {
            let data: ContainerData = parse(reservation)?;
            ResourceUnits {
                cru: data.capacity.cpu,
                mru: data.capacity.memory.div_ceil(1024),
                sru: 0,
                hru: 0,
            }
        }
        ReservationType::Volume => {
            let data: VolumeData = parse(reservation)?;
            disk_units(data.size, data.kind)
        }
        ReservationType::Zdb => {
            let data: ZdbData = parse(reservation)?;
            disk_units(data.size, data.disk_type)
        }
        ReservationType::Kubernetes => {
            let data: KubernetesData = parse(reservation)?;
            data.capacity()?
        }
        ReservationType::Network | ReservationType::NetworkResource => {
            // No accounted units, but a malformed payload still has to
            // surface before the backend sees it.
            let _data: NetworkData = parse(reservation)?;
            ResourceUnits::default()
        }
        ReservationType::Debug => ResourceUnits::default(),
    };

    Ok(units)
}

fn disk_units(size: u64, kind: DiskKind) -> ResourceUnits {
    match kind {
        DiskKind::Ssd => ResourceUnits {
            sru: size,
            ..Default::default()
        },
        DiskKind::Hdd => ResourceUnits {
            hru: size,
            ..Default::default()
        },
    }
}

fn parse<T: serde::de::DeserializeOwned>(reservation: &Reservation) -> Result<T, ProvisionError> {
    serde_json::from_value(reservation.data.clone()).map_err(|e| {
        ProvisionError::Validation(format!(
            "{} reservation {}: {}",
            reservation.reservation_type.as_str(),
            reservation.id,
            e
        ))
    })
}

/// Provisioner decorator enforcing node capacity.
///
/// Counters are seeded from the durable cache at boot and never trusted from
/// memory across restarts; the shared handle lets the engine expose capacity
/// snapshots without reaching into the chain.
pub struct StatisticsProvisioner<P> {
    inner: P,
    total: ResourceUnits,
    counters: Arc<Mutex<ResourceUnits>>,
    store: ReservationStore,
}

impl<P> StatisticsProvisioner<P> {
    pub fn new(inner: P, total: ResourceUnits, initial: ResourceUnits, store: ReservationStore) -> Self {
        Self {
            inner,
            total,
            counters: Arc::new(Mutex::new(initial)),
            store,
        }
    }

    pub fn total(&self) -> ResourceUnits {
        self.total
    }

    pub fn counters_handle(&self) -> Arc<Mutex<ResourceUnits>> {
        self.counters.clone()
    }
}

#[async_trait]
impl<P: Provisioner> Provisioner for StatisticsProvisioner<P> {
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<ReservationResult> {
        let footprint = match resource_units(reservation) {
            Ok(footprint) => footprint,
            Err(e) => return Ok(ReservationResult::error(reservation, e.to_string())),
        };

        {
            let used = self.counters.lock().await;
            if !footprint.fits_within(&used, &self.total) {
                let mut available = self.total;
                available.subtract(&used);
                warn!(
                    "rejecting reservation {}: requested [{}], available [{}]",
                    reservation.id, footprint, available
                );
                return Ok(ReservationResult::error(
                    reservation,
                    ProvisionError::CapacityExceeded {
                        requested: footprint,
                        available,
                    }
                    .to_string(),
                ));
            }
        }

        let result = self.inner.provision(ctx, reservation).await?;

        if result.is_ok() && !footprint.is_zero() {
            let mut used = self.counters.lock().await;
            used.add(&footprint);
            debug!("reservation {} consumed [{}], used now [{}]", reservation.id, footprint, *used);
        }

        Ok(result)
    }

    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        // Check what is on record before the cache layer above deletes the
        // entry; only reservations that actually provisioned hold units.
        let had_ok = self
            .store
            .get(&reservation.id)
            .await?
            .map(|entry| entry.is_ok())
            .unwrap_or(false);

        self.inner.decommission(ctx, reservation).await?;

        if had_ok {
            if let Ok(footprint) = resource_units(reservation) {
                if !footprint.is_zero() {
                    let mut used = self.counters.lock().await;
                    used.subtract(&footprint);
                    debug!(
                        "reservation {} released [{}], used now [{}]",
                        reservation.id, footprint, *used
                    );
                }
            }
        }

        Ok(())
    }
}
