//! Background sweep reconciling the local cache against the registry's
//! canonical assignment set. Repairs drift from missed decommission events,
//! e.g. when the node was offline while the registry dropped an assignment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gridnode_registry_client::RegistryClient;
use gridnode_store::ReservationStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Provisioner;

pub struct Janitor {
    client: Arc<dyn RegistryClient>,
    store: ReservationStore,
    provisioner: Arc<dyn Provisioner>,
    node_id: String,
    interval: Duration,
}

impl Janitor {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        store: ReservationStore,
        provisioner: Arc<dyn Provisioner>,
        node_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            provisioner,
            node_id: node_id.into(),
            interval,
        }
    }

    pub async fn run(self, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so a boot-time replay
        // finishes before the first sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(&ctx).await {
                        warn!("janitor sweep failed: {:#}", e);
                    }
                }
            }
        }
    }

    /// One reconciliation pass: decommission every cached reservation the
    /// registry no longer assigns to this node, or whose expiry passed.
    pub async fn sweep(&self, ctx: &CancellationToken) -> Result<()> {
        let canonical = match self.client.list_workload_ids(&self.node_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("janitor: registry unreachable: {}; retrying next cycle", e);
                return Ok(());
            }
        };

        let now = Utc::now();
        for entry in self.store.list().await? {
            let reservation = entry.reservation;

            let orphaned = !canonical.contains(&reservation.id);
            let expired = reservation.expired(now);
            if !orphaned && !expired {
                continue;
            }

            info!(
                "janitor decommissioning reservation {} ({})",
                reservation.id,
                if orphaned { "orphaned" } else { "expired" }
            );
            if let Err(e) = self.provisioner.decommission(ctx, &reservation).await {
                warn!(
                    "janitor failed to decommission reservation {}: {:#}",
                    reservation.id, e
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gridnode_core::types::{Reservation, ReservationResult, ReservationType};
    use gridnode_registry_client::{RegistryError, SignedResult, Workload};
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    struct FakeRegistry {
        canonical: HashSet<String>,
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn list_workloads(&self, _node_id: &str) -> Result<Vec<Workload>, RegistryError> {
            Ok(Vec::new())
        }

        async fn list_workload_ids(
            &self,
            _node_id: &str,
        ) -> Result<HashSet<String>, RegistryError> {
            Ok(self.canonical.clone())
        }

        async fn submit_result(&self, _result: &SignedResult) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn mark_deleted(
            &self,
            _node_id: &str,
            _workload_id: &str,
        ) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    struct RecordingProvisioner {
        decommissioned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provisioner for Arc<RecordingProvisioner> {
        async fn provision(
            &self,
            _ctx: &CancellationToken,
            reservation: &Reservation,
        ) -> Result<ReservationResult> {
            Ok(ReservationResult::ok(reservation, serde_json::Value::Null))
        }

        async fn decommission(
            &self,
            _ctx: &CancellationToken,
            reservation: &Reservation,
        ) -> Result<()> {
            self.decommissioned
                .lock()
                .await
                .push(reservation.id.clone());
            Ok(())
        }
    }

    fn volume(id: &str) -> Reservation {
        Reservation {
            id: id.into(),
            node_id: "node-a".into(),
            reservation_type: ReservationType::Volume,
            data: serde_json::json!({"size": 1}),
            created: Utc::now(),
            duration: 0,
            to_delete: false,
        }
    }

    #[tokio::test]
    async fn sweep_decommissions_orphans_only() {
        let store = ReservationStore::in_memory().unwrap();
        store.put(&volume("r1")).await.unwrap();
        store.put(&volume("r2")).await.unwrap();

        let client = Arc::new(FakeRegistry {
            canonical: ["r1".to_string()].into_iter().collect(),
        });
        let recorder = Arc::new(RecordingProvisioner {
            decommissioned: Mutex::new(Vec::new()),
        });

        let janitor = Janitor::new(
            client,
            store,
            Arc::new(recorder.clone()),
            "node-a",
            Duration::from_secs(60),
        );

        janitor.sweep(&CancellationToken::new()).await.unwrap();

        assert_eq!(*recorder.decommissioned.lock().await, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn sweep_decommissions_expired_assignments() {
        let store = ReservationStore::in_memory().unwrap();
        let mut stale = volume("r1");
        stale.created = Utc::now() - chrono::Duration::seconds(7200);
        stale.duration = 3600;
        store.put(&stale).await.unwrap();

        let client = Arc::new(FakeRegistry {
            canonical: ["r1".to_string()].into_iter().collect(),
        });
        let recorder = Arc::new(RecordingProvisioner {
            decommissioned: Mutex::new(Vec::new()),
        });

        let janitor = Janitor::new(
            client,
            store,
            Arc::new(recorder.clone()),
            "node-a",
            Duration::from_secs(60),
        );

        janitor.sweep(&CancellationToken::new()).await.unwrap();

        assert_eq!(*recorder.decommissioned.lock().await, vec!["r1".to_string()]);
    }
}
