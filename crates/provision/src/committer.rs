//! Outermost layer: reports results to the registry. Local state is already
//! final when a report goes out, so a missed report never rolls anything
//! back; the next reconciliation cycle re-submits the cached result.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use gridnode_core::types::{Reservation, ReservationResult};
use gridnode_core::NodeIdentity;
use gridnode_registry_client::{RegistryClient, SignedResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Provisioner;

pub struct CommitterProvisioner<P> {
    inner: P,
    client: Arc<dyn RegistryClient>,
    identity: NodeIdentity,
}

impl<P> CommitterProvisioner<P> {
    pub fn new(inner: P, client: Arc<dyn RegistryClient>, identity: NodeIdentity) -> Self {
        Self {
            inner,
            client,
            identity,
        }
    }
}

#[async_trait]
impl<P: Provisioner> Provisioner for CommitterProvisioner<P> {
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<ReservationResult> {
        let result = self.inner.provision(ctx, reservation).await?;

        let signed = SignedResult::sign(&result, &self.identity);
        match self.client.submit_result(&signed).await {
            Ok(()) => debug!("reported result for reservation {}", reservation.id),
            Err(e) => warn!(
                "failed to report result for reservation {}: {}",
                reservation.id, e
            ),
        }

        Ok(result)
    }

    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        self.inner.decommission(ctx, reservation).await?;

        if let Err(e) = self
            .client
            .mark_deleted(&self.identity.node_id(), &reservation.id)
            .await
        {
            warn!(
                "failed to confirm deletion of reservation {}: {}",
                reservation.id, e
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridnode_core::types::{ReservationType, ResultState};
    use gridnode_core::verify_hex;
    use gridnode_registry_client::{RegistryError, Workload};
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    struct FakeRegistry {
        fail: bool,
        submitted: Mutex<Vec<SignedResult>>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                submitted: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            })
        }
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
            Ok(HashSet::new())
        }

        async fn submit_result(&self, result: &SignedResult) -> Result<(), RegistryError> {
            if self.fail {
                return Err(RegistryError::Network("registry down".into()));
            }
            self.submitted.lock().await.push(result.clone());
            Ok(())
        }

        async fn mark_deleted(
            &self,
            _node_id: &str,
            workload_id: &str,
        ) -> Result<(), RegistryError> {
            if self.fail {
                return Err(RegistryError::Network("registry down".into()));
            }
            self.deleted.lock().await.push(workload_id.to_string());
            Ok(())
        }
    }

    struct OkInner;

    #[async_trait]
    impl Provisioner for OkInner {
        async fn provision(
            &self,
            _ctx: &CancellationToken,
            reservation: &Reservation,
        ) -> Result<ReservationResult> {
            Ok(ReservationResult::ok(
                reservation,
                serde_json::json!({"path": "/dev/vda"}),
            ))
        }

        async fn decommission(
            &self,
            _ctx: &CancellationToken,
            _reservation: &Reservation,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn volume() -> Reservation {
        Reservation {
            id: "r1".into(),
            node_id: "node-a".into(),
            reservation_type: ReservationType::Volume,
            data: serde_json::json!({"size": 10}),
            created: Utc::now(),
            duration: 0,
            to_delete: false,
        }
    }

    #[tokio::test]
    async fn submits_a_verifiable_signed_result() {
        let registry = FakeRegistry::new(false);
        let identity = NodeIdentity::generate();
        let committer = CommitterProvisioner::new(OkInner, registry.clone(), identity.clone());

        committer
            .provision(&CancellationToken::new(), &volume())
            .await
            .unwrap();

        let submitted = registry.submitted.lock().await;
        assert_eq!(submitted.len(), 1);
        let signed = &submitted[0];
        assert_eq!(signed.node_id, identity.node_id());
        assert!(verify_hex(
            &signed.node_id,
            &signed.result.signing_bytes(),
            &signed.signature
        )
        .unwrap());
    }

    #[tokio::test]
    async fn registry_failure_does_not_affect_the_local_result() {
        let registry = FakeRegistry::new(true);
        let committer =
            CommitterProvisioner::new(OkInner, registry, NodeIdentity::generate());

        let result = committer
            .provision(&CancellationToken::new(), &volume())
            .await
            .unwrap();

        assert_eq!(result.state, ResultState::Ok);
    }

    #[tokio::test]
    async fn decommission_confirms_deletion_best_effort() {
        let registry = FakeRegistry::new(false);
        let committer = CommitterProvisioner::new(
            OkInner,
            registry.clone(),
            NodeIdentity::generate(),
        );

        committer
            .decommission(&CancellationToken::new(), &volume())
            .await
            .unwrap();

        assert_eq!(*registry.deleted.lock().await, vec!["r1".to_string()]);
    }
}
