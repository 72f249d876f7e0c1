//! Base of the provisioner chain: routes each reservation to the
//! type-specific backend handler that actually creates or destroys the
//! underlying resource.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use gridnode_core::types::{Reservation, ReservationResult, ReservationType};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ProvisionError;
use crate::Provisioner;

mod data;

pub use data::{
    ContainerData, ContainerMount, DiskKind, KubernetesData, NetworkData, VolumeData,
    WorkloadCapacity, ZdbData, ZdbMode,
};

/// Per-type backend contract. Implementations are the only place that talks
/// to the concrete backend (container runtime, storage daemon, ...); handlers
/// should observe the token for long-running work and must tolerate repeated
/// decommission calls. Idempotency across re-delivery is provided one layer
/// up, by the cache.
#[async_trait]
pub trait Primitive: Send + Sync {
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<serde_json::Value>;

    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()>;
}

/// Dispatches reservations to registered handlers by type. A node without a
/// handler for some type (no kubernetes backend, say) records `UnknownType`
/// as an Error result instead of failing the process.
pub struct PrimitivesProvisioner {
    handlers: HashMap<ReservationType, Arc<dyn Primitive>>,
}

impl PrimitivesProvisioner {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(
        mut self,
        reservation_type: ReservationType,
        handler: Arc<dyn Primitive>,
    ) -> Self {
        self.handlers.insert(reservation_type, handler);
        self
    }

    pub fn registered_types(&self) -> Vec<ReservationType> {
        self.handlers.keys().copied().collect()
    }
}

impl Default for PrimitivesProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for PrimitivesProvisioner {
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<ReservationResult> {
        let handler = match self.handlers.get(&reservation.reservation_type) {
            Some(handler) => handler,
            None => {
                warn!(
                    "no handler registered for reservation {} ({})",
                    reservation.id,
                    reservation.reservation_type.as_str()
                );
                return Ok(ReservationResult::error(
                    reservation,
                    ProvisionError::UnknownType(reservation.reservation_type).to_string(),
                ));
            }
        };

        match handler.provision(ctx, reservation).await {
            Ok(data) => Ok(ReservationResult::ok(reservation, data)),
            Err(e) => {
                warn!("handler failed for reservation {}: {:#}", reservation.id, e);
                Ok(ReservationResult::error(reservation, format!("{:#}", e)))
            }
        }
    }

    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get(&reservation.reservation_type)
            .ok_or(ProvisionError::UnknownType(reservation.reservation_type))?;

        handler.decommission(ctx, reservation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridnode_core::types::ResultState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePrimitive {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakePrimitive {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Primitive for FakePrimitive {
        async fn provision(
            &self,
            _ctx: &CancellationToken,
            _reservation: &Reservation,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("device busy");
            }
            Ok(serde_json::json!({"path": "/dev/vda"}))
        }

        async fn decommission(
            &self,
            _ctx: &CancellationToken,
            _reservation: &Reservation,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn reservation(reservation_type: ReservationType) -> Reservation {
        Reservation {
            id: "r1".into(),
            node_id: "node-a".into(),
            reservation_type,
            data: serde_json::json!({"size": 10}),
            created: Utc::now(),
            duration: 0,
            to_delete: false,
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let handler = Arc::new(FakePrimitive::new(false));
        let provisioner = PrimitivesProvisioner::new()
            .with_handler(ReservationType::Volume, handler.clone());

        let result = provisioner
            .provision(&CancellationToken::new(), &reservation(ReservationType::Volume))
            .await
            .unwrap();

        assert_eq!(result.state, ResultState::Ok);
        assert_eq!(result.data["path"], "/dev/vda");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_type_becomes_error_result() {
        let provisioner = PrimitivesProvisioner::new();

        let result = provisioner
            .provision(&CancellationToken::new(), &reservation(ReservationType::Zdb))
            .await
            .unwrap();

        assert_eq!(result.state, ResultState::Error);
        assert!(result.error.contains("unknown reservation type 'zdb'"));
    }

    #[tokio::test]
    async fn handler_failure_is_captured_not_thrown() {
        let provisioner = PrimitivesProvisioner::new()
            .with_handler(ReservationType::Volume, Arc::new(FakePrimitive::new(true)));

        let result = provisioner
            .provision(&CancellationToken::new(), &reservation(ReservationType::Volume))
            .await
            .unwrap();

        assert_eq!(result.state, ResultState::Error);
        assert!(result.error.contains("device busy"));
    }

    #[tokio::test]
    async fn decommission_of_unknown_type_is_an_error() {
        let provisioner = PrimitivesProvisioner::new();
        let err = provisioner
            .decommission(&CancellationToken::new(), &reservation(ReservationType::Network))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown reservation type"));
    }
}
