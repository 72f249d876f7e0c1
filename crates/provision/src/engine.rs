//! The reconciliation loop: consumes merged reservation events and drives
//! them through the provisioner chain over a bounded worker pool.
//!
//! Reconciliation is level-triggered. The engine never retries internally:
//! an Error result is persisted by the cache and re-deliveries short-circuit
//! to it, so persistent failures stay visible instead of being masked by
//! silent retries. Removing and re-creating the reservation is the recovery
//! path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use gridnode_core::types::{Reservation, ReservationResult, ResourceUnits};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::janitor::Janitor;
use crate::source::ReservationEvent;
use crate::Provisioner;

pub struct EngineOptions {
    pub provisioner: Arc<dyn Provisioner>,
    pub events: mpsc::Receiver<ReservationEvent>,
    pub janitor: Option<Janitor>,
    /// Shared counters handle from the statistics layer.
    pub counters: Arc<tokio::sync::Mutex<ResourceUnits>>,
    pub total: ResourceUnits,
    /// Worker pool bound; sized to avoid resource storms on bulk replay at
    /// boot.
    pub workers: usize,
    /// How long in-flight chain invocations get to finish during shutdown.
    pub grace: Duration,
}

pub struct Engine {
    provisioner: Arc<dyn Provisioner>,
    events: mpsc::Receiver<ReservationEvent>,
    janitor: Option<Janitor>,
    counters: Arc<tokio::sync::Mutex<ResourceUnits>>,
    total: ResourceUnits,
    workers: usize,
    grace: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            provisioner: options.provisioner,
            events: options.events,
            janitor: options.janitor,
            counters: options.counters,
            total: options.total,
            workers: options.workers.max(1),
            grace: options.grace,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Capacity snapshot: (used, total).
    pub async fn counters(&self) -> (ResourceUnits, ResourceUnits) {
        (*self.counters.lock().await, self.total)
    }

    /// Provision directly through the full chain, outside the event loop.
    pub async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<ReservationResult> {
        self.provisioner.provision(ctx, reservation).await
    }

    /// Decommission directly through the full chain.
    pub async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        self.provisioner.decommission(ctx, reservation).await
    }

    /// Run until the token is cancelled, then drain in-flight work within
    /// the grace period.
    pub async fn run(mut self, ctx: CancellationToken) -> Result<()> {
        if let Some(janitor) = self.janitor.take() {
            tokio::spawn(janitor.run(ctx.child_token()));
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(event, &ctx, &semaphore, &mut tasks).await;
                }
            }
        }

        if !tasks.is_empty() {
            info!(
                "provision engine stopping; waiting up to {:?} for {} in-flight operations",
                self.grace,
                tasks.len()
            );
        }
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!("grace period expired with provisioning work still in flight");
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        event: ReservationEvent,
        ctx: &CancellationToken,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) {
        let id = event.reservation().id.clone();

        // One attempt per id at a time; the next poll cycle re-observes
        // anything we skip here.
        if !self.in_flight.lock().unwrap().insert(id.clone()) {
            debug!("reservation {} already in flight, skipping", id);
            return;
        }

        let permit = tokio::select! {
            _ = ctx.cancelled() => {
                self.in_flight.lock().unwrap().remove(&id);
                return;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.in_flight.lock().unwrap().remove(&id);
                    return;
                }
            },
        };

        let provisioner = self.provisioner.clone();
        let in_flight = self.in_flight.clone();
        let task_ctx = ctx.child_token();

        tasks.spawn(async move {
            let _permit = permit;
            match event {
                ReservationEvent::Provision(reservation) => {
                    match provisioner.provision(&task_ctx, &reservation).await {
                        Ok(result) if result.is_ok() => info!(
                            "provisioned reservation {} ({})",
                            reservation.id,
                            reservation.reservation_type.as_str()
                        ),
                        Ok(result) => warn!(
                            "reservation {} failed: {}",
                            reservation.id, result.error
                        ),
                        Err(e) => error!(
                            "error provisioning reservation {}: {:#}",
                            reservation.id, e
                        ),
                    }
                }
                ReservationEvent::Decommission(reservation) => {
                    match provisioner.decommission(&task_ctx, &reservation).await {
                        Ok(()) => info!("decommissioned reservation {}", reservation.id),
                        Err(e) => warn!(
                            "failed to decommission reservation {}: {:#}; will retry on a later cycle",
                            reservation.id, e
                        ),
                    }
                }
            }
            in_flight.lock().unwrap().remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use gridnode_core::types::ReservationType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowInner {
        provisions: AtomicUsize,
        decommissions: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Provisioner for Arc<SlowInner> {
        async fn provision(
            &self,
            _ctx: &CancellationToken,
            reservation: &Reservation,
        ) -> Result<ReservationResult> {
            tokio::time::sleep(self.delay).await;
            self.provisions.fetch_add(1, Ordering::SeqCst);
            Ok(ReservationResult::ok(reservation, serde_json::Value::Null))
        }

        async fn decommission(
            &self,
            _ctx: &CancellationToken,
            _reservation: &Reservation,
        ) -> Result<()> {
            self.decommissions.fetch_add(1, Ordering::SeqCst);
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

    fn engine(
        inner: Arc<SlowInner>,
        events: mpsc::Receiver<ReservationEvent>,
    ) -> Engine {
        Engine::new(EngineOptions {
            provisioner: Arc::new(inner),
            events,
            janitor: None,
            counters: Arc::new(tokio::sync::Mutex::new(ResourceUnits::default())),
            total: ResourceUnits::default(),
            workers: 4,
            grace: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn processes_events_until_cancelled() {
        let inner = Arc::new(SlowInner {
            provisions: AtomicUsize::new(0),
            decommissions: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (tx, rx) = mpsc::channel(8);
        let ctx = CancellationToken::new();

        let handle = tokio::spawn(engine(inner.clone(), rx).run(ctx.clone()));

        tx.send(ReservationEvent::Provision(volume("r1")))
            .await
            .unwrap();
        tx.send(ReservationEvent::Provision(volume("r2")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(inner.provisions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_in_flight_ids_are_skipped() {
        let inner = Arc::new(SlowInner {
            provisions: AtomicUsize::new(0),
            decommissions: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let (tx, rx) = mpsc::channel(8);
        let ctx = CancellationToken::new();

        let handle = tokio::spawn(engine(inner.clone(), rx).run(ctx.clone()));

        // Same id delivered twice while the first attempt is still running.
        tx.send(ReservationEvent::Provision(volume("r1")))
            .await
            .unwrap();
        tx.send(ReservationEvent::Provision(volume("r1")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(inner.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn direct_surface_bypasses_the_event_loop() {
        let inner = Arc::new(SlowInner {
            provisions: AtomicUsize::new(0),
            decommissions: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (_tx, rx) = mpsc::channel(8);
        let engine = engine(inner.clone(), rx);
        let ctx = CancellationToken::new();

        let result = engine.provision(&ctx, &volume("r1")).await.unwrap();
        assert!(result.is_ok());
        engine.decommission(&ctx, &volume("r1")).await.unwrap();
        assert_eq!(inner.provisions.load(Ordering::SeqCst), 1);
        assert_eq!(inner.decommissions.load(Ordering::SeqCst), 1);

        let (used, total) = engine.counters().await;
        assert!(used.is_zero());
        assert!(total.is_zero());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_work() {
        let inner = Arc::new(SlowInner {
            provisions: AtomicUsize::new(0),
            decommissions: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let (tx, rx) = mpsc::channel(8);
        let ctx = CancellationToken::new();

        let handle = tokio::spawn(engine(inner.clone(), rx).run(ctx.clone()));

        tx.send(ReservationEvent::Provision(volume("r1")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        // The attempt that was mid-flight at cancellation completed.
        assert_eq!(inner.provisions.load(Ordering::SeqCst), 1);
    }
}
