//! Reservation event sources and their combinator.
//!
//! Every source is a long-lived producer task pushing into a bounded channel.
//! A full channel blocks the producer rather than dropping events, so
//! at-least-once delivery holds even under a slow engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use gridnode_core::types::Reservation;
use gridnode_registry_client::RegistryClient;
use gridnode_store::ReservationStore;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A reservation change observed by a source.
#[derive(Debug, Clone)]
pub enum ReservationEvent {
    Provision(Reservation),
    Decommission(Reservation),
}

impl ReservationEvent {
    pub fn reservation(&self) -> &Reservation {
        match self {
            ReservationEvent::Provision(r) | ReservationEvent::Decommission(r) => r,
        }
    }
}

/// A producer of reservation events. `run` owns the task body: it produces
/// into `tx` until the token is cancelled or the channel closes.
#[async_trait]
pub trait ReservationSource: Send + 'static {
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<ReservationEvent>,
        ctx: CancellationToken,
    ) -> Result<()>;
}

/// Jittered exponential backoff for registry errors: doubles up to `max`,
/// with ±50% jitter so a fleet of nodes does not stampede a recovering
/// registry.
struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    fn next(&mut self) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = self.current.mul_f64(factor);
        self.current = std::cmp::min(self.current * 2, self.max);
        jittered
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

async fn deliver(
    tx: &mpsc::Sender<ReservationEvent>,
    ctx: &CancellationToken,
    event: ReservationEvent,
) -> Result<bool> {
    tokio::select! {
        _ = ctx.cancelled() => Ok(false),
        sent = tx.send(event) => {
            sent.map_err(|_| anyhow!("reservation event channel closed"))?;
            Ok(true)
        }
    }
}

/// Polls the registry for the node's assigned workloads on a fixed interval.
///
/// New reservations are emitted in provision order (networks and storage
/// before the containers and VMs that depend on them) and workloads flagged
/// for deletion become decommission events. The seen-sets only suppress
/// re-emission within this process; after a restart everything is re-emitted
/// and the cache short-circuits the duplicates.
pub struct PollSource {
    client: Arc<dyn RegistryClient>,
    node_id: String,
    interval: Duration,
    seen: HashSet<String>,
    deleted: HashSet<String>,
}

impl PollSource {
    pub fn new(client: Arc<dyn RegistryClient>, node_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            client,
            node_id: node_id.into(),
            interval,
            seen: HashSet::new(),
            deleted: HashSet::new(),
        }
    }

    async fn emit_batch(
        &mut self,
        workloads: Vec<gridnode_registry_client::Workload>,
        tx: &mpsc::Sender<ReservationEvent>,
        ctx: &CancellationToken,
    ) -> Result<bool> {
        let mut fresh = Vec::new();
        let mut doomed = Vec::new();

        for workload in workloads {
            let reservation = match workload.into_reservation() {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping workload from registry: {}", e);
                    continue;
                }
            };

            if reservation.to_delete {
                if self.deleted.insert(reservation.id.clone()) {
                    doomed.push(reservation);
                }
                continue;
            }

            if self.seen.insert(reservation.id.clone()) {
                fresh.push(reservation);
            }
        }

        fresh.sort_by(|a, b| {
            a.reservation_type
                .provision_priority()
                .cmp(&b.reservation_type.provision_priority())
                .then_with(|| a.id.cmp(&b.id))
        });

        for reservation in fresh {
            debug!(
                "observed reservation {} ({})",
                reservation.id,
                reservation.reservation_type.as_str()
            );
            if !deliver(tx, ctx, ReservationEvent::Provision(reservation)).await? {
                return Ok(false);
            }
        }

        for reservation in doomed {
            debug!("reservation {} flagged for deletion", reservation.id);
            if !deliver(tx, ctx, ReservationEvent::Decommission(reservation)).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl ReservationSource for PollSource {
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<ReservationEvent>,
        ctx: CancellationToken,
    ) -> Result<()> {
        let mut source = self;
        let mut backoff = Backoff::new(source.interval, source.interval * 16);

        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let delay = match source.client.list_workloads(&source.node_id).await {
                Ok(workloads) => {
                    backoff.reset();
                    if !source.emit_batch(workloads, &tx, &ctx).await? {
                        return Ok(());
                    }
                    source.interval
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!("failed to poll registry: {}; retrying in {:?}", e, delay);
                    delay
                }
            };

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Scans the durable cache for reservations that expired locally or were
/// flagged for deletion, and emits decommission events for them. Entries a
/// teardown failed on stay in the cache and are re-emitted next cycle.
pub struct DecommissionSource {
    store: ReservationStore,
    interval: Duration,
}

impl DecommissionSource {
    pub fn new(store: ReservationStore, interval: Duration) -> Self {
        Self { store, interval }
    }
}

#[async_trait]
impl ReservationSource for DecommissionSource {
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<ReservationEvent>,
        ctx: CancellationToken,
    ) -> Result<()> {
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let now = Utc::now();
            for entry in self.store.list().await? {
                let reservation = entry.reservation;
                if !reservation.to_delete && !reservation.expired(now) {
                    continue;
                }
                debug!(
                    "cached reservation {} is {}",
                    reservation.id,
                    if reservation.to_delete { "flagged for deletion" } else { "expired" }
                );
                if !deliver(&tx, &ctx, ReservationEvent::Decommission(reservation)).await? {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Merges N sources into one stream. Each source produces into its own
/// bounded buffer and a forwarder per source moves events into the merged
/// channel, so one blocked source never starves another and per-source order
/// is preserved. Cancelling the token stops everything.
pub struct CombinedSource {
    sources: Vec<Box<dyn ReservationSource>>,
    buffer: usize,
}

impl CombinedSource {
    pub fn new(buffer: usize) -> Self {
        Self {
            sources: Vec::new(),
            buffer,
        }
    }

    pub fn with_source(mut self, source: impl ReservationSource) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Spawn every source plus its forwarder; returns the merged receiver.
    pub fn spawn(self, ctx: &CancellationToken) -> mpsc::Receiver<ReservationEvent> {
        let (out_tx, out_rx) = mpsc::channel(self.buffer);

        for source in self.sources {
            let (tx, mut rx) = mpsc::channel(self.buffer);

            let source_ctx = ctx.child_token();
            tokio::spawn(async move {
                if let Err(e) = source.run(tx, source_ctx).await {
                    error!("reservation source stopped: {:#}", e);
                }
            });

            let out = out_tx.clone();
            let forward_ctx = ctx.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = forward_ctx.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                if out.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        out_rx
    }
}
