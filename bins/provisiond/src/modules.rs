//! Thin clients for the node's backend module daemons.
//!
//! Each backend (container runtime, storage, networking, zdb, kubernetes)
//! runs as its own daemon with a local HTTP endpoint; these clients implement
//! the engine's [`Primitive`] contract by delegating to it. The engine itself
//! only ever sees the contract.

use anyhow::{bail, Result};
use async_trait::async_trait;
use gridnode_core::types::Reservation;
use gridnode_provision::Primitive;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// HTTP plumbing for one backend module daemon.
#[derive(Clone)]
pub struct ModuleClient {
    base_url: String,
    client: Client,
}

impl ModuleClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    async fn provision(&self, reservation: &Reservation) -> Result<serde_json::Value> {
        let url = format!("{}/provision/{}", self.base_url, reservation.id);
        debug!("provisioning {} via {}", reservation.id, url);

        let response = self
            .client
            .post(&url)
            .json(&reservation.data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("module returned {}: {}", status, body);
        }

        Ok(response.json().await?)
    }

    async fn decommission(&self, reservation: &Reservation) -> Result<()> {
        let url = format!("{}/provision/{}", self.base_url, reservation.id);
        debug!("decommissioning {} via {}", reservation.id, url);

        let response = self.client.delete(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("module returned {}: {}", status, body);
        }

        Ok(())
    }
}

/// Backend handler delegating one reservation type to a module daemon.
pub struct ModulePrimitive {
    module: ModuleClient,
}

impl ModulePrimitive {
    pub fn new(module: ModuleClient) -> Self {
        Self { module }
    }
}

#[async_trait]
impl Primitive for ModulePrimitive {
    async fn provision(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<serde_json::Value> {
        tokio::select! {
            _ = ctx.cancelled() => bail!("provisioning cancelled"),
            output = self.module.provision(reservation) => output,
        }
    }

    async fn decommission(
        &self,
        ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        tokio::select! {
            _ = ctx.cancelled() => bail!("decommission cancelled"),
            outcome = self.module.decommission(reservation) => outcome,
        }
    }
}

/// Debug reservations only redirect the node's log stream; there is no
/// backend daemon involved.
pub struct DebugPrimitive;

#[async_trait]
impl Primitive for DebugPrimitive {
    async fn provision(
        &self,
        _ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<serde_json::Value> {
        info!(
            "debug reservation {} active: {}",
            reservation.id, reservation.data
        );
        Ok(serde_json::Value::Null)
    }

    async fn decommission(
        &self,
        _ctx: &CancellationToken,
        reservation: &Reservation,
    ) -> Result<()> {
        info!("debug reservation {} released", reservation.id);
        Ok(())
    }
}
