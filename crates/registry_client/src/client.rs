use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::types::{SignedResult, WorkloadIdsResponse, WorkloadListResponse};
use crate::{RegistryClient, Workload};

/// HTTP implementation of the registry client.
pub struct HttpRegistryClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set a bearer token for authenticated deployments.
    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get<T>(&self, path: &str) -> Result<T, RegistryError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).timeout(self.timeout);

        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(RegistryError::from_reqwest)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(RegistryError::from_reqwest)?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| RegistryError::Deserialization(e.to_string()))
        } else {
            Err(RegistryError::Http {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    async fn post<B>(&self, path: &str, body: &B) -> Result<(), RegistryError>
    where
        B: serde::Serialize,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body).timeout(self.timeout);

        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(RegistryError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response
                .text()
                .await
                .map_err(RegistryError::from_reqwest)?;
            Err(RegistryError::Http {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_workloads(&self, node_id: &str) -> Result<Vec<Workload>, RegistryError> {
        let path = format!("/nodes/{}/workloads", node_id);
        let response: WorkloadListResponse = self.get(&path).await?;
        Ok(response.workloads)
    }

    async fn list_workload_ids(&self, node_id: &str) -> Result<HashSet<String>, RegistryError> {
        let path = format!("/nodes/{}/workloads/ids", node_id);
        let response: WorkloadIdsResponse = self.get(&path).await?;
        Ok(response.ids.into_iter().collect())
    }

    async fn submit_result(&self, result: &SignedResult) -> Result<(), RegistryError> {
        let path = format!("/workloads/{}/result", result.result.workload_id);
        self.post(&path, result).await
    }

    async fn mark_deleted(&self, node_id: &str, workload_id: &str) -> Result<(), RegistryError> {
        let path = format!("/nodes/{}/workloads/{}/deleted", node_id, workload_id);
        self.post(&path, &serde_json::json!({})).await
    }
}
