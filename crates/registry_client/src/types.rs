use chrono::{DateTime, Utc};
use gridnode_core::types::{Reservation, ReservationResult, ReservationType};
use gridnode_core::NodeIdentity;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// A reservation as the registry serves it over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub node_id: String,
    pub workload_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Unix timestamp (seconds) of issuance.
    pub created: i64,
    /// Requested lifetime in seconds, zero for open-ended.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub to_delete: bool,
}

fn parse_workload_type(raw: &str) -> Result<ReservationType, RegistryError> {
    let parsed = match raw {
        "container" => ReservationType::Container,
        "volume" => ReservationType::Volume,
        "network" => ReservationType::Network,
        "network_resource" => ReservationType::NetworkResource,
        "zdb" => ReservationType::Zdb,
        "debug" => ReservationType::Debug,
        "kubernetes" => ReservationType::Kubernetes,
        other => return Err(RegistryError::UnknownWorkloadType(other.to_string())),
    };
    Ok(parsed)
}

impl Workload {
    /// Translate the registry schema into the node's internal reservation.
    pub fn into_reservation(self) -> Result<Reservation, RegistryError> {
        let reservation_type = parse_workload_type(&self.workload_type)?;
        let created: DateTime<Utc> = DateTime::from_timestamp(self.created, 0)
            .ok_or_else(|| {
                RegistryError::InvalidWorkload(format!(
                    "workload {} has invalid created timestamp {}",
                    self.id, self.created
                ))
            })?;

        Ok(Reservation {
            id: self.id,
            node_id: self.node_id,
            reservation_type,
            data: self.data,
            created,
            duration: self.duration,
            to_delete: self.to_delete,
        })
    }
}

/// Result payload in the registry's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub workload_id: String,
    pub workload_type: String,
    pub state: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Unix timestamp (seconds) of the attempt.
    pub epoch: i64,
}

impl WorkloadResult {
    pub fn from_result(result: &ReservationResult) -> Self {
        Self {
            workload_id: result.id.clone(),
            workload_type: result.reservation_type.as_str().to_string(),
            state: result.state.as_str().to_string(),
            message: result.error.clone(),
            data: result.data.clone(),
            epoch: result.created.timestamp(),
        }
    }

    /// Canonical byte string covered by the node signature:
    /// workload id, state, message, then the JSON payload.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(self.workload_id.as_bytes());
        message.extend_from_slice(self.state.as_bytes());
        message.extend_from_slice(self.message.as_bytes());
        message.extend_from_slice(self.data.to_string().as_bytes());
        message
    }
}

/// A workload result signed with the node identity, ready for submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedResult {
    #[serde(flatten)]
    pub result: WorkloadResult,
    pub node_id: String,
    pub signature: String,
}

impl SignedResult {
    pub fn sign(result: &ReservationResult, identity: &NodeIdentity) -> Self {
        let wire = WorkloadResult::from_result(result);
        let signature = identity.sign_hex(&wire.signing_bytes());
        Self {
            result: wire,
            node_id: identity.node_id(),
            signature,
        }
    }
}

/// Response envelope for the node workload listing.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadListResponse {
    pub workloads: Vec<Workload>,
}

/// Response envelope for the canonical id listing.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadIdsResponse {
    pub ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridnode_core::types::ResultState;
    use gridnode_core::verify_hex;

    fn workload(workload_type: &str) -> Workload {
        Workload {
            id: "42-1".into(),
            node_id: "node-a".into(),
            workload_type: workload_type.into(),
            data: serde_json::json!({"size": 10}),
            created: 1_700_000_000,
            duration: 3600,
            to_delete: false,
        }
    }

    #[test]
    fn workload_translates_to_reservation() {
        let reservation = workload("volume").into_reservation().unwrap();
        assert_eq!(reservation.id, "42-1");
        assert_eq!(reservation.reservation_type, ReservationType::Volume);
        assert_eq!(reservation.duration, 3600);
        assert_eq!(reservation.created.timestamp(), 1_700_000_000);
    }

    #[test]
    fn unknown_workload_type_is_rejected() {
        let err = workload("mainframe").into_reservation().unwrap_err();
        assert!(matches!(err, RegistryError::UnknownWorkloadType(t) if t == "mainframe"));
    }

    #[test]
    fn signed_result_verifies_against_node_id() {
        let identity = NodeIdentity::generate();
        let reservation = workload("volume").into_reservation().unwrap();
        let result = ReservationResult::ok(&reservation, serde_json::json!({"path": "/dev/vda"}));

        let signed = SignedResult::sign(&result, &identity);
        assert_eq!(signed.result.state, ResultState::Ok.as_str());
        assert!(verify_hex(
            &signed.node_id,
            &signed.result.signing_bytes(),
            &signed.signature
        )
        .unwrap());
    }
}
