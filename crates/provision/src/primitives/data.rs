use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use gridnode_core::types::ResourceUnits;

use crate::error::ProvisionError;

/// Compute capacity requested by a container workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadCapacity {
    /// Virtual cores.
    #[serde(default)]
    pub cpu: u64,
    /// Memory in MiB.
    #[serde(default)]
    pub memory: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMount {
    pub volume_id: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerData {
    /// Root filesystem image reference.
    pub flist: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<ContainerMount>,
    /// Network reservation this container joins.
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub capacity: WorkloadCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Ssd,
    Hdd,
}

impl Default for DiskKind {
    fn default() -> Self {
        DiskKind::Ssd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeData {
    /// Size in GiB.
    pub size: u64,
    #[serde(default, rename = "type")]
    pub kind: DiskKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkData {
    pub name: String,
    #[serde(default)]
    pub ip_range: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZdbMode {
    Seq,
    User,
}

impl Default for ZdbMode {
    fn default() -> Self {
        ZdbMode::Seq
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZdbData {
    /// Size in GiB.
    pub size: u64,
    #[serde(default)]
    pub disk_type: DiskKind,
    #[serde(default)]
    pub mode: ZdbMode,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesData {
    /// VM size preset.
    pub size: u8,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub cluster_secret: String,
    #[serde(default)]
    pub master_ips: Vec<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

impl KubernetesData {
    /// Footprint of the VM size preset.
    pub fn capacity(&self) -> Result<ResourceUnits, ProvisionError> {
        match self.size {
            1 => Ok(ResourceUnits {
                cru: 1,
                mru: 2,
                sru: 50,
                hru: 0,
            }),
            2 => Ok(ResourceUnits {
                cru: 2,
                mru: 4,
                sru: 100,
                hru: 0,
            }),
            other => Err(ProvisionError::Validation(format!(
                "unsupported kubernetes vm size {}",
                other
            ))),
        }
    }
}
