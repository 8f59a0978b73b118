//! Cluster-level commands carried in log entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Settings shared by every node of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfiguration {
    pub enable_replication: bool,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

// --- 业务命令定义 ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ClusterCommand {
    ClusterConfigurationUpdate {
        configuration: ClusterConfiguration,
    },
    DatabaseUpdate {
        name: String,
        document: serde_json::Value,
    },
    DatabaseDeleted {
        name: String,
        hard_delete: bool,
    },
}

impl ClusterCommand {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}
