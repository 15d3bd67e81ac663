//! Scheduler-owned records. The control plane only stores, snapshots and
//! restores these; placement logic lives elsewhere.

use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub datacenter: String,
    pub status: String,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            datacenter: "dc1".to_string(),
            status: "ready".to_string(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn canonicalize(&mut self) {
        if self.status.is_empty() {
            self.status = "initializing".to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    #[serde(rename = "ID")]
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub version: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            namespace: DEFAULT_NAMESPACE.to_string(),
            version: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn canonicalize(&mut self) {
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Evaluation {
    #[serde(rename = "ID")]
    pub id: String,
    pub namespace: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub status: String,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Evaluation {
    pub fn new(id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_id: job_id.into(),
            status: "pending".to_string(),
            create_index: 0,
            modify_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,
    pub namespace: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub client_status: String,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    pub fn new(
        id: impl Into<String>,
        job_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_id: job_id.into(),
            node_id: node_id.into(),
            client_status: "pending".to_string(),
            create_index: 0,
            modify_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobSummary {
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub namespace: String,
    pub running: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Deployment {
    #[serde(rename = "ID")]
    pub id: String,
    pub namespace: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub status: String,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Namespace {
    pub name: String,
    pub description: String,
    pub create_index: u64,
    pub modify_index: u64,
}

/// Last-modified index of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexEntry {
    pub key: String,
    pub value: u64,
}
