// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror;

/// Logical key of an element: a position for lists and queues, a caller chosen key for maps.
pub type Key = i64;

/// Value stored in a structure. Coded as four GF(2^16) words.
pub type Value = u64;

/// Identifier minted by a node for a structure it hosts.
pub type StructureId = String;

/// Largest number of primaries plus backups a GF(2^16) code can address.
pub const MAX_CODE_LENGTH: usize = 65536;

/// Error type for operations crossing the service boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The fused structure of the cluster has not seen all of its primaries yet.
    #[error("Cluster {0} is not ready: not all primaries have registered")]
    NotReady(String),

    /// The addressed structure, key or index does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The request breaks the replication protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The cluster description is unusable.
    #[error("Invalid cluster information: {0}")]
    InvalidCluster(String),

    /// The structure no longer matches its backups and refuses to serve recovery.
    #[error("Desynchronized: {0}")]
    Desynchronized(String),

    /// The remote node could not be reached.
    #[error("Endpoint {0} is unreachable")]
    Unreachable(String),

    /// A catch-all error for other types of errors.
    #[error("Error occurred: {0}")]
    Other(#[source] anyhow::Error),
}

/// Kind of data structure hosted by a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureKind {
    List,
    Map,
    Queue,
}

impl StructureKind {
    /// Returns true if keys of this kind are the contiguous positions `0..len`.
    pub fn is_positional(self) -> bool {
        match self {
            StructureKind::List | StructureKind::Queue => true,
            StructureKind::Map => false,
        }
    }
}

impl From<StructureKind> for &str {
    fn from(val: StructureKind) -> &'static str {
        match val {
            StructureKind::List => "list",
            StructureKind::Map => "map",
            StructureKind::Queue => "queue",
        }
    }
}

impl std::fmt::Display for StructureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// Immutable description of a cluster: `primaries` data holders protected against `faults`
/// simultaneous failures by the same number of backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    cluster_id: String,
    primaries: usize,
    faults: usize,
}

impl ClusterInfo {
    /// Creates a new `ClusterInfo`.
    ///
    /// # Arguments
    ///
    /// * `cluster_id` - The identifier shared by every structure of the cluster.
    /// * `primaries` - The number of primaries (N).
    /// * `faults` - The number of tolerated primary faults, which is also the number of backups (F).
    ///
    /// # Returns
    ///
    /// The cluster information, or `Error::InvalidCluster` if the shape cannot be coded.
    pub fn new(cluster_id: impl Into<String>, primaries: usize, faults: usize) -> Result<Self, Error> {
        let info = Self {
            cluster_id: cluster_id.into(),
            primaries,
            faults,
        };
        info.validate()?;
        Ok(info)
    }

    /// Checks the shape of a cluster description, e.g. one received over the wire.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_id.is_empty() {
            return Err(Error::InvalidCluster("empty cluster identifier".to_string()));
        }
        if self.primaries == 0 || self.faults == 0 {
            return Err(Error::InvalidCluster(format!(
                "cluster {} needs at least one primary and one backup, got {}+{}",
                self.cluster_id, self.primaries, self.faults
            )));
        }
        if self.primaries + self.faults > MAX_CODE_LENGTH {
            return Err(Error::InvalidCluster(format!(
                "cluster {} has {} nodes, more than a GF(2^16) code supports",
                self.cluster_id,
                self.primaries + self.faults
            )));
        }
        Ok(())
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn primaries(&self) -> usize {
        self.primaries
    }

    pub fn faults(&self) -> usize {
        self.faults
    }
}

/// Mutation sent by a client to a primary structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Insert at a list position or set a map key.
    Add { key: Key, value: Value },
    /// Append to a list or enqueue onto a queue.
    Append { value: Value },
    /// Remove a list position, a map key or (key 0) the front of a queue.
    Remove { key: Key },
}

/// Mutation forwarded by a primary to every backup of its cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FusedMutation {
    /// A value was added at `key`. `previous` is set when a map key was overwritten.
    Add {
        key: Key,
        value: Value,
        previous: Option<Value>,
    },
    /// The value at `key` was removed and `replacement` was compacted into its slot.
    Remove {
        key: Key,
        value: Value,
        replacement: Value,
    },
}

/// Everything a backup holds for one cluster: one codeword per stripe and, per stripe, the
/// logical key each primary keeps there (`None` if the primary has no element at that depth).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryData {
    pub codewords: Vec<Value>,
    pub index_data: Vec<Vec<Option<Key>>>,
}

/// Service exposed by a primary node.
#[async_trait]
pub trait PrimaryService: Send + Sync + Clone {
    /// Creates a structure of the given kind and its fused counterpart on every backup.
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of structure to create.
    /// * `backup_endpoints` - The backups of the cluster; the order fixes each backup's code position.
    /// * `cluster` - The cluster the structure belongs to.
    ///
    /// # Returns
    ///
    /// The identifier of the new structure.
    async fn create_structure(
        &self,
        kind: StructureKind,
        backup_endpoints: Vec<String>,
        cluster: ClusterInfo,
    ) -> Result<StructureId, Error>;

    /// Applies a mutation to the structure and forwards it to the backups.
    async fn mutate(&self, structure_id: &str, mutation: Mutation) -> Result<(), Error>;

    /// Reads the value stored at `key`.
    async fn get_value(&self, structure_id: &str, key: Key) -> Result<Value, Error>;

    /// Reads every value of the structure, ordered by key.
    async fn get_all_values(&self, structure_id: &str) -> Result<BTreeMap<Key, Value>, Error>;
}

/// Service exposed by a backup node.
#[async_trait]
pub trait BackupService: Send + Sync + Clone {
    /// Creates the cluster's fused structure if needed and registers a primary structure with it.
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of the primary structure.
    /// * `primary_structure_id` - The structure registering with the backup.
    /// * `cluster` - The cluster the structure belongs to.
    /// * `backup_position` - The code position of this backup, `0..faults`.
    ///
    /// # Returns
    ///
    /// The identifier of the fused structure.
    async fn create_fused_structure(
        &self,
        kind: StructureKind,
        primary_structure_id: &str,
        cluster: ClusterInfo,
        backup_position: usize,
    ) -> Result<StructureId, Error>;

    /// Applies a mutation forwarded by a primary structure.
    async fn mutate(
        &self,
        cluster_id: &str,
        primary_structure_id: &str,
        mutation: FusedMutation,
    ) -> Result<(), Error>;

    /// Returns the codewords and cross-reference table of the cluster.
    async fn recovery_data(&self, cluster_id: &str) -> Result<RecoveryData, Error>;
}
