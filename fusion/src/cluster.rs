// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use log::info;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::Error;
use crate::recovery::{validate_faults, RecoveredData, RecoveryOrchestrator};
use fusion_transport::{
    BackupService, ClusterInfo, Directory, Key, Mutation, PrimaryService, StructureId,
    StructureKind, Value,
};

/// Client of a cluster of primaries sharing one set of backups.
///
/// Data operations address a primary by its ordinal, the order in which the primaries were
/// given to [`Cluster::create`]. That order is also the registration order on every backup.
pub struct Cluster<P: PrimaryService, B: BackupService> {
    kind: StructureKind,
    info: ClusterInfo,
    config: Config,
    primaries: Vec<(P, StructureId)>,
    backup_endpoints: Vec<String>,
    directory: Directory<B>,
}

impl<P: PrimaryService, B: BackupService> Cluster<P, B> {
    /// Creates one structure of `kind` on every primary.
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of the structures.
    /// * `info` - The cluster shape; `primaries` must hold exactly `info.primaries()` nodes.
    /// * `config` - The client configuration.
    /// * `primaries` - The primary nodes, in ordinal order.
    /// * `backup_endpoints` - The backups, in code position order.
    /// * `directory` - Resolves the backup endpoints at recovery time.
    pub async fn create(
        kind: StructureKind,
        info: ClusterInfo,
        config: Config,
        primaries: Vec<P>,
        backup_endpoints: Vec<String>,
        directory: Directory<B>,
    ) -> Result<Self, Error> {
        info.validate()?;
        if primaries.len() != info.primaries() {
            return Err(Error::InvalidCluster(format!(
                "cluster {} expects {} primaries, got {}",
                info.cluster_id(),
                info.primaries(),
                primaries.len()
            )));
        }

        let mut structures = Vec::with_capacity(primaries.len());
        for primary in primaries {
            let id = primary
                .create_structure(kind, backup_endpoints.clone(), info.clone())
                .await?;
            structures.push((primary, id));
        }
        info!(
            "created {} cluster {} with {} primaries and {} backups",
            kind,
            info.cluster_id(),
            info.primaries(),
            info.faults()
        );

        Ok(Self {
            kind,
            info,
            config,
            primaries: structures,
            backup_endpoints,
            directory,
        })
    }

    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    /// Structure identifier hosted by the primary at `ordinal`.
    pub fn structure_id(&self, ordinal: usize) -> Result<&str, Error> {
        Ok(&self.primary(ordinal)?.1)
    }

    pub async fn insert(&self, ordinal: usize, index: Key, value: Value) -> Result<(), Error> {
        self.expect_kind("insert", StructureKind::List)?;
        self.mutate(ordinal, Mutation::Add { key: index, value })
            .await
    }

    pub async fn append(&self, ordinal: usize, value: Value) -> Result<(), Error> {
        self.expect_kind("append", StructureKind::List)?;
        self.mutate(ordinal, Mutation::Append { value }).await
    }

    pub async fn put(&self, ordinal: usize, key: Key, value: Value) -> Result<(), Error> {
        self.expect_kind("put", StructureKind::Map)?;
        self.mutate(ordinal, Mutation::Add { key, value }).await
    }

    pub async fn enqueue(&self, ordinal: usize, value: Value) -> Result<(), Error> {
        self.expect_kind("enqueue", StructureKind::Queue)?;
        self.mutate(ordinal, Mutation::Append { value }).await
    }

    pub async fn dequeue(&self, ordinal: usize) -> Result<Value, Error> {
        self.expect_kind("dequeue", StructureKind::Queue)?;
        let value = self.get(ordinal, 0).await?;
        self.mutate(ordinal, Mutation::Remove { key: 0 }).await?;
        Ok(value)
    }

    pub async fn peek(&self, ordinal: usize) -> Result<Value, Error> {
        self.expect_kind("peek", StructureKind::Queue)?;
        self.get(ordinal, 0).await
    }

    pub async fn remove(&self, ordinal: usize, key: Key) -> Result<(), Error> {
        self.mutate(ordinal, Mutation::Remove { key }).await
    }

    pub async fn get(&self, ordinal: usize, key: Key) -> Result<Value, Error> {
        let (primary, id) = self.primary(ordinal)?;
        Ok(primary.get_value(id, key).await?)
    }

    /// All values of one primary ordered by key.
    pub async fn values(&self, ordinal: usize) -> Result<BTreeMap<Key, Value>, Error> {
        let (primary, id) = self.primary(ordinal)?;
        Ok(primary.get_all_values(id).await?)
    }

    /// Contents of a list or queue primary in order.
    pub async fn sequence(&self, ordinal: usize) -> Result<Vec<Value>, Error> {
        if !self.kind.is_positional() {
            return Err(Error::ProtocolViolation(format!(
                "a {} has no sequence",
                self.kind
            )));
        }
        Ok(self.values(ordinal).await?.into_values().collect())
    }

    /// Rebuilds the contents of the faulted primaries.
    ///
    /// The fault set is checked before any node is contacted. The surviving primaries are read
    /// first, then the backups.
    pub async fn recover(&self, faults: &[usize]) -> Result<RecoveredData, Error> {
        let fault_set = validate_faults(&self.info, faults)?;
        let backups = if fault_set.is_empty() {
            Vec::new()
        } else {
            self.directory
                .resolve_all(&self.backup_endpoints)
                .map_err(Error::ConnectivityFailure)?
        };

        let mut surviving = BTreeMap::new();
        if !fault_set.is_empty() {
            for (ordinal, (primary, id)) in self.primaries.iter().enumerate() {
                if fault_set.contains(&ordinal) {
                    continue;
                }
                surviving.insert(ordinal, primary.get_all_values(id).await?);
            }
        }

        RecoveryOrchestrator::new(self.kind, self.info.clone(), self.config.clone(), backups)
            .recover(faults, &surviving)
            .await
    }

    async fn mutate(&self, ordinal: usize, mutation: Mutation) -> Result<(), Error> {
        let (primary, id) = self.primary(ordinal)?;
        Ok(primary.mutate(id, mutation).await?)
    }

    fn primary(&self, ordinal: usize) -> Result<&(P, StructureId), Error> {
        self.primaries.get(ordinal).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "cluster {} has no primary {}",
                self.info.cluster_id(),
                ordinal
            ))
        })
    }

    fn expect_kind(&self, operation: &str, kind: StructureKind) -> Result<(), Error> {
        if self.kind != kind {
            return Err(Error::ProtocolViolation(format!(
                "{} is a {} operation, cluster {} holds a {}",
                operation,
                kind,
                self.info.cluster_id(),
                self.kind
            )));
        }
        Ok(())
    }
}
