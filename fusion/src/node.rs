// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-process primary and backup nodes.
//!
//! Each node keeps a registry of the structures it hosts, keyed by identifier and guarded by one
//! async lock. Every hosted structure has its own lock that is held for the whole mutation,
//! which serializes mutations per structure while leaving different structures independent.

use async_trait::async_trait;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Error;
use crate::event::{EventBus, LogHandler, ReplicationForwarder};
use crate::fused::FusedStore;
use crate::primary::PrimaryStore;
use fusion_transport::{
    self as transport, BackupService, ClusterInfo, Directory, FusedMutation, Key, Mutation,
    PrimaryService, RecoveryData, StructureId, StructureKind, Value,
};

struct Hosted {
    store: PrimaryStore,
    events: EventBus,
    // set once a mutation was applied here but not on every backup
    diverged: Option<String>,
}

impl Hosted {
    fn synchronized(&self) -> Result<&PrimaryStore, Error> {
        match &self.diverged {
            Some(cause) => Err(Error::ProtocolInvariantViolation(format!(
                "{} diverged from its backups: {}",
                self.store.structure_id(),
                cause
            ))),
            None => Ok(&self.store),
        }
    }
}

/// A node hosting primary structures.
///
/// Backups are reached through the directory by the endpoint names given at structure creation.
#[derive(Clone)]
pub struct PrimaryNode<B: BackupService> {
    name: String,
    directory: Directory<B>,
    structures: Arc<Mutex<HashMap<StructureId, Arc<Mutex<Hosted>>>>>,
}

impl<B: BackupService + 'static> PrimaryNode<B> {
    pub fn new(name: impl Into<String>, directory: Directory<B>) -> Self {
        Self {
            name: name.into(),
            directory,
            structures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn hosted(&self, structure_id: &str) -> Result<Arc<Mutex<Hosted>>, Error> {
        self.structures
            .lock()
            .await
            .get(structure_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("structure {} on {}", structure_id, self.name)))
    }

    async fn create(
        &self,
        kind: StructureKind,
        backup_endpoints: Vec<String>,
        cluster: ClusterInfo,
    ) -> Result<StructureId, Error> {
        cluster.validate()?;
        if backup_endpoints.len() != cluster.faults() {
            return Err(Error::ProtocolViolation(format!(
                "cluster {} needs {} backups, got {}",
                cluster.cluster_id(),
                cluster.faults(),
                backup_endpoints.len()
            )));
        }
        let backups = self.directory.resolve_all(&backup_endpoints)?;

        let structure_id = Uuid::new_v4().to_string();
        for (position, backup) in backups.iter().enumerate() {
            backup
                .create_fused_structure(kind, &structure_id, cluster.clone(), position)
                .await?;
        }

        let mut events = EventBus::new();
        events.subscribe(Arc::new(LogHandler));
        events.subscribe(Arc::new(ReplicationForwarder::new(backups)));

        info!(
            "{}: created {} {} in cluster {}",
            self.name,
            kind,
            structure_id,
            cluster.cluster_id()
        );
        let hosted = Hosted {
            store: PrimaryStore::new(structure_id.clone(), kind, cluster),
            events,
            diverged: None,
        };
        self.structures
            .lock()
            .await
            .insert(structure_id.clone(), Arc::new(Mutex::new(hosted)));
        Ok(structure_id)
    }

    async fn apply(&self, structure_id: &str, mutation: Mutation) -> Result<(), Error> {
        let hosted = self.hosted(structure_id).await?;
        let mut hosted = hosted.lock().await;
        hosted.synchronized()?;
        let event = hosted.store.apply(mutation)?;
        if let Err(e) = hosted.events.publish(&event).await {
            warn!(
                "{}: {} applied a mutation its backups did not all receive: {}",
                self.name, structure_id, e
            );
            hosted.diverged = Some(e.to_string());
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl<B: BackupService + 'static> PrimaryService for PrimaryNode<B> {
    async fn create_structure(
        &self,
        kind: StructureKind,
        backup_endpoints: Vec<String>,
        cluster: ClusterInfo,
    ) -> Result<StructureId, transport::Error> {
        Ok(self.create(kind, backup_endpoints, cluster).await?)
    }

    async fn mutate(&self, structure_id: &str, mutation: Mutation) -> Result<(), transport::Error> {
        Ok(self.apply(structure_id, mutation).await?)
    }

    async fn get_value(&self, structure_id: &str, key: Key) -> Result<Value, transport::Error> {
        let hosted = self.hosted(structure_id).await?;
        let hosted = hosted.lock().await;
        Ok(hosted.store.get(key)?)
    }

    async fn get_all_values(
        &self,
        structure_id: &str,
    ) -> Result<BTreeMap<Key, Value>, transport::Error> {
        let hosted = self.hosted(structure_id).await?;
        let hosted = hosted.lock().await;
        Ok(hosted.synchronized()?.enumerate())
    }
}

/// A node hosting the fused structures of any number of clusters, one per cluster.
#[derive(Clone)]
pub struct BackupNode {
    name: String,
    stores: Arc<Mutex<HashMap<String, Arc<Mutex<FusedStore>>>>>,
}

impl BackupNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, cluster_id: &str) -> Result<Arc<Mutex<FusedStore>>, Error> {
        self.stores
            .lock()
            .await
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cluster {} on {}", cluster_id, self.name)))
    }

    async fn register(
        &self,
        kind: StructureKind,
        primary_structure_id: &str,
        cluster: ClusterInfo,
        backup_position: usize,
    ) -> Result<StructureId, Error> {
        cluster.validate()?;

        // creation and registration happen under the registry lock, so concurrent first
        // registrations of a cluster agree on a single store
        let mut stores = self.stores.lock().await;
        let store = match stores.get(cluster.cluster_id()) {
            Some(store) => store.clone(),
            None => {
                let store = FusedStore::new(
                    Uuid::new_v4().to_string(),
                    kind,
                    cluster.clone(),
                    backup_position,
                )?;
                info!(
                    "{}: created fused {} {} for cluster {} at position {}",
                    self.name,
                    kind,
                    store.structure_id(),
                    cluster.cluster_id(),
                    backup_position
                );
                let store = Arc::new(Mutex::new(store));
                stores.insert(cluster.cluster_id().to_string(), store.clone());
                store
            }
        };

        let mut store = store.lock().await;
        if store.kind() != kind
            || store.cluster() != &cluster
            || store.backup_position() != backup_position
        {
            return Err(Error::ProtocolViolation(format!(
                "{} registering with cluster {} as {} at position {} does not match the existing {} at position {}",
                primary_structure_id,
                cluster.cluster_id(),
                kind,
                backup_position,
                store.kind(),
                store.backup_position()
            )));
        }
        store.register(primary_structure_id)?;
        Ok(store.structure_id().to_string())
    }
}

#[async_trait]
impl BackupService for BackupNode {
    async fn create_fused_structure(
        &self,
        kind: StructureKind,
        primary_structure_id: &str,
        cluster: ClusterInfo,
        backup_position: usize,
    ) -> Result<StructureId, transport::Error> {
        Ok(self
            .register(kind, primary_structure_id, cluster, backup_position)
            .await?)
    }

    async fn mutate(
        &self,
        cluster_id: &str,
        primary_structure_id: &str,
        mutation: FusedMutation,
    ) -> Result<(), transport::Error> {
        let store = self.store(cluster_id).await?;
        let mut store = store.lock().await;
        Ok(store.apply(primary_structure_id, mutation)?)
    }

    async fn recovery_data(&self, cluster_id: &str) -> Result<RecoveryData, transport::Error> {
        let store = self.store(cluster_id).await?;
        let store = store.lock().await;
        Ok(store.recovery_data())
    }
}
