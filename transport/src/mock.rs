// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::service::{
    BackupService, ClusterInfo, Error, FusedMutation, Key, Mutation, PrimaryService,
    RecoveryData, StructureId, StructureKind, Value,
};

#[derive(Clone, Default)]
struct Faults {
    unreachable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl Faults {
    fn enter(&self, name: &str) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Unreachable(name.to_string()));
        }
        Ok(())
    }
}

/// Wraps a backup and lets tests cut it off and count the calls it receives.
#[derive(Clone)]
pub struct FlakyBackup<B> {
    name: String,
    inner: B,
    faults: Faults,
}

impl<B: BackupService> FlakyBackup<B> {
    pub fn new(name: impl Into<String>, inner: B) -> Self {
        FlakyBackup {
            name: name.into(),
            inner,
            faults: Faults::default(),
        }
    }

    pub fn fake_unreachable(&self) {
        self.faults.unreachable.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.faults.unreachable.store(false, Ordering::SeqCst);
    }

    /// Number of calls received so far, including rejected ones.
    pub fn calls(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: BackupService> BackupService for FlakyBackup<B> {
    async fn create_fused_structure(
        &self,
        kind: StructureKind,
        primary_structure_id: &str,
        cluster: ClusterInfo,
        backup_position: usize,
    ) -> Result<StructureId, Error> {
        self.faults.enter(&self.name)?;
        self.inner
            .create_fused_structure(kind, primary_structure_id, cluster, backup_position)
            .await
    }

    async fn mutate(
        &self,
        cluster_id: &str,
        primary_structure_id: &str,
        mutation: FusedMutation,
    ) -> Result<(), Error> {
        self.faults.enter(&self.name)?;
        self.inner
            .mutate(cluster_id, primary_structure_id, mutation)
            .await
    }

    async fn recovery_data(&self, cluster_id: &str) -> Result<RecoveryData, Error> {
        self.faults.enter(&self.name)?;
        self.inner.recovery_data(cluster_id).await
    }
}

/// Wraps a primary and lets tests cut it off and count the calls it receives.
#[derive(Clone)]
pub struct FlakyPrimary<P> {
    name: String,
    inner: P,
    faults: Faults,
}

impl<P: PrimaryService> FlakyPrimary<P> {
    pub fn new(name: impl Into<String>, inner: P) -> Self {
        FlakyPrimary {
            name: name.into(),
            inner,
            faults: Faults::default(),
        }
    }

    pub fn fake_unreachable(&self) {
        self.faults.unreachable.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.faults.unreachable.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: PrimaryService> PrimaryService for FlakyPrimary<P> {
    async fn create_structure(
        &self,
        kind: StructureKind,
        backup_endpoints: Vec<String>,
        cluster: ClusterInfo,
    ) -> Result<StructureId, Error> {
        self.faults.enter(&self.name)?;
        self.inner
            .create_structure(kind, backup_endpoints, cluster)
            .await
    }

    async fn mutate(&self, structure_id: &str, mutation: Mutation) -> Result<(), Error> {
        self.faults.enter(&self.name)?;
        self.inner.mutate(structure_id, mutation).await
    }

    async fn get_value(&self, structure_id: &str, key: Key) -> Result<Value, Error> {
        self.faults.enter(&self.name)?;
        self.inner.get_value(structure_id, key).await
    }

    async fn get_all_values(&self, structure_id: &str) -> Result<BTreeMap<Key, Value>, Error> {
        self.faults.enter(&self.name)?;
        self.inner.get_all_values(structure_id).await
    }
}

/// A backup that serves canned recovery data and records the mutations it receives.
#[derive(Clone, Default)]
pub struct FakeBackup {
    recovery: Arc<Mutex<HashMap<String, RecoveryData>>>,
    received: Arc<Mutex<Vec<(String, FusedMutation)>>>,
}

impl FakeBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recovery_data(&self, cluster_id: &str, data: RecoveryData) {
        self.recovery
            .lock()
            .unwrap()
            .insert(cluster_id.to_string(), data);
    }

    /// Mutations received so far with the primary structure that sent them.
    pub fn received(&self) -> Vec<(String, FusedMutation)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackupService for FakeBackup {
    async fn create_fused_structure(
        &self,
        _kind: StructureKind,
        _primary_structure_id: &str,
        cluster: ClusterInfo,
        _backup_position: usize,
    ) -> Result<StructureId, Error> {
        Ok(format!("fake-{}", cluster.cluster_id()))
    }

    async fn mutate(
        &self,
        _cluster_id: &str,
        primary_structure_id: &str,
        mutation: FusedMutation,
    ) -> Result<(), Error> {
        self.received
            .lock()
            .unwrap()
            .push((primary_structure_id.to_string(), mutation));
        Ok(())
    }

    async fn recovery_data(&self, cluster_id: &str) -> Result<RecoveryData, Error> {
        self.recovery
            .lock()
            .unwrap()
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cluster {}", cluster_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterInfo {
        ClusterInfo::new("cluster", 2, 1).unwrap()
    }

    #[tokio::test]
    async fn test_fake_backup_serves_recovery_data() -> Result<(), Error> {
        let backup = FakeBackup::new();
        let data = RecoveryData {
            codewords: vec![42],
            index_data: vec![vec![Some(0), None]],
        };
        backup.set_recovery_data("cluster", data.clone());

        assert_eq!(backup.recovery_data("cluster").await?, data);
        assert!(matches!(
            backup.recovery_data("other").await,
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_backup_records_mutations() -> Result<(), Error> {
        let backup = FakeBackup::new();
        let mutation = FusedMutation::Add {
            key: 0,
            value: 5,
            previous: None,
        };
        backup.mutate("cluster", "p0", mutation.clone()).await?;

        assert_eq!(backup.received(), vec![("p0".to_string(), mutation)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_flaky_backup_unreachable() -> Result<(), Error> {
        let backup = FlakyBackup::new("backup-0", FakeBackup::new());
        backup
            .create_fused_structure(StructureKind::List, "p0", cluster(), 0)
            .await?;

        backup.fake_unreachable();
        let result = backup.recovery_data("cluster").await;
        assert!(matches!(result, Err(Error::Unreachable(name)) if name == "backup-0"));
        assert_eq!(backup.calls(), 2);

        backup.restore();
        backup.inner().set_recovery_data("cluster", RecoveryData::default());
        assert_eq!(
            backup.recovery_data("cluster").await?,
            RecoveryData::default()
        );
        assert_eq!(backup.calls(), 3);
        Ok(())
    }
}
