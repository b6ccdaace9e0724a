// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use futures::future::try_join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::coder::Coder;
use crate::config::Config;
use crate::error::Error;
use fusion_transport::{BackupService, ClusterInfo, Key, RecoveryData, StructureKind, Value};

/// Contents of the faulted primaries, keyed by primary ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredData {
    pub kind: StructureKind,
    pub structures: BTreeMap<usize, BTreeMap<Key, Value>>,
}

impl RecoveredData {
    fn empty(kind: StructureKind) -> Self {
        Self {
            kind,
            structures: BTreeMap::new(),
        }
    }

    /// Recovered contents of one primary ordered by key.
    pub fn get(&self, ordinal: usize) -> Option<&BTreeMap<Key, Value>> {
        self.structures.get(&ordinal)
    }

    /// Recovered list or queue of one primary. `None` for maps and for ordinals not recovered.
    pub fn sequence(&self, ordinal: usize) -> Option<Vec<Value>> {
        if !self.kind.is_positional() {
            return None;
        }
        self.get(ordinal).map(|m| m.values().copied().collect())
    }
}

/// Checks a fault set against the cluster shape and returns it deduplicated.
///
/// Runs before anything is contacted: more faults than backups is `Error::TooManyFaults`, an
/// ordinal outside the cluster is `Error::ProtocolViolation`.
pub fn validate_faults(cluster: &ClusterInfo, faults: &[usize]) -> Result<BTreeSet<usize>, Error> {
    let faults: BTreeSet<usize> = faults.iter().copied().collect();
    if faults.len() > cluster.faults() {
        return Err(Error::TooManyFaults {
            faults: faults.len(),
            tolerated: cluster.faults(),
        });
    }
    if let Some(ordinal) = faults.iter().find(|&&o| o >= cluster.primaries()) {
        return Err(Error::ProtocolViolation(format!(
            "primary {} is not part of cluster {} with {} primaries",
            ordinal,
            cluster.cluster_id(),
            cluster.primaries()
        )));
    }
    Ok(faults)
}

/// Rebuilds the contents of faulted primaries from the backups and the surviving primaries.
pub struct RecoveryOrchestrator<B: BackupService> {
    kind: StructureKind,
    cluster: ClusterInfo,
    config: Config,
    backups: Vec<B>,
}

impl<B: BackupService> RecoveryOrchestrator<B> {
    /// Creates a new orchestrator.
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of the cluster's structures.
    /// * `cluster` - The cluster to recover.
    /// * `config` - The client configuration.
    /// * `backups` - The backups of the cluster in code position order.
    pub fn new(kind: StructureKind, cluster: ClusterInfo, config: Config, backups: Vec<B>) -> Self {
        Self {
            kind,
            cluster,
            config,
            backups,
        }
    }

    /// Recovers the primaries in `faults`.
    ///
    /// # Arguments
    ///
    /// * `faults` - Ordinals of the faulted primaries.
    /// * `surviving` - Contents of every other primary, keyed by ordinal.
    ///
    /// # Returns
    ///
    /// The contents of every faulted primary. Any inconsistency rejects the whole recovery.
    pub async fn recover(
        &self,
        faults: &[usize],
        surviving: &BTreeMap<usize, BTreeMap<Key, Value>>,
    ) -> Result<RecoveredData, Error> {
        let faults = validate_faults(&self.cluster, faults)?;
        if faults.is_empty() {
            return Ok(RecoveredData::empty(self.kind));
        }

        let result = self.reconstruct(&faults, surviving).await;
        match &result {
            Ok(data) => info!(
                "recovered primaries {:?} of cluster {} ({} values)",
                faults,
                self.cluster.cluster_id(),
                data.structures.values().map(|m| m.len()).sum::<usize>()
            ),
            Err(e) => warn!(
                "rejected recovery of primaries {:?} of cluster {}: {}",
                faults,
                self.cluster.cluster_id(),
                e
            ),
        }
        result
    }

    async fn reconstruct(
        &self,
        faults: &BTreeSet<usize>,
        surviving: &BTreeMap<usize, BTreeMap<Key, Value>>,
    ) -> Result<RecoveredData, Error> {
        let primaries = self.cluster.primaries();
        if self.backups.len() != self.cluster.faults() {
            return Err(Error::ProtocolViolation(format!(
                "cluster {} has {} backups, got {}",
                self.cluster.cluster_id(),
                self.cluster.faults(),
                self.backups.len()
            )));
        }

        let responses = self.fetch().await?;
        let table = Self::check_consistency(&responses, primaries)?;
        let coder = Coder::new(primaries, self.cluster.faults())?;

        let mut erasures: Vec<Option<usize>> = faults.iter().copied().map(Some).collect();
        erasures.resize(self.cluster.faults() + 1, None);

        let mut structures: BTreeMap<usize, BTreeMap<Key, Value>> =
            faults.iter().map(|&o| (o, BTreeMap::new())).collect();

        for (stripe, row) in table.iter().enumerate() {
            let mut data = vec![0; primaries];
            for (ordinal, key) in row.iter().enumerate() {
                let Some(key) = key else { continue };
                if faults.contains(&ordinal) {
                    continue;
                }
                data[ordinal] = surviving
                    .get(&ordinal)
                    .and_then(|values| values.get(key))
                    .copied()
                    .ok_or_else(|| {
                        Error::ProtocolInvariantViolation(format!(
                            "stripe {} references key {} missing from primary {}",
                            stripe, key, ordinal
                        ))
                    })?;
            }

            let codewords: Vec<Value> = responses.iter().map(|r| r.codewords[stripe]).collect();
            let recovered = coder.recover(&codewords, &data, &erasures)?;

            for &ordinal in faults {
                let Some(key) = row[ordinal] else { continue };
                let values = structures.entry(ordinal).or_default();
                if values.insert(key, recovered[ordinal]).is_some() {
                    return Err(Error::ProtocolInvariantViolation(format!(
                        "key {} of primary {} appears in more than one stripe",
                        key, ordinal
                    )));
                }
            }
        }

        if self.kind.is_positional() {
            for (ordinal, values) in &structures {
                if !values.keys().copied().eq(0..values.len() as Key) {
                    return Err(Error::ProtocolInvariantViolation(format!(
                        "recovered positions of primary {} are not contiguous: {:?}",
                        ordinal,
                        values.keys().collect::<Vec<_>>()
                    )));
                }
            }
        }

        Ok(RecoveredData {
            kind: self.kind,
            structures,
        })
    }

    async fn fetch(&self) -> Result<Vec<RecoveryData>, Error> {
        let cluster_id = self.cluster.cluster_id();
        if self.config.concurrent_fetch {
            debug!("fetching recovery data of {} concurrently", cluster_id);
            return try_join_all(self.backups.iter().map(|b| b.recovery_data(cluster_id)))
                .await
                .map_err(Error::ConnectivityFailure);
        }

        let mut responses = Vec::with_capacity(self.backups.len());
        for (position, backup) in self.backups.iter().enumerate() {
            debug!("fetching recovery data of {} from backup {}", cluster_id, position);
            responses.push(
                backup
                    .recovery_data(cluster_id)
                    .await
                    .map_err(Error::ConnectivityFailure)?,
            );
        }
        Ok(responses)
    }

    // Every backup must describe the same stripes; returns the shared cross-reference table.
    fn check_consistency(
        responses: &[RecoveryData],
        primaries: usize,
    ) -> Result<&[Vec<Option<Key>>], Error> {
        let first = responses.first().ok_or_else(|| {
            Error::ProtocolInvariantViolation("no backup answered".to_string())
        })?;
        let table = &first.index_data;

        for (position, response) in responses.iter().enumerate() {
            if response.index_data != *table {
                return Err(Error::ProtocolInvariantViolation(format!(
                    "backup {} disagrees with backup 0 on the cross-reference table",
                    position
                )));
            }
            if response.codewords.len() != table.len() {
                return Err(Error::ProtocolInvariantViolation(format!(
                    "backup {} reports {} codewords for {} stripes",
                    position,
                    response.codewords.len(),
                    table.len()
                )));
            }
        }
        if let Some(stripe) = table.iter().position(|row| row.len() != primaries) {
            return Err(Error::ProtocolInvariantViolation(format!(
                "stripe {} does not have an entry for each of the {} primaries",
                stripe, primaries
            )));
        }
        Ok(table)
    }
}
