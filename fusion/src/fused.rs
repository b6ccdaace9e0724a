// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::coder::Coder;
use crate::error::Error;
use crate::slots::{SlotId, SlotList};
use fusion_transport::{
    ClusterInfo, FusedMutation, Key, RecoveryData, StructureId, StructureKind, Value,
};

/// Identity of one contribution. Survives migration between stripes.
type ContributionId = u64;

#[derive(Debug)]
struct Stripe {
    code: Value,
    contributions: Vec<Option<ContributionId>>,
    live: usize,
}

// Mirror of a primary's logical layout holding contribution ids instead of values.
#[derive(Debug)]
enum Mirror {
    List(Vec<ContributionId>),
    Map(BTreeMap<Key, ContributionId>),
    Queue(VecDeque<ContributionId>),
}

impl Mirror {
    fn new(kind: StructureKind) -> Self {
        match kind {
            StructureKind::List => Mirror::List(Vec::new()),
            StructureKind::Map => Mirror::Map(BTreeMap::new()),
            StructureKind::Queue => Mirror::Queue(VecDeque::new()),
        }
    }

    fn lookup(&self, key: Key) -> Option<ContributionId> {
        match self {
            Mirror::Map(items) => items.get(&key).copied(),
            Mirror::List(_) | Mirror::Queue(_) => None,
        }
    }

    fn insert(&mut self, key: Key, id: ContributionId) -> Result<(), Error> {
        match self {
            Mirror::List(items) => {
                let position = usize::try_from(key)
                    .ok()
                    .filter(|&p| p <= items.len())
                    .ok_or_else(|| {
                        Error::ProtocolViolation(format!(
                            "addition at position {} of a list of {}",
                            key,
                            items.len()
                        ))
                    })?;
                items.insert(position, id);
            }
            Mirror::Queue(items) => items.push_back(id),
            Mirror::Map(items) => {
                items.insert(key, id);
            }
        }
        Ok(())
    }

    fn find(&self, key: Key) -> Result<ContributionId, Error> {
        let id = match self {
            Mirror::List(items) => usize::try_from(key).ok().and_then(|p| items.get(p)).copied(),
            Mirror::Queue(items) if key == 0 => items.front().copied(),
            Mirror::Queue(_) => None,
            Mirror::Map(items) => items.get(&key).copied(),
        };
        id.ok_or_else(|| Error::ProtocolViolation(format!("removal of unknown key {}", key)))
    }

    fn detach(&mut self, key: Key) -> Result<ContributionId, Error> {
        let id = match self {
            Mirror::List(items) => usize::try_from(key)
                .ok()
                .filter(|&p| p < items.len())
                .map(|p| items.remove(p)),
            Mirror::Queue(items) if key == 0 => items.pop_front(),
            Mirror::Queue(_) => None,
            Mirror::Map(items) => items.remove(&key),
        };
        id.ok_or_else(|| Error::ProtocolViolation(format!("removal of unknown key {}", key)))
    }

    fn keys(&self) -> HashMap<ContributionId, Key> {
        match self {
            Mirror::List(items) => items
                .iter()
                .enumerate()
                .map(|(p, id)| (*id, p as Key))
                .collect(),
            Mirror::Queue(items) => items
                .iter()
                .enumerate()
                .map(|(p, id)| (*id, p as Key))
                .collect(),
            Mirror::Map(items) => items.iter().map(|(k, id)| (*id, *k)).collect(),
        }
    }
}

#[derive(Debug)]
struct Source {
    primary_id: String,
    // deepest stripe holding a contribution of this primary
    tail: Option<SlotId>,
    mirror: Mirror,
    stripes: HashMap<ContributionId, SlotId>,
}

/// The backup side of a cluster: one codeword per stripe, aggregated over all primaries.
///
/// Stripe `k` holds, for every primary, the value at depth `k` of its compaction list. Applying
/// the same sequence of mutations as the primaries keeps that correspondence, which is what makes
/// [`get_index_data`](FusedStore::get_index_data) a valid address table for recovery.
pub struct FusedStore {
    structure_id: StructureId,
    kind: StructureKind,
    cluster: ClusterInfo,
    backup_position: usize,
    coder: Arc<Coder>,
    stripes: SlotList<Stripe>,
    sources: Vec<Source>,
    next_contribution: ContributionId,
}

impl FusedStore {
    /// Creates an empty fused structure.
    ///
    /// # Arguments
    ///
    /// * `structure_id` - The identifier of the fused structure.
    /// * `kind` - The kind of the primary structures it backs.
    /// * `cluster` - The cluster it belongs to.
    /// * `backup_position` - The code position of the hosting backup, `0..faults`.
    pub fn new(
        structure_id: impl Into<StructureId>,
        kind: StructureKind,
        cluster: ClusterInfo,
        backup_position: usize,
    ) -> Result<Self, Error> {
        cluster.validate()?;
        if backup_position >= cluster.faults() {
            return Err(Error::ProtocolViolation(format!(
                "backup position {} is outside the {} backups of cluster {}",
                backup_position,
                cluster.faults(),
                cluster.cluster_id()
            )));
        }
        let coder = Arc::new(Coder::new(cluster.primaries(), cluster.faults())?);
        Ok(Self {
            structure_id: structure_id.into(),
            kind,
            cluster,
            backup_position,
            coder,
            stripes: SlotList::new(),
            sources: Vec::new(),
            next_contribution: 0,
        })
    }

    pub fn structure_id(&self) -> &str {
        &self.structure_id
    }

    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    pub fn cluster(&self) -> &ClusterInfo {
        &self.cluster
    }

    pub fn backup_position(&self) -> usize {
        self.backup_position
    }

    /// Number of stripes.
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    /// Primary structure identifiers in registration order.
    pub fn primaries(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.primary_id.as_str()).collect()
    }

    /// Returns true once every primary of the cluster has registered.
    pub fn is_ready(&self) -> bool {
        self.sources.len() == self.cluster.primaries()
    }

    /// Registers a primary structure and returns its source index.
    ///
    /// Registering a known primary again returns its existing index.
    pub fn register(&mut self, primary_id: &str) -> Result<usize, Error> {
        if let Some(index) = self.sources.iter().position(|s| s.primary_id == primary_id) {
            return Ok(index);
        }
        if self.is_ready() {
            return Err(Error::ProtocolViolation(format!(
                "cluster {} already has its {} primaries, rejecting {}",
                self.cluster.cluster_id(),
                self.cluster.primaries(),
                primary_id
            )));
        }

        self.sources.push(Source {
            primary_id: primary_id.to_string(),
            tail: None,
            mirror: Mirror::new(self.kind),
            stripes: HashMap::new(),
        });
        if self.is_ready() {
            info!(
                "{} {} of cluster {} locked registration with {} primaries",
                self.kind,
                self.structure_id,
                self.cluster.cluster_id(),
                self.sources.len()
            );
        }
        Ok(self.sources.len() - 1)
    }

    pub fn apply(&mut self, primary_id: &str, mutation: FusedMutation) -> Result<(), Error> {
        match mutation {
            FusedMutation::Add {
                key,
                value,
                previous,
            } => self.apply_add(key, value, previous, primary_id),
            FusedMutation::Remove {
                key,
                value,
                replacement,
            } => self.apply_remove(key, value, replacement, primary_id),
        }
    }

    /// Folds an addition of `primary_id` into the stripes.
    ///
    /// A map key that already exists is updated in place: `previous` is folded out of its
    /// stripe and `value` folded in.
    pub fn apply_add(
        &mut self,
        key: Key,
        value: Value,
        previous: Option<Value>,
        primary_id: &str,
    ) -> Result<(), Error> {
        let source = self.source_index(primary_id)?;

        if let Some(id) = self.sources[source].mirror.lookup(key) {
            let previous = previous.ok_or_else(|| {
                Error::ProtocolViolation(format!("update of key {} without its previous value", key))
            })?;
            let stripe = self.stripe_of(source, id)?;
            return self.fold(stripe, source, previous, value);
        }

        let tracked = self.sources[source].tail;
        let existing = if self.stripes.is_empty() || tracked == self.stripes.last() {
            None
        } else {
            let next = match tracked {
                Some(tail) => self.stripes.next(tail),
                None => self.stripes.first(),
            }
            .ok_or_else(|| self.desync(source, "has no stripe after its tail"))?;
            let occupied = self
                .stripes
                .get(next)
                .map_or(true, |stripe| stripe.contributions[source].is_some());
            if occupied {
                return Err(self.desync(source, "already contributes to the next stripe"));
            }
            Some(next)
        };

        let id = self.next_contribution;
        self.sources[source].mirror.insert(key, id)?;
        self.next_contribution += 1;

        let target = match existing {
            Some(stripe) => stripe,
            None => {
                let stripe = self.stripes.push_back(Stripe {
                    code: 0,
                    contributions: vec![None; self.cluster.primaries()],
                    live: 0,
                });
                debug!(
                    "{}: allocated stripe {} for source {}",
                    self.structure_id,
                    self.stripes.len() - 1,
                    source
                );
                stripe
            }
        };

        let stripe = self.stripe_mut(target)?;
        stripe.contributions[source] = Some(id);
        stripe.live += 1;
        self.fold(target, source, 0, value)?;

        let entry = &mut self.sources[source];
        entry.tail = Some(target);
        entry.stripes.insert(id, target);
        Ok(())
    }

    /// Folds a removal of `primary_id` into the stripes.
    ///
    /// The primary moved its deepest value into the slot of the removed one, so the stripe of the
    /// removed value now holds `replacement`, and the primary's deepest stripe loses its
    /// contribution. That stripe is freed once nobody contributes to it.
    pub fn apply_remove(
        &mut self,
        key: Key,
        value: Value,
        replacement: Value,
        primary_id: &str,
    ) -> Result<(), Error> {
        let source = self.source_index(primary_id)?;
        let tail = self.sources[source]
            .tail
            .ok_or_else(|| self.desync(source, "removes from an empty structure"))?;
        let id = self.sources[source].mirror.find(key)?;
        let hole = self.stripe_of(source, id)?;
        if !self.stripes.contains(hole) || !self.stripes.contains(tail) {
            return Err(self.desync(source, "points at a freed stripe"));
        }
        let moved = if hole != tail {
            let moved = self
                .stripes
                .get(tail)
                .and_then(|stripe| stripe.contributions[source])
                .ok_or_else(|| self.desync(source, "has no contribution in its tail stripe"))?;
            Some(moved)
        } else {
            None
        };
        self.sources[source].mirror.detach(key)?;

        self.stripe_mut(tail)?.contributions[source] = None;
        if let Some(moved) = moved {
            self.fold(hole, source, value, replacement)?;
            self.stripe_mut(hole)?.contributions[source] = Some(moved);
            self.sources[source].stripes.insert(moved, hole);
        }

        self.fold(tail, source, replacement, 0)?;
        let stripe = self.stripe_mut(tail)?;
        stripe.live -= 1;
        let emptied = stripe.live == 0;

        let new_tail = self.stripes.prev(tail);
        if emptied {
            if self.stripes.last() == Some(tail) {
                self.stripes.remove(tail);
                debug!(
                    "{}: freed stripe {}",
                    self.structure_id,
                    self.stripes.len()
                );
            } else {
                warn!(
                    "{}: stripe emptied by source {} is not the last one, keeping it",
                    self.structure_id, source
                );
            }
        }

        let entry = &mut self.sources[source];
        entry.tail = new_tail;
        entry.stripes.remove(&id);
        Ok(())
    }

    /// For every stripe and every primary in registration order, the logical key of the
    /// primary's value in that stripe, or `None` if it has none there.
    pub fn get_index_data(&self) -> Vec<Vec<Option<Key>>> {
        let keys: Vec<HashMap<ContributionId, Key>> =
            self.sources.iter().map(|s| s.mirror.keys()).collect();
        self.stripes
            .iter()
            .map(|(_, stripe)| {
                stripe
                    .contributions
                    .iter()
                    .enumerate()
                    .map(|(source, id)| {
                        id.and_then(|id| keys.get(source).and_then(|k| k.get(&id)).copied())
                    })
                    .collect()
            })
            .collect()
    }

    /// Codewords of all stripes in order.
    pub fn get_fused_data(&self) -> Vec<Value> {
        self.stripes.iter().map(|(_, stripe)| stripe.code).collect()
    }

    pub fn recovery_data(&self) -> RecoveryData {
        RecoveryData {
            codewords: self.get_fused_data(),
            index_data: self.get_index_data(),
        }
    }

    fn source_index(&self, primary_id: &str) -> Result<usize, Error> {
        if !self.is_ready() {
            return Err(Error::NotReady(format!(
                "{} {} ({} of {} primaries registered)",
                self.kind,
                self.structure_id,
                self.sources.len(),
                self.cluster.primaries()
            )));
        }
        self.sources
            .iter()
            .position(|s| s.primary_id == primary_id)
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "{} is not registered with {}",
                    primary_id, self.structure_id
                ))
            })
    }

    fn stripe_of(&self, source: usize, id: ContributionId) -> Result<SlotId, Error> {
        self.sources[source]
            .stripes
            .get(&id)
            .copied()
            .ok_or_else(|| self.desync(source, "lost track of a contribution"))
    }

    fn stripe_mut(&mut self, stripe: SlotId) -> Result<&mut Stripe, Error> {
        let structure_id = &self.structure_id;
        self.stripes
            .get_mut(stripe)
            .ok_or_else(|| Error::ProtocolViolation(format!("{}: stale stripe handle", structure_id)))
    }

    fn fold(&mut self, stripe: SlotId, source: usize, old: Value, new: Value) -> Result<(), Error> {
        let coder = Arc::clone(&self.coder);
        let position = self.backup_position;
        let stripe = self.stripe_mut(stripe)?;
        stripe.code = coder.encode_update(stripe.code, position, old, new, source);
        Ok(())
    }

    fn desync(&self, source: usize, what: &str) -> Error {
        Error::ProtocolViolation(format!(
            "{}: source {} {}",
            self.structure_id, source, what
        ))
    }
}
