// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use log::{debug, trace};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Error;
use fusion_transport::{BackupService, FusedMutation, Key, StructureId, StructureKind, Value};

/// Change applied to a primary structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    /// `value` was stored at `key`. `previous` is the overwritten value of an existing map key.
    Added {
        key: Key,
        value: Value,
        previous: Option<Value>,
    },
    /// `value` was removed from `key` and `replacement` now occupies its compaction slot.
    Removed {
        key: Key,
        value: Value,
        replacement: Value,
    },
}

/// Event produced by every mutation of a primary structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationEvent {
    pub cluster_id: String,
    pub structure_id: StructureId,
    pub kind: StructureKind,
    pub change: Change,
}

impl MutationEvent {
    /// Converts the event into the mutation the backups apply.
    pub fn to_fused(&self) -> FusedMutation {
        match self.change {
            Change::Added {
                key,
                value,
                previous,
            } => FusedMutation::Add {
                key,
                value,
                previous,
            },
            Change::Removed {
                key,
                value,
                replacement,
            } => FusedMutation::Remove {
                key,
                value,
                replacement,
            },
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &MutationEvent) -> Result<(), Error>;
}

/// Delivers events to its handlers in subscription order.
///
/// Each handler is awaited before the next one runs and the first failure stops the delivery.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn publish(&self, event: &MutationEvent) -> Result<(), Error> {
        for handler in &self.handlers {
            handler.handle(event).await?;
        }
        Ok(())
    }
}

/// Logs every mutation.
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, event: &MutationEvent) -> Result<(), Error> {
        match &event.change {
            Change::Added {
                key,
                value,
                previous: Some(previous),
            } => debug!(
                "{} {}: set {} to {} (was {})",
                event.kind, event.structure_id, key, value, previous
            ),
            Change::Added { key, value, .. } => debug!(
                "{} {}: added {} at {}",
                event.kind, event.structure_id, value, key
            ),
            Change::Removed {
                key,
                value,
                replacement,
            } => debug!(
                "{} {}: removed {} at {}, compacted {}",
                event.kind, event.structure_id, value, key, replacement
            ),
        }
        Ok(())
    }
}

/// Sends every mutation to the backups of the structure, one backup at a time in code position
/// order.
pub struct ReplicationForwarder<B: BackupService> {
    backups: Vec<B>,
}

impl<B: BackupService> ReplicationForwarder<B> {
    pub fn new(backups: Vec<B>) -> Self {
        Self { backups }
    }
}

#[async_trait]
impl<B: BackupService + 'static> EventHandler for ReplicationForwarder<B> {
    async fn handle(&self, event: &MutationEvent) -> Result<(), Error> {
        let mutation = event.to_fused();
        for (position, backup) in self.backups.iter().enumerate() {
            trace!(
                "forwarding {:?} of {} to backup {}",
                mutation,
                event.structure_id,
                position
            );
            backup
                .mutate(&event.cluster_id, &event.structure_id, mutation.clone())
                .await?;
        }
        Ok(())
    }
}
