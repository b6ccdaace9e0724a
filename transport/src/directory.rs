// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::service::Error;

/// Resolves endpoint names to service handles.
///
/// Primaries receive their backups as endpoint names and use a directory to reach them. Cloning
/// a directory yields a handle to the same table.
pub struct Directory<S> {
    entries: Arc<RwLock<HashMap<String, S>>>,
}

impl<S> Clone for Directory<S> {
    fn clone(&self) -> Self {
        Directory {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<S> Default for Directory<S> {
    fn default() -> Self {
        Directory {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<S: Clone> Directory<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `service` reachable under `endpoint`, replacing any previous entry.
    pub fn register(&self, endpoint: impl Into<String>, service: S) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.into(), service);
    }

    /// Drops the entry of `endpoint`. Later lookups fail with `Error::Unreachable`.
    pub fn unregister(&self, endpoint: &str) -> Option<S> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint)
    }

    /// Returns a handle to the service registered under `endpoint`.
    pub fn resolve(&self, endpoint: &str) -> Result<S, Error> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::Unreachable(endpoint.to_string()))
    }

    /// Resolves every endpoint, failing on the first unknown one.
    pub fn resolve_all(&self, endpoints: &[String]) -> Result<Vec<S>, Error> {
        endpoints.iter().map(|e| self.resolve(e)).collect()
    }
}
