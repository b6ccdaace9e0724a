// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Fused Structures Transport
//!
//! The transport crate defines the boundary between the parties of a fused cluster: clients talk
//! to primaries, primaries forward every mutation to the backups, and recovery pulls codewords
//! and cross-reference tables from the backups.
//!
//! ## Modules
//!
//! - [`service`](service): Wire types, the boundary [`Error`](service::Error) and the
//!   [`PrimaryService`](service::PrimaryService) / [`BackupService`](service::BackupService) traits.
//! - [`directory`](directory): Resolves endpoint names to service handles.
//! - [`mock`](mock): Fault injecting wrappers and a canned backup for tests (feature `mock`).
//!
//! ## Usage
//!
//! Any type implementing the service traits can take part in a cluster. The `fusion` crate
//! provides in-process nodes; a networked implementation only needs to carry the serde wire
//! types across its connection.
//!
//! ### Example
//!
//! ```rust
//! use fusion_transport::{ClusterInfo, FusedMutation};
//!
//! let cluster = ClusterInfo::new("inventory", 3, 2).unwrap();
//! assert_eq!(cluster.primaries() + cluster.faults(), 5);
//!
//! let mutation = FusedMutation::Add { key: 0, value: 42, previous: None };
//! assert!(matches!(mutation, FusedMutation::Add { value: 42, .. }));
//! ```

pub mod directory;
pub mod service;
pub use directory::Directory;
pub use service::*;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
