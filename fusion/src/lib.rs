// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Fusion
//!
//! Fault-tolerant lists, maps and queues. `N` primaries hold the live data and `F` backups hold a
//! Reed-Solomon coded combination of all of them, so up to `F` primaries can be lost at once
//! without keeping full replicas.
//!
//! ## Modules
//!
//! - [`coder`](coder): The GF(2^16) Reed-Solomon coding oracle.
//! - [`slots`](slots): Arena backed linked list with stable handles.
//! - [`primary`](primary): The live data of a primary, kept compacted by depth.
//! - [`fused`](fused): The stripes of a backup.
//! - [`event`](event): Mutation events and their handlers, including replication.
//! - [`node`](node): In-process primary and backup nodes.
//! - [`cluster`](cluster): The client addressing a cluster of primaries.
//! - [`recovery`](recovery): Reconstruction of faulted primaries.
//!
//! ### Example
//!
//! ```rust
//! use fusion::{BackupNode, Cluster, Config, PrimaryNode};
//! use fusion_transport::{ClusterInfo, Directory, StructureKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let directory = Directory::new();
//!     let endpoints = vec!["backup-0".to_string()];
//!     directory.register("backup-0", BackupNode::new("backup-0"));
//!
//!     let primaries = (0..2)
//!         .map(|i| PrimaryNode::new(format!("primary-{}", i), directory.clone()))
//!         .collect();
//!     let info = ClusterInfo::new("example", 2, 1)?;
//!     let cluster = Cluster::create(
//!         StructureKind::List,
//!         info,
//!         Config::default(),
//!         primaries,
//!         endpoints,
//!         directory,
//!     )
//!     .await?;
//!
//!     cluster.append(0, 123).await?;
//!     cluster.append(1, 456).await?;
//!
//!     let recovered = cluster.recover(&[0]).await?;
//!     assert_eq!(recovered.sequence(0), Some(vec![123]));
//!     Ok(())
//! }
//! ```

pub mod coder;
pub mod config;
pub use config::*;
pub mod error;
pub use error::Error;
pub mod event;
pub mod fused;
pub mod primary;
pub mod slots;

pub mod cluster;
pub use cluster::Cluster;
pub mod node;
pub use node::{BackupNode, PrimaryNode};
pub mod recovery;
pub use recovery::{RecoveredData, RecoveryOrchestrator};
