// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fusion_transport as transport;

/// Errors raised by stores, nodes and recovery.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A fused structure received a mutation before all of its primaries registered.
    #[error("Structure {0} is not ready: not all primaries have registered")]
    NotReady(String),

    /// The request breaks the replication protocol, e.g. an extra primary registration or an
    /// operation the structure kind does not support.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A key, index, structure or cluster does not exist.
    #[error("{0} not found")]
    NotFound(String),

    #[error("Too many faults: {faults} primaries failed but the cluster tolerates {tolerated}")]
    TooManyFaults { faults: usize, tolerated: usize },

    /// The coder could not solve for the erased sources of a stripe.
    #[error("Unrecoverable erasure: {0}")]
    UnrecoverableErasure(String),

    /// Recovered data or backup state contradicts the invariants of the cluster. Recovery is
    /// rejected as a whole.
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    #[error("Connectivity failure: {0}")]
    ConnectivityFailure(#[source] transport::Error),

    #[error("Invalid cluster information: {0}")]
    InvalidCluster(String),
}

impl From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::NotReady(s) => Error::NotReady(s),
            transport::Error::NotFound(s) => Error::NotFound(s),
            transport::Error::ProtocolViolation(s) => Error::ProtocolViolation(s),
            transport::Error::InvalidCluster(s) => Error::InvalidCluster(s),
            transport::Error::Desynchronized(s) => Error::ProtocolInvariantViolation(s),
            err @ (transport::Error::Unreachable(_) | transport::Error::Other(_)) => {
                Error::ConnectivityFailure(err)
            }
        }
    }
}

impl From<Error> for transport::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NotReady(s) => transport::Error::NotReady(s),
            Error::NotFound(s) => transport::Error::NotFound(s),
            Error::ProtocolViolation(s) => transport::Error::ProtocolViolation(s),
            Error::InvalidCluster(s) => transport::Error::InvalidCluster(s),
            Error::ProtocolInvariantViolation(s) => transport::Error::Desynchronized(s),
            Error::ConnectivityFailure(err) => err,
            err => transport::Error::Other(anyhow::Error::new(err)),
        }
    }
}
