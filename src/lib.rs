//! Topology engine of a heterogeneous collective-communication library.
//!
//! The engine discovers the hardware interconnect of each participating
//! host from a hardware XML description, assembles a typed graph of the
//! machine, exchanges per-host views across all ranks, merges them into a
//! cluster-wide view, and answers routing queries such as "which NIC should
//! rank r use" and "what is the effective bandwidth between two NICs across
//! the inter-switch fabric".
//!
//! Construction happens once at communicator init and is single-threaded
//! per rank; the only cross-rank coordination is one bootstrap all-gather
//! followed by one barrier.

use thiserror::Error;

pub mod adapter;
pub mod cluster;
pub mod constants;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod normalize;
pub mod query;
pub mod route;
pub mod wire;
pub mod xml;

pub use adapter::{
    Bootstrap, DeviceAdaptor, LocalBootstrap, NetPlugin, NetProperties, PathCompute, PeerInfo,
};
pub use cluster::ClusterTopo;
pub use graph::{
    Cpuset, Link, LinkType, Node, NodeAttrs, NodeHandle, NodeType, PathInfo, PathType, TopoId,
    TopoServer, NODE_TYPES,
};
pub use route::{Route, Switch};

#[derive(Debug, Error)]
pub enum TopoError {
    /// An invariant was violated: capacity exceeded, a required attribute
    /// is missing, a route references an unknown guid, or a file that was
    /// explicitly requested cannot be read or parsed.
    #[error("internal error: {0}")]
    Internal(String),
    /// The caller asked for something that is not there, e.g. a rank with
    /// no accelerator in the topology.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
}

impl From<std::io::Error> for TopoError {
    fn from(e: std::io::Error) -> Self {
        TopoError::Internal(format!("io error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, TopoError>;

/// Environment lookup with the usual notice when the variable is set.
/// A missing variable is informational, never an error.
pub(crate) fn env_opt(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            log::info!("{} set by environment to {}", name, v);
            Some(v)
        }
        Err(_) => None,
    }
}
