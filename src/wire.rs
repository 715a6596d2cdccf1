//! Pointer-free wire form of a server topology.
//!
//! Links already carry `(type, index)` handles in memory, so flattening is
//! a straight copy; what the wire form drops is the path matrix (rebuilt by
//! the receiver) and the CPU affinity bitmap (meaningless off-host).

use serde::{Deserialize, Serialize};

use crate::graph::{Cpuset, Link, LinkType, Node, NodeAttrs, NodeHandle, NodeType, TopoId, TopoServer, NODE_TYPES};
use crate::{Result, TopoError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatLink {
    pub kind: LinkType,
    pub bw: f64,
    pub remote: NodeHandle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatNode {
    pub kind: NodeType,
    pub id: TopoId,
    pub attrs: NodeAttrs,
    pub links: Vec<FlatLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatServer {
    pub server_id: usize,
    pub n_hosts: usize,
    pub host_hashes: Vec<u64>,
    pub nodes: [Vec<FlatNode>; NODE_TYPES],
}

/// Flatten a server view for the wire. Paths are not serialized.
pub fn flatten(server: &TopoServer) -> FlatServer {
    let mut flat = FlatServer {
        server_id: server.server_id,
        n_hosts: server.n_hosts,
        host_hashes: server.host_hashes.clone(),
        nodes: Default::default(),
    };
    for t in 0..NODE_TYPES {
        for node in &server.nodes[t] {
            let mut attrs = node.attrs.clone();
            if let NodeAttrs::Cpu(cpu) = &mut attrs {
                cpu.affinity = Cpuset::default();
            }
            flat.nodes[t].push(FlatNode {
                kind: node.kind,
                id: node.id,
                attrs,
                links: node
                    .links
                    .iter()
                    .map(|l| FlatLink {
                        kind: l.kind,
                        bw: l.bw,
                        remote: l.remote,
                    })
                    .collect(),
            });
        }
    }
    flat
}

/// Rebuild a server view from its wire form. The caller re-runs the
/// external path computation to restore `paths`.
pub fn unflatten(flat: &FlatServer) -> TopoServer {
    let mut server = TopoServer {
        server_id: flat.server_id,
        n_hosts: flat.n_hosts,
        host_hashes: flat.host_hashes.clone(),
        nodes: Default::default(),
    };
    for t in 0..NODE_TYPES {
        for fnode in &flat.nodes[t] {
            server.nodes[t].push(Node {
                kind: fnode.kind,
                id: fnode.id,
                attrs: fnode.attrs.clone(),
                links: fnode
                    .links
                    .iter()
                    .map(|l| Link {
                        kind: l.kind,
                        remote: l.remote,
                        bw: l.bw,
                    })
                    .collect(),
                paths: Default::default(),
            });
        }
    }
    server
}

pub fn to_bytes(flat: &FlatServer) -> Result<Vec<u8>> {
    bincode::serialize(flat)
        .map_err(|e| TopoError::Internal(format!("flat topology encode failed: {}", e)))
}

pub fn from_bytes(bytes: &[u8]) -> Result<FlatServer> {
    bincode::deserialize(bytes)
        .map_err(|e| TopoError::Internal(format!("flat topology decode failed: {}", e)))
}
