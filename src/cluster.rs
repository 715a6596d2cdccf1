//! Cluster-wide topology: all-gather every host's flattened view, reassign
//! server ids deterministically, merge into a multi-host view and answer
//! cross-server queries.

use fnv::FnvHashMap as HashMap;
use log::info;

use crate::adapter::{Bootstrap, PathCompute};
use crate::constants::ENV_INTERSERVER_ROUTE_FILE;
use crate::graph::{NodeType, PathType, TopoId, TopoServer, NODE_TYPES};
use crate::route::{self, Route};
use crate::wire::{self, FlatServer};
use crate::{env_opt, Result, TopoError};

/// The merged multi-host view. The local server stays with the caller; its
/// slot here is `None`.
#[derive(Debug, Default)]
pub struct ClusterTopo {
    pub num_servers: usize,
    pub servers: Vec<Option<TopoServer>>,
    /// guid -> server id, identical on every rank.
    pub net_to_server: HashMap<u64, usize>,
    pub(crate) routes: HashMap<(u64, u64), Route>,
}

/// Rewrite server ids into a dense range keyed by first appearance in rank
/// order. A pure function of the gathered buffers, so every rank computes
/// the same assignment without further coordination.
pub fn reorder_server_ids(flats: &mut [FlatServer]) {
    let mut hashes: Vec<u64> = Vec::new();
    let mut lookup: HashMap<u64, usize> = HashMap::default();
    for flat in flats.iter_mut() {
        let hash = flat.host_hashes[flat.server_id];
        let id = *lookup.entry(hash).or_insert_with(|| {
            hashes.push(hash);
            hashes.len() - 1
        });
        flat.server_id = id;
    }
    for flat in flats.iter_mut() {
        flat.n_hosts = hashes.len();
        flat.host_hashes = hashes.clone();
    }
}

fn rewrite_node_ids(server: &mut TopoServer, server_id: usize) {
    for t in 0..NODE_TYPES {
        for node in server.nodes[t].iter_mut() {
            node.id = TopoId::new(server_id as u64, node.id.local_id());
        }
    }
}

impl ClusterTopo {
    /// Assemble the cluster view. The local `server` must already carry its
    /// computed paths; its ids are rewritten in place. Remote views are
    /// rebuilt from the wire and get their paths recomputed.
    pub fn build(
        server: &mut TopoServer,
        bootstrap: &dyn Bootstrap,
        paths: &dyn PathCompute,
    ) -> Result<ClusterTopo> {
        let n_ranks = bootstrap.n_ranks();
        let local_hash = server.host_hashes[server.server_id];

        let payload = wire::to_bytes(&wire::flatten(server))?;
        let gathered = bootstrap.all_gather(&payload)?;
        bootstrap.barrier(0)?;
        if gathered.len() != n_ranks {
            return Err(TopoError::Internal(format!(
                "all-gather returned {} buffers for {} ranks",
                gathered.len(),
                n_ranks
            )));
        }
        let mut flats = gathered
            .iter()
            .map(|bytes| wire::from_bytes(bytes))
            .collect::<Result<Vec<FlatServer>>>()?;

        reorder_server_ids(&mut flats);

        let num_servers = flats.first().map(|f| f.n_hosts).unwrap_or(0);
        let mut servers: Vec<Option<TopoServer>> = (0..num_servers).map(|_| None).collect();
        let mut seen = vec![false; num_servers];
        for flat in &flats {
            let server_id = flat.server_id;
            if seen[server_id] {
                continue;
            }
            seen[server_id] = true;
            if flat.host_hashes[server_id] == local_hash {
                // this host: the graph and paths are already authoritative,
                // only the identifiers move
                server.server_id = server_id;
                server.n_hosts = flat.n_hosts;
                server.host_hashes = flat.host_hashes.clone();
                rewrite_node_ids(server, server_id);
                continue;
            }
            let mut remote = wire::unflatten(flat);
            rewrite_node_ids(&mut remote, server_id);
            paths.compute_paths(&mut remote)?;
            servers[server_id] = Some(remote);
        }
        info!("assembled cluster topology with {} servers", num_servers);

        let mut cluster = ClusterTopo {
            num_servers,
            servers,
            net_to_server: Default::default(),
            routes: Default::default(),
        };
        cluster.fill_net_to_server(server);
        Ok(cluster)
    }

    fn fill_net_to_server(&mut self, local: &TopoServer) {
        for server_id in 0..self.num_servers {
            let server = if server_id == local.server_id {
                local
            } else {
                match self.servers[server_id].as_ref() {
                    Some(s) => s,
                    None => continue,
                }
            };
            for node in server.nodes_of(NodeType::Net) {
                let guid = node.attrs.net().guid;
                info!("net guid {:x} on server {}", guid, server_id);
                self.net_to_server.insert(guid, server_id);
            }
        }
    }

    /// Load inter-server routes from FLAGCX_INTERSERVER_ROUTE_FILE. The
    /// variable being unset leaves the cluster without inter-server
    /// bandwidth info, which is fine.
    pub fn load_routes_from_env(&mut self, local: &TopoServer) -> Result<()> {
        match env_opt(ENV_INTERSERVER_ROUTE_FILE) {
            Some(path) => route::load_routes_from_file(self, local, &path),
            None => {
                info!("{} is not set", ENV_INTERSERVER_ROUTE_FILE);
                Ok(())
            }
        }
    }

    pub fn route(&self, local_guid: u64, remote_guid: u64) -> Option<&Route> {
        self.routes.get(&(local_guid, remote_guid))
    }

    /// Path category and effective bandwidth between two NICs; an unknown
    /// pair is disconnected, never an error.
    pub fn route_bandwidth(&self, local_guid: u64, remote_guid: u64) -> (PathType, f64) {
        match self.route(local_guid, remote_guid) {
            Some(route) => (PathType::Net, route.effective_bw),
            None => (PathType::Dis, 0.0),
        }
    }

    /// The server (local or remote) hosting this rank, if any.
    pub fn server_from_rank<'a>(
        &'a self,
        rank: i32,
        local: &'a TopoServer,
    ) -> Option<&'a TopoServer> {
        for server_id in 0..self.num_servers {
            let server = if server_id == local.server_id {
                local
            } else {
                match self.servers[server_id].as_ref() {
                    Some(s) => s,
                    None => continue,
                }
            };
            if server
                .nodes_of(NodeType::Apu)
                .iter()
                .any(|n| n.attrs.apu().rank == rank)
            {
                return Some(server);
            }
        }
        None
    }
}
