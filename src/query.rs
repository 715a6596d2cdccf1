//! Locality queries over the computed path matrix: best-peer selection and
//! NIC choice per accelerator, with the file/env override chain.

use log::{info, warn};

use crate::adapter::NetPlugin;
use crate::constants::{ENV_ENABLE_TOPO_DETECT, ENV_TOPO_FILE, ENV_USENET, MAX_NODES};
use crate::graph::{NodeHandle, NodeType, PathType, TopoServer};
use crate::xml::XmlDoc;
use crate::{env_opt, Result, TopoError};

/// Path category and guid of the NIC chosen for a rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NicDistance {
    pub distance: PathType,
    pub guid: u64,
}

fn rank_to_index(server: &TopoServer, rank: i32) -> Result<usize> {
    server
        .nodes_of(NodeType::Apu)
        .iter()
        .position(|n| n.attrs.apu().rank == rank)
        .ok_or_else(|| TopoError::InvalidUsage(format!("rank {} not present in topology", rank)))
}

/// Destinations of `dst` type tying on the lexicographic maximum of
/// `(bandwidth, -pathType)` from `from`, written into `out`. Returns the
/// tie count and the shared path type.
pub fn best_peers_into(
    server: &TopoServer,
    from: NodeHandle,
    dst: NodeType,
    out: &mut [usize],
) -> Result<(usize, PathType)> {
    let paths = match &server[from].paths[dst.code()] {
        Some(p) => p,
        None => return Ok((0, PathType::Dis)),
    };
    let mut max_bw = 0.0;
    let mut min_type = PathType::Dis;
    let mut count = 0;
    for (i, path) in paths.iter().enumerate().take(server.count(dst)) {
        if path.bw > max_bw || (path.bw == max_bw && path.kind < min_type) {
            max_bw = path.bw;
            min_type = path.kind;
            count = 0;
        }
        if path.bw == max_bw && path.kind == min_type {
            if count == out.len() {
                warn!(
                    "ran out of room to store best peers ({} of type {})",
                    out.len(),
                    dst
                );
                return Err(TopoError::Internal("best peer buffer overflow".into()));
            }
            out[count] = i;
            count += 1;
        }
    }
    Ok((count, min_type))
}

/// Owned variant of [`best_peers_into`], sized to the tie count.
pub fn best_peers(
    server: &TopoServer,
    from: NodeHandle,
    dst: NodeType,
) -> Result<(Vec<usize>, PathType)> {
    let mut buf = vec![0usize; server.count(dst)];
    let (count, kind) = best_peers_into(server, from, dst, &mut buf)?;
    buf.truncate(count);
    Ok((buf, kind))
}

#[inline]
fn is_pow2(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}

/// Reverse the low log2(pow2) bits of val.
fn mirror_bits(val: usize, pow2: usize) -> usize {
    let mut mirror = 0;
    let mut bit = 1;
    while bit < pow2 {
        mirror <<= 1;
        if val & bit != 0 {
            mirror |= 1;
        }
        bit <<= 1;
    }
    mirror
}

/// The NET node this rank should use. When the number of equally good NICs
/// is a power of two, the accelerator index is bit-reversed so neighboring
/// accelerators spread over different NICs.
pub fn local_net_node(server: &TopoServer, rank: i32) -> Result<NodeHandle> {
    let apu = rank_to_index(server, rank)?;
    let from = NodeHandle {
        kind: NodeType::Apu,
        index: apu,
    };
    let mut locals = [0usize; MAX_NODES];
    let (count, _) = best_peers_into(server, from, NodeType::Net, &mut locals)?;
    if count == 0 {
        warn!("could not find any local path from apu {} to net", apu);
        return Err(TopoError::Internal(format!("no local net for apu {}", apu)));
    }
    info!("found {} local nets for apu {}", count, apu);

    let dev = server.nodes_of(NodeType::Apu)[apu].attrs.apu().dev;
    if dev < 0 {
        return Err(TopoError::Internal(format!(
            "apu {} has no device index",
            apu
        )));
    }
    let mut n = dev as usize;
    if is_pow2(count) {
        n = mirror_bits(n, count);
    }
    Ok(NodeHandle {
        kind: NodeType::Net,
        index: locals[n % count],
    })
}

/// The net device index this rank should use.
pub fn local_net(server: &TopoServer, rank: i32) -> Result<i32> {
    let net = local_net_node(server, rank)?;
    let dev = server[net].attrs.net().dev;
    info!("local net for rank {} is {}", rank, dev);
    Ok(dev)
}

/// Path category and guid of the NIC chosen for this rank.
pub fn nic_distance(server: &TopoServer, rank: i32) -> Result<NicDistance> {
    let net_dev = local_net(server, rank)?;
    let apu = rank_to_index(server, rank)?;
    let paths = server.nodes_of(NodeType::Apu)[apu].paths[NodeType::Net.code()]
        .as_ref()
        .ok_or_else(|| TopoError::Internal("paths not computed".into()))?;
    for (i, node) in server.nodes_of(NodeType::Net).iter().enumerate() {
        if node.attrs.net().dev == net_dev {
            return Ok(NicDistance {
                distance: paths[i].kind,
                guid: node.attrs.net().guid,
            });
        }
    }
    Err(TopoError::Internal(format!(
        "net device {} not in topology",
        net_dev
    )))
}

/// Net name for a device from the override document named by
/// FLAGCX_TOPO_FILE. A matching gpu element without a net attribute is
/// treated as not found so the env fallbacks stay reachable.
fn net_name_from_topo_file(dev_id: i32) -> Result<Option<String>> {
    let path = match env_opt(ENV_TOPO_FILE) {
        Some(p) => p,
        None => {
            info!("{} environment variable not set", ENV_TOPO_FILE);
            return Ok(None);
        }
    };
    let doc = XmlDoc::from_file(&path)?;
    let mut found = false;
    for gpu in doc.root.descendants("gpu") {
        if gpu.attr_int_default("dev", -1)? != i64::from(dev_id) {
            continue;
        }
        found = true;
        match gpu.attr("net") {
            Some(net) if !net.is_empty() => {
                info!(
                    "GPU {} use net {} specified in topo file {}",
                    dev_id, net, path
                );
                return Ok(Some(net.to_owned()));
            }
            _ => warn!(
                "GPU {} net attribute is not specified in topo file {}",
                dev_id, path
            ),
        }
    }
    if !found {
        warn!("GPU {} not found in topo file {}", dev_id, path);
    }
    Ok(None)
}

/// Resolve the net device for an accelerator: the topo-file override wins,
/// then FLAGCX_USENET, and only with FLAGCX_ENABLE_TOPO_DETECT=TRUE the
/// topology-derived choice.
pub fn resolve_local_net(
    server: Option<&TopoServer>,
    rank: i32,
    dev_id: i32,
    plugin: &dyn NetPlugin,
) -> Result<Option<i32>> {
    let mut name = net_name_from_topo_file(dev_id)?;
    if name.is_none() {
        info!("did not find local net for apu {} in xml topo", dev_id);
        if let Some(use_net) = env_opt(ENV_USENET) {
            info!("APU {} use net {} from {}", dev_id, use_net, ENV_USENET);
            name = Some(use_net);
        }
    }
    if let Some(name) = name {
        return Ok(plugin.dev_from_name(&name));
    }
    if env_opt(ENV_ENABLE_TOPO_DETECT).as_deref() == Some("TRUE") {
        if let Some(server) = server {
            return local_net(server, rank).map(Some);
        }
    }
    Ok(None)
}
