//! Typed topology graph primitives.
//!
//! Nodes live in dense per-type arrays inside a [`TopoServer`]. Links refer
//! to their peer through a `(type, index)` [`NodeHandle`] rather than a
//! pointer, so the in-memory form and the wire form share one discipline;
//! the price is an explicit handle-rewrite sweep when a node is removed.

use std::fmt;
use std::ops::{Index, IndexMut};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::constants::{LOC_BW, MAX_LINKS, MAX_NODES, TOPO_UNDEF};
use crate::{Result, TopoError};

/// Number of node types; the extent of every per-type array.
pub const NODE_TYPES: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Apu = 0,
    Pci = 1,
    Cci = 2,
    Cpu = 3,
    Nic = 4,
    Net = 5,
    Hbd = 6,
}

impl NodeType {
    pub const ALL: [NodeType; NODE_TYPES] = [
        NodeType::Apu,
        NodeType::Pci,
        NodeType::Cci,
        NodeType::Cpu,
        NodeType::Nic,
        NodeType::Net,
        NodeType::Hbd,
    ];

    #[inline]
    pub fn code(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_code(code: usize) -> NodeType {
        Self::ALL[code]
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Apu => "APU",
            NodeType::Pci => "PCI",
            NodeType::Cci => "CCI",
            NodeType::Cpu => "CPU",
            NodeType::Nic => "NIC",
            NodeType::Net => "NET",
            NodeType::Hbd => "HBD",
        };
        write!(f, "{}", s)
    }
}

/// Physical link classes. The discriminants line up with the matching
/// [`PathType`] codes so the two scales can be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Loc = 0,
    Cci = 1,
    Pci = 3,
    Sys = 7,
    Net = 8,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkType::Loc => "LOC",
            LinkType::Cci => "CCI",
            LinkType::Pci => "PCI",
            LinkType::Sys => "SYS",
            LinkType::Net => "NET",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate reachability class between two nodes, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathType {
    Loc = 0,
    Cci = 1,
    Ccb = 2,
    Pix = 3,
    Pxb = 4,
    Pxn = 5,
    Phb = 6,
    Sys = 7,
    Net = 8,
    Dis = 9,
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathType::Loc => "LOC",
            PathType::Cci => "CCI",
            PathType::Ccb => "CCB",
            PathType::Pix => "PIX",
            PathType::Pxb => "PXB",
            PathType::Pxn => "PXN",
            PathType::Phb => "PHB",
            PathType::Sys => "SYS",
            PathType::Net => "NET",
            PathType::Dis => "DIS",
        };
        write!(f, "{}", s)
    }
}

/// Composite node id: the server id in the high 32 bits, the host-local id
/// (bus id, numa id, net device) in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopoId(pub u64);

impl TopoId {
    #[inline]
    pub fn new(server_id: u64, local_id: u64) -> TopoId {
        TopoId(server_id << 32 | (local_id & 0xffff_ffff))
    }

    #[inline]
    pub fn server_id(self) -> u64 {
        self.0 >> 32
    }

    #[inline]
    pub fn local_id(self) -> u64 {
        self.0 & 0xffff_ffff
    }
}

impl fmt::Display for TopoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.server_id(), self.local_id())
    }
}

/// CPU affinity bitmap parsed from the sysfs cpuset string, least
/// significant 32-bit word first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cpuset {
    words: Vec<u32>,
}

impl Cpuset {
    pub fn parse(s: &str) -> Result<Cpuset> {
        let mut words = Vec::new();
        for group in s.trim().split(',').rev() {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            let word = u32::from_str_radix(group, 16).map_err(|e| {
                TopoError::Internal(format!("bad affinity group {:?}: {}", group, e))
            })?;
            words.push(word);
        }
        Ok(Cpuset { words })
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_set(&self, cpu: usize) -> bool {
        self.words
            .get(cpu / 32)
            .map_or(false, |w| w >> (cpu % 32) & 1 == 1)
    }
}

impl fmt::Display for Cpuset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.words.iter().enumerate().rev() {
            write!(f, "{:08x}", word)?;
            if i != 0 {
                write!(f, ",")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuArch {
    Undef,
    X86,
    Arm,
    Power,
}

impl CpuArch {
    pub fn parse(s: &str) -> CpuArch {
        match s {
            "x86_64" => CpuArch::X86,
            "arm64" => CpuArch::Arm,
            "ppc64" => CpuArch::Power,
            _ => CpuArch::Undef,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuVendor {
    Undef,
    Intel,
    Amd,
    Zhaoxin,
}

impl CpuVendor {
    pub fn parse(s: &str) -> CpuVendor {
        match s {
            "GenuineIntel" => CpuVendor::Intel,
            "AuthenticAMD" => CpuVendor::Amd,
            "CentaurHauls" | "  Shanghai  " => CpuVendor::Zhaoxin,
            _ => CpuVendor::Undef,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuModel {
    Undef,
    Bdw,
    Skl,
    Yongfeng,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApuAttrs {
    /// Logical device index on this host.
    pub dev: i32,
    pub rank: i32,
    pub vendor: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuAttrs {
    pub arch: CpuArch,
    pub vendor: CpuVendor,
    pub model: CpuModel,
    /// Not part of the wire form; remote views lose it.
    #[serde(skip)]
    pub affinity: Cpuset,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PciAttrs {
    /// Packed `(vendor << 48) | (device << 32) | (subVendor << 16) | subDevice`.
    pub device: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetAttrs {
    pub dev: i32,
    /// Cluster-unique NIC identifier; the addressing key for routes.
    pub guid: u64,
    pub port: i32,
    /// GB/s.
    pub bw: f64,
    pub latency: f64,
    pub max_conn: i32,
}

/// Type-specific payload of a node; the node type is the discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeAttrs {
    Apu(ApuAttrs),
    Cpu(CpuAttrs),
    Pci(PciAttrs),
    Net(NetAttrs),
    None,
}

impl NodeAttrs {
    pub fn apu(&self) -> &ApuAttrs {
        match self {
            NodeAttrs::Apu(a) => a,
            _ => panic!("not an APU node"),
        }
    }

    pub fn apu_mut(&mut self) -> &mut ApuAttrs {
        match self {
            NodeAttrs::Apu(a) => a,
            _ => panic!("not an APU node"),
        }
    }

    pub fn cpu(&self) -> &CpuAttrs {
        match self {
            NodeAttrs::Cpu(c) => c,
            _ => panic!("not a CPU node"),
        }
    }

    pub fn cpu_mut(&mut self) -> &mut CpuAttrs {
        match self {
            NodeAttrs::Cpu(c) => c,
            _ => panic!("not a CPU node"),
        }
    }

    pub fn pci(&self) -> &PciAttrs {
        match self {
            NodeAttrs::Pci(p) => p,
            _ => panic!("not a PCI node"),
        }
    }

    pub fn pci_mut(&mut self) -> &mut PciAttrs {
        match self {
            NodeAttrs::Pci(p) => p,
            _ => panic!("not a PCI node"),
        }
    }

    pub fn net(&self) -> &NetAttrs {
        match self {
            NodeAttrs::Net(n) => n,
            _ => panic!("not a NET node"),
        }
    }

    pub fn net_mut(&mut self) -> &mut NetAttrs {
        match self {
            NodeAttrs::Net(n) => n,
            _ => panic!("not a NET node"),
        }
    }
}

/// `(type, index)` handle of a node inside a [`TopoServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    pub kind: NodeType,
    pub index: usize,
}

/// Directional link; every physical connection is two of these. Parallel
/// links of the same `(type, peer)` are aggregated by summing bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub kind: LinkType,
    pub remote: NodeHandle,
    /// GB/s, cumulative over aggregated parallel links.
    pub bw: f64,
}

/// One entry of the dense per-destination-type path matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathInfo {
    pub kind: PathType,
    pub bw: f64,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeType,
    pub id: TopoId,
    pub links: Vec<Link>,
    pub attrs: NodeAttrs,
    /// `paths[t][i]` describes the route to node `i` of type `t`, filled by
    /// the external path computation. `None` until computed.
    pub paths: [Option<Vec<PathInfo>>; NODE_TYPES],
}

/// One host's topology view.
#[derive(Debug, Clone, Default)]
pub struct TopoServer {
    pub server_id: usize,
    pub n_hosts: usize,
    /// Host hash per server id; unique across `[0, n_hosts)`.
    pub host_hashes: Vec<u64>,
    pub nodes: [Vec<Node>; NODE_TYPES],
}

impl Index<NodeHandle> for TopoServer {
    type Output = Node;

    #[inline]
    fn index(&self, ix: NodeHandle) -> &Node {
        &self.nodes[ix.kind.code()][ix.index]
    }
}

impl IndexMut<NodeHandle> for TopoServer {
    #[inline]
    fn index_mut(&mut self, ix: NodeHandle) -> &mut Node {
        &mut self.nodes[ix.kind.code()][ix.index]
    }
}

impl TopoServer {
    pub fn new() -> Self {
        Default::default()
    }

    #[inline]
    pub fn count(&self, kind: NodeType) -> usize {
        self.nodes[kind.code()].len()
    }

    #[inline]
    pub fn nodes_of(&self, kind: NodeType) -> &[Node] {
        &self.nodes[kind.code()]
    }

    /// Append a node of the given type. APUs get their LOC self-link, the
    /// other typed nodes start from sentinel attributes.
    pub fn create_node(&mut self, kind: NodeType, id: TopoId) -> Result<NodeHandle> {
        if self.nodes[kind.code()].len() == MAX_NODES {
            warn!("tried to create too many nodes of type {}", kind);
            return Err(TopoError::Internal(format!(
                "node table full for type {} (max {})",
                kind, MAX_NODES
            )));
        }
        let index = self.nodes[kind.code()].len();
        let handle = NodeHandle { kind, index };
        let mut node = Node {
            kind,
            id,
            links: Vec::new(),
            attrs: NodeAttrs::None,
            paths: Default::default(),
        };
        match kind {
            NodeType::Apu => {
                node.attrs = NodeAttrs::Apu(ApuAttrs {
                    dev: TOPO_UNDEF,
                    rank: TOPO_UNDEF,
                    vendor: TOPO_UNDEF,
                });
                node.links.push(Link {
                    kind: LinkType::Loc,
                    remote: handle,
                    bw: LOC_BW,
                });
            }
            NodeType::Cpu => {
                node.attrs = NodeAttrs::Cpu(CpuAttrs {
                    arch: CpuArch::Undef,
                    vendor: CpuVendor::Undef,
                    model: CpuModel::Undef,
                    affinity: Cpuset::default(),
                });
            }
            NodeType::Pci => {
                node.attrs = NodeAttrs::Pci(PciAttrs { device: 0 });
            }
            NodeType::Net => {
                node.attrs = NodeAttrs::Net(NetAttrs {
                    dev: TOPO_UNDEF,
                    guid: 0,
                    port: TOPO_UNDEF,
                    bw: 0.0,
                    latency: 0.0,
                    max_conn: TOPO_UNDEF,
                });
            }
            _ => {}
        }
        self.nodes[kind.code()].push(node);
        Ok(handle)
    }

    /// Linear scan by id.
    pub fn get_node(&self, kind: NodeType, id: TopoId) -> Option<NodeHandle> {
        self.id_to_index(kind, id)
            .map(|index| NodeHandle { kind, index })
    }

    pub fn id_to_index(&self, kind: NodeType, id: TopoId) -> Option<usize> {
        self.nodes[kind.code()].iter().position(|n| n.id == id)
    }

    /// Add a directional link, merging into an existing link of the same
    /// `(type, peer)` by summing bandwidth. Call symmetrically for both
    /// directions unless the link is intentionally one-way.
    pub fn connect(
        &mut self,
        from: NodeHandle,
        to: NodeHandle,
        kind: LinkType,
        bw: f64,
    ) -> Result<()> {
        if from == to && kind != LinkType::Loc {
            return Err(TopoError::InvalidUsage(format!(
                "self link of type {} on node {}",
                kind, self[from].id
            )));
        }
        let node = &mut self.nodes[from.kind.code()][from.index];
        if let Some(link) = node
            .links
            .iter_mut()
            .find(|l| l.remote == to && l.kind == kind)
        {
            link.bw += bw;
            return Ok(());
        }
        if node.links.len() == MAX_LINKS {
            warn!("too many topo links (max {})", MAX_LINKS);
            return Err(TopoError::Internal(format!(
                "link table full on node {} (max {})",
                node.id, MAX_LINKS
            )));
        }
        node.links.push(Link {
            kind,
            remote: to,
            bw,
        });
        Ok(())
    }

    /// Remove a node: erase every link pointing at it, then rewrite handles
    /// of nodes sitting above the removed slot before the array compacts.
    pub fn remove_node(&mut self, kind: NodeType, index: usize) {
        let target = NodeHandle { kind, index };
        for t in 0..NODE_TYPES {
            for node in self.nodes[t].iter_mut() {
                node.links.retain(|l| l.remote != target);
                for link in node.links.iter_mut() {
                    if link.remote.kind == kind && link.remote.index > index {
                        link.remote.index -= 1;
                    }
                }
            }
        }
        self.nodes[kind.code()].remove(index);
    }

    fn describe(&self, h: NodeHandle) -> String {
        let node = &self[h];
        match &node.attrs {
            NodeAttrs::Apu(a) => format!("Node [{}/{} ({})]", node.kind, node.id, a.rank),
            NodeAttrs::Cpu(c) => format!(
                "Node [{}/{} ({:?}/{:?}/{:?})]",
                node.kind, node.id, c.arch, c.vendor, c.model
            ),
            NodeAttrs::Pci(p) => format!("Node [{}/{} ({:x})]", node.kind, node.id, p.device),
            NodeAttrs::Net(n) => format!(
                "Node [{}/{} ({:x}/{}/{})]",
                node.kind, node.id, n.guid, n.port, n.bw
            ),
            NodeAttrs::None => format!("Node [{}/{}]", node.kind, node.id),
        }
    }

    fn print_rec(&self, h: NodeHandle, prev: Option<NodeHandle>, offset: usize) {
        info!("{:indent$}{}", "", self.describe(h), indent = offset);
        for link in &self[h].links {
            if link.kind == LinkType::Loc {
                continue;
            }
            if link.kind == LinkType::Pci && Some(link.remote) == prev {
                continue;
            }
            if link.kind == LinkType::Pci {
                info!(
                    "{:indent$}+ Link[{}/{:.1}]",
                    "",
                    link.kind,
                    link.bw,
                    indent = offset
                );
                self.print_rec(link.remote, Some(h), offset + 2);
            } else {
                info!(
                    "{:indent$}+ Link[{}/{:.1}] - {}",
                    "",
                    link.kind,
                    link.bw,
                    self.describe(link.remote),
                    indent = offset
                );
            }
        }
    }

    /// Log the node/link tree at info level, starting from the CPU roots.
    pub fn print(&self) {
        for n in 0..self.count(NodeType::Cpu) {
            self.print_rec(
                NodeHandle {
                    kind: NodeType::Cpu,
                    index: n,
                },
                None,
                0,
            );
        }
        info!("==========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(kind: NodeType, index: usize) -> NodeHandle {
        NodeHandle { kind, index }
    }

    #[test]
    fn apu_gets_loc_self_link() {
        let mut server = TopoServer::new();
        let apu = server.create_node(NodeType::Apu, TopoId::new(0, 1)).unwrap();
        let node = &server[apu];
        assert_eq!(node.links.len(), 1);
        assert_eq!(node.links[0].kind, LinkType::Loc);
        assert_eq!(node.links[0].remote, apu);
        assert_eq!(node.links[0].bw, LOC_BW);
    }

    #[test]
    fn connect_aggregates_parallel_links() {
        let mut server = TopoServer::new();
        let a = server.create_node(NodeType::Pci, TopoId::new(0, 1)).unwrap();
        let b = server.create_node(NodeType::Pci, TopoId::new(0, 2)).unwrap();
        server.connect(a, b, LinkType::Pci, 12.0).unwrap();
        server.connect(a, b, LinkType::Pci, 12.0).unwrap();
        assert_eq!(server[a].links.len(), 1);
        assert_eq!(server[a].links[0].bw, 24.0);
        // a different link type to the same peer is a separate link
        server.connect(a, b, LinkType::Sys, 6.0).unwrap();
        assert_eq!(server[a].links.len(), 2);
    }

    #[test]
    fn self_connect_requires_loc() {
        let mut server = TopoServer::new();
        let a = server.create_node(NodeType::Apu, TopoId::new(0, 1)).unwrap();
        assert!(server.connect(a, a, LinkType::Pci, 1.0).is_err());
        assert!(server.connect(a, a, LinkType::Loc, 1.0).is_ok());
    }

    #[test]
    fn get_node_is_explicit() {
        let mut server = TopoServer::new();
        let id = TopoId::new(0, 7);
        assert!(server.get_node(NodeType::Cpu, id).is_none());
        let cpu = server.create_node(NodeType::Cpu, id).unwrap();
        assert_eq!(server.get_node(NodeType::Cpu, id), Some(cpu));
    }

    #[test]
    fn remove_node_rewrites_handles() {
        let mut server = TopoServer::new();
        let p0 = server.create_node(NodeType::Pci, TopoId::new(0, 0)).unwrap();
        let p1 = server.create_node(NodeType::Pci, TopoId::new(0, 1)).unwrap();
        let p2 = server.create_node(NodeType::Pci, TopoId::new(0, 2)).unwrap();
        let cpu = server.create_node(NodeType::Cpu, TopoId::new(0, 0)).unwrap();
        server.connect(cpu, p0, LinkType::Pci, 1.0).unwrap();
        server.connect(cpu, p1, LinkType::Pci, 1.0).unwrap();
        server.connect(cpu, p2, LinkType::Pci, 1.0).unwrap();
        server.connect(p2, cpu, LinkType::Pci, 1.0).unwrap();

        server.remove_node(NodeType::Pci, 1);

        // the link to p1 is gone, the link to p2 now points at slot 1
        assert_eq!(server.count(NodeType::Pci), 2);
        assert_eq!(server[cpu].links.len(), 2);
        assert_eq!(server[cpu].links[0].remote, p0);
        assert_eq!(server[cpu].links[1].remote, handle(NodeType::Pci, 1));
        assert_eq!(server[handle(NodeType::Pci, 1)].id, TopoId::new(0, 2));
        let _ = (p1, p2);
    }

    #[test]
    fn cpuset_parse_and_display() {
        let set = Cpuset::parse("0000ffff,ffffffff").unwrap();
        assert!(set.is_set(0));
        assert!(set.is_set(47));
        assert!(!set.is_set(48));
        assert_eq!(set.to_string(), "0000ffff,ffffffff");
        assert!(Cpuset::parse("zz").is_err());
        assert!(Cpuset::default().is_empty());
    }

    #[test]
    fn topo_id_split() {
        let id = TopoId::new(3, 0x1234);
        assert_eq!(id.server_id(), 3);
        assert_eq!(id.local_id(), 0x1234);
        assert_eq!(id.to_string(), "3-1234");
    }
}
