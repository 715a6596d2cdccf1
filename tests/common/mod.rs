//! Shared fixtures: a stand-in path computation and hardware documents.
#![allow(dead_code)]

use hwtopo::adapter::PathCompute;
use hwtopo::constants::LOC_BW;
use hwtopo::graph::{LinkType, NodeHandle, NodeType, PathInfo, PathType, TopoServer, NODE_TYPES};
use hwtopo::Result;

pub fn init() {
    hwtopo::logging::init_log();
}

/// Depth-first bottleneck path filler standing in for the external path
/// computation. It classifies by what the walk crossed: a SYS link, a host
/// bridge (CPU), or one or more PCI switches. Good enough for the
/// tree-shaped topologies used in tests.
pub struct BfsPaths;

fn search(
    server: &TopoServer,
    cur: NodeHandle,
    dst: NodeHandle,
    visited: &mut Vec<NodeHandle>,
    bw: f64,
    switches: usize,
    crossed_cpu: bool,
    used_sys: bool,
) -> Option<(f64, usize, bool, bool)> {
    if cur == dst {
        return Some((bw, switches, crossed_cpu, used_sys));
    }
    // direct hop first so a one-link connection is never shadowed by a detour
    let links = &server[cur].links;
    let ordered = links
        .iter()
        .filter(|l| l.remote == dst)
        .chain(links.iter().filter(|l| l.remote != dst));
    for link in ordered {
        if link.kind == LinkType::Loc {
            continue;
        }
        let next = link.remote;
        if visited.contains(&next) {
            continue;
        }
        visited.push(next);
        let mut sw = switches;
        let mut cc = crossed_cpu;
        if next != dst {
            match next.kind {
                NodeType::Pci => sw += 1,
                NodeType::Cpu => cc = true,
                _ => {}
            }
        }
        let us = used_sys || link.kind == LinkType::Sys;
        if let Some(hit) = search(server, next, dst, visited, bw.min(link.bw), sw, cc, us) {
            return Some(hit);
        }
    }
    None
}

fn classify(switches: usize, crossed_cpu: bool, used_sys: bool) -> PathType {
    if used_sys {
        PathType::Sys
    } else if crossed_cpu {
        PathType::Phb
    } else if switches >= 2 {
        PathType::Pxb
    } else {
        PathType::Pix
    }
}

impl PathCompute for BfsPaths {
    fn compute_paths(&self, server: &mut TopoServer) -> Result<()> {
        let counts: Vec<usize> = (0..NODE_TYPES).map(|t| server.nodes[t].len()).collect();
        for t in 0..NODE_TYPES {
            for i in 0..counts[t] {
                let src = NodeHandle {
                    kind: NodeType::from_code(t),
                    index: i,
                };
                for (dt, &count) in counts.iter().enumerate() {
                    let mut row = Vec::with_capacity(count);
                    for j in 0..count {
                        let dst = NodeHandle {
                            kind: NodeType::from_code(dt),
                            index: j,
                        };
                        if src == dst {
                            row.push(PathInfo {
                                kind: PathType::Loc,
                                bw: LOC_BW,
                            });
                            continue;
                        }
                        let mut visited = vec![src];
                        match search(&*server, src, dst, &mut visited, f64::INFINITY, 0, false, false)
                        {
                            Some((bw, sw, cc, us)) => row.push(PathInfo {
                                kind: classify(sw, cc, us),
                                bw,
                            }),
                            None => row.push(PathInfo {
                                kind: PathType::Dis,
                                bw: 0.0,
                            }),
                        }
                    }
                    server.nodes[t][i].paths[dt] = Some(row);
                }
            }
        }
        Ok(())
    }
}

/// One CPU, two accelerators, one NIC with one net port.
pub const SINGLE_HOST_XML: &str = r#"
<system version="1">
  <cpu host_hash="0xaaaa0001" numaid="0" arch="x86_64" vendor="GenuineIntel" familyid="6" modelid="85" affinity="ffffffff">
    <pci busid="0000:10:00.0" link_width="16" link_speed="16.0 GT/s PCIe">
      <apu dev="0" rank="0"/>
    </pci>
    <pci busid="0000:20:00.0" link_width="16" link_speed="16.0 GT/s PCIe">
      <apu dev="1" rank="1"/>
    </pci>
    <pci busid="0000:30:00.0" link_width="8" link_speed="8.0 GT/s PCIe">
      <nic>
        <net dev="0" guid="0xabc1" speed="100000" latency="1.5" port="1" maxConn="8"/>
      </nic>
    </pci>
  </cpu>
</system>
"#;

/// One CPU, four accelerators and four single-port NICs, all equal, so NIC
/// selection ties four ways.
pub fn quad_host_xml(host_hash: u64, rank_base: usize, guid_base: u64) -> String {
    let mut body = String::new();
    for i in 0..4usize {
        body.push_str(&format!(
            r#"    <pci busid="0000:1{}:00.0" link_width="16" link_speed="16.0 GT/s PCIe">
      <apu dev="{}" rank="{}"/>
    </pci>
"#,
            i,
            i,
            rank_base + i
        ));
    }
    for i in 0..4usize {
        body.push_str(&format!(
            r#"    <pci busid="0000:2{}:00.0" link_width="16" link_speed="16.0 GT/s PCIe">
      <nic>
        <net dev="{}" guid="0x{:x}" speed="100000" latency="1.0" port="1" maxConn="8"/>
      </nic>
    </pci>
"#,
            i,
            i,
            guid_base + i as u64
        ));
    }
    format!(
        r#"<system version="1">
  <cpu host_hash="0x{:x}" numaid="0" arch="x86_64" vendor="AuthenticAMD">
{}  </cpu>
</system>
"#,
        host_hash, body
    )
}
