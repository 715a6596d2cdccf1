//! Graph normalization: fold redundant BCM PCI switch tiers into their
//! parent and synthesize CPU-to-CPU links from vendor/arch bandwidth tables.

use log::warn;

use crate::constants::{
    AMD_BW, ARM_BW, LOC_BW, MAX_LINKS, P9_BW, QPI_BW, SKL_QPI_BW, YONGFENG_ZPI_BW, ZPI_BW,
};
use crate::graph::{
    CpuArch, CpuAttrs, CpuModel, CpuVendor, Link, LinkType, NodeHandle, NodeType, TopoServer,
};
use crate::{Result, TopoError};

/// BCM PEX switch generation for a packed PCI id, 0 when not a BCM part.
/// Gen4 parts show one id in base mode; Gen5 parts shift theirs per level.
fn bcm_gen(device: u64, level: u64) -> u32 {
    if device & 0xffff_ffff_ffff_f000 == 0x1000_c010_1000_a000 {
        return 4;
    }
    if device & 0xffff_ffff_ffff_f000 == (0x1000_c030_1000_0000 | level * 0x1000) {
        return 5;
    }
    0
}

/// Fold every BCM sub switch into its parent: the sub's children become
/// direct children of the parent, reverse links are rewritten, the sub is
/// removed. A processed switch gets 0xffff merged into its packed id so it
/// never matches again; the scan restarts because removals shift the array.
pub fn flatten_bcm_switches(server: &mut TopoServer) -> Result<()> {
    let mut s = 0;
    while s < server.count(NodeType::Pci) {
        let (switch_id, device) = {
            let node = &server.nodes_of(NodeType::Pci)[s];
            (node.id, node.attrs.pci().device)
        };
        let gen = bcm_gen(device, 0);
        if gen == 0 {
            s += 1;
            continue;
        }

        // Find sub switches of the same generation and detach their links.
        let remotes: Vec<NodeHandle> = server.nodes_of(NodeType::Pci)[s]
            .links
            .iter()
            .map(|l| l.remote)
            .collect();
        let mut sub_ids = Vec::new();
        let mut detach = Vec::new();
        for remote in remotes {
            if remote.kind != NodeType::Pci {
                continue;
            }
            let sub = &server[remote];
            if bcm_gen(sub.attrs.pci().device, 1) != gen {
                continue;
            }
            sub_ids.push(sub.id);
            detach.push(remote);
        }
        server.nodes[NodeType::Pci.code()][s]
            .links
            .retain(|l| !detach.contains(&l.remote));

        for sub_id in sub_ids {
            // removals shift the array, so both indices are re-resolved
            let parent_index = server
                .id_to_index(NodeType::Pci, switch_id)
                .ok_or_else(|| {
                    TopoError::Internal("parent switch vanished while flattening".into())
                })?;
            let sub_index = server.id_to_index(NodeType::Pci, sub_id).ok_or_else(|| {
                TopoError::Internal("sub switch vanished while flattening".into())
            })?;
            let parent = NodeHandle {
                kind: NodeType::Pci,
                index: parent_index,
            };
            let sub = NodeHandle {
                kind: NodeType::Pci,
                index: sub_index,
            };

            let sub_links: Vec<Link> = server[sub].links.clone();
            for link in sub_links {
                if link.remote == parent {
                    continue;
                }
                if server[parent].links.len() == MAX_LINKS {
                    warn!("too many topo links (max {})", MAX_LINKS);
                    return Err(TopoError::Internal(
                        "link table full while flattening switch".into(),
                    ));
                }
                // reattach the child onto the parent switch
                server[parent].links.push(link);
                // and point the child's reverse link at the parent
                let rem = link.remote;
                for rl in server[rem].links.iter_mut() {
                    if rl.remote == sub {
                        rl.remote = parent;
                        break;
                    }
                }
            }
            server.remove_node(NodeType::Pci, sub_index);
        }

        let parent_index = server
            .id_to_index(NodeType::Pci, switch_id)
            .ok_or_else(|| TopoError::Internal("parent switch vanished while flattening".into()))?;
        server.nodes[NodeType::Pci.code()][parent_index]
            .attrs
            .pci_mut()
            .device |= 0xffff;
        s = 0;
    }
    Ok(())
}

fn inter_cpu_bw(cpu: &CpuAttrs) -> f64 {
    match cpu.arch {
        CpuArch::Power => P9_BW,
        CpuArch::Arm => ARM_BW,
        CpuArch::X86 => match cpu.vendor {
            CpuVendor::Intel => {
                if cpu.model == CpuModel::Skl {
                    SKL_QPI_BW
                } else {
                    QPI_BW
                }
            }
            CpuVendor::Amd => AMD_BW,
            CpuVendor::Zhaoxin => {
                if cpu.model == CpuModel::Yongfeng {
                    YONGFENG_ZPI_BW
                } else {
                    ZPI_BW
                }
            }
            CpuVendor::Undef => LOC_BW,
        },
        CpuArch::Undef => LOC_BW,
    }
}

/// Add a SYS link for every ordered pair of distinct CPUs on the same host.
/// A pair that already has one is left alone, so a second run is a no-op.
pub fn connect_cpus(server: &mut TopoServer) -> Result<()> {
    let n = server.count(NodeType::Cpu);
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let id_i = server.nodes_of(NodeType::Cpu)[i].id;
            let id_j = server.nodes_of(NodeType::Cpu)[j].id;
            if id_i.server_id() != id_j.server_id() {
                continue;
            }
            let a = NodeHandle {
                kind: NodeType::Cpu,
                index: i,
            };
            let b = NodeHandle {
                kind: NodeType::Cpu,
                index: j,
            };
            if server[a]
                .links
                .iter()
                .any(|l| l.kind == LinkType::Sys && l.remote == b)
            {
                continue;
            }
            let bw = inter_cpu_bw(server[a].attrs.cpu());
            server.connect(a, b, LinkType::Sys, bw)?;
        }
    }
    Ok(())
}

/// Full normalization pass: BCM flattening, then CPU pair synthesis.
pub fn normalize(server: &mut TopoServer) -> Result<()> {
    flatten_bcm_switches(server)?;
    connect_cpus(server)
}
