//! Hardware XML ingestion: walk a parsed document and populate a
//! [`TopoServer`], then normalize it. Also carries the discovery glue that
//! annotates a probed document with accelerator and NIC attributes.

use std::path::Path;

use log::{info, warn};

use crate::adapter::{DeviceAdaptor, NetPlugin, PeerInfo};
use crate::constants::{
    pci_gen_speed, DEFAULT_NET_MBPS, ENV_TOPO_DUMP_FILE, LOC_BW, PCI_WIDTH_DEFAULT, TOPO_UNDEF,
};
use crate::graph::{Cpuset, CpuArch, CpuModel, CpuVendor, LinkType, NodeHandle, NodeType, TopoId, TopoServer};
use crate::normalize;
use crate::xml::{parse_int, parse_u64_hex, XmlDoc, XmlElem};
use crate::{env_opt, Result, TopoError};

/// Build one host's topology from a parsed hardware document and run the
/// normalization passes. The caller computes the path matrix afterwards.
pub fn server_from_xml(doc: &XmlDoc, local_host_hash: u64) -> Result<TopoServer> {
    let root = &doc.root;
    if root.name != "system" && root.name != "root" {
        return Err(TopoError::Internal(format!(
            "unexpected topology root element {:?}",
            root.name
        )));
    }
    let mut server = TopoServer::new();
    for cpu in root.children.iter().filter(|c| c.name == "cpu") {
        add_cpu(cpu, &mut server)?;
    }
    for (server_id, hash) in server.host_hashes.iter().enumerate() {
        if *hash == local_host_hash {
            server.server_id = server_id;
        }
    }
    normalize::normalize(&mut server)?;
    Ok(server)
}

pub fn server_from_xml_file<P: AsRef<Path>>(path: P, local_host_hash: u64) -> Result<TopoServer> {
    let doc = XmlDoc::from_file(path)?;
    server_from_xml(&doc, local_host_hash)
}

/// Allocate or reuse the host-local server id for this cpu's host hash.
fn server_id_of(server: &mut TopoServer, xml_cpu: &XmlElem) -> Result<usize> {
    let hash = match xml_cpu.attr("host_hash") {
        Some(s) => parse_u64_hex(s)?,
        None => 0,
    };
    if let Some(id) = server.host_hashes.iter().position(|h| *h == hash) {
        return Ok(id);
    }
    server.host_hashes.push(hash);
    server.n_hosts += 1;
    Ok(server.n_hosts - 1)
}

fn add_cpu(xml_cpu: &XmlElem, server: &mut TopoServer) -> Result<()> {
    let numa_id = xml_cpu.attr_int("numaid")? as u64;
    let server_id = server_id_of(server, xml_cpu)?;
    let cpu = server.create_node(NodeType::Cpu, TopoId::new(server_id as u64, numa_id))?;

    if let Some(s) = xml_cpu.attr("affinity") {
        server[cpu].attrs.cpu_mut().affinity = Cpuset::parse(s)?;
    }

    let arch_str = xml_cpu
        .attr("arch")
        .ok_or_else(|| TopoError::Internal("cpu element missing arch attribute".into()))?;
    let arch = CpuArch::parse(arch_str);
    server[cpu].attrs.cpu_mut().arch = arch;
    if arch == CpuArch::X86 {
        let vendor_str = xml_cpu
            .attr("vendor")
            .ok_or_else(|| TopoError::Internal("cpu element missing vendor attribute".into()))?;
        let vendor = CpuVendor::parse(vendor_str);
        server[cpu].attrs.cpu_mut().vendor = vendor;
        if vendor == CpuVendor::Intel {
            let family_id = xml_cpu.attr_int("familyid")?;
            let model_id = xml_cpu.attr_int("modelid")?;
            server[cpu].attrs.cpu_mut().model = if family_id == 6 && model_id >= 0x55 {
                CpuModel::Skl
            } else {
                CpuModel::Bdw
            };
        } else if vendor == CpuVendor::Zhaoxin {
            let family_id = xml_cpu.attr_int("familyid")?;
            let model_id = xml_cpu.attr_int("modelid")?;
            if family_id == 7 && model_id == 0x5B {
                server[cpu].attrs.cpu_mut().model = CpuModel::Yongfeng;
            }
        }
    }

    for sub in &xml_cpu.children {
        if sub.name == "pci" {
            add_pci(sub, server, cpu, server_id)?;
        }
        if sub.name == "nic" {
            // a NIC wired directly to the CPU, no pci element in between
            let id = TopoId::new(server_id as u64, 0);
            let nic = match server.get_node(NodeType::Nic, id) {
                Some(h) => h,
                None => {
                    let h = server.create_node(NodeType::Nic, id)?;
                    server.connect(cpu, h, LinkType::Pci, LOC_BW)?;
                    server.connect(h, cpu, LinkType::Pci, LOC_BW)?;
                    h
                }
            };
            add_nic(sub, server, nic, server_id)?;
        }
    }
    Ok(())
}

fn add_pci(
    xml_pci: &XmlElem,
    server: &mut TopoServer,
    parent: NodeHandle,
    server_id: usize,
) -> Result<()> {
    let busid_str = xml_pci
        .attr("busid")
        .ok_or_else(|| TopoError::Internal("pci element missing busid attribute".into()))?;
    let mut bus_id = bus_id_to_u64(busid_str)?;

    let mut kind = NodeType::Pci;
    let mut node: Option<NodeHandle> = None;

    if let Some(xml_apu) = xml_pci.child("apu") {
        kind = NodeType::Apu;
        let apu = server.create_node(NodeType::Apu, TopoId::new(server_id as u64, bus_id))?;
        add_apu(xml_apu, server, apu)?;
        node = Some(apu);
    }
    if let Some(xml_nic) = xml_pci.child("nic") {
        kind = NodeType::Nic;
        // drop the sub device id so multi-port cards fold into one NIC
        bus_id &= 0xffff_ffff_ffff_fff0;
        let id = TopoId::new(server_id as u64, bus_id);
        let nic = match server.get_node(NodeType::Nic, id) {
            Some(h) => h,
            None => {
                let h = server.create_node(NodeType::Nic, id)?;
                node = Some(h);
                h
            }
        };
        add_nic(xml_nic, server, nic, server_id)?;
    } else if kind == NodeType::Pci {
        let pci = server.create_node(NodeType::Pci, TopoId::new(server_id as u64, bus_id))?;
        let mut device: u64 = 0;
        if let Some(s) = xml_pci.attr("vendor") {
            device += (parse_int(s)? as u64) << 48;
        }
        if let Some(s) = xml_pci.attr("device") {
            device += (parse_int(s)? as u64) << 32;
        }
        if let Some(s) = xml_pci.attr("subsystem_vendor") {
            device += (parse_int(s)? as u64) << 16;
        }
        if let Some(s) = xml_pci.attr("subsystem_device") {
            device += parse_int(s)? as u64;
        }
        server[pci].attrs.pci_mut().device = device;
        node = Some(pci);
        for sub in xml_pci.children.iter().filter(|c| c.name == "pci") {
            add_pci(sub, server, pci, server_id)?;
        }
    }

    if let Some(node) = node {
        let width = match xml_pci.attr_int_default("link_width", 0)? {
            0 => PCI_WIDTH_DEFAULT,
            w => w,
        };
        let speed = pci_gen_speed(xml_pci.attr("link_speed"));
        let bw = width as f64 * speed as f64 / 80.0;
        server.connect(node, parent, LinkType::Pci, bw)?;
        server.connect(parent, node, LinkType::Pci, bw)?;
    }
    Ok(())
}

fn add_apu(xml_apu: &XmlElem, server: &mut TopoServer, apu: NodeHandle) -> Result<()> {
    let dev = xml_apu.attr_int("dev")? as i32;
    let rank = xml_apu.attr_int("rank")? as i32;
    let vendor = xml_apu.attr_int_default("vendor", TOPO_UNDEF as i64)? as i32;
    let attrs = server[apu].attrs.apu_mut();
    attrs.dev = dev;
    attrs.rank = rank;
    attrs.vendor = vendor;
    Ok(())
}

fn add_nic(
    xml_nic: &XmlElem,
    server: &mut TopoServer,
    nic: NodeHandle,
    server_id: usize,
) -> Result<()> {
    for xml_net in xml_nic.children.iter().filter(|c| c.name == "net") {
        if xml_net.attr("dev").is_none() {
            continue;
        }
        add_net(xml_net, server, nic, server_id)?;
    }
    Ok(())
}

fn add_net(
    xml_net: &XmlElem,
    server: &mut TopoServer,
    nic: NodeHandle,
    server_id: usize,
) -> Result<()> {
    let dev = xml_net.attr_int("dev")? as i32;
    let net = server.create_node(NodeType::Net, TopoId::new(server_id as u64, dev as u64))?;
    let guid = match xml_net.attr("guid") {
        Some(s) => parse_u64_hex(s)?,
        None => dev as u64,
    };
    let mut mbps = xml_net.attr_int_default("speed", 0)?;
    if mbps <= 0 {
        mbps = DEFAULT_NET_MBPS;
    }
    let bw = mbps as f64 / 8000.0;
    info!("adding net {} guid {:x}", dev, guid);
    {
        let attrs = server[net].attrs.net_mut();
        attrs.dev = dev;
        attrs.guid = guid;
        attrs.bw = bw;
        attrs.latency = xml_net.attr_float_default("latency", 0.0)?;
        attrs.port = xml_net.attr_int_default("port", 0)? as i32;
        attrs.max_conn = xml_net.attr_int_default("maxConn", 0)? as i32;
    }
    server.connect(nic, net, LinkType::Net, bw)?;
    server.connect(net, nic, LinkType::Net, bw)?;
    Ok(())
}

/// Bus id string ("0000:06:00.0") packed as hex digits into a u64.
pub fn bus_id_to_u64(bus_id: &str) -> Result<u64> {
    let mut value: u64 = 0;
    let mut digits = 0;
    for ch in bus_id.chars() {
        if ch == ':' || ch == '.' {
            continue;
        }
        let d = ch
            .to_digit(16)
            .ok_or_else(|| TopoError::Internal(format!("invalid bus id {:?}", bus_id)))?;
        value = value << 4 | u64::from(d);
        digits += 1;
    }
    if digits == 0 {
        return Err(TopoError::Internal(format!("invalid bus id {:?}", bus_id)));
    }
    Ok(value)
}

/// Annotate a probed hardware document: attach dev/rank to the apu element
/// of every local peer and describe every NIC the plugin reports. Rank 0
/// dumps the finished document when FLAGCX_TOPO_DUMP_FILE is set.
pub fn annotate_topology(
    doc: &mut XmlDoc,
    peers: &[PeerInfo],
    my_rank: usize,
    device: &dyn DeviceAdaptor,
    net: &dyn NetPlugin,
) -> Result<()> {
    let my_hash = peers
        .iter()
        .find(|p| p.rank == my_rank)
        .map(|p| p.host_hash)
        .ok_or_else(|| TopoError::InvalidUsage(format!("rank {} not present", my_rank)))?;

    info!("start detecting APUs");
    for peer in peers.iter().filter(|p| p.host_hash == my_hash) {
        let dev = device.device_by_pci_bus_id(&peer.bus_id)?;
        match doc.fill_apu(&peer.bus_id) {
            Some(apu) => {
                apu.set_attr("dev", &dev.to_string());
                apu.set_attr("rank", &peer.rank.to_string());
            }
            None => warn!("no pci element for apu at {}", peer.bus_id),
        }
    }

    for n in 0..net.devices()? {
        let props = net.properties(n)?;
        match doc.fill_net(&props.pci_path, &props.name) {
            Some(elem) => {
                elem.set_attr("dev", &n.to_string());
                elem.set_attr("speed", &props.speed.to_string());
                elem.set_attr("latency", &props.latency.to_string());
                elem.set_attr("port", &props.port.to_string());
                elem.set_attr("guid", &format!("0x{:x}", props.guid));
                elem.set_attr("maxConn", &props.max_comms.to_string());
            }
            None => warn!("no pci element for net {} ({})", props.name, props.pci_path),
        }
    }

    if my_rank == 0 {
        if let Some(path) = env_opt(ENV_TOPO_DUMP_FILE) {
            info!("dumping topology to {}", path);
            doc.to_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_id_packing() {
        assert_eq!(bus_id_to_u64("0000:06:00.0").unwrap(), 0x60000);
        assert_eq!(bus_id_to_u64("0001:a0:10.1").unwrap(), 0x1a00101);
        assert!(bus_id_to_u64("nope").is_err());
    }

    const MULTI_PORT: &str = r#"
<system version="1">
  <cpu host_hash="0x11" numaid="0" arch="x86_64" vendor="AuthenticAMD">
    <pci busid="0000:30:00.0" link_width="8" link_speed="8.0 GT/s PCIe">
      <nic>
        <net dev="0" guid="0xaa01" speed="100000" port="1"/>
      </nic>
    </pci>
    <pci busid="0000:30:00.1" link_width="8" link_speed="8.0 GT/s PCIe">
      <nic>
        <net dev="1" guid="0xaa02" speed="100000" port="2"/>
      </nic>
    </pci>
  </cpu>
</system>
"#;

    #[test]
    fn multi_port_nic_folds_into_one_node() {
        let doc = XmlDoc::parse(MULTI_PORT).unwrap();
        let server = server_from_xml(&doc, 0x11).unwrap();
        assert_eq!(server.count(NodeType::Nic), 1);
        assert_eq!(server.count(NodeType::Net), 2);
        let nic = &server.nodes_of(NodeType::Nic)[0];
        // one link back to the CPU, one per net
        assert_eq!(
            nic.links
                .iter()
                .filter(|l| l.kind == LinkType::Net)
                .count(),
            2
        );
        // 100000 Mb/s is 12.5 GB/s
        assert_eq!(server.nodes_of(NodeType::Net)[0].attrs.net().bw, 12.5);
    }

    const CPU_DIRECT_NIC: &str = r#"
<system version="1">
  <cpu host_hash="0x11" numaid="0" arch="arm64">
    <nic>
      <net dev="0" speed="25000"/>
    </nic>
  </cpu>
</system>
"#;

    #[test]
    fn cpu_direct_nic_uses_loc_bandwidth() {
        let doc = XmlDoc::parse(CPU_DIRECT_NIC).unwrap();
        let server = server_from_xml(&doc, 0x11).unwrap();
        assert_eq!(server.count(NodeType::Nic), 1);
        let nic = &server.nodes_of(NodeType::Nic)[0];
        assert_eq!(nic.id, TopoId::new(0, 0));
        let to_cpu = nic
            .links
            .iter()
            .find(|l| l.remote.kind == NodeType::Cpu)
            .unwrap();
        assert_eq!(to_cpu.kind, LinkType::Pci);
        assert_eq!(to_cpu.bw, LOC_BW);
        // guid defaults to the device index when missing
        assert_eq!(server.nodes_of(NodeType::Net)[0].attrs.net().guid, 0);
    }

    const TWO_NUMA: &str = r#"
<system version="1">
  <cpu host_hash="0x11" numaid="0" arch="x86_64" vendor="GenuineIntel" familyid="6" modelid="0x55"/>
  <cpu host_hash="0x11" numaid="1" arch="x86_64" vendor="GenuineIntel" familyid="6" modelid="79"/>
</system>
"#;

    #[test]
    fn host_hash_reuses_server_id() {
        let doc = XmlDoc::parse(TWO_NUMA).unwrap();
        let server = server_from_xml(&doc, 0x11).unwrap();
        assert_eq!(server.n_hosts, 1);
        assert_eq!(server.host_hashes, vec![0x11]);
        assert_eq!(server.count(NodeType::Cpu), 2);
        let skl = &server.nodes_of(NodeType::Cpu)[0];
        assert_eq!(skl.attrs.cpu().model, CpuModel::Skl);
        let bdw = &server.nodes_of(NodeType::Cpu)[1];
        assert_eq!(bdw.attrs.cpu().model, CpuModel::Bdw);
        // both CPUs sit on server 0 and got their SYS pair links
        assert!(skl.links.iter().any(|l| l.kind == LinkType::Sys));
    }

    #[test]
    fn missing_required_attribute_fails() {
        let doc = XmlDoc::parse(r#"<system><cpu numaid="0"/></system>"#).unwrap();
        assert!(server_from_xml(&doc, 0).is_err());
        let doc = XmlDoc::parse(r#"<system><cpu numaid="0" arch="x86_64"><pci/></cpu></system>"#)
            .unwrap();
        assert!(server_from_xml(&doc, 0).is_err());
    }
}
