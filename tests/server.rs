//! Single-host scenarios: ingest, normalization and NIC selection.

mod common;

use common::BfsPaths;
use hwtopo::adapter::PathCompute;
use hwtopo::graph::{LinkType, NodeType, PathType};
use hwtopo::ingest::server_from_xml;
use hwtopo::query::{best_peers, local_net, local_net_node, nic_distance};
use hwtopo::xml::XmlDoc;

#[test]
fn single_host_nic_selection() {
    common::init();
    let doc = XmlDoc::parse(common::SINGLE_HOST_XML).unwrap();
    let mut server = server_from_xml(&doc, 0xaaaa_0001).unwrap();
    assert_eq!(server.server_id, 0);
    assert_eq!(server.count(NodeType::Apu), 2);
    assert_eq!(server.count(NodeType::Nic), 1);
    assert_eq!(server.count(NodeType::Net), 1);

    BfsPaths.compute_paths(&mut server).unwrap();
    server.print();

    // both ranks land on the only net device
    assert_eq!(local_net(&server, 0).unwrap(), 0);
    assert_eq!(local_net(&server, 1).unwrap(), 0);

    // the path crosses the host bridge
    let dist = nic_distance(&server, 1).unwrap();
    assert_eq!(dist.distance, PathType::Phb);
    assert_eq!(dist.guid, 0xabc1);

    let net = local_net_node(&server, 0).unwrap();
    assert_eq!(server[net].attrs.net().guid, 0xabc1);
}

#[test]
fn link_symmetry_after_ingest() {
    let doc = XmlDoc::parse(common::SINGLE_HOST_XML).unwrap();
    let server = server_from_xml(&doc, 0xaaaa_0001).unwrap();
    for nodes in server.nodes.iter() {
        for node in nodes {
            for link in &node.links {
                if link.kind == LinkType::Loc {
                    continue;
                }
                let remote = &server[link.remote];
                let reverse = remote
                    .links
                    .iter()
                    .find(|l| l.kind == link.kind && server[l.remote].id == node.id)
                    .unwrap_or_else(|| {
                        panic!("no reverse link from {} to {}", remote.id, node.id)
                    });
                assert_eq!(reverse.bw, link.bw);
            }
        }
    }
}

#[test]
fn apu_link_bandwidth_follows_pci_generation() {
    let doc = XmlDoc::parse(common::SINGLE_HOST_XML).unwrap();
    let server = server_from_xml(&doc, 0xaaaa_0001).unwrap();
    let apu = &server.nodes_of(NodeType::Apu)[0];
    let to_cpu = apu
        .links
        .iter()
        .find(|l| l.remote.kind == NodeType::Cpu)
        .unwrap();
    // Gen4 x16: 16 * 120 / 80.0
    assert_eq!(to_cpu.bw, 24.0);
    let nic = &server.nodes_of(NodeType::Nic)[0];
    let to_cpu = nic
        .links
        .iter()
        .find(|l| l.remote.kind == NodeType::Cpu)
        .unwrap();
    // Gen3 x8: 8 * 60 / 80.0
    assert_eq!(to_cpu.bw, 6.0);
}

#[test]
fn best_peer_selection_ties_over_all_nets() {
    common::init();
    let xml = common::quad_host_xml(0x77, 0, 0xe0);
    let doc = XmlDoc::parse(&xml).unwrap();
    let mut server = server_from_xml(&doc, 0x77).unwrap();
    BfsPaths.compute_paths(&mut server).unwrap();

    let apu = server.get_node(NodeType::Apu, server.nodes_of(NodeType::Apu)[0].id).unwrap();
    let (peers, kind) = best_peers(&server, apu, NodeType::Net).unwrap();
    assert_eq!(peers, vec![0, 1, 2, 3]);
    assert_eq!(kind, PathType::Phb);

    // the mirrored choice spreads the accelerators over all four NICs
    let mut chosen: Vec<i32> = (0..4).map(|r| local_net(&server, r).unwrap()).collect();
    assert_eq!(chosen, vec![0, 2, 1, 3]);
    chosen.sort_unstable();
    assert_eq!(chosen, vec![0, 1, 2, 3]);
}
