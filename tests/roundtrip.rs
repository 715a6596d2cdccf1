//! Randomized wire round trips over seeded topologies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hwtopo::graph::{LinkType, NodeHandle, NodeType, TopoId, TopoServer};
use hwtopo::wire;

const RAND_SEED: u64 = 0;

fn random_server(rng: &mut StdRng) -> TopoServer {
    let mut server = TopoServer::new();
    server.n_hosts = 1;
    server.host_hashes = vec![rng.gen()];

    let mut handles: Vec<NodeHandle> = Vec::new();
    for &kind in &[NodeType::Apu, NodeType::Pci, NodeType::Cpu, NodeType::Nic, NodeType::Net] {
        for i in 0..rng.gen_range(1..6) {
            let h = server.create_node(kind, TopoId::new(0, i)).unwrap();
            match kind {
                NodeType::Apu => {
                    let attrs = server[h].attrs.apu_mut();
                    attrs.dev = i as i32;
                    attrs.rank = i as i32;
                }
                NodeType::Pci => {
                    server[h].attrs.pci_mut().device = rng.gen();
                }
                NodeType::Net => {
                    let attrs = server[h].attrs.net_mut();
                    attrs.dev = i as i32;
                    attrs.guid = rng.gen();
                    attrs.bw = f64::from(rng.gen_range(1..100u32));
                }
                _ => {}
            }
            handles.push(h);
        }
    }

    for _ in 0..rng.gen_range(5..30) {
        let a = handles[rng.gen_range(0..handles.len())];
        let b = handles[rng.gen_range(0..handles.len())];
        if a == b {
            continue;
        }
        let kind = match rng.gen_range(0..3) {
            0 => LinkType::Pci,
            1 => LinkType::Sys,
            _ => LinkType::Net,
        };
        let bw = f64::from(rng.gen_range(1..50u32));
        server.connect(a, b, kind, bw).unwrap();
        server.connect(b, a, kind, bw).unwrap();
    }
    server
}

#[test]
fn random_topologies_round_trip() {
    let mut rng = StdRng::seed_from_u64(RAND_SEED);
    for _ in 0..50 {
        let server = random_server(&mut rng);
        let flat = wire::flatten(&server);
        let bytes = wire::to_bytes(&flat).unwrap();
        let decoded = wire::from_bytes(&bytes).unwrap();
        assert_eq!(flat, decoded);

        let rebuilt = wire::unflatten(&decoded);
        assert_eq!(wire::to_bytes(&wire::flatten(&rebuilt)).unwrap(), bytes);
        for (ours, theirs) in rebuilt.nodes.iter().zip(server.nodes.iter()) {
            assert_eq!(ours.len(), theirs.len());
            for (a, b) in ours.iter().zip(theirs.iter()) {
                assert_eq!(a.id, b.id);
                assert_eq!(a.links, b.links);
            }
        }
    }
}
