//! Interfaces to the collaborators around the topology engine: the
//! bootstrap collectives, the accelerator platform, the NIC plugin and the
//! external path computation.

use std::sync::{Arc, Condvar, Mutex};

use crate::graph::TopoServer;
use crate::Result;

/// Blocking, fail-stop bootstrap collectives. `all_gather` must deliver the
/// payloads rank-ordered and byte-identical on every rank; the cluster
/// assembly depends on it.
pub trait Bootstrap {
    fn rank(&self) -> usize;
    fn n_ranks(&self) -> usize;
    fn all_gather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>>;
    fn barrier(&self, tag: u32) -> Result<()>;
}

/// Accelerator platform abstraction.
pub trait DeviceAdaptor {
    fn device_by_pci_bus_id(&self, bus_id: &str) -> Result<i32>;
}

#[derive(Debug, Clone)]
pub struct NetProperties {
    pub name: String,
    pub pci_path: String,
    pub guid: u64,
    /// Mb/s.
    pub speed: i64,
    pub latency: f64,
    pub port: i32,
    pub max_comms: i32,
}

/// NIC plugin surface.
pub trait NetPlugin {
    fn devices(&self) -> Result<usize>;
    fn properties(&self, dev: usize) -> Result<NetProperties>;
    fn dev_from_name(&self, name: &str) -> Option<i32>;
}

/// External path computation filling `paths[*]` for every node.
pub trait PathCompute {
    fn compute_paths(&self, server: &mut TopoServer) -> Result<()>;
}

/// Identity of one rank as the bootstrap layer reports it.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub rank: usize,
    pub host_hash: u64,
    pub bus_id: String,
}

struct GatherState {
    slots: Vec<Option<Vec<u8>>>,
    result: Option<Arc<Vec<Vec<u8>>>>,
    departed: usize,
}

struct GatherShared {
    state: Mutex<GatherState>,
    cv: Condvar,
}

/// In-process bootstrap over shared state: every rank runs on its own
/// thread and holds one handle. Collectives are rank-ordered and release
/// all ranks together, like their distributed counterparts.
pub struct LocalBootstrap {
    rank: usize,
    n_ranks: usize,
    shared: Arc<GatherShared>,
}

impl LocalBootstrap {
    /// One handle per rank, all backed by the same rendezvous state.
    pub fn create(n_ranks: usize) -> Vec<LocalBootstrap> {
        let shared = Arc::new(GatherShared {
            state: Mutex::new(GatherState {
                slots: vec![None; n_ranks],
                result: None,
                departed: 0,
            }),
            cv: Condvar::new(),
        });
        (0..n_ranks)
            .map(|rank| LocalBootstrap {
                rank,
                n_ranks,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Bootstrap for LocalBootstrap {
    fn rank(&self) -> usize {
        self.rank
    }

    fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    fn all_gather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shared = &*self.shared;
        let mut state = shared.state.lock().unwrap();
        // wait until the previous round has fully drained
        while state.result.is_some() {
            state = shared.cv.wait(state).unwrap();
        }
        state.slots[self.rank] = Some(payload.to_vec());
        if state.slots.iter().all(|s| s.is_some()) {
            let gathered: Vec<Vec<u8>> = state.slots.iter_mut().map(|s| s.take().unwrap()).collect();
            state.result = Some(Arc::new(gathered));
            shared.cv.notify_all();
        }
        while state.result.is_none() {
            state = shared.cv.wait(state).unwrap();
        }
        let out = Arc::clone(state.result.as_ref().unwrap());
        state.departed += 1;
        if state.departed == self.n_ranks {
            state.result = None;
            state.departed = 0;
            shared.cv.notify_all();
        }
        drop(state);
        Ok((*out).clone())
    }

    fn barrier(&self, _tag: u32) -> Result<()> {
        self.all_gather(&[]).map(|_| ())
    }
}
