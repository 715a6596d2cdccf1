//! Inter-server route resolution: parse the switch-fabric description and
//! compute the bottleneck bandwidth per NIC pair.

use log::info;

use crate::cluster::ClusterTopo;
use crate::graph::{NodeType, TopoServer};
use crate::xml::{parse_u64_hex, XmlDoc, XmlElem};
use crate::{Result, TopoError};

/// One fabric tier between two NICs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Switch {
    pub down_bw: f64,
    pub up_bw: f64,
    pub down_link: i32,
    pub up_link: i32,
    pub is_top: bool,
}

/// A directed NIC-to-NIC route. The reverse direction keeps only the
/// switch count and the effective bandwidth; the tier detail is not needed
/// for queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub local_guid: u64,
    pub remote_guid: u64,
    pub switch_count: usize,
    pub switches: Vec<Switch>,
    pub effective_bw: f64,
}

/// Bottleneck bandwidth: the NIC pair, then per tier `downBw` against the
/// oversubscription `upBw * upLink / downLink`; a top tier contributes only
/// its `downBw`.
pub fn effective_bw(local_bw: f64, remote_bw: f64, switches: &[Switch]) -> f64 {
    let mut bw = local_bw.min(remote_bw);
    for s in switches {
        if s.is_top {
            bw = bw.min(s.down_bw);
            continue;
        }
        bw = bw
            .min(s.down_bw)
            .min(s.up_bw * f64::from(s.up_link) / f64::from(s.down_link));
    }
    bw
}

fn net_bw_of(cluster: &ClusterTopo, local: &TopoServer, guid: u64) -> Result<f64> {
    let server_id = *cluster.net_to_server.get(&guid).ok_or_else(|| {
        TopoError::Internal(format!("route references unknown nic guid {:x}", guid))
    })?;
    let server = if server_id == local.server_id {
        local
    } else {
        cluster.servers[server_id].as_ref().ok_or_else(|| {
            TopoError::Internal(format!("no topology for server {}", server_id))
        })?
    };
    server
        .nodes_of(NodeType::Net)
        .iter()
        .find(|n| n.attrs.net().guid == guid)
        .map(|n| n.attrs.net().bw)
        .ok_or_else(|| {
            TopoError::Internal(format!(
                "net guid {:x} not found on server {}",
                guid, server_id
            ))
        })
}

fn parse_switches(inter: &XmlElem) -> Result<(usize, Vec<Switch>)> {
    let count = inter.attr_int("count")? as usize;
    let mut switches = Vec::with_capacity(count);
    for sw in inter.children.iter().filter(|c| c.name == "switch") {
        switches.push(Switch {
            down_bw: sw.attr_float("downBw")?,
            up_bw: sw.attr_float("upBw")?,
            up_link: sw.attr_int("upLink")? as i32,
            down_link: sw.attr_int("downLink")? as i32,
            is_top: sw.attr_int("isTop")? != 0,
        });
    }
    if switches.len() != count {
        return Err(TopoError::Internal(format!(
            "interSwitch count is {} but {} switch elements present",
            count,
            switches.len()
        )));
    }
    Ok((count, switches))
}

/// Parse an inter-server route document and register a forward and a
/// reverse route for every NIC pair.
pub fn load_routes_from_file(
    cluster: &mut ClusterTopo,
    local: &TopoServer,
    path: &str,
) -> Result<()> {
    let doc = XmlDoc::from_file(path)?;
    if doc.root.name != "interserver_route" {
        return Err(TopoError::Internal(format!(
            "unexpected route root element {:?} in {}",
            doc.root.name, path
        )));
    }
    let nic_pairs = doc
        .root
        .child("nic_pairs")
        .ok_or_else(|| TopoError::Internal(format!("no nic_pairs element in {}", path)))?;

    for pair in nic_pairs.children.iter().filter(|c| c.name == "pair") {
        let nic1 = pair
            .child("nic1")
            .ok_or_else(|| TopoError::Internal("missing nic1 element in pair".into()))?;
        let nic2 = pair
            .child("nic2")
            .ok_or_else(|| TopoError::Internal("missing nic2 element in pair".into()))?;
        let guid1 = parse_u64_hex(
            nic1.attr("guid")
                .ok_or_else(|| TopoError::Internal("nic1 element missing guid".into()))?,
        )?;
        let guid2 = parse_u64_hex(
            nic2.attr("guid")
                .ok_or_else(|| TopoError::Internal("nic2 element missing guid".into()))?,
        )?;
        let bw1 = net_bw_of(cluster, local, guid1)?;
        let bw2 = net_bw_of(cluster, local, guid2)?;

        let inter = pair
            .child("interSwitch")
            .ok_or_else(|| TopoError::Internal("no interSwitch element in pair".into()))?;
        let (count, switches) = parse_switches(inter)?;
        let bw = effective_bw(bw1, bw2, &switches);
        info!(
            "route {:x} <-> {:x}: {} switches, effective bw {}",
            guid1, guid2, count, bw
        );

        cluster.routes.insert(
            (guid1, guid2),
            Route {
                local_guid: guid1,
                remote_guid: guid2,
                switch_count: count,
                switches,
                effective_bw: bw,
            },
        );
        cluster.routes.insert(
            (guid2, guid1),
            Route {
                local_guid: guid2,
                remote_guid: guid1,
                switch_count: count,
                switches: Vec::new(),
                effective_bw: bw,
            },
        );
    }
    Ok(())
}
