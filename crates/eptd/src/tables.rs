//! Topology reference table rows
//!
//! These tables change slowly. They are replaced wholesale on a topology
//! rebuild and read through the per-fabric caches.

use crate::store::Collection;
use serde::{Deserialize, Serialize};

/// Fabric node (leaf, spine or controller)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub fabric: String,
    pub node_id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    /// vpc peer node id, 0 when not part of a vpc domain
    #[serde(default)]
    pub peer: u32,
    #[serde(default)]
    pub tep_ip: String,
}

/// Tunnel interface on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub fabric: String,
    pub node: u32,
    pub intf: String,
    /// Destination tunnel endpoint address
    #[serde(default)]
    pub dst: String,
    /// Encapsulation type, e.g. `ivxlan` or `vxlan`
    #[serde(default)]
    pub encap: String,
    /// Node owning the destination address, 0 when unknown
    #[serde(default)]
    pub remote: u32,
}

/// Port-channel to vpc mapping on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcRecord {
    pub fabric: String,
    pub node: u32,
    pub intf: String,
    pub vpc: u32,
    #[serde(default)]
    pub name: String,
}

/// Port-channel interface with its policy name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChannelRecord {
    pub fabric: String,
    pub node: u32,
    pub intf: String,
    pub name: String,
}

/// vnid to VRF or BD name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnidRecord {
    pub fabric: String,
    pub vnid: u32,
    pub name: String,
    /// Owning VRF vnid for a BD, 0 for a VRF
    #[serde(default)]
    pub vrf: u32,
}

/// EPG keyed by (vrf, pctag)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpgRecord {
    pub fabric: String,
    pub vrf: u32,
    pub pctag: u32,
    pub name: String,
    /// Bridge domain vnid
    #[serde(default)]
    pub bd: u32,
}

/// Subnet configured on a bridge domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub fabric: String,
    pub bd: u32,
    /// Gateway address with prefix length, e.g. `10.0.0.1/24`
    pub ip: String,
}

/// Complete topology of a fabric as returned by a controller session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub tunnels: Vec<TunnelRecord>,
    #[serde(default)]
    pub vpcs: Vec<VpcRecord>,
    #[serde(default)]
    pub port_channels: Vec<PortChannelRecord>,
    #[serde(default)]
    pub vnids: Vec<VnidRecord>,
    #[serde(default)]
    pub epgs: Vec<EpgRecord>,
    #[serde(default)]
    pub subnets: Vec<SubnetRecord>,
}

impl TopologySnapshot {
    /// Rows of one topology collection as JSON documents
    pub fn rows(&self, coll: Collection) -> Result<Vec<serde_json::Value>, serde_json::Error> {
        fn to_docs<T: Serialize>(rows: &[T]) -> Result<Vec<serde_json::Value>, serde_json::Error> {
            rows.iter().map(serde_json::to_value).collect()
        }
        match coll {
            Collection::Node => to_docs(&self.nodes),
            Collection::Tunnel => to_docs(&self.tunnels),
            Collection::Vpc => to_docs(&self.vpcs),
            Collection::Pc => to_docs(&self.port_channels),
            Collection::Vnid => to_docs(&self.vnids),
            Collection::Epg => to_docs(&self.epgs),
            Collection::Subnet => to_docs(&self.subnets),
            _ => Ok(Vec::new()),
        }
    }

    /// Force every row onto `fabric`
    pub fn set_fabric(&mut self, fabric: &str) {
        self.nodes.iter_mut().for_each(|r| r.fabric = fabric.to_string());
        self.tunnels.iter_mut().for_each(|r| r.fabric = fabric.to_string());
        self.vpcs.iter_mut().for_each(|r| r.fabric = fabric.to_string());
        self.port_channels
            .iter_mut()
            .for_each(|r| r.fabric = fabric.to_string());
        self.vnids.iter_mut().for_each(|r| r.fabric = fabric.to_string());
        self.epgs.iter_mut().for_each(|r| r.fabric = fabric.to_string());
        self.subnets.iter_mut().for_each(|r| r.fabric = fabric.to_string());
    }
}
