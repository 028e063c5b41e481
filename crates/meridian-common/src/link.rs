//! Link-layer configuration reported by agents: interface, addresses,
//! routes and DNS servers.

use std::net::IpAddr;

/// Address with prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl LinkAddress {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteInfo {
    pub destination: LinkAddress,
    pub gateway: Option<IpAddr>,
    pub interface: Option<String>,
    pub mtu: u32,
}

impl RouteInfo {
    /// Routes are keyed by destination and interface; two routes with the same
    /// key and different gateway or MTU are an update, not an add/remove pair.
    pub fn key(&self) -> (LinkAddress, Option<&str>) {
        (self.destination, self.interface.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkProperties {
    pub interface_name: Option<String>,
    pub addresses: Vec<LinkAddress>,
    pub routes: Vec<RouteInfo>,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u32,
    /// Stacked links such as a CLAT interface on top of an IPv6-only network.
    pub stacked: Vec<LinkProperties>,
}

/// Route delta between two link property snapshots.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub added: Vec<RouteInfo>,
    pub removed: Vec<RouteInfo>,
    pub updated: Vec<RouteInfo>,
}

impl LinkProperties {
    pub fn with_interface(name: impl Into<String>) -> Self {
        Self {
            interface_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Every interface name, including stacked links.
    pub fn all_interfaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self.interface_name.iter().cloned().collect();
        for s in &self.stacked {
            out.extend(s.all_interfaces());
        }
        out
    }

    pub fn all_routes(&self) -> Vec<RouteInfo> {
        let mut out = self.routes.clone();
        for s in &self.stacked {
            out.extend(s.all_routes());
        }
        out
    }

    pub fn diff_routes(&self, next: &LinkProperties) -> RouteDiff {
        let before = self.all_routes();
        let after = next.all_routes();
        let mut diff = RouteDiff::default();
        for r in &after {
            match before.iter().find(|b| b.key() == r.key()) {
                None => diff.added.push(r.clone()),
                Some(b) if b != r => diff.updated.push(r.clone()),
                Some(_) => {}
            }
        }
        for b in &before {
            if !after.iter().any(|r| r.key() == b.key()) {
                diff.removed.push(b.clone());
            }
        }
        diff
    }
}
