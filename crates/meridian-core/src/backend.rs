//! Collaborators the arbiter drives: the network configuration backend
//! (routing tables, UID rules, sockets) and the policy source (permissions,
//! packages, users).

use std::collections::BTreeSet;
use std::sync::Arc;

use meridian_common::link::RouteInfo;
use meridian_common::{NetId, NetworkCapabilities, UidRangeSet, UserId};

/// Who may use a network at the routing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkPermission {
    None,
    /// Only apps holding the network permission (background networks).
    Network,
    /// Only system components (restricted networks).
    System,
}

impl NetworkPermission {
    pub fn for_capabilities(caps: &NetworkCapabilities) -> Self {
        use meridian_common::Capability;
        if caps.is_restricted() {
            NetworkPermission::System
        } else if !caps.has_capability(Capability::Foreground) {
            NetworkPermission::Network
        } else {
            NetworkPermission::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnType {
    Service,
    Platform,
    Legacy,
    Oem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCreateConfig {
    pub net_id: NetId,
    pub permission: NetworkPermission,
    /// VPN only: apps cannot bypass it.
    pub secure: bool,
    pub vpn_type: Option<VpnType>,
}

/// Per-network UID allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistConfig {
    pub net_id: NetId,
    pub uids: UidRangeSet,
}

/// Programs the kernel/OS routing state. Called synchronously from the
/// worker; failures are logged and do not abort the pass.
pub trait NetworkConfigBackend: Send + Sync {
    fn network_create(&self, config: &NetworkCreateConfig) -> anyhow::Result<()>;
    fn network_destroy(&self, net: NetId) -> anyhow::Result<()>;
    fn network_set_permission(&self, net: NetId, permission: NetworkPermission)
    -> anyhow::Result<()>;
    fn network_add_interface(&self, net: NetId, iface: &str) -> anyhow::Result<()>;
    fn network_remove_interface(&self, net: NetId, iface: &str) -> anyhow::Result<()>;
    fn network_add_route(&self, net: NetId, route: &RouteInfo) -> anyhow::Result<()>;
    fn network_remove_route(&self, net: NetId, route: &RouteInfo) -> anyhow::Result<()>;
    fn network_update_route(&self, net: NetId, route: &RouteInfo) -> anyhow::Result<()>;
    fn network_add_uid_ranges(
        &self,
        net: NetId,
        ranges: &UidRangeSet,
        priority: u32,
    ) -> anyhow::Result<()>;
    fn network_remove_uid_ranges(
        &self,
        net: NetId,
        ranges: &UidRangeSet,
        priority: u32,
    ) -> anyhow::Result<()>;
    fn set_default_network(&self, net: Option<NetId>) -> anyhow::Result<()>;
    fn set_network_allowlist(&self, configs: &[AllowlistConfig]) -> anyhow::Result<()>;
    /// Installs (`add`) or removes the lockdown rule rejecting traffic that
    /// does not go through a secure VPN.
    fn set_reject_non_secure_vpn(&self, add: bool, ranges: &UidRangeSet) -> anyhow::Result<()>;
    fn destroy_live_tcp_sockets(
        &self,
        ranges: &UidRangeSet,
        exempt_uids: &BTreeSet<u32>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Full visibility and control over networking.
    NetworkSettings,
    /// Use of restricted networks (IMS, OEM-paid...).
    UseRestrictedNetworks,
    /// Wake-ups on signal strength thresholds.
    SignalStrengthWakeup,
}

/// Synchronous policy lookups.
pub trait PolicyQuery: Send + Sync {
    fn has_permission(&self, uid: u32, permission: Permission) -> bool;
    fn uids_for_package(&self, package: &str) -> Vec<u32>;
    fn users(&self) -> Vec<UserId>;
}

/// Everything the arbiter talks to.
#[derive(Clone)]
pub struct Dependencies {
    pub backend: Arc<dyn NetworkConfigBackend>,
    pub policy: Arc<dyn PolicyQuery>,
}
