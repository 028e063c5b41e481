//! Configuration backend that records every call in order.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use meridian_common::link::RouteInfo;
use meridian_common::{NetId, UidRangeSet};
use meridian_core::{AllowlistConfig, NetworkConfigBackend, NetworkCreateConfig, NetworkPermission};

use crate::test_util::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    NetworkCreate(NetworkCreateConfig),
    NetworkDestroy(NetId),
    SetPermission(NetId, NetworkPermission),
    AddInterface(NetId, String),
    RemoveInterface(NetId, String),
    AddRoute(NetId, RouteInfo),
    RemoveRoute(NetId, RouteInfo),
    UpdateRoute(NetId, RouteInfo),
    AddUidRanges {
        net: NetId,
        ranges: UidRangeSet,
        priority: u32,
    },
    RemoveUidRanges {
        net: NetId,
        ranges: UidRangeSet,
        priority: u32,
    },
    SetDefault(Option<NetId>),
    SetAllowlist(Vec<AllowlistConfig>),
    RejectNonSecureVpn {
        add: bool,
        ranges: UidRangeSet,
    },
    DestroySockets {
        ranges: UidRangeSet,
        exempt: BTreeSet<u32>,
    },
}

impl BackendCall {
    /// Network the call targets, if it targets one.
    pub fn net(&self) -> Option<NetId> {
        match self {
            BackendCall::NetworkCreate(c) => Some(c.net_id),
            BackendCall::NetworkDestroy(n)
            | BackendCall::SetPermission(n, _)
            | BackendCall::AddInterface(n, _)
            | BackendCall::RemoveInterface(n, _)
            | BackendCall::AddRoute(n, _)
            | BackendCall::RemoveRoute(n, _)
            | BackendCall::UpdateRoute(n, _) => Some(*n),
            BackendCall::AddUidRanges { net, .. } | BackendCall::RemoveUidRanges { net, .. } => {
                Some(*net)
            }
            _ => None,
        }
    }
}

/// Records calls and optionally fails network creation.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    fail_create: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: BackendCall) {
        lock(&self.calls).push(call);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Returns and forgets everything recorded so far.
    pub fn take(&self) -> Vec<BackendCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    /// Makes subsequent `network_create` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Relaxed);
    }

    pub fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&BackendCall) -> bool) -> Option<usize> {
        lock(&self.calls).iter().position(pred)
    }

    pub fn last_allowlist(&self) -> Option<Vec<AllowlistConfig>> {
        lock(&self.calls).iter().rev().find_map(|c| match c {
            BackendCall::SetAllowlist(configs) => Some(configs.clone()),
            _ => None,
        })
    }

    pub fn last_default(&self) -> Option<Option<NetId>> {
        lock(&self.calls).iter().rev().find_map(|c| match c {
            BackendCall::SetDefault(net) => Some(*net),
            _ => None,
        })
    }
}

impl NetworkConfigBackend for RecordingBackend {
    fn network_create(&self, config: &NetworkCreateConfig) -> anyhow::Result<()> {
        if self.fail_create.load(Ordering::Relaxed) {
            anyhow::bail!("network_create({}) rejected", config.net_id);
        }
        self.record(BackendCall::NetworkCreate(config.clone()));
        Ok(())
    }

    fn network_destroy(&self, net: NetId) -> anyhow::Result<()> {
        self.record(BackendCall::NetworkDestroy(net));
        Ok(())
    }

    fn network_set_permission(&self, net: NetId, permission: NetworkPermission) -> anyhow::Result<()> {
        self.record(BackendCall::SetPermission(net, permission));
        Ok(())
    }

    fn network_add_interface(&self, net: NetId, iface: &str) -> anyhow::Result<()> {
        self.record(BackendCall::AddInterface(net, iface.to_string()));
        Ok(())
    }

    fn network_remove_interface(&self, net: NetId, iface: &str) -> anyhow::Result<()> {
        self.record(BackendCall::RemoveInterface(net, iface.to_string()));
        Ok(())
    }

    fn network_add_route(&self, net: NetId, route: &RouteInfo) -> anyhow::Result<()> {
        self.record(BackendCall::AddRoute(net, route.clone()));
        Ok(())
    }

    fn network_remove_route(&self, net: NetId, route: &RouteInfo) -> anyhow::Result<()> {
        self.record(BackendCall::RemoveRoute(net, route.clone()));
        Ok(())
    }

    fn network_update_route(&self, net: NetId, route: &RouteInfo) -> anyhow::Result<()> {
        self.record(BackendCall::UpdateRoute(net, route.clone()));
        Ok(())
    }

    fn network_add_uid_ranges(
        &self,
        net: NetId,
        ranges: &UidRangeSet,
        priority: u32,
    ) -> anyhow::Result<()> {
        self.record(BackendCall::AddUidRanges {
            net,
            ranges: ranges.clone(),
            priority,
        });
        Ok(())
    }

    fn network_remove_uid_ranges(
        &self,
        net: NetId,
        ranges: &UidRangeSet,
        priority: u32,
    ) -> anyhow::Result<()> {
        self.record(BackendCall::RemoveUidRanges {
            net,
            ranges: ranges.clone(),
            priority,
        });
        Ok(())
    }

    fn set_default_network(&self, net: Option<NetId>) -> anyhow::Result<()> {
        self.record(BackendCall::SetDefault(net));
        Ok(())
    }

    fn set_network_allowlist(&self, configs: &[AllowlistConfig]) -> anyhow::Result<()> {
        self.record(BackendCall::SetAllowlist(configs.to_vec()));
        Ok(())
    }

    fn set_reject_non_secure_vpn(&self, add: bool, ranges: &UidRangeSet) -> anyhow::Result<()> {
        self.record(BackendCall::RejectNonSecureVpn {
            add,
            ranges: ranges.clone(),
        });
        Ok(())
    }

    fn destroy_live_tcp_sockets(
        &self,
        ranges: &UidRangeSet,
        exempt_uids: &BTreeSet<u32>,
    ) -> anyhow::Result<()> {
        self.record(BackendCall::DestroySockets {
            ranges: ranges.clone(),
            exempt: exempt_uids.clone(),
        });
        Ok(())
    }
}
