//! # Default-network policy overlays
//!
//! Each overlay turns a configuration into extra multi-layer requests that
//! go through the normal ranking pass. The requests carry the UID set whose
//! default network they decide and a preference order; lower orders win
//! when two overlays cover the same UID.
//!
//! Lockdown VPN and bad Wi-Fi handling are not requests: lockdown installs
//! a backend rule, bad Wi-Fi changes how the ranker compares networks.

pub mod bad_wifi;
pub mod lockdown;
pub mod mobile_data;
pub mod oem;
pub mod profile;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use meridian_common::{
    ArbiterError, Capability, NetworkCapabilities, NetworkRequest, RequestId, RequestType,
    UidRangeSet, UserId,
};
use tracing::info;

use crate::arbiter::Arbiter;
use crate::callback::BlockedReasons;
use crate::registry::{NetworkRequestInfo, RequestOrigin};

pub use bad_wifi::BadWifiPolicy;
pub use lockdown::LockdownVpnConfig;
pub use oem::{OemNetworkPreference, OemNetworkPreferences};
pub use profile::{ProfileNetworkPreference, ProfilePreferenceKind};

pub const PREFERENCE_ORDER_VPN: u32 = 0;
pub const PREFERENCE_ORDER_OEM: u32 = 10;
pub const PREFERENCE_ORDER_PROFILE: u32 = 20;
pub const PREFERENCE_ORDER_MOBILE_DATA_PREFERRED: u32 = 30;
pub const PREFERENCE_ORDER_DEFAULT: u32 = 1000;

/// Called once a policy change has been fully applied.
pub type Completion = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Oem,
    Profile,
    MobileData,
}

impl PolicyKind {
    pub fn preference_order(self) -> u32 {
        match self {
            PolicyKind::Oem => PREFERENCE_ORDER_OEM,
            PolicyKind::Profile => PREFERENCE_ORDER_PROFILE,
            PolicyKind::MobileData => PREFERENCE_ORDER_MOBILE_DATA_PREFERRED,
        }
    }
}

/// Installed policy configuration.
#[derive(Default)]
pub(crate) struct PolicyState {
    pub oem: OemNetworkPreferences,
    pub profile: BTreeMap<UserId, Vec<profile::ResolvedProfilePreference>>,
    pub mobile_data_uids: BTreeSet<u32>,
    pub lockdown: Option<LockdownVpnConfig>,
    /// Ranges the lockdown rule is currently installed for.
    pub lockdown_installed: UidRangeSet,
    pub uid_blocked: HashMap<u32, BlockedReasons>,
}

/// Filter for "a network with internet that apps may use".
pub(crate) fn internet_caps() -> NetworkCapabilities {
    NetworkCapabilities::request_default().with_capability(Capability::Internet)
}

/// One policy request to install: its layers, covered UIDs and order.
pub(crate) struct PolicyRequestSpec {
    pub kind: PolicyKind,
    pub layers: Vec<(RequestType, NetworkCapabilities)>,
    pub uids: UidRangeSet,
}

impl Arbiter {
    /// Replaces every request of `kind` with `specs`, then lets the rest of
    /// the system catch up: app default callbacks, ranking, routing rules.
    pub(crate) fn replace_policy_requests(&mut self, kind: PolicyKind, specs: Vec<PolicyRequestSpec>) {
        let stale: Vec<RequestId> = self
            .registry
            .iter()
            .filter(|n| n.origin == RequestOrigin::Policy(kind))
            .map(|n| n.id)
            .collect();
        for id in stale {
            self.remove_request_internal(id);
        }
        let count = specs.len();
        for spec in specs {
            if spec.uids.is_empty() {
                continue;
            }
            let layers: Vec<NetworkRequest> = spec
                .layers
                .into_iter()
                .map(|(k, mut caps)| {
                    if k != RequestType::Listen {
                        caps.maybe_mark_restricted();
                    }
                    NetworkRequest::new(
                        self.registry.next_id(),
                        k,
                        caps,
                        meridian_common::uid::SYSTEM_UID,
                    )
                })
                .collect();
            let Some(id) = layers.first().map(|l| l.id) else {
                continue;
            };
            let mut nri = NetworkRequestInfo::new(
                id,
                layers,
                meridian_common::uid::SYSTEM_UID,
                RequestOrigin::Policy(spec.kind),
            );
            nri.uids = Some(spec.uids);
            nri.preference_order = spec.kind.preference_order();
            // Internal requests are not counted, so this cannot fail.
            let _ = self.registry.register(nri);
        }
        info!(?kind, requests = count, "default network policy replaced");
        self.rebuild_default_trackers();
        self.rematch_all();
        self.update_network_allowlist();
    }

    /// Request whose layers decide the default network of `uid`, if any
    /// policy covers it.
    pub(crate) fn policy_request_for_uid(&self, uid: u32) -> Option<&NetworkRequestInfo> {
        self.registry
            .iter()
            .filter(|n| matches!(n.origin, RequestOrigin::Policy(_)))
            .filter(|n| n.uids.as_ref().is_some_and(|u| u.contains_uid(uid)))
            .min_by_key(|n| (n.preference_order, n.id))
    }

    /// Default-tracking layers for an app: a copy of whatever decides its
    /// default network, scoped to the app and allowed to match VPNs.
    pub(crate) fn default_layers_for_uid(&mut self, uid: u32) -> Vec<NetworkRequest> {
        let source: Vec<NetworkCapabilities> = match self.policy_request_for_uid(uid) {
            Some(nri) => nri.layers.iter().map(|l| l.capabilities.clone()).collect(),
            None => self
                .registry
                .get(self.default_request)
                .map(|n| n.layers.iter().map(|l| l.capabilities.clone()).collect())
                .unwrap_or_else(|| vec![internet_caps()]),
        };
        source
            .into_iter()
            .map(|caps| {
                let mut caps = caps.without_capability(Capability::NotVpn);
                caps.set_uids(Some(UidRangeSet::from_uids([uid])));
                NetworkRequest::new(self.registry.next_id(), RequestType::TrackDefault, caps, uid)
            })
            .collect()
    }

    /// Re-derives the layers of every app default callback after a policy
    /// change. Callbacks whose filters did not change keep their layers.
    pub(crate) fn rebuild_default_trackers(&mut self) {
        let trackers: Vec<(RequestId, u32)> = self
            .registry
            .iter()
            .filter(|n| n.tracks_default)
            .map(|n| (n.id, n.uid))
            .collect();
        for (id, uid) in trackers {
            let fresh = self.default_layers_for_uid(uid);
            let Some(nri) = self.registry.get(id) else {
                continue;
            };
            let same = nri.layers.len() == fresh.len()
                && nri
                    .layers
                    .iter()
                    .zip(&fresh)
                    .all(|(a, b)| a.capabilities == b.capabilities);
            if same {
                continue;
            }
            // The rematch pass moves the attachment from the old layer.
            if let Some(nri) = self.registry.get_mut(id) {
                nri.layers = fresh;
            }
        }
    }
}

/// Rejects preference sets whose UID coverage overlaps.
pub(crate) fn check_disjoint<'a>(
    sets: impl IntoIterator<Item = &'a UidRangeSet>,
) -> Result<(), ArbiterError> {
    let mut seen = UidRangeSet::new();
    for set in sets {
        if seen.overlaps(set) {
            return Err(ArbiterError::invalid(format!(
                "overlapping uid ranges in preferences: {set}"
            )));
        }
        seen = seen.union(set);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::UidRange;

    #[test]
    fn preference_orders() {
        assert!(PolicyKind::Oem.preference_order() < PolicyKind::Profile.preference_order());
        assert!(
            PolicyKind::Profile.preference_order() < PolicyKind::MobileData.preference_order()
        );
        assert!(PREFERENCE_ORDER_VPN < PREFERENCE_ORDER_OEM);
        assert!(PREFERENCE_ORDER_MOBILE_DATA_PREFERRED < PREFERENCE_ORDER_DEFAULT);
    }

    #[test]
    fn disjoint_check() {
        let a = UidRangeSet::from_uids([10_001, 10_002]);
        let b = UidRangeSet::from(UidRange::new(10_002, 10_010).unwrap());
        let c = UidRangeSet::from_uids([10_020]);
        assert!(check_disjoint([&a, &c]).is_ok());
        assert!(check_disjoint([&a, &b]).is_err());
    }
}
