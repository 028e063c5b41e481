//! OEM network preference: per-package routing onto OEM-paid or
//! OEM-private networks.

use std::collections::BTreeMap;

use meridian_common::{ArbiterError, Capability, NetworkCapabilities, RequestType, UidRangeSet};

use super::{Completion, PolicyKind, PolicyRequestSpec, internet_caps};
use crate::arbiter::Arbiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OemNetworkPreference {
    Uninitialized,
    /// Unmetered if available, else OEM-paid, else the system default.
    OemPaid,
    /// Unmetered if available, else OEM-paid, else nothing.
    OemPaidNoFallback,
    OemPaidOnly,
    OemPrivateOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OemNetworkPreferences {
    pub packages: BTreeMap<String, OemNetworkPreference>,
}

impl OemNetworkPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(mut self, package: impl Into<String>, pref: OemNetworkPreference) -> Self {
        self.packages.insert(package.into(), pref);
        self
    }
}

fn oem_paid_caps() -> NetworkCapabilities {
    internet_caps().with_capability(Capability::OemPaid)
}

fn oem_private_caps() -> NetworkCapabilities {
    internet_caps().with_capability(Capability::OemPrivate)
}

/// Layers, highest priority first.
pub(crate) fn oem_layers(pref: OemNetworkPreference) -> Vec<(RequestType, NetworkCapabilities)> {
    let unmetered = (
        RequestType::Listen,
        internet_caps().with_capability(Capability::NotMetered),
    );
    match pref {
        OemNetworkPreference::Uninitialized => Vec::new(),
        OemNetworkPreference::OemPaid => vec![
            unmetered,
            (RequestType::Request, oem_paid_caps()),
            (RequestType::TrackDefault, internet_caps()),
        ],
        OemNetworkPreference::OemPaidNoFallback => {
            vec![unmetered, (RequestType::Request, oem_paid_caps())]
        }
        OemNetworkPreference::OemPaidOnly => vec![(RequestType::Request, oem_paid_caps())],
        OemNetworkPreference::OemPrivateOnly => {
            vec![(RequestType::Request, oem_private_caps())]
        }
    }
}

impl Arbiter {
    /// Installs the OEM preference, replacing the previous one.
    pub fn set_oem_network_preference(
        &mut self,
        prefs: OemNetworkPreferences,
        on_complete: Option<Completion>,
    ) -> Result<(), ArbiterError> {
        if prefs.packages.keys().any(|p| p.trim().is_empty()) {
            return Err(ArbiterError::invalid("empty package name in oem preference"));
        }
        self.policies.oem = prefs;
        self.apply_oem_preference();
        self.flush();
        if let Some(done) = on_complete {
            done();
        }
        Ok(())
    }

    /// Re-resolves package UIDs and reinstalls the OEM requests.
    pub(crate) fn apply_oem_preference(&mut self) {
        let mut by_pref: BTreeMap<OemNetworkPreference, UidRangeSet> = BTreeMap::new();
        for (package, pref) in &self.policies.oem.packages {
            if *pref == OemNetworkPreference::Uninitialized {
                continue;
            }
            let uids = self.deps.policy.uids_for_package(package);
            let set = by_pref.entry(*pref).or_default();
            *set = set.union(&UidRangeSet::from_uids(uids));
        }
        let specs = by_pref
            .into_iter()
            .map(|(pref, uids)| PolicyRequestSpec {
                kind: PolicyKind::Oem,
                layers: oem_layers(pref),
                uids,
            })
            .collect();
        self.replace_policy_requests(PolicyKind::Oem, specs);
    }
}
