//! Per-UID routing rules installed in the configuration backend.
//!
//! The table mirrors what the backend holds, keyed by (network, priority).
//! Reconciling against a desired table issues only the exact range
//! differences: every addition first, then every removal, so a UID that
//! moves between networks is never left without a rule.

use std::collections::{BTreeMap, BTreeSet};

use meridian_common::{NetId, UidRangeSet};
use tracing::{debug, warn};

use crate::arbiter::Arbiter;
use crate::backend::NetworkConfigBackend;
use crate::policy::PREFERENCE_ORDER_VPN;
use crate::registry::RequestOrigin;

pub(crate) type RuleKey = (NetId, u32);

/// Range changes produced by one reconcile.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RuleDiff {
    pub added: Vec<(RuleKey, UidRangeSet)>,
    pub removed: Vec<(RuleKey, UidRangeSet)>,
}

#[derive(Debug, Default)]
pub(crate) struct UidRuleTable {
    installed: BTreeMap<RuleKey, UidRangeSet>,
}

impl UidRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RuleKey) -> Option<&UidRangeSet> {
        self.installed.get(key)
    }

    /// Computes the difference to `desired`, records `desired` as installed
    /// and returns what must be pushed.
    pub fn reconcile(&mut self, desired: BTreeMap<RuleKey, UidRangeSet>) -> RuleDiff {
        let mut diff = RuleDiff::default();
        let empty = UidRangeSet::new();
        let keys: BTreeSet<RuleKey> = self
            .installed
            .keys()
            .chain(desired.keys())
            .copied()
            .collect();
        for key in keys {
            let before = self.installed.get(&key).unwrap_or(&empty);
            let after = desired.get(&key).unwrap_or(&empty);
            let added = after.difference(before);
            let removed = before.difference(after);
            if !added.is_empty() {
                diff.added.push((key, added));
            }
            if !removed.is_empty() {
                diff.removed.push((key, removed));
            }
        }
        self.installed = desired
            .into_iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .collect();
        diff
    }

    /// Pushes `diff` to the backend, additions before removals.
    pub fn apply(diff: &RuleDiff, backend: &dyn NetworkConfigBackend) {
        for ((net, priority), ranges) in &diff.added {
            debug!(net = %net, priority, ranges = %ranges, "adding uid ranges");
            if let Err(e) = backend.network_add_uid_ranges(*net, ranges, *priority) {
                warn!(net = %net, error = %e, "failed to add uid ranges");
            }
        }
        for ((net, priority), ranges) in &diff.removed {
            debug!(net = %net, priority, ranges = %ranges, "removing uid ranges");
            if let Err(e) = backend.network_remove_uid_ranges(*net, ranges, *priority) {
                warn!(net = %net, error = %e, "failed to remove uid ranges");
            }
        }
    }
}

impl Arbiter {
    /// Rules the current state calls for: policy requests route their UIDs
    /// to their satisfier (or the unreachable network), VPNs to themselves.
    fn desired_uid_rules(&self) -> BTreeMap<RuleKey, UidRangeSet> {
        let mut desired: BTreeMap<RuleKey, UidRangeSet> = BTreeMap::new();
        for nri in self.registry.iter() {
            if !matches!(nri.origin, RequestOrigin::Policy(_)) {
                continue;
            }
            let Some(uids) = &nri.uids else {
                continue;
            };
            let net = nri.satisfier.unwrap_or(NetId::UNREACHABLE);
            let entry = desired.entry((net, nri.preference_order)).or_default();
            *entry = entry.union(uids);
        }
        for rec in self.networks.values() {
            if !rec.is_connected() || !rec.is_vpn() {
                continue;
            }
            if let Some(uids) = rec.caps.uids() {
                let entry = desired.entry((rec.id, PREFERENCE_ORDER_VPN)).or_default();
                *entry = entry.union(uids);
            }
        }
        desired
    }

    /// Brings backend UID rules in line with the current state. Sockets of
    /// UIDs leaving a VPN that stays up are destroyed once, after removal.
    pub(crate) fn sync_uid_rules(&mut self) {
        let desired = self.desired_uid_rules();
        let diff = self.uid_rules.reconcile(desired);
        if diff.added.is_empty() && diff.removed.is_empty() {
            return;
        }
        UidRuleTable::apply(&diff, self.deps.backend.as_ref());
        for ((net, priority), ranges) in &diff.removed {
            if *priority != PREFERENCE_ORDER_VPN {
                continue;
            }
            let Some(rec) = self.networks.get(net) else {
                continue;
            };
            if !rec.is_connected() {
                continue;
            }
            let exempt: BTreeSet<u32> = rec.caps.owner_uid().into_iter().collect();
            if let Err(e) = self.deps.backend.destroy_live_tcp_sockets(ranges, &exempt) {
                warn!(net = %net, error = %e, "failed to destroy sockets");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::UidRange;

    fn set(lo: u32, hi: u32) -> UidRangeSet {
        UidRangeSet::from(UidRange::new(lo, hi).unwrap())
    }

    #[test]
    fn reconcile_issues_exact_differences() {
        let mut table = UidRuleTable::new();
        let net = NetId(100);
        let first: BTreeMap<RuleKey, UidRangeSet> = [((net, 20), set(10_000, 10_099))].into();
        let diff = table.reconcile(first);
        assert_eq!(diff.added, vec![((net, 20), set(10_000, 10_099))]);
        assert!(diff.removed.is_empty());

        let second: BTreeMap<RuleKey, UidRangeSet> = [((net, 20), set(10_000, 10_049))].into();
        let diff = table.reconcile(second.clone());
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec![((net, 20), set(10_050, 10_099))]);

        assert_eq!(table.reconcile(second), RuleDiff::default());
    }

    #[test]
    fn moving_a_range_between_networks_adds_then_removes() {
        let mut table = UidRuleTable::new();
        let uids = set(10_000, 10_010);
        table.reconcile([((NetId(100), 30), uids.clone())].into());
        let diff = table.reconcile([((NetId(101), 30), uids.clone())].into());
        assert_eq!(diff.added, vec![((NetId(101), 30), uids.clone())]);
        assert_eq!(diff.removed, vec![((NetId(100), 30), uids)]);
        assert!(table.get(&(NetId(100), 30)).is_none());
    }
}
