//! Always-on lockdown VPN: every UID except the VPN app and an allow-list
//! is barred from sending traffic outside a secure VPN.

use std::collections::BTreeSet;

use meridian_common::{UidRangeSet, UserId};
use tracing::{info, warn};

use crate::arbiter::Arbiter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockdownVpnConfig {
    pub vpn_uid: u32,
    pub allowlisted_uids: BTreeSet<u32>,
}

/// Ranges the reject rule covers: all users minus the exempt UIDs.
pub(crate) fn lockdown_ranges(users: &[UserId], config: &LockdownVpnConfig) -> UidRangeSet {
    let exempt = UidRangeSet::from_uids(
        std::iter::once(config.vpn_uid).chain(config.allowlisted_uids.iter().copied()),
    );
    UidRangeSet::for_users(users.iter().copied()).difference(&exempt)
}

impl Arbiter {
    /// Enables (`Some`) or disables (`None`) lockdown.
    pub fn set_lockdown_vpn(&mut self, config: Option<LockdownVpnConfig>) {
        info!(enabled = config.is_some(), "lockdown vpn updated");
        self.policies.lockdown = config;
        self.apply_lockdown();
        self.flush();
    }

    /// Brings the installed reject rule in line with the configuration.
    /// New ranges are rejected before old ones are released.
    pub(crate) fn apply_lockdown(&mut self) {
        let desired = match &self.policies.lockdown {
            Some(cfg) => lockdown_ranges(&self.deps.policy.users(), cfg),
            None => UidRangeSet::new(),
        };
        let installed = &self.policies.lockdown_installed;
        let added = desired.difference(installed);
        let removed = installed.difference(&desired);
        if !added.is_empty() {
            if let Err(e) = self.deps.backend.set_reject_non_secure_vpn(true, &added) {
                warn!(error = %e, ranges = %added, "failed to install lockdown rule");
            }
        }
        if !removed.is_empty() {
            if let Err(e) = self.deps.backend.set_reject_non_secure_vpn(false, &removed) {
                warn!(error = %e, ranges = %removed, "failed to remove lockdown rule");
            }
        }
        self.policies.lockdown_installed = desired;
        self.refresh_blocked_status();
    }
}
