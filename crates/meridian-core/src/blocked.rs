//! Per-UID blocked status as seen by each request on each network.

use meridian_common::{NetId, RequestId};
use tracing::debug;

use crate::arbiter::Arbiter;
use crate::callback::{BlockedReasons, NetworkEvent};

impl Arbiter {
    /// Replaces the blocked reasons policy reports for `uid`.
    pub fn set_uid_blocked_reasons(&mut self, uid: u32, reasons: BlockedReasons) {
        debug!(uid, reasons = reasons.bits(), "uid blocked reasons updated");
        if reasons.is_blocked() {
            self.policies.uid_blocked.insert(uid, reasons);
        } else {
            self.policies.uid_blocked.remove(&uid);
        }
        self.refresh_blocked_status();
        self.flush();
    }

    /// Effective reasons for traffic of `uid` over `net`.
    pub(crate) fn blocked_reasons(&self, uid: u32, net: NetId) -> BlockedReasons {
        let Some(rec) = self.networks.get(&net) else {
            return BlockedReasons::NONE;
        };
        let mut reasons = self
            .policies
            .uid_blocked
            .get(&uid)
            .copied()
            .unwrap_or(BlockedReasons::NONE);
        if !rec.is_vpn() && self.policies.lockdown_installed.contains_uid(uid) {
            reasons = reasons | BlockedReasons::LOCKDOWN_VPN;
        }
        reasons.effective(rec.caps.is_metered())
    }

    /// Records the status `request` saw on `net` and returns it.
    pub(crate) fn record_blocked(&mut self, request: RequestId, net: NetId) -> BlockedReasons {
        let uid = match self.registry.get(request) {
            Some(nri) => nri.uid,
            None => return BlockedReasons::NONE,
        };
        let reasons = self.blocked_reasons(uid, net);
        if let Some(nri) = self.registry.get_mut(request) {
            nri.blocked.insert(net, reasons);
        }
        reasons
    }

    /// Sends `BlockedStatusChanged` wherever the effective value moved.
    pub(crate) fn refresh_blocked_status(&mut self) {
        let nets: Vec<NetId> = self
            .networks
            .values()
            .filter(|n| n.is_connected())
            .map(|n| n.id)
            .collect();
        for net in nets {
            self.refresh_blocked_on(net);
        }
    }

    pub(crate) fn refresh_blocked_on(&mut self, net: NetId) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        for owner in rec.attached_owners() {
            let Some(nri) = self.registry.get(owner) else {
                continue;
            };
            let before = nri.blocked.get(&net).copied();
            let now = self.blocked_reasons(nri.uid, net);
            if before == Some(now) {
                continue;
            }
            self.record_blocked(owner, net);
            if before.is_some() {
                self.notify(owner, Some(net), NetworkEvent::BlockedStatusChanged(now));
            }
        }
    }
}
