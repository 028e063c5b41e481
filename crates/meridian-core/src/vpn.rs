//! Capabilities of a VPN derived from the networks it runs over.

use meridian_common::{ArbiterError, Capability, NetId, NetworkCapabilities, Transport};
use tracing::debug;

use crate::arbiter::Arbiter;

/// Effective capabilities of a VPN declaring `declared` over `underlying`.
///
/// With no underlying network the VPN is assumed metered, not suspended,
/// not roaming and not congested. Otherwise it is unmetered, not roaming
/// and not congested only if every underlying network is, and suspended
/// only if every underlying network is.
pub fn derive_vpn_capabilities(
    declared: &NetworkCapabilities,
    underlying: &[&NetworkCapabilities],
) -> NetworkCapabilities {
    let mut caps = declared.clone();
    let mut transports = declared.transports();
    transports.insert(Transport::Vpn);

    let (metered, suspended, roaming, congested) = if underlying.is_empty() {
        (true, false, false, false)
    } else {
        let mut metered = false;
        let mut suspended = true;
        let mut roaming = false;
        let mut congested = false;
        for nc in underlying {
            transports = transports.union(nc.transports());
            metered |= !nc.has_capability(Capability::NotMetered);
            suspended &= !nc.has_capability(Capability::NotSuspended);
            roaming |= !nc.has_capability(Capability::NotRoaming);
            congested |= !nc.has_capability(Capability::NotCongested);
        }
        (metered, suspended, roaming, congested)
    };

    caps.set_transports(transports);
    caps.set_capability(Capability::NotMetered, !metered);
    caps.set_capability(Capability::NotSuspended, !suspended);
    caps.set_capability(Capability::NotRoaming, !roaming);
    caps.set_capability(Capability::NotCongested, !congested);
    caps
}

impl Arbiter {
    /// Underlying networks `vpn` currently runs over: the declared list, or
    /// the system default when none was declared. Unknown and disconnected
    /// networks are skipped.
    pub(crate) fn resolve_underlying(&self, declared: Option<&[NetId]>) -> Vec<NetId> {
        let ids: Vec<NetId> = match declared {
            Some(list) => list.to_vec(),
            None => self.system_default.into_iter().collect(),
        };
        ids.into_iter()
            .filter(|id| {
                self.networks
                    .get(id)
                    .is_some_and(|n| n.is_connected() && !n.is_vpn())
            })
            .collect()
    }

    /// Declared capabilities of `net`, with VPN derivation applied.
    pub(crate) fn compose_declared(&self, net: NetId) -> Option<NetworkCapabilities> {
        let rec = self.networks.get(&net)?;
        if !rec.is_vpn() {
            return Some(rec.declared_caps.clone());
        }
        let ids = self.resolve_underlying(rec.declared_underlying.as_deref());
        let under: Vec<&NetworkCapabilities> = ids
            .iter()
            .filter_map(|id| self.networks.get(id).map(|n| &n.caps))
            .collect();
        let mut caps = derive_vpn_capabilities(&rec.declared_caps, &under);
        caps.set_underlying_networks(Some(ids));
        Some(caps)
    }

    /// Sets the networks a VPN runs over. `None` follows the system default.
    pub fn set_underlying_networks(
        &mut self,
        net: NetId,
        underlying: Option<Vec<NetId>>,
    ) -> Result<(), ArbiterError> {
        let rec = self
            .networks
            .get_mut(&net)
            .ok_or(ArbiterError::UnknownNetwork(net))?;
        if !rec.is_vpn() {
            return Err(ArbiterError::invalid(format!(
                "{net} is not a vpn; only vpns have underlying networks"
            )));
        }
        debug!(net = %net, ?underlying, "underlying networks declared");
        rec.declared_underlying = underlying;
        let prev = self.full_score(net);
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    /// Re-derives every VPN that runs over `changed`. VPNs following the
    /// system default are refreshed when `changed` is `None`.
    pub(crate) fn propagate_to_vpns(&mut self, changed: Option<NetId>) {
        let vpns: Vec<NetId> = self
            .networks
            .values()
            .filter(|n| n.is_vpn() && n.state != crate::network::NetworkState::TearingDown)
            .filter(|n| match (changed, &n.declared_underlying) {
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(id), None) => self.system_default == Some(id),
                (Some(id), Some(list)) => list.contains(&id),
            })
            .map(|n| n.id)
            .collect();
        for vpn in vpns {
            let prev = self.full_score(vpn);
            self.refresh_network(vpn, prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn() -> NetworkCapabilities {
        NetworkCapabilities::new()
            .with_transport(Transport::Vpn)
            .with_capability(Capability::Internet)
            .with_capability(Capability::NotMetered)
    }

    fn net(t: Transport, unmetered: bool) -> NetworkCapabilities {
        let mut nc = NetworkCapabilities::new()
            .with_transport(t)
            .with_capability(Capability::Internet)
            .with_capability(Capability::NotSuspended)
            .with_capability(Capability::NotRoaming)
            .with_capability(Capability::NotCongested);
        nc.set_capability(Capability::NotMetered, unmetered);
        nc
    }

    #[test]
    fn no_underlying_is_metered_and_not_suspended() {
        let caps = derive_vpn_capabilities(&vpn(), &[]);
        assert!(caps.is_metered());
        assert!(!caps.is_suspended());
        assert!(caps.has_capability(Capability::NotRoaming));
        assert_eq!(caps.transports().len(), 1);
    }

    #[test]
    fn unmetered_only_if_all_underlying_are() {
        let wifi = net(Transport::Wifi, true);
        let cell = net(Transport::Cellular, false);
        let one = derive_vpn_capabilities(&vpn(), &[&wifi]);
        assert!(!one.is_metered());
        assert!(one.has_transport(Transport::Wifi));

        let both = derive_vpn_capabilities(&vpn(), &[&wifi, &cell]);
        assert!(both.is_metered());
        assert!(both.has_transport(Transport::Cellular));
        assert!(both.has_transport(Transport::Vpn));
    }

    #[test]
    fn suspended_only_if_every_underlying_is() {
        let up = net(Transport::Wifi, true);
        let down = net(Transport::Cellular, true).without_capability(Capability::NotSuspended);
        assert!(!derive_vpn_capabilities(&vpn(), &[&up, &down]).is_suspended());
        assert!(derive_vpn_capabilities(&vpn(), &[&down]).is_suspended());
    }
}
