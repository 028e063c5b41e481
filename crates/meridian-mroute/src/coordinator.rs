//! # Multicast routing coordinator
//!
//! Owns the forwarding configuration between interface pairs and keeps the
//! kernel's virtual interfaces, group memberships and forwarding cache in
//! line with it.
//!
//! MFC entries are installed lazily: the kernel reports "no cached route"
//! for the first packet of a (source, group) flow and the coordinator
//! answers with an entry whose outbound set is the union of every
//! interface configured to forward that group. Flows nobody forwards get
//! an empty "block" entry so the kernel stops asking. Idle entries are
//! removed by a periodic sweep; the sweep only stays scheduled while the
//! cache is non-empty.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv6Addr;

use quanta::Instant;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, MAX_MIFS, MulticastRoutingConfig};
use crate::kernel::{MfcRoute, MulticastKernel, Mrt6Upcall};
use crate::MulticastError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MfcKey {
    pub source: Ipv6Addr,
    pub group: Ipv6Addr,
    pub iif: u16,
}

#[derive(Debug, Clone)]
pub struct MfcEntry {
    pub oifs: BTreeSet<u16>,
    pub last_used: Instant,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct VirtualInterface {
    mif: u16,
    ifindex: u32,
}

pub struct MulticastRoutingCoordinator<K: MulticastKernel> {
    kernel: K,
    config: CoordinatorConfig,
    /// inbound interface -> outbound interface -> mode. Never holds ForwardNone.
    routes: BTreeMap<String, BTreeMap<String, MulticastRoutingConfig>>,
    vifs: BTreeMap<String, VirtualInterface>,
    mfcs: BTreeMap<MfcKey, MfcEntry>,
    next_seq: u64,
    next_sweep: Option<Instant>,
}

impl<K: MulticastKernel> MulticastRoutingCoordinator<K> {
    pub fn new(kernel: K, config: CoordinatorConfig) -> Self {
        Self {
            kernel,
            config,
            routes: BTreeMap::new(),
            vifs: BTreeMap::new(),
            mfcs: BTreeMap::new(),
            next_seq: 0,
            next_sweep: None,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn config_for(&self, from: &str, to: &str) -> MulticastRoutingConfig {
        self.routes
            .get(from)
            .and_then(|m| m.get(to))
            .cloned()
            .unwrap_or_default()
    }

    pub fn virtual_index(&self, iface: &str) -> Option<u16> {
        self.vifs.get(iface).map(|v| v.mif)
    }

    pub fn mfc_entries(&self) -> impl Iterator<Item = (&MfcKey, &MfcEntry)> {
        self.mfcs.iter()
    }

    pub fn mfc_count(&self) -> usize {
        self.mfcs.len()
    }

    /// When the next idle sweep is due, if one is scheduled.
    pub fn next_sweep_at(&self) -> Option<Instant> {
        self.next_sweep
    }

    /// Sets the forwarding mode from `from` to `to`.
    pub fn apply_config(
        &mut self,
        from: &str,
        to: &str,
        config: MulticastRoutingConfig,
    ) -> Result<(), MulticastError> {
        if self.config_for(from, to) == config {
            return Ok(());
        }
        if config.is_forwarding() {
            let created = self.ensure_vif(from).and_then(|_| self.ensure_vif(to));
            if let Err(e) = created {
                self.release_unreferenced_vifs();
                return Err(e);
            }
        }

        let joined_before = self.listening_groups(from);
        if config.is_forwarding() {
            self.routes
                .entry(from.to_string())
                .or_default()
                .insert(to.to_string(), config.clone());
        } else if let Some(m) = self.routes.get_mut(from) {
            m.remove(to);
            if m.is_empty() {
                self.routes.remove(from);
            }
        }
        info!(from, to, ?config, "multicast forwarding updated");

        let joined_after = self.listening_groups(from);
        self.update_memberships(from, &joined_before, &joined_after);
        self.refresh_mfcs_for(from);
        self.release_unreferenced_vifs();
        Ok(())
    }

    /// Handles a raw upcall; anything other than NOCACHE is ignored.
    pub fn handle_upcall(&mut self, upcall: &Mrt6Upcall, now: Instant) {
        if upcall.is_nocache() {
            self.handle_nocache(upcall.mif, upcall.source, upcall.group, now);
        } else {
            debug!(msg_type = upcall.msg_type, "ignoring multicast upcall");
        }
    }

    /// Installs a cache entry for a flow the kernel has no route for.
    pub fn handle_nocache(&mut self, iif: u16, source: Ipv6Addr, group: Ipv6Addr, now: Instant) {
        if !group.is_multicast() {
            return;
        }
        let Some(from) = self.iface_for_mif(iif) else {
            debug!(iif, "upcall on unknown virtual interface");
            return;
        };
        let key = MfcKey { source, group, iif };
        if let Some(entry) = self.mfcs.get_mut(&key) {
            entry.last_used = now;
            return;
        }

        let oifs = self.compute_oifs(&from, &group);
        if self.mfcs.len() >= self.config.max_entries {
            self.evict_oldest();
        }
        let route = MfcRoute {
            source,
            group,
            iif,
            oifs: oifs.clone(),
        };
        if let Err(e) = self.kernel.add_mfc(&route) {
            warn!("Failed to add MFC for {source} -> {group}: {e}");
            return;
        }
        debug!(%source, %group, iif, ?oifs, "installed MFC");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.mfcs.insert(
            key,
            MfcEntry {
                oifs,
                last_used: now,
                seq,
            },
        );
        if self.next_sweep.is_none() {
            self.next_sweep = Some(now + self.config.sweep_interval);
        }
    }

    /// Runs the idle sweep if it is due. Returns the number of evicted entries.
    pub fn run_sweep_if_due(&mut self, now: Instant) -> usize {
        match self.next_sweep {
            Some(at) if at <= now => self.run_sweep(now),
            _ => 0,
        }
    }

    /// Removes entries idle for longer than the configured timeout.
    pub fn run_sweep(&mut self, now: Instant) -> usize {
        for usage in self.kernel.mfc_usage() {
            let key = MfcKey {
                source: usage.source,
                group: usage.group,
                iif: usage.iif,
            };
            if let (Some(entry), Some(seen)) = (self.mfcs.get_mut(&key), now.checked_sub(usage.idle)) {
                if seen > entry.last_used {
                    entry.last_used = seen;
                }
            }
        }

        let timeout = self.config.inactive_timeout;
        let expired: Vec<MfcKey> = self
            .mfcs
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_used) > timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.delete_mfc(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept idle MFC entries");
        }

        self.next_sweep = if self.mfcs.is_empty() {
            None
        } else {
            Some(now + self.config.sweep_interval)
        };
        expired.len()
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn iface_for_mif(&self, mif: u16) -> Option<String> {
        self.vifs
            .iter()
            .find(|(_, v)| v.mif == mif)
            .map(|(name, _)| name.clone())
    }

    fn ensure_vif(&mut self, iface: &str) -> Result<u16, MulticastError> {
        if let Some(v) = self.vifs.get(iface) {
            return Ok(v.mif);
        }
        let ifindex = self
            .kernel
            .interface_index(iface)
            .ok_or_else(|| MulticastError::UnknownInterface(iface.to_string()))?;
        let used: BTreeSet<u16> = self.vifs.values().map(|v| v.mif).collect();
        let mif = (0..MAX_MIFS)
            .find(|i| !used.contains(i))
            .ok_or(MulticastError::NoFreeVirtualInterface)?;
        self.kernel.add_mif(mif, ifindex)?;
        info!(iface, mif, ifindex, "added multicast virtual interface");
        self.vifs
            .insert(iface.to_string(), VirtualInterface { mif, ifindex });
        Ok(mif)
    }

    fn is_referenced(&self, iface: &str) -> bool {
        self.routes.contains_key(iface) || self.routes.values().any(|m| m.contains_key(iface))
    }

    fn release_unreferenced_vifs(&mut self) {
        let unused: Vec<String> = self
            .vifs
            .keys()
            .filter(|name| !self.is_referenced(name))
            .cloned()
            .collect();
        for name in unused {
            let Some(vif) = self.vifs.remove(&name) else {
                continue;
            };
            let stale: Vec<MfcKey> = self
                .mfcs
                .keys()
                .filter(|k| k.iif == vif.mif)
                .copied()
                .collect();
            for key in &stale {
                self.delete_mfc(key);
            }
            if let Err(e) = self.kernel.del_mif(vif.mif) {
                warn!("Failed to delete MIF {} for {}: {}", vif.mif, name, e);
            }
            info!(iface = %name, mif = vif.mif, "released multicast virtual interface");
        }
        if self.mfcs.is_empty() {
            self.next_sweep = None;
        }
    }

    fn listening_groups(&self, from: &str) -> BTreeSet<Ipv6Addr> {
        self.routes
            .get(from)
            .map(|m| {
                m.values()
                    .flat_map(|c| c.listening_groups().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn update_memberships(
        &mut self,
        from: &str,
        before: &BTreeSet<Ipv6Addr>,
        after: &BTreeSet<Ipv6Addr>,
    ) {
        let Some(ifindex) = self
            .vifs
            .get(from)
            .map(|v| v.ifindex)
            .or_else(|| self.kernel.interface_index(from))
        else {
            return;
        };
        for group in after.difference(before) {
            if let Err(e) = self.kernel.join_group(ifindex, *group) {
                warn!("Failed to join {group} on {from}: {e}");
            }
        }
        for group in before.difference(after) {
            if let Err(e) = self.kernel.leave_group(ifindex, *group) {
                warn!("Failed to leave {group} on {from}: {e}");
            }
        }
    }

    fn compute_oifs(&self, from: &str, group: &Ipv6Addr) -> BTreeSet<u16> {
        let Some(outs) = self.routes.get(from) else {
            return BTreeSet::new();
        };
        outs.iter()
            .filter(|(_, cfg)| cfg.forwards(group))
            .filter_map(|(to, _)| self.vifs.get(to).map(|v| v.mif))
            .collect()
    }

    /// Re-derives the outbound set of every cached entry arriving on `from`.
    fn refresh_mfcs_for(&mut self, from: &str) {
        let Some(iif) = self.vifs.get(from).map(|v| v.mif) else {
            return;
        };
        let keys: Vec<MfcKey> = self
            .mfcs
            .keys()
            .filter(|k| k.iif == iif)
            .copied()
            .collect();
        for key in keys {
            let oifs = self.compute_oifs(from, &key.group);
            let Some(entry) = self.mfcs.get_mut(&key) else {
                continue;
            };
            if entry.oifs == oifs {
                continue;
            }
            if oifs.is_empty() {
                self.delete_mfc(&key);
                continue;
            }
            entry.oifs = oifs.clone();
            let route = MfcRoute {
                source: key.source,
                group: key.group,
                iif,
                oifs,
            };
            if let Err(e) = self.kernel.add_mfc(&route) {
                warn!("Failed to update MFC for {} -> {}: {}", key.source, key.group, e);
            }
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .mfcs
            .iter()
            .min_by_key(|(_, e)| e.seq)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            debug!(source = %key.source, group = %key.group, "MFC cache full, evicting oldest");
            self.delete_mfc(&key);
        }
    }

    fn delete_mfc(&mut self, key: &MfcKey) {
        if self.mfcs.remove(key).is_none() {
            return;
        }
        if let Err(e) = self.kernel.del_mfc(key.source, key.group, key.iif) {
            warn!("Failed to delete MFC for {} -> {}: {}", key.source, key.group, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        AddMif(u16, u32),
        DelMif(u16),
        AddMfc(MfcRoute),
        DelMfc(Ipv6Addr, Ipv6Addr, u16),
        Join(u32, Ipv6Addr),
        Leave(u32, Ipv6Addr),
    }

    #[derive(Default)]
    struct FakeKernel {
        ifaces: HashMap<String, u32>,
        calls: Vec<Call>,
    }

    impl FakeKernel {
        fn with_ifaces(names: &[(&str, u32)]) -> Self {
            Self {
                ifaces: names.iter().map(|(n, i)| (n.to_string(), *i)).collect(),
                calls: Vec::new(),
            }
        }
    }

    impl MulticastKernel for FakeKernel {
        fn interface_index(&self, name: &str) -> Option<u32> {
            self.ifaces.get(name).copied()
        }
        fn add_mif(&mut self, mif: u16, ifindex: u32) -> io::Result<()> {
            self.calls.push(Call::AddMif(mif, ifindex));
            Ok(())
        }
        fn del_mif(&mut self, mif: u16) -> io::Result<()> {
            self.calls.push(Call::DelMif(mif));
            Ok(())
        }
        fn add_mfc(&mut self, route: &MfcRoute) -> io::Result<()> {
            self.calls.push(Call::AddMfc(route.clone()));
            Ok(())
        }
        fn del_mfc(&mut self, s: Ipv6Addr, g: Ipv6Addr, iif: u16) -> io::Result<()> {
            self.calls.push(Call::DelMfc(s, g, iif));
            Ok(())
        }
        fn join_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()> {
            self.calls.push(Call::Join(ifindex, group));
            Ok(())
        }
        fn leave_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()> {
            self.calls.push(Call::Leave(ifindex, group));
            Ok(())
        }
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn coordinator() -> MulticastRoutingCoordinator<FakeKernel> {
        MulticastRoutingCoordinator::new(
            FakeKernel::with_ifaces(&[("eth0", 10), ("wlan0", 20), ("usb0", 30)]),
            CoordinatorConfig::default(),
        )
    }

    #[test]
    fn virtual_indices_are_lowest_free() {
        let mut c = coordinator();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap();
        assert_eq!(c.virtual_index("eth0"), Some(0));
        assert_eq!(c.virtual_index("wlan0"), Some(1));

        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::ForwardNone)
            .unwrap();
        assert_eq!(c.virtual_index("eth0"), None);
        assert!(c.kernel().calls.contains(&Call::DelMif(0)));
        assert!(c.kernel().calls.contains(&Call::DelMif(1)));

        c.apply_config("usb0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap();
        assert_eq!(c.virtual_index("usb0"), Some(0));
    }

    #[test]
    fn unknown_interface_is_rejected_without_leaking_vifs() {
        let mut c = coordinator();
        let err = c
            .apply_config("eth0", "nope0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap_err();
        assert!(matches!(err, MulticastError::UnknownInterface(_)));
        assert_eq!(c.virtual_index("eth0"), None);
    }

    #[test]
    fn nocache_installs_forwarding_or_block_entry() {
        let mut c = coordinator();
        let (clock, _mock) = quanta::Clock::mock();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap();
        let src = addr("2001:db8::1");

        c.handle_nocache(0, src, addr("ff05::1"), clock.now());
        c.handle_nocache(0, src, addr("ff02::1"), clock.now());

        let routes: Vec<_> = c
            .kernel()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::AddMfc(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].oifs, BTreeSet::from([1]));
        assert!(routes[1].oifs.is_empty());
        assert_eq!(c.mfc_count(), 2);
        assert!(c.next_sweep_at().is_some());
    }

    #[test]
    fn selected_mode_joins_and_leaves_groups() {
        let mut c = coordinator();
        let g1 = addr("ff05::1234");
        let g2 = addr("ff0e::99");
        c.apply_config(
            "eth0",
            "wlan0",
            MulticastRoutingConfig::selected([g1, g2]).unwrap(),
        )
        .unwrap();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::selected([g2]).unwrap())
            .unwrap();
        let calls = &c.kernel().calls;
        assert!(calls.contains(&Call::Join(10, g1)));
        assert!(calls.contains(&Call::Join(10, g2)));
        assert!(calls.contains(&Call::Leave(10, g1)));
        assert!(!calls.contains(&Call::Leave(10, g2)));
    }

    #[test]
    fn shared_group_stays_joined_until_last_pair_drops_it() {
        let mut c = coordinator();
        let g = addr("ff05::1234");
        let sel = MulticastRoutingConfig::selected([g]).unwrap();
        c.apply_config("eth0", "wlan0", sel.clone()).unwrap();
        c.apply_config("eth0", "usb0", sel).unwrap();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::ForwardNone)
            .unwrap();
        assert!(!c.kernel().calls.contains(&Call::Leave(10, g)));
        c.apply_config("eth0", "usb0", MulticastRoutingConfig::ForwardNone)
            .unwrap();
        assert!(c.kernel().calls.contains(&Call::Leave(10, g)));
    }

    #[test]
    fn removing_pair_drops_entries_left_without_outputs() {
        let mut c = coordinator();
        let (clock, _mock) = quanta::Clock::mock();
        let min4 = MulticastRoutingConfig::min_scope(4).unwrap();
        c.apply_config("eth0", "wlan0", min4.clone()).unwrap();
        c.apply_config("eth0", "usb0", min4).unwrap();
        let src = addr("2001:db8::1");
        let grp = addr("ff05::1");
        c.handle_nocache(0, src, grp, clock.now());
        assert_eq!(c.mfc_entries().next().unwrap().1.oifs.len(), 2);

        c.apply_config("eth0", "usb0", MulticastRoutingConfig::ForwardNone)
            .unwrap();
        assert_eq!(c.mfc_entries().next().unwrap().1.oifs, BTreeSet::from([1]));

        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::ForwardNone)
            .unwrap();
        assert_eq!(c.mfc_count(), 0);
        assert_eq!(
            c.kernel()
                .calls
                .iter()
                .filter(|call| matches!(call, Call::DelMfc(..)))
                .count(),
            1
        );
        assert_eq!(c.next_sweep_at(), None);
    }

    #[test]
    fn idle_entry_is_swept_once() {
        let mut c = coordinator();
        let (clock, mock) = quanta::Clock::mock();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap();
        c.handle_nocache(0, addr("2001:db8::1"), addr("ff05::1"), clock.now());

        let mut removed = 0;
        for _ in 0..10 {
            mock.increment(Duration::from_secs(60));
            removed += c.run_sweep_if_due(clock.now());
        }
        assert_eq!(removed, 1);
        assert_eq!(c.next_sweep_at(), None);
        assert_eq!(
            c.kernel()
                .calls
                .iter()
                .filter(|call| matches!(call, Call::DelMfc(..)))
                .count(),
            1
        );
    }

    #[test]
    fn repeated_upcall_refreshes_entry() {
        let mut c = coordinator();
        let (clock, mock) = quanta::Clock::mock();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap();
        let (src, grp) = (addr("2001:db8::1"), addr("ff05::1"));
        c.handle_nocache(0, src, grp, clock.now());
        mock.increment(Duration::from_secs(240));
        c.handle_nocache(0, src, grp, clock.now());
        mock.increment(Duration::from_secs(120));
        c.run_sweep(clock.now());
        assert_eq!(c.mfc_count(), 1);
    }

    #[test]
    fn full_cache_evicts_oldest_insert() {
        let mut c = MulticastRoutingCoordinator::new(
            FakeKernel::with_ifaces(&[("eth0", 10), ("wlan0", 20)]),
            CoordinatorConfig {
                max_entries: 2,
                ..CoordinatorConfig::default()
            },
        );
        let (clock, _mock) = quanta::Clock::mock();
        c.apply_config("eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap())
            .unwrap();
        let src = addr("2001:db8::1");
        c.handle_nocache(0, src, addr("ff05::1"), clock.now());
        c.handle_nocache(0, src, addr("ff05::2"), clock.now());
        c.handle_nocache(0, src, addr("ff05::3"), clock.now());
        let groups: Vec<Ipv6Addr> = c.mfc_entries().map(|(k, _)| k.group).collect();
        assert_eq!(groups, vec![addr("ff05::2"), addr("ff05::3")]);
        assert!(c
            .kernel()
            .calls
            .contains(&Call::DelMfc(src, addr("ff05::1"), 0)));
    }

    #[test]
    fn upcall_for_unknown_mif_is_ignored() {
        let mut c = coordinator();
        let (clock, _mock) = quanta::Clock::mock();
        c.handle_nocache(7, addr("2001:db8::1"), addr("ff05::1"), clock.now());
        assert_eq!(c.mfc_count(), 0);
        assert!(c.kernel().calls.is_empty());
    }
}
