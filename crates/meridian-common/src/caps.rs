//! # Network capabilities
//!
//! Transports and capabilities are closed vocabularies stored as bitsets.
//! [`NetworkCapabilities`] serves two roles: the set a network currently
//! has, and the filter a request matches against. The predicates here are
//! pure so the ranker and the rematch pass can call them freely.
//!
//! A handful of capability bits are owned by the arbiter rather than the
//! agent (see [`SYSTEM_MANAGED`]); agents that declare them are rejected.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;

use crate::error::ArbiterError;
use crate::ids::NetId;
use crate::uid::{FIRST_APPLICATION_UID, UidRangeSet};

/// A member of a closed flag vocabulary.
pub trait Flag: Copy + Eq + fmt::Debug + 'static {
    const ALL: &'static [Self];
    fn index(self) -> u32;
}

/// Bitset over a [`Flag`] vocabulary.
pub struct FlagSet<T: Flag> {
    bits: u64,
    _marker: PhantomData<T>,
}

impl<T: Flag> FlagSet<T> {
    pub const fn empty() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    pub fn of(flags: &[T]) -> Self {
        let mut set = Self::empty();
        for f in flags {
            set.insert(*f);
        }
        set
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn insert(&mut self, flag: T) {
        self.bits |= 1 << flag.index();
    }

    pub fn remove(&mut self, flag: T) {
        self.bits &= !(1 << flag.index());
    }

    pub fn set(&mut self, flag: T, on: bool) {
        if on {
            self.insert(flag)
        } else {
            self.remove(flag)
        }
    }

    pub fn contains(&self, flag: T) -> bool {
        self.bits & (1 << flag.index()) != 0
    }

    pub fn contains_all(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    pub fn union(&self, other: Self) -> Self {
        Self::from_bits(self.bits | other.bits)
    }

    pub fn intersection(&self, other: Self) -> Self {
        Self::from_bits(self.bits & other.bits)
    }

    pub fn without(&self, other: Self) -> Self {
        Self::from_bits(self.bits & !other.bits)
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        T::ALL.iter().copied().filter(move |f| self.contains(*f))
    }
}

impl<T: Flag> Clone for FlagSet<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Flag> Copy for FlagSet<T> {}

impl<T: Flag> PartialEq for FlagSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T: Flag> Eq for FlagSet<T> {}

impl<T: Flag> std::hash::Hash for FlagSet<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bits.hash(state)
    }
}

impl<T: Flag> Default for FlagSet<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Flag> fmt::Debug for FlagSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T: Flag> FromIterator<T> for FlagSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::empty();
        for f in iter {
            set.insert(f);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    Cellular,
    Wifi,
    Bluetooth,
    Ethernet,
    Vpn,
    WifiAware,
    Lowpan,
    Test,
    Usb,
    Thread,
    Satellite,
}

impl Flag for Transport {
    const ALL: &'static [Self] = &[
        Transport::Cellular,
        Transport::Wifi,
        Transport::Bluetooth,
        Transport::Ethernet,
        Transport::Vpn,
        Transport::WifiAware,
        Transport::Lowpan,
        Transport::Test,
        Transport::Usb,
        Transport::Thread,
        Transport::Satellite,
    ];

    fn index(self) -> u32 {
        self as u32
    }
}

pub type TransportSet = FlagSet<Transport>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Mms = 0,
    Supl = 1,
    Dun = 2,
    Fota = 3,
    Ims = 4,
    Cbs = 5,
    WifiP2p = 6,
    Ia = 7,
    Rcs = 8,
    Xcap = 9,
    Eims = 10,
    NotMetered = 11,
    Internet = 12,
    NotRestricted = 13,
    Trusted = 14,
    NotVpn = 15,
    Validated = 16,
    CaptivePortal = 17,
    NotRoaming = 18,
    Foreground = 19,
    NotCongested = 20,
    NotSuspended = 21,
    OemPaid = 22,
    Mcx = 23,
    PartialConnectivity = 24,
    TemporarilyNotMetered = 25,
    OemPrivate = 26,
    VehicleInternal = 27,
    NotVcnManaged = 28,
    Enterprise = 29,
    HeadUnit = 32,
    Mmtel = 33,
    PrioritizeLatency = 34,
    PrioritizeBandwidth = 35,
    LocalNetwork = 36,
}

impl Flag for Capability {
    const ALL: &'static [Self] = &[
        Capability::Mms,
        Capability::Supl,
        Capability::Dun,
        Capability::Fota,
        Capability::Ims,
        Capability::Cbs,
        Capability::WifiP2p,
        Capability::Ia,
        Capability::Rcs,
        Capability::Xcap,
        Capability::Eims,
        Capability::NotMetered,
        Capability::Internet,
        Capability::NotRestricted,
        Capability::Trusted,
        Capability::NotVpn,
        Capability::Validated,
        Capability::CaptivePortal,
        Capability::NotRoaming,
        Capability::Foreground,
        Capability::NotCongested,
        Capability::NotSuspended,
        Capability::OemPaid,
        Capability::Mcx,
        Capability::PartialConnectivity,
        Capability::TemporarilyNotMetered,
        Capability::OemPrivate,
        Capability::VehicleInternal,
        Capability::NotVcnManaged,
        Capability::Enterprise,
        Capability::HeadUnit,
        Capability::Mmtel,
        Capability::PrioritizeLatency,
        Capability::PrioritizeBandwidth,
        Capability::LocalNetwork,
    ];

    fn index(self) -> u32 {
        self as u32
    }
}

pub type CapabilitySet = FlagSet<Capability>;

const fn bits(caps: &[Capability]) -> u64 {
    let mut out = 0u64;
    let mut i = 0;
    while i < caps.len() {
        out |= 1 << (caps[i] as u32);
        i += 1;
    }
    out
}

/// Bits computed by the arbiter. Agents may not declare them and requests may
/// not require them (listens may).
pub const SYSTEM_MANAGED: CapabilitySet = CapabilitySet::from_bits(bits(&[
    Capability::Validated,
    Capability::CaptivePortal,
    Capability::Foreground,
    Capability::PartialConnectivity,
]));

/// Bits a connected network may gain or lose over its lifetime. Everything
/// else, along with the transports, is fixed at registration.
pub const MUTABLE: CapabilitySet = CapabilitySet::from_bits(bits(&[
    Capability::NotMetered,
    Capability::Trusted,
    Capability::Validated,
    Capability::CaptivePortal,
    Capability::NotRoaming,
    Capability::Foreground,
    Capability::NotCongested,
    Capability::NotSuspended,
    Capability::PartialConnectivity,
    Capability::TemporarilyNotMetered,
    Capability::NotVcnManaged,
]));

/// Capabilities that only make sense on restricted networks.
pub const RESTRICTED: CapabilitySet = CapabilitySet::from_bits(bits(&[
    Capability::Cbs,
    Capability::Dun,
    Capability::Eims,
    Capability::Fota,
    Capability::Ia,
    Capability::Ims,
    Capability::Mcx,
    Capability::Rcs,
    Capability::VehicleInternal,
    Capability::Xcap,
    Capability::Enterprise,
]));

pub const UNRESTRICTED: CapabilitySet = CapabilitySet::from_bits(bits(&[
    Capability::Internet,
    Capability::Mms,
    Capability::Supl,
    Capability::WifiP2p,
]));

/// Capabilities whose presence always makes a network restricted.
pub const FORCE_RESTRICTED: CapabilitySet = CapabilitySet::from_bits(bits(&[
    Capability::OemPaid,
    Capability::OemPrivate,
]));

pub const MIN_ENTERPRISE_ID: u8 = 1;
pub const MAX_ENTERPRISE_ID: u8 = 5;

/// Enterprise identifier carried by enterprise networks and profile preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnterpriseId(u8);

impl EnterpriseId {
    pub fn new(id: u8) -> Result<Self, ArbiterError> {
        if !(MIN_ENTERPRISE_ID..=MAX_ENTERPRISE_ID).contains(&id) {
            return Err(ArbiterError::invalid(format!("invalid enterprise id {id}")));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Opaque, app-supplied network selector. Redacted for unprivileged listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkSpecifier(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCapabilities {
    transports: TransportSet,
    capabilities: CapabilitySet,
    forbidden: CapabilitySet,
    enterprise_ids: BTreeSet<EnterpriseId>,
    specifier: Option<NetworkSpecifier>,
    /// `None` means "applies to every UID".
    uids: Option<UidRangeSet>,
    allowed_uids: BTreeSet<u32>,
    owner_uid: Option<u32>,
    administrator_uids: Vec<u32>,
    underlying_networks: Option<Vec<NetId>>,
    signal_strength: Option<i32>,
    link_up_kbps: u32,
    link_down_kbps: u32,
}

impl NetworkCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starting point for app requests: unrestricted, trusted, not a VPN.
    pub fn request_default() -> Self {
        Self::new()
            .with_capability(Capability::NotRestricted)
            .with_capability(Capability::Trusted)
            .with_capability(Capability::NotVpn)
    }

    // ── Builders ─────────────────────────────────────────────────────────

    pub fn with_transport(mut self, t: Transport) -> Self {
        self.transports.insert(t);
        self
    }

    pub fn with_capability(mut self, c: Capability) -> Self {
        self.capabilities.insert(c);
        self.forbidden.remove(c);
        self
    }

    pub fn without_capability(mut self, c: Capability) -> Self {
        self.capabilities.remove(c);
        self
    }

    pub fn with_forbidden(mut self, c: Capability) -> Self {
        self.forbidden.insert(c);
        self.capabilities.remove(c);
        self
    }

    pub fn with_enterprise_id(mut self, id: EnterpriseId) -> Self {
        self.enterprise_ids.insert(id);
        self
    }

    pub fn with_specifier(mut self, specifier: impl Into<String>) -> Self {
        self.specifier = Some(NetworkSpecifier(specifier.into()));
        self
    }

    pub fn with_uids(mut self, uids: Option<UidRangeSet>) -> Self {
        self.uids = uids;
        self
    }

    pub fn with_allowed_uids(mut self, uids: impl IntoIterator<Item = u32>) -> Self {
        self.allowed_uids = uids.into_iter().collect();
        self
    }

    pub fn with_owner_uid(mut self, uid: u32) -> Self {
        self.owner_uid = Some(uid);
        self
    }

    pub fn with_administrator_uids(mut self, uids: Vec<u32>) -> Self {
        self.administrator_uids = uids;
        self
    }

    pub fn with_signal_strength(mut self, threshold: i32) -> Self {
        self.signal_strength = Some(threshold);
        self
    }

    pub fn with_bandwidth(mut self, up_kbps: u32, down_kbps: u32) -> Self {
        self.link_up_kbps = up_kbps;
        self.link_down_kbps = down_kbps;
        self
    }

    // ── Accessors and mutators ───────────────────────────────────────────

    pub fn transports(&self) -> TransportSet {
        self.transports
    }

    pub fn set_transports(&mut self, transports: TransportSet) {
        self.transports = transports;
    }

    pub fn has_transport(&self, t: Transport) -> bool {
        self.transports.contains(t)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn forbidden(&self) -> CapabilitySet {
        self.forbidden
    }

    pub fn has_capability(&self, c: Capability) -> bool {
        self.capabilities.contains(c)
    }

    pub fn set_capability(&mut self, c: Capability, on: bool) {
        self.capabilities.set(c, on);
        if on {
            self.forbidden.remove(c);
        }
    }

    pub fn enterprise_ids(&self) -> &BTreeSet<EnterpriseId> {
        &self.enterprise_ids
    }

    pub fn specifier(&self) -> Option<&NetworkSpecifier> {
        self.specifier.as_ref()
    }

    pub fn uids(&self) -> Option<&UidRangeSet> {
        self.uids.as_ref()
    }

    pub fn set_uids(&mut self, uids: Option<UidRangeSet>) {
        self.uids = uids;
    }

    pub fn allowed_uids(&self) -> &BTreeSet<u32> {
        &self.allowed_uids
    }

    pub fn owner_uid(&self) -> Option<u32> {
        self.owner_uid
    }

    pub fn underlying_networks(&self) -> Option<&[NetId]> {
        self.underlying_networks.as_deref()
    }

    pub fn set_underlying_networks(&mut self, nets: Option<Vec<NetId>>) {
        self.underlying_networks = nets;
    }

    pub fn signal_strength(&self) -> Option<i32> {
        self.signal_strength
    }

    pub fn set_signal_strength(&mut self, threshold: Option<i32>) {
        self.signal_strength = threshold;
    }

    pub fn bandwidth_kbps(&self) -> (u32, u32) {
        (self.link_up_kbps, self.link_down_kbps)
    }

    pub fn is_vpn(&self) -> bool {
        self.has_transport(Transport::Vpn)
    }

    pub fn is_metered(&self) -> bool {
        !self.has_capability(Capability::NotMetered)
            && !self.has_capability(Capability::TemporarilyNotMetered)
    }

    pub fn is_restricted(&self) -> bool {
        !self.has_capability(Capability::NotRestricted)
    }

    pub fn is_suspended(&self) -> bool {
        !self.has_capability(Capability::NotSuspended)
    }

    // ── Matching ─────────────────────────────────────────────────────────

    /// Whether a network with capabilities `nc` matches this filter.
    pub fn satisfied_by(&self, nc: &NetworkCapabilities) -> bool {
        self.matches(nc, false)
    }

    /// Like [`satisfied_by`](Self::satisfied_by) but ignoring everything a
    /// network may still change after registration. Used for offers and for
    /// networks that have not connected yet.
    pub fn satisfied_by_immutable(&self, nc: &NetworkCapabilities) -> bool {
        self.matches(nc, true)
    }

    fn matches(&self, nc: &NetworkCapabilities, only_immutable: bool) -> bool {
        let mask = if only_immutable {
            CapabilitySet::from_bits(!MUTABLE.bits())
        } else {
            CapabilitySet::from_bits(u64::MAX)
        };
        if !self.transports.is_empty() && !self.transports.intersects(nc.transports) {
            return false;
        }
        let wanted = self.capabilities.intersection(mask);
        if !nc.capabilities.contains_all(wanted) {
            return false;
        }
        if nc
            .capabilities
            .intersects(self.forbidden.intersection(mask))
        {
            return false;
        }
        if !self.enterprise_ids.is_subset(&nc.enterprise_ids) {
            return false;
        }
        if self.specifier.is_some() && self.specifier != nc.specifier {
            return false;
        }
        if only_immutable {
            return true;
        }
        if let Some(threshold) = self.signal_strength {
            match nc.signal_strength {
                Some(s) if s >= threshold => {}
                _ => return false,
            }
        }
        if nc.link_up_kbps < self.link_up_kbps || nc.link_down_kbps < self.link_down_kbps {
            return false;
        }
        match (&self.uids, &nc.uids) {
            (Some(mine), Some(theirs)) => theirs.covers(mine),
            _ => true,
        }
    }

    /// Whether the access list of a network with these capabilities lets
    /// `uid` use it. System UIDs are never filtered.
    pub fn allows_uid(&self, uid: u32) -> bool {
        self.allowed_uids.is_empty()
            || uid < FIRST_APPLICATION_UID
            || self.allowed_uids.contains(&uid)
    }

    /// Describes the first immutable difference between `self` (the
    /// registered state) and `next`, if any.
    pub fn immutable_change(&self, next: &NetworkCapabilities) -> Option<String> {
        if self.transports != next.transports {
            return Some(format!(
                "transports changed from {:?} to {:?}",
                self.transports, next.transports
            ));
        }
        let fixed = CapabilitySet::from_bits(!MUTABLE.bits());
        let before = self.capabilities.intersection(fixed);
        let after = next.capabilities.intersection(fixed);
        if before != after {
            return Some(format!(
                "immutable capabilities changed: lost {:?}, gained {:?}",
                before.without(after),
                after.without(before)
            ));
        }
        None
    }

    /// Rejects capability sets that claim arbiter-owned bits.
    pub fn check_agent_declared(&self) -> Result<(), ArbiterError> {
        let claimed = self.capabilities.intersection(SYSTEM_MANAGED);
        if !claimed.is_empty() {
            return Err(ArbiterError::invalid(format!(
                "agents may not declare {claimed:?}"
            )));
        }
        if !self.forbidden.is_empty() {
            return Err(ArbiterError::invalid(
                "networks cannot carry forbidden capabilities",
            ));
        }
        Ok(())
    }

    /// Rejects filters that a keep-alive request may not carry.
    pub fn check_requestable(&self) -> Result<(), ArbiterError> {
        let claimed = self.capabilities.intersection(SYSTEM_MANAGED);
        if !claimed.is_empty() {
            return Err(ArbiterError::invalid(format!(
                "cannot request network with {claimed:?}"
            )));
        }
        Ok(())
    }

    /// Access-controlled filters may only match on immutable properties.
    pub fn check_allowed_uids_compatible(&self) -> Result<(), ArbiterError> {
        let state_bits = MUTABLE.without(CapabilitySet::of(&[
            Capability::Trusted,
            Capability::NotVcnManaged,
        ]));
        if !self.allowed_uids.is_empty() && self.capabilities.intersects(state_bits) {
            return Err(ArbiterError::invalid(
                "allowed uids cannot be combined with mutable capabilities",
            ));
        }
        Ok(())
    }

    /// A filter that only names restricted-only capabilities (IMS, FOTA...)
    /// does not also require NOT_RESTRICTED.
    pub fn maybe_mark_restricted(&mut self) {
        let force = self.capabilities.intersects(FORCE_RESTRICTED);
        let has_unrestricted = self.capabilities.intersects(UNRESTRICTED);
        let has_restricted = self.capabilities.intersects(RESTRICTED);
        if force || (has_restricted && !has_unrestricted) {
            self.capabilities.remove(Capability::NotRestricted);
        }
    }

    /// Copy safe to hand to `uid`. Privileged listeners see everything.
    pub fn redacted(&self, uid: u32, privileged: bool) -> NetworkCapabilities {
        if privileged {
            return self.clone();
        }
        let mut out = self.clone();
        let owns = self.owner_uid == Some(uid);
        if !owns {
            out.owner_uid = None;
            out.specifier = None;
        }
        out.administrator_uids.clear();
        out.allowed_uids.clear();
        out
    }

    /// Human-readable summary of what changed, for logs.
    pub fn describe_changes(&self, next: &NetworkCapabilities) -> String {
        let mut parts = Vec::new();
        let gained = next.capabilities.without(self.capabilities);
        let lost = self.capabilities.without(next.capabilities);
        if !gained.is_empty() {
            parts.push(format!("+{gained:?}"));
        }
        if !lost.is_empty() {
            parts.push(format!("-{lost:?}"));
        }
        if self.transports != next.transports {
            parts.push(format!("transports {:?}", next.transports));
        }
        if self.uids != next.uids {
            parts.push("uids".to_string());
        }
        if self.underlying_networks != next.underlying_networks {
            parts.push("underlying".to_string());
        }
        if self.signal_strength != next.signal_strength {
            parts.push(format!("signal {:?}", next.signal_strength));
        }
        if parts.is_empty() {
            "other".to_string()
        } else {
            parts.join(" ")
        }
    }
}
