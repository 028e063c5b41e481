use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::time::Duration;

use crate::MulticastError;

/// How often idle MFC entries are swept.
pub const MFC_INACTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// An MFC entry idle for longer than this is removed by the sweep.
pub const MFC_INACTIVE_TIMEOUT: Duration = Duration::from_secs(300);
/// Cap on cached MFC entries; inserting past it evicts the oldest entry.
pub const MFC_MAX_NUMBER_OF_ENTRIES: usize = 1_000;
/// Number of kernel virtual multicast interfaces (MAXMIFS).
pub const MAX_MIFS: u16 = 32;

/// Multicast scope field of an IPv6 group address.
pub fn multicast_scope(group: &Ipv6Addr) -> u8 {
    group.octets()[1] & 0x0f
}

/// Forwarding mode for one (inbound, outbound) interface pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MulticastRoutingConfig {
    #[default]
    ForwardNone,
    /// Forward every group whose scope is at least the threshold.
    MinScope(u8),
    /// Forward only the listed groups; they are joined on the inbound interface.
    Selected(BTreeSet<Ipv6Addr>),
}

impl MulticastRoutingConfig {
    pub fn min_scope(scope: u8) -> Result<Self, MulticastError> {
        if scope > 0x0f {
            return Err(MulticastError::InvalidConfig(format!(
                "scope {scope} does not fit the 4-bit scope field"
            )));
        }
        Ok(Self::MinScope(scope))
    }

    pub fn selected(groups: impl IntoIterator<Item = Ipv6Addr>) -> Result<Self, MulticastError> {
        let groups: BTreeSet<Ipv6Addr> = groups.into_iter().collect();
        if let Some(bad) = groups.iter().find(|g| !g.is_multicast()) {
            return Err(MulticastError::InvalidConfig(format!(
                "{bad} is not a multicast address"
            )));
        }
        Ok(Self::Selected(groups))
    }

    pub fn is_forwarding(&self) -> bool {
        !matches!(self, Self::ForwardNone)
    }

    /// Whether traffic for `group` is forwarded under this mode.
    pub fn forwards(&self, group: &Ipv6Addr) -> bool {
        match self {
            Self::ForwardNone => false,
            Self::MinScope(min) => *min <= multicast_scope(group),
            Self::Selected(groups) => groups.contains(group),
        }
    }

    /// Groups that must be joined on the inbound interface.
    pub fn listening_groups(&self) -> impl Iterator<Item = &Ipv6Addr> {
        let groups = match self {
            Self::Selected(groups) => Some(groups),
            _ => None,
        };
        groups.into_iter().flatten()
    }
}

/// Timing and sizing knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub sweep_interval: Duration,
    pub inactive_timeout: Duration,
    pub max_entries: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: MFC_INACTIVE_CHECK_INTERVAL,
            inactive_timeout: MFC_INACTIVE_TIMEOUT,
            max_entries: MFC_MAX_NUMBER_OF_ENTRIES,
        }
    }
}
