//! Events delivered to request owners.
//!
//! Every callback kind is one variant of [`NetworkEvent`] and goes through
//! the single [`NetworkListener`] trait. The arbiter queues events while a
//! pass runs and hands them out in order once the pass is complete, so a
//! listener never observes a half-applied state change.

use std::fmt;
use std::sync::Arc;

use meridian_common::{LinkProperties, NetId, NetworkCapabilities, RequestId};

/// Reasons an app's traffic on a network is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockedReasons(u32);

impl BlockedReasons {
    pub const NONE: BlockedReasons = BlockedReasons(0);
    pub const BATTERY_SAVER: BlockedReasons = BlockedReasons(1 << 0);
    pub const DOZE: BlockedReasons = BlockedReasons(1 << 1);
    pub const APP_STANDBY: BlockedReasons = BlockedReasons(1 << 2);
    pub const RESTRICTED_MODE: BlockedReasons = BlockedReasons(1 << 3);
    pub const LOCKDOWN_VPN: BlockedReasons = BlockedReasons(1 << 4);
    pub const LOW_POWER_STANDBY: BlockedReasons = BlockedReasons(1 << 5);
    /// Reasons at or above this bit apply only on metered networks.
    pub const DATA_SAVER: BlockedReasons = BlockedReasons(1 << 16);
    pub const USER_RESTRICTED: BlockedReasons = BlockedReasons(1 << 17);
    pub const ADMIN_DISABLED: BlockedReasons = BlockedReasons(1 << 18);

    const METERED_MASK: u32 = 0xffff_0000;

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn is_blocked(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, other: BlockedReasons) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: BlockedReasons) -> Self {
        Self(self.0 | other.0)
    }

    /// Reasons that actually apply on a network with the given meteredness.
    pub fn effective(self, metered: bool) -> Self {
        if metered {
            self
        } else {
            Self(self.0 & !Self::METERED_MASK)
        }
    }
}

impl std::ops::BitOr for BlockedReasons {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Available,
    /// The network is about to go away unless something re-selects it.
    Losing { max_ms_to_live: u64 },
    Lost,
    /// A timed request expired without ever being satisfied.
    Unavailable,
    CapabilitiesChanged(NetworkCapabilities),
    LinkPropertiesChanged(LinkProperties),
    BlockedStatusChanged(BlockedReasons),
    Suspended,
    Resumed,
}

impl NetworkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::Available => "AVAILABLE",
            NetworkEvent::Losing { .. } => "LOSING",
            NetworkEvent::Lost => "LOST",
            NetworkEvent::Unavailable => "UNAVAILABLE",
            NetworkEvent::CapabilitiesChanged(_) => "CAPS_CHANGED",
            NetworkEvent::LinkPropertiesChanged(_) => "LINK_PROPERTIES_CHANGED",
            NetworkEvent::BlockedStatusChanged(_) => "BLOCKED_STATUS",
            NetworkEvent::Suspended => "SUSPENDED",
            NetworkEvent::Resumed => "RESUMED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub request_id: RequestId,
    /// `None` only for [`NetworkEvent::Unavailable`].
    pub network: Option<NetId>,
    pub event: NetworkEvent,
}

impl fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Some(net) => write!(f, "{} {} {}", self.request_id, self.event.name(), net),
            None => write!(f, "{} {}", self.request_id, self.event.name()),
        }
    }
}

/// Receives events for one registered request.
///
/// Called on the arbiter's worker. Implementations must not call back into
/// the arbiter synchronously.
pub trait NetworkListener: Send + Sync {
    fn on_event(&self, event: CallbackEvent);
}

/// Ordered outbox of events produced by one top-level operation.
#[derive(Default)]
pub(crate) struct PendingCallbacks {
    queue: Vec<(Arc<dyn NetworkListener>, CallbackEvent)>,
}

impl PendingCallbacks {
    pub(crate) fn push(&mut self, listener: &Arc<dyn NetworkListener>, event: CallbackEvent) {
        self.queue.push((Arc::clone(listener), event));
    }

    pub(crate) fn take(&mut self) -> Vec<(Arc<dyn NetworkListener>, CallbackEvent)> {
        std::mem::take(&mut self.queue)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metered_reasons_drop_on_unmetered_networks() {
        let r = BlockedReasons::DATA_SAVER | BlockedReasons::DOZE;
        assert_eq!(r.effective(true), r);
        assert_eq!(r.effective(false), BlockedReasons::DOZE);
        assert!(!BlockedReasons::DATA_SAVER.effective(false).is_blocked());
    }

    #[test]
    fn display_names_event_and_network() {
        let ev = CallbackEvent {
            request_id: RequestId(3),
            network: Some(NetId(101)),
            event: NetworkEvent::Losing { max_ms_to_live: 10 },
        };
        assert_eq!(ev.to_string(), "req3 LOSING net101");
    }
}
