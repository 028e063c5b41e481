//! Identifiers for networks and requests.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a network, as programmed into the configuration backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(pub u32);

impl NetId {
    /// Reserved network with unreachable routes. UIDs whose per-app default
    /// has no satisfier are routed here instead of the system default.
    pub const UNREACHABLE: NetId = NetId(52);
    pub const MIN: u32 = 100;
    pub const MAX: u32 = 65_535;
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net{}", self.0)
    }
}

/// Identifier of a registered request, or of one layer of a multi-layer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Key of the nascent inactivity timer, which belongs to no request.
    pub const NONE: RequestId = RequestId(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Hands out network ids in `[NetId::MIN, NetId::MAX]`, wrapping around and
/// skipping ids still in use.
#[derive(Debug)]
pub struct NetIdAllocator {
    next: u32,
    in_use: BTreeSet<u32>,
}

impl Default for NetIdAllocator {
    fn default() -> Self {
        Self {
            next: NetId::MIN,
            in_use: BTreeSet::new(),
        }
    }
}

impl NetIdAllocator {
    pub fn allocate(&mut self) -> Option<NetId> {
        let span = NetId::MAX - NetId::MIN + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if self.next >= NetId::MAX {
                NetId::MIN
            } else {
                self.next + 1
            };
            if self.in_use.insert(candidate) {
                return Some(NetId(candidate));
            }
        }
        None
    }

    pub fn release(&mut self, id: NetId) {
        self.in_use.remove(&id.0);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

/// Monotonic request id source. Never yields [`RequestId::NONE`].
#[derive(Debug)]
pub struct RequestIdAllocator {
    next: u32,
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl RequestIdAllocator {
    pub fn allocate(&mut self) -> RequestId {
        let id = RequestId(self.next);
        self.next = self.next.checked_add(1).unwrap_or(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_ids_are_not_reused_while_held() {
        let mut alloc = NetIdAllocator::default();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, NetId(NetId::MIN));
        alloc.release(a);
        // The cursor keeps moving forward; a released id comes back only after wrap.
        let c = alloc.allocate().unwrap();
        assert_eq!(c, NetId(NetId::MIN + 2));
        assert_eq!(alloc.in_use(), 2);
    }

    #[test]
    fn net_id_allocation_wraps_and_skips_used() {
        let mut alloc = NetIdAllocator {
            next: NetId::MAX,
            in_use: BTreeSet::new(),
        };
        alloc.in_use.insert(NetId::MIN);
        assert_eq!(alloc.allocate(), Some(NetId(NetId::MAX)));
        assert_eq!(alloc.allocate(), Some(NetId(NetId::MIN + 1)));
    }

    #[test]
    fn request_ids_skip_none() {
        let mut alloc = RequestIdAllocator::default();
        assert_eq!(alloc.allocate(), RequestId(1));
        assert_eq!(alloc.allocate(), RequestId(2));
        assert_ne!(alloc.allocate(), RequestId::NONE);
    }
}
