//! Kernel side of multicast routing: virtual interfaces (MIFs), forwarding
//! cache entries (MFCs), group membership and upcalls.

use std::collections::BTreeSet;
use std::io;
use std::net::Ipv6Addr;
use std::time::Duration;

/// `mrt6msg` type for "no cached route".
pub const MRT6MSG_NOCACHE: u8 = 1;
pub const MRT6MSG_WRONGMIF: u8 = 2;
pub const MRT6MSG_WHOLEPKT: u8 = 3;

const MRT6MSG_LEN: usize = 40;

/// A forwarding cache entry as programmed into the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfcRoute {
    pub source: Ipv6Addr,
    pub group: Ipv6Addr,
    pub iif: u16,
    /// Empty means "drop": the entry exists only to stop repeated upcalls.
    pub oifs: BTreeSet<u16>,
}

/// Per-entry usage reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfcUsage {
    pub source: Ipv6Addr,
    pub group: Ipv6Addr,
    pub iif: u16,
    /// Time since the kernel last forwarded a packet through the entry.
    pub idle: Duration,
}

/// Decoded kernel upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mrt6Upcall {
    pub msg_type: u8,
    pub mif: u16,
    pub source: Ipv6Addr,
    pub group: Ipv6Addr,
}

impl Mrt6Upcall {
    /// Decodes an `mrt6msg` as read from the multicast routing socket.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < MRT6MSG_LEN || buf[0] != 0 {
            return None;
        }
        let msg_type = buf[1];
        let mif = u16::from_ne_bytes([buf[2], buf[3]]);
        let mut src = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&buf[24..40]);
        Some(Self {
            msg_type,
            mif,
            source: Ipv6Addr::from(src),
            group: Ipv6Addr::from(dst),
        })
    }

    pub fn is_nocache(&self) -> bool {
        self.msg_type == MRT6MSG_NOCACHE
    }
}

/// Operations the coordinator needs from the kernel.
pub trait MulticastKernel {
    /// Physical index of `name`, if the interface exists.
    fn interface_index(&self, name: &str) -> Option<u32>;
    fn add_mif(&mut self, mif: u16, ifindex: u32) -> io::Result<()>;
    fn del_mif(&mut self, mif: u16) -> io::Result<()>;
    /// Adds or replaces the entry for (source, group, iif).
    fn add_mfc(&mut self, route: &MfcRoute) -> io::Result<()>;
    fn del_mfc(&mut self, source: Ipv6Addr, group: Ipv6Addr, iif: u16) -> io::Result<()>;
    fn join_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()>;
    fn leave_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()>;
    /// Usage counters for cached entries. Kernels without counters report none.
    fn mfc_usage(&mut self) -> Vec<MfcUsage> {
        Vec::new()
    }
}

impl<K: MulticastKernel + ?Sized> MulticastKernel for Box<K> {
    fn interface_index(&self, name: &str) -> Option<u32> {
        (**self).interface_index(name)
    }
    fn add_mif(&mut self, mif: u16, ifindex: u32) -> io::Result<()> {
        (**self).add_mif(mif, ifindex)
    }
    fn del_mif(&mut self, mif: u16) -> io::Result<()> {
        (**self).del_mif(mif)
    }
    fn add_mfc(&mut self, route: &MfcRoute) -> io::Result<()> {
        (**self).add_mfc(route)
    }
    fn del_mfc(&mut self, source: Ipv6Addr, group: Ipv6Addr, iif: u16) -> io::Result<()> {
        (**self).del_mfc(source, group, iif)
    }
    fn join_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()> {
        (**self).join_group(ifindex, group)
    }
    fn leave_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()> {
        (**self).leave_group(ifindex, group)
    }
    fn mfc_usage(&mut self) -> Vec<MfcUsage> {
        (**self).mfc_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nocache_upcall() {
        let mut buf = [0u8; 40];
        buf[1] = MRT6MSG_NOCACHE;
        buf[2..4].copy_from_slice(&3u16.to_ne_bytes());
        let src: Ipv6Addr = "2001:db8::5".parse().unwrap();
        let grp: Ipv6Addr = "ff05::1234".parse().unwrap();
        buf[8..24].copy_from_slice(&src.octets());
        buf[24..40].copy_from_slice(&grp.octets());

        let up = Mrt6Upcall::parse(&buf).unwrap();
        assert!(up.is_nocache());
        assert_eq!(up.mif, 3);
        assert_eq!(up.source, src);
        assert_eq!(up.group, grp);
    }

    #[test]
    fn parse_rejects_short_or_nonzero_mbz() {
        assert!(Mrt6Upcall::parse(&[0u8; 39]).is_none());
        let mut buf = [0u8; 40];
        buf[0] = 1;
        assert!(Mrt6Upcall::parse(&buf).is_none());
    }
}
