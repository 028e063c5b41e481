//! Multicast kernel double. Clones share state, so a test can keep one
//! handle while the coordinator owns another.

use std::collections::BTreeMap;
use std::io;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};

use meridian_mroute::kernel::MRT6MSG_NOCACHE;
use meridian_mroute::{MfcRoute, MfcUsage, MulticastKernel};

use crate::test_util::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCall {
    AddMif { mif: u16, ifindex: u32 },
    DelMif(u16),
    AddMfc(MfcRoute),
    DelMfc { source: Ipv6Addr, group: Ipv6Addr, iif: u16 },
    JoinGroup { ifindex: u32, group: Ipv6Addr },
    LeaveGroup { ifindex: u32, group: Ipv6Addr },
}

#[derive(Default)]
struct KernelState {
    interfaces: BTreeMap<String, u32>,
    calls: Vec<KernelCall>,
    usage: Vec<MfcUsage>,
    fail_add_mif: bool,
}

#[derive(Clone, Default)]
pub struct RecordingKernel {
    state: Arc<Mutex<KernelState>>,
}

impl RecordingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interface(self, name: &str, ifindex: u32) -> Self {
        lock(&self.state).interfaces.insert(name.to_string(), ifindex);
        self
    }

    pub fn remove_interface(&self, name: &str) {
        lock(&self.state).interfaces.remove(name);
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&KernelCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| pred(c)).count()
    }

    /// Usage the next sweep will see.
    pub fn set_usage(&self, usage: Vec<MfcUsage>) {
        lock(&self.state).usage = usage;
    }

    pub fn set_fail_add_mif(&self, fail: bool) {
        lock(&self.state).fail_add_mif = fail;
    }

    fn push(&self, call: KernelCall) {
        lock(&self.state).calls.push(call);
    }
}

impl MulticastKernel for RecordingKernel {
    fn interface_index(&self, name: &str) -> Option<u32> {
        lock(&self.state).interfaces.get(name).copied()
    }

    fn add_mif(&mut self, mif: u16, ifindex: u32) -> io::Result<()> {
        if lock(&self.state).fail_add_mif {
            return Err(io::Error::other("MRT6_ADD_MIF failed"));
        }
        self.push(KernelCall::AddMif { mif, ifindex });
        Ok(())
    }

    fn del_mif(&mut self, mif: u16) -> io::Result<()> {
        self.push(KernelCall::DelMif(mif));
        Ok(())
    }

    fn add_mfc(&mut self, route: &MfcRoute) -> io::Result<()> {
        self.push(KernelCall::AddMfc(route.clone()));
        Ok(())
    }

    fn del_mfc(&mut self, source: Ipv6Addr, group: Ipv6Addr, iif: u16) -> io::Result<()> {
        self.push(KernelCall::DelMfc { source, group, iif });
        Ok(())
    }

    fn join_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()> {
        self.push(KernelCall::JoinGroup { ifindex, group });
        Ok(())
    }

    fn leave_group(&mut self, ifindex: u32, group: Ipv6Addr) -> io::Result<()> {
        self.push(KernelCall::LeaveGroup { ifindex, group });
        Ok(())
    }

    fn mfc_usage(&mut self) -> Vec<MfcUsage> {
        lock(&self.state).usage.clone()
    }
}

/// Raw `mrt6msg` bytes as the kernel would deliver them.
pub fn nocache_upcall(mif: u16, source: Ipv6Addr, group: Ipv6Addr) -> [u8; 40] {
    let mut buf = [0u8; 40];
    buf[1] = MRT6MSG_NOCACHE;
    buf[2..4].copy_from_slice(&mif.to_ne_bytes());
    buf[8..24].copy_from_slice(&source.octets());
    buf[24..40].copy_from_slice(&group.octets());
    buf
}
