//! IPv6 multicast routing coordinator.
//!
//! Keeps kernel multicast state (virtual interfaces, group memberships and
//! forwarding cache entries) consistent with per-interface-pair forwarding
//! modes. The kernel itself sits behind [`MulticastKernel`].

pub mod config;
pub mod coordinator;
pub mod kernel;

use thiserror::Error;

pub use config::{CoordinatorConfig, MulticastRoutingConfig, multicast_scope};
pub use coordinator::{MfcEntry, MfcKey, MulticastRoutingCoordinator};
pub use kernel::{MfcRoute, MfcUsage, Mrt6Upcall, MulticastKernel};

#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("no free multicast virtual interface")]
    NoFreeVirtualInterface,
    #[error("unknown interface {0}")]
    UnknownInterface(String),
    #[error("invalid multicast routing config: {0}")]
    InvalidConfig(String),
    #[error("kernel multicast call failed: {0}")]
    Kernel(#[from] std::io::Error),
}
