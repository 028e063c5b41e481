//! Network arbitration and lifecycle engine.
//!
//! This crate contains:
//! - **Arbiter** — owns networks and requests, runs rematch passes
//! - **Lifecycle** — agent operations, linger/nascent timers, teardown
//! - **Requests** — app-facing registration and permission checks
//! - **Policy** — OEM, per-profile and mobile-data default-network overlays,
//!   lockdown VPN, bad Wi-Fi handling
//! - **VPN** — capability derivation from underlying networks, UID routing rules
//! - **Offers** — on-demand network providers
//! - **Runtime** — the serial worker thread hosting the arbiter

pub mod agent;
pub mod arbiter;
pub mod backend;
mod blocked;
pub mod callback;
pub mod config;
mod lifecycle;
pub mod network;
pub mod offer;
pub mod policy;
pub mod registry;
mod rematch;
pub mod requests;
pub mod runtime;
pub mod timer;
mod uid_rules;
pub mod vpn;

pub use agent::{AgentConfig, NetworkAgent, ValidationResult, ValidationStatus};
pub use arbiter::{Arbiter, HostedMulticast};
pub use backend::{
    AllowlistConfig, Dependencies, NetworkConfigBackend, NetworkCreateConfig, NetworkPermission,
    Permission, PolicyQuery, VpnType,
};
pub use callback::{BlockedReasons, CallbackEvent, NetworkEvent, NetworkListener};
pub use config::{ArbiterConfig, ArbiterConfigInput};
pub use network::{FullScore, NetworkRanker, NetworkState};
pub use offer::{NetworkProvider, OfferId};
pub use policy::{
    Completion, LockdownVpnConfig, OemNetworkPreference, OemNetworkPreferences,
    ProfileNetworkPreference, ProfilePreferenceKind,
};
pub use registry::{NetworkRequestInfo, RequestOrigin, SessionId};
pub use requests::{Caller, RequestOptions};
pub use runtime::{ArbiterRuntime, RuntimeError};
