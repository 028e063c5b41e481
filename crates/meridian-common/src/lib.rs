//! Shared types for the Meridian network arbiter.
//!
//! This crate contains:
//! - **Capabilities** — transport and capability bitsets, request filters
//! - **UID ranges** — normalized range sets with exact difference
//! - **Requests** — request kinds and registration-time validation
//! - **Scores** — agent-declared ranking inputs
//! - **Link properties** — interfaces, routes, route diffs
//! - **IDs and errors** — network/request ids and the error taxonomy

pub mod caps;
pub mod error;
pub mod ids;
pub mod link;
pub mod request;
pub mod score;
pub mod uid;

pub use caps::{Capability, CapabilitySet, EnterpriseId, NetworkCapabilities, Transport, TransportSet};
pub use error::ArbiterError;
pub use ids::{NetId, RequestId};
pub use link::LinkProperties;
pub use request::{LegacyType, NetworkRequest, RequestType};
pub use score::{KeepConnectedReason, NetworkScore};
pub use uid::{UidRange, UidRangeSet, UserId};
