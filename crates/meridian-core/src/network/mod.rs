//! Network records, scoring and ranking.

pub mod ranker;
pub mod record;
pub mod score;

pub use ranker::{Candidate, NetworkRanker};
pub use record::{Attachment, NetworkRecord, NetworkState};
pub use score::{FullScore, Policy, ScoreFacts};
