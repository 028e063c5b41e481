//! # Network ranker
//!
//! Picks the best network for a request among the candidates that satisfy
//! it. Ranking is a sequence of partitions: each step keeps only the
//! candidates with a desirable property, unless none has it, in which case
//! the step is skipped. The first step that leaves one candidate decides.
//!
//! Order of the steps:
//! 1. invincible
//! 2. VPN
//! 3. chosen by the user and accepted while unvalidated
//! 4. does not yield to bad Wi-Fi (only if some candidate is bad Wi-Fi)
//! 5. validated, or accepted while unvalidated
//! 6. not avoided while unvalidated
//! 7. not exiting
//! 8. primary within its transport family
//! 9. highest legacy score
//! 10. not torn down
//!
//! Ties go to the current winner, then to the oldest network.

use meridian_common::{NetId, Transport, TransportSet};

use super::score::{FullScore, Policy};

/// One network as seen by the ranker.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: NetId,
    /// Connection order; lower is older.
    pub serial: u64,
    pub score: FullScore,
    pub transports: TransportSet,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkRanker {
    /// Bad Wi-Fi is any Wi-Fi that was evaluated, not only one that once validated.
    pub actively_prefer_bad_wifi: bool,
}

impl NetworkRanker {
    pub fn new(actively_prefer_bad_wifi: bool) -> Self {
        Self {
            actively_prefer_bad_wifi,
        }
    }

    /// Best candidate, or `None` if there are none. `current` wins ties.
    pub fn best(&self, candidates: &[Candidate], current: Option<NetId>) -> Option<NetId> {
        if candidates.is_empty() {
            return None;
        }
        let mut pool: Vec<&Candidate> = candidates.iter().collect();
        pool.sort_by_key(|c| (Some(c.id) != current, c.serial));

        narrow(&mut pool, |c| c.score.has(Policy::IsInvincible));
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        narrow(&mut pool, |c| c.score.has(Policy::IsVpn));
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        narrow(&mut pool, |c| {
            c.score.has(Policy::EverUserSelected) && c.score.has(Policy::AcceptUnvalidated)
        });
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        if pool.iter().any(|c| self.is_bad_wifi(c)) {
            narrow(&mut pool, |c| !c.score.has(Policy::YieldToBadWifi));
            if pool.len() == 1 {
                return Some(pool[0].id);
            }
        }
        narrow(&mut pool, |c| {
            c.score.has(Policy::IsValidated) || c.score.has(Policy::AcceptUnvalidated)
        });
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        narrow(&mut pool, |c| !c.score.has(Policy::AvoidedWhenUnvalidated));
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        narrow(&mut pool, |c| !c.score.has(Policy::Exiting));
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        self.narrow_primary(&mut pool);
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        let max = pool.iter().map(|c| c.score.legacy_int).max().unwrap_or(i32::MIN);
        pool.retain(|c| c.score.legacy_int == max);
        if pool.len() == 1 {
            return Some(pool[0].id);
        }
        narrow(&mut pool, |c| !c.score.has(Policy::IsDestroyed));
        pool.first().map(|c| c.id)
    }

    /// Whether `contender` would win against `current`. With no current
    /// winner any contender wins.
    pub fn might_beat(&self, current: Option<&Candidate>, contender: &Candidate) -> bool {
        match current {
            None => true,
            Some(cur) if cur.id == contender.id => true,
            Some(cur) => self.best(&[*cur, *contender], Some(cur.id)) == Some(contender.id),
        }
    }

    fn is_bad_wifi(&self, c: &Candidate) -> bool {
        let evaluated = if self.actively_prefer_bad_wifi {
            c.score.has(Policy::EverEvaluated)
        } else {
            c.score.has(Policy::EverValidated)
        };
        c.transports.contains(Transport::Wifi)
            && evaluated
            && !c.score.has(Policy::IsValidated)
            && !c.score.has(Policy::AvoidedWhenUnvalidated)
    }

    /// Within each transport family, a primary network hides the others.
    fn narrow_primary(&self, pool: &mut Vec<&Candidate>) {
        let primaries: Vec<TransportSet> = pool
            .iter()
            .filter(|c| c.score.has(Policy::TransportPrimary))
            .map(|c| c.transports)
            .collect();
        if primaries.is_empty() {
            return;
        }
        pool.retain(|c| {
            c.score.has(Policy::TransportPrimary)
                || !primaries.iter().any(|t| *t == c.transports)
        });
    }
}

fn narrow(pool: &mut Vec<&Candidate>, keep: impl Fn(&Candidate) -> bool) {
    if pool.iter().any(|c| keep(c)) {
        pool.retain(|c| keep(c));
    }
}
