//! Cancellable deadline queue.
//!
//! Timers are keyed by a handle so the owner can cancel precisely. A
//! cancelled entry stays in the heap until it reaches the top and is then
//! discarded. Fired events carry enough state to be re-checked by the
//! handler; a timer firing never proves its reason still holds.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use meridian_common::{NetId, RequestId};
use quanta::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The linger or nascent period of `net` that was armed for `deadline` ran out.
    InactivityExpired { net: NetId, deadline: Instant },
    /// The teardown delay of `net` is over.
    DestroyNetwork { net: NetId },
    RequestTimeout { request: RequestId },
    EvaluationTimeout { net: NetId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, TimerEvent>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, event: TimerEvent) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((at, seq)));
        self.pending.insert(seq, event);
        TimerHandle(seq)
    }

    /// Returns whether the timer was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle.0).is_some()
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pops the earliest timer due at or before `now`. Timers due at the
    /// same instant fire in scheduling order.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, TimerEvent)> {
        self.discard_cancelled();
        let Reverse((at, seq)) = *self.heap.peek()?;
        if at > now {
            return None;
        }
        self.heap.pop();
        self.pending.remove(&seq).map(|ev| (at, ev))
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.pending.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let (clock, mock) = Clock::mock();
        let t0 = clock.now();
        let mut q = TimerQueue::new();
        q.schedule(t0 + Duration::from_millis(20), TimerEvent::DestroyNetwork { net: NetId(101) });
        q.schedule(t0 + Duration::from_millis(10), TimerEvent::DestroyNetwork { net: NetId(102) });
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(10)));
        assert!(q.pop_due(clock.now()).is_none());

        mock.increment(Duration::from_millis(25));
        let now = clock.now();
        let (_, first) = q.pop_due(now).unwrap();
        let (_, second) = q.pop_due(now).unwrap();
        assert_eq!(first, TimerEvent::DestroyNetwork { net: NetId(102) });
        assert_eq!(second, TimerEvent::DestroyNetwork { net: NetId(101) });
        assert!(q.is_empty());
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let (clock, mock) = Clock::mock();
        let mut q = TimerQueue::new();
        let h = q.schedule(
            clock.now() + Duration::from_millis(5),
            TimerEvent::RequestTimeout { request: RequestId(4) },
        );
        assert!(q.is_pending(h));
        assert!(q.cancel(h));
        assert!(!q.cancel(h));
        mock.increment(Duration::from_millis(10));
        assert!(q.pop_due(clock.now()).is_none());
        assert_eq!(q.next_deadline(), None);
    }
}
