use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

struct Inner {
    active: HashMap<SocketAddr, Instant>,
    high_pending: VecDeque<SocketAddr>,
    normal_pending: VecDeque<SocketAddr>,
}

/// Bounds simultaneous outbound connection attempts (spec.md §4.D). Two
/// priority lanes feed the same slot budget; a single nearest-deadline timer
/// (driven by `next_deadline`/`reap_timeouts` from the session loop) replaces
/// one timer per attempt. Callers fire their own callbacks from the addresses
/// these methods return, outside of any lock held here.
pub struct HalfOpenQueue {
    limit: usize,
    inner: Mutex<Inner>,
}

impl HalfOpenQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                high_pending: VecDeque::new(),
                normal_pending: VecDeque::new(),
            }),
        }
    }

    /// Admits `addr` immediately if a slot is free; otherwise queues it in
    /// `priority`'s lane for `complete` to admit later.
    pub fn start_or_enqueue(&self, addr: SocketAddr, priority: Priority, timeout: Duration, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("half-open queue poisoned");
        if inner.active.len() < self.limit {
            inner.active.insert(addr, now + timeout);
            true
        } else {
            match priority {
                Priority::High => inner.high_pending.push_back(addr),
                Priority::Normal => inner.normal_pending.push_back(addr),
            }
            false
        }
    }

    /// Admits `addr` immediately if a slot is free, otherwise refuses it
    /// outright with no side effect. Unlike `start_or_enqueue`, a refused
    /// address is not remembered here; callers that keep their own retry
    /// list (e.g. a torrent's pending-address pool) should use this instead,
    /// so a slot freed by some unrelated `complete()` doesn't silently admit
    /// an address nothing is waiting to dial.
    pub fn try_reserve(&self, addr: SocketAddr, timeout: Duration, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("half-open queue poisoned");
        if inner.active.len() < self.limit {
            inner.active.insert(addr, now + timeout);
            true
        } else {
            false
        }
    }

    /// Marks `addr`'s attempt finished (connected, refused, or timed out) and
    /// admits the next queued address, high-priority lane first, if any slot
    /// frees up. Returns the newly admitted address so the caller can start it.
    pub fn complete(&self, addr: SocketAddr, timeout: Duration, now: Instant) -> Option<SocketAddr> {
        let mut inner = self.inner.lock().expect("half-open queue poisoned");
        inner.active.remove(&addr);

        let next = inner.high_pending.pop_front().or_else(|| inner.normal_pending.pop_front())?;
        inner.active.insert(next, now + timeout);
        Some(next)
    }

    /// Earliest deadline among active attempts; the session loop arms a
    /// single timer against this instead of one per attempt.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("half-open queue poisoned");
        inner.active.values().min().copied()
    }

    /// Removes every attempt past its deadline and returns their addresses so
    /// the caller can fire timeout callbacks without holding the lock.
    pub fn reap_timeouts(&self, now: Instant) -> Vec<SocketAddr> {
        let mut inner = self.inner.lock().expect("half-open queue poisoned");
        let expired: Vec<SocketAddr> =
            inner.active.iter().filter(|(_, &deadline)| deadline <= now).map(|(&addr, _)| addr).collect();
        for addr in &expired {
            inner.active.remove(addr);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("half-open queue poisoned").active.len()
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().expect("half-open queue poisoned");
        inner.high_pending.len() + inner.normal_pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn test_start_admits_under_limit() {
        let q = HalfOpenQueue::new(2);
        let now = Instant::now();
        assert!(q.start_or_enqueue(addr(1), Priority::Normal, Duration::from_secs(5), now));
        assert!(q.start_or_enqueue(addr(2), Priority::Normal, Duration::from_secs(5), now));
        assert!(!q.start_or_enqueue(addr(3), Priority::Normal, Duration::from_secs(5), now));
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn test_high_priority_lane_admitted_before_normal() {
        let q = HalfOpenQueue::new(1);
        let now = Instant::now();
        assert!(q.start_or_enqueue(addr(1), Priority::Normal, Duration::from_secs(5), now));
        assert!(!q.start_or_enqueue(addr(2), Priority::Normal, Duration::from_secs(5), now));
        assert!(!q.start_or_enqueue(addr(3), Priority::High, Duration::from_secs(5), now));

        let next = q.complete(addr(1), Duration::from_secs(5), now);
        assert_eq!(next, Some(addr(3)));
    }

    #[test]
    fn test_try_reserve_refuses_without_enqueueing() {
        let q = HalfOpenQueue::new(1);
        let now = Instant::now();
        assert!(q.try_reserve(addr(1), Duration::from_secs(5), now));
        assert!(!q.try_reserve(addr(2), Duration::from_secs(5), now));
        assert_eq!(q.pending_count(), 0);

        let next = q.complete(addr(1), Duration::from_secs(5), now);
        assert_eq!(next, None);
    }

    #[test]
    fn test_reap_timeouts_clears_expired_only() {
        let q = HalfOpenQueue::new(2);
        let now = Instant::now();
        q.start_or_enqueue(addr(1), Priority::Normal, Duration::from_millis(1), now);
        q.start_or_enqueue(addr(2), Priority::Normal, Duration::from_secs(60), now);

        let expired = q.reap_timeouts(now + Duration::from_millis(5));
        assert_eq!(expired, vec![addr(1)]);
        assert_eq!(q.active_count(), 1);
    }
}
