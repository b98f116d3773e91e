use std::sync::Weak;
use std::time::Duration;

pub mod channel;

pub use channel::{BandwidthChannel, ChannelLimit};

/// Indices into the session-wide `BandwidthManager`'s channel list. Every
/// peer send request is submitted against the relevant one of these; a
/// per-torrent channel would additionally be spanned alongside it so a grant
/// is bounded by whichever of the two is tighter (spec.md §4.C), but this
/// crate only wires the global pair for now.
pub const GLOBAL_DOWNLOAD_CHANNEL: usize = 0;
pub const GLOBAL_UPLOAD_CHANNEL: usize = 1;

/// Implemented by whoever submits a bandwidth request (a peer session) so the
/// manager can hand back a grant without the request holder needing to poll.
pub trait BandwidthConsumer {
    fn assign_bandwidth(&self, channel: usize, amount: u32);
    fn is_disconnecting(&self) -> bool;
}

/// A pending claim against one or more channels at once (e.g. a peer's
/// torrent-upload channel and the global-upload channel together); the grant
/// is bounded by whichever of those channels is tightest.
pub struct BandwidthRequest {
    pub consumer: Weak<dyn BandwidthConsumer + Send + Sync>,
    pub channels: Vec<usize>,
    pub requested: u32,
    pub priority: u8,
}

impl BandwidthRequest {
    pub fn new(
        consumer: Weak<dyn BandwidthConsumer + Send + Sync>,
        channels: Vec<usize>,
        requested: u32,
        priority: u8,
    ) -> Self {
        Self { consumer, channels, requested, priority }
    }
}

/// Ticks a fixed set of channels and distributes their quota across pending
/// requests by weighted fair share (spec.md §4.C steps 2 & 4): each request
/// gets `channel_available * my_priority / Σ(active priorities on that
/// channel)`, clamped to the tightest channel it spans.
pub struct BandwidthManager {
    channels: Vec<BandwidthChannel>,
    pending: Vec<BandwidthRequest>,
}

impl BandwidthManager {
    pub fn new(channels: Vec<BandwidthChannel>) -> Self {
        Self { channels, pending: Vec::new() }
    }

    pub fn submit(&mut self, request: BandwidthRequest) {
        self.pending.push(request);
    }

    pub fn channel(&self, idx: usize) -> &BandwidthChannel {
        &self.channels[idx]
    }

    /// Advances every channel's quota by `dt`, then grants pending requests
    /// their weighted fair share of each channel they span. Requests that
    /// can't be fully granted stay queued for the next tick.
    pub fn tick(&mut self, dt: Duration) {
        for channel in &mut self.channels {
            channel.update_quota(dt);
        }

        // Drop dead/disconnecting requests before computing shares, so they
        // don't inflate a channel's total competing priority.
        self.pending.retain(|req| req.consumer.upgrade().map(|c| !c.is_disconnecting()).unwrap_or(false));

        // Σ(priority) of every active request competing for each channel
        // (step 2).
        let mut total_priority = vec![0u64; self.channels.len()];
        for req in &self.pending {
            for &idx in &req.channels {
                total_priority[idx] += req.priority as u64;
            }
        }

        // Snapshot each channel's available quota before granting anything
        // this tick, so a request's share doesn't depend on the order
        // `pending` happens to be in.
        let available: Vec<i64> = self.channels.iter().map(|c| c.available()).collect();

        self.pending.retain_mut(|req| {
            let Some(consumer) = req.consumer.upgrade() else { return false };

            // channel_quota * my_priority / total_priority, min across every
            // channel the request spans (step 4).
            let share = req
                .channels
                .iter()
                .map(|&idx| {
                    if available[idx] == i64::MAX {
                        return i64::MAX;
                    }
                    let total = total_priority[idx].max(1);
                    (available[idx].max(0) as u64 * req.priority as u64 / total) as i64
                })
                .min()
                .unwrap_or(0);

            let grant = share.max(0).min(req.requested as i64) as u32;
            if grant == 0 {
                return true;
            }

            for &idx in &req.channels {
                self.channels[idx].consume(grant);
            }
            consumer.assign_bandwidth(req.channels[0], grant);
            req.requested -= grant;

            req.requested > 0
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct TestConsumer {
        granted: Mutex<u32>,
    }

    impl BandwidthConsumer for TestConsumer {
        fn assign_bandwidth(&self, _channel: usize, amount: u32) {
            *self.granted.lock().unwrap() += amount;
        }
        fn is_disconnecting(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_tick_grants_within_quota() {
        let mut mgr = BandwidthManager::new(vec![BandwidthChannel::new(ChannelLimit { rate: 100, burst: 100 })]);
        let consumer = Arc::new(TestConsumer { granted: Mutex::new(0) });
        mgr.submit(BandwidthRequest {
            consumer: Arc::downgrade(&(consumer.clone() as Arc<dyn BandwidthConsumer + Send + Sync>)),
            channels: vec![0],
            requested: 50,
            priority: 1,
        });

        mgr.tick(Duration::from_secs(1));
        assert_eq!(*consumer.granted.lock().unwrap(), 50);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_exceeding_quota_stays_pending_until_next_tick() {
        let mut mgr = BandwidthManager::new(vec![BandwidthChannel::new(ChannelLimit { rate: 10, burst: 10 })]);
        let consumer = Arc::new(TestConsumer { granted: Mutex::new(0) });
        mgr.submit(BandwidthRequest {
            consumer: Arc::downgrade(&(consumer.clone() as Arc<dyn BandwidthConsumer + Send + Sync>)),
            channels: vec![0],
            requested: 25,
            priority: 1,
        });

        mgr.tick(Duration::from_secs(1));
        assert!(*consumer.granted.lock().unwrap() < 25);
        assert_eq!(mgr.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_tick_splits_quota_by_priority_weight() {
        // One 10 kB/s channel, peer A priority 1, peer B priority 3: A should
        // get roughly a quarter of the quota, B the rest.
        let mut mgr = BandwidthManager::new(vec![BandwidthChannel::new(ChannelLimit { rate: 10_000, burst: 10_000 })]);
        let a = Arc::new(TestConsumer { granted: Mutex::new(0) });
        let b = Arc::new(TestConsumer { granted: Mutex::new(0) });

        mgr.submit(BandwidthRequest {
            consumer: Arc::downgrade(&(a.clone() as Arc<dyn BandwidthConsumer + Send + Sync>)),
            channels: vec![0],
            requested: 10_000,
            priority: 1,
        });
        mgr.submit(BandwidthRequest {
            consumer: Arc::downgrade(&(b.clone() as Arc<dyn BandwidthConsumer + Send + Sync>)),
            channels: vec![0],
            requested: 10_000,
            priority: 3,
        });

        mgr.tick(Duration::from_secs(1));
        assert_eq!(*a.granted.lock().unwrap(), 2_500);
        assert_eq!(*b.granted.lock().unwrap(), 7_500);
    }
}
