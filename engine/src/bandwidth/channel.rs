use std::time::Duration;

/// Rate limit for one bandwidth channel: bytes per second and the largest
/// quota it can accumulate while idle. `rate == 0` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimit {
    pub rate: u32,
    pub burst: u32,
}

impl ChannelLimit {
    pub fn unlimited() -> Self {
        Self { rate: 0, burst: 0 }
    }
}

/// A single throttled channel (e.g. "global upload", "torrent N download").
/// Quota accrues on every tick and is spent as requests are granted.
#[derive(Debug)]
pub struct BandwidthChannel {
    pub limit: ChannelLimit,
    quota: i64,
}

impl BandwidthChannel {
    pub fn new(limit: ChannelLimit) -> Self {
        Self { quota: limit.burst as i64, limit }
    }

    /// Accrues `rate * dt` quota, capped at `burst`. A no-op for unlimited channels.
    pub fn update_quota(&mut self, dt: Duration) {
        if self.limit.rate == 0 {
            return;
        }
        let added = (self.limit.rate as f64 * dt.as_secs_f64()).round() as i64;
        self.quota = (self.quota + added).min(self.limit.burst as i64);
    }

    /// Bytes available to spend right now; `i64::MAX` for an unlimited channel.
    pub fn available(&self) -> i64 {
        if self.limit.rate == 0 {
            i64::MAX
        } else {
            self.quota.max(0)
        }
    }

    pub fn consume(&mut self, amount: u32) {
        if self.limit.rate != 0 {
            self.quota -= amount as i64;
        }
    }

    /// True once accrued quota covers more than one full burst window, the
    /// fast-path condition under which a request can be granted outright
    /// without weighing it against others competing for this channel.
    pub fn has_spare_burst(&self) -> bool {
        self.limit.rate == 0 || self.quota > self.limit.burst as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_accrues_and_caps_at_burst() {
        let mut ch = BandwidthChannel::new(ChannelLimit { rate: 100, burst: 150 });
        ch.consume(150);
        assert_eq!(ch.available(), 0);
        ch.update_quota(Duration::from_secs(1));
        assert_eq!(ch.available(), 100);
        ch.update_quota(Duration::from_secs(1));
        assert_eq!(ch.available(), 150); // capped at burst
    }

    #[test]
    fn test_unlimited_channel_always_available() {
        let mut ch = BandwidthChannel::new(ChannelLimit::unlimited());
        ch.consume(1_000_000);
        assert_eq!(ch.available(), i64::MAX);
    }
}
