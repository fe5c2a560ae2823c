use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    NeverWritten,
    Expired,
}

// applied to the whole aggregate's last apply time, not per entity
#[derive(Debug, Clone, Copy)]
pub struct FixedTtl {
    pub ttl: Duration,
}

impl Default for FixedTtl {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

impl FixedTtl {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// Both arguments are unix millis, `last_applied_at == 0` means nothing was
    /// ever applied.
    pub fn is_expired(&self, last_applied_at: u64, now: u64) -> bool {
        self.freshness(last_applied_at, now) != Freshness::Fresh
    }

    pub fn freshness(&self, last_applied_at: u64, now: u64) -> Freshness {
        if last_applied_at == 0 {
            return Freshness::NeverWritten;
        }
        // a clock stepping backwards counts as zero elapsed
        let elapsed = now.saturating_sub(last_applied_at);
        if u128::from(elapsed) > self.ttl.as_millis() {
            Freshness::Expired
        } else {
            Freshness::Fresh
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
