use std::time::{Duration, Instant};

/// Offset used before the first sync and whenever a sync fails
pub const FALLBACK_OFFSET_MS: i64 = -2500;
pub const SYNC_COOLDOWN: Duration = Duration::from_secs(60);

/// Local-to-exchange clock correction
#[derive(Debug, Clone)]
pub struct ClockOffset {
    offset_ms: i64,
    last_sync: Option<Instant>,
    cooldown: Duration,
}

impl Default for ClockOffset {
    fn default() -> Self {
        Self::new(SYNC_COOLDOWN)
    }
}

impl ClockOffset {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            offset_ms: FALLBACK_OFFSET_MS,
            last_sync: None,
            cooldown,
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Whether a new server-time fetch is allowed at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_sync {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
        }
    }

    /// Record a successful server-time read
    pub fn apply(&mut self, server_ms: i64, local_ms: i64, now: Instant) {
        self.offset_ms = server_ms - local_ms;
        self.last_sync = Some(now);
    }

    /// Failed sync: reset to the fallback and leave the cooldown untouched
    pub fn apply_fallback(&mut self) {
        self.offset_ms = FALLBACK_OFFSET_MS;
    }

    /// Exchange-adjusted timestamp for a local millisecond time
    pub fn timestamp(&self, local_ms: i64) -> i64 {
        local_ms + self.offset_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_offset_is_fallback() {
        let clock = ClockOffset::default();
        assert_eq!(clock.offset_ms(), -2500);
        assert!(clock.is_due(Instant::now()));
        assert_eq!(clock.timestamp(1_000_000), 997_500);
    }

    #[test]
    fn test_cooldown_blocks_resync() {
        let mut clock = ClockOffset::new(Duration::from_secs(60));
        let start = Instant::now();

        clock.apply(1_700_000_000_450, 1_700_000_000_000, start);
        assert_eq!(clock.offset_ms(), 450);

        assert!(!clock.is_due(start + Duration::from_secs(59)));
        assert!(clock.is_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_fallback_keeps_retrying() {
        let mut clock = ClockOffset::default();
        let now = Instant::now();
        clock.apply(10_000, 9_000, now);

        clock.apply_fallback();
        assert_eq!(clock.offset_ms(), FALLBACK_OFFSET_MS);
        // A failed sync doesn't count as a sync
        assert!(!clock.is_due(now + Duration::from_secs(1)));
    }
}
