//! Per-session transfer statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Duplicates tolerated for a single block before the session gives up
pub const MAX_DUPLICATES: u32 = 20;

/// Shortest duration used for rate computation
const MIN_DURATION: Duration = Duration::from_millis(1);

/// Statistics for one transfer session
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Payload bytes moved (written for downloads, sent for uploads)
    pub bytes: u64,
    /// Bytes put on the wire again by timeout resends
    pub resent_bytes: u64,
    /// Duplicate count per block number
    pub duplicates: BTreeMap<u16, u32>,
    /// Stray datagrams dropped by TID checks
    pub discarded: u64,
    started: Instant,
    finished: Option<Instant>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            bytes: 0,
            resent_bytes: 0,
            duplicates: BTreeMap::new(),
            discarded: 0,
            started: Instant::now(),
            finished: None,
        }
    }

    /// Record a duplicate for `block` and return its new count
    pub fn add_duplicate(&mut self, block: u16) -> u32 {
        let count = self.duplicates.entry(block).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether `block` has gone past the duplicate cap
    pub fn duplicate_limit_exceeded(&self, block: u16) -> bool {
        self.duplicates.get(&block).is_some_and(|&n| n > MAX_DUPLICATES)
    }

    pub fn duplicate_total(&self) -> u32 {
        self.duplicates.values().sum()
    }

    /// Stamp the end time. Later calls keep the first stamp.
    pub fn finish(&mut self) {
        self.finished.get_or_insert_with(Instant::now);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Elapsed transfer time, never less than one millisecond
    pub fn duration(&self) -> Duration {
        let end = self.finished.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.started).max(MIN_DURATION)
    }

    pub fn bits_per_second(&self) -> f64 {
        (self.bytes as f64 * 8.0) / self.duration().as_secs_f64()
    }

    pub fn kbits_per_second(&self) -> f64 {
        self.bits_per_second() / 1024.0
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {:.3} seconds ({:.2} kbps), {} bytes resent, {} duplicates",
            self.bytes,
            self.duration().as_secs_f64(),
            self.kbits_per_second(),
            self.resent_bytes,
            self.duplicate_total()
        )?;
        if self.discarded > 0 {
            write!(f, ", {} stray datagrams discarded", self.discarded)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_per_block() {
        let mut metrics = SessionMetrics::new();
        assert_eq!(metrics.add_duplicate(3), 1);
        assert_eq!(metrics.add_duplicate(3), 2);
        assert_eq!(metrics.add_duplicate(0), 1);
        assert_eq!(metrics.duplicate_total(), 3);
        assert_eq!(metrics.duplicates.get(&3), Some(&2));
    }

    #[test]
    fn test_duplicate_cap() {
        let mut metrics = SessionMetrics::new();
        for _ in 0..MAX_DUPLICATES {
            metrics.add_duplicate(9);
        }
        assert!(!metrics.duplicate_limit_exceeded(9));
        metrics.add_duplicate(9);
        assert!(metrics.duplicate_limit_exceeded(9));
        assert!(!metrics.duplicate_limit_exceeded(10));
    }

    #[test]
    fn test_duration_is_floored() {
        let mut metrics = SessionMetrics::new();
        metrics.finish();
        assert!(metrics.duration() >= MIN_DURATION);
        assert!(metrics.bits_per_second().is_finite());
    }

    #[test]
    fn test_rates() {
        let mut metrics = SessionMetrics::new();
        metrics.bytes = 1024;
        metrics.started = Instant::now() - Duration::from_secs(2);
        metrics.finish();

        let bps = metrics.bits_per_second();
        assert!(bps <= 4096.0 && bps > 4000.0, "bps = {bps}");
        assert!((metrics.kbits_per_second() - bps / 1024.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finish_keeps_first_stamp() {
        let mut metrics = SessionMetrics::new();
        metrics.finish();
        let first = metrics.duration();
        std::thread::sleep(Duration::from_millis(5));
        metrics.finish();
        assert_eq!(metrics.duration(), first);
        assert!(metrics.is_finished());
    }
}
