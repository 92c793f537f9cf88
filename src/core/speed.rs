use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Per-download throughput and ETA estimation
///
/// Samples of cumulative byte counts are folded into an exponentially
/// weighted moving average of bytes/sec. The smoothing constant favors
/// recent behavior without letting one burst dominate the estimate.

const ALPHA: f64 = 0.3;

struct SpeedEntry {
    last_sample: Instant,
    last_bytes: u64,
    ewma_bps: f64,
}

#[derive(Default)]
pub struct SpeedTracker {
    entries: Mutex<HashMap<i64, SpeedEntry>>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new cumulative byte count into the estimate
    ///
    /// Counts are cumulative, so a resumed download seeds the tracker
    /// with its on-disk progress on the first call.
    pub fn record(&self, id: i64, cumulative_bytes: u64) {
        self.record_at(id, cumulative_bytes, Instant::now());
    }

    fn record_at(&self, id: i64, cumulative_bytes: u64, now: Instant) {
        use std::collections::hash_map::Entry;

        let mut entries = self.entries.lock().unwrap();
        match entries.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(SpeedEntry {
                    last_sample: now,
                    last_bytes: cumulative_bytes,
                    ewma_bps: 0.0,
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let elapsed = now.duration_since(entry.last_sample).as_secs_f64();
                if elapsed < 0.05 {
                    // too close together for a meaningful rate
                    return;
                }
                let delta = cumulative_bytes.saturating_sub(entry.last_bytes) as f64;
                let instant_bps = delta / elapsed;
                entry.ewma_bps = if entry.ewma_bps == 0.0 {
                    instant_bps
                } else {
                    ALPHA * instant_bps + (1.0 - ALPHA) * entry.ewma_bps
                };
                entry.last_sample = now;
                entry.last_bytes = cumulative_bytes;
            }
        }
    }

    /// Smoothed bytes/sec; zero before two samples exist
    pub fn current_bps(&self, id: i64) -> u64 {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).map(|e| e.ewma_bps as u64).unwrap_or(0)
    }

    /// Seconds remaining, when the total is known and bytes are flowing
    pub fn eta_seconds(&self, id: i64, downloaded: u64, total: Option<u64>) -> Option<u64> {
        let total = total?;
        let bps = self.current_bps(id);
        if bps == 0 {
            return None;
        }
        Some(total.saturating_sub(downloaded) / bps)
    }

    /// Sum of smoothed rates across all tracked downloads
    pub fn aggregate_bps(&self) -> u64 {
        let entries = self.entries.lock().unwrap();
        entries.values().map(|e| e.ewma_bps as u64).sum()
    }

    /// Forget a download once it settles
    pub fn forget(&self, id: i64) {
        self.entries.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_seeds_without_rate() {
        let tracker = SpeedTracker::new();
        tracker.record(1, 5000);
        assert_eq!(tracker.current_bps(1), 0);
    }

    #[test]
    fn test_rate_from_two_samples() {
        let tracker = SpeedTracker::new();
        let t0 = Instant::now();
        tracker.record_at(1, 0, t0);
        tracker.record_at(1, 1_000_000, t0 + Duration::from_secs(1));
        let bps = tracker.current_bps(1);
        assert!((900_000..=1_100_000).contains(&bps), "bps was {bps}");
    }

    #[test]
    fn test_smoothing_dampens_spikes() {
        let tracker = SpeedTracker::new();
        let t0 = Instant::now();
        tracker.record_at(1, 0, t0);
        tracker.record_at(1, 1_000_000, t0 + Duration::from_secs(1));
        // a 10x spike moves the estimate, but by alpha only
        tracker.record_at(1, 11_000_000, t0 + Duration::from_secs(2));
        let bps = tracker.current_bps(1);
        assert!(bps > 1_000_000);
        assert!(bps < 5_000_000, "spike dominated: {bps}");
    }

    #[test]
    fn test_eta() {
        let tracker = SpeedTracker::new();
        let t0 = Instant::now();
        tracker.record_at(1, 0, t0);
        tracker.record_at(1, 1_000_000, t0 + Duration::from_secs(1));
        let eta = tracker.eta_seconds(1, 1_000_000, Some(11_000_000)).unwrap();
        assert!((8..=12).contains(&eta), "eta was {eta}");
        // unknown size -> unknown eta
        assert_eq!(tracker.eta_seconds(1, 1_000_000, None), None);
        // no samples -> unknown eta
        assert_eq!(tracker.eta_seconds(9, 0, Some(100)), None);
    }

    #[test]
    fn test_forget() {
        let tracker = SpeedTracker::new();
        let t0 = Instant::now();
        tracker.record_at(1, 0, t0);
        tracker.record_at(1, 1_000, t0 + Duration::from_secs(1));
        tracker.forget(1);
        assert_eq!(tracker.current_bps(1), 0);
    }
}
