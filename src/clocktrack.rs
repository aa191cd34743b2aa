// Clock synchronization between the telemetry sender and the local display
//
// Three clocks are in play:
//   - wall clock (ms, supplied by the caller so tests need no real time)
//   - sender time (s, `meta.timestampS`)
//   - local elapsed time (s since first telemetry), which keeps running
//     between packets so plots scroll even when the stream stalls
//
// `drift = local_elapsed - (sender_latest - sender_at_connect)`
//   drift > 0: local is ahead of the sender
//   drift < 0: the sender is ahead of local

use crate::constants::{DRIFT_MAX_RATE, DRIFT_STALE_AFTER_S, DRIFT_THRESHOLD_S};

/// Tracks the mapping between sender time and local render time
#[derive(Debug, Clone)]
pub struct ClockTracker {
    /// Sender time of the first timestamped packet on this connection
    sender_at_connect: Option<f64>,
    /// Largest sender time seen on this connection
    sender_latest: f64,
    /// Wall clock (ms) that corresponds to local elapsed zero
    local_load_ms: f64,
    /// Wall clock (ms) of the last sender timestamp
    last_packet_ms: Option<f64>,
    /// Wall clock (ms) up to which drift correction has been applied
    last_tick_ms: f64,
    /// Local elapsed seconds as of the last update
    local_elapsed: f64,
    drift: f64,

    threshold: f64,
    max_rate: f64,
    stale_after: f64,
}

impl ClockTracker {
    /// `now_ms` anchors local time before any telemetry arrives.
    pub fn new(now_ms: f64) -> Self {
        ClockTracker {
            sender_at_connect: None,
            sender_latest: 0.0,
            local_load_ms: now_ms,
            last_packet_ms: None,
            last_tick_ms: now_ms,
            local_elapsed: 0.0,
            drift: 0.0,
            threshold: DRIFT_THRESHOLD_S,
            max_rate: DRIFT_MAX_RATE,
            stale_after: DRIFT_STALE_AFTER_S,
        }
    }

    /// Override the correction tuning: threshold in seconds, rate in seconds
    /// of correction per second of wall time.
    pub fn with_correction(mut self, threshold: f64, max_rate: f64) -> Self {
        self.threshold = threshold.abs();
        self.max_rate = max_rate.abs();
        self
    }

    /// Forget the sender anchor. Only called when the socket closes or reconnects.
    pub fn reset(&mut self, now_ms: f64) {
        self.sender_at_connect = None;
        self.sender_latest = 0.0;
        self.local_load_ms = now_ms;
        self.last_packet_ms = None;
        self.last_tick_ms = now_ms;
        self.local_elapsed = 0.0;
        self.drift = 0.0;
    }

    pub fn is_anchored(&self) -> bool {
        self.sender_at_connect.is_some()
    }

    pub fn sender_at_connect(&self) -> Option<f64> {
        self.sender_at_connect
    }

    pub fn sender_latest(&self) -> Option<f64> {
        self.sender_at_connect.map(|_| self.sender_latest)
    }

    pub fn local_elapsed(&self) -> f64 {
        self.local_elapsed
    }

    pub fn drift(&self) -> f64 {
        self.drift
    }

    /// Sender time converted to this connection's plot axis (seconds since anchor).
    pub fn to_elapsed(&self, sender_time: f64) -> Option<f64> {
        self.sender_at_connect.map(|t0| sender_time - t0)
    }

    /// Best estimate of the current sender time, for stamping log lines.
    pub fn estimated_sender_time(&self) -> Option<f64> {
        self.sender_at_connect
            .map(|t0| self.local_elapsed + t0 - self.drift)
    }

    /// Record a sender timestamp.
    ///
    /// The first one after (re)connect anchors local elapsed time at zero.
    /// Sender time only moves forward; a late packet does not pull it back.
    pub fn on_sender_timestamp(&mut self, t: f64, now_ms: f64) {
        if !t.is_finite() {
            return;
        }
        self.last_packet_ms = Some(now_ms);

        match self.sender_at_connect {
            None => {
                self.sender_at_connect = Some(t);
                self.sender_latest = t;
                self.local_load_ms = now_ms;
                self.last_tick_ms = now_ms;
                self.local_elapsed = 0.0;
                self.drift = 0.0;
            }
            Some(t0) => {
                self.sender_latest = self.sender_latest.max(t);
                self.local_elapsed = (now_ms - self.local_load_ms) / 1000.0;
                self.drift = self.local_elapsed - (self.sender_latest - t0);
            }
        }
    }

    /// Advance local time from the wall clock. Safe to call with no new packets.
    ///
    /// While packets are fresh, drift beyond the threshold is corrected by
    /// shifting the local anchor. The shift is bounded by `max_rate` times the
    /// wall time since the previous tick, so the correction speed does not
    /// depend on the tick rate and a repeated tick at one instant changes
    /// nothing. A stalled stream is left alone so the displayed time keeps
    /// moving.
    pub fn tick(&mut self, now_ms: f64) {
        let dt = ((now_ms - self.last_tick_ms) / 1000.0).max(0.0);
        self.last_tick_ms = self.last_tick_ms.max(now_ms);
        self.local_elapsed = (now_ms - self.local_load_ms) / 1000.0;

        let t0 = match self.sender_at_connect {
            Some(t0) => t0,
            None => return,
        };
        self.drift = self.local_elapsed - (self.sender_latest - t0);

        let fresh = self
            .last_packet_ms
            .map_or(false, |last| (now_ms - last) / 1000.0 <= self.stale_after);
        if !fresh || self.drift.abs() <= self.threshold {
            return;
        }

        let max_step = self.max_rate * dt;
        let step = self.drift.clamp(-max_step, max_step);
        self.local_load_ms += step * 1000.0;
        self.local_elapsed = (now_ms - self.local_load_ms) / 1000.0;
        self.drift = self.local_elapsed - (self.sender_latest - t0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_gives_zero_drift() {
        let mut clock = ClockTracker::new(1_000.0);
        clock.on_sender_timestamp(10.0, 5_000.0);
        clock.on_sender_timestamp(10.0, 5_000.0);
        assert_eq!(clock.drift(), 0.0);
        assert_eq!(clock.local_elapsed(), 0.0);
        assert_eq!(clock.sender_at_connect(), Some(10.0));
    }

    #[test]
    fn test_anchor_is_not_moved_by_later_packets() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(10.0, 0.0);
        clock.on_sender_timestamp(12.0, 2_000.0);
        clock.on_sender_timestamp(11.0, 2_100.0);
        assert_eq!(clock.sender_at_connect(), Some(10.0));
        assert_eq!(clock.sender_latest(), Some(12.0));
        assert!((clock.drift() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_drift_sign() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(100.0, 0.0);
        // Sender advanced 2 s while only 1 s passed locally
        clock.on_sender_timestamp(102.0, 1_000.0);
        assert!((clock.drift() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_advances_without_packets() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(5.0, 0.0);
        clock.tick(3_000.0);
        assert!((clock.local_elapsed() - 3.0).abs() < 1e-9);
        // Stream stalled for 3 s: no correction, time keeps moving
        clock.tick(4_000.0);
        assert!((clock.local_elapsed() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_is_idempotent_for_same_instant() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(5.0, 0.0);
        clock.tick(500.0);
        let first = (clock.local_elapsed(), clock.drift());
        clock.tick(500.0);
        assert_eq!(first, (clock.local_elapsed(), clock.drift()));
    }

    #[test]
    fn test_repeated_tick_does_not_repeat_correction() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(0.0, 0.0);
        // Local ran 1 s ahead of the sender
        clock.on_sender_timestamp(0.0, 1_000.0);

        clock.tick(1_000.0);
        let corrected = (clock.local_elapsed(), clock.drift());
        assert!(corrected.1 > DRIFT_THRESHOLD_S);
        for _ in 0..5 {
            clock.tick(1_000.0);
        }
        assert_eq!(corrected, (clock.local_elapsed(), clock.drift()));
    }

    #[test]
    fn test_soft_correction_is_bounded() {
        let mut clock = ClockTracker::new(0.0).with_correction(0.25, 0.05);
        clock.on_sender_timestamp(0.0, 0.0);
        clock.on_sender_timestamp(0.0, 1_000.0);
        assert!((clock.drift() - 1.0).abs() < 1e-9);

        // One second of wall time allows 0.05 s of correction
        clock.tick(1_000.0);
        assert!((clock.drift() - 0.95).abs() < 1e-9, "drift {}", clock.drift());
    }

    #[test]
    fn test_correction_rate_independent_of_tick_rate() {
        let mut coarse = ClockTracker::new(0.0);
        let mut fine = ClockTracker::new(0.0);
        for clock in [&mut coarse, &mut fine] {
            clock.on_sender_timestamp(0.0, 0.0);
            clock.on_sender_timestamp(0.0, 1_000.0);
            clock.tick(1_000.0);
        }

        coarse.tick(2_000.0);

        let mut last_elapsed = fine.local_elapsed();
        for i in 1..=20 {
            fine.tick(1_000.0 + 50.0 * i as f64);
            // Displayed time keeps moving forward while being corrected
            assert!(fine.local_elapsed() > last_elapsed);
            last_elapsed = fine.local_elapsed();
        }

        assert!((coarse.drift() - 1.8).abs() < 1e-9, "drift {}", coarse.drift());
        assert!((coarse.drift() - fine.drift()).abs() < 1e-9);
        assert!((coarse.local_elapsed() - fine.local_elapsed()).abs() < 1e-9);
    }

    #[test]
    fn test_correction_pulls_toward_sender_ahead() {
        let mut clock = ClockTracker::new(0.0).with_correction(0.25, 0.05);
        clock.on_sender_timestamp(0.0, 0.0);
        // Sender advanced 2 s while 1 s passed locally
        clock.on_sender_timestamp(2.0, 1_000.0);
        clock.tick(1_000.0);
        assert!((clock.drift() + 0.95).abs() < 1e-9, "drift {}", clock.drift());
        assert!((clock.local_elapsed() - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_small_drift_is_left_alone() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(0.0, 0.0);
        clock.on_sender_timestamp(0.0, 100.0);
        clock.tick(100.0);
        assert!((clock.drift() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_anchor() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(10.0, 0.0);
        clock.reset(50_000.0);
        assert!(!clock.is_anchored());
        assert_eq!(clock.estimated_sender_time(), None);
        clock.on_sender_timestamp(99.0, 60_000.0);
        assert_eq!(clock.sender_at_connect(), Some(99.0));
        assert_eq!(clock.to_elapsed(100.5), Some(1.5));
    }

    #[test]
    fn test_estimated_sender_time() {
        let mut clock = ClockTracker::new(0.0);
        clock.on_sender_timestamp(20.0, 0.0);
        clock.on_sender_timestamp(21.0, 1_000.0);
        clock.tick(1_000.0);
        assert!((clock.estimated_sender_time().unwrap() - 21.0).abs() < 1e-9);
    }
}
