// Telemetry session - owns all per-connection pipeline state
//
// Two entry points mutate the session: `handle_frame` for every text frame off
// the socket and `render_tick` at the fixed display rate. Both are short and
// synchronous; the caller serializes them.

use tracing::debug;

use crate::chart::{ChartFeed, ChartSettings};
use crate::clocktrack::ClockTracker;
use crate::constants::ORIENTATION_TAU_S;
use crate::eventlog::{EventLog, LogLevel};
use crate::net::messages::{PacketError, RawPacket};
use crate::normalize::Normalizer;
use crate::orientation::OrientationSmoother;
use crate::output::{RenderFrame, TelemetrySubscriber};
use crate::ranges::{ErrorState, RangeClassifier, RangeEvent, RangeTable};

/// Tuning for a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub rules: RangeTable,
    pub chart: ChartSettings,
    pub smoothing_tau: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            rules: RangeTable::builtin(),
            chart: ChartSettings::default(),
            smoothing_tau: ORIENTATION_TAU_S,
        }
    }
}

/// Frame counters for the session's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub dropped: u64,
    pub connects: u64,
}

pub struct TelemetrySession {
    clock: ClockTracker,
    classifier: RangeClassifier,
    normalizer: Normalizer,
    charts: ChartFeed,
    orientation: OrientationSmoother,
    log: EventLog,
    subscribers: Vec<Box<dyn TelemetrySubscriber>>,
    connected: bool,
    last_tick_ms: Option<f64>,
    stats: SessionStats,
}

impl TelemetrySession {
    pub fn new(settings: SessionSettings, now_ms: f64) -> Self {
        TelemetrySession {
            clock: ClockTracker::new(now_ms),
            classifier: RangeClassifier::new(settings.rules),
            normalizer: Normalizer::new(),
            charts: ChartFeed::with_default_layout(settings.chart),
            orientation: OrientationSmoother::new(settings.smoothing_tau),
            log: EventLog::new(),
            subscribers: Vec::new(),
            connected: false,
            last_tick_ms: None,
            stats: SessionStats::default(),
        }
    }

    pub fn add_subscriber(&mut self, subscriber: Box<dyn TelemetrySubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn clock(&self) -> &ClockTracker {
        &self.clock
    }

    pub fn charts(&self) -> &ChartFeed {
        &self.charts
    }

    pub fn orientation(&self) -> &OrientationSmoother {
        &self.orientation
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn error_state(&self) -> &ErrorState {
        self.classifier.state()
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    fn notify(&mut self, level: LogLevel, message: impl Into<String>) {
        let stamp = self.clock.estimated_sender_time();
        self.log.push(level, message, stamp);
    }

    /// A new connection starts a new sender time base: the clock anchor,
    /// packet offsets and plotted history all restart. Error state and the
    /// altitude maximum carry over.
    pub fn on_connect(&mut self, peer: &str, now_ms: f64) {
        self.clock.reset(now_ms);
        self.normalizer.on_reconnect();
        self.charts.clear();
        self.connected = true;
        self.stats.connects += 1;
        self.notify(LogLevel::Link, format!("Connected to {}", peer));
        for sub in self.subscribers.iter_mut() {
            sub.on_link_state(true);
        }
    }

    pub fn on_disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.notify(LogLevel::Link, format!("Disconnected: {}", reason));
        for sub in self.subscribers.iter_mut() {
            sub.on_link_state(false);
        }
    }

    /// Run one frame through the pipeline. On error nothing has been updated.
    pub fn process_frame(&mut self, frame: &str, now_ms: f64) -> Result<(), PacketError> {
        let raw = RawPacket::parse(frame)?;
        let normalized =
            self.normalizer.normalize(raw, &mut self.clock, &mut self.classifier, now_ms)?;
        let record = normalized.record;

        for event in &normalized.range_events {
            let level = match event {
                RangeEvent::Discarded { .. } => LogLevel::Warning,
                RangeEvent::Raised { .. } => LogLevel::Error,
                RangeEvent::Resolved { .. } => LogLevel::Notice,
            };
            self.notify(level, event.to_string());
        }
        for notice in normalized.notices {
            self.notify(LogLevel::Warning, notice);
        }

        for sub in self.subscribers.iter_mut() {
            sub.on_record(&record);
        }

        if let Some(x) = record.meta.timestamp_s.and_then(|t| self.clock.to_elapsed(t)) {
            let plotted = self.charts.ingest(&record, x);
            if !plotted.is_empty() {
                for sub in self.subscribers.iter_mut() {
                    sub.on_plotted(&plotted);
                }
            }
        }

        if record.kind.carries_orientation() && self.orientation.set_target(record.quaternion()) {
            if let Some(target) = self.orientation.target().copied() {
                for sub in self.subscribers.iter_mut() {
                    sub.on_orientation_sample(&target);
                }
            }
        }

        self.stats.frames += 1;
        Ok(())
    }

    /// Packet boundary: a bad frame is logged and dropped, never propagated.
    pub fn handle_frame(&mut self, frame: &str, now_ms: f64) -> bool {
        match self.process_frame(frame, now_ms) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped frame: {}", frame);
                self.drop_frame(e);
                false
            }
        }
    }

    /// Same as `handle_frame` for bytes straight off the socket.
    pub fn handle_raw_frame(&mut self, frame: &[u8], now_ms: f64) -> bool {
        match std::str::from_utf8(frame) {
            Ok(text) => self.handle_frame(text, now_ms),
            Err(e) => {
                self.drop_frame(e.into());
                false
            }
        }
    }

    /// Count and log a frame that never reached the pipeline.
    pub fn drop_frame(&mut self, error: PacketError) {
        self.stats.dropped += 1;
        self.notify(LogLevel::Warning, format!("Dropped packet: {}", error));
    }

    /// Advance clocks and smoothing, prune charts, and redraw. Safe to call with
    /// no new packets since the last tick.
    pub fn render_tick(&mut self, now_ms: f64) {
        self.clock.tick(now_ms);

        let dt = match self.last_tick_ms {
            Some(last) => ((now_ms - last) / 1000.0).max(0.0),
            None => 0.0,
        };
        self.last_tick_ms = Some(now_ms);
        let orientation = self.orientation.advance(dt);

        let local_elapsed = self.clock.local_elapsed();
        self.charts.prune(local_elapsed);

        let frame = RenderFrame {
            local_elapsed,
            drift: self.clock.drift(),
            window: self.charts.window(local_elapsed),
            charts: &self.charts,
            orientation,
            hud: self.orientation.hud_angles_deg(),
            errors: self.classifier.state(),
            log: &self.log,
            connected: self.connected,
        };
        for sub in self.subscribers.iter_mut() {
            sub.on_render_tick(&frame);
        }
    }
}
