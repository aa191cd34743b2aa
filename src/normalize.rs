// Packet normalizer
// Shapes a parsed packet into the canonical record consumed by displays and charts

use std::collections::VecDeque;
use serde::Serialize;
use serde_json::Value;

use crate::clocktrack::ClockTracker;
use crate::constants::{
    ACCEL_SATURATION_G, ALTITUDE_OUTLIER_FLOOR, ALTITUDE_OUTLIER_FRACTION, ALTITUDE_WINDOW,
};
use crate::geodesy::gps_to_decimal;
use crate::net::messages::{
    ChannelValue, Channels, Flags, PacketChannels, PacketError, PacketKind, RadioLink, RawPacket,
    RejectedField,
};
use crate::ranges::{RangeClassifier, RangeEvent};

/// Link metadata as displayed, after packet-count normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radio: Option<RadioLink>,
    /// Local per-link sequence number, starting at 1 after connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_packet_count_av: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_packet_count_gse: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
}

/// One validated, unit-converted packet
///
/// Discarded channels keep their key but hold the invalid marker. GPS channels
/// hold decimal degrees, with `0` meaning no fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    pub id: u8,
    #[serde(skip)]
    pub kind: PacketKind,
    #[serde(flatten)]
    pub channels: Channels,
    #[serde(skip_serializing_if = "Flags::is_empty")]
    pub flags: Flags,
    pub meta: RecordMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel_z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_fill_timer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_fill_timer_total: Option<f64>,
}

impl NormalizedRecord {
    fn new(kind: PacketKind, channels: Channels, flags: Flags) -> Self {
        NormalizedRecord {
            id: kind.id(),
            kind,
            channels,
            flags,
            meta: RecordMeta::default(),
            accel_x: None,
            accel_y: None,
            accel_z: None,
            altitude_max: None,
            gas_fill_timer: None,
            gas_fill_timer_total: None,
        }
    }

    /// A usable numeric reading by display name, including the derived fields.
    pub fn value(&self, name: &str) -> Option<f64> {
        let derived = match name {
            "accelX" => Some(self.accel_x),
            "accelY" => Some(self.accel_y),
            "accelZ" => Some(self.accel_z),
            "altitudeMax" => Some(self.altitude_max),
            _ => None,
        };
        match derived {
            Some(v) => v,
            None => channel_f64(&self.channels, name),
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.channels
            .get(name)
            .filter(|v| v.is_valid())
            .and_then(ChannelValue::as_str)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// Decoded position, or None when either axis has no fix.
    pub fn gps_fix(&self) -> Option<(f64, f64)> {
        let lat = self.value("GPSLatitude").filter(|v| *v != 0.0)?;
        let lon = self.value("GPSLongitude").filter(|v| *v != 0.0)?;
        Some((lat, lon))
    }

    /// Attitude components in (w, x, y, z) order; only the attitude packet has any.
    pub fn quaternion(&self) -> [Option<f64>; 4] {
        if !self.kind.carries_orientation() {
            return [None; 4];
        }
        ["qw", "qx", "qy", "qz"].map(|name| self.value(name))
    }
}

fn channel_f64(channels: &Channels, name: &str) -> Option<f64> {
    channels
        .get(name)
        .and_then(ChannelValue::as_f64)
        .filter(|v| v.is_finite())
}

/// Pick between the precise and the wide-range accelerometer reading.
///
/// The precise ("low") sensor saturates near ±16 g, so once the wide-range
/// ("high") reading reaches the saturation threshold it is used instead. The
/// pair must both be in the packet; when one of them was discarded the other
/// is used as is.
pub fn select_accel(low: Option<&ChannelValue>, high: Option<&ChannelValue>) -> Option<f64> {
    let usable = |v: &ChannelValue| v.as_f64().filter(|v| v.is_finite());
    match (usable(low?), usable(high?)) {
        (Some(low), Some(high)) => Some(if high.abs() < ACCEL_SATURATION_G { low } else { high }),
        (low, high) => low.or(high),
    }
}

/// Result of feeding one altitude sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AltitudeUpdate {
    /// Window not yet full; the maximum is not tracked yet
    Filling,
    Accepted,
    /// Sample deviates too far from the window mean to count toward the maximum
    Rejected { mean: f64, threshold: f64 },
}

/// Rolling altitude window with an outlier-rejecting running maximum
#[derive(Debug, Clone)]
pub struct AltitudeTracker {
    window: VecDeque<f64>,
    max: Option<f64>,
}

impl AltitudeTracker {
    pub fn new() -> Self {
        AltitudeTracker {
            window: VecDeque::with_capacity(ALTITUDE_WINDOW),
            max: None,
        }
    }

    pub fn push(&mut self, sample: f64) -> AltitudeUpdate {
        if self.window.len() == ALTITUDE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        if self.window.len() < ALTITUDE_WINDOW {
            return AltitudeUpdate::Filling;
        }

        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let threshold = (mean * ALTITUDE_OUTLIER_FRACTION).max(ALTITUDE_OUTLIER_FLOOR);
        if (sample - mean).abs() > threshold {
            return AltitudeUpdate::Rejected { mean, threshold };
        }

        if self.max.map_or(true, |max| sample > max) {
            self.max = Some(sample);
        }
        AltitudeUpdate::Accepted
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// The maximum as displayed: only once defined and above ground.
    pub fn display_max(&self) -> Option<f64> {
        self.max.filter(|max| *max > 0.0)
    }
}

impl Default for AltitudeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkCounter {
    packets: u64,
    offset: Option<u64>,
}

/// Per-link packet accounting
///
/// The local counter counts processed packets of the link. The sender's absolute
/// counter is rebased so the first nonzero value seen after connect reads as 1.
#[derive(Debug, Clone, Default)]
pub struct PacketCounters {
    av: LinkCounter,
    gse: LinkCounter,
}

impl PacketCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn link_mut(&mut self, link: RadioLink) -> &mut LinkCounter {
        match link {
            RadioLink::Avionics => &mut self.av,
            RadioLink::Gse => &mut self.gse,
        }
    }

    pub fn packets(&self, link: RadioLink) -> u64 {
        match link {
            RadioLink::Avionics => self.av.packets,
            RadioLink::Gse => self.gse.packets,
        }
    }

    /// Count one packet and rebase the sender's total when present.
    /// Returns (local sequence, normalized total).
    pub fn record(&mut self, link: RadioLink, total: Option<u64>) -> (u64, Option<u64>) {
        let counter = self.link_mut(link);
        counter.packets += 1;

        let normalized = match total.filter(|t| *t != 0) {
            Some(total) => {
                let offset = *counter.offset.get_or_insert(total - 1);
                Some(total.saturating_sub(offset))
            }
            None => None,
        };
        (counter.packets, normalized)
    }
}

/// Pad fill duration, driven by sender time and the fill system's state flags
#[derive(Debug, Clone, Default)]
pub struct GasFillTimer {
    started_at: Option<f64>,
    running: f64,
    total: f64,
}

impl GasFillTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, flags: &Flags, sender_time: Option<f64>) {
        let flag = |name: &str| flags.get(name).copied().unwrap_or(false);
        let filling = flag("systemActivated") && flag("gasFillSelected") && flag("n20FillActivated");

        if filling {
            if let Some(now) = sender_time {
                let start = *self.started_at.get_or_insert(now);
                self.running = (now - start).max(0.0);
            }
        } else {
            self.started_at = None;
            self.total += self.running;
            self.running = 0.0;
        }
    }

    /// Drop a running interval whose start belongs to the previous connection.
    pub fn interrupt(&mut self) {
        self.started_at = None;
        self.total += self.running;
        self.running = 0.0;
    }

    pub fn running(&self) -> f64 {
        self.running
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

fn rejected_event(field: RejectedField) -> RangeEvent {
    let value = match field.value {
        Value::String(s) => ChannelValue::Text(s),
        other => ChannelValue::Text(other.to_string()),
    };
    RangeEvent::Discarded { channel: field.channel, value }
}

/// Everything one packet produced
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: NormalizedRecord,
    pub range_events: Vec<RangeEvent>,
    /// Human-readable notices for the log panel
    pub notices: Vec<String>,
}

/// Derived-value state carried across packets
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    altitude: AltitudeTracker,
    counters: PacketCounters,
    gas_fill: GasFillTimer,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn altitude(&self) -> &AltitudeTracker {
        &self.altitude
    }

    pub fn counters(&self) -> &PacketCounters {
        &self.counters
    }

    pub fn gas_fill(&self) -> &GasFillTimer {
        &self.gas_fill
    }

    /// Per-connection state is rebased on reconnect. The altitude maximum survives.
    pub fn on_reconnect(&mut self) {
        self.counters.reset();
        self.gas_fill.interrupt();
    }

    /// Shape one packet.
    ///
    /// The typed body is decoded first. A field of the wrong type only
    /// invalidates that channel and is reported as a discard; the rest of the
    /// packet goes on. Then, in order: sender time is forwarded to the clock,
    /// raw channels are classified, and derived values are computed from what
    /// survived classification.
    pub fn normalize(
        &mut self,
        raw: RawPacket,
        clock: &mut ClockTracker,
        classifier: &mut RangeClassifier,
        now_ms: f64,
    ) -> Result<Normalized, PacketError> {
        let packet = raw.decode()?;
        let kind = packet.kind();
        let PacketChannels { mut channels, flags, rejected } = packet.into_channels();
        let meta = raw.meta.unwrap_or_default();

        if let Some(t) = meta.timestamp_s {
            clock.on_sender_timestamp(t, now_ms);
        }

        let mut range_events: Vec<RangeEvent> = rejected.into_iter().map(rejected_event).collect();
        range_events.extend(classifier.classify(&mut channels, &raw.error_flags));
        let mut notices = Vec::new();
        let mut record = NormalizedRecord::new(kind, channels, flags);

        record.meta.timestamp_s = meta.timestamp_s;
        record.meta.rssi = meta.rssi;
        record.meta.snr = meta.snr;
        if let Some(link) = kind.link() {
            let total = match link {
                RadioLink::Avionics => meta.total_packet_count_av,
                RadioLink::Gse => meta.total_packet_count_gse,
            };
            let (packets, normalized) = self.counters.record(link, total);
            record.meta.radio = Some(link);
            record.meta.packets = Some(packets);
            match link {
                RadioLink::Avionics => record.meta.total_packet_count_av = normalized,
                RadioLink::Gse => record.meta.total_packet_count_gse = normalized,
            }
        }

        let channels = &record.channels;
        record.accel_x = select_accel(channels.get("accelLowX"), channels.get("accelHighX"));
        record.accel_y = select_accel(channels.get("accelLowY"), channels.get("accelHighY"));
        record.accel_z = select_accel(channels.get("accelLowZ"), channels.get("accelHighZ"));

        if let Some(altitude) = channel_f64(&record.channels, "altitude") {
            if let AltitudeUpdate::Rejected { .. } = self.altitude.push(altitude) {
                let shown = self
                    .altitude
                    .max()
                    .map_or_else(|| "none".to_string(), |max| max.to_string());
                notices.push(format!("Discard max altitude ({})", shown));
            }
            record.altitude_max = self.altitude.display_max();
        }

        for name in ["GPSLatitude", "GPSLongitude"] {
            if let Some(value) = record.channels.get_mut(name) {
                if let Some(compressed) = value.as_f64().filter(|v| v.is_finite()) {
                    *value = ChannelValue::Number(gps_to_decimal(compressed));
                }
            }
        }

        if kind.link() == Some(RadioLink::Gse) && !record.flags.is_empty() {
            self.gas_fill.update(&record.flags, meta.timestamp_s);
            record.gas_fill_timer = Some(self.gas_fill.running());
            record.gas_fill_timer_total = Some(self.gas_fill.total());
        }

        Ok(Normalized { record, range_events, notices })
    }
}
